//! Newline-delimited JSON messages exchanged with the companion process.

use crate::event::CaptureEvent;
use serde::{Deserialize, Serialize};

/// Agent → companion.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentMessage {
    Handshake { token: String, agent_version: String },
    Event(CaptureEvent),
}

/// Companion → agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CompanionMessage {
    HandshakeAck {
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

/// Serialize one message as a single line, newline included.
pub fn encode_line<T: Serialize>(message: &T) -> Result<Vec<u8>, serde_json::Error> {
    let mut line = serde_json::to_vec(message)?;
    line.push(b'\n');
    Ok(line)
}

pub fn decode_line<'a, T: Deserialize<'a>>(line: &'a str) -> Result<T, serde_json::Error> {
    serde_json::from_str(line.trim_end())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventType, RawEvent};

    #[test]
    fn test_handshake_wire_format() {
        let line = encode_line(&AgentMessage::Handshake {
            token: "t0k".into(),
            agent_version: "0.1.0".into(),
        })
        .unwrap();
        let text = String::from_utf8(line).unwrap();

        assert!(text.ends_with('\n'));
        assert_eq!(text.matches('\n').count(), 1);
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "handshake");
        assert_eq!(value["token"], "t0k");
    }

    #[test]
    fn test_event_is_tagged_inline() {
        let event = CaptureEvent::from_raw(
            RawEvent::new(EventType::AppSwitch).with_window_title("line one\nline two"),
            7,
        );
        let text = String::from_utf8(encode_line(&AgentMessage::Event(event)).unwrap()).unwrap();

        // Embedded newlines are escaped, so one record stays one line.
        assert_eq!(text.matches('\n').count(), 1);
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "event");
        assert_eq!(value["sequence_number"], 7);
        assert_eq!(value["event_type"], "app_switch");
    }

    #[test]
    fn test_decode_ack() {
        let ack: CompanionMessage = decode_line("{\"type\":\"handshake_ack\",\"ok\":true}\n").unwrap();
        assert_eq!(
            ack,
            CompanionMessage::HandshakeAck {
                ok: true,
                reason: None
            }
        );
        assert!(decode_line::<CompanionMessage>("{\"type\":\"other\"}").is_err());
    }
}

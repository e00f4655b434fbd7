//! Activity event types.
//!
//! A [`RawEvent`] is what a source observed; a [`CaptureEvent`] is the same
//! observation after it has been ordered and stamped for delivery.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Fixed taxonomy of observable desktop actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    AppSwitch,
    WindowFocus,
    MouseClick,
    MouseDrag,
    MouseScroll,
    KeyboardAction,
    KeyboardShortcut,
    CopyPaste,
    TabSwitch,
    FileOpen,
    FileSave,
    UrlNavigation,
    ScreenCapture,
    IdleStart,
    IdleEnd,
    TypingSession,
    ScrollSession,
}

impl EventType {
    /// Events that carry keystroke-derived information.
    pub fn is_keyboard_class(&self) -> bool {
        matches!(
            self,
            EventType::KeyboardAction
                | EventType::KeyboardShortcut
                | EventType::CopyPaste
                | EventType::TypingSession
        )
    }

    /// Events that describe browser navigation.
    pub fn is_navigation_class(&self) -> bool {
        matches!(self, EventType::UrlNavigation | EventType::TabSwitch)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::AppSwitch => "app_switch",
            EventType::WindowFocus => "window_focus",
            EventType::MouseClick => "mouse_click",
            EventType::MouseDrag => "mouse_drag",
            EventType::MouseScroll => "mouse_scroll",
            EventType::KeyboardAction => "keyboard_action",
            EventType::KeyboardShortcut => "keyboard_shortcut",
            EventType::CopyPaste => "copy_paste",
            EventType::TabSwitch => "tab_switch",
            EventType::FileOpen => "file_open",
            EventType::FileSave => "file_save",
            EventType::UrlNavigation => "url_navigation",
            EventType::ScreenCapture => "screen_capture",
            EventType::IdleStart => "idle_start",
            EventType::IdleEnd => "idle_end",
            EventType::TypingSession => "typing_session",
            EventType::ScrollSession => "scroll_session",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An observation straight from an event source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawEvent {
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    /// Source-specific fields.
    pub payload: Map<String, Value>,
    /// Stable identifier of the owning process (bundle id or executable name).
    pub process_id: Option<String>,
    pub window_title: Option<String>,
    /// Set by sources that can see the focused control. Only consulted for
    /// keyboard-class events.
    #[serde(default, skip_serializing)]
    pub password_field_focused: bool,
}

impl RawEvent {
    pub fn new(event_type: EventType) -> Self {
        Self {
            event_type,
            timestamp: Utc::now(),
            payload: Map::new(),
            process_id: None,
            window_title: None,
            password_field_focused: false,
        }
    }

    pub fn with_process(mut self, process_id: impl Into<String>) -> Self {
        self.process_id = Some(process_id.into());
        self
    }

    pub fn with_window_title(mut self, title: impl Into<String>) -> Self {
        self.window_title = Some(title.into());
        self
    }

    pub fn with_field(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.payload.insert(key.to_string(), value.into());
        self
    }

    pub fn with_password_field(mut self, focused: bool) -> Self {
        self.password_field_focused = focused;
        self
    }
}

/// An event stamped for delivery to the companion process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureEvent {
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    pub process_id: Option<String>,
    pub window_title: Option<String>,
    /// Monotonic within a session, starting at 1.
    pub sequence_number: u64,
    /// Unique across sessions; the companion deduplicates on this.
    pub idempotency_key: Uuid,
    pub event_data: Map<String, Value>,
}

impl CaptureEvent {
    pub fn from_raw(raw: RawEvent, sequence_number: u64) -> Self {
        Self {
            event_type: raw.event_type,
            timestamp: raw.timestamp,
            process_id: raw.process_id,
            window_title: raw.window_title,
            sequence_number,
            idempotency_key: Uuid::new_v4(),
            event_data: raw.payload,
        }
    }
}

//! The single writer task that delivers queued events to the companion.

use super::backoff::Backoff;
use super::channel::{self, BoxedStream, Discovery, Endpoint};
use super::protocol::{encode_line, AgentMessage};
use super::TransportError;
use crate::config::TransportConfig;
use crate::event::CaptureEvent;
use crate::pipeline::CaptureGate;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Counters shared between the writer task and status reporting.
#[derive(Debug, Default)]
pub struct TransportStatus {
    connected: AtomicBool,
    events_sent: AtomicU64,
    events_discarded: AtomicU64,
    connections: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TransportSnapshot {
    pub connected: bool,
    pub events_sent: u64,
    pub events_discarded: u64,
    pub connections: u64,
}

impl TransportStatus {
    pub fn snapshot(&self) -> TransportSnapshot {
        TransportSnapshot {
            connected: self.connected.load(Ordering::Relaxed),
            events_sent: self.events_sent.load(Ordering::Relaxed),
            events_discarded: self.events_discarded.load(Ordering::Relaxed),
            connections: self.connections.load(Ordering::Relaxed),
        }
    }
}

/// Handle to a running transport.
pub struct Transport {
    status: Arc<TransportStatus>,
    reconnect: Arc<Notify>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl Transport {
    /// Spawn the writer on the current runtime. It consumes `queue` until
    /// cancelled or until every sender is gone.
    pub fn spawn(
        config: &TransportConfig,
        token: String,
        gate: CaptureGate,
        queue: mpsc::Receiver<CaptureEvent>,
    ) -> Self {
        let status = Arc::new(TransportStatus::default());
        let reconnect = Arc::new(Notify::new());
        let cancel = CancellationToken::new();

        let writer = Writer {
            config: config.clone(),
            token,
            gate,
            queue,
            status: Arc::clone(&status),
            reconnect: Arc::clone(&reconnect),
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(writer.run());

        Self {
            status,
            reconnect,
            cancel,
            task: Some(task),
        }
    }

    pub fn status(&self) -> TransportSnapshot {
        self.status.snapshot()
    }

    pub fn is_connected(&self) -> bool {
        self.status.connected.load(Ordering::Relaxed)
    }

    /// Cut any remaining backoff short and try to connect now. Used once the
    /// companion has been (re)started.
    pub fn request_reconnect(&self) {
        self.reconnect.notify_one();
    }

    /// A callback that triggers a reconnect, for wiring into the supervisor.
    pub fn reconnect_trigger(&self) -> impl Fn() + Send + Sync + 'static {
        let reconnect = Arc::clone(&self.reconnect);
        move || reconnect.notify_one()
    }

    pub async fn shutdown(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::warn!("transport task ended abnormally: {e}");
            }
        }
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct Writer {
    config: TransportConfig,
    token: String,
    gate: CaptureGate,
    queue: mpsc::Receiver<CaptureEvent>,
    status: Arc<TransportStatus>,
    reconnect: Arc<Notify>,
    cancel: CancellationToken,
}

impl Writer {
    async fn run(mut self) {
        let mut connection: Option<BoxedStream> = None;
        // An event whose write failed; it goes first on the next connection.
        let mut pending: Option<CaptureEvent> = None;

        loop {
            let event = match pending.take() {
                Some(event) => event,
                None => {
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        next = self.queue.recv() => match next {
                            Some(event) => event,
                            None => break,
                        },
                    }
                }
            };

            if !self.gate.is_open() {
                self.status.events_discarded.fetch_add(1, Ordering::Relaxed);
                continue;
            }

            if connection.is_none() {
                match self.connect_with_backoff().await {
                    Some(stream) => connection = Some(stream),
                    None => break,
                }
            }
            let Some(stream) = connection.as_mut() else {
                continue;
            };
            // The gate may have closed while we were reconnecting.
            if !self.gate.is_open() {
                self.status.events_discarded.fetch_add(1, Ordering::Relaxed);
                continue;
            }

            let sequence = event.sequence_number;
            if let Err(e) = write_event(stream, &event).await {
                tracing::warn!(sequence, "write to companion failed: {e}");
                self.status.connected.store(false, Ordering::Relaxed);
                connection = None;
                pending = Some(event);
                continue;
            }
            self.status.events_sent.fetch_add(1, Ordering::Relaxed);
        }

        self.status.connected.store(false, Ordering::Relaxed);
        tracing::debug!("transport writer stopped");
    }

    /// Connect, retrying with backoff. After the attempts run out, wait for
    /// an explicit reconnect request. `None` means cancelled.
    async fn connect_with_backoff(&self) -> Option<BoxedStream> {
        let mut backoff = Backoff::new(
            self.config.backoff_base,
            self.config.backoff_cap,
            self.config.max_attempts,
        );

        loop {
            match self.connect_once().await {
                Ok((stream, endpoint)) => {
                    self.status.connected.store(true, Ordering::Relaxed);
                    self.status.connections.fetch_add(1, Ordering::Relaxed);
                    tracing::info!(%endpoint, "connected to companion");
                    return Some(stream);
                }
                Err(e) => tracing::debug!(attempt = backoff.attempts(), "connect failed: {e}"),
            }

            match backoff.next_delay() {
                Some(delay) => {
                    tokio::select! {
                        _ = self.cancel.cancelled() => return None,
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.reconnect.notified() => backoff.reset(),
                    }
                }
                None => {
                    tracing::warn!(
                        attempts = self.config.max_attempts,
                        "companion unreachable, waiting for reconnect request"
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => return None,
                        _ = self.reconnect.notified() => backoff.reset(),
                    }
                }
            }
        }
    }

    async fn connect_once(&self) -> Result<(BoxedStream, Endpoint), TransportError> {
        let local = match channel::connect_local(&self.config.socket_path).await {
            Ok(mut stream) => {
                channel::handshake(&mut stream, &self.token).await?;
                return Ok((stream, Endpoint::Local(self.config.socket_path.clone())));
            }
            Err(e) => e,
        };

        // Security refusals on the socket are final for this attempt.
        if matches!(
            local,
            TransportError::SymlinkRefused(_) | TransportError::ForeignOwner { .. }
        ) {
            tracing::warn!("{local}");
            return Err(local);
        }
        if !self.config.discovery_path.exists() {
            return Err(local);
        }

        let discovery = Discovery::read(&self.config.discovery_path)?;
        let addr = discovery.loopback_addr()?;
        let mut stream = channel::connect_tcp(addr).await?;
        channel::handshake(&mut stream, &discovery.token).await?;
        Ok((stream, Endpoint::Tcp(addr)))
    }
}

async fn write_event(stream: &mut BoxedStream, event: &CaptureEvent) -> Result<(), TransportError> {
    let line = encode_line(&AgentMessage::Event(event.clone()))?;
    stream.write_all(&line).await?;
    stream.flush().await?;
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::event::{EventType, RawEvent};
    use std::path::Path;
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::net::{UnixListener, UnixStream};

    fn config(dir: &Path) -> TransportConfig {
        TransportConfig {
            socket_path: dir.join("agent.sock"),
            discovery_path: dir.join("ipc_port.json"),
            token: None,
            queue_capacity: 16,
            backoff_base: Duration::from_millis(10),
            backoff_cap: Duration::from_millis(50),
            max_attempts: 50,
        }
    }

    fn event(seq: u64) -> CaptureEvent {
        CaptureEvent::from_raw(RawEvent::new(EventType::AppSwitch), seq)
    }

    /// Accept one connection, check the token, acknowledge it.
    async fn accept(listener: &UnixListener, token: &str) -> BufReader<UnixStream> {
        let (stream, _) = listener.accept().await.unwrap();
        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        let hello: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(hello["type"], "handshake");
        assert_eq!(hello["token"], token);
        reader
            .get_mut()
            .write_all(b"{\"type\":\"handshake_ack\",\"ok\":true}\n")
            .await
            .unwrap();
        reader
    }

    async fn next_sequence(reader: &mut BufReader<UnixStream>) -> u64 {
        let mut line = String::new();
        tokio::time::timeout(Duration::from_secs(5), reader.read_line(&mut line))
            .await
            .unwrap()
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["type"], "event");
        value["sequence_number"].as_u64().unwrap()
    }

    #[tokio::test]
    async fn test_delivers_in_order_after_handshake() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let listener = UnixListener::bind(&config.socket_path).unwrap();
        let gate = CaptureGate::new();
        gate.open();
        let (tx, rx) = mpsc::channel(16);
        let mut transport = Transport::spawn(&config, "secret".into(), gate, rx);

        for seq in 1..=3 {
            tx.send(event(seq)).await.unwrap();
        }
        let mut companion = accept(&listener, "secret").await;
        for seq in 1..=3 {
            assert_eq!(next_sequence(&mut companion).await, seq);
        }
        assert_eq!(transport.status().events_sent, 3);
        transport.shutdown().await;
    }

    #[tokio::test]
    async fn test_closed_gate_discards_queue() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let listener = UnixListener::bind(&config.socket_path).unwrap();
        let gate = CaptureGate::new();
        gate.open();
        let (tx, rx) = mpsc::channel(16);
        let mut transport = Transport::spawn(&config, "secret".into(), gate.clone(), rx);

        tx.send(event(1)).await.unwrap();
        let mut companion = accept(&listener, "secret").await;
        assert_eq!(next_sequence(&mut companion).await, 1);

        gate.close();
        tx.send(event(2)).await.unwrap();
        gate.open();
        tx.send(event(3)).await.unwrap();

        // Event 2 was queued while the gate was closed. Whether it is seen
        // depends on when the writer dequeued it; event 3 always arrives.
        let mut last = next_sequence(&mut companion).await;
        if last == 2 {
            last = next_sequence(&mut companion).await;
        }
        assert_eq!(last, 3);
        transport.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_write_is_resent_after_reconnect() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let listener = UnixListener::bind(&config.socket_path).unwrap();
        let gate = CaptureGate::new();
        gate.open();
        let (tx, rx) = mpsc::channel(16);
        let mut transport = Transport::spawn(&config, "secret".into(), gate, rx);

        tx.send(event(1)).await.unwrap();
        let mut first = accept(&listener, "secret").await;
        assert_eq!(next_sequence(&mut first).await, 1);
        drop(first);

        // Writes into the dead connection fail; the failed event is retried
        // on the next one and nothing is skipped.
        tx.send(event(2)).await.unwrap();
        tx.send(event(3)).await.unwrap();
        let mut second = accept(&listener, "secret").await;
        let mut seen = vec![next_sequence(&mut second).await];
        while *seen.last().unwrap() < 3 {
            seen.push(next_sequence(&mut second).await);
        }
        // Event 2 hit the dead connection and must lead the new one.
        assert_eq!(seen.first(), Some(&2));
        assert_eq!(seen, vec![2, 3]);
        assert!(transport.status().connections >= 2);
        transport.shutdown().await;
    }

    #[tokio::test]
    async fn test_tcp_fallback_uses_discovery_token() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        std::fs::write(
            &config.discovery_path,
            format!(r#"{{"host":"127.0.0.1","port":{port},"token":"from-file"}}"#),
        )
        .unwrap();

        let gate = CaptureGate::new();
        gate.open();
        let (tx, rx) = mpsc::channel(16);
        let mut transport = Transport::spawn(&config, "unused".into(), gate, rx);
        tx.send(event(1)).await.unwrap();

        let (stream, _) = listener.accept().await.unwrap();
        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        let hello: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(hello["token"], "from-file");
        reader
            .get_mut()
            .write_all(b"{\"type\":\"handshake_ack\",\"ok\":true}\n")
            .await
            .unwrap();

        line.clear();
        reader.read_line(&mut line).await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["sequence_number"], 1);
        transport.shutdown().await;
    }
}

//! End-to-end tests: consent, capture, delivery to a companion, revocation.

#[cfg(unix)]
mod agent_tests {
    use crossbeam_channel::Sender;
    use kmflow_agent::collector::focus::FocusCallback;
    use kmflow_agent::collector::{
        CollectorError, FocusProvider, ForegroundWindow, InputHook, InputSignal,
    };
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use kmflow_agent::{integrity, AgentBuilder, AgentError, CaptureState, Config, EventType};
    use parking_lot::Mutex;
    use std::path::{Path, PathBuf};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::UnixListener;
    use tokio::sync::mpsc;

    const TOKEN: &str = "integration-token";

    #[derive(Default)]
    struct ScriptedFocus {
        callback: Mutex<Option<FocusCallback>>,
    }

    impl ScriptedFocus {
        fn switch_to(&self, bundle: &str, title: &str) {
            if let Some(ref cb) = *self.callback.lock() {
                cb(ForegroundWindow {
                    bundle_id: Some(bundle.to_string()),
                    executable: None,
                    window_title: Some(title.to_string()),
                    secure_input: false,
                });
            }
        }

        fn is_subscribed(&self) -> bool {
            self.callback.lock().is_some()
        }
    }

    impl FocusProvider for ScriptedFocus {
        fn subscribe(&self, on_change: FocusCallback) -> Result<(), CollectorError> {
            *self.callback.lock() = Some(on_change);
            Ok(())
        }

        fn unsubscribe(&self) {
            *self.callback.lock() = None;
        }
    }

    /// Focus provider whose teardown takes a while, like a slow OS unhook.
    #[derive(Default)]
    struct SlowFocus {
        inner: ScriptedFocus,
    }

    impl FocusProvider for SlowFocus {
        fn subscribe(&self, on_change: FocusCallback) -> Result<(), CollectorError> {
            self.inner.subscribe(on_change)
        }

        fn unsubscribe(&self) {
            std::thread::sleep(Duration::from_millis(400));
            self.inner.unsubscribe();
        }
    }

    #[derive(Default)]
    struct SilentHook {
        signals: Option<Sender<InputSignal>>,
    }

    impl InputHook for SilentHook {
        fn start(&mut self, signals: Sender<InputSignal>) -> Result<(), CollectorError> {
            self.signals = Some(signals);
            Ok(())
        }

        fn stop(&mut self) {
            self.signals = None;
        }
    }

    fn config(dir: &Path, script: &str) -> Config {
        let mut config = Config::default();
        config.engagement_id = "eng-42".into();
        config.data_path = dir.to_path_buf();
        config.dev_mode = true;
        config.idle.check_interval = Duration::from_secs(60);
        config.input_flush_interval = Duration::from_secs(60);

        config.transport.socket_path = dir.join("agent.sock");
        config.transport.discovery_path = dir.join("ipc_port.json");
        config.transport.token = Some(TOKEN.into());
        config.transport.backoff_base = Duration::from_millis(10);
        config.transport.backoff_cap = Duration::from_millis(100);

        config.supervisor.install_dir = Some(PathBuf::from("/bin"));
        config.supervisor.program = PathBuf::from("sh");
        config.supervisor.args = vec!["-c".into(), script.into()];
        config.supervisor.restart_delay = Duration::from_millis(10);
        config.integrity.manifest_path = Some(dir.join("no-manifest.json"));
        config
    }

    /// Fake companion: checks the handshake and forwards every event line.
    fn spawn_companion(socket: &Path) -> mpsc::UnboundedReceiver<serde_json::Value> {
        let listener = UnixListener::bind(socket).unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let tx = tx.clone();
                tokio::spawn(async move {
                    let mut reader = BufReader::new(stream);
                    let mut line = String::new();
                    if reader.read_line(&mut line).await.unwrap_or(0) == 0 {
                        return;
                    }
                    let hello: serde_json::Value = serde_json::from_str(&line).unwrap();
                    let ok = hello["type"] == "handshake" && hello["token"] == TOKEN;
                    let ack = format!("{{\"type\":\"handshake_ack\",\"ok\":{ok}}}\n");
                    reader.get_mut().write_all(ack.as_bytes()).await.unwrap();
                    if !ok {
                        return;
                    }
                    loop {
                        line.clear();
                        match reader.read_line(&mut line).await {
                            Ok(0) | Err(_) => return,
                            Ok(_) => {
                                let _ = tx.send(serde_json::from_str(&line).unwrap());
                            }
                        }
                    }
                });
            }
        });
        rx
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<serde_json::Value>) -> serde_json::Value {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("companion received nothing")
            .expect("companion stopped")
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_consent_capture_revoke_flow() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path(), "exec sleep 30");
        let mut delivered = spawn_companion(&config.transport.socket_path);
        let focus = Arc::new(ScriptedFocus::default());

        let agent = AgentBuilder::new(config)
            .focus_provider(focus.clone())
            .input_hook(Box::new(SilentHook::default()))
            .build()
            .unwrap();

        // Never consented: start is a silent no-op.
        assert_eq!(agent.state(), CaptureState::ConsentRequired);
        assert!(!agent.start());
        assert_eq!(agent.state(), CaptureState::ConsentRequired);
        assert!(!focus.is_subscribed());

        agent.grant_consent().unwrap();
        assert!(agent.start());
        assert_eq!(agent.state(), CaptureState::Capturing);
        assert!(agent.status().await.sources_running);
        assert!(focus.is_subscribed());

        agent.start_companion().await.unwrap();
        let companion = agent.status().await.companion.unwrap();
        assert!(companion.running);

        focus.switch_to("com.microsoft.excel", "Q3 budget - owner jane@corp.example");
        let first = next_event(&mut delivered).await;
        assert_eq!(first["type"], "event");
        assert_eq!(first["event_type"], "app_switch");
        assert_eq!(first["sequence_number"], 1);
        assert_eq!(first["process_id"], "com.microsoft.excel");
        let title = first["window_title"].as_str().unwrap();
        assert!(title.contains("[REDACTED]"));
        assert!(!title.contains("jane@corp.example"));

        let second = next_event(&mut delivered).await;
        assert_eq!(second["event_type"], "window_focus");
        assert_eq!(second["sequence_number"], 2);

        let recent = agent.recent_events(10);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].event_type, EventType::WindowFocus);
        assert_eq!(recent[1].sequence_number, 1);

        agent.revoke().await.unwrap();
        assert_eq!(agent.state(), CaptureState::ConsentRequired);
        assert!(!agent.is_consented());
        let status = agent.status().await;
        assert!(!status.sources_running);
        assert!(!status.companion.unwrap().running);
        assert!(!focus.is_subscribed());

        // Nothing further reaches the companion.
        focus.switch_to("com.apple.safari", "Inbox");
        let late = tokio::time::timeout(Duration::from_millis(300), delivered.recv()).await;
        assert!(late.is_err(), "event delivered after revocation: {late:?}");

        // Still no capture without fresh consent.
        assert!(!agent.start());
        agent.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_pause_resume_keeps_session_numbering() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path(), "exec sleep 30");
        let mut delivered = spawn_companion(&config.transport.socket_path);
        let focus = Arc::new(ScriptedFocus::default());

        let agent = AgentBuilder::new(config)
            .focus_provider(focus.clone())
            .input_hook(Box::new(SilentHook::default()))
            .build()
            .unwrap();
        agent.grant_consent().unwrap();
        assert!(agent.start());

        focus.switch_to("com.microsoft.word", "Draft");
        assert_eq!(next_event(&mut delivered).await["sequence_number"], 1);
        assert_eq!(next_event(&mut delivered).await["sequence_number"], 2);

        assert!(agent.pause());
        assert!(!agent.pause());
        assert!(!focus.is_subscribed());

        assert!(agent.resume());
        focus.switch_to("com.microsoft.excel", "Sheet1");
        let next = next_event(&mut delivered).await;
        assert_eq!(next["event_type"], "app_switch");
        assert_eq!(next["sequence_number"], 3);

        agent.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_crash_loop_trips_breaker_into_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path(), "exit 1");
        let focus = Arc::new(ScriptedFocus::default());

        let agent = AgentBuilder::new(config)
            .focus_provider(focus.clone())
            .input_hook(Box::new(SilentHook::default()))
            .build()
            .unwrap();
        agent.grant_consent().unwrap();
        assert!(agent.start());
        agent.start_companion().await.unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while !matches!(agent.state(), CaptureState::Error(_)) {
            assert!(tokio::time::Instant::now() < deadline, "breaker never tripped");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        match agent.state() {
            CaptureState::Error(message) => assert!(message.contains("not restarting")),
            other => panic!("unexpected state {other}"),
        }
        let companion = agent.status().await.companion.unwrap();
        assert!(companion.tripped);
        assert!(!focus.is_subscribed());
        agent.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_capture_state_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let focus = Arc::new(ScriptedFocus::default());

        let agent = AgentBuilder::new(config(dir.path(), "exec sleep 30"))
            .focus_provider(focus.clone())
            .input_hook(Box::new(SilentHook::default()))
            .build()
            .unwrap();
        agent.grant_consent().unwrap();
        assert!(agent.start());
        assert!(agent.pause());
        agent.shutdown().await;

        let restarted = AgentBuilder::new(config(dir.path(), "exec sleep 30"))
            .focus_provider(focus.clone())
            .input_hook(Box::new(SilentHook::default()))
            .build()
            .unwrap();
        assert_eq!(restarted.state(), CaptureState::Paused);
        assert!(restarted.resume());
        assert!(focus.is_subscribed());
        restarted.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_tampered_install_refuses_companion() {
        let dir = tempfile::tempdir().unwrap();
        let code = dir.path().join("code");
        std::fs::create_dir(&code).unwrap();
        std::fs::write(code.join("companion.py"), b"print('hello')").unwrap();

        let key = b"0123456789abcdef0123456789abcdef";
        let manifest_path = dir.path().join("integrity.json");
        integrity::generate(&code, &["companion.py"], key)
            .unwrap()
            .save(&manifest_path)
            .unwrap();
        std::fs::write(code.join("companion.py"), b"print('tampered')").unwrap();

        let mut config = config(dir.path(), "exec sleep 30");
        config.integrity.manifest_path = Some(manifest_path);
        config.integrity.code_root = Some(code);
        config.integrity.manifest_key = Some(STANDARD.encode(key));

        let focus = Arc::new(ScriptedFocus::default());
        let agent = AgentBuilder::new(config)
            .focus_provider(focus.clone())
            .input_hook(Box::new(SilentHook::default()))
            .build()
            .unwrap();
        agent.grant_consent().unwrap();
        assert!(agent.start());

        let result = agent.start_companion().await;
        assert!(matches!(result, Err(AgentError::Integrity(_))), "{result:?}");
        assert!(matches!(agent.state(), CaptureState::Error(_)));
        assert!(!focus.is_subscribed());
        assert!(agent.status().await.companion.is_none());
        agent.shutdown().await;
    }

    #[tokio::test]
    async fn test_revoke_keeps_runtime_responsive() {
        let dir = tempfile::tempdir().unwrap();
        let focus = Arc::new(SlowFocus::default());
        let agent = AgentBuilder::new(config(dir.path(), "exec sleep 30"))
            .focus_provider(focus.clone())
            .input_hook(Box::new(SilentHook::default()))
            .build()
            .unwrap();
        agent.grant_consent().unwrap();
        assert!(agent.start());

        // On a single-threaded runtime a blocking source teardown inside
        // revoke would hold back the timer until it finished.
        let began = std::time::Instant::now();
        let (revoked, ticked_at) = tokio::join!(agent.revoke(), async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            began.elapsed()
        });

        revoked.unwrap();
        assert!(ticked_at < Duration::from_millis(300), "timer delayed {ticked_at:?}");
        assert_eq!(agent.state(), CaptureState::ConsentRequired);
        assert!(!focus.inner.is_subscribed());
        agent.shutdown().await;
    }
}

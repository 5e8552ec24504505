//! Integration test: the forwarder installed as the global logger. Kept in its own binary
//! because a global logger can only be set once per process.

use log::{LevelFilter, Log, Metadata, Record};
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tether::config::DiagnosticsConfig;
use tether::transport::{channel, FrameSource};
use tether::{ConsoleLevel, DiagnosticsForwarder, FrameName, OutboundFrame};

#[derive(Clone, Default)]
struct CapturingLogger {
    lines: Arc<Mutex<Vec<String>>>,
}

impl Log for CapturingLogger {
    fn enabled(&self, _: &Metadata<'_>) -> bool {
        true
    }

    fn log(&self, record: &Record<'_>) {
        self.lines
            .lock()
            .unwrap()
            .push(format!("{} {}", record.level(), record.args()));
    }

    fn flush(&self) {}
}

#[tokio::test]
async fn log_calls_reach_host_and_original_logger() {
    let (sink, mut source) = channel::unbounded::<OutboundFrame>();
    let mut forwarder = DiagnosticsForwarder::new(Arc::new(sink), DiagnosticsConfig::default());
    let original = CapturingLogger::default();
    let lines = original.lines.clone();
    forwarder
        .install(Box::new(original), LevelFilter::Warn)
        .expect("install forwarder");
    assert!(forwarder.is_installed());

    log::info!("job {} started", 7);
    let frame = source.recv().await.unwrap().unwrap();
    assert_eq!(frame.id, None);
    assert_eq!(frame.name, FrameName::Console);
    assert_eq!(frame.data, json!({ "level": "info", "args": ["job 7 started"] }));
    assert!(lines.lock().unwrap().contains(&"INFO job 7 started".to_string()));

    forwarder.console(ConsoleLevel::Dir, &[json!({ "nested": [1, 2] })]);
    let frame = source.recv().await.unwrap().unwrap();
    assert_eq!(frame.data, json!({ "level": "dir", "args": [{ "nested": [1, 2] }] }));

    forwarder.uninstall();
    log::error!("after uninstall");
    assert!(lines.lock().unwrap().contains(&"ERROR after uninstall".to_string()));

    let nothing = tokio::time::timeout(Duration::from_millis(50), source.recv()).await;
    assert!(nothing.is_err(), "no console frame after uninstall");
}

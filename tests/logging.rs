//! Event routing through the process-wide subscriber.
//!
//! Kept in its own test binary: the subscriber and its active sink table are
//! global, so nothing else may activate a registry here.

use svcboot::config::schema::RotateConfig;
use svcboot::config::{LogFormat, LogOutput, LogSinkConfig};
use svcboot::observability::{LogRegistry, SYSTEM_SINK};

fn file_sink(path: &std::path::Path) -> LogSinkConfig {
    LogSinkConfig {
        output: LogOutput::File,
        format: LogFormat::Plain,
        path: path.to_string_lossy().into_owned(),
        rotate: RotateConfig::default(),
    }
}

#[test]
fn test_application_sink_receives_events_on_its_target() {
    let dir = tempfile::tempdir().unwrap();
    let worker_log = dir.path().join("worker.log");
    let system_log = dir.path().join("system.log");

    let registry = LogRegistry::new();
    registry.setup(SYSTEM_SINK, &file_sink(&system_log)).unwrap();
    registry.setup("worker", &file_sink(&worker_log)).unwrap();
    registry.activate();
    assert!(registry.is_active());

    tracing::info!(target: "worker", job = 7, "batch finished");
    tracing::info!("service event");

    let worker = std::fs::read_to_string(&worker_log).unwrap();
    assert!(worker.contains("batch finished"), "{worker}");
    assert!(worker.contains("job=7"), "{worker}");
    assert!(!worker.contains("service event"), "{worker}");

    let system = std::fs::read_to_string(&system_log).unwrap();
    assert!(system.contains("service event"), "{system}");
    assert!(!system.contains("batch finished"), "{system}");

    // Once dropped, the target falls back to the system sink.
    registry.drop_sink("worker");
    tracing::info!(target: "worker", "after drop");
    let system = std::fs::read_to_string(&system_log).unwrap();
    assert!(system.contains("after drop"), "{system}");
}

//! Scenario 1 (spec §8): basic lifecycle of a single long-running process.

use std::time::Duration;

use warden::engine::Engine;
use warden::record::RecordState;
use warden::settings::EngineSettings;
use warden::spec::Spec;

fn demo_spec() -> Spec {
    Spec {
        name: "demo".to_string(),
        command: "sleep 60".to_string(),
        work_dir: None,
        env: vec![],
        pid_file: None,
        log: None,
        detectors: vec![],
        instances: 1,
        auto_restart: false,
        retry_count: 3,
        retry_interval: Duration::from_millis(100),
        start_duration: Duration::from_millis(200),
        priority: 0,
    }
}

#[test]
fn register_start_status_stop() {
    let _ = tracing_subscriber::fmt().try_init();
    let engine = Engine::start(EngineSettings::default()).unwrap();
    engine.register(demo_spec()).unwrap();

    engine.start("demo").unwrap();
    // demo_spec's start_duration is 200ms; sleep past it so the record
    // has actually been promoted to Running before we assert on it.
    std::thread::sleep(Duration::from_millis(300));

    let status = engine.status("demo").unwrap();
    assert_eq!(status.state, RecordState::Running);
    assert!(status.pid > 0);

    engine.stop("demo", Duration::from_secs(2)).unwrap();
    let status = engine.status("demo").unwrap();
    assert_eq!(status.state, RecordState::Stopped);
    assert_eq!(status.pid, 0);

    engine.shutdown();
}

#[test]
fn stop_is_idempotent() {
    let _ = tracing_subscriber::fmt().try_init();
    let engine = Engine::start(EngineSettings::default()).unwrap();
    engine.register(demo_spec()).unwrap();
    engine.start("demo").unwrap();
    std::thread::sleep(Duration::from_millis(100));

    engine.stop("demo", Duration::from_secs(2)).unwrap();
    engine.stop("demo", Duration::from_secs(2)).unwrap();

    engine.shutdown();
}

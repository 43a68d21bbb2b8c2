//! Scenario 6 (spec §8): wildcard stop affects only matching names.

use std::time::Duration;

use warden::engine::Engine;
use warden::record::RecordState;
use warden::settings::EngineSettings;
use warden::spec::Spec;

fn spec(name: &str) -> Spec {
    Spec {
        name: name.to_string(),
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
        start_duration: Duration::from_millis(100),
        priority: 0,
    }
}

#[test]
fn stop_match_only_affects_matching_names() {
    let _ = tracing_subscriber::fmt().try_init();
    let engine = Engine::start(EngineSettings::default()).unwrap();
    engine.register(spec("a-1")).unwrap();
    engine.register(spec("a-2")).unwrap();
    engine.register(spec("b-1")).unwrap();

    for name in ["a-1", "a-2", "b-1"] {
        engine.start(name).unwrap();
    }
    // spec()'s start_duration is 100ms; sleep past it so every instance
    // has been promoted to Running before stop_match runs.
    std::thread::sleep(Duration::from_millis(250));

    let results = engine.stop_match("a-*", Duration::from_secs(2));
    assert_eq!(results.len(), 2);
    for (_, result) in &results {
        assert!(result.is_ok());
    }

    assert_eq!(engine.status("a-1").unwrap().state, RecordState::Stopped);
    assert_eq!(engine.status("a-2").unwrap().state, RecordState::Stopped);
    assert_eq!(engine.status("b-1").unwrap().state, RecordState::Running);

    engine.stop("b-1", Duration::from_secs(2)).unwrap();
    engine.shutdown();
}

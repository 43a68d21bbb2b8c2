//! Scenario 2 (spec §8): instance fan-out.

use std::time::Duration;

use warden::engine::Engine;
use warden::record::RecordState;
use warden::settings::EngineSettings;
use warden::spec::Spec;

fn web_spec() -> Spec {
    Spec {
        name: "web".to_string(),
        command: "sleep 60".to_string(),
        work_dir: None,
        env: vec![],
        pid_file: None,
        log: None,
        detectors: vec![],
        instances: 3,
        auto_restart: false,
        retry_count: 3,
        retry_interval: Duration::from_millis(100),
        start_duration: Duration::from_millis(200),
        priority: 0,
    }
}

#[test]
fn start_n_and_stop_all_fan_out_across_instances() {
    let _ = tracing_subscriber::fmt().try_init();
    let engine = Engine::start(EngineSettings::default()).unwrap();
    engine.register(web_spec()).unwrap();

    let started = engine.start_n("web");
    assert_eq!(started.len(), 3);
    for (_, result) in &started {
        assert!(result.is_ok());
    }
    // web_spec's start_duration is 200ms; sleep past it so every instance
    // has been promoted to Running before we assert on it.
    std::thread::sleep(Duration::from_millis(300));

    let mut names: Vec<String> = engine.status_all("web").into_iter().map(|s| s.instance_name).collect();
    names.sort();
    assert_eq!(names, vec!["web-0".to_string(), "web-1".to_string(), "web-2".to_string()]);

    let statuses = engine.status_all("web");
    assert_eq!(statuses.len(), 3);
    for status in &statuses {
        assert_eq!(status.state, RecordState::Running);
        assert!(status.pid > 0);
    }

    let stopped = engine.stop_all("web", Duration::from_secs(2));
    for (_, result) in &stopped {
        assert!(result.is_ok());
    }
    for status in engine.status_all("web") {
        assert_eq!(status.state, RecordState::Stopped);
    }

    engine.shutdown();
}

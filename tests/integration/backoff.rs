//! Scenario 3 (spec §8): auto-restart with backoff exhaustion.

use std::time::{Duration, Instant};

use warden::engine::Engine;
use warden::record::RecordState;
use warden::settings::EngineSettings;
use warden::spec::Spec;

fn flaky_spec() -> Spec {
    Spec {
        name: "flaky".to_string(),
        command: "false".to_string(),
        work_dir: None,
        env: vec![],
        pid_file: None,
        log: None,
        detectors: vec![],
        instances: 1,
        auto_restart: true,
        retry_count: 3,
        retry_interval: Duration::from_millis(100),
        start_duration: Duration::from_secs(1),
        priority: 0,
    }
}

#[test]
fn flaky_process_reaches_failed_after_three_attempts() {
    let _ = tracing_subscriber::fmt().try_init();
    let engine = Engine::start(EngineSettings::default()).unwrap();
    engine.register(flaky_spec()).unwrap();
    engine.start("flaky").unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let status = engine.status("flaky").unwrap();
        if status.state == RecordState::Failed {
            assert_eq!(status.restart_attempts, 3);
            break;
        }
        assert!(Instant::now() < deadline, "flaky never reached Failed");
        std::thread::sleep(Duration::from_millis(20));
    }

    engine.shutdown();
}

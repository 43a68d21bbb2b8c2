//! Scenario 5 (spec §8): takeover after a supervisor restart, using a
//! file-backed store shared between two independent `Engine` instances
//! standing in for "kill the supervisor, start a new one".

use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use warden::engine::Engine;
use warden::record::RecordState;
use warden::settings::EngineSettings;
use warden::spec::Spec;

fn daemon_spec() -> Spec {
    Spec {
        name: "daemon".to_string(),
        command: "sleep 300".to_string(),
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
fn second_supervisor_takes_over_the_same_pid() {
    let _ = tracing_subscriber::fmt().try_init();
    let store_dir = tempfile::tempdir().unwrap();
    let store_path = store_dir.path().join("store.json");
    let dsn = store_path.to_str().unwrap().to_string();

    let mut settings = EngineSettings::default();
    settings.store_dsn = Some(dsn.clone());
    settings.reconciler_interval = Duration::from_millis(50);

    let engine_one = Engine::start(settings.clone()).unwrap();
    engine_one.register(daemon_spec()).unwrap();
    engine_one.start("daemon").unwrap();
    // daemon_spec's start_duration is 100ms; sleep past it so the pid is
    // actually visible (Running) before we capture it.
    std::thread::sleep(Duration::from_millis(250));

    let original_pid = engine_one.status("daemon").unwrap().pid;
    assert!(original_pid > 0);

    // Give the reconciler a chance to persist the running status before
    // this "supervisor" goes away.
    std::thread::sleep(Duration::from_millis(150));
    drop(engine_one);

    let engine_two = Engine::start(settings).unwrap();
    engine_two.register(daemon_spec()).unwrap();

    let deadline = std::time::Instant::now() + Duration::from_secs(3);
    loop {
        let status = engine_two.status("daemon").unwrap();
        if status.state == RecordState::Running {
            assert_eq!(status.pid, original_pid);
            break;
        }
        assert!(std::time::Instant::now() < deadline, "takeover never observed on new supervisor");
        std::thread::sleep(Duration::from_millis(20));
    }

    let _ = signal::kill(Pid::from_raw(original_pid), Signal::SIGKILL);
    engine_two.shutdown();
}

//! Scenario 4 (spec §8): cron Forbid concurrency policy. Timings are
//! scaled down from the spec's literal "@every 5s / 15s window" so the
//! test runs quickly; the property under test — at most one active
//! instance at a time, total started bounded — is unchanged.

use std::time::Duration;

use warden::cron::{ConcurrencyPolicy, CronJob};
use warden::engine::Engine;
use warden::settings::EngineSettings;
use warden::spec::Spec;

fn job_template() -> Spec {
    Spec {
        name: "every1s".to_string(),
        command: "sleep 2".to_string(),
        work_dir: None,
        env: vec![],
        pid_file: None,
        log: None,
        detectors: vec![],
        instances: 1,
        auto_restart: false,
        retry_count: 3,
        retry_interval: Duration::from_millis(100),
        start_duration: Duration::from_millis(50),
        priority: 0,
    }
}

#[test]
fn forbid_policy_caps_active_instances() {
    let _ = tracing_subscriber::fmt().try_init();
    let mut settings = EngineSettings::default();
    settings.cron_tick_interval = Duration::from_millis(50);
    let engine = Engine::start(settings).unwrap();

    engine
        .add_cron_job(CronJob {
            name: "every1s".to_string(),
            schedule: "@every 1s".to_string(),
            concurrency_policy: ConcurrencyPolicy::Forbid,
            successful_jobs_history_limit: 5,
            failed_jobs_history_limit: 5,
            job_template: job_template(),
        })
        .unwrap();

    let mut max_active = 0;
    let mut total_fired = 0;
    for _ in 0..35 {
        std::thread::sleep(Duration::from_millis(100));
        if let Some(status) = engine.cron_jobs().into_iter().find(|s| s.name == "every1s") {
            max_active = max_active.max(status.active.len());
            total_fired = status.succeeded_count + status.failed_count + status.active.len();
        }
    }

    assert!(max_active <= 1, "Forbid policy must never run more than one active instance");
    assert!(total_fired >= 1, "at least one instance should have fired over the window");

    engine.shutdown();
}

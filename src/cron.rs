//! Cron scheduler (spec §4.7): fires job specs on a schedule with
//! `Allow`/`Forbid`/`Replace` concurrency policies.
//!
//! A single background thread holds every job's next fire time and
//! sleeps in short housekeeping ticks rather than a heavyweight poll
//! loop, waking early whenever a job's deadline has passed. Adapted from
//! `systemg::cron`'s `CronJobState`/execution-history shape, generalized
//! to this engine's `CronJob` (concurrency policy + `job_template: Spec`
//! instead of a 1:1 service reference) and backed by the [`Registry`]
//! directly instead of a bespoke state file.

use std::collections::VecDeque;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::registry::Registry;
use crate::spec::Spec;

/// A cron schedule string failed to parse as cron or a `@`-shortcut.
#[derive(Debug, Clone, Error)]
#[error("invalid cron schedule '{0}'")]
pub struct ScheduleError(pub String);

/// How a fire event should behave when a prior instance of the job is
/// still active (spec §4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConcurrencyPolicy {
    /// Spawn a new instance regardless of existing ones.
    Allow,
    /// Spawn only if no active instance for this job exists.
    Forbid,
    /// Stop active instances (bounded wait), then spawn.
    Replace,
}

/// Declarative configuration of one scheduled job (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronJob {
    /// Job identifier; also the base name fired instances derive from.
    pub name: String,
    /// Cron expression or `@every`/`@hourly`/`@daily`/`@weekly`/`@monthly` shortcut.
    pub schedule: String,
    /// Behavior when a fire overlaps a still-active prior instance.
    pub concurrency_policy: ConcurrencyPolicy,
    /// Maximum number of succeeded instances retained in history.
    pub successful_jobs_history_limit: u32,
    /// Maximum number of failed instances retained in history.
    pub failed_jobs_history_limit: u32,
    /// Spec each firing spawns, with `name` overwritten per fire.
    pub job_template: Spec,
}

/// Abstract time source (spec §4.7/§9: "Clock source is injectable").
pub trait Clock: Send + Sync {
    /// Current time.
    fn now(&self) -> DateTime<Utc>;
}

/// Production clock: monotonic-for-durations, wall-clock-for-cron, as
/// the spec requires — here simply `Utc::now()` since cron fire times
/// are inherently wall-clock.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Parsed schedule: either a real cron expression or an interval
/// shortcut. Kept separate from [`CronJob::schedule`] because parsing
/// happens once, at `add_job` time, not on every fire.
enum ParsedSchedule {
    Cron(cron::Schedule),
    Every(Duration),
}

impl ParsedSchedule {
    fn parse(expr: &str) -> Result<Self, ScheduleError> {
        let trimmed = expr.trim();
        if let Some(rest) = trimmed.strip_prefix("@every ") {
            return Ok(ParsedSchedule::Every(parse_duration(rest)?));
        }
        match trimmed {
            "@hourly" => return Ok(ParsedSchedule::Every(Duration::from_secs(3600))),
            "@daily" => return Ok(ParsedSchedule::Every(Duration::from_secs(86_400))),
            "@weekly" => return Ok(ParsedSchedule::Every(Duration::from_secs(7 * 86_400))),
            "@monthly" => return Ok(ParsedSchedule::Every(Duration::from_secs(30 * 86_400))),
            _ => {}
        }
        let normalized = normalize_cron_expression(trimmed);
        cron::Schedule::from_str(&normalized)
            .map(ParsedSchedule::Cron)
            .map_err(|err| ScheduleError(format!("{expr}: {err}")))
    }

    fn next_after(&self, after: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            ParsedSchedule::Cron(schedule) => schedule
                .after(&after)
                .next()
                .unwrap_or_else(|| after + ChronoDuration::days(365)),
            ParsedSchedule::Every(duration) => {
                after + ChronoDuration::from_std(*duration).unwrap_or_else(|_| ChronoDuration::seconds(1))
            }
        }
    }
}

/// A 5-field cron expression omits the seconds field; the `cron` crate
/// requires 6. Matches `systemg::cron::normalize_cron_expression`.
fn normalize_cron_expression(expr: &str) -> String {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    if fields.len() == 5 {
        format!("0 {}", fields.join(" "))
    } else {
        fields.join(" ")
    }
}

/// Parses `"5s"`, `"10m"`, `"2h"`, `"1d"` (optionally chained, e.g.
/// `"1h30m"`) into a [`Duration`]. No external duration-parsing crate is
/// pulled in for this one narrow shortcut grammar.
fn parse_duration(input: &str) -> Result<Duration, ScheduleError> {
    let input = input.trim();
    if input.is_empty() {
        return Err(ScheduleError("empty @every duration".to_string()));
    }
    let mut total = Duration::ZERO;
    let mut digits = String::new();
    for ch in input.chars() {
        if ch.is_ascii_digit() {
            digits.push(ch);
            continue;
        }
        if digits.is_empty() {
            return Err(ScheduleError(format!("malformed duration '{input}'")));
        }
        let value: u64 = digits.parse().map_err(|_| ScheduleError(format!("malformed duration '{input}'")))?;
        digits.clear();
        let unit = match ch {
            's' => Duration::from_secs(value),
            'm' => Duration::from_secs(value * 60),
            'h' => Duration::from_secs(value * 3600),
            'd' => Duration::from_secs(value * 86_400),
            other => return Err(ScheduleError(format!("unknown duration unit '{other}' in '{input}'"))),
        };
        total += unit;
    }
    if !digits.is_empty() {
        return Err(ScheduleError(format!("duration '{input}' missing a unit suffix")));
    }
    Ok(total)
}

/// Runtime state for one registered job: the parsed schedule plus the
/// instance-level bookkeeping the spec's `CronJob` data model calls out
/// ("Maintains `last_fire_time` and an active-instance set").
struct JobRuntime {
    job: CronJob,
    parsed: ParsedSchedule,
    next_fire: DateTime<Utc>,
    last_fire_time: Option<DateTime<Utc>>,
    active: Vec<String>,
    succeeded: VecDeque<String>,
    failed: VecDeque<String>,
}

/// Owns every registered [`CronJob`] and the background thread that
/// fires them.
pub struct CronManager {
    jobs: Arc<Mutex<Vec<JobRuntime>>>,
    registry: Arc<Registry>,
    global_env: Arc<Vec<String>>,
    clock: Arc<dyn Clock>,
    stop_flag: Arc<AtomicBool>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl CronManager {
    /// Spawns the scheduler thread. `tick_interval` bounds how promptly a
    /// fire is noticed and how promptly completed instances are reaped
    /// into history; it is a housekeeping granularity, not itself a fire
    /// schedule.
    pub fn spawn(registry: Arc<Registry>, global_env: Vec<String>, clock: Arc<dyn Clock>, tick_interval: Duration) -> Self {
        let jobs: Arc<Mutex<Vec<JobRuntime>>> = Arc::new(Mutex::new(Vec::new()));
        let stop_flag = Arc::new(AtomicBool::new(false));
        let global_env = Arc::new(global_env);

        let thread_jobs = Arc::clone(&jobs);
        let thread_registry = Arc::clone(&registry);
        let thread_env = Arc::clone(&global_env);
        let thread_clock = Arc::clone(&clock);
        let thread_stop_flag = Arc::clone(&stop_flag);
        let handle = std::thread::spawn(move || {
            while !thread_stop_flag.load(Ordering::Relaxed) {
                tick(&thread_jobs, &thread_registry, &thread_env, thread_clock.as_ref());
                std::thread::sleep(tick_interval);
            }
        });

        CronManager {
            jobs,
            registry,
            global_env,
            clock,
            stop_flag,
            handle: Some(handle),
        }
    }

    /// Registers a job, parsing and validating its schedule immediately
    /// (`ScheduleParse` at add time, per spec §4.7).
    pub fn add_job(&self, job: CronJob) -> Result<(), ScheduleError> {
        let parsed = ParsedSchedule::parse(&job.schedule)?;
        let now = self.clock.now();
        let next_fire = parsed.next_after(now);
        let mut jobs = self.jobs.lock().unwrap();
        jobs.retain(|existing| existing.job.name != job.name);
        info!(job = %job.name, schedule = %job.schedule, "cron job registered");
        jobs.push(JobRuntime {
            job,
            parsed,
            next_fire,
            last_fire_time: None,
            active: Vec::new(),
            succeeded: VecDeque::new(),
            failed: VecDeque::new(),
        });
        Ok(())
    }

    /// Removes a job. Instances it already fired keep running; they are
    /// simply no longer tracked for history trimming.
    pub fn remove_job(&self, name: &str) {
        self.jobs.lock().unwrap().retain(|job| job.job.name != name);
    }

    /// Snapshot of every job's scheduling state, for status reporting.
    pub fn jobs_snapshot(&self) -> Vec<CronJobStatus> {
        self.jobs
            .lock()
            .unwrap()
            .iter()
            .map(|jr| CronJobStatus {
                name: jr.job.name.clone(),
                next_fire: jr.next_fire,
                last_fire_time: jr.last_fire_time,
                active: jr.active.clone(),
                succeeded_count: jr.succeeded.len(),
                failed_count: jr.failed.len(),
            })
            .collect()
    }

    /// Signals the scheduler thread to stop and joins it.
    pub fn shutdown(mut self) {
        self.stop_flag.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for CronManager {
    fn drop(&mut self) {
        self.stop_flag.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Read-only snapshot of a job's scheduling state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronJobStatus {
    /// Job identifier.
    pub name: String,
    /// Next scheduled fire time.
    pub next_fire: DateTime<Utc>,
    /// Most recent fire time, if any.
    pub last_fire_time: Option<DateTime<Utc>>,
    /// Instance names currently active for this job.
    pub active: Vec<String>,
    /// Number of succeeded instances retained in history.
    pub succeeded_count: usize,
    /// Number of failed instances retained in history.
    pub failed_count: usize,
}

fn tick(jobs: &Mutex<Vec<JobRuntime>>, registry: &Registry, global_env: &[String], clock: &dyn Clock) {
    let now = clock.now();
    let mut jobs = jobs.lock().unwrap();
    for jr in jobs.iter_mut() {
        reap_completed(jr, registry);
        if now >= jr.next_fire {
            fire(jr, registry, global_env, now);
            jr.next_fire = jr.parsed.next_after(now);
        }
    }
}

fn fire(jr: &mut JobRuntime, registry: &Registry, global_env: &[String], now: DateTime<Utc>) {
    jr.last_fire_time = Some(now);
    match jr.job.concurrency_policy {
        ConcurrencyPolicy::Allow => spawn_instance(jr, registry, global_env, now),
        ConcurrencyPolicy::Forbid => {
            if jr.active.is_empty() {
                spawn_instance(jr, registry, global_env, now);
            } else {
                debug!(job = %jr.job.name, "fire skipped: instance already active (Forbid)");
            }
        }
        ConcurrencyPolicy::Replace => {
            let active = std::mem::take(&mut jr.active);
            for name in active {
                if let Some(record) = registry.get(&name) {
                    let _ = record.stop(Duration::from_secs(5));
                }
                let _ = registry.unregister(&name);
            }
            spawn_instance(jr, registry, global_env, now);
        }
    }
}

fn spawn_instance(jr: &mut JobRuntime, registry: &Registry, global_env: &[String], now: DateTime<Utc>) {
    let mut spec = jr.job.job_template.clone();
    spec.name = format!("{}-{}", jr.job.name, now.timestamp_millis());
    spec.instances = 1;
    match registry.register(spec, global_env) {
        Ok(names) => {
            for name in names {
                if let Some(record) = registry.get(&name) {
                    if let Err(err) = record.start() {
                        warn!(job = %jr.job.name, instance = %name, "cron fire failed to start: {err}");
                    }
                }
                jr.active.push(name);
            }
        }
        Err(err) => warn!(job = %jr.job.name, "cron fire failed to register instance: {err}"),
    }
}

fn reap_completed(jr: &mut JobRuntime, registry: &Registry) {
    let pending = std::mem::take(&mut jr.active);
    let mut still_active = Vec::with_capacity(pending.len());
    for name in pending {
        let Some(record) = registry.get(&name) else {
            continue;
        };
        let status = record.status();
        use crate::record::RecordState;
        match status.state {
            RecordState::Stopped | RecordState::Failed => {
                let succeeded = status.state == RecordState::Stopped && status.exit_code.unwrap_or(1) == 0;
                if succeeded {
                    jr.succeeded.push_back(name);
                    trim_history(&mut jr.succeeded, jr.job.successful_jobs_history_limit, registry);
                } else {
                    jr.failed.push_back(name);
                    trim_history(&mut jr.failed, jr.job.failed_jobs_history_limit, registry);
                }
            }
            _ => still_active.push(name),
        }
    }
    jr.active = still_active;
}

fn trim_history(history: &mut VecDeque<String>, limit: u32, registry: &Registry) {
    while history.len() > limit as usize {
        if let Some(oldest) = history.pop_front() {
            let _ = registry.unregister(&oldest);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::Spec;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration as StdDuration;

    struct FakeClock(StdMutex<DateTime<Utc>>);

    impl FakeClock {
        fn new(start: DateTime<Utc>) -> Arc<Self> {
            Arc::new(FakeClock(StdMutex::new(start)))
        }
        fn advance(&self, delta: ChronoDuration) {
            let mut guard = self.0.lock().unwrap();
            *guard += delta;
        }
    }

    impl Clock for FakeClock {
        fn now(&self) -> DateTime<Utc> {
            *self.0.lock().unwrap()
        }
    }

    fn template(name: &str, command: &str) -> Spec {
        Spec {
            name: name.to_string(),
            command: command.to_string(),
            work_dir: None,
            env: vec![],
            pid_file: None,
            log: None,
            detectors: vec![],
            instances: 1,
            auto_restart: false,
            retry_count: 3,
            retry_interval: StdDuration::from_millis(50),
            start_duration: StdDuration::from_millis(10),
            priority: 0,
        }
    }

    #[test]
    fn parses_every_shortcut() {
        assert!(matches!(ParsedSchedule::parse("@every 5s").unwrap(), ParsedSchedule::Every(d) if d == Duration::from_secs(5)));
        assert!(matches!(ParsedSchedule::parse("@hourly").unwrap(), ParsedSchedule::Every(_)));
    }

    #[test]
    fn parses_five_and_six_field_cron() {
        assert!(ParsedSchedule::parse("* * * * *").is_ok());
        assert!(ParsedSchedule::parse("0 * * * * *").is_ok());
    }

    #[test]
    fn invalid_schedule_is_rejected() {
        assert!(ParsedSchedule::parse("not a schedule").is_err());
    }

    #[test]
    fn duration_parses_compound_units() {
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(3600 + 1800));
        assert!(parse_duration("nope").is_err());
    }

    /// Cron-fired instances carry a timestamp-suffixed name
    /// (`spawn_instance`), not the job name, so `Registry::get_base` can
    /// never find them — assert against the manager's own snapshot instead.
    fn job_status(manager: &CronManager, name: &str) -> CronJobStatus {
        manager
            .jobs_snapshot()
            .into_iter()
            .find(|s| s.name == name)
            .expect("job missing from snapshot")
    }

    #[test]
    fn forbid_policy_skips_fire_while_instance_active() {
        let registry = Arc::new(Registry::new());
        let clock = FakeClock::new(Utc::now());
        let manager = CronManager::spawn(Arc::clone(&registry), vec![], clock.clone(), StdDuration::from_millis(20));
        manager
            .add_job(CronJob {
                name: "every5s".to_string(),
                schedule: "@every 5s".to_string(),
                concurrency_policy: ConcurrencyPolicy::Forbid,
                successful_jobs_history_limit: 3,
                failed_jobs_history_limit: 3,
                job_template: template("every5s", "sleep 10"),
            })
            .unwrap();

        clock.advance(ChronoDuration::seconds(6));
        std::thread::sleep(StdDuration::from_millis(100));
        let first_active = job_status(&manager, "every5s").active.len();
        assert_eq!(first_active, 1);

        clock.advance(ChronoDuration::seconds(5));
        std::thread::sleep(StdDuration::from_millis(100));
        let second_active = job_status(&manager, "every5s").active.len();
        assert_eq!(second_active, 1, "Forbid must not spawn a second active instance");

        manager.shutdown();
        for record in registry.all() {
            let _ = record.stop(StdDuration::from_secs(2));
        }
    }

    #[test]
    fn allow_policy_spawns_every_fire() {
        let registry = Arc::new(Registry::new());
        let clock = FakeClock::new(Utc::now());
        let manager = CronManager::spawn(Arc::clone(&registry), vec![], clock.clone(), StdDuration::from_millis(20));
        manager
            .add_job(CronJob {
                name: "tick".to_string(),
                schedule: "@every 1s".to_string(),
                concurrency_policy: ConcurrencyPolicy::Allow,
                successful_jobs_history_limit: 5,
                failed_jobs_history_limit: 5,
                job_template: template("tick", "true"),
            })
            .unwrap();

        clock.advance(ChronoDuration::seconds(2));
        std::thread::sleep(StdDuration::from_millis(150));
        clock.advance(ChronoDuration::seconds(1));
        std::thread::sleep(StdDuration::from_millis(150));

        let status = job_status(&manager, "tick");
        assert!(status.active.len() + status.succeeded_count + status.failed_count >= 2);
        manager.shutdown();
    }
}

//! Per-instance process record and state machine (spec §4.1).
//!
//! Each [`ProcessRecord`] owns a dedicated "wait routine" thread per spawn
//! (matching `systemg`'s thread-per-concern style and spec §5's "dedicated
//! routine per record"): it blocks on the child's exit, then re-enters the
//! record to apply the restart policy. All mutation is funneled through a
//! single internal lock so transitions on one record are totally ordered.

use std::io::{Error as IoError, ErrorKind};
use std::process::{Command, Stdio};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant, SystemTime};

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tracing::{debug, info, warn};

use crate::detector::is_alive;
use crate::env::EnvResolver;
use crate::error::EngineError;
use crate::logs::LogSink;
use crate::restart::{self, ExitClassification, RestartContext, RestartDecision};
use crate::spec::Spec;

/// Lifecycle state of one instance (spec §4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordState {
    /// No child running; ready for `Start`.
    Stopped,
    /// Child spawned, waiting out the start window.
    Starting,
    /// Child confirmed alive past the start window.
    Running,
    /// Child exited, waiting to retry per backoff policy.
    BackingOff,
    /// `Stop` requested, waiting for the child to exit.
    Stopping,
    /// Restart policy exhausted; requires an explicit `Start` to recover.
    Failed,
}

/// Read-only snapshot of a record's observable fields (spec §4.1 `Status`).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RecordStatus {
    /// Fully-qualified instance name (`base` or `base-N`).
    pub instance_name: String,
    /// Shared prefix across fanned-out instances.
    pub base_name: String,
    /// Current lifecycle state.
    pub state: RecordState,
    /// `0` when not running.
    pub pid: i32,
    /// Wall-clock time of the most recent successful spawn.
    pub started_at: Option<SystemTime>,
    /// Wall-clock time of the most recent observed exit.
    pub stopped_at: Option<SystemTime>,
    /// Exit code of the most recent exit, if one was available.
    pub exit_code: Option<i32>,
    /// Restart attempts consumed in the current failure window.
    pub restart_attempts: u32,
}

struct Inner {
    spec: Spec,
    state: RecordState,
    pid: i32,
    started_at: Option<SystemTime>,
    start_instant: Option<Instant>,
    stopped_at: Option<SystemTime>,
    exit_code: Option<i32>,
    restart_attempts: u32,
    manual_stop: bool,
    generation: u64,
}

/// One live (or most-recently-live) instance of a [`Spec`].
///
/// Uniquely keyed by `instance_name` within a [`crate::registry::Registry`].
pub struct ProcessRecord {
    /// Fully-qualified instance name.
    pub instance_name: String,
    /// Shared prefix across fanned-out instances.
    pub base_name: String,
    inner: Mutex<Inner>,
    cond: Condvar,
    global_env: Vec<String>,
}

impl ProcessRecord {
    /// Creates a new record in `Stopped` state. Does not spawn anything.
    pub fn new(instance_name: String, base_name: String, spec: Spec, global_env: Vec<String>) -> Arc<Self> {
        Arc::new(ProcessRecord {
            instance_name,
            base_name,
            inner: Mutex::new(Inner {
                spec,
                state: RecordState::Stopped,
                pid: 0,
                started_at: None,
                start_instant: None,
                stopped_at: None,
                exit_code: None,
                restart_attempts: 0,
                manual_stop: false,
                generation: 0,
            }),
            cond: Condvar::new(),
            global_env,
        })
    }

    /// Snapshot of observable fields. Never mutates state.
    ///
    /// `pid` is only surfaced while `state` is `Running` or `Stopping`
    /// (Testable Property 2: `pid != 0 <=> state in {Running, Stopping}`)
    /// — the child's pid is known earlier (during `Starting`, before the
    /// start window has confirmed it), but isn't yet externally meaningful.
    pub fn status(&self) -> RecordStatus {
        let inner = self.inner.lock().unwrap();
        let visible_pid = match inner.state {
            RecordState::Running | RecordState::Stopping => inner.pid,
            _ => 0,
        };
        RecordStatus {
            instance_name: self.instance_name.clone(),
            base_name: self.base_name.clone(),
            state: inner.state,
            pid: visible_pid,
            started_at: inner.started_at,
            stopped_at: inner.stopped_at,
            exit_code: inner.exit_code,
            restart_attempts: inner.restart_attempts,
        }
    }

    /// Replaces the spec this record spawns from (used by `ApplyConfig`
    /// when a name is re-registered with updated fields while stopped).
    pub fn replace_spec(&self, spec: Spec) {
        self.inner.lock().unwrap().spec = spec;
    }

    /// **Start**: spawn the child with resolved env/working directory,
    /// attach log sinks, persist the PID file, and arm the start-window
    /// timer and wait routine.
    ///
    /// Fails with `AlreadyRunning` unless the record is `Stopped` or
    /// `Failed`; `SpawnFailed` on OS error.
    pub fn start(self: &Arc<Self>) -> Result<(), EngineError> {
        {
            let inner = self.inner.lock().unwrap();
            if !matches!(inner.state, RecordState::Stopped | RecordState::Failed) {
                return Err(EngineError::AlreadyRunning(self.instance_name.clone()));
            }
        }
        self.spawn_locked()
    }

    fn spawn_locked(self: &Arc<Self>) -> Result<(), EngineError> {
        let (spec, generation) = {
            let mut inner = self.inner.lock().unwrap();
            inner.manual_stop = false;
            inner.generation += 1;
            (inner.spec.clone(), inner.generation)
        };

        let args = shell_words::split(&spec.command).map_err(|err| EngineError::InvalidSpec {
            name: self.instance_name.clone(),
            reason: format!("failed to parse command: {err}"),
        })?;
        let (program, rest) = args.split_first().ok_or_else(|| EngineError::InvalidSpec {
            name: self.instance_name.clone(),
            reason: "empty command".to_string(),
        })?;

        let resolver = EnvResolver {
            use_os_env: true,
            env_files: vec![],
            global_env: self.global_env.clone(),
            spec_env: spec.env.clone(),
        };
        let env = resolver.resolve()?;

        let mut command = Command::new(program);
        command.args(rest);
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
        command.env_clear();
        for entry in &env {
            if let Some((k, v)) = entry.split_once('=') {
                command.env(k, v);
            }
        }
        if let Some(dir) = &spec.work_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|source| EngineError::SpawnFailed {
            name: self.instance_name.clone(),
            source,
        })?;
        let pid = child.id() as i32;
        info!(instance = %self.instance_name, pid, "spawned");

        if let Some(pid_file) = &spec.pid_file {
            if let Err(err) = std::fs::write(pid_file, pid.to_string()) {
                warn!(instance = %self.instance_name, "failed to write pid file: {err}");
            }
        }

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let log_sink = match (&spec.log, stdout, stderr) {
            (Some(log_config), Some(out), Some(err)) => {
                Some(LogSink::spawn(&self.instance_name, log_config, out, err))
            }
            _ => None,
        };

        {
            let mut inner = self.inner.lock().unwrap();
            inner.state = RecordState::Starting;
            inner.pid = pid;
            inner.started_at = Some(SystemTime::now());
            inner.start_instant = Some(Instant::now());
            inner.exit_code = None;
        }
        self.cond.notify_all();

        let start_duration = spec.start_duration;
        let detectors = spec.detectors.clone();
        let watch_me = Arc::clone(self);
        std::thread::spawn(move || watch_me.run_start_window(generation, start_duration, detectors));

        let wait_me = Arc::clone(self);
        std::thread::spawn(move || wait_me.run_wait_routine(generation, child, log_sink));

        Ok(())
    }

    /// Promotes `Starting` to `Running` once the process has stayed up for
    /// `start_duration` and, if configured, a detector confirms liveness.
    fn run_start_window(self: Arc<Self>, generation: u64, start_duration: Duration, detectors: Vec<crate::spec::Detector>) {
        std::thread::sleep(start_duration);
        let mut inner = self.inner.lock().unwrap();
        if inner.generation != generation || inner.state != RecordState::Starting {
            return;
        }
        if !detectors.is_empty() && !is_alive(&detectors, inner.pid) {
            debug!(instance = %self.instance_name, "no detector confirmed liveness at end of start window");
            return;
        }
        inner.state = RecordState::Running;
        inner.restart_attempts = 0;
        info!(instance = %self.instance_name, "sustained start window, now running");
        drop(inner);
        self.cond.notify_all();
    }

    /// Blocks on the child's exit and applies the restart policy.
    fn run_wait_routine(self: Arc<Self>, generation: u64, mut child: std::process::Child, log_sink: Option<LogSink>) {
        let wait_result = child.wait();
        if let Some(sink) = log_sink {
            sink.join();
        }

        let mut inner = self.inner.lock().unwrap();
        if inner.generation != generation {
            // Superseded by a later spawn (shouldn't normally happen given
            // the AlreadyRunning guard, but protects against races).
            return;
        }

        let was_starting = inner.state == RecordState::Starting;
        let manual_stop = inner.manual_stop;
        let exit_code = match &wait_result {
            Ok(status) => status.code(),
            Err(_) => None,
        };
        let classification = match &wait_result {
            Ok(status) => ExitClassification::from_exit_status(*status),
            Err(_) => ExitClassification::Killed,
        };

        inner.pid = 0;
        inner.stopped_at = Some(SystemTime::now());
        inner.exit_code = exit_code;

        if inner.state == RecordState::Stopping || manual_stop {
            inner.state = RecordState::Stopped;
            info!(instance = %self.instance_name, "stopped");
            drop(inner);
            self.cond.notify_all();
            return;
        }

        let exited_during_start = was_starting;
        if exited_during_start {
            inner.restart_attempts += 1;
        }

        let decision = restart::decide(RestartContext {
            auto_restart: inner.spec.auto_restart,
            manual_stop,
            exited_during_start,
            restart_attempts: inner.restart_attempts,
            retry_count: inner.spec.retry_count,
            retry_interval: inner.spec.retry_interval,
        });

        match decision {
            RestartDecision::Stop => {
                inner.state = RecordState::Stopped;
                info!(instance = %self.instance_name, ?classification, "exited, not restarting");
                drop(inner);
                self.cond.notify_all();
            }
            RestartDecision::Fail => {
                inner.state = RecordState::Failed;
                warn!(instance = %self.instance_name, attempts = inner.restart_attempts, "restart attempts exhausted");
                drop(inner);
                self.cond.notify_all();
            }
            RestartDecision::Restart(delay) => {
                inner.state = RecordState::BackingOff;
                debug!(instance = %self.instance_name, ?delay, "backing off before restart");
                drop(inner);
                self.cond.notify_all();
                let me = Arc::clone(&self);
                std::thread::spawn(move || {
                    std::thread::sleep(delay);
                    let should_restart = {
                        let inner = me.inner.lock().unwrap();
                        inner.state == RecordState::BackingOff && !inner.manual_stop
                    };
                    if should_restart {
                        let mut inner = me.inner.lock().unwrap();
                        inner.state = RecordState::Stopped;
                        drop(inner);
                        if let Err(err) = me.spawn_locked() {
                            warn!(instance = %me.instance_name, "restart attempt failed: {err}");
                        }
                    }
                });
            }
        }
    }

    /// **Stop(wait)**: send `SIGTERM`, wait up to `wait`; on timeout, send
    /// `SIGKILL` and wait unconditionally. Idempotent. Never returns while
    /// the wait routine is still in flight.
    pub fn stop(&self, wait: Duration) -> Result<(), EngineError> {
        let pid = {
            let mut inner = self.inner.lock().unwrap();
            inner.manual_stop = true;
            if matches!(inner.state, RecordState::Stopped | RecordState::Failed) {
                return Ok(());
            }
            inner.state = RecordState::Stopping;
            inner.pid
        };
        self.cond.notify_all();

        if pid > 0 {
            let _ = signal::kill(Pid::from_raw(pid), Signal::SIGTERM);
        }

        let deadline = Instant::now() + wait;
        let mut inner = self.inner.lock().unwrap();
        loop {
            if matches!(inner.state, RecordState::Stopped | RecordState::Failed) {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let (guard, timeout_result) = self
                .cond
                .wait_timeout(inner, deadline - now)
                .unwrap();
            inner = guard;
            if timeout_result.timed_out()
                && matches!(inner.state, RecordState::Stopping)
            {
                break;
            }
        }

        if matches!(inner.state, RecordState::Stopped | RecordState::Failed) {
            return Ok(());
        }

        let pid = inner.pid;
        if pid > 0 {
            let _ = signal::kill(Pid::from_raw(pid), Signal::SIGKILL);
        }
        drop(inner);

        let mut inner = self.inner.lock().unwrap();
        while !matches!(inner.state, RecordState::Stopped | RecordState::Failed) {
            inner = self.cond.wait(inner).unwrap();
        }
        Ok(())
    }

    /// Forces the terminal `Failed` state without touching the OS process
    /// table, for reconciler-driven escalation paths that have already
    /// confirmed the process is gone.
    pub fn mark_failed(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.state = RecordState::Failed;
        inner.pid = 0;
    }

    /// **Takeover**: re-attaches this record to a pre-existing OS process
    /// a detector has already confirmed is alive (spec §4.5), without
    /// spawning a new child. Arms a wait routine against the adopted PID
    /// so the record still notices the eventual exit and applies the
    /// restart policy, exactly as if this process had been started here.
    pub fn adopt(self: &Arc<Self>, pid: i32) {
        let generation = {
            let mut inner = self.inner.lock().unwrap();
            if !matches!(inner.state, RecordState::Stopped | RecordState::Failed) {
                return;
            }
            inner.generation += 1;
            inner.manual_stop = false;
            inner.state = RecordState::Running;
            inner.pid = pid;
            inner.started_at = Some(SystemTime::now());
            inner.start_instant = Some(Instant::now());
            inner.restart_attempts = 0;
            inner.generation
        };
        self.cond.notify_all();

        let watch_me = Arc::clone(self);
        std::thread::spawn(move || watch_me.run_adopted_wait(generation, pid));
    }

    /// Polls an adopted PID for liveness since we hold no `Child` handle
    /// (and thus no `wait(2)` channel) to block on for a process we did
    /// not spawn ourselves.
    fn run_adopted_wait(self: Arc<Self>, generation: u64, pid: i32) {
        loop {
            {
                let inner = self.inner.lock().unwrap();
                if inner.generation != generation {
                    return;
                }
                if inner.state != RecordState::Running && inner.state != RecordState::Stopping {
                    return;
                }
            }
            if is_alive(&[], pid) {
                std::thread::sleep(Duration::from_millis(200));
                continue;
            }

            let mut inner = self.inner.lock().unwrap();
            if inner.generation != generation {
                return;
            }
            let manual_stop = inner.manual_stop;
            inner.pid = 0;
            inner.stopped_at = Some(SystemTime::now());
            inner.exit_code = None;

            if inner.state == RecordState::Stopping || manual_stop {
                inner.state = RecordState::Stopped;
                info!(instance = %self.instance_name, "adopted process stopped");
                drop(inner);
                self.cond.notify_all();
                return;
            }

            let decision = restart::decide(RestartContext {
                auto_restart: inner.spec.auto_restart,
                manual_stop,
                exited_during_start: false,
                restart_attempts: inner.restart_attempts,
                retry_count: inner.spec.retry_count,
                retry_interval: inner.spec.retry_interval,
            });
            match decision {
                RestartDecision::Stop => {
                    inner.state = RecordState::Stopped;
                    drop(inner);
                    self.cond.notify_all();
                }
                RestartDecision::Fail => {
                    inner.state = RecordState::Failed;
                    drop(inner);
                    self.cond.notify_all();
                }
                RestartDecision::Restart(_) => {
                    inner.state = RecordState::Stopped;
                    drop(inner);
                    self.cond.notify_all();
                    if let Err(err) = self.spawn_locked() {
                        warn!(instance = %self.instance_name, "failed to restart after adopted process exited: {err}");
                    }
                }
            }
            return;
        }
    }

    /// True once the record's state is one of the two terminal-for-now
    /// variants the registry treats as reusable via `Start`.
    pub fn is_idle(&self) -> bool {
        matches!(
            self.inner.lock().unwrap().state,
            RecordState::Stopped | RecordState::Failed
        )
    }

    /// Clones the spec this record was constructed or last reconfigured
    /// with.
    pub fn spec(&self) -> Spec {
        self.inner.lock().unwrap().spec.clone()
    }
}

impl std::fmt::Debug for ProcessRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessRecord")
            .field("instance_name", &self.instance_name)
            .finish()
    }
}

/// Converts a POSIX `ENOENT`-shaped spawn failure into a clearer message;
/// used by callers constructing specs with unresolvable programs.
pub fn is_not_found(err: &IoError) -> bool {
    err.kind() == ErrorKind::NotFound
}

//! Declarative intent for managed programs: [`Spec`] and [`GroupSpec`].

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// A single liveness probe. Closed set by design (spec §9): adding a new
/// detector kind is an engine-level change, not something a user can plug
/// in at runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Detector {
    /// Confirm identity by reading a PID file and comparing its contents
    /// against the record's remembered PID.
    PidFile(PathBuf),
    /// Confirm identity by matching a substring against the process's
    /// command line.
    Command(String),
}

/// Where a managed program's stdout/stderr should be written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogTarget {
    /// Write `<dir>/<instance_name>.stdout.log` and `.stderr.log`.
    Directory(PathBuf),
    /// Write to two explicit files.
    Explicit {
        /// Path for captured stdout.
        stdout: PathBuf,
        /// Path for captured stderr.
        stderr: PathBuf,
    },
}

/// Size/age-bounded rotation for a single child's log file. This is a
/// convenience ceiling on one file, not the general log-rotation subsystem
/// (compression scheduling, filesystem-wide pruning), which stays out of
/// scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRotation {
    /// Roll over once the file exceeds this size. `0` disables rotation.
    #[serde(default)]
    pub max_size_mb: u64,
    /// Number of rolled-over backups to retain.
    #[serde(default)]
    pub max_backups: u32,
    /// Maximum age in days before a backup is pruned. `0` disables.
    #[serde(default)]
    pub max_age_days: u32,
    /// Whether rolled-over backups are gzip-compressed.
    #[serde(default)]
    pub compress: bool,
}

impl Default for LogRotation {
    fn default() -> Self {
        LogRotation {
            max_size_mb: 0,
            max_backups: 0,
            max_age_days: 0,
            compress: false,
        }
    }
}

/// Log wiring for a spec: where output goes, plus rotation knobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogConfig {
    /// Destination for stdout/stderr.
    pub target: LogTarget,
    /// Rotation policy applied to each resulting file.
    #[serde(default)]
    pub rotation: LogRotation,
}

/// Declarative configuration for one managed program.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Spec {
    /// Unique, path-safe identifier: `[A-Za-z0-9._-]`, no `..`, no separators.
    pub name: String,
    /// Full command line, parsed with shell-like quoting at spawn time.
    pub command: String,
    /// Working directory. Empty means inherit the supervisor's.
    #[serde(default)]
    pub work_dir: Option<PathBuf>,
    /// `KEY=VALUE` entries layered on top of the manager-wide environment.
    #[serde(default)]
    pub env: Vec<String>,
    /// Where to persist the PID after spawn.
    #[serde(default)]
    pub pid_file: Option<PathBuf>,
    /// Log wiring, if any.
    #[serde(default)]
    pub log: Option<LogConfig>,
    /// Ordered liveness probes, evaluated first-positive-wins.
    #[serde(default)]
    pub detectors: Vec<Detector>,
    /// Number of fanned-out instances, `name-0 .. name-{n-1}`.
    #[serde(default = "default_instances")]
    pub instances: u32,
    /// Whether the engine restarts this program after it exits.
    #[serde(default)]
    pub auto_restart: bool,
    /// Maximum restart attempts within one failure window.
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
    /// Delay between a failed start and the next attempt.
    #[serde(default = "default_retry_interval", with = "duration_millis")]
    pub retry_interval: Duration,
    /// Minimum continuous uptime to count as a successful start.
    #[serde(default = "default_start_duration", with = "duration_millis")]
    pub start_duration: Duration,
    /// Ordering hint for bulk operations; lower runs first.
    #[serde(default)]
    pub priority: i32,
}

fn default_instances() -> u32 {
    1
}
fn default_retry_count() -> u32 {
    3
}
fn default_retry_interval() -> Duration {
    Duration::from_millis(500)
}
fn default_start_duration() -> Duration {
    Duration::from_secs(1)
}

pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(d)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Reason a [`Spec::validate`] call rejected a spec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpecValidationError(pub String);

impl std::fmt::Display for SpecValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Spec {
    /// Validate the name/command shape required before a spec may be
    /// registered. Does not touch the filesystem.
    pub fn validate(&self) -> Result<(), SpecValidationError> {
        if self.name.is_empty() {
            return Err(SpecValidationError("name must not be empty".into()));
        }
        if !self
            .name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-')
        {
            return Err(SpecValidationError(format!(
                "name '{}' contains characters outside [A-Za-z0-9._-]",
                self.name
            )));
        }
        if self.name.contains("..") {
            return Err(SpecValidationError(format!(
                "name '{}' must not contain '..'",
                self.name
            )));
        }
        if self.name.contains('/') || self.name.contains(std::path::MAIN_SEPARATOR) {
            return Err(SpecValidationError(format!(
                "name '{}' must not contain path separators",
                self.name
            )));
        }
        if self.command.trim().is_empty() {
            return Err(SpecValidationError(format!(
                "spec '{}' has an empty command",
                self.name
            )));
        }
        if self.instances == 0 {
            return Err(SpecValidationError(format!(
                "spec '{}' declares instances=0",
                self.name
            )));
        }
        Ok(())
    }

    /// Instance names this spec fans out to: `name-0 .. name-{instances-1}`
    /// for `instances > 1`, or just `name` for `instances == 1`.
    pub fn instance_names(&self) -> Vec<String> {
        if self.instances <= 1 {
            return vec![self.name.clone()];
        }
        (0..self.instances)
            .map(|i| format!("{}-{}", self.name, i))
            .collect()
    }
}

/// A named, ordered composition of specs. Pure data: a group has no
/// independent runtime state beyond its members' own records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupSpec {
    /// Group identifier.
    pub name: String,
    /// Member specs, started in ascending `priority` order.
    pub members: Vec<Spec>,
}

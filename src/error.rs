//! Crate-wide error type for the supervision engine.
use thiserror::Error;

/// Errors surfaced by the engine's public operations.
///
/// Internal I/O errors inside the reconciler and metrics collector are
/// logged and swallowed at their source rather than reaching this type;
/// see the subsystem modules for that propagation rule.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Spec failed validation before a record was ever created.
    #[error("invalid spec '{name}': {reason}")]
    InvalidSpec {
        /// Name of the offending spec.
        name: String,
        /// Human-readable validation failure.
        reason: String,
    },

    /// A record with this name already exists.
    #[error("'{0}' is already registered")]
    Duplicate(String),

    /// Operation referenced an unknown name.
    #[error("'{0}' is not registered")]
    NotFound(String),

    /// Start called on a record that is already running or starting.
    #[error("'{0}' is already running")]
    AlreadyRunning(String),

    /// Operation requires a running record but found none.
    #[error("'{0}' is not running")]
    NotRunning(String),

    /// The OS refused to spawn the child process.
    #[error("failed to spawn '{name}': {source}")]
    SpawnFailed {
        /// Name of the record that failed to spawn.
        name: String,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// Every configured detector reported the process as not-live when a
    /// positive liveness result was required (e.g. during takeover).
    #[error("no detector confirmed liveness for '{0}'")]
    DetectorFailed(String),

    /// An env file could not be parsed.
    #[error("env file parse error: {0}")]
    EnvFileParse(String),

    /// A cron schedule string did not parse as cron or a recognized shortcut.
    #[error("invalid cron schedule '{0}'")]
    ScheduleParse(String),

    /// A settings document failed to parse or contained conflicting values.
    #[error("config parse error: {0}")]
    ConfigParse(String),

    /// The durable store is unreachable or returned an error. Reported to
    /// the caller but never fatal to in-memory operation.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// A wait budget elapsed without the expected transition completing.
    /// Informational: the engine has already taken the escalation path.
    #[error("timed out waiting for '{name}'")]
    Timeout {
        /// Name of the record the caller was waiting on.
        name: String,
    },

    /// Wrapped I/O error from a path not covered by a more specific variant.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Wrapped YAML error from settings/spec loading.
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    /// Wrapped JSON error from store or state file (de)serialization.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl<T> From<std::sync::PoisonError<T>> for EngineError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        EngineError::ConfigParse(format!("poisoned lock: {err}"))
    }
}

impl From<crate::store::StoreError> for EngineError {
    fn from(err: crate::store::StoreError) -> Self {
        EngineError::StoreUnavailable(err.to_string())
    }
}

impl From<crate::cron::ScheduleError> for EngineError {
    fn from(err: crate::cron::ScheduleError) -> Self {
        EngineError::ScheduleParse(err.to_string())
    }
}

impl From<crate::metrics::MetricsError> for EngineError {
    fn from(err: crate::metrics::MetricsError) -> Self {
        EngineError::StoreUnavailable(err.to_string())
    }
}

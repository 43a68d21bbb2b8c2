//! Ambient engine configuration (spec §B, §9): the knobs that shape the
//! [`crate::engine::Engine`] itself rather than any one supervised
//! process. Distinct from [`crate::spec::Spec`], which describes a
//! single process to supervise.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Default tick interval for the reconciler.
pub const DEFAULT_RECONCILER_INTERVAL: Duration = Duration::from_secs(5);
/// Default tick interval for the cron scheduler.
pub const DEFAULT_CRON_TICK_INTERVAL: Duration = Duration::from_secs(1);
/// Default sampling interval for the metrics collector.
pub const DEFAULT_METRICS_INTERVAL: Duration = Duration::from_secs(2);
/// Default number of samples retained per instance when neither
/// `max_history` nor `history_size` is given.
pub const DEFAULT_HISTORY: usize = 120;

/// Top-level engine configuration, typically loaded from a YAML document
/// alongside the process specs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Connection string for the durable store; see
    /// [`crate::store::open_from_dsn`] for the accepted schemes. `None`
    /// disables durability (spec §4.6).
    pub store_dsn: Option<String>,

    /// Environment variables applied to every supervised process ahead
    /// of each spec's own `env`.
    pub global_env: Vec<String>,

    #[serde(with = "crate::spec::duration_millis")]
    pub reconciler_interval: Duration,

    #[serde(with = "crate::spec::duration_millis")]
    pub cron_tick_interval: Duration,

    #[serde(with = "crate::spec::duration_millis")]
    pub metrics_interval: Duration,

    /// Preferred spelling for the metrics ring-buffer depth.
    pub max_history: Option<usize>,

    /// Deprecated alias for `max_history`, accepted for compatibility.
    pub history_size: Option<usize>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        EngineSettings {
            store_dsn: None,
            global_env: Vec::new(),
            reconciler_interval: DEFAULT_RECONCILER_INTERVAL,
            cron_tick_interval: DEFAULT_CRON_TICK_INTERVAL,
            metrics_interval: DEFAULT_METRICS_INTERVAL,
            max_history: None,
            history_size: None,
        }
    }
}

impl EngineSettings {
    /// Parses settings from a YAML document.
    pub fn from_yaml(input: &str) -> Result<Self, EngineError> {
        let settings: EngineSettings = serde_yaml::from_str(input)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Rejects a document that sets both `max_history` and `history_size`
    /// to different values (Open Question: the two names are accepted as
    /// aliases, but disagreement between them is a configuration error
    /// rather than a silent pick).
    pub fn validate(&self) -> Result<(), EngineError> {
        if let (Some(a), Some(b)) = (self.max_history, self.history_size) {
            if a != b {
                return Err(EngineError::ConfigParse(format!(
                    "max_history ({a}) and history_size ({b}) disagree; set only one"
                )));
            }
        }
        Ok(())
    }

    /// Resolves the effective history depth, falling back to
    /// [`DEFAULT_HISTORY`] when neither alias is set.
    pub fn max_history(&self) -> usize {
        self.max_history.or(self.history_size).unwrap_or(DEFAULT_HISTORY)
    }
}

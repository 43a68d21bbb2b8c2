//! Composition root (spec §6): wires the [`Registry`], durable
//! [`Store`], [`Reconciler`], [`CronManager`], and [`MetricsCollector`]
//! into one handle and exposes the engine's public operations.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::cron::{CronJob, CronJobStatus, CronManager, SystemClock};
use crate::error::EngineError;
use crate::group;
use crate::metrics::{GroupAggregate, MetricsCollector, MetricsStore, ProcessMetrics};
use crate::reconciler::Reconciler;
use crate::record::RecordStatus;
use crate::registry::Registry;
use crate::settings::EngineSettings;
use crate::spec::{GroupSpec, Spec};
use crate::store::{open_from_dsn, Store};

/// The running supervision engine. Dropping it tears down every
/// background thread (reconciler, cron, metrics) via their own `Drop`
/// impls before the registry's records are dropped.
pub struct Engine {
    registry: Arc<Registry>,
    store: Option<Arc<dyn Store>>,
    global_env: Vec<String>,
    metrics_store: Arc<MetricsStore>,
    reconciler: Option<Reconciler>,
    cron: Option<CronManager>,
    metrics: Option<MetricsCollector>,
}

impl Engine {
    /// Builds the engine from [`EngineSettings`], opening the durable
    /// store (if configured) and spawning the reconciler, cron
    /// scheduler, and metrics collector threads.
    pub fn start(settings: EngineSettings) -> Result<Self, EngineError> {
        settings.validate()?;

        let registry = Arc::new(Registry::new());
        let store: Option<Arc<dyn Store>> = match open_from_dsn(settings.store_dsn.as_deref()) {
            Ok(store) => Some(Arc::from(store)),
            Err(err) => return Err(err.into()),
        };

        let metrics_store = MetricsStore::new(settings.max_history());
        let reconciler = Reconciler::spawn(Arc::clone(&registry), store.clone(), settings.reconciler_interval);
        let cron = CronManager::spawn(
            Arc::clone(&registry),
            settings.global_env.clone(),
            Arc::new(SystemClock),
            settings.cron_tick_interval,
        );
        let metrics = MetricsCollector::spawn(Arc::clone(&registry), Arc::clone(&metrics_store), settings.metrics_interval);

        info!("engine started");
        Ok(Engine {
            registry,
            store,
            global_env: settings.global_env,
            metrics_store,
            reconciler: Some(reconciler),
            cron: Some(cron),
            metrics: Some(metrics),
        })
    }

    /// **Register**: validates and inserts `spec`'s fanned-out instances.
    pub fn register(&self, spec: Spec) -> Result<Vec<String>, EngineError> {
        self.registry.register(spec, &self.global_env)
    }

    /// **Unregister** a single instance by exact name.
    pub fn unregister(&self, name: &str) -> Result<(), EngineError> {
        self.registry.unregister(name)
    }

    /// **Start** a single instance by exact name.
    pub fn start(&self, name: &str) -> Result<(), EngineError> {
        let record = self.registry.get(name).ok_or_else(|| EngineError::NotFound(name.to_string()))?;
        record.start()
    }

    /// **Stop** a single instance by exact name, waiting up to `wait`
    /// before escalating to `SIGKILL`.
    pub fn stop(&self, name: &str, wait: Duration) -> Result<(), EngineError> {
        let record = self.registry.get(name).ok_or_else(|| EngineError::NotFound(name.to_string()))?;
        record.stop(wait)
    }

    /// **Status** of a single instance by exact name.
    pub fn status(&self, name: &str) -> Result<RecordStatus, EngineError> {
        let record = self.registry.get(name).ok_or_else(|| EngineError::NotFound(name.to_string()))?;
        Ok(record.status())
    }

    /// Starts every instance fanned out from `base`.
    pub fn start_n(&self, base: &str) -> Vec<(String, Result<(), EngineError>)> {
        self.registry
            .get_base(base)
            .into_iter()
            .map(|record| (record.instance_name.clone(), record.start()))
            .collect()
    }

    /// Stops every instance fanned out from `base`.
    pub fn stop_all(&self, base: &str, wait: Duration) -> Vec<(String, Result<(), EngineError>)> {
        self.registry
            .get_base(base)
            .into_iter()
            .map(|record| (record.instance_name.clone(), record.stop(wait)))
            .collect()
    }

    /// Status of every instance fanned out from `base`.
    pub fn status_all(&self, base: &str) -> Vec<RecordStatus> {
        self.registry.get_base(base).iter().map(|record| record.status()).collect()
    }

    /// Number of instances currently fanned out from `base`.
    pub fn count(&self, base: &str) -> usize {
        self.registry.count(base)
    }

    /// Stops every registered instance whose name matches the glob.
    pub fn stop_match(&self, glob: &str, wait: Duration) -> Vec<(String, Result<(), EngineError>)> {
        self.registry
            .get_match(glob)
            .into_iter()
            .map(|record| (record.instance_name.clone(), record.stop(wait)))
            .collect()
    }

    /// Status of every registered instance whose name matches the glob.
    pub fn status_match(&self, glob: &str) -> Vec<RecordStatus> {
        self.registry.get_match(glob).iter().map(|record| record.status()).collect()
    }

    /// Names fanned out from `base`.
    pub fn names_for_base(&self, base: &str) -> Vec<String> {
        self.registry.get_base(base).iter().map(|record| record.instance_name.clone()).collect()
    }

    /// Names matching the glob.
    pub fn names_for_glob(&self, glob: &str) -> Vec<String> {
        self.registry.get_match(glob).iter().map(|record| record.instance_name.clone()).collect()
    }

    /// **ApplyConfig**: reconciles the registry against `desired` specs —
    /// registers specs not yet present, unregisters (after stopping)
    /// instances no longer named, and replaces the spec of anything
    /// whose definition changed. Per Open Question 2, the registry's
    /// write lock is held only for the index diff; the per-record
    /// start/stop work below happens against already-released records.
    pub fn apply_config(&self, desired: Vec<Spec>, wait: Duration) -> Result<(), EngineError> {
        let desired_names: Vec<String> = desired.iter().flat_map(|spec| spec.instance_names()).collect();
        let current_names = self.registry.names();

        let mut to_remove: Vec<String> = current_names
            .iter()
            .filter(|name| !desired_names.contains(name))
            .cloned()
            .collect();
        to_remove.sort();

        for name in &to_remove {
            if let Some(record) = self.registry.get(name) {
                record.stop(wait)?;
            }
            self.registry.unregister(name)?;
        }

        for spec in desired {
            let base = spec.name.clone();
            if self.registry.count(&base) > 0 {
                for record in self.registry.get_base(&base) {
                    record.replace_spec(spec.clone());
                }
            } else {
                self.registry.register(spec, &self.global_env)?;
            }
        }
        Ok(())
    }

    /// Starts every member of a process group in priority order.
    pub fn start_group(&self, group: &GroupSpec) -> Vec<(String, Result<(), EngineError>)> {
        group::start_group(&self.registry, group, &self.global_env)
    }

    /// Stops every member of a process group in reverse priority order.
    pub fn stop_group(&self, group: &GroupSpec, wait: Duration) -> Vec<(String, Result<(), EngineError>)> {
        group::stop_group(&self.registry, group, wait)
    }

    /// Status of every member of a process group, by member name.
    pub fn status_group(&self, group: &GroupSpec) -> BTreeMap<String, Vec<RecordStatus>> {
        group::status_group(&self.registry, group)
    }

    /// Registers or replaces a cron job.
    pub fn add_cron_job(&self, job: CronJob) -> Result<(), EngineError> {
        self.cron.as_ref().expect("cron manager present while engine is running").add_job(job).map_err(EngineError::from)
    }

    /// Removes a cron job by name. In-flight instances keep running.
    pub fn remove_cron_job(&self, name: &str) {
        if let Some(cron) = &self.cron {
            cron.remove_job(name);
        }
    }

    /// Snapshot of every cron job's scheduling state.
    pub fn cron_jobs(&self) -> Vec<CronJobStatus> {
        self.cron.as_ref().map(|cron| cron.jobs_snapshot()).unwrap_or_default()
    }

    /// Most recent metrics sample for a single instance.
    pub fn metrics_current(&self, instance_name: &str) -> Option<ProcessMetrics> {
        self.metrics_store.current(instance_name)
    }

    /// Retained sample history for a single instance, oldest first.
    pub fn metrics_history(&self, instance_name: &str) -> Vec<ProcessMetrics> {
        self.metrics_store.history(instance_name)
    }

    /// Aggregated metrics across every instance fanned out from `base`.
    pub fn metrics_group(&self, base: &str) -> GroupAggregate {
        self.metrics_store.group(base)
    }

    /// Whether a durable store is configured for this engine.
    pub fn has_store(&self) -> bool {
        self.store.is_some()
    }

    /// Signals and joins every background thread (reconciler, cron,
    /// metrics). Equivalent to dropping the engine, but lets the caller
    /// observe completion.
    pub fn shutdown(mut self) {
        if let Some(reconciler) = self.reconciler.take() {
            reconciler.shutdown();
        }
        if let Some(cron) = self.cron.take() {
            cron.shutdown();
        }
        if let Some(metrics) = self.metrics.take() {
            metrics.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;

    fn spec(name: &str) -> Spec {
        Spec {
            name: name.to_string(),
            command: "sleep 5".to_string(),
            work_dir: None,
            env: vec![],
            pid_file: None,
            log: None,
            detectors: vec![],
            instances: 1,
            auto_restart: false,
            retry_count: 3,
            retry_interval: StdDuration::from_millis(100),
            start_duration: StdDuration::from_millis(50),
            priority: 0,
        }
    }

    fn test_settings() -> EngineSettings {
        let mut settings = EngineSettings::default();
        settings.reconciler_interval = StdDuration::from_millis(50);
        settings.cron_tick_interval = StdDuration::from_millis(50);
        settings.metrics_interval = StdDuration::from_millis(50);
        settings
    }

    #[test]
    fn register_start_status_stop_lifecycle() {
        let engine = Engine::start(test_settings()).unwrap();
        engine.register(spec("demo")).unwrap();
        engine.start("demo").unwrap();
        std::thread::sleep(StdDuration::from_millis(100));
        let status = engine.status("demo").unwrap();
        assert!(status.pid > 0);
        engine.stop("demo", StdDuration::from_secs(2)).unwrap();
        engine.shutdown();
    }

    #[test]
    fn apply_config_removes_dropped_specs() {
        let engine = Engine::start(test_settings()).unwrap();
        engine.register(spec("a")).unwrap();
        engine.register(spec("b")).unwrap();
        engine.start("a").unwrap();
        engine.start("b").unwrap();
        std::thread::sleep(StdDuration::from_millis(100));

        engine.apply_config(vec![spec("a")], StdDuration::from_secs(2)).unwrap();

        assert!(engine.status("a").is_ok());
        assert!(engine.status("b").is_err());
        engine.shutdown();
    }

    #[test]
    fn status_not_found_for_unknown_name() {
        let engine = Engine::start(test_settings()).unwrap();
        assert!(matches!(engine.status("ghost"), Err(EngineError::NotFound(_))));
        engine.shutdown();
    }
}

//! Periodic reconciliation and takeover (spec §4.5).
//!
//! Runs on its own thread, timer-driven and cancellable. Every tick first
//! attempts takeover of any still-idle record the store remembers as
//! `running`, then snapshots the registry, verifies liveness, upserts the
//! store, and restarts anything found "lost" — all outside the registry's
//! write lock (spec §5: "Reconciler never holds the registry write lock
//! while performing I/O; it snapshots, releases, then works"). Store
//! errors are logged per record and never abort the tick.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tracing::{debug, info, warn};

use crate::detector::is_alive;
use crate::record::RecordState;
use crate::registry::Registry;
use crate::store::{Store, StoreRecord};

/// Owns the reconciler's background thread and its cancellation flag.
pub struct Reconciler {
    stop_flag: Arc<AtomicBool>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl Reconciler {
    /// Spawns the reconciler thread, ticking every `interval`. `store` is
    /// optional: its absence disables only takeover and persistence, per
    /// spec §4.6.
    pub fn spawn(registry: Arc<Registry>, store: Option<Arc<dyn Store>>, interval: Duration) -> Self {
        let stop_flag = Arc::new(AtomicBool::new(false));
        let thread_stop_flag = Arc::clone(&stop_flag);
        let handle = std::thread::spawn(move || {
            while !thread_stop_flag.load(Ordering::Relaxed) {
                if let Some(store) = &store {
                    takeover(&registry, store.as_ref());
                }
                tick(&registry, store.as_deref());
                std::thread::sleep(interval);
            }
        });
        Reconciler {
            stop_flag,
            handle: Some(handle),
        }
    }

    /// Signals the reconciler thread to stop and joins it within the
    /// caller's bounded wait (spec §5 cancellation guarantee).
    pub fn shutdown(mut self) {
        self.stop_flag.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Reconciler {
    fn drop(&mut self) {
        self.stop_flag.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn tick(registry: &Registry, store: Option<&dyn Store>) {
    let snapshot = registry.all();
    debug!(count = snapshot.len(), "reconciler tick");

    for record in &snapshot {
        let status = record.status();

        if status.state == RecordState::Running {
            let spec = record.spec();
            let alive = is_alive(&spec.detectors, status.pid);
            if !alive {
                warn!(instance = %record.instance_name, pid = status.pid, "lost: no longer alive, marking failed");
                record.mark_failed();
                if spec.auto_restart {
                    if let Err(err) = record.start() {
                        warn!(instance = %record.instance_name, "failed to restart lost instance: {err}");
                    }
                }
            }
        }

        if let Some(store) = store {
            let status = record.status();
            let store_record = StoreRecord {
                name: record.instance_name.clone(),
                pid: status.pid,
                last_status: format!("{:?}", status.state).to_lowercase(),
                updated_at: SystemTime::now(),
            };
            if let Err(err) = store.upsert(&store_record) {
                warn!(instance = %record.instance_name, "store upsert failed: {err}");
            }
        }
    }
}

/// Takeover pass: for each store record marked `running` whose spec is
/// still registered, confirm via detectors before deciding to restart from
/// scratch. Runs on every tick rather than only the reconciler's first
/// one, since registration can race the reconciler thread's startup;
/// `record.is_idle()` makes repeated passes over an already-adopted or
/// already-started record a no-op.
fn takeover(registry: &Registry, store: &dyn Store) {
    let stored = match store.list() {
        Ok(records) => records,
        Err(err) => {
            warn!("takeover: failed to list store: {err}");
            return;
        }
    };

    for stored_record in stored {
        if stored_record.last_status != "running" {
            continue;
        }
        let Some(record) = registry.get(&stored_record.name) else {
            continue;
        };
        if !record.is_idle() {
            continue;
        }
        let spec = record.spec();
        if is_alive(&spec.detectors, stored_record.pid) {
            info!(instance = %record.instance_name, pid = stored_record.pid, "took over existing process");
            record.adopt(stored_record.pid);
        } else if spec.auto_restart {
            debug!(instance = %record.instance_name, "takeover candidate not alive, restarting fresh");
            if let Err(err) = record.start() {
                warn!(instance = %record.instance_name, "failed to start after failed takeover: {err}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::Spec;
    use crate::store::InMemoryStore;
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

    #[test]
    fn tick_upserts_running_records_into_store() {
        let registry = Arc::new(Registry::new());
        registry.register(spec("demo"), &[]).unwrap();
        let record = registry.get("demo").unwrap();
        record.start().unwrap();
        std::thread::sleep(StdDuration::from_millis(100));

        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        tick(&registry, Some(store.as_ref()));

        let stored = store.get("demo").unwrap().unwrap();
        assert!(stored.pid > 0);

        record.stop(StdDuration::from_secs(2)).unwrap();
    }

    #[test]
    fn tick_without_store_does_not_panic() {
        let registry = Arc::new(Registry::new());
        registry.register(spec("demo"), &[]).unwrap();
        tick(&registry, None);
    }
}

//! Process metrics collector (spec §4.9): bounded-history CPU/RSS/VMS/
//! thread/fd sampling with per-base aggregation.
//!
//! Adapted from `systemg::metrics`'s `sysinfo`-backed periodic sampler,
//! but the history model here is a true fixed-capacity ring buffer per
//! instance (`VecDeque` with an eager `pop_front` on overflow, O(1)
//! append/evict) rather than the teacher's retention-window-plus-disk-
//! spillover design — spillover is a dropped teacher feature, noted in
//! DESIGN.md, since the spec asks only for a bounded in-memory history.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use thiserror::Error;
use tracing::debug;

use crate::registry::Registry;

/// Errors from the metrics subsystem. Internal sampling failures never
/// reach this type (spec §7: logged and swallowed in-subsystem); it
/// exists for the rare case an embedder queries a name with no history
/// at all.
#[derive(Debug, Error)]
pub enum MetricsError {
    /// No sample has ever been recorded for this instance.
    #[error("no metrics recorded for '{0}'")]
    NoHistory(String),
}

/// One resource-usage sample for a single PID at a point in time.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ProcessMetrics {
    /// PID the sample was taken against.
    pub pid: i32,
    /// CPU usage percentage since the previous sample.
    pub cpu_percent: f32,
    /// Resident set size, in bytes.
    pub memory_rss: u64,
    /// Virtual memory size, in bytes.
    pub memory_vms: u64,
    /// Swap usage, in bytes, where the platform reports it.
    pub memory_swap: Option<u64>,
    /// Thread count (POSIX only).
    pub num_threads: Option<u64>,
    /// Open file descriptor count (POSIX only).
    pub num_fds: Option<u64>,
    /// Wall-clock time this sample was taken.
    pub sampled_at: SystemTime,
}

/// Derives the `(process_name, instance_id)` export label pair for an
/// instance (spec §4.9): the numeric suffix after the base name, or
/// `"0"` for an un-suffixed name.
pub fn labels_for(instance_name: &str, base_name: &str) -> (String, String) {
    let instance_id = instance_name
        .strip_prefix(base_name)
        .and_then(|rest| rest.strip_prefix('-'))
        .filter(|suffix| !suffix.is_empty() && suffix.chars().all(|c| c.is_ascii_digit()))
        .unwrap_or("0")
        .to_string();
    (base_name.to_string(), instance_id)
}

/// Fixed-capacity circular buffer: append is O(1), and once full, the
/// oldest sample is evicted on every insert (spec invariant 6).
struct History {
    capacity: usize,
    samples: VecDeque<ProcessMetrics>,
}

impl History {
    fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        History {
            capacity,
            samples: VecDeque::with_capacity(capacity),
        }
    }

    fn push(&mut self, sample: ProcessMetrics) {
        if self.samples.len() >= self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }
}

/// Totals/averages across every instance matching a base name (spec
/// §4.9 `GetGroup`).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct GroupAggregate {
    /// Number of instances contributing to this aggregate.
    pub instance_count: usize,
    /// Sum of each instance's latest CPU percent.
    pub total_cpu_percent: f32,
    /// Mean of each instance's latest CPU percent.
    pub average_cpu_percent: f32,
    /// Sum of each instance's latest RSS.
    pub total_memory_rss: u64,
    /// Mean of each instance's latest RSS.
    pub average_memory_rss: u64,
}

/// Shared, thread-safe per-instance metrics history, independent of the
/// [`MetricsCollector`] that populates it — an embedder can read it from
/// any thread.
pub struct MetricsStore {
    max_history: usize,
    histories: Mutex<HashMap<String, History>>,
}

impl MetricsStore {
    /// Creates an empty store with the given per-instance ring-buffer
    /// capacity.
    pub fn new(max_history: usize) -> Arc<Self> {
        Arc::new(MetricsStore {
            max_history,
            histories: Mutex::new(HashMap::new()),
        })
    }

    fn record(&self, instance_name: &str, sample: ProcessMetrics) {
        let mut histories = self.histories.lock().unwrap();
        histories
            .entry(instance_name.to_string())
            .or_insert_with(|| History::new(self.max_history))
            .push(sample);
    }

    /// Drops history for instances no longer present in the registry
    /// (spec §4.9: "Removed instances have their label set cleared on
    /// the next tick").
    fn retain_only(&self, live_names: &[String]) {
        let mut histories = self.histories.lock().unwrap();
        histories.retain(|name, _| live_names.contains(name));
    }

    /// Most recent sample recorded for an instance.
    pub fn current(&self, instance_name: &str) -> Option<ProcessMetrics> {
        self.histories
            .lock()
            .unwrap()
            .get(instance_name)
            .and_then(|history| history.samples.back().copied())
    }

    /// Full history for an instance, oldest first.
    pub fn history(&self, instance_name: &str) -> Vec<ProcessMetrics> {
        self.histories
            .lock()
            .unwrap()
            .get(instance_name)
            .map(|history| history.samples.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Aggregates the latest sample of every instance whose name equals
    /// `base` or matches `base-*` (exact string compare plus the
    /// registry's own base-name grouping, not a new matcher).
    pub fn group(&self, base: &str) -> GroupAggregate {
        let histories = self.histories.lock().unwrap();
        let mut agg = GroupAggregate::default();
        for (name, history) in histories.iter() {
            let in_group = name == base
                || name
                    .strip_prefix(base)
                    .map(|rest| rest.starts_with('-'))
                    .unwrap_or(false);
            if !in_group {
                continue;
            }
            if let Some(sample) = history.samples.back() {
                agg.instance_count += 1;
                agg.total_cpu_percent += sample.cpu_percent;
                agg.total_memory_rss += sample.memory_rss;
            }
        }
        if agg.instance_count > 0 {
            agg.average_cpu_percent = agg.total_cpu_percent / agg.instance_count as f32;
            agg.average_memory_rss = agg.total_memory_rss / agg.instance_count as u64;
        }
        agg
    }
}

/// Background sampler: walks the registry every `interval`, reads
/// CPU/RSS/VMS/thread/fd counts for each live PID via `sysinfo`, and
/// records one sample per instance into a shared [`MetricsStore`].
pub struct MetricsCollector {
    stop_flag: Arc<AtomicBool>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl MetricsCollector {
    /// Spawns the sampling thread.
    pub fn spawn(registry: Arc<Registry>, store: Arc<MetricsStore>, interval: Duration) -> Self {
        let stop_flag = Arc::new(AtomicBool::new(false));
        let thread_stop_flag = Arc::clone(&stop_flag);
        let handle = std::thread::spawn(move || {
            let mut system = System::new();
            while !thread_stop_flag.load(Ordering::Relaxed) {
                tick(&registry, &store, &mut system);
                std::thread::sleep(interval);
            }
        });
        MetricsCollector {
            stop_flag,
            handle: Some(handle),
        }
    }

    /// Signals the sampling thread to stop and joins it.
    pub fn shutdown(mut self) {
        self.stop_flag.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for MetricsCollector {
    fn drop(&mut self) {
        self.stop_flag.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn tick(registry: &Registry, store: &MetricsStore, system: &mut System) {
    let snapshot = registry.all();
    let pids: Vec<Pid> = snapshot
        .iter()
        .filter_map(|record| {
            let status = record.status();
            (status.pid > 0).then(|| Pid::from_u32(status.pid as u32))
        })
        .collect();

    system.refresh_processes_specifics(
        ProcessesToUpdate::Some(&pids),
        true,
        ProcessRefreshKind::everything(),
    );

    let mut live_names = Vec::with_capacity(snapshot.len());
    for record in &snapshot {
        live_names.push(record.instance_name.clone());
        let status = record.status();
        if status.pid <= 0 {
            continue;
        }
        let Some(process) = system.process(Pid::from_u32(status.pid as u32)) else {
            continue;
        };
        let sample = ProcessMetrics {
            pid: status.pid,
            cpu_percent: process.cpu_usage(),
            memory_rss: process.memory(),
            memory_vms: process.virtual_memory(),
            memory_swap: None,
            num_threads: num_threads(status.pid),
            num_fds: num_fds(status.pid),
            sampled_at: SystemTime::now(),
        };
        store.record(&record.instance_name, sample);
    }

    store.retain_only(&live_names);
    debug!(count = snapshot.len(), "metrics tick");
}

#[cfg(target_os = "linux")]
fn num_threads(pid: i32) -> Option<u64> {
    let contents = std::fs::read_to_string(format!("/proc/{pid}/status")).ok()?;
    contents
        .lines()
        .find_map(|line| line.strip_prefix("Threads:"))
        .and_then(|value| value.trim().parse().ok())
}

#[cfg(not(target_os = "linux"))]
fn num_threads(_pid: i32) -> Option<u64> {
    None
}

#[cfg(target_os = "linux")]
fn num_fds(pid: i32) -> Option<u64> {
    std::fs::read_dir(format!("/proc/{pid}/fd"))
        .ok()
        .map(|entries| entries.count() as u64)
}

#[cfg(not(target_os = "linux"))]
fn num_fds(_pid: i32) -> Option<u64> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(cpu: f32, rss: u64) -> ProcessMetrics {
        ProcessMetrics {
            pid: 1,
            cpu_percent: cpu,
            memory_rss: rss,
            memory_vms: rss * 2,
            memory_swap: None,
            num_threads: Some(1),
            num_fds: Some(4),
            sampled_at: SystemTime::now(),
        }
    }

    #[test]
    fn history_evicts_oldest_past_capacity() {
        let store = MetricsStore::new(2);
        store.record("web-0", sample(1.0, 100));
        store.record("web-0", sample(2.0, 200));
        store.record("web-0", sample(3.0, 300));
        let history = store.history("web-0");
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].memory_rss, 200);
        assert_eq!(history[1].memory_rss, 300);
    }

    #[test]
    fn current_returns_latest_sample() {
        let store = MetricsStore::new(5);
        store.record("web-0", sample(1.0, 100));
        store.record("web-0", sample(5.0, 500));
        assert_eq!(store.current("web-0").unwrap().cpu_percent, 5.0);
    }

    #[test]
    fn group_aggregates_matching_base_only() {
        let store = MetricsStore::new(5);
        store.record("web-0", sample(10.0, 100));
        store.record("web-1", sample(20.0, 300));
        store.record("other-0", sample(99.0, 999));
        let agg = store.group("web");
        assert_eq!(agg.instance_count, 2);
        assert_eq!(agg.total_cpu_percent, 30.0);
        assert_eq!(agg.average_cpu_percent, 15.0);
        assert_eq!(agg.total_memory_rss, 400);
    }

    #[test]
    fn group_matches_bare_base_name_too() {
        let store = MetricsStore::new(5);
        store.record("solo", sample(1.0, 10));
        let agg = store.group("solo");
        assert_eq!(agg.instance_count, 1);
    }

    #[test]
    fn retain_only_clears_removed_instances() {
        let store = MetricsStore::new(5);
        store.record("web-0", sample(1.0, 100));
        store.record("web-1", sample(1.0, 100));
        store.retain_only(&["web-0".to_string()]);
        assert!(store.current("web-0").is_some());
        assert!(store.current("web-1").is_none());
    }

    #[test]
    fn labels_default_instance_id_to_zero_for_bare_name() {
        assert_eq!(labels_for("solo", "solo"), ("solo".to_string(), "0".to_string()));
    }

    #[test]
    fn labels_extract_numeric_suffix() {
        assert_eq!(labels_for("web-2", "web"), ("web".to_string(), "2".to_string()));
    }
}

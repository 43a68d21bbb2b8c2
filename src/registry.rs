//! Name→record index with base-name fan-out and wildcard lookup
//! (spec §4.2). The registry is the sole owner of
//! [`crate::record::ProcessRecord`]s; every other subsystem holds only
//! names, never record references, to avoid cyclic ownership (spec §9).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::error::EngineError;
use crate::record::ProcessRecord;
use crate::spec::Spec;

/// `instance_name -> record` index behind a short-critical-section lock.
///
/// Mutations acquire the lock only long enough to touch the index itself;
/// all record-level work (spawning, waiting, signaling) happens outside it,
/// per spec §5.
#[derive(Default)]
pub struct Registry {
    records: Mutex<HashMap<String, Arc<ProcessRecord>>>,
}

impl Registry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Registry {
            records: Mutex::new(HashMap::new()),
        }
    }

    /// **Register**: validates the spec, then inserts one record in
    /// `Stopped` state per fanned-out instance name. Fails with
    /// `Duplicate` if any derived name already exists; in that case no
    /// records are inserted.
    pub fn register(&self, spec: Spec, global_env: &[String]) -> Result<Vec<String>, EngineError> {
        spec.validate()
            .map_err(|err| EngineError::InvalidSpec {
                name: spec.name.clone(),
                reason: err.0,
            })?;

        let names = spec.instance_names();
        let mut records = self.records.lock().unwrap();
        for name in &names {
            if records.contains_key(name) {
                return Err(EngineError::Duplicate(name.clone()));
            }
        }
        for name in &names {
            let record = ProcessRecord::new(name.clone(), spec.name.clone(), spec.clone(), global_env.to_vec());
            records.insert(name.clone(), record);
        }
        debug!(base = %spec.name, count = names.len(), "registered");
        Ok(names)
    }

    /// Looks up a record by exact name.
    pub fn get(&self, name: &str) -> Option<Arc<ProcessRecord>> {
        self.records.lock().unwrap().get(name).cloned()
    }

    /// All records whose name is `base` itself or `base-N` for some N.
    pub fn get_base(&self, base: &str) -> Vec<Arc<ProcessRecord>> {
        self.records
            .lock()
            .unwrap()
            .iter()
            .filter(|(name, record)| name.as_str() == base || record.base_name == base)
            .map(|(_, record)| Arc::clone(record))
            .collect()
    }

    /// Read-only snapshot of records whose name matches the glob.
    pub fn get_match(&self, glob: &str) -> Vec<Arc<ProcessRecord>> {
        self.records
            .lock()
            .unwrap()
            .iter()
            .filter(|(name, _)| glob_match(glob, name))
            .map(|(_, record)| Arc::clone(record))
            .collect()
    }

    /// Stable snapshot of every registered name.
    pub fn names(&self) -> Vec<String> {
        self.records.lock().unwrap().keys().cloned().collect()
    }

    /// Snapshot of every record, for the reconciler/metrics collector.
    pub fn all(&self) -> Vec<Arc<ProcessRecord>> {
        self.records.lock().unwrap().values().cloned().collect()
    }

    /// **Unregister**: removes the entry, freeing the name for reuse.
    /// Does not stop the process; callers must `Stop` first.
    pub fn unregister(&self, name: &str) -> Result<(), EngineError> {
        let removed = self.records.lock().unwrap().remove(name);
        if removed.is_none() {
            return Err(EngineError::NotFound(name.to_string()));
        }
        Ok(())
    }

    /// Number of instances registered under `base`.
    pub fn count(&self, base: &str) -> usize {
        self.get_base(base).len()
    }
}

/// A small hand-rolled glob matcher: `*` matches any run of characters,
/// `?` matches exactly one. No regex engine is used here by design (spec
/// §9: "No regex surface to avoid catastrophic input").
pub fn glob_match(pattern: &str, candidate: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let candidate: Vec<char> = candidate.chars().collect();
    match_from(&pattern, 0, &candidate, 0)
}

fn match_from(pattern: &[char], pi: usize, candidate: &[char], ci: usize) -> bool {
    let mut pi = pi;
    let mut ci = ci;
    let mut star_pi: Option<usize> = None;
    let mut star_ci = 0usize;

    loop {
        if pi < pattern.len() {
            match pattern[pi] {
                '?' if ci < candidate.len() => {
                    pi += 1;
                    ci += 1;
                    continue;
                }
                '*' => {
                    star_pi = Some(pi);
                    star_ci = ci;
                    pi += 1;
                    continue;
                }
                c if ci < candidate.len() && c == candidate[ci] => {
                    pi += 1;
                    ci += 1;
                    continue;
                }
                _ => {}
            }
        } else if ci == candidate.len() {
            return true;
        }

        if let Some(star) = star_pi {
            star_ci += 1;
            ci = star_ci;
            pi = star + 1;
            if ci > candidate.len() {
                return false;
            }
            continue;
        }

        return false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn spec(name: &str, instances: u32) -> Spec {
        Spec {
            name: name.to_string(),
            command: "sleep 1".to_string(),
            work_dir: None,
            env: vec![],
            pid_file: None,
            log: None,
            detectors: vec![],
            instances,
            auto_restart: false,
            retry_count: 3,
            retry_interval: Duration::from_millis(100),
            start_duration: Duration::from_millis(100),
            priority: 0,
        }
    }

    #[test]
    fn register_fans_out_instances() {
        let registry = Registry::new();
        let names = registry.register(spec("web", 3), &[]).unwrap();
        assert_eq!(names, vec!["web-0", "web-1", "web-2"]);
        assert_eq!(registry.count("web"), 3);
    }

    #[test]
    fn duplicate_name_is_rejected() {
        let registry = Registry::new();
        registry.register(spec("web", 1), &[]).unwrap();
        let err = registry.register(spec("web", 1), &[]).unwrap_err();
        assert!(matches!(err, EngineError::Duplicate(_)));
    }

    #[test]
    fn unregister_frees_name_for_reuse() {
        let registry = Registry::new();
        registry.register(spec("web", 1), &[]).unwrap();
        registry.unregister("web").unwrap();
        assert!(registry.register(spec("web", 1), &[]).is_ok());
    }

    #[test]
    fn wildcard_matches_base_prefix_only() {
        let registry = Registry::new();
        registry.register(spec("a", 1), &[]).unwrap();
        registry.register(spec("a-extra", 1), &[]).unwrap();
        registry.register(spec("b", 1), &[]).unwrap();
        let matched: Vec<String> = registry
            .get_match("a-*")
            .iter()
            .map(|r| r.instance_name.clone())
            .collect();
        assert_eq!(matched, vec!["a-extra".to_string()]);
    }

    #[test]
    fn glob_matches_question_mark_single_char() {
        assert!(glob_match("a-?", "a-1"));
        assert!(!glob_match("a-?", "a-12"));
    }

    #[test]
    fn glob_matches_star_any_run() {
        assert!(glob_match("a-*", "a-1"));
        assert!(glob_match("a-*", "a-123"));
        assert!(!glob_match("a-*", "b-1"));
    }

    #[test]
    fn invalid_spec_never_partially_inserted() {
        let registry = Registry::new();
        let mut bad = spec("bad/name", 1);
        bad.name = "bad/name".to_string();
        assert!(registry.register(bad, &[]).is_err());
        assert!(registry.get("bad/name").is_none());
    }
}

//! Process groups (spec §4.8): pure composition over the [`Registry`].
//! A group carries no independent runtime state beyond its members' own
//! records — "composite, not a first-class runtime entity."

use std::collections::BTreeMap;
use std::time::Duration;

use crate::error::EngineError;
use crate::record::RecordStatus;
use crate::registry::Registry;
use crate::spec::{GroupSpec, Spec};

/// Starts every member of `group` in ascending `priority` order (stable
/// sort). A member already registered is treated as idempotent — only
/// its instances are (re-)started, not re-inserted. Failures are
/// collected per member rather than aborting the remaining starts (spec
/// §4.8: "strict" all-or-nothing grouping is explicitly not a core
/// requirement).
pub fn start_group(registry: &Registry, group: &GroupSpec, global_env: &[String]) -> Vec<(String, Result<(), EngineError>)> {
    let mut members = group.members.clone();
    members.sort_by_key(|spec| spec.priority);

    members
        .into_iter()
        .map(|spec| {
            let name = spec.name.clone();
            (name, start_member(registry, spec, global_env))
        })
        .collect()
}

fn start_member(registry: &Registry, spec: Spec, global_env: &[String]) -> Result<(), EngineError> {
    let names = spec.instance_names();
    match registry.register(spec, global_env) {
        Ok(_) | Err(EngineError::Duplicate(_)) => {}
        Err(err) => return Err(err),
    }

    let mut first_err = None;
    for name in &names {
        let Some(record) = registry.get(name) else {
            first_err.get_or_insert(EngineError::NotFound(name.clone()));
            continue;
        };
        if let Err(err) = record.start() {
            if !matches!(err, EngineError::AlreadyRunning(_)) {
                first_err.get_or_insert(err);
            }
        }
    }
    match first_err {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// Stops every member in descending `priority` order (reverse of start
/// order), dividing `wait` evenly across members so the whole group
/// still respects the caller's overall budget.
pub fn stop_group(registry: &Registry, group: &GroupSpec, wait: Duration) -> Vec<(String, Result<(), EngineError>)> {
    let mut members = group.members.clone();
    members.sort_by_key(|spec| spec.priority);
    members.reverse();

    let per_member = if members.is_empty() {
        wait
    } else {
        wait / members.len() as u32
    };

    members
        .into_iter()
        .map(|spec| {
            let name = spec.name.clone();
            let mut last = Ok(());
            for instance_name in spec.instance_names() {
                if let Some(record) = registry.get(&instance_name) {
                    last = record.stop(per_member);
                    if last.is_err() {
                        break;
                    }
                }
            }
            (name, last)
        })
        .collect()
}

/// Maps each member name to the status of all of its instances.
pub fn status_group(registry: &Registry, group: &GroupSpec) -> BTreeMap<String, Vec<RecordStatus>> {
    group
        .members
        .iter()
        .map(|spec| {
            let statuses = spec
                .instance_names()
                .iter()
                .filter_map(|name| registry.get(name))
                .map(|record| record.status())
                .collect();
            (spec.name.clone(), statuses)
        })
        .collect()
}

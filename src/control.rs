//! Thin control-plane adapter (spec §6): turns a wire-shaped command
//! into calls against [`Engine`], independent of whatever transport
//! carries it (CLI, IPC socket, HTTP — the spec leaves the transport a
//! Non-goal).

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::engine::Engine;
use crate::error::EngineError;
use crate::record::RecordStatus;
use crate::spec::{GroupSpec, Spec};

/// How a command's target name should be resolved against the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Selector {
    /// Exact instance name.
    Name(String),
    /// Every instance fanned out from this base name.
    Base(String),
    /// Every instance whose name matches this glob.
    Wildcard(String),
}

/// A control-plane request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ControlCommand {
    Register(Spec),
    Unregister(String),
    Start(Selector),
    Stop { selector: Selector, wait_ms: u64 },
    Status(Selector),
    StartGroup(GroupSpec),
    StopGroup { group: GroupSpec, wait_ms: u64 },
    StatusGroup(GroupSpec),
}

/// A control-plane response, mirroring the shape of its command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ControlResponse {
    Registered(Vec<String>),
    Unregistered,
    Started(Vec<(String, Result<(), String>)>),
    Stopped(Vec<(String, Result<(), String>)>),
    Status(Vec<RecordStatus>),
    GroupStatus(std::collections::BTreeMap<String, Vec<RecordStatus>>),
    Error(String),
}

/// Dispatches one command against `engine` and produces a response that
/// never itself returns `Err` — failures of individual selector members
/// are carried inside the response variant so that e.g. `StopMatch`
/// over three names with one failure still reports the other two.
pub fn dispatch(engine: &Engine, command: ControlCommand) -> ControlResponse {
    match command {
        ControlCommand::Register(spec) => match engine.register(spec) {
            Ok(names) => ControlResponse::Registered(names),
            Err(err) => ControlResponse::Error(err.to_string()),
        },
        ControlCommand::Unregister(name) => match engine.unregister(&name) {
            Ok(()) => ControlResponse::Unregistered,
            Err(err) => ControlResponse::Error(err.to_string()),
        },
        ControlCommand::Start(selector) => ControlResponse::Started(start_selector(engine, selector)),
        ControlCommand::Stop { selector, wait_ms } => {
            ControlResponse::Stopped(stop_selector(engine, selector, Duration::from_millis(wait_ms)))
        }
        ControlCommand::Status(selector) => ControlResponse::Status(status_selector(engine, selector)),
        ControlCommand::StartGroup(group) => ControlResponse::Started(stringify(engine.start_group(&group))),
        ControlCommand::StopGroup { group, wait_ms } => {
            ControlResponse::Stopped(stringify(engine.stop_group(&group, Duration::from_millis(wait_ms))))
        }
        ControlCommand::StatusGroup(group) => ControlResponse::GroupStatus(engine.status_group(&group)),
    }
}

fn start_selector(engine: &Engine, selector: Selector) -> Vec<(String, Result<(), String>)> {
    match selector {
        Selector::Name(name) => vec![(name.clone(), engine.start(&name).map_err(|e| e.to_string()))],
        Selector::Base(base) => stringify(engine.start_n(&base)),
        Selector::Wildcard(glob) => {
            let names = engine.names_for_glob(&glob);
            names.into_iter().map(|name| (name.clone(), engine.start(&name).map_err(|e| e.to_string()))).collect()
        }
    }
}

fn stop_selector(engine: &Engine, selector: Selector, wait: Duration) -> Vec<(String, Result<(), String>)> {
    match selector {
        Selector::Name(name) => vec![(name.clone(), engine.stop(&name, wait).map_err(|e| e.to_string()))],
        Selector::Base(base) => stringify(engine.stop_all(&base, wait)),
        Selector::Wildcard(glob) => stringify(engine.stop_match(&glob, wait)),
    }
}

fn status_selector(engine: &Engine, selector: Selector) -> Vec<RecordStatus> {
    match selector {
        Selector::Name(name) => engine.status(&name).into_iter().collect(),
        Selector::Base(base) => engine.status_all(&base),
        Selector::Wildcard(glob) => engine.status_match(&glob),
    }
}

fn stringify(results: Vec<(String, Result<(), EngineError>)>) -> Vec<(String, Result<(), String>)> {
    results.into_iter().map(|(name, result)| (name, result.map_err(|e| e.to_string()))).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::EngineSettings;
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
            instances: 2,
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
    fn register_then_start_base_fans_out() {
        let engine = Engine::start(test_settings()).unwrap();
        let response = dispatch(&engine, ControlCommand::Register(spec("web")));
        assert!(matches!(response, ControlResponse::Registered(names) if names.len() == 2));

        let response = dispatch(&engine, ControlCommand::Start(Selector::Base("web".to_string())));
        match response {
            ControlResponse::Started(results) => {
                assert_eq!(results.len(), 2);
                for (_, result) in &results {
                    assert!(result.is_ok());
                }
            }
            other => panic!("unexpected response: {other:?}"),
        }
        std::thread::sleep(StdDuration::from_millis(100));

        let response = dispatch(&engine, ControlCommand::Stop {
            selector: Selector::Base("web".to_string()),
            wait_ms: 2000,
        });
        assert!(matches!(response, ControlResponse::Stopped(_)));
        engine.shutdown();
    }

    #[test]
    fn unregister_unknown_name_reports_error() {
        let engine = Engine::start(test_settings()).unwrap();
        let response = dispatch(&engine, ControlCommand::Unregister("ghost".to_string()));
        assert!(matches!(response, ControlResponse::Error(_)));
        engine.shutdown();
    }
}

//! Embeddable process supervision engine: spawn, watch, restart, and
//! query Unix services from within a host process, with optional
//! durable takeover across supervisor restarts.

#![warn(unused_crate_dependencies)]
use tracing_subscriber as _;

/// Crate-wide error type.
pub mod error;

/// Declarative process specs and process groups.
pub mod spec;

/// Environment variable resolution and `${VAR}` expansion.
pub mod env;

/// PID-reuse-safe liveness detectors.
pub mod detector;

/// Stdout/stderr capture and rotation.
pub mod logs;

/// Per-instance lifecycle state machine.
pub mod record;

/// Name-to-record index with base-name fan-out and wildcard lookup.
pub mod registry;

/// Restart/backoff decision policy.
pub mod restart;

/// Durable state persistence for takeover.
pub mod store;

/// Periodic liveness reconciliation and startup takeover.
pub mod reconciler;

/// Cron-scheduled job firing.
pub mod cron;

/// Process group composition over the registry.
pub mod group;

/// Background resource-usage sampling.
pub mod metrics;

/// Transport-agnostic control-plane command dispatch.
pub mod control;

/// Composition root wiring the engine's subsystems together.
pub mod engine;

/// Ambient engine configuration.
pub mod settings;

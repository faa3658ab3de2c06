//! Supervisor engine for many concurrent `kubectl port-forward` tunnels.
//!
//! One [`service::ServiceInstance`] per tunnel owns the per-service state
//! machine; the [`manager::FleetManager`] drives the monitoring tick, the
//! global cluster-access gate, context-change recovery and UI plugins.

/// Keyword classification of kubectl failures.
pub mod classify;
/// One-shot kubectl invocations: context lookup and the cluster access probe.
pub mod kubectl;
/// Fleet manager and global access gate.
pub mod manager;
/// UI plugins shipped with the supervisor.
pub mod plugins;
/// Per-tunnel state machine.
pub mod service;

pub use manager::{FleetManager, FleetReceivers};
pub use service::ServiceInstance;

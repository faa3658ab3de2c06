//! Shared types for the kfwd supervisor.

/// Tunnel catalog and supervisor configuration.
pub mod config;
/// UI plugin capability contract.
pub mod plugin;
/// Runtime status model and fleet snapshots.
pub mod status;

pub use config::{Config, TunnelKind, TunnelSpec};
pub use plugin::{StatusSink, UiPlugin};
pub use status::{FleetSnapshot, GlobalStatus, ServiceState, ServiceStatus};

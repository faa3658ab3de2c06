//! Shared utilities for kfwd.

/// Local port reservation and availability probing.
pub mod ports;
/// Reachability probes.
pub mod probe;
/// Child process lifecycle: spawn, liveness, group termination.
pub mod process;

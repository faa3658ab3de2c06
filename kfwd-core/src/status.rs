use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Lifecycle state of a single supervised tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceState {
    /// Constructed, never started.
    Starting,
    /// Child spawned, waiting for the first successful reachability probe.
    Connecting,
    /// Process alive and port reachable.
    Running,
    /// Process alive but the probe is failing.
    Degraded,
    /// Transitional marker used during context-change tear-down and resume.
    Reconnecting,
    /// Health verdict reached; eligible for restart.
    Failed,
    /// Waiting out a backoff window before the next restart attempt.
    Cooldown,
    /// Paused by the fleet-wide gate; no process, no port held.
    Suspended,
    /// Terminal; child gone, port released.
    Stopped,
}

impl ServiceState {
    /// States in which the service owns (or is about to own) a child process
    /// and is subject to health evaluation and suspension.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            ServiceState::Starting
                | ServiceState::Connecting
                | ServiceState::Running
                | ServiceState::Degraded
                | ServiceState::Reconnecting
        )
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ServiceState::Starting => "Starting",
            ServiceState::Connecting => "Connecting",
            ServiceState::Running => "Running",
            ServiceState::Degraded => "Degraded",
            ServiceState::Reconnecting => "Reconnecting",
            ServiceState::Failed => "Failed",
            ServiceState::Cooldown => "Cooldown",
            ServiceState::Suspended => "Suspended",
            ServiceState::Stopped => "Stopped",
        };
        f.write_str(label)
    }
}

/// Fleet-wide cluster access verdict, attached to every status snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GlobalStatus {
    #[default]
    Healthy,
    AuthFailure,
    NetworkFailure,
}

impl fmt::Display for GlobalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            GlobalStatus::Healthy => "healthy",
            GlobalStatus::AuthFailure => "auth_failure",
            GlobalStatus::NetworkFailure => "network_failure",
        };
        f.write_str(label)
    }
}

/// Point-in-time status of one tunnel, as published to observers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub name: String,
    pub state: ServiceState,
    /// Port actually bound. May differ from the spec if it was reassigned.
    pub local_port: u16,
    pub pid: Option<u32>,
    pub start_time: Option<DateTime<Utc>>,
    pub restart_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Transient message, e.g. "Starting gRPC UI...".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_message: Option<String>,
    pub in_cooldown: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cooldown_until: Option<DateTime<Utc>>,
    pub global: GlobalStatus,
}

impl ServiceStatus {
    /// Uptime is only defined while the tunnel is Running or Degraded.
    pub fn uptime(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        match self.state {
            ServiceState::Running | ServiceState::Degraded => {
                self.start_time.map(|start| now - start)
            }
            _ => None,
        }
    }
}

/// Snapshot of the whole fleet, keyed by service name.
pub type FleetSnapshot = HashMap<String, ServiceStatus>;

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn status(state: ServiceState) -> ServiceStatus {
        ServiceStatus {
            name: "api".to_string(),
            state,
            local_port: 8080,
            pid: Some(4242),
            start_time: Some(Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()),
            restart_count: 0,
            last_error: None,
            status_message: None,
            in_cooldown: false,
            cooldown_until: None,
            global: GlobalStatus::Healthy,
        }
    }

    #[test]
    fn uptime_is_defined_only_while_running_or_degraded() {
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 30).unwrap();
        assert_eq!(
            status(ServiceState::Running).uptime(now),
            Some(chrono::Duration::seconds(30))
        );
        assert!(status(ServiceState::Degraded).uptime(now).is_some());
        assert_eq!(status(ServiceState::Suspended).uptime(now), None);
        assert_eq!(status(ServiceState::Stopped).uptime(now), None);
    }

    #[test]
    fn global_status_serializes_snake_case() {
        let json = serde_json::to_string(&GlobalStatus::AuthFailure).unwrap();
        assert_eq!(json, "\"auth_failure\"");
        assert_eq!(GlobalStatus::NetworkFailure.to_string(), "network_failure");
    }

    #[test]
    fn active_states_cover_everything_subject_to_suspension() {
        for state in [
            ServiceState::Starting,
            ServiceState::Connecting,
            ServiceState::Running,
            ServiceState::Degraded,
            ServiceState::Reconnecting,
        ] {
            assert!(state.is_active(), "{state} should be active");
        }
        for state in [
            ServiceState::Failed,
            ServiceState::Cooldown,
            ServiceState::Suspended,
            ServiceState::Stopped,
        ] {
            assert!(!state.is_active(), "{state} should not be active");
        }
    }
}

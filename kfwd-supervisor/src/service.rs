use crate::classify::{self, FailureKind};
use anyhow::Result;
use chrono::{DateTime, Duration as TimeDelta, Utc};
use kfwd_core::config::TunnelSpec;
use kfwd_core::status::{GlobalStatus, ServiceState, ServiceStatus};
use kfwd_utils::ports::{PortError, PortRegistry};
use kfwd_utils::{probe, process};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Health evaluation is deferred for this long after a spawn.
const STARTUP_GRACE_SECS: i64 = 5;

/// Consecutive unhealthy samples before a service is marked Failed.
const MAX_FAILURE_THRESHOLD: i32 = 3;

/// Cooldown schedule for repeated spawn failures, indexed by
/// failure-count − 3 and clamped to the last entry.
const BACKOFF_SCHEDULE_SECS: [i64; 5] = [5, 10, 20, 40, 60];

/// Mutable bookkeeping for one tunnel. All mutation goes through the
/// instance mutex; the methods here are the pure transition rules.
#[derive(Debug)]
struct InstanceState {
    status: ServiceState,
    /// Port in use, or last used. May differ from the spec on reassignment.
    local_port: u16,
    /// Active reservation in the port registry, if any.
    bound_port: Option<u16>,
    /// 0 means no child process.
    pid: u32,
    start_time: Option<DateTime<Utc>>,
    restart_count: u32,
    last_error: Option<String>,
    status_message: Option<String>,
    /// Spawn failures in a row; drives the cooldown schedule.
    failure_count: u32,
    cooldown_until: Option<DateTime<Utc>>,
    /// Health hysteresis counter. Positive values mean recent unhealthy
    /// samples; recovery decrements it back to zero.
    consecutive_failures: i32,
    health_check_failures: u32,
}

impl InstanceState {
    fn new(local_port: u16) -> Self {
        Self {
            status: ServiceState::Starting,
            local_port,
            bound_port: None,
            pid: 0,
            start_time: None,
            restart_count: 0,
            last_error: None,
            status_message: None,
            failure_count: 0,
            cooldown_until: None,
            consecutive_failures: 0,
            health_check_failures: 0,
        }
    }

    fn in_cooldown(&self, now: DateTime<Utc>) -> bool {
        self.cooldown_until.is_some_and(|until| now < until)
    }

    /// Folds one probe-and-judge result into the state machine.
    ///
    /// Hysteresis: entering Degraded primes the counter to 2 so recovery
    /// takes two healthy samples; entering Failed primes it to 3.
    fn apply_health_sample(&mut self, name: &str, process_running: bool, port_connected: bool) {
        let healthy = process_running && port_connected;

        if healthy {
            match self.status {
                ServiceState::Failed => {
                    self.consecutive_failures -= 1;
                    if self.consecutive_failures <= 0 {
                        info!("Service {} confirmed recovered after repeated healthy checks", name);
                        self.status = ServiceState::Running;
                        self.last_error = None;
                        self.status_message = None;
                        self.reset_backoff(name);
                    } else {
                        debug!(
                            "Service {} shows signs of recovery ({} more checks needed)",
                            name, self.consecutive_failures
                        );
                    }
                }
                ServiceState::Degraded => {
                    self.consecutive_failures -= 1;
                    if self.consecutive_failures <= 0 {
                        info!("Service {} recovered from degraded state", name);
                        self.status = ServiceState::Running;
                        self.status_message = None;
                        self.last_error = None;
                    }
                }
                ServiceState::Connecting => {
                    info!("Service {} connected", name);
                    self.status = ServiceState::Running;
                    self.status_message = None;
                    self.last_error = None;
                    self.consecutive_failures = 0;
                    self.reset_backoff(name);
                }
                ServiceState::Reconnecting => {
                    info!("Service {} reconnected", name);
                    self.status = ServiceState::Running;
                    self.status_message = None;
                    self.last_error = None;
                    self.consecutive_failures = 0;
                    self.reset_backoff(name);
                }
                ServiceState::Running => {
                    if self.consecutive_failures > 0 {
                        debug!(
                            "Health check recovered for {} after {} consecutive failures",
                            name, self.consecutive_failures
                        );
                    }
                    self.consecutive_failures = 0;
                    self.status_message = None;
                }
                _ => {}
            }
            return;
        }

        self.consecutive_failures += 1;
        self.health_check_failures += 1;
        if self.status == ServiceState::Failed {
            // The recovery bar from Failed is exactly three healthy samples,
            // however long the service has been failing.
            self.consecutive_failures = self.consecutive_failures.min(MAX_FAILURE_THRESHOLD);
        }
        if process_running {
            debug!(
                "Health check failed for {}: port {} not responding ({} consecutive, {} total)",
                name, self.local_port, self.consecutive_failures, self.health_check_failures
            );
        } else {
            debug!(
                "Health check failed for {}: process not running (PID {})",
                name, self.pid
            );
        }

        match self.status {
            ServiceState::Running => {
                self.status = ServiceState::Degraded;
                self.status_message = Some("Port connectivity issues".to_string());
                self.consecutive_failures = 2;
                warn!(
                    "Service {} is degraded - health check failing on port {}",
                    name, self.local_port
                );
            }
            ServiceState::Connecting => {
                // A tunnel whose first post-grace probe fails never goes
                // straight to Running; it degrades like any other.
                self.status = ServiceState::Degraded;
                self.status_message = Some("Port-forward did not become reachable".to_string());
                self.consecutive_failures = 2;
                warn!(
                    "Service {} failed to establish - degraded on port {}",
                    name, self.local_port
                );
            }
            ServiceState::Reconnecting => {
                self.status_message = Some("Reconnection in progress...".to_string());
            }
            _ => {}
        }

        if self.consecutive_failures >= MAX_FAILURE_THRESHOLD
            && self.status != ServiceState::Failed
        {
            self.consecutive_failures = MAX_FAILURE_THRESHOLD;
            self.status = ServiceState::Failed;
            let reason = if process_running {
                format!("port {} not responding after multiple attempts", self.local_port)
            } else {
                format!("process not running (PID {})", self.pid)
            };
            warn!("Service {} marked as failed: {}", name, reason);
            self.last_error = Some(reason);
        }
    }

    /// Bookkeeping for a failed spawn attempt. Auth-classified failures are
    /// the fleet gate's business and never advance the local schedule.
    fn note_spawn_failure(&mut self, name: &str, kind: FailureKind, now: DateTime<Utc>) {
        if kind == FailureKind::Auth {
            debug!(
                "Spawn failure for {} classified as auth; local backoff untouched",
                name
            );
            return;
        }

        self.failure_count += 1;
        if self.failure_count < 3 {
            return;
        }

        let index = usize::min(
            (self.failure_count - 3) as usize,
            BACKOFF_SCHEDULE_SECS.len() - 1,
        );
        let seconds = BACKOFF_SCHEDULE_SECS[index];
        self.cooldown_until = Some(now + TimeDelta::seconds(seconds));
        warn!(
            "Service {} failed {} times, entering cooldown for {}s",
            name, self.failure_count, seconds
        );
    }

    fn reset_backoff(&mut self, name: &str) {
        if self.failure_count > 0 {
            info!("Service {} recovered, resetting failure count", name);
            self.failure_count = 0;
            self.cooldown_until = None;
        }
    }

    fn to_status(&self, name: &str, now: DateTime<Utc>, global: GlobalStatus) -> ServiceStatus {
        ServiceStatus {
            name: name.to_string(),
            state: self.status,
            local_port: self.local_port,
            pid: (self.pid != 0).then_some(self.pid),
            start_time: self.start_time,
            restart_count: self.restart_count,
            last_error: self.last_error.clone(),
            status_message: self.status_message.clone(),
            in_cooldown: self.in_cooldown(now),
            cooldown_until: self.cooldown_until,
            global,
        }
    }
}

/// Supervises a single port-forward tunnel: spawn, health hysteresis,
/// bounded restart backoff. Port reservations are taken from the shared
/// registry just before spawn and returned on every exit path.
pub struct ServiceInstance {
    name: String,
    spec: TunnelSpec,
    ports: Arc<PortRegistry>,
    state: Mutex<InstanceState>,
}

impl ServiceInstance {
    pub fn new(name: String, spec: TunnelSpec, ports: Arc<PortRegistry>) -> Self {
        let local_port = spec.local_port;
        Self {
            name,
            spec,
            ports,
            state: Mutex::new(InstanceState::new(local_port)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn spec(&self) -> &TunnelSpec {
        &self.spec
    }

    /// Spawns the port-forward child. Refuses while in cooldown; resolves
    /// the local port through the registry first, falling back to the next
    /// free port when the desired one is taken.
    pub async fn start(&self) -> Result<()> {
        let mut st = self.state.lock().await;
        let now = Utc::now();

        if st.in_cooldown(now) {
            st.status = ServiceState::Cooldown;
            anyhow::bail!(
                "service {} is in cooldown until {:?}",
                self.name,
                st.cooldown_until
            );
        }

        let port = match self.resolve_port() {
            Ok(port) => port,
            Err(e) => {
                st.status = ServiceState::Failed;
                st.last_error = Some(e.to_string());
                return Err(anyhow::anyhow!(e).context(format!(
                    "port resolution failed for {}",
                    self.name
                )));
            }
        };
        st.local_port = port;

        match process::spawn_port_forward(
            &self.name,
            &self.spec.namespace,
            &self.spec.target,
            port,
            self.spec.target_port,
            process::PORT_FORWARD_REQUEST_TIMEOUT,
        )
        .await
        {
            Ok(pid) => {
                st.bound_port = Some(port);
                st.pid = pid;
                st.start_time = Some(Utc::now());
                st.status = ServiceState::Connecting;
                st.status_message = Some("Waiting for port-forward to establish".to_string());
                st.last_error = None;
                st.consecutive_failures = 0;
                st.health_check_failures = 0;
                info!(
                    "Started port-forward for {}: {}:{} -> {} (PID {})",
                    self.name, self.spec.target, self.spec.target_port, port, pid
                );
                Ok(())
            }
            Err(e) => {
                self.ports.release(port);
                let text = format!("{e:#}");
                let kind = classify::classify(&text);
                st.status = ServiceState::Failed;
                st.last_error = Some(text);
                st.note_spawn_failure(&self.name, kind, Utc::now());
                Err(e.context(format!("failed to start port-forward for {}", self.name)))
            }
        }
    }

    fn resolve_port(&self) -> Result<u16, PortError> {
        match self.ports.try_acquire(self.spec.local_port) {
            Ok(port) => Ok(port),
            Err(_) => {
                let port = self
                    .spec
                    .local_port
                    .checked_add(1)
                    .map(|from| self.ports.acquire_from(from))
                    .unwrap_or(Err(PortError::Exhausted(self.spec.local_port)))?;
                warn!(
                    "Port {} is in use for {}, using port {} instead",
                    self.spec.local_port, self.name, port
                );
                Ok(port)
            }
        }
    }

    /// Kills the child process group and returns the port reservation.
    /// Idempotent: a second stop is a no-op.
    pub async fn stop(&self) {
        let mut st = self.state.lock().await;
        if st.status == ServiceState::Stopped {
            return;
        }
        self.teardown_locked(&mut st);
        st.status = ServiceState::Stopped;
        info!("Stopped port-forward for {}", self.name);
    }

    /// Gate-driven pause: tear everything down and park in Suspended.
    /// Services already off (Suspended, Stopped, Failed, Cooldown) are left
    /// alone.
    pub async fn suspend(&self, message: &str) {
        let mut st = self.state.lock().await;
        if !st.status.is_active() {
            return;
        }
        debug!("Suspending service {} (was {})", self.name, st.status);
        self.teardown_locked(&mut st);
        st.status = ServiceState::Suspended;
        st.start_time = None;
        st.status_message = Some(message.to_string());
    }

    /// Context-change teardown: the child dies and the port is returned,
    /// but the state reads Reconnecting until the fresh start.
    pub async fn stop_for_reconnect(&self, message: &str) {
        let mut st = self.state.lock().await;
        self.teardown_locked(&mut st);
        st.status = ServiceState::Reconnecting;
        st.status_message = Some(message.to_string());
    }

    /// Marks a suspended service as on its way back; the actual restart is
    /// scheduled separately.
    pub async fn mark_reconnecting(&self, message: &str) {
        let mut st = self.state.lock().await;
        st.status = ServiceState::Reconnecting;
        st.status_message = Some(message.to_string());
    }

    fn teardown_locked(&self, st: &mut InstanceState) {
        if st.pid != 0 {
            if let Err(e) = process::kill_process_group(st.pid) {
                warn!("Failed to kill process group for {}: {}", self.name, e);
            }
            st.pid = 0;
        }
        if let Some(port) = st.bound_port.take() {
            self.ports.release(port);
        }
    }

    pub async fn restart(&self) -> Result<()> {
        info!("Restarting service {}", self.name);
        self.stop().await;
        self.start_counted().await
    }

    /// Start preceded by a restart-count bump; used after an external
    /// teardown already stopped the child.
    pub(crate) async fn start_counted(&self) -> Result<()> {
        {
            self.state.lock().await.restart_count += 1;
        }
        self.start().await
    }

    /// Re-evaluates health (liveness probe plus TCP reachability, after the
    /// startup grace window) and returns the resulting status snapshot.
    pub async fn refresh_status(&self, global: GlobalStatus) -> ServiceStatus {
        let mut st = self.state.lock().await;
        let now = Utc::now();

        let evaluating = matches!(
            st.status,
            ServiceState::Running
                | ServiceState::Degraded
                | ServiceState::Connecting
                | ServiceState::Reconnecting
                | ServiceState::Failed
        );
        let past_grace = st
            .start_time
            .is_some_and(|start| now - start > TimeDelta::seconds(STARTUP_GRACE_SECS));

        if evaluating && past_grace {
            let process_running = st.pid != 0 && process::is_process_running(st.pid);
            let port_connected = if process_running {
                probe::check_port(st.local_port).await
            } else {
                false
            };
            st.apply_health_sample(&self.name, process_running, port_connected);
        }

        st.to_status(&self.name, now, global)
    }

    /// Cheap snapshot without a health evaluation.
    pub async fn current_status(&self, global: GlobalStatus) -> ServiceStatus {
        let st = self.state.lock().await;
        st.to_status(&self.name, Utc::now(), global)
    }

    /// Sets (or, with an empty string, clears) the transient status message.
    pub async fn set_status_message(&self, message: &str) {
        let mut st = self.state.lock().await;
        st.status_message = if message.is_empty() {
            None
        } else {
            Some(message.to_string())
        };
    }
}

#[cfg(test)]
impl ServiceInstance {
    pub(crate) async fn test_force_status(&self, status: ServiceState) {
        self.state.lock().await.status = status;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kfwd_core::config::TunnelKind;

    fn state_in(status: ServiceState) -> InstanceState {
        let mut st = InstanceState::new(8080);
        st.status = status;
        st.pid = 4242;
        st.start_time = Some(Utc::now());
        st
    }

    fn spec() -> TunnelSpec {
        TunnelSpec {
            target: "service/api".to_string(),
            target_port: 80,
            local_port: 8080,
            namespace: "default".to_string(),
            kind: TunnelKind::Rest,
            swagger_path: None,
            api_path: None,
            disabled: false,
        }
    }

    #[test]
    fn one_unhealthy_sample_degrades_a_running_service() {
        let mut st = state_in(ServiceState::Running);
        st.apply_health_sample("api", true, false);
        assert_eq!(st.status, ServiceState::Degraded);
        assert_eq!(st.consecutive_failures, 2);
        assert_eq!(st.status_message.as_deref(), Some("Port connectivity issues"));
    }

    #[test]
    fn degraded_recovery_takes_exactly_two_healthy_samples() {
        let mut st = state_in(ServiceState::Running);
        st.apply_health_sample("api", true, false);
        assert_eq!(st.status, ServiceState::Degraded);

        st.apply_health_sample("api", true, true);
        assert_eq!(st.status, ServiceState::Degraded, "one success is not enough");
        st.apply_health_sample("api", true, true);
        assert_eq!(st.status, ServiceState::Running);
        assert!(st.status_message.is_none());
    }

    #[test]
    fn three_consecutive_failures_mark_the_service_failed() {
        let mut st = state_in(ServiceState::Running);
        st.apply_health_sample("api", true, false);
        st.apply_health_sample("api", true, false);
        assert_eq!(st.status, ServiceState::Failed);
        assert_eq!(st.consecutive_failures, 3);
        assert_eq!(
            st.last_error.as_deref(),
            Some("port 8080 not responding after multiple attempts")
        );
    }

    #[test]
    fn failed_recovery_takes_exactly_three_healthy_samples() {
        let mut st = state_in(ServiceState::Running);
        for _ in 0..3 {
            st.apply_health_sample("api", true, false);
        }
        assert_eq!(st.status, ServiceState::Failed);

        st.apply_health_sample("api", true, true);
        st.apply_health_sample("api", true, true);
        assert_eq!(st.status, ServiceState::Failed, "two successes are not enough");
        st.apply_health_sample("api", true, true);
        assert_eq!(st.status, ServiceState::Running);
        assert!(st.last_error.is_none());
    }

    #[test]
    fn lingering_in_failed_does_not_raise_the_recovery_bar() {
        let mut st = state_in(ServiceState::Running);
        for _ in 0..3 {
            st.apply_health_sample("api", true, false);
        }
        assert_eq!(st.status, ServiceState::Failed);

        // Several more unhealthy ticks while Failed must not push the
        // counter past the threshold.
        for _ in 0..5 {
            st.apply_health_sample("api", true, false);
        }
        assert_eq!(st.consecutive_failures, 3);

        for _ in 0..3 {
            st.apply_health_sample("api", true, true);
        }
        assert_eq!(st.status, ServiceState::Running);
    }

    #[test]
    fn a_dead_child_during_connecting_degrades_and_never_runs() {
        let mut st = state_in(ServiceState::Connecting);
        st.apply_health_sample("api", false, false);
        assert_eq!(st.status, ServiceState::Degraded);

        st.apply_health_sample("api", false, false);
        assert_eq!(st.status, ServiceState::Failed);
        assert_eq!(st.last_error.as_deref(), Some("process not running (PID 4242)"));
    }

    #[test]
    fn reconnecting_keeps_its_marker_until_the_failure_threshold() {
        let mut st = state_in(ServiceState::Reconnecting);
        st.apply_health_sample("api", true, false);
        st.apply_health_sample("api", true, false);
        assert_eq!(st.status, ServiceState::Reconnecting);
        assert_eq!(
            st.status_message.as_deref(),
            Some("Reconnection in progress...")
        );
        st.apply_health_sample("api", true, false);
        assert_eq!(st.status, ServiceState::Failed);
    }

    #[test]
    fn reconnecting_promotes_on_a_single_healthy_sample() {
        let mut st = state_in(ServiceState::Reconnecting);
        st.apply_health_sample("api", true, true);
        assert_eq!(st.status, ServiceState::Running);
    }

    #[test]
    fn spawn_backoff_follows_the_schedule() {
        let now = Utc::now();
        let mut st = InstanceState::new(8080);

        st.note_spawn_failure("api", FailureKind::Other, now);
        st.note_spawn_failure("api", FailureKind::Other, now);
        assert!(st.cooldown_until.is_none(), "no cooldown before three failures");

        let expected = [5, 10, 20, 40, 60, 60, 60];
        for seconds in expected {
            st.note_spawn_failure("api", FailureKind::Other, now);
            assert_eq!(
                st.cooldown_until,
                Some(now + TimeDelta::seconds(seconds)),
                "failure #{} should cool down for {}s",
                st.failure_count,
                seconds
            );
        }
    }

    #[test]
    fn auth_spawn_failures_never_advance_the_backoff() {
        let now = Utc::now();
        let mut st = InstanceState::new(8080);
        for _ in 0..5 {
            st.note_spawn_failure("api", FailureKind::Auth, now);
        }
        assert_eq!(st.failure_count, 0);
        assert!(st.cooldown_until.is_none());
    }

    #[test]
    fn recovery_resets_the_backoff() {
        let now = Utc::now();
        let mut st = state_in(ServiceState::Connecting);
        for _ in 0..4 {
            st.note_spawn_failure("api", FailureKind::Network, now);
        }
        assert!(st.cooldown_until.is_some());

        st.apply_health_sample("api", true, true);
        assert_eq!(st.status, ServiceState::Running);
        assert_eq!(st.failure_count, 0);
        assert!(st.cooldown_until.is_none());
    }

    #[test]
    fn cooldown_is_a_strict_deadline() {
        let now = Utc::now();
        let mut st = InstanceState::new(8080);
        st.cooldown_until = Some(now + TimeDelta::seconds(5));
        assert!(st.in_cooldown(now));
        assert!(!st.in_cooldown(now + TimeDelta::seconds(5)));
        assert!(!st.in_cooldown(now + TimeDelta::seconds(6)));
    }

    #[test]
    fn status_snapshot_maps_pid_zero_to_none() {
        let mut st = InstanceState::new(8080);
        st.status = ServiceState::Suspended;
        let status = st.to_status("api", Utc::now(), GlobalStatus::AuthFailure);
        assert_eq!(status.pid, None);
        assert_eq!(status.global, GlobalStatus::AuthFailure);
        assert!(!status.in_cooldown);
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_releases_the_reservation() {
        let ports = Arc::new(PortRegistry::new());
        let instance = ServiceInstance::new("api".to_string(), spec(), ports.clone());

        // Simulate a started service without spawning anything.
        {
            let mut st = instance.state.lock().await;
            let port = ports.acquire_from(28080).expect("reserve");
            st.bound_port = Some(port);
            st.local_port = port;
            st.status = ServiceState::Running;
        }
        assert_eq!(ports.reserved_count(), 1);

        instance.stop().await;
        assert_eq!(ports.reserved_count(), 0);
        let status = instance.current_status(GlobalStatus::Healthy).await;
        assert_eq!(status.state, ServiceState::Stopped);

        // Second stop: no error, no state change.
        instance.stop().await;
        let status = instance.current_status(GlobalStatus::Healthy).await;
        assert_eq!(status.state, ServiceState::Stopped);
    }

    #[tokio::test]
    async fn suspend_parks_active_services_and_skips_settled_ones() {
        let ports = Arc::new(PortRegistry::new());
        let instance = ServiceInstance::new("api".to_string(), spec(), ports.clone());

        {
            let mut st = instance.state.lock().await;
            let port = ports.acquire_from(28180).expect("reserve");
            st.bound_port = Some(port);
            st.status = ServiceState::Degraded;
            st.start_time = Some(Utc::now());
        }

        instance.suspend("Suspended due to global kubectl access failure").await;
        let status = instance.current_status(GlobalStatus::NetworkFailure).await;
        assert_eq!(status.state, ServiceState::Suspended);
        assert_eq!(status.pid, None);
        assert!(status.start_time.is_none());
        assert_eq!(ports.reserved_count(), 0);

        // Suspending a suspended service keeps its message untouched.
        instance.suspend("another message").await;
        let status = instance.current_status(GlobalStatus::NetworkFailure).await;
        assert_eq!(
            status.status_message.as_deref(),
            Some("Suspended due to global kubectl access failure")
        );
    }

    #[tokio::test]
    async fn cooldown_blocks_start_and_reports_the_state() {
        let ports = Arc::new(PortRegistry::new());
        let instance = ServiceInstance::new("api".to_string(), spec(), ports);
        {
            let mut st = instance.state.lock().await;
            st.cooldown_until = Some(Utc::now() + TimeDelta::seconds(60));
            st.status = ServiceState::Failed;
        }

        assert!(instance.start().await.is_err());
        let status = instance.current_status(GlobalStatus::Healthy).await;
        assert_eq!(status.state, ServiceState::Cooldown);
        assert!(status.in_cooldown);
    }

    #[tokio::test]
    async fn status_message_set_and_clear() {
        let ports = Arc::new(PortRegistry::new());
        let instance = ServiceInstance::new("api".to_string(), spec(), ports);

        instance.set_status_message("Starting gRPC UI...").await;
        let status = instance.current_status(GlobalStatus::Healthy).await;
        assert_eq!(status.status_message.as_deref(), Some("Starting gRPC UI..."));

        instance.set_status_message("").await;
        let status = instance.current_status(GlobalStatus::Healthy).await;
        assert!(status.status_message.is_none());
    }
}

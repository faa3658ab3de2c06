use crate::classify::FailureKind;
use crate::kubectl;
use crate::service::ServiceInstance;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration as TimeDelta, Utc};
use kfwd_core::config::{Config, TunnelSpec};
use kfwd_core::plugin::{StatusSink, UiPlugin};
use kfwd_core::status::{FleetSnapshot, GlobalStatus, ServiceState};
use kfwd_utils::ports::PortRegistry;
use kfwd_utils::process;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Fleet-wide cooldown schedules, indexed by fail-count − 1 and clamped.
/// Expired credentials take minutes of human action to fix; network blips
/// deserve faster retries.
const AUTH_COOLDOWN_SECS: [i64; 3] = [300, 600, 1800];
const NETWORK_COOLDOWN_SECS: [i64; 3] = [30, 60, 120];

/// While the gate is unhealthy a re-probe is allowed this often, even inside
/// a cooldown window, so services are not suspended longer than necessary.
const GATE_RETRY_SECS: i64 = 5;

/// Pause between tearing down the old context's children and probing the
/// new context.
const CONTEXT_SETTLE: Duration = Duration::from_millis(500);

/// Stagger between service starts after a context change, to avoid a
/// thundering herd against the API server.
const START_STAGGER: Duration = Duration::from_millis(100);

fn cooldown_schedule(kind: FailureKind) -> &'static [i64; 3] {
    match kind {
        FailureKind::Auth => &AUTH_COOLDOWN_SECS,
        _ => &NETWORK_COOLDOWN_SECS,
    }
}

/// Fleet-wide cluster access verdict and its cooldown bookkeeping.
#[derive(Debug)]
struct GateState {
    healthy: bool,
    last_check: Option<DateTime<Utc>>,
    fail_count: u32,
    cooldown_until: Option<DateTime<Utc>>,
    last_failure: Option<FailureKind>,
}

impl GateState {
    fn new() -> Self {
        Self {
            // Optimistic until the first probe says otherwise.
            healthy: true,
            last_check: None,
            fail_count: 0,
            cooldown_until: None,
            last_failure: None,
        }
    }

    /// Whether the probe should run now. Inside a cooldown the answer is no
    /// while healthy; while unhealthy a probe is allowed every
    /// [`GATE_RETRY_SECS`] for fast recovery.
    fn should_probe(&self, now: DateTime<Utc>) -> bool {
        match self.cooldown_until {
            Some(until) if now < until => {
                if self.healthy {
                    return false;
                }
                self.last_check
                    .is_none_or(|last| now - last >= TimeDelta::seconds(GATE_RETRY_SECS))
            }
            _ => true,
        }
    }

    /// Records a classified failure and returns the cooldown length applied.
    fn note_failure(&mut self, kind: FailureKind, now: DateTime<Utc>) -> i64 {
        self.fail_count += 1;
        self.healthy = false;
        self.last_failure = Some(kind);

        let schedule = cooldown_schedule(kind);
        let index = usize::min(self.fail_count as usize - 1, schedule.len() - 1);
        let seconds = schedule[index];
        self.cooldown_until = Some(now + TimeDelta::seconds(seconds));
        seconds
    }

    /// Records a successful probe. Returns true if this was a recovery.
    fn note_success(&mut self) -> bool {
        let recovered = !self.healthy || self.fail_count > 0;
        self.healthy = true;
        self.fail_count = 0;
        self.cooldown_until = None;
        self.last_failure = None;
        recovered
    }

    /// Pessimistic reset after a context change: unhealthy until the next
    /// probe, which runs immediately.
    fn reset_for_context_change(&mut self) {
        self.healthy = false;
        self.fail_count = 0;
        self.cooldown_until = None;
        self.last_check = None;
    }

    fn global_status(&self) -> GlobalStatus {
        if self.healthy {
            return GlobalStatus::Healthy;
        }
        match self.last_failure {
            Some(FailureKind::Auth) => GlobalStatus::AuthFailure,
            _ => GlobalStatus::NetworkFailure,
        }
    }
}

/// Receiving ends of the manager's output channels. Both are single-slot;
/// the producer drops updates when the consumer falls behind.
pub struct FleetReceivers {
    pub status: mpsc::Receiver<FleetSnapshot>,
    pub context: mpsc::Receiver<String>,
}

/// Coordinates all tunnel instances: the monitoring tick, the global access
/// gate, context-change recovery, snapshot fan-out and UI plugins.
pub struct FleetManager {
    config: Config,
    specs: HashMap<String, TunnelSpec>,
    services: RwLock<HashMap<String, Arc<ServiceInstance>>>,
    plugins: Vec<Arc<dyn UiPlugin>>,
    ports: Arc<PortRegistry>,
    gate: Mutex<GateState>,
    kube_context: RwLock<String>,
    cancel: CancellationToken,
    status_tx: mpsc::Sender<FleetSnapshot>,
    context_tx: mpsc::Sender<String>,
}

impl FleetManager {
    /// Builds the manager. Plugins are registered here and never change.
    pub fn new(
        config: Config,
        ports: Arc<PortRegistry>,
        plugins: Vec<Arc<dyn UiPlugin>>,
    ) -> (Arc<Self>, FleetReceivers) {
        let (status_tx, status_rx) = mpsc::channel(1);
        let (context_tx, context_rx) = mpsc::channel(1);

        let specs: HashMap<String, TunnelSpec> = config
            .enabled_tunnels()
            .map(|(name, spec)| (name.clone(), spec.clone()))
            .collect();

        let manager = Arc::new(Self {
            config,
            specs,
            services: RwLock::new(HashMap::new()),
            plugins,
            ports,
            gate: Mutex::new(GateState::new()),
            kube_context: RwLock::new(String::new()),
            cancel: CancellationToken::new(),
            status_tx,
            context_tx,
        });

        (
            manager,
            FleetReceivers {
                status: status_rx,
                context: context_rx,
            },
        )
    }

    /// Creates one instance per enabled tunnel, runs the access gate once,
    /// starts (or suspends) everything and launches the monitoring loop.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.specs.is_empty() {
            anyhow::bail!("no enabled port-forward tunnels configured");
        }
        process::which("kubectl").context("kubectl not found on PATH")?;

        let sink: Arc<dyn StatusSink> = self.clone();
        for plugin in &self.plugins {
            plugin.set_status_sink(sink.clone());
        }

        if self.config.sweep_orphans {
            for (name, spec) in &self.specs {
                debug!("Sweeping for orphaned listeners on port {} ({})", spec.local_port, name);
                if let Err(e) = process::kill_listener_on_port(spec.local_port).await {
                    warn!("Orphan sweep on port {} failed: {:#}", spec.local_port, e);
                }
            }
        }

        let context = kubectl::current_context()
            .await
            .context("failed to determine current Kubernetes context")?;
        info!("Current Kubernetes context: {}", context);
        *self.kube_context.write().await = context;

        {
            let mut services = self.services.write().await;
            for (name, spec) in &self.specs {
                let instance = Arc::new(ServiceInstance::new(
                    name.clone(),
                    spec.clone(),
                    self.ports.clone(),
                ));
                services.insert(name.clone(), instance);
            }
        }

        // Gate before anything spawns: with broken cluster access there is
        // no point burning subprocesses and ports.
        info!("Checking global kubectl access before starting services");
        if self.check_gate().await {
            info!("Global access check passed - starting services");
            let mut failures = 0usize;
            for svc in self.services_snapshot().await {
                if let Err(e) = svc.start().await {
                    error!("Failed to start service {}: {:#}", svc.name(), e);
                    failures += 1;
                }
            }
            if failures > 0 {
                warn!("Failed to start {} services, continuing", failures);
            }
            info!("Initialized {} services", self.specs.len());
        } else {
            warn!("Global kubectl access failed at startup - services start suspended");
            for svc in self.services_snapshot().await {
                svc.suspend("Suspended due to global kubectl access failure at startup")
                    .await;
            }
            info!(
                "Initialized {} services (all suspended until cluster access recovers)",
                self.specs.len()
            );
        }

        self.publish_snapshot().await;
        self.spawn_monitor_loop();

        // Let the tunnels establish, then give the plugins a first look.
        let manager = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            if !manager.cancel.is_cancelled() {
                manager.monitor_services().await;
            }
        });

        Ok(())
    }

    fn spawn_monitor_loop(self: &Arc<Self>) {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(manager.config.monitoring_interval());
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = manager.cancel.cancelled() => break,
                    _ = tick.tick() => {
                        manager.monitor_services().await;
                        manager.watch_context().await;
                    }
                }
            }
        });
    }

    /// One monitoring pass: gate, suspend/resume, per-service health,
    /// restart scheduling, plugin reconciliation, snapshot publish.
    async fn monitor_services(self: &Arc<Self>) {
        if self.cancel.is_cancelled() {
            return;
        }

        if !self.check_gate().await {
            self.suspend_all().await;
            self.publish_snapshot().await;
            return;
        }

        if self.resume_suspended().await {
            info!("Global access recovered, resuming service operations");
        }

        let global = self.global_status().await;
        let mut snapshot = FleetSnapshot::new();

        for svc in self.services_snapshot().await {
            let status = svc.refresh_status(global).await;

            let restartable = matches!(
                status.state,
                ServiceState::Failed | ServiceState::Cooldown
            ) && !status.in_cooldown;
            if restartable {
                info!("Restarting failed service: {}", svc.name());
                let manager = self.clone();
                let svc = svc.clone();
                tokio::spawn(async move {
                    // The fleet may have shut down or lost cluster access
                    // between scheduling and now.
                    if manager.cancel.is_cancelled()
                        || manager.global_status().await != GlobalStatus::Healthy
                    {
                        return;
                    }
                    if let Err(e) = svc.restart().await {
                        error!("Failed to restart service {}: {:#}", svc.name(), e);
                    }
                });
            }

            snapshot.insert(svc.name().to_string(), status);
        }

        for plugin in &self.plugins {
            if plugin.is_enabled() {
                plugin.monitor(&snapshot, &self.specs).await;
            }
        }

        // Single-slot, drop on full: the observer is advisory.
        let _ = self.status_tx.try_send(snapshot);
    }

    /// Runs the cluster access probe, honoring the cooldown rules, and
    /// returns the resulting verdict.
    async fn check_gate(&self) -> bool {
        let mut gate = self.gate.lock().await;
        let now = Utc::now();

        if !gate.should_probe(now) {
            return gate.healthy;
        }

        let result = kubectl::check_cluster_access().await;
        gate.last_check = Some(now);

        match result {
            Ok(()) => {
                if gate.note_success() {
                    info!("Global kubectl access recovered");
                }
                true
            }
            Err(e) => {
                if gate.healthy {
                    warn!("Global kubectl access failed: {}", e);
                }
                let kind = e.kind();
                let seconds = gate.note_failure(kind, now);
                error!(
                    "Global access check failed ({:?} failure #{}), cooldown for {}s",
                    kind, gate.fail_count, seconds
                );
                false
            }
        }
    }

    /// Parks every active service. Settled services (Suspended, Stopped,
    /// Failed, Cooldown) are left alone, so running this twice is the same
    /// as running it once.
    async fn suspend_all(&self) {
        for svc in self.services_snapshot().await {
            svc.suspend("Suspended due to global kubectl access failure")
                .await;
        }
    }

    /// Marks every suspended service Reconnecting and schedules its restart.
    /// Returns true if anything was resumed. Concurrent restarts are fine;
    /// the port registry arbitrates collisions.
    async fn resume_suspended(self: &Arc<Self>) -> bool {
        let mut resumed = false;
        for svc in self.services_snapshot().await {
            let state = svc.current_status(GlobalStatus::Healthy).await.state;
            if state != ServiceState::Suspended {
                continue;
            }
            debug!("Resuming suspended service {}", svc.name());
            svc.mark_reconnecting("Resuming after global access recovery")
                .await;

            let manager = self.clone();
            let svc = svc.clone();
            tokio::spawn(async move {
                if manager.cancel.is_cancelled()
                    || manager.global_status().await != GlobalStatus::Healthy
                {
                    return;
                }
                match svc.restart().await {
                    Ok(()) => info!("Resumed service {}", svc.name()),
                    Err(e) => error!("Failed to resume service {}: {:#}", svc.name(), e),
                }
            });
            resumed = true;
        }
        resumed
    }

    /// Watches for kubectl context switches and re-publishes the context.
    async fn watch_context(self: &Arc<Self>) {
        let new_context = match kubectl::current_context().await {
            Ok(context) => context,
            Err(e) => {
                error!("Failed to get Kubernetes context: {:#}", e);
                return;
            }
        };

        let _ = self.context_tx.try_send(new_context.clone());

        let current = self.kube_context.read().await.clone();
        if new_context != current && !new_context.is_empty() {
            info!(
                "Kubernetes context changed from {} to {}, restarting all services",
                current, new_context
            );
            *self.kube_context.write().await = new_context;

            let manager = self.clone();
            tokio::spawn(async move {
                if manager.cancel.is_cancelled() {
                    return;
                }
                manager.restart_all().await;
            });
        }
    }

    /// Context-change recovery: tear down everything from the old context,
    /// let it settle, re-run the gate, and only then start fresh with a
    /// small stagger.
    async fn restart_all(self: &Arc<Self>) {
        info!("Context changed - tearing down all tunnels and recreating in the new context");

        {
            let mut gate = self.gate.lock().await;
            gate.reset_for_context_change();
        }

        let services = self.services_snapshot().await;

        // Companion helpers go first; they point at the old tunnels.
        for plugin in &self.plugins {
            if !plugin.is_enabled() {
                continue;
            }
            for svc in &services {
                if let Err(e) = plugin.stop_service(svc.name()).await {
                    warn!(
                        "Failed to stop {} helper for {}: {:#}",
                        plugin.name(),
                        svc.name(),
                        e
                    );
                }
            }
        }

        for svc in &services {
            svc.stop_for_reconnect("Reconnecting due to context change")
                .await;
        }

        tokio::time::sleep(CONTEXT_SETTLE).await;

        if !self.check_gate().await {
            warn!("New context has no cluster access - services stay suspended");
            for svc in &services {
                svc.suspend("Suspended due to global kubectl access failure after context change")
                    .await;
            }
            self.publish_snapshot().await;
            return;
        }

        info!("New context is accessible - starting all services fresh");
        for svc in &services {
            if self.cancel.is_cancelled() {
                return;
            }
            if let Err(e) = svc.start_counted().await {
                error!(
                    "Failed to start service {} in new context: {:#}",
                    svc.name(),
                    e
                );
            }
            tokio::time::sleep(START_STAGGER).await;
        }

        tokio::time::sleep(Duration::from_secs(2)).await;
        if self.global_status().await == GlobalStatus::Healthy {
            self.monitor_services().await;
        }
    }

    /// Graceful shutdown: cancel the root scope, stop plugin helpers, then
    /// stop every tunnel. The caller enforces the overall deadline.
    pub async fn stop(&self) {
        info!("Shutting down supervisor");
        self.cancel.cancel();

        for plugin in &self.plugins {
            if !plugin.is_enabled() {
                continue;
            }
            for name in self.specs.keys() {
                if let Err(e) = plugin.stop_service(name).await {
                    error!("Failed to stop {} helper for {}: {:#}", plugin.name(), name, e);
                }
            }
            if let Err(e) = plugin.disable().await {
                error!("Failed to disable {} plugin: {:#}", plugin.name(), e);
            }
        }

        for svc in self.services_snapshot().await {
            svc.stop().await;
        }
        info!("Stopped all port-forward services");
    }

    pub async fn kubernetes_context(&self) -> String {
        self.kube_context.read().await.clone()
    }

    pub async fn global_status(&self) -> GlobalStatus {
        self.gate.lock().await.global_status()
    }

    /// Clones the instance pointers under the fleet lock; per-service work
    /// then happens on the instance locks only.
    async fn services_snapshot(&self) -> Vec<Arc<ServiceInstance>> {
        self.services.read().await.values().cloned().collect()
    }

    async fn fleet_snapshot(&self) -> FleetSnapshot {
        let global = self.global_status().await;
        let mut snapshot = FleetSnapshot::new();
        for svc in self.services_snapshot().await {
            snapshot.insert(svc.name().to_string(), svc.current_status(global).await);
        }
        snapshot
    }

    async fn publish_snapshot(&self) {
        let _ = self.status_tx.try_send(self.fleet_snapshot().await);
    }
}

#[async_trait]
impl StatusSink for FleetManager {
    async fn update_status_message(&self, service: &str, message: &str) {
        let services = self.services.read().await;
        if let Some(svc) = services.get(service) {
            svc.set_status_message(message).await;
        }
    }
}

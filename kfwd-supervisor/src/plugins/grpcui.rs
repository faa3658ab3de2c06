use anyhow::{Context, Result};
use async_trait::async_trait;
use kfwd_core::config::{TunnelKind, TunnelSpec};
use kfwd_core::plugin::{StatusSink, UiPlugin};
use kfwd_core::status::{FleetSnapshot, ServiceState, ServiceStatus};
use kfwd_utils::ports::PortRegistry;
use kfwd_utils::{probe, process};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// UI ports are scanned upward from here.
const GRPCUI_PORT_BASE: u16 = 9200;

/// Runs one `grpcui` subprocess per rpc tunnel that is Running, serving a
/// browser UI against the forwarded port.
pub struct GrpcUiPlugin {
    inner: Arc<Inner>,
}

struct Inner {
    enabled: AtomicBool,
    ports: Arc<PortRegistry>,
    services: Mutex<HashMap<String, GrpcUiInstance>>,
    sink: StdMutex<Option<Arc<dyn StatusSink>>>,
}

struct GrpcUiInstance {
    pid: u32,
    ui_port: u16,
    log_file: PathBuf,
    running: bool,
}

fn qualifies(spec: &TunnelSpec, status: &ServiceStatus) -> bool {
    spec.kind == TunnelKind::Rpc && status.state == ServiceState::Running
}

impl GrpcUiPlugin {
    pub fn new(ports: Arc<PortRegistry>) -> Self {
        Self {
            inner: Arc::new(Inner {
                enabled: AtomicBool::new(false),
                ports,
                services: Mutex::new(HashMap::new()),
                sink: StdMutex::new(None),
            }),
        }
    }
}

impl Inner {
    async fn push_status(&self, name: &str, message: &str) {
        let sink = self.sink.lock().expect("sink poisoned").clone();
        if let Some(sink) = sink {
            sink.update_status_message(name, message).await;
        }
    }

    async fn start_instance(
        &self,
        name: &str,
        status: &ServiceStatus,
        spec: &TunnelSpec,
    ) -> Result<()> {
        if !self.enabled.load(Ordering::SeqCst) || !qualifies(spec, status) {
            return Ok(());
        }

        let mut services = self.services.lock().await;
        if let Some(existing) = services.get(name) {
            if existing.running {
                return Ok(());
            }
            // A dead instance keeps its reservation until cleaned up here.
            let stale = services.remove(name).expect("checked above");
            self.ports.release(stale.ui_port);
        }

        if !probe::check_port_quick(status.local_port).await {
            debug!(
                "gRPC service {} not yet accepting on port {}, will retry later",
                name, status.local_port
            );
            return Ok(());
        }

        let ui_port = self
            .ports
            .acquire_from(GRPCUI_PORT_BASE)
            .map_err(anyhow::Error::from)
            .context("failed to find a port for grpcui")?;

        self.push_status(name, "Starting gRPC UI...").await;

        let log_file =
            std::env::temp_dir().join(format!("kfwd_grpcui_{}.log", name.replace('-', "_")));
        debug!(
            "Starting gRPC UI for {}: connecting to localhost:{}, serving on port {}",
            name, status.local_port, ui_port
        );

        let pid = match spawn_grpcui(name, status.local_port, ui_port, &log_file).await {
            Ok(pid) => pid,
            Err(e) => {
                self.ports.release(ui_port);
                self.push_status(name, "gRPC UI failed to start").await;
                return Err(e.context(format!("failed to start grpcui for {name}")));
            }
        };

        info!(
            "Started gRPC UI for {} on port {} (PID {}, log: {})",
            name,
            ui_port,
            pid,
            log_file.display()
        );
        services.insert(
            name.to_string(),
            GrpcUiInstance {
                pid,
                ui_port,
                log_file,
                running: true,
            },
        );
        drop(services);

        // Catch instances that die right after exec (bad flags, port race).
        tokio::time::sleep(Duration::from_millis(100)).await;
        if process::is_process_running(pid) {
            self.push_status(name, "").await;
        } else {
            error!("gRPC UI process for {} died immediately after startup", name);
            if let Some(instance) = self.services.lock().await.get_mut(name) {
                instance.running = false;
            }
            self.push_status(name, "gRPC UI failed to start").await;
        }
        Ok(())
    }

    async fn stop_instance(&self, name: &str) -> Result<()> {
        let Some(instance) = self.services.lock().await.remove(name) else {
            return Ok(());
        };
        if instance.pid != 0 {
            if let Err(e) = process::kill_process_group(instance.pid) {
                warn!("Failed to kill gRPC UI process for {}: {:#}", name, e);
            }
        }
        self.ports.release(instance.ui_port);
        info!(
            "Stopped gRPC UI for {} (log: {})",
            name,
            instance.log_file.display()
        );
        Ok(())
    }
}

async fn spawn_grpcui(service: &str, target_port: u16, ui_port: u16, log_file: &Path) -> Result<u32> {
    let log = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_file)
        .with_context(|| format!("failed to open log file {}", log_file.display()))?;
    let log_err = log.try_clone().context("failed to clone log handle")?;

    let mut cmd = tokio::process::Command::new("grpcui");
    cmd.args([
        "-bind",
        "localhost",
        "-port",
        &ui_port.to_string(),
        "-plaintext",
        "-connect-fail-fast=false",
        "-connect-timeout",
        "5",
    ])
    .arg(format!("localhost:{target_port}"))
    .stdin(Stdio::null())
    .stdout(Stdio::from(log))
    .stderr(Stdio::from(log_err));
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd.spawn().context("failed to spawn grpcui")?;
    let pid = child
        .id()
        .context("grpcui exited before a PID was assigned")?;

    let name = service.to_string();
    tokio::spawn(async move {
        match child.wait().await {
            Ok(status) => debug!("grpcui[{}] exited: {}", name, status),
            Err(e) => debug!("grpcui[{}] wait failed: {}", name, e),
        }
    });

    Ok(pid)
}

#[async_trait]
impl UiPlugin for GrpcUiPlugin {
    fn name(&self) -> &'static str {
        "grpcui"
    }

    async fn enable(&self) -> Result<()> {
        process::which("grpcui").context(
            "grpcui not found in PATH. Install with: \
             go install github.com/fullstorydev/grpcui/cmd/grpcui@latest",
        )?;
        self.inner.enabled.store(true, Ordering::SeqCst);
        info!("gRPC UI plugin enabled");
        Ok(())
    }

    async fn disable(&self) -> Result<()> {
        let names: Vec<String> = self.inner.services.lock().await.keys().cloned().collect();
        for name in names {
            if let Err(e) = self.inner.stop_instance(&name).await {
                error!("Failed to stop gRPC UI for {}: {:#}", name, e);
            }
        }
        self.inner.enabled.store(false, Ordering::SeqCst);
        info!("gRPC UI plugin disabled");
        Ok(())
    }

    fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    async fn start_service(
        &self,
        name: &str,
        status: &ServiceStatus,
        spec: &TunnelSpec,
    ) -> Result<()> {
        self.inner.start_instance(name, status, spec).await
    }

    async fn stop_service(&self, name: &str) -> Result<()> {
        self.inner.stop_instance(name).await
    }

    async fn monitor(&self, snapshot: &FleetSnapshot, specs: &HashMap<String, TunnelSpec>) {
        if !self.is_enabled() {
            return;
        }

        for (name, status) in snapshot {
            let Some(spec) = specs.get(name) else { continue };
            if !qualifies(spec, status) {
                continue;
            }
            if self.inner.services.lock().await.contains_key(name) {
                continue;
            }
            let inner = self.inner.clone();
            let name = name.clone();
            let status = status.clone();
            let spec = spec.clone();
            tokio::spawn(async move {
                if let Err(e) = inner.start_instance(&name, &status, &spec).await {
                    error!("Failed to start gRPC UI for {}: {:#}", name, e);
                }
            });
        }

        let tracked: Vec<String> = self.inner.services.lock().await.keys().cloned().collect();
        for name in tracked {
            let still_running = snapshot
                .get(&name)
                .is_some_and(|status| status.state == ServiceState::Running);
            if !still_running {
                let inner = self.inner.clone();
                tokio::spawn(async move {
                    if let Err(e) = inner.stop_instance(&name).await {
                        error!("Failed to stop gRPC UI for {}: {:#}", name, e);
                    }
                });
            }
        }
    }

    fn set_status_sink(&self, sink: Arc<dyn StatusSink>) {
        *self.inner.sink.lock().expect("sink poisoned") = Some(sink);
    }

    async fn service_url(&self, name: &str) -> Option<String> {
        let services = self.inner.services.lock().await;
        services
            .get(name)
            .filter(|instance| instance.running)
            .map(|instance| format!("http://localhost:{}", instance.ui_port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use kfwd_core::status::GlobalStatus;

    fn spec(kind: TunnelKind) -> TunnelSpec {
        TunnelSpec {
            target: "service/api".to_string(),
            target_port: 9090,
            local_port: 9090,
            namespace: "default".to_string(),
            kind,
            swagger_path: None,
            api_path: None,
            disabled: false,
        }
    }

    fn status(state: ServiceState) -> ServiceStatus {
        ServiceStatus {
            name: "api".to_string(),
            state,
            local_port: 9090,
            pid: Some(1),
            start_time: Some(Utc::now()),
            restart_count: 0,
            last_error: None,
            status_message: None,
            in_cooldown: false,
            cooldown_until: None,
            global: GlobalStatus::Healthy,
        }
    }

    #[test]
    fn only_running_rpc_tunnels_qualify() {
        assert!(qualifies(&spec(TunnelKind::Rpc), &status(ServiceState::Running)));
        assert!(!qualifies(&spec(TunnelKind::Rest), &status(ServiceState::Running)));
        assert!(!qualifies(&spec(TunnelKind::Rpc), &status(ServiceState::Degraded)));
        assert!(!qualifies(&spec(TunnelKind::Rpc), &status(ServiceState::Suspended)));
    }

    #[tokio::test]
    async fn a_disabled_plugin_ignores_start_requests() {
        let plugin = GrpcUiPlugin::new(Arc::new(PortRegistry::new()));
        assert!(!plugin.is_enabled());
        plugin
            .start_service("api", &status(ServiceState::Running), &spec(TunnelKind::Rpc))
            .await
            .expect("no-op");
        assert!(plugin.service_url("api").await.is_none());
    }

    #[tokio::test]
    async fn stopping_an_unknown_service_is_a_no_op() {
        let plugin = GrpcUiPlugin::new(Arc::new(PortRegistry::new()));
        plugin.stop_service("nope").await.expect("no-op");
    }
}

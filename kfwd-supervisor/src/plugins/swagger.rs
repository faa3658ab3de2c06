use anyhow::{Context, Result};
use async_trait::async_trait;
use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, InspectContainerOptions,
    RemoveContainerOptions, StartContainerOptions,
};
use bollard::models::{HostConfig, PortBinding};
use bollard::Docker;
use kfwd_core::config::{TunnelKind, TunnelSpec};
use kfwd_core::plugin::{StatusSink, UiPlugin};
use kfwd_core::status::{FleetSnapshot, ServiceState, ServiceStatus};
use kfwd_utils::ports::PortRegistry;
use kfwd_utils::probe;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// UI ports are scanned upward from here.
const SWAGGER_PORT_BASE: u16 = 9100;

const SWAGGER_IMAGE: &str = "swaggerapi/swagger-ui";

const DEFAULT_API_PATH: &str = "api";

/// Runs one `swaggerapi/swagger-ui` container per rest tunnel that is
/// Running and declares a swagger path, pointing the UI at the forwarded
/// port.
pub struct SwaggerUiPlugin {
    inner: Arc<Inner>,
}

struct Inner {
    enabled: AtomicBool,
    docker: Mutex<Option<Docker>>,
    ports: Arc<PortRegistry>,
    services: Mutex<HashMap<String, SwaggerInstance>>,
    sink: StdMutex<Option<Arc<dyn StatusSink>>>,
}

struct SwaggerInstance {
    container_id: String,
    container_name: String,
    ui_port: u16,
    running: bool,
}

fn qualifies(spec: &TunnelSpec, status: &ServiceStatus) -> bool {
    spec.kind == TunnelKind::Rest
        && status.state == ServiceState::Running
        && spec.swagger_path.is_some()
}

fn container_name_for(service: &str) -> String {
    format!("kfwd-swagger-{}", service.replace('_', "-"))
}

fn swagger_url(status: &ServiceStatus, spec: &TunnelSpec) -> String {
    let api_path = spec.api_path.as_deref().unwrap_or(DEFAULT_API_PATH);
    let swagger_path = spec.swagger_path.as_deref().unwrap_or_default();
    format!(
        "http://localhost:{}/{}/{}",
        status.local_port, api_path, swagger_path
    )
}

impl SwaggerUiPlugin {
    pub fn new(ports: Arc<PortRegistry>) -> Self {
        Self {
            inner: Arc::new(Inner {
                enabled: AtomicBool::new(false),
                docker: Mutex::new(None),
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

    async fn docker(&self) -> Option<Docker> {
        self.docker.lock().await.clone()
    }

    async fn start_instance(
        &self,
        name: &str,
        status: &ServiceStatus,
        spec: &TunnelSpec,
    ) -> Result<()> {
        if !self.enabled.load(Ordering::SeqCst) || !qualifies(spec, status) {
            if spec.kind == TunnelKind::Rest && spec.swagger_path.is_none() {
                debug!("Skipping Swagger UI for {}: no swagger_path configured", name);
            }
            return Ok(());
        }
        let Some(docker) = self.docker().await else {
            return Ok(());
        };

        let mut services = self.services.lock().await;
        if let Some(existing) = services.get(name) {
            if existing.running {
                return Ok(());
            }
            let stale = services.remove(name).expect("checked above");
            let _ = docker
                .remove_container(
                    &stale.container_id,
                    Some(RemoveContainerOptions {
                        force: true,
                        ..Default::default()
                    }),
                )
                .await;
            self.ports.release(stale.ui_port);
        }

        if !probe::check_port_quick(status.local_port).await {
            debug!(
                "Port-forward for {} not ready on port {}, Swagger UI not started",
                name, status.local_port
            );
            return Ok(());
        }

        let ui_port = self
            .ports
            .acquire_from(SWAGGER_PORT_BASE)
            .map_err(anyhow::Error::from)
            .context("failed to find a port for Swagger UI")?;

        self.push_status(name, "Starting Swagger UI...").await;

        let container_name = container_name_for(name);
        let url = swagger_url(status, spec);
        info!(
            "Starting Swagger UI for {}: document at {}, serving on port {}",
            name, url, ui_port
        );

        // A container with this name may survive from a previous run.
        let _ = docker
            .remove_container(
                &container_name,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await;

        let host_config = HostConfig {
            port_bindings: Some(HashMap::from([(
                "8080/tcp".to_string(),
                Some(vec![PortBinding {
                    host_ip: Some("127.0.0.1".to_string()),
                    host_port: Some(ui_port.to_string()),
                }]),
            )])),
            ..Default::default()
        };
        let config = ContainerConfig {
            image: Some(SWAGGER_IMAGE.to_string()),
            env: Some(vec![format!("URL={url}")]),
            host_config: Some(host_config),
            ..Default::default()
        };

        let container_id = match self
            .create_and_start(&docker, &container_name, config)
            .await
        {
            Ok(id) => id,
            Err(e) => {
                self.ports.release(ui_port);
                self.push_status(name, "Swagger UI failed to start").await;
                return Err(e.context(format!("failed to start Swagger UI for {name}")));
            }
        };

        info!(
            "Started Swagger UI for {} on port {} (container {})",
            name, ui_port, container_id
        );
        services.insert(
            name.to_string(),
            SwaggerInstance {
                container_id: container_id.clone(),
                container_name,
                ui_port,
                running: true,
            },
        );
        drop(services);

        tokio::time::sleep(Duration::from_millis(500)).await;
        if self.container_running(&docker, &container_id).await {
            if probe::check_http(&format!("http://localhost:{ui_port}/")).await {
                debug!("Swagger UI for {} is serving on port {}", name, ui_port);
            }
            self.push_status(name, "").await;
        } else {
            error!(
                "Swagger UI container for {} died immediately after startup",
                name
            );
            if let Some(instance) = self.services.lock().await.get_mut(name) {
                instance.running = false;
            }
            self.push_status(name, "Swagger UI failed to start").await;
        }
        Ok(())
    }

    async fn create_and_start(
        &self,
        docker: &Docker,
        container_name: &str,
        config: ContainerConfig<String>,
    ) -> Result<String> {
        let created = docker
            .create_container(
                Some(CreateContainerOptions {
                    name: container_name.to_string(),
                    platform: None,
                }),
                config,
            )
            .await
            .context("failed to create Swagger UI container")?;
        docker
            .start_container(&created.id, None::<StartContainerOptions<String>>)
            .await
            .context("failed to start Swagger UI container")?;
        Ok(created.id)
    }

    async fn container_running(&self, docker: &Docker, container_id: &str) -> bool {
        match docker
            .inspect_container(container_id, None::<InspectContainerOptions>)
            .await
        {
            Ok(inspect) => inspect
                .state
                .and_then(|state| state.running)
                .unwrap_or(false),
            Err(_) => false,
        }
    }

    async fn stop_instance(&self, name: &str) -> Result<()> {
        let Some(instance) = self.services.lock().await.remove(name) else {
            return Ok(());
        };
        if let Some(docker) = self.docker().await {
            if let Err(e) = docker
                .remove_container(
                    &instance.container_id,
                    Some(RemoveContainerOptions {
                        force: true,
                        ..Default::default()
                    }),
                )
                .await
            {
                warn!(
                    "Failed to remove Swagger UI container {} for {}: {}",
                    instance.container_name, name, e
                );
            }
        }
        self.ports.release(instance.ui_port);
        info!("Stopped Swagger UI for {}", name);
        Ok(())
    }
}

#[async_trait]
impl UiPlugin for SwaggerUiPlugin {
    fn name(&self) -> &'static str {
        "swaggerui"
    }

    async fn enable(&self) -> Result<()> {
        let docker = Docker::connect_with_local_defaults()
            .context("docker not found or not running. Install and start Docker first")?;
        docker
            .ping()
            .await
            .context("docker daemon is not responding")?;
        *self.inner.docker.lock().await = Some(docker);
        self.inner.enabled.store(true, Ordering::SeqCst);
        info!("Swagger UI plugin enabled");
        Ok(())
    }

    async fn disable(&self) -> Result<()> {
        let names: Vec<String> = self.inner.services.lock().await.keys().cloned().collect();
        for name in names {
            if let Err(e) = self.inner.stop_instance(&name).await {
                error!("Failed to stop Swagger UI for {}: {:#}", name, e);
            }
        }
        self.inner.enabled.store(false, Ordering::SeqCst);
        info!("Swagger UI plugin disabled");
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
                    error!("Failed to start Swagger UI for {}: {:#}", name, e);
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
                        error!("Failed to stop Swagger UI for {}: {:#}", name, e);
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

    fn spec(kind: TunnelKind, swagger_path: Option<&str>) -> TunnelSpec {
        TunnelSpec {
            target: "service/api".to_string(),
            target_port: 80,
            local_port: 8080,
            namespace: "default".to_string(),
            kind,
            swagger_path: swagger_path.map(str::to_string),
            api_path: None,
            disabled: false,
        }
    }

    fn status(state: ServiceState) -> ServiceStatus {
        ServiceStatus {
            name: "api".to_string(),
            state,
            local_port: 8080,
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
    fn only_running_rest_tunnels_with_a_document_qualify() {
        let running = status(ServiceState::Running);
        assert!(qualifies(&spec(TunnelKind::Rest, Some("swagger.json")), &running));
        assert!(!qualifies(&spec(TunnelKind::Rest, None), &running));
        assert!(!qualifies(&spec(TunnelKind::Rpc, Some("swagger.json")), &running));
        assert!(!qualifies(
            &spec(TunnelKind::Rest, Some("swagger.json")),
            &status(ServiceState::Connecting)
        ));
    }

    #[test]
    fn url_composes_api_and_swagger_paths_with_defaults() {
        let running = status(ServiceState::Running);
        let with_api = TunnelSpec {
            api_path: Some("v2/api".to_string()),
            ..spec(TunnelKind::Rest, Some("configuration/swagger"))
        };
        assert_eq!(
            swagger_url(&running, &with_api),
            "http://localhost:8080/v2/api/configuration/swagger"
        );
        assert_eq!(
            swagger_url(&running, &spec(TunnelKind::Rest, Some("swagger.json"))),
            "http://localhost:8080/api/swagger.json"
        );
    }

    #[test]
    fn container_names_are_docker_safe() {
        assert_eq!(container_name_for("my_api"), "kfwd-swagger-my-api");
    }

    #[tokio::test]
    async fn a_disabled_plugin_ignores_start_requests() {
        let plugin = SwaggerUiPlugin::new(Arc::new(PortRegistry::new()));
        plugin
            .start_service(
                "api",
                &status(ServiceState::Running),
                &spec(TunnelKind::Rest, Some("swagger.json")),
            )
            .await
            .expect("no-op");
        assert!(plugin.service_url("api").await.is_none());
    }
}

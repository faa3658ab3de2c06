use crate::config::TunnelSpec;
use crate::status::{FleetSnapshot, ServiceStatus};
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// Callback a plugin uses to push a transient per-service status message
/// back into the supervisor. The fleet manager implements this and forwards
/// the message to the owning service instance.
#[async_trait]
pub trait StatusSink: Send + Sync {
    /// An empty message clears any previous one.
    async fn update_status_message(&self, service: &str, message: &str);
}

/// Capability contract for optional companion helpers (gRPC inspector,
/// Swagger viewer, ...). The supervisor makes no assumption about how a
/// plugin realizes its service: subprocess, container, or in-process.
///
/// Guarantees given to implementations: `monitor` is always called with a
/// consistent snapshot, and `stop_service` is called for every service
/// during supervisor shutdown. Plugins are responsible for their own
/// concurrency and must tolerate repeated calls.
#[async_trait]
pub trait UiPlugin: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Checks prerequisites (binary on PATH, docker reachable, ...) and
    /// arms the plugin. A disabled plugin ignores all other calls.
    async fn enable(&self) -> Result<()>;

    /// Tears down every helper this plugin started.
    async fn disable(&self) -> Result<()>;

    fn is_enabled(&self) -> bool;

    /// Starts the helper for one service, if the service qualifies.
    /// Non-qualifying services are skipped silently.
    async fn start_service(
        &self,
        name: &str,
        status: &ServiceStatus,
        spec: &TunnelSpec,
    ) -> Result<()>;

    /// Stops the helper for one service. A no-op if none is running.
    async fn stop_service(&self, name: &str) -> Result<()>;

    /// Reconciles helpers against the current fleet snapshot: starts
    /// helpers for newly-qualifying services, stops them for services that
    /// left Running.
    async fn monitor(&self, snapshot: &FleetSnapshot, specs: &HashMap<String, TunnelSpec>);

    /// Registers the callback used for transient status messages.
    fn set_status_sink(&self, sink: Arc<dyn StatusSink>);

    /// URL of the helper's UI for a service, if one is up.
    async fn service_url(&self, name: &str) -> Option<String>;
}

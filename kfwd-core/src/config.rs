use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Kind tag for a tunnel. Only used to decide which UI plugins apply to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelKind {
    Web,
    Rest,
    Rpc,
    Other,
}

/// A single port-forward tunnel declaration.
///
/// # Example
/// ```toml
/// [tunnels.api]
/// target = "service/api"
/// target_port = 80
/// local_port = 8080
/// namespace = "default"
/// type = "rest"
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelSpec {
    /// Kubernetes resource to forward to, e.g. `service/api` or `deployment/worker`.
    pub target: String,
    /// Port exposed by the target inside the cluster.
    pub target_port: u16,
    /// Desired local port. May be reassigned at runtime if it is taken.
    pub local_port: u16,
    /// Namespace the target lives in.
    pub namespace: String,
    /// Kind tag driving UI plugins.
    #[serde(rename = "type", default = "TunnelKind::default_kind")]
    pub kind: TunnelKind,
    /// Path fragment of the swagger document, relative to `api_path`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub swagger_path: Option<String>,
    /// API path fragment used when composing the Swagger UI URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_path: Option<String>,
    /// Disabled tunnels are kept in the catalog but never started.
    #[serde(default)]
    pub disabled: bool,
}

impl TunnelKind {
    fn default_kind() -> Self {
        TunnelKind::Other
    }
}

/// Root configuration for the supervisor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Tunnel catalog, keyed by logical service name.
    #[serde(default)]
    pub tunnels: HashMap<String, TunnelSpec>,
    /// Cadence of the monitoring tick, in seconds.
    #[serde(default = "default_monitoring_interval_secs")]
    pub monitoring_interval_secs: u64,
    /// Kill any process found listening on a configured local port at startup.
    /// Off by default: it reaps zombies from a crashed run, but it kills
    /// whatever holds the port.
    #[serde(default)]
    pub sweep_orphans: bool,
}

fn default_monitoring_interval_secs() -> u64 {
    1
}

impl Config {
    /// Parses a configuration document. The supervisor core never reads
    /// files itself; the binary loads the document and hands it over.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Config = toml::from_str(raw).context("failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn monitoring_interval(&self) -> Duration {
        Duration::from_secs(self.monitoring_interval_secs.max(1))
    }

    /// Tunnels that should actually be supervised.
    pub fn enabled_tunnels(&self) -> impl Iterator<Item = (&String, &TunnelSpec)> {
        self.tunnels.iter().filter(|(_, spec)| !spec.disabled)
    }

    pub fn validate(&self) -> Result<()> {
        if self.enabled_tunnels().count() == 0 {
            anyhow::bail!("configuration declares no enabled tunnels");
        }
        for (name, spec) in &self.tunnels {
            if spec.local_port == 0 {
                anyhow::bail!("tunnel {name}: local_port must be in 1..65535");
            }
            if spec.target_port == 0 {
                anyhow::bail!("tunnel {name}: target_port must be in 1..65535");
            }
            if spec.target.is_empty() {
                anyhow::bail!("tunnel {name}: target must not be empty");
            }
            if spec.namespace.is_empty() {
                anyhow::bail!("tunnel {name}: namespace must not be empty");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_minimal_catalog() {
        let raw = r#"
[tunnels.api]
target = "service/api"
target_port = 80
local_port = 8080
namespace = "default"
type = "rest"
swagger_path = "configuration/swagger"

[tunnels.worker]
target = "deployment/worker"
target_port = 9090
local_port = 9090
namespace = "jobs"
type = "rpc"
disabled = true
"#;
        let config = Config::from_toml_str(raw).expect("parse");
        assert_eq!(config.tunnels.len(), 2);
        assert_eq!(config.monitoring_interval(), Duration::from_secs(1));
        assert!(!config.sweep_orphans);

        let api = &config.tunnels["api"];
        assert_eq!(api.kind, TunnelKind::Rest);
        assert_eq!(api.local_port, 8080);
        assert_eq!(api.swagger_path.as_deref(), Some("configuration/swagger"));

        let enabled: Vec<_> = config.enabled_tunnels().map(|(n, _)| n.as_str()).collect();
        assert_eq!(enabled, vec!["api"]);
    }

    #[test]
    fn kind_defaults_to_other() {
        let raw = r#"
[tunnels.db]
target = "service/db"
target_port = 5432
local_port = 5432
namespace = "default"
"#;
        let config = Config::from_toml_str(raw).expect("parse");
        assert_eq!(config.tunnels["db"].kind, TunnelKind::Other);
    }

    #[test]
    fn rejects_an_empty_catalog() {
        assert!(Config::from_toml_str("").is_err());
    }

    #[test]
    fn rejects_a_catalog_where_everything_is_disabled() {
        let raw = r#"
[tunnels.api]
target = "service/api"
target_port = 80
local_port = 8080
namespace = "default"
disabled = true
"#;
        assert!(Config::from_toml_str(raw).is_err());
    }

    #[test]
    fn rejects_port_zero() {
        let raw = r#"
[tunnels.api]
target = "service/api"
target_port = 80
local_port = 0
namespace = "default"
"#;
        assert!(Config::from_toml_str(raw).is_err());
    }
}

use crate::classify::{self, FailureKind};
use anyhow::{Context, Result};
use kfwd_utils::process::apply_kubeconfig_env;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

const CONTEXT_DEADLINE: Duration = Duration::from_secs(5);
const ACCESS_DEADLINE: Duration = Duration::from_secs(20);

/// Cluster access probe failure, already classified.
#[derive(Debug, thiserror::Error)]
pub enum AccessError {
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("network connectivity failed: {0}")]
    Network(String),
}

impl AccessError {
    pub fn kind(&self) -> FailureKind {
        match self {
            AccessError::Auth(_) => FailureKind::Auth,
            AccessError::Network(_) => FailureKind::Network,
        }
    }
}

/// Returns the current kubectl context, bounded by a 5 second deadline.
pub async fn current_context() -> Result<String> {
    let mut cmd = Command::new("kubectl");
    cmd.args(["config", "current-context"])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    apply_kubeconfig_env(&mut cmd);

    let output = tokio::time::timeout(CONTEXT_DEADLINE, cmd.output())
        .await
        .context("kubectl config current-context timed out")?
        .context("failed to run kubectl config current-context")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!("kubectl config current-context failed: {}", stderr.trim());
    }

    let context = String::from_utf8_lossy(&output.stdout).trim().to_string();
    debug!("Current kubectl context: {}", context);
    Ok(context)
}

/// Lightweight cluster connectivity test used by the global access gate:
/// `kubectl get nodes` with a 15 second server-side timeout under a 20
/// second local deadline. Failures are classified by keyword; anything
/// unrecognized counts as a network failure.
pub async fn check_cluster_access() -> Result<(), AccessError> {
    let mut cmd = Command::new("kubectl");
    cmd.args(["get", "nodes", "--request-timeout=15s"])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped());
    apply_kubeconfig_env(&mut cmd);

    let output = match tokio::time::timeout(ACCESS_DEADLINE, cmd.output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            return Err(AccessError::Network(format!(
                "failed to run kubectl get nodes: {e}"
            )))
        }
        Err(_) => {
            return Err(AccessError::Network(
                "kubectl get nodes timed out".to_string(),
            ))
        }
    };

    if output.status.success() {
        debug!("Global access check successful");
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    let combined = format!("{} {}", output.status, stderr);
    debug!("Global access check failed: {}", combined);

    match classify::classify(&combined) {
        FailureKind::Auth => Err(AccessError::Auth(stderr)),
        _ => Err(AccessError::Network(stderr)),
    }
}

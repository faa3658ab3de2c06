use anyhow::{Context, Result};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

/// `--request-timeout` handed to every port-forward subprocess.
pub const PORT_FORWARD_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Makes kubectl invocations deterministic regardless of shell state: an
/// ambient `KUBECONFIG` is inherited, otherwise `~/.kube/config` is injected.
pub fn apply_kubeconfig_env(cmd: &mut Command) {
    if std::env::var_os("KUBECONFIG").is_some() {
        return;
    }
    if let Some(dirs) = directories::UserDirs::new() {
        let kubeconfig = dirs.home_dir().join(".kube").join("config");
        cmd.env("KUBECONFIG", kubeconfig);
    }
}

/// Spawns `kubectl port-forward` in an isolated process group and returns
/// the child PID. Stdout and stderr are streamed line-by-line into the log,
/// tagged with the service name, and the child is reaped in a background
/// task so no zombie remains.
pub async fn spawn_port_forward(
    service: &str,
    namespace: &str,
    target: &str,
    local_port: u16,
    target_port: u16,
    request_timeout: Duration,
) -> Result<u32> {
    let mut cmd = Command::new("kubectl");
    cmd.arg("port-forward")
        .arg("-n")
        .arg(namespace)
        .arg(target)
        .arg(format!("{local_port}:{target_port}"))
        .arg(format!("--request-timeout={}s", request_timeout.as_secs()))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    apply_kubeconfig_env(&mut cmd);

    // The child becomes its own group leader so one signal to the negative
    // PID terminates kubectl and every helper it forks.
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd.spawn().context("failed to start kubectl port-forward")?;
    let pid = child
        .id()
        .context("kubectl port-forward exited before a PID was assigned")?;

    if let Some(stdout) = child.stdout.take() {
        spawn_output_logger(service.to_string(), stdout, false);
    }
    if let Some(stderr) = child.stderr.take() {
        spawn_output_logger(service.to_string(), stderr, true);
    }

    let reaper_name = service.to_string();
    tokio::spawn(async move {
        match child.wait().await {
            Ok(status) => debug!("kubectl[{}] exited: {}", reaper_name, status),
            Err(e) => debug!("kubectl[{}] wait failed: {}", reaper_name, e),
        }
    });

    Ok(pid)
}

fn spawn_output_logger<R>(service: String, reader: R, is_err: bool)
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if is_err {
                        warn!("kubectl[{}] {}", service, line);
                    } else {
                        debug!("kubectl[{}] {}", service, line);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    debug!("kubectl[{}] output read error: {}", service, e);
                    break;
                }
            }
        }
    });
}

/// Signal-0 style liveness probe.
#[cfg(unix)]
pub fn is_process_running(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    if pid == 0 {
        return false;
    }
    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };
    kill(Pid::from_raw(pid), None).is_ok()
}

#[cfg(windows)]
pub fn is_process_running(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    let output = std::process::Command::new("tasklist")
        .args(["/FI", &format!("PID eq {pid}"), "/FO", "CSV", "/NH"])
        .output();
    match output {
        // With /NH the output is a single CSV row iff the process exists.
        Ok(out) => String::from_utf8_lossy(&out.stdout).contains(&format!("\"{pid}\"")),
        Err(_) => false,
    }
}

/// Terminates a whole process group: SIGTERM to the negative PID, escalating
/// to SIGKILL if that fails. A group that is already gone counts as success.
#[cfg(unix)]
pub fn kill_process_group(pid: u32) -> Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let pid = i32::try_from(pid).context("PID out of range")?;
    if pid <= 0 {
        anyhow::bail!("invalid PID: {pid}");
    }

    let group = Pid::from_raw(-pid);
    match kill(group, Signal::SIGTERM) {
        Ok(()) => Ok(()),
        Err(Errno::ESRCH) => Ok(()),
        Err(_) => match kill(group, Signal::SIGKILL) {
            Ok(()) => Ok(()),
            Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(anyhow::anyhow!("failed to kill process group {pid}: {e}")),
        },
    }
}

/// Tree-kill on Windows. taskkill exit code 128 means the process was
/// already gone, which counts as success.
#[cfg(windows)]
pub fn kill_process_group(pid: u32) -> Result<()> {
    if pid == 0 {
        anyhow::bail!("invalid PID: {pid}");
    }
    let status = std::process::Command::new("taskkill")
        .args(["/F", "/T", "/PID", &pid.to_string()])
        .status()
        .context("failed to run taskkill")?;
    if status.success() || status.code() == Some(128) {
        Ok(())
    } else {
        anyhow::bail!("taskkill /T /PID {pid} failed with {status}")
    }
}

/// Finds and kills any process currently listening on a local TCP port.
/// Used at startup to reap port-forward zombies left by a crashed run.
#[cfg(unix)]
pub async fn kill_listener_on_port(port: u16) -> Result<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let output = Command::new("lsof")
        .arg("-ti")
        .arg(format!("tcp:{port}"))
        .output()
        .await;
    let Ok(output) = output else {
        // No lsof on this host; nothing we can sweep.
        return Ok(());
    };
    if output.stdout.is_empty() {
        return Ok(());
    }

    let mut killed = false;
    for line in String::from_utf8_lossy(&output.stdout).lines() {
        let Ok(pid) = line.trim().parse::<i32>() else {
            continue;
        };
        if pid <= 0 {
            continue;
        }
        debug!("Killing listener on port {} (PID {})", port, pid);
        let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);
        killed = true;
    }

    if killed {
        // Give the OS a moment to release the port.
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
    Ok(())
}

#[cfg(windows)]
pub async fn kill_listener_on_port(port: u16) -> Result<()> {
    let output = Command::new("cmd")
        .args([
            "/C",
            &format!("netstat -ano | findstr \"LISTENING\" | findstr \":{port} \""),
        ])
        .output()
        .await;
    let Ok(output) = output else {
        return Ok(());
    };
    if output.stdout.is_empty() {
        return Ok(());
    }

    let mut killed = std::collections::HashSet::new();
    for line in String::from_utf8_lossy(&output.stdout).lines() {
        let Some(pid) = line.split_whitespace().last() else {
            continue;
        };
        let Ok(pid) = pid.parse::<u32>() else {
            continue;
        };
        if pid == 0 || !killed.insert(pid) {
            continue;
        }
        debug!("Killing listener on port {} (PID {})", port, pid);
        let _ = std::process::Command::new("taskkill")
            .args(["/F", "/PID", &pid.to_string()])
            .status();
    }

    if !killed.is_empty() {
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
    Ok(())
}

/// Resolves a binary against PATH without running it.
pub fn which(bin: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path) {
        let candidate = dir.join(bin);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}

use chrono::Utc;
use kfwd_core::status::FleetSnapshot;
use kfwd_supervisor::FleetReceivers;

/// Minimal status consumer: renders a compact table to stdout whenever the
/// fleet visibly changes. The supervisor never waits on this task; snapshots
/// it misses are simply dropped by the single-slot channel.
pub fn spawn(receivers: FleetReceivers) -> tokio::task::JoinHandle<()> {
    let FleetReceivers {
        mut status,
        mut context,
    } = receivers;

    tokio::spawn(async move {
        let mut kube_context = String::new();
        let mut last_digest = String::new();
        loop {
            tokio::select! {
                maybe = context.recv() => match maybe {
                    Some(ctx) => {
                        if ctx != kube_context {
                            kube_context = ctx;
                            last_digest.clear();
                        }
                    }
                    None => break,
                },
                maybe = status.recv() => match maybe {
                    Some(snapshot) => render(&snapshot, &kube_context, &mut last_digest),
                    None => break,
                },
            }
        }
    })
}

fn render(snapshot: &FleetSnapshot, kube_context: &str, last_digest: &mut String) {
    let mut names: Vec<&String> = snapshot.keys().collect();
    names.sort();

    let digest = names
        .iter()
        .map(|name| {
            let status = &snapshot[*name];
            format!(
                "{}={}:{}:{}:{}",
                name,
                status.state,
                status.local_port,
                status.global,
                status.status_message.as_deref().unwrap_or("")
            )
        })
        .collect::<Vec<_>>()
        .join(";");
    if digest == *last_digest {
        return;
    }
    *last_digest = digest;

    println!();
    println!("=== kfwd status (context: {kube_context}) ===");
    println!(
        "{:<25} {:<12} {:<7} {:<8} {:<10} {}",
        "SERVICE", "STATUS", "LOCAL", "PID", "UPTIME", "DETAIL"
    );
    let now = Utc::now();
    for name in names {
        let status = &snapshot[name];
        let uptime = status.uptime(now).map(format_uptime).unwrap_or_default();
        let detail = status
            .status_message
            .as_deref()
            .or(status.last_error.as_deref())
            .unwrap_or("");
        println!(
            "{:<25} {:<12} {:<7} {:<8} {:<10} {}",
            name,
            status.state.to_string(),
            status.local_port,
            status.pid.map_or_else(|| "-".to_string(), |pid| pid.to_string()),
            uptime,
            detail
        );
    }
}

fn format_uptime(uptime: chrono::Duration) -> String {
    let secs = uptime.num_seconds().max(0);
    if secs >= 3600 {
        format!("{}h{:02}m", secs / 3600, (secs % 3600) / 60)
    } else if secs >= 60 {
        format!("{}m{:02}s", secs / 60, secs % 60)
    } else {
        format!("{secs}s")
    }
}

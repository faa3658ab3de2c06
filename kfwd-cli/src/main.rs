use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use kfwd_core::config::Config;
use kfwd_core::plugin::UiPlugin;
use kfwd_supervisor::plugins::{GrpcUiPlugin, SwaggerUiPlugin};
use kfwd_supervisor::FleetManager;
use kfwd_utils::ports::PortRegistry;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

mod consumer;
mod logging;

/// Graceful-stop budget; past it the process exits even if a subprocess
/// still lingers.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "kfwd")]
#[command(about = "Supervise many concurrent kubectl port-forward tunnels", long_about = None)]
struct Cli {
    /// Enable gRPC UI instances for rpc tunnels
    #[arg(long)]
    grpcui: bool,

    /// Enable Swagger UI containers for rest tunnels
    #[arg(long)]
    swaggerui: bool,

    /// Write logs to a file (default: logs are discarded to keep stdout clean)
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Path to the tunnel configuration file
    #[arg(long, default_value = "kfwd.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Print version information
    Version,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Some(Commands::Version) = cli.command {
        println!("kfwd {}", env!("CARGO_PKG_VERSION"));
        return;
    }

    if let Err(e) = run(cli).await {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    logging::init(cli.log_file.as_deref())?;

    let raw = std::fs::read_to_string(&cli.config)
        .with_context(|| format!("failed to read {}", cli.config.display()))?;
    let config = Config::from_toml_str(&raw)?;
    info!("Starting kfwd with {} tunnels", config.tunnels.len());

    let ports = Arc::new(PortRegistry::new());

    let mut plugins: Vec<Arc<dyn UiPlugin>> = Vec::new();
    if cli.grpcui {
        let plugin = GrpcUiPlugin::new(ports.clone());
        match plugin.enable().await {
            Ok(()) => plugins.push(Arc::new(plugin)),
            Err(e) => warn!("Failed to enable gRPC UI: {:#}", e),
        }
    }
    if cli.swaggerui {
        let plugin = SwaggerUiPlugin::new(ports.clone());
        match plugin.enable().await {
            Ok(()) => plugins.push(Arc::new(plugin)),
            Err(e) => warn!("Failed to enable Swagger UI: {:#}", e),
        }
    }

    let (manager, receivers) = FleetManager::new(config, ports, plugins);
    manager
        .start()
        .await
        .context("failed to start port forwarding")?;

    let consumer = consumer::spawn(receivers);

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("Received shutdown signal, stopping services...");

    match tokio::time::timeout(SHUTDOWN_DEADLINE, manager.stop()).await {
        Ok(()) => info!("Shutdown complete"),
        Err(_) => {
            error!("Shutdown timed out, forcing exit");
            std::process::exit(1);
        }
    }

    consumer.abort();
    Ok(())
}

//! iaptun CLI - Open IAP tunnels to VM instances
//!
//! Opens a local tunnel to a port on a VM instance and keeps it open until
//! Ctrl+C.

mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use config::ConfigManager;
use iaptun_client::{
    Destination, HelperProcessFactory, PortFinder, RelayListenerFactory, TunnelBroker,
    TunnelConfig, TunnelEvent, TunnelFactory,
};
use iaptun_transport::DirectTransport;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// iaptun - Open IAP tunnels to VM instances
#[derive(Parser, Debug)]
#[command(name = "iaptun")]
#[command(about = "iaptun - Open IAP tunnels to VM instances")]
#[command(version)]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Open a tunnel and keep it open until Ctrl+C
    #[command(long_about = r#"
Open a tunnel from a local port to a port on a VM instance. The local port
is printed once the tunnel is up; point your RDP or SSH client at
localhost:<port>. Press Ctrl+C to close the tunnel.

EXAMPLES:
  # RDP to a Windows VM through the Cloud SDK helper
  iaptun connect --project my-project --zone us-central1-a \
    --instance win-1 --port 3389

  # SSH over a direct connection (VPN or peered network)
  iaptun connect --project my-project --zone us-central1-a \
    --instance vm-1 --port 22 --strategy direct

ENVIRONMENT VARIABLES:
  IAPTUN_PROJECT   Project ID
  IAPTUN_ZONE      Zone of the instance
    "#)]
    Connect {
        /// Project ID
        #[arg(long, env = "IAPTUN_PROJECT")]
        project: String,

        /// Zone of the instance (e.g., us-central1-a)
        #[arg(long, env = "IAPTUN_ZONE")]
        zone: String,

        /// Instance name
        #[arg(long)]
        instance: String,

        /// Remote port on the instance
        #[arg(long, default_value_t = iaptun_proto::RDP_PORT)]
        port: u16,

        /// How the tunnel is opened
        #[arg(long, value_enum, default_value = "helper")]
        strategy: Strategy,

        /// Connect timeout in seconds (defaults to the configured value)
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Show or change the stored configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Print the effective configuration
    Show,
    /// Set the Cloud SDK command used to start tunnels
    SetHelper {
        /// Program name or path (e.g., gcloud)
        program: String,
    },
    /// Set the default connect timeout in seconds
    SetTimeout { seconds: u64 },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum Strategy {
    /// Run `gcloud compute start-iap-tunnel`
    Helper,
    /// Listen locally and connect straight to the instance's internal DNS name
    Direct,
}

/// Setup logging with the specified log level
fn setup_logging(verbose: bool) {
    let log_level = if verbose { "debug" } else { "info" };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

fn build_factory(strategy: Strategy, config: &TunnelConfig) -> Box<dyn TunnelFactory> {
    let ports = PortFinder::system(config.port_range());
    match strategy {
        Strategy::Helper => Box::new(HelperProcessFactory::from_config(config, ports)),
        Strategy::Direct => Box::new(RelayListenerFactory::new(DirectTransport::zonal_dns(), ports)),
    }
}

async fn log_events(mut events: broadcast::Receiver<TunnelEvent>) {
    loop {
        match events.recv().await {
            Ok(TunnelEvent::Opened {
                destination,
                local_port,
            }) => debug!(destination = %destination, local_port, "Tunnel opened"),
            Ok(TunnelEvent::Closed { destination }) => {
                debug!(destination = %destination, "Tunnel closed")
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Missed tunnel events")
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn run_connect(
    destination: Destination,
    strategy: Strategy,
    timeout: Option<u64>,
    config: TunnelConfig,
) -> Result<()> {
    let timeout = timeout
        .map(Duration::from_secs)
        .unwrap_or(config.connect_timeout);

    let broker = TunnelBroker::from_config(build_factory(strategy, &config), &config);
    tokio::spawn(log_events(broker.subscribe()));

    info!("Opening tunnel to {} ({:?})", destination, strategy);

    let handle = broker
        .connect(&destination, timeout)
        .await
        .with_context(|| format!("Failed to open tunnel to {}", destination))?;

    println!("{}", handle.local_port());
    info!(
        "Tunnel ready: {} -> {}",
        handle.local_endpoint(),
        destination
    );
    if let Some(pid) = handle.process_id() {
        info!("Helper process: {}", pid);
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;
    info!("Received Ctrl+C, shutting down...");

    let stats = handle.statistics();
    info!(
        "Transferred {} bytes out, {} bytes in over {} connection(s)",
        stats.bytes_transmitted, stats.bytes_received, stats.connections
    );

    broker.close_all().context("Failed to close tunnels")?;
    Ok(())
}

fn run_config(command: ConfigCommands, manager: &ConfigManager) -> Result<()> {
    match command {
        ConfigCommands::Show => {
            let config = manager.load()?;
            println!("# {}", manager.path().display());
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        ConfigCommands::SetHelper { program } => {
            manager.set_helper_program(program.clone())?;
            println!("Helper program set to {}", program);
        }
        ConfigCommands::SetTimeout { seconds } => {
            manager.set_connect_timeout(Duration::from_secs(seconds))?;
            println!("Connect timeout set to {}s", seconds);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    let manager = ConfigManager::new()?;

    match cli.command {
        Commands::Connect {
            project,
            zone,
            instance,
            port,
            strategy,
            timeout,
        } => {
            let config = manager.load()?;
            let destination = Destination::new(project, zone, instance, port);

            if let Err(e) = run_connect(destination, strategy, timeout, config).await {
                error!("{:#}", e);
                return Err(e);
            }
        }
        Commands::Config { command } => run_config(command, &manager)?,
    }

    Ok(())
}

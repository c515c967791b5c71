//! Per-node agent binary

use anyhow::Context;
use clap::{Parser, Subcommand};
use nodeherd::agent::Agent;
use nodeherd::common::Config;
use nodeherd::store::{EtcdStore, KvStore};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "nodeherd-agent")]
#[command(about = "nodeherd per-node agent: announce, converge, fail over on exit")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the agent
    Run {
        /// Config file (TOML)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Coordination store endpoints (comma-separated)
        #[arg(long = "etcd", value_delimiter = ',')]
        etcd: Vec<String>,

        /// Base key for this service in the store
        #[arg(long)]
        service_path: Option<String>,

        /// Machine identity to announce; discovered when omitted
        #[arg(long)]
        ip: Option<String>,

        /// Heartbeat period in seconds
        #[arg(long)]
        heartbeat: Option<u64>,

        /// Log intended cluster operations without invoking them
        #[arg(long)]
        what_if: bool,

        /// Log level (trace, debug, info, warn, error)
        #[arg(long, default_value = "info")]
        log_level: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            etcd,
            service_path,
            ip,
            heartbeat,
            what_if,
            log_level,
        } => {
            tracing_subscriber::registry()
                .with(
                    tracing_subscriber::EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| log_level.clone().into()),
                )
                .with(tracing_subscriber::fmt::layer())
                .init();

            // File and env first, CLI flags override.
            let mut config = Config::load(config.as_deref())?;
            if !etcd.is_empty() {
                config.store.endpoints = etcd;
            }
            if let Some(path) = service_path {
                config.store.service_path = path;
            }
            if let Some(secs) = heartbeat {
                config.agent.heartbeat_secs = secs;
            }
            if what_if {
                config.agent.what_if = true;
            }

            let machine = match config.agent.ip_address.clone().or(ip) {
                Some(machine) => machine,
                None => discover_identity().context("machine identity discovery failed")?,
            };
            tracing::info!("machine ID: {}", machine);

            let store: Arc<dyn KvStore> =
                Arc::new(EtcdStore::new(config.store.endpoints.clone())?);
            let agent = Agent::new(store, config, machine)?;

            let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
            tokio::spawn(async move {
                if let Err(e) = shutdown_signal().await {
                    tracing::warn!("signal handler failed: {}", e);
                }
                let _ = shutdown_tx.send(true);
            });

            agent.run(shutdown_rx).await?;
        }
    }

    Ok(())
}

/// Outbound-interface address, without sending a packet: connecting a UDP
/// socket only asks the OS to pick a route.
fn discover_identity() -> anyhow::Result<String> {
    let socket = std::net::UdpSocket::bind("0.0.0.0:0")?;
    socket.connect("8.8.8.8:53")?;
    Ok(socket.local_addr()?.ip().to_string())
}

async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        let mut term =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    tokio::signal::ctrl_c().await?;
    Ok(())
}

//! Standalone scheduler binary
//!
//! Normally the scheduler runs inside whichever agent wins the lock, but a
//! deployment can pin the role to a dedicated process instead. This binary
//! acquires the scheduler lock, runs the reconciliation loop for as long as
//! the lease renews, and exits non-zero the moment the mandate is lost.

use clap::{Parser, Subcommand};
use nodeherd::common::Config;
use nodeherd::scheduler::{ClusterRegistry, DistributedLock, Scheduler};
use nodeherd::store::{EtcdStore, KvStore};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "nodeherd-sched")]
#[command(about = "nodeherd standalone scheduler")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Acquire the scheduler lock and run the reconciliation loop
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

        /// Reconciliation tick interval in seconds
        #[arg(long)]
        interval: Option<u64>,

        /// Clear persisted states before starting
        #[arg(long)]
        reset: bool,

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
            interval,
            reset,
            log_level,
        } => {
            tracing_subscriber::registry()
                .with(
                    tracing_subscriber::EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| log_level.clone().into()),
                )
                .with(tracing_subscriber::fmt::layer())
                .init();

            let mut config = Config::load(config.as_deref())?;
            if !etcd.is_empty() {
                config.store.endpoints = etcd;
            }
            if let Some(path) = service_path {
                config.store.service_path = path;
            }
            if let Some(secs) = interval {
                config.scheduler.interval_secs = secs;
            }

            run_scheduler(config, reset).await?;
        }
    }

    Ok(())
}

async fn run_scheduler(config: Config, reset: bool) -> anyhow::Result<()> {
    let store: Arc<dyn KvStore> = Arc::new(EtcdStore::new(config.store.endpoints.clone())?);
    let registry = ClusterRegistry::new(
        store.clone(),
        config.store.service_path.clone(),
        config.agent.announcement_ttl_secs,
        config.scheduler.state_ttl(),
    );

    if reset {
        tracing::info!("clearing persisted states under {}", registry.base());
        registry.clear_states().await?;
    }

    let identifier = uuid::Uuid::new_v4().to_string();
    let lock = DistributedLock::new(
        store,
        registry.lock_key(),
        identifier,
        config.scheduler.lock_lease_secs,
    );
    let renew_period = Duration::from_secs(config.scheduler.lock_renew_secs);

    tracing::info!(
        "waiting for scheduler lock on {} as {}",
        registry.lock_key(),
        lock.identifier()
    );
    loop {
        match lock.acquire().await {
            Ok(()) => break,
            Err(nodeherd::Error::LockInUse) => tokio::time::sleep(renew_period).await,
            Err(e) => return Err(e.into()),
        }
    }

    let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
    let scheduler = Scheduler::new(registry, &config.scheduler);
    let loop_handle = tokio::spawn(scheduler.run(stop_rx));

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    let outcome: anyhow::Result<()> = loop {
        tokio::select! {
            _ = tokio::time::sleep(renew_period) => {
                if let Err(e) = lock.acquire().await {
                    tracing::error!("scheduler lock renewal failed: {}", e);
                    break Err(anyhow::anyhow!("scheduling mandate lost: {}", e));
                }
            }
            _ = &mut shutdown => {
                tracing::info!("signal received, stopping scheduler");
                break Ok(());
            }
        }
    };

    let _ = stop_tx.send(true);
    let _ = loop_handle.await;

    if outcome.is_ok() {
        if let Err(e) = lock.release().await {
            tracing::debug!("scheduler lock release failed: {}", e);
        }
    }
    outcome
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

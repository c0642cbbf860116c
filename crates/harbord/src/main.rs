//! pgharbor daemon - managed PostgreSQL control plane
//!
//! Provisions HA PostgreSQL clusters on cloud VMs, keeps their DNS
//! records pointed at the current leader, and manages backup chains.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

use harbor_common::config::{HarborConfig, CONFIG_PATH};
use harbord::backup::restore::RestoreEngine;
use harbord::backup::ChainEngine;
use harbord::cloud::HttpCloudProvider;
use harbord::dns::{DnsSynchronizer, HttpDnsProvider, RecoveryProbeGuard};
use harbord::leader::{HttpStatusProbe, LeaderDiscovery};
use harbord::outbox::WorkerPool;
use harbord::provision::Orchestrator;
use harbord::remote::{SshExecutor, TrustedExecutor};
use harbord::store::Store;
use harbord::trust::TrustStore;

#[derive(Parser)]
#[command(name = "harbord")]
#[command(about = "pgharbor control-plane daemon", long_about = None)]
#[command(version)]
struct Cli {
    /// Config file path
    #[arg(long, default_value = CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon (default)
    Run,

    /// Run one DNS reconciliation sweep and exit
    SweepDns,

    /// Run one backup-expiration sweep and exit
    SweepBackups,

    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let config = HarborConfig::load_from(&cli.config);

    if let Some(Commands::Config) = cli.command {
        println!("{}", config.to_toml()?);
        return Ok(());
    }

    info!("pgharbor daemon v{} starting", env!("CARGO_PKG_VERSION"));

    let store = Arc::new(Store::open_at(&config.db_path)?);
    let trust = Arc::new(TrustStore::open(Arc::clone(&store))?);
    let remote = Arc::new(TrustedExecutor::new(
        Arc::new(SshExecutor::new("root")),
        Arc::clone(&trust),
    ));
    let discovery = Arc::new(LeaderDiscovery::new(
        Arc::new(HttpStatusProbe::new(&config.leader)),
        config.leader.clone(),
    ));
    let cloud = Arc::new(HttpCloudProvider::new(&config.cloud));
    let dns = Arc::new(HttpDnsProvider::new(&config.dns));

    let orchestrator = Arc::new(Orchestrator::new(
        Arc::clone(&store),
        cloud,
        Arc::clone(&dns) as _,
        Arc::clone(&remote),
        Arc::clone(&trust),
        Arc::clone(&discovery),
        config.clone(),
    ));
    let backups = Arc::new(ChainEngine::new(
        Arc::clone(&store),
        Arc::clone(&remote),
        Arc::clone(&discovery),
        config.backup.clone(),
    ));
    let restores = Arc::new(RestoreEngine::new(
        Arc::clone(&store),
        Arc::clone(&remote),
        Arc::clone(&discovery),
        Arc::clone(&orchestrator),
        config.backup.clone(),
    ));
    let synchronizer = Arc::new(DnsSynchronizer::new(
        Arc::clone(&store),
        Arc::clone(&discovery),
        dns,
        Arc::new(RecoveryProbeGuard),
        config.dns.clone(),
    ));

    match cli.command {
        Some(Commands::SweepDns) => {
            let repaired = synchronizer.sweep().await?;
            info!("DNS sweep done, {} records repaired", repaired);
            return Ok(());
        }
        Some(Commands::SweepBackups) => {
            let expired = backups.sweep_expired().await?;
            info!("Expiration sweep done, {} backups expired", expired);
            return Ok(());
        }
        _ => {}
    }

    let pool = Arc::new(WorkerPool::new(
        Arc::clone(&store),
        orchestrator,
        Arc::clone(&backups),
        restores,
        config.worker.clone(),
    ));
    pool.spawn();

    tokio::spawn(Arc::clone(&synchronizer).run());

    let sweep_period = Duration::from_secs(config.backup.expiry_sweep_interval_secs);
    let sweeper = Arc::clone(&backups);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sweep_period);
        loop {
            ticker.tick().await;
            if let Err(e) = sweeper.sweep_expired().await {
                tracing::warn!("Expiration sweep failed: {}", e);
            }
        }
    });

    info!("pgharbor daemon ready");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down gracefully");
    Ok(())
}

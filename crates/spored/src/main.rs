//! spored — the Spore daemon.
//!
//! Loads a config file, builds the provider backend, reconciles the pool
//! once, then serves the REST API while the pool keeps reconciling in the
//! background.
//!
//! # Usage
//!
//! ```text
//! spored run --config /etc/spore/spore.toml
//! spored check --config /etc/spore/spore.toml
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use spore_core::SporeConfig;
use spore_core::config::{LogConfig, LogFormat, ProviderBackend};
use spore_pool::{Cluster, PoolSettings};
use spore_provider::{CloudProvider, MemoryProvider};

#[derive(Parser)]
#[command(name = "spored", about = "Spore instance pool daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Reconcile the pool and serve the API until interrupted.
    Run {
        /// Path to the TOML config file.
        #[arg(long, short)]
        config: PathBuf,

        /// Override `api.listen`.
        #[arg(long)]
        listen: Option<String>,
    },
    /// Validate a config file (and its fixture) without starting.
    Check {
        #[arg(long, short)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run { config, listen } => run(&config, listen).await,
        Command::Check { config } => check(&config),
    }
}

fn load_config(path: &Path) -> anyhow::Result<SporeConfig> {
    SporeConfig::from_file(path).with_context(|| format!("loading config {}", path.display()))
}

/// `RUST_LOG` wins over `log.level`.
fn init_tracing(log: &LogConfig) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&log.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match log.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

fn build_provider(config: &SporeConfig) -> anyhow::Result<MemoryProvider> {
    match config.provider.backend {
        ProviderBackend::Memory => {
            let provider = match &config.provider.fixture {
                Some(path) => MemoryProvider::from_fixture_file(path)
                    .with_context(|| format!("loading fleet fixture {}", path.display()))?,
                None => {
                    warn!("no fixture configured, starting with an empty fleet");
                    MemoryProvider::new()
                }
            };
            if config.provider.auto_advance {
                Ok(provider.with_auto_advance(true))
            } else {
                Ok(provider)
            }
        }
    }
}

async fn run(config_path: &Path, listen: Option<String>) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    init_tracing(&config.log);
    info!(config = %config_path.display(), "spore daemon starting");

    let settings = PoolSettings::from_config(&config)?;
    let provider: Arc<dyn CloudProvider> = Arc::new(build_provider(&config)?);

    // ── Pool ───────────────────────────────────────────────────

    let cluster = Arc::new(
        Cluster::new(provider, settings)
            .await
            .context("initial reconciliation failed")?,
    );

    // ── API ────────────────────────────────────────────────────

    let listen = listen.unwrap_or_else(|| config.api.listen.clone());
    let addr: SocketAddr = listen
        .parse()
        .with_context(|| format!("invalid listen address {listen}"))?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "API server listening");

    let router = spore_api::build_router(cluster.clone());
    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to install CTRL+C handler");
                std::future::pending::<()>().await;
            }
            info!("shutdown signal received");
        })
        .await?;

    cluster.shutdown().await;
    info!("spore daemon stopped");
    Ok(())
}

fn check(config_path: &Path) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    init_tracing(&config.log);

    let settings = PoolSettings::from_config(&config)?;
    build_provider(&config)?;

    info!(
        region = %settings.region_id,
        zone = %settings.zone_id,
        security_group = %settings.security_group_id,
        tag = %settings.reservation_tag,
        refresh_min = ?settings.refresh_min,
        refresh_max = ?settings.refresh_max,
        "config ok"
    );
    Ok(())
}

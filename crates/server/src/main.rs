//! depot server binary.

use anyhow::{Context, Result};
use clap::Parser;
use depot_core::config::AppConfig;
use depot_db::{ContentStore, PublishStore};
use depot_server::{AppState, create_router};
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use std::net::SocketAddr;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// depot - a content-distribution server for game builds
#[derive(Parser, Debug)]
#[command(name = "depotd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, env = "DEPOT_CONFIG", default_value = "config/depot.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("depot v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration (file is optional, env vars can provide/override
    // everything).
    let config_path = std::path::Path::new(&args.config);
    let mut figment = Figment::new();
    if config_path.exists() {
        tracing::info!(config_path = %args.config, "Loading configuration from file");
        figment = figment.merge(Toml::file(&args.config));
    } else {
        tracing::debug!("No config file found at {}", args.config);
    }

    let config: AppConfig = figment
        .merge(Env::prefixed("DEPOT_").split("__"))
        .extract()
        .context("failed to load configuration")?;

    if let Err(error) = config.validate() {
        anyhow::bail!("invalid configuration: {error}");
    }

    // Open both stores; migrations run on open and abort startup on failure.
    let content = ContentStore::open(&config.content.database_file_name)
        .await
        .context("failed to open content database")?;
    tracing::info!("Content store initialized");

    let publish = PublishStore::open(&config.publish.database_file_name)
        .await
        .context("failed to open publish database")?;
    tracing::info!("Publish store initialized");

    // Forks are created from configuration, idempotently, in both stores.
    for fork in config.forks.keys() {
        content.upsert_fork(fork).await?;
        publish.upsert_fork(fork).await?;
    }

    let state = AppState::new(config.clone(), content.clone(), publish.clone());

    // Discover anything published while we were down.
    state.jobs.trigger_all();

    let app = create_router(state);

    let addr: SocketAddr = config.bind.parse().context("invalid bind address")?;
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind to {addr}"))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Close pooled connections before exit.
    content.close().await;
    publish.close().await;
    tracing::info!("Shut down cleanly");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!(%error, "Failed to listen for shutdown signal");
    }
}

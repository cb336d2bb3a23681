//! threatsieve
//!
//! Crawls file trees for indicators of compromise, indexes them in a
//! columnar store mirrored by a Bloom filter, archives indicator-free
//! files in an object store, and serves bulk IOC lookups.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod api;
mod config;
mod extract;
mod ingest;
mod metrics;
mod models;
mod storage;

use api::AppState;
use config::{Cli, Command, Config, LogConfig};
use ingest::Ingestor;
use metrics::Metrics;
use storage::blob::BlobStore;
use storage::bloom::BloomStore;
use storage::clickhouse::ClickHouseStore;
use storage::Dependency;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let _log_guard = init_tracing(&cli.config.log)?;

    match cli.command {
        Command::Serve => run_serve(cli.config).await,
        Command::Ingest => run_ingest(cli.config).await,
    }
}

/// Connect to the backing stores in dependency order.
async fn connect_stores(config: &Config) -> Result<(ClickHouseStore, BloomStore, BlobStore)> {
    let ch = ClickHouseStore::connect(&config.clickhouse)
        .await
        .context("failed to connect to ClickHouse")?;
    let bloom = BloomStore::connect(&config.redis)
        .await
        .context("failed to connect to Redis")?;
    let blob = BlobStore::connect(&config.blob)
        .await
        .context("failed to connect to blob store")?;
    Ok((ch, bloom, blob))
}

async fn run_serve(config: Config) -> Result<()> {
    tracing::info!("starting threatsieve API server");

    let metrics = Arc::new(Metrics::new()?);
    let (ch, bloom, blob) = connect_stores(&config).await?;

    if config.metrics.enabled {
        let metrics = metrics.clone();
        let port = config.metrics.port;
        tokio::spawn(async move {
            if let Err(e) = metrics::serve(metrics, port).await {
                tracing::error!(error = %e, "metrics server failed");
            }
        });
    }

    let deps: Vec<Arc<dyn Dependency>> = vec![
        Arc::new(ch.clone()),
        Arc::new(bloom.clone()),
        Arc::new(blob.clone()),
    ];
    let state = Arc::new(AppState {
        ch,
        bloom,
        blob,
        metrics,
        api_key: config.api.api_key.clone(),
        deps,
    });
    let app = api::create_router(state);

    let addr: SocketAddr = format!("{}:{}", config.api.host, config.api.port)
        .parse()
        .context("invalid API listen address")?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind API listener on {addr}"))?;
    tracing::info!(addr = %addr, "listening");

    // The listener closes first; store handles drop only after in-flight
    // requests have drained.
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("API server failed")?;

    tracing::info!("server stopped");
    Ok(())
}

async fn run_ingest(config: Config) -> Result<()> {
    tracing::info!("starting threatsieve ingestor");

    let metrics = Arc::new(Metrics::new()?);
    let (ch, bloom, blob) = connect_stores(&config).await?;

    let ingestor = Ingestor::new(&config, ch, bloom, blob, metrics);
    let cancel = ingestor.cancellation_token();
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("gracefully stopping ingestion");
        cancel.cancel();
    });

    ingestor.run().await
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install SIGINT handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => tracing::error!(error = %e, "failed to install SIGTERM handler"),
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("received shutdown signal");
}

/// Initialize tracing from LOG_LEVEL / LOG_FORMAT / LOG_FILE. Returns the
/// appender guard when logging to a file so buffered lines flush on exit.
fn init_tracing(cfg: &LogConfig) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("threatsieve={},tower_http=info", cfg.level))
    });

    match &cfg.file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            let (writer, guard) = tracing_appender::non_blocking(file);

            if cfg.format == "console" {
                tracing_subscriber::registry()
                    .with(filter)
                    .with(tracing_subscriber::fmt::layer().with_writer(writer).with_ansi(false))
                    .init();
            } else {
                tracing_subscriber::registry()
                    .with(filter)
                    .with(tracing_subscriber::fmt::layer().json().with_writer(writer))
                    .init();
            }
            Ok(Some(guard))
        }
        None => {
            if cfg.format == "console" {
                tracing_subscriber::registry()
                    .with(filter)
                    .with(tracing_subscriber::fmt::layer())
                    .init();
            } else {
                tracing_subscriber::registry()
                    .with(filter)
                    .with(tracing_subscriber::fmt::layer().json())
                    .init();
            }
            Ok(None)
        }
    }
}

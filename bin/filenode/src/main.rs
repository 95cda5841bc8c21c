//! Filenode metadata index daemon
//!
//! Runs the metadata index over the journalled in-process hot tier, the
//! redb cold index and the filesystem block store, sweeps idle keys to the
//! cold index periodically, snapshots the hot tier and serves the
//! diagnostic HTTP endpoints.

mod http;

use anyhow::{Context, Result};
use clap::Parser;
use filenode_common::Config;
use filenode_index::FileIndex;
use filenode_store::{FsBlockStore, JournalConfig, MemoryStore, RedbIndexStore};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "filenode")]
#[command(about = "Filenode metadata index")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/filenode/filenode.toml")]
    config: String,

    /// Listen address for the diagnostic HTTP API (overrides the config file)
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Snapshot the hot tier off the async runtime
async fn snapshot_hot(fast: &Arc<MemoryStore>) {
    let fast = Arc::clone(fast);
    match tokio::task::spawn_blocking(move || fast.snapshot()).await {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => warn!("Hot tier snapshot failed: {}", e),
        Err(e) => warn!("Hot tier snapshot task failed: {}", e),
    }
}

fn load_config(path: &str) -> Result<Config> {
    let config = config::Config::builder()
        .add_source(config::File::with_name(path).required(false))
        .add_source(config::Environment::with_prefix("FILENODE").separator("__"))
        .build()
        .with_context(|| format!("Failed to read config {path}"))?;
    config
        .try_deserialize()
        .with_context(|| format!("Invalid config {path}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = load_config(&args.config)?;
    let listen = args.listen.unwrap_or(config.http.listen);
    info!("Starting filenode '{}'", config.node.name);

    let blocks = FsBlockStore::open(config.store.blocks_path(&config.node)).await?;
    let cold = RedbIndexStore::open(config.store.index_path(&config.node))?;
    let hot_path = config.store.hot_path(&config.node);
    let fast = Arc::new(
        MemoryStore::open(
            &hot_path,
            JournalConfig {
                sync_on_write: config.store.hot_sync_on_write,
                max_size_bytes: config.store.hot_journal_max_bytes,
                ..Default::default()
            },
        )
        .with_context(|| format!("Failed to open hot tier {}", hot_path.display()))?,
    );
    let index = Arc::new(FileIndex::new(
        config.index.clone(),
        fast.clone(),
        Arc::new(blocks),
        Arc::new(cold),
    ));
    index.start().await?;

    let sweeper = (config.index.persist_interval_secs > 0).then(|| {
        let index = Arc::clone(&index);
        let period = Duration::from_secs(config.index.persist_interval_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = index.persist_keys().await {
                    warn!("Persist sweep failed: {}", e);
                }
            }
        })
    });

    let snapshotter = (config.store.hot_snapshot_interval_secs > 0).then(|| {
        let fast = Arc::clone(&fast);
        let period = Duration::from_secs(config.store.hot_snapshot_interval_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if fast.needs_snapshot() {
                    snapshot_hot(&fast).await;
                }
            }
        })
    });

    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("Failed to bind {listen}"))?;
    info!("Listening on {}", listen);

    axum::serve(listener, http::router(Arc::clone(&index)).into_make_service())
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            info!("Shutting down...");
        })
        .await?;

    for task in [sweeper, snapshotter].into_iter().flatten() {
        task.abort();
    }
    index.close();
    snapshot_hot(&fast).await;
    info!("Filenode shut down gracefully");

    Ok(())
}

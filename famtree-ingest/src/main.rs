//! famtree-ingest - GEDCOM Import Service
//!
//! Accepts GEDCOM uploads over HTTP, stages them for duplicate review and
//! commits the reviewed result into the family-tree database. Progress is
//! streamed over SSE.

use anyhow::{Context, Result};
use clap::Parser;
use famtree_common::events::EventBus;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use famtree_ingest::config::{IngestSettings, DEFAULT_BIND_ADDRESS};
use famtree_ingest::AppState;

/// Retention sweep interval
const SWEEP_INTERVAL: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Parser)]
#[command(name = "famtree-ingest", version, about = "GEDCOM import service")]
struct Args {
    /// Root folder holding the tree database
    #[arg(long, env = "FAMTREE_ROOT_FOLDER")]
    root_folder: Option<String>,

    /// TOML config file (default: ~/.config/famtree/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Listen address (overrides the config file)
    #[arg(long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config_path = args.config.clone().or_else(famtree_common::config::default_config_path);
    let toml_config = match &config_path {
        Some(path) => famtree_common::config::load_toml_config(path)?,
        None => Default::default(),
    };

    // RUST_LOG overrides the configured level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&toml_config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting famtree-ingest (GEDCOM Import) service");
    info!(
        "Version: {} ({}, built {})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH"),
        env!("BUILD_TIMESTAMP")
    );

    let root_folder = famtree_common::config::resolve_root_folder(args.root_folder.as_deref(), &toml_config);
    std::fs::create_dir_all(&root_folder)
        .with_context(|| format!("Failed to create root folder {}", root_folder.display()))?;

    let db_path = famtree_common::config::database_path(&root_folder);
    info!("Database: {}", db_path.display());
    let db_pool = famtree_common::db::init_database(&db_path).await?;

    let settings = IngestSettings::resolve(&db_pool, &toml_config).await?;

    let event_bus = Arc::new(EventBus::new(256));
    let coordinator = famtree_ingest::build_coordinator(db_pool, &settings, Arc::clone(&event_bus));

    let recovered = coordinator.recover_stale().await?;
    if recovered > 0 {
        warn!("Settled {} import sessions interrupted by restart", recovered);
    }

    let sweeper = Arc::clone(&coordinator);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            interval.tick().await;
            match sweeper.sweep_expired().await {
                Ok(0) => {}
                Ok(evicted) => info!("Retention sweep evicted {} import sessions", evicted),
                Err(e) => error!("Retention sweep failed: {}", e),
            }
        }
    });

    let bind_address = args
        .bind
        .or(toml_config.bind_address.clone())
        .unwrap_or_else(|| DEFAULT_BIND_ADDRESS.to_string());

    let state = AppState::new(coordinator, event_bus, settings);
    let app = famtree_ingest::build_router(state);

    let listener = tokio::net::TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("Failed to bind {}", bind_address))?;
    info!("Listening on http://{}", bind_address);
    info!("Health check: http://{}/health", bind_address);

    axum::serve(listener, app).await?;

    Ok(())
}

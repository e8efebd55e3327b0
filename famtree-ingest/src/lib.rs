//! famtree-ingest library interface
//!
//! GEDCOM import pipeline: parse an uploaded file, match its individuals
//! against the existing tree, stage the result for review, then commit the
//! operator's decisions in one transaction.

pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod services;
pub mod utils;

pub use crate::error::{ApiError, ApiResult};

use axum::Router;
use chrono::{DateTime, Utc};
use famtree_common::events::EventBus;
use sqlx::SqlitePool;
use std::sync::Arc;
use tokio::sync::RwLock;
use tower_http::trace::TraceLayer;

use crate::config::{IngestSettings, SessionBackendKind};
use crate::db::{SqliteSessionBackend, SqliteTreeStore};
use crate::services::{
    DuplicateMatcher, ImportCoordinator, MemorySessionBackend, ProgressReporter, SessionBackend, SessionStore,
};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<ImportCoordinator>,
    /// Event bus for SSE broadcasting
    pub event_bus: Arc<EventBus>,
    pub settings: Arc<IngestSettings>,
    /// Service startup timestamp for uptime tracking
    pub startup_time: DateTime<Utc>,
    /// Last commit failure for diagnostics
    pub last_error: Arc<RwLock<Option<String>>>,
}

impl AppState {
    pub fn new(coordinator: Arc<ImportCoordinator>, event_bus: Arc<EventBus>, settings: IngestSettings) -> Self {
        Self {
            coordinator,
            event_bus,
            settings: Arc::new(settings),
            startup_time: Utc::now(),
            last_error: Arc::new(RwLock::new(None)),
        }
    }
}

/// Wire the pipeline services over a tree database
pub fn build_coordinator(
    pool: SqlitePool,
    settings: &IngestSettings,
    event_bus: Arc<EventBus>,
) -> Arc<ImportCoordinator> {
    let backend: Arc<dyn SessionBackend> = match settings.session_backend {
        SessionBackendKind::Memory => Arc::new(MemorySessionBackend::new()),
        SessionBackendKind::Database => Arc::new(SqliteSessionBackend::new(pool.clone())),
    };
    let reporter = Arc::new(ProgressReporter::new(event_bus));
    let sessions = Arc::new(SessionStore::new(backend, settings.retention(), reporter));

    Arc::new(ImportCoordinator::new(
        sessions,
        Arc::new(SqliteTreeStore::new(pool)),
        DuplicateMatcher::new(settings.match_threshold),
        settings.commit_batch_size,
    ))
}

/// Build application router
pub fn build_router(state: AppState) -> Router {
    use axum::routing::get;

    Router::new()
        .merge(api::import_routes(state.settings.max_upload_bytes))
        .route("/import/events", get(api::import_event_stream))
        .merge(api::health_routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

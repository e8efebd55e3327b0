//! Configuration resolution for famtree-ingest
//!
//! Each ingest setting resolves with Database → ENV → TOML → default
//! priority. A value found in more than one tier is logged as a potential
//! misconfiguration; an unparsable value is ignored with a warning.

use famtree_common::config::TomlConfig;
use famtree_common::Result;
use serde::Serialize;
use sqlx::{Pool, Sqlite};
use std::fmt;
use std::str::FromStr;
use tracing::{info, warn};

use crate::db::settings::{self, keys};
use crate::services::duplicate_matcher::DEFAULT_MATCH_THRESHOLD;
use crate::services::resolution_engine::DEFAULT_COMMIT_BATCH_SIZE;

pub const DEFAULT_RETENTION_HOURS: u64 = 24;
pub const DEFAULT_MAX_UPLOAD_BYTES: u64 = 10 * 1024 * 1024;
pub const DEFAULT_BIND_ADDRESS: &str = "127.0.0.1:5740";

pub const ENV_MATCH_THRESHOLD: &str = "FAMTREE_MATCH_THRESHOLD";
pub const ENV_RETENTION_HOURS: &str = "FAMTREE_RETENTION_HOURS";
pub const ENV_MAX_UPLOAD_BYTES: &str = "FAMTREE_MAX_UPLOAD_BYTES";
pub const ENV_COMMIT_BATCH_SIZE: &str = "FAMTREE_COMMIT_BATCH_SIZE";
pub const ENV_SESSION_BACKEND: &str = "FAMTREE_SESSION_BACKEND";

/// Where import sessions are kept
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionBackendKind {
    /// Process memory; sessions are lost on restart
    Memory,
    /// `import_sessions` table in the tree database
    Database,
}

impl FromStr for SessionBackendKind {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(SessionBackendKind::Memory),
            "database" | "sqlite" => Ok(SessionBackendKind::Database),
            other => Err(format!("unknown session backend '{}' (expected memory or database)", other)),
        }
    }
}

impl fmt::Display for SessionBackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionBackendKind::Memory => write!(f, "memory"),
            SessionBackendKind::Database => write!(f, "database"),
        }
    }
}

/// Resolved import pipeline settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngestSettings {
    pub match_threshold: u8,
    pub retention_hours: u64,
    pub max_upload_bytes: u64,
    pub commit_batch_size: usize,
    pub session_backend: SessionBackendKind,
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            match_threshold: DEFAULT_MATCH_THRESHOLD,
            retention_hours: DEFAULT_RETENTION_HOURS,
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            commit_batch_size: DEFAULT_COMMIT_BATCH_SIZE,
            session_backend: SessionBackendKind::Database,
        }
    }
}

impl IngestSettings {
    /// Resolve every setting from the database, environment and TOML file
    pub async fn resolve(db: &Pool<Sqlite>, toml_config: &TomlConfig) -> Result<Self> {
        let toml = &toml_config.ingest;
        let defaults = Self::default();

        let match_threshold = resolve_setting(
            db,
            keys::MATCH_THRESHOLD,
            ENV_MATCH_THRESHOLD,
            toml.match_threshold,
            defaults.match_threshold,
        )
        .await?;

        let settings = Self {
            match_threshold: match_threshold.min(100),
            retention_hours: resolve_setting(
                db,
                keys::RETENTION_HOURS,
                ENV_RETENTION_HOURS,
                toml.retention_hours,
                defaults.retention_hours,
            )
            .await?,
            max_upload_bytes: resolve_setting(
                db,
                keys::MAX_UPLOAD_BYTES,
                ENV_MAX_UPLOAD_BYTES,
                toml.max_upload_bytes,
                defaults.max_upload_bytes,
            )
            .await?,
            commit_batch_size: resolve_setting(
                db,
                keys::COMMIT_BATCH_SIZE,
                ENV_COMMIT_BATCH_SIZE,
                toml.commit_batch_size,
                defaults.commit_batch_size,
            )
            .await?
            .max(1),
            session_backend: resolve_setting(
                db,
                keys::SESSION_BACKEND,
                ENV_SESSION_BACKEND,
                toml.session_backend.as_deref().and_then(|v| parse_or_warn(v, "TOML", keys::SESSION_BACKEND)),
                defaults.session_backend,
            )
            .await?,
        };

        info!(
            match_threshold = settings.match_threshold,
            retention_hours = settings.retention_hours,
            max_upload_bytes = settings.max_upload_bytes,
            commit_batch_size = settings.commit_batch_size,
            session_backend = %settings.session_backend,
            "Ingest settings resolved"
        );
        Ok(settings)
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::hours(self.retention_hours.min(i64::MAX as u64 / 3600) as i64)
    }
}

/// Resolve one setting from the 3-tier configuration
///
/// **Priority:** Database → ENV → TOML → default
async fn resolve_setting<T>(
    db: &Pool<Sqlite>,
    key: &str,
    env_var: &str,
    toml_value: Option<T>,
    default: T,
) -> Result<T>
where
    T: FromStr + fmt::Display,
    T::Err: fmt::Display,
{
    let mut sources = Vec::new();

    // Tier 1: Database (authoritative)
    let db_value = match settings::get_setting::<T>(db, key).await {
        Ok(value) => value,
        Err(famtree_common::Error::Config(message)) => {
            warn!("{}; ignoring database value", message);
            None
        }
        Err(e) => return Err(e),
    };
    if db_value.is_some() {
        sources.push("database");
    }

    // Tier 2: Environment variable
    let env_value = std::env::var(env_var)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .and_then(|v| parse_or_warn::<T>(&v, "environment", env_var));
    if env_value.is_some() {
        sources.push("environment");
    }

    // Tier 3: TOML config
    if toml_value.is_some() {
        sources.push("TOML");
    }

    if sources.len() > 1 {
        warn!(
            "{} found in multiple sources: {}. Using {} (highest priority).",
            key,
            sources.join(", "),
            sources[0]
        );
    }

    let resolved = db_value.or(env_value).or(toml_value);
    match (&resolved, sources.first()) {
        (Some(value), Some(source)) => info!("{} = {} loaded from {}", key, value, source),
        _ => info!("{} = {} (default)", key, default),
    }
    Ok(resolved.unwrap_or(default))
}

fn parse_or_warn<T>(value: &str, source: &str, name: &str) -> Option<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match value.trim().parse::<T>() {
        Ok(parsed) => Some(parsed),
        Err(e) => {
            warn!("Ignoring invalid {} value for {} ({:?}): {}", source, name, value, e);
            None
        }
    }
}

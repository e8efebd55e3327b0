//! Import session database operations
//!
//! Sessions are stored whole as a JSON payload, with `state` and
//! `created_at` mirrored into columns for the recovery and retention queries.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use famtree_common::{Error, Result};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::models::{ImportSession, ImportState};
use crate::services::session_store::SessionBackend;
use crate::utils::{retry_on_lock, DEFAULT_MAX_LOCK_WAIT_MS};

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Session persistence in the `import_sessions` table
#[derive(Debug, Clone)]
pub struct SqliteSessionBackend {
    pool: SqlitePool,
    max_lock_wait_ms: u64,
}

impl SqliteSessionBackend {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            max_lock_wait_ms: DEFAULT_MAX_LOCK_WAIT_MS,
        }
    }

    pub fn with_max_lock_wait_ms(mut self, max_lock_wait_ms: u64) -> Self {
        self.max_lock_wait_ms = max_lock_wait_ms;
        self
    }
}

#[async_trait]
impl SessionBackend for SqliteSessionBackend {
    async fn load(&self, upload_id: Uuid) -> Result<Option<ImportSession>> {
        let payload: Option<String> =
            sqlx::query_scalar("SELECT payload FROM import_sessions WHERE upload_id = ?")
                .bind(upload_id.to_string())
                .fetch_optional(&self.pool)
                .await?;

        payload
            .map(|json| {
                serde_json::from_str(&json)
                    .map_err(|e| Error::Internal(format!("Failed to deserialize session {}: {}", upload_id, e)))
            })
            .transpose()
    }

    /// Save import session to database
    ///
    /// Uses retry_on_lock to ride out transient lock contention.
    async fn save(&self, session: &ImportSession) -> Result<()> {
        // Prepare all data before acquiring a connection
        let upload_id = session.upload_id.to_string();
        let state = session.state.as_str();
        let payload = serde_json::to_string(session)
            .map_err(|e| Error::Internal(format!("Failed to serialize session: {}", e)))?;
        let created_at = timestamp(session.created_at);
        let updated_at = timestamp(session.updated_at);

        retry_on_lock("save_session", self.max_lock_wait_ms, || async {
            sqlx::query(
                r#"
                INSERT INTO import_sessions (upload_id, state, payload, created_at, updated_at)
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT(upload_id) DO UPDATE SET
                    state = excluded.state,
                    payload = excluded.payload,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(&upload_id)
            .bind(state)
            .bind(&payload)
            .bind(&created_at)
            .bind(&updated_at)
            .execute(&self.pool)
            .await?;

            Ok(())
        })
        .await
    }

    async fn remove(&self, upload_id: Uuid, tombstone: bool) -> Result<()> {
        let id = upload_id.to_string();
        let evicted_at = timestamp(Utc::now());

        retry_on_lock("remove_session", self.max_lock_wait_ms, || async {
            let mut tx = self.pool.begin().await?;
            sqlx::query("DELETE FROM import_sessions WHERE upload_id = ?")
                .bind(&id)
                .execute(&mut *tx)
                .await?;
            if tombstone {
                sqlx::query(
                    "INSERT INTO import_session_tombstones (upload_id, evicted_at) VALUES (?, ?)
                     ON CONFLICT(upload_id) DO NOTHING",
                )
                .bind(&id)
                .bind(&evicted_at)
                .execute(&mut *tx)
                .await?;
            }
            tx.commit().await?;
            Ok(())
        })
        .await
    }

    async fn is_tombstoned(&self, upload_id: Uuid) -> Result<bool> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM import_session_tombstones WHERE upload_id = ?")
                .bind(upload_id.to_string())
                .fetch_one(&self.pool)
                .await?;
        Ok(count > 0)
    }

    async fn list_created_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Uuid>> {
        let ids: Vec<String> = sqlx::query_scalar(
            "SELECT upload_id FROM import_sessions WHERE created_at < ? ORDER BY created_at",
        )
        .bind(timestamp(cutoff))
        .fetch_all(&self.pool)
        .await?;

        parse_ids(ids)
    }

    async fn list_in_states(&self, states: &[ImportState]) -> Result<Vec<Uuid>> {
        if states.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = vec!["?"; states.len()].join(", ");
        let sql = format!(
            "SELECT upload_id FROM import_sessions WHERE state IN ({}) ORDER BY created_at",
            placeholders
        );
        let mut query = sqlx::query_scalar::<sqlx::Sqlite, String>(&sql);
        for state in states {
            query = query.bind(state.as_str());
        }
        let ids: Vec<String> = query.fetch_all(&self.pool).await?;

        parse_ids(ids)
    }
}

fn parse_ids(ids: Vec<String>) -> Result<Vec<Uuid>> {
    ids.iter()
        .map(|id| {
            Uuid::parse_str(id).map_err(|e| Error::Internal(format!("Failed to parse upload_id {}: {}", id, e)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn backend() -> SqliteSessionBackend {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        famtree_common::db::create_all_tables(&pool).await.unwrap();
        SqliteSessionBackend::new(pool)
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let backend = backend().await;
        let mut session = ImportSession::new("tree.ged");
        backend.save(&session).await.unwrap();

        session.transition_to(ImportState::Parsing).unwrap();
        backend.save(&session).await.unwrap();

        let loaded = backend.load(session.upload_id).await.unwrap().unwrap();
        assert_eq!(loaded.state, ImportState::Parsing);
        assert_eq!(loaded.file_name, "tree.ged");
        assert!(backend.load(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_remove_with_tombstone() {
        let backend = backend().await;
        let session = ImportSession::new("tree.ged");
        backend.save(&session).await.unwrap();

        backend.remove(session.upload_id, true).await.unwrap();
        assert!(backend.load(session.upload_id).await.unwrap().is_none());
        assert!(backend.is_tombstoned(session.upload_id).await.unwrap());
    }

    #[tokio::test]
    async fn test_listing_queries() {
        let backend = backend().await;
        let mut old = ImportSession::new("old.ged");
        old.created_at = Utc::now() - chrono::Duration::hours(48);
        old.transition_to(ImportState::Parsing).unwrap();
        let fresh = ImportSession::new("fresh.ged");
        backend.save(&old).await.unwrap();
        backend.save(&fresh).await.unwrap();

        let cutoff = Utc::now() - chrono::Duration::hours(24);
        assert_eq!(backend.list_created_before(cutoff).await.unwrap(), vec![old.upload_id]);
        assert_eq!(
            backend.list_in_states(&[ImportState::Parsing]).await.unwrap(),
            vec![old.upload_id]
        );
        assert!(backend.list_in_states(&[]).await.unwrap().is_empty());
    }
}

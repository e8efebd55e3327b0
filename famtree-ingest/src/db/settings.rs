//! Settings database operations
//!
//! Key-value accessors over the shared `settings` table. Values are stored as
//! text and parsed on read.

use famtree_common::{Error, Result};
use sqlx::{Pool, Sqlite};

/// Setting keys owned by the import service
pub mod keys {
    pub const MATCH_THRESHOLD: &str = "ingest_match_threshold";
    pub const RETENTION_HOURS: &str = "ingest_retention_hours";
    pub const MAX_UPLOAD_BYTES: &str = "ingest_max_upload_bytes";
    pub const COMMIT_BATCH_SIZE: &str = "ingest_commit_batch_size";
    pub const SESSION_BACKEND: &str = "ingest_session_backend";
}

/// Generic setting getter
///
/// Returns None when the key is absent or NULL.
pub async fn get_setting<T>(db: &Pool<Sqlite>, key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let value: Option<Option<String>> = sqlx::query_scalar("SELECT value FROM settings WHERE key = ?")
        .bind(key)
        .fetch_optional(db)
        .await
        .map_err(Error::Database)?;

    match value.flatten() {
        Some(value) => {
            let parsed = value
                .trim()
                .parse::<T>()
                .map_err(|e| Error::Config(format!("Setting {} = {:?} is invalid: {}", key, value, e)))?;
            Ok(Some(parsed))
        }
        None => Ok(None),
    }
}

/// Generic setting setter (upsert)
pub async fn set_setting<T>(db: &Pool<Sqlite>, key: &str, value: T) -> Result<()>
where
    T: std::fmt::Display,
{
    sqlx::query(
        "INSERT INTO settings (key, value, updated_at) VALUES (?, ?, CURRENT_TIMESTAMP)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
    )
    .bind(key)
    .bind(value.to_string())
    .execute(db)
    .await
    .map_err(Error::Database)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;
    use sqlx::SqlitePool;

    async fn setup_test_db() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        famtree_common::db::create_settings_table(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn test_missing_setting_is_none() {
        let pool = setup_test_db().await;
        let value: Option<u8> = get_setting(&pool, keys::MATCH_THRESHOLD).await.unwrap();
        assert_eq!(value, None);
    }

    #[tokio::test]
    async fn test_set_then_update() {
        let pool = setup_test_db().await;

        set_setting(&pool, keys::MATCH_THRESHOLD, 60).await.unwrap();
        set_setting(&pool, keys::MATCH_THRESHOLD, 70).await.unwrap();

        let value: Option<u8> = get_setting(&pool, keys::MATCH_THRESHOLD).await.unwrap();
        assert_eq!(value, Some(70));

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM settings WHERE key = ?")
            .bind(keys::MATCH_THRESHOLD)
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_unparsable_value_is_config_error() {
        let pool = setup_test_db().await;
        set_setting(&pool, keys::RETENTION_HOURS, "soon").await.unwrap();

        let result: Result<Option<u64>> = get_setting(&pool, keys::RETENTION_HOURS).await;
        assert!(matches!(result, Err(Error::Config(_))));
    }
}

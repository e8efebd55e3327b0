//! Database initialization
//!
//! Creates the family-tree schema (persons, relationships), the settings
//! table and the import session tables. All statements are idempotent so the
//! same initialization runs on first start and on every restart.

use crate::Result;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use std::path::Path;
use tracing::info;

/// Initialize database connection and create tables if needed
pub async fn init_database(db_path: &Path) -> Result<SqlitePool> {
    let newly_created = !db_path.exists();

    // Create parent directory if it doesn't exist
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
    let pool = SqlitePoolOptions::new()
        .max_connections(10)
        .min_connections(2)
        .connect(&db_url)
        .await?;

    if newly_created {
        info!("Initialized new database: {}", db_path.display());
    } else {
        info!("Opened existing database: {}", db_path.display());
    }

    // WAL lets session polling read while a commit holds the write lock
    sqlx::query("PRAGMA journal_mode = WAL")
        .execute(&pool)
        .await?;

    sqlx::query("PRAGMA busy_timeout = 5000")
        .execute(&pool)
        .await?;

    create_all_tables(&pool).await?;

    Ok(pool)
}

/// Create every table used by famtree services
pub async fn create_all_tables(pool: &SqlitePool) -> Result<()> {
    create_settings_table(pool).await?;
    create_persons_table(pool).await?;
    create_relationships_table(pool).await?;
    create_import_sessions_table(pool).await?;
    create_import_session_tombstones_table(pool).await?;
    create_import_commits_table(pool).await?;
    Ok(())
}

/// Create the settings table
///
/// Stores application configuration key-value pairs.
pub async fn create_settings_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT,
            updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Create the persons table (one row per individual in the tree)
pub async fn create_persons_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS persons (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            first_name TEXT NOT NULL DEFAULT '',
            last_name TEXT NOT NULL DEFAULT '',
            birth_date TEXT,
            death_date TEXT,
            gender TEXT,
            birth_place TEXT,
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
            updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_persons_last_name ON persons(last_name COLLATE NOCASE)")
        .execute(pool)
        .await?;

    Ok(())
}

/// Create the relationships table
///
/// `parent_role` is stored as an empty string for spouse rows so the UNIQUE
/// constraint covers the full (person1, person2, type, role) tuple; SQLite
/// treats NULLs as distinct in unique indexes.
pub async fn create_relationships_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS relationships (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            person1_id INTEGER NOT NULL REFERENCES persons(id) ON DELETE CASCADE,
            person2_id INTEGER NOT NULL REFERENCES persons(id) ON DELETE CASCADE,
            rel_type TEXT NOT NULL CHECK (rel_type IN ('parent_of', 'spouse')),
            parent_role TEXT NOT NULL DEFAULT '',
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
            CHECK (person1_id <> person2_id),
            UNIQUE (person1_id, person2_id, rel_type, parent_role)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_relationships_person2 ON relationships(person2_id)")
        .execute(pool)
        .await?;

    Ok(())
}

/// Create the import_sessions table (staged import state as JSON)
pub async fn create_import_sessions_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS import_sessions (
            upload_id TEXT PRIMARY KEY,
            state TEXT NOT NULL,
            payload TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Create the tombstone table for sessions evicted before commit
pub async fn create_import_session_tombstones_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS import_session_tombstones (
            upload_id TEXT PRIMARY KEY,
            evicted_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Create the commit ledger
///
/// One row per committed upload, written in the same transaction as the
/// tree changes it describes.
pub async fn create_import_commits_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS import_commits (
            upload_id TEXT PRIMARY KEY,
            summary TEXT NOT NULL,
            committed_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

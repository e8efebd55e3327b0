//! Shared setup for integration tests
#![allow(dead_code)]

use famtree_common::events::EventBus;
use famtree_ingest::config::{IngestSettings, SessionBackendKind};
use famtree_ingest::services::ImportCoordinator;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Husband, wife and one child in a single family
pub const SMITH_FAMILY: &str = "\
0 HEAD
1 CHAR UTF-8
0 @I1@ INDI
1 NAME John /Smith/
1 SEX M
1 BIRT
2 DATE 1 JAN 1900
2 PLAC Boston
0 @I2@ INDI
1 NAME Mary /Jones/
1 SEX F
0 @I3@ INDI
1 NAME Ann /Smith/
1 SEX F
1 BIRT
2 DATE 5 MAY 1925
0 @F1@ FAM
1 HUSB @I1@
1 WIFE @I2@
1 CHIL @I3@
0 TRLR
";

/// Single-connection in-memory tree database with the full schema
pub async fn memory_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to create in-memory database");
    famtree_common::db::create_all_tables(&pool)
        .await
        .expect("Failed to create tables");
    pool
}

pub fn memory_settings() -> IngestSettings {
    IngestSettings {
        session_backend: SessionBackendKind::Memory,
        ..IngestSettings::default()
    }
}

pub fn coordinator(pool: &SqlitePool) -> Arc<ImportCoordinator> {
    famtree_ingest::build_coordinator(pool.clone(), &memory_settings(), Arc::new(EventBus::new(256)))
}

/// Create a session and run the parse/match phase to completion
pub async fn parsed_upload(coordinator: &ImportCoordinator, bytes: &[u8]) -> Uuid {
    let session = coordinator
        .sessions()
        .create("family.ged")
        .await
        .expect("create session");
    coordinator
        .run_parse(session.upload_id, bytes.to_vec(), CancellationToken::new())
        .await
        .expect("parse upload");
    session.upload_id
}

pub async fn seed_person(pool: &SqlitePool, first: &str, last: &str, birth_date: Option<&str>) -> i64 {
    sqlx::query("INSERT INTO persons (first_name, last_name, birth_date) VALUES (?, ?, ?)")
        .bind(first)
        .bind(last)
        .bind(birth_date)
        .execute(pool)
        .await
        .expect("seed person")
        .last_insert_rowid()
}

pub async fn seed_parent(pool: &SqlitePool, parent: i64, child: i64, role: &str) {
    sqlx::query("INSERT INTO relationships (person1_id, person2_id, rel_type, parent_role) VALUES (?, ?, 'parent_of', ?)")
        .bind(parent)
        .bind(child)
        .bind(role)
        .execute(pool)
        .await
        .expect("seed relationship");
}

pub async fn count_rows(pool: &SqlitePool, table: &str) -> i64 {
    sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", table))
        .fetch_one(pool)
        .await
        .expect("count rows")
}

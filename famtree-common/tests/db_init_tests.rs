//! Tests for database initialization
//!
//! Covers first-run creation, reopening an existing database and the
//! constraints the import pipeline relies on.

use famtree_common::db::init::init_database;

#[tokio::test]
async fn test_database_creation_when_missing() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("nested").join("famtree.db");

    let result = init_database(&db_path).await;

    assert!(result.is_ok(), "Database initialization failed: {:?}", result.err());
    assert!(db_path.exists(), "Database file was not created");
}

#[tokio::test]
async fn test_database_opens_existing() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("famtree.db");

    let pool1 = init_database(&db_path).await.unwrap();
    sqlx::query("INSERT INTO persons (first_name, last_name) VALUES ('Ada', 'Lovelace')")
        .execute(&pool1)
        .await
        .unwrap();
    pool1.close().await;

    // Second open must keep existing rows
    let pool2 = init_database(&db_path).await.unwrap();
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM persons")
        .fetch_one(&pool2)
        .await
        .unwrap();
    assert_eq!(count, 1);
}

#[tokio::test]
async fn test_relationship_uniqueness_covers_spouse_rows() {
    let dir = tempfile::tempdir().unwrap();
    let pool = init_database(&dir.path().join("famtree.db")).await.unwrap();

    sqlx::query("INSERT INTO persons (id, first_name, last_name) VALUES (1, 'A', 'X'), (2, 'B', 'X')")
        .execute(&pool)
        .await
        .unwrap();

    sqlx::query("INSERT INTO relationships (person1_id, person2_id, rel_type) VALUES (1, 2, 'spouse')")
        .execute(&pool)
        .await
        .unwrap();

    // Same spouse tuple again violates the unique constraint
    let duplicate = sqlx::query(
        "INSERT INTO relationships (person1_id, person2_id, rel_type) VALUES (1, 2, 'spouse')",
    )
    .execute(&pool)
    .await;
    assert!(duplicate.is_err());
}

#[tokio::test]
async fn test_self_relationship_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let pool = init_database(&dir.path().join("famtree.db")).await.unwrap();

    sqlx::query("INSERT INTO persons (id, first_name, last_name) VALUES (1, 'A', 'X')")
        .execute(&pool)
        .await
        .unwrap();

    let result = sqlx::query(
        "INSERT INTO relationships (person1_id, person2_id, rel_type, parent_role) VALUES (1, 1, 'parent_of', 'father')",
    )
    .execute(&pool)
    .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_commit_ledger_keys_on_upload_id() {
    let dir = tempfile::tempdir().unwrap();
    let pool = init_database(&dir.path().join("famtree.db")).await.unwrap();

    let insert = "INSERT INTO import_commits (upload_id, summary, committed_at) VALUES ('u1', '{}', '2026-01-01T00:00:00Z')";
    sqlx::query(insert).execute(&pool).await.unwrap();
    assert!(sqlx::query(insert).execute(&pool).await.is_err());
}

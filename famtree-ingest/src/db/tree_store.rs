//! Family-tree storage interface
//!
//! The import pipeline reads and writes the tree only through [`TreeStore`]
//! and the [`TreeTransaction`] it opens. [`SqliteTreeStore`] is the
//! production implementation over the shared `persons`/`relationships`
//! tables.
//!
//! Every commit also writes its summary to the `import_commits` ledger inside
//! the same transaction, so whether an upload's changes reached the tree can
//! always be answered from the tree itself.

use async_trait::async_trait;
use chrono::Utc;
use famtree_common::{Error, Result};
use sqlx::{Row, SqlitePool};
use std::collections::{BTreeSet, HashMap};
use uuid::Uuid;

use crate::models::{Gender, ImportSummary, ParentRole, ParsedIndividual, PersonId, RelationshipType};
use crate::utils::{begin_monitored, MonitoredTransaction};

/// Person already in the tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredIndividual {
    pub id: PersonId,
    pub first_name: String,
    pub last_name: String,
    pub birth_date: Option<String>,
    pub death_date: Option<String>,
    pub gender: Option<Gender>,
    pub birth_place: Option<String>,
    /// Recorded parents (`parent_of` relationships pointing at this person)
    pub parent_ids: BTreeSet<PersonId>,
}

/// Fields for a person created by an import
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewIndividual {
    pub first_name: String,
    pub last_name: String,
    pub birth_date: Option<String>,
    pub death_date: Option<String>,
    pub gender: Option<Gender>,
    pub birth_place: Option<String>,
}

impl From<&ParsedIndividual> for NewIndividual {
    fn from(parsed: &ParsedIndividual) -> Self {
        Self {
            first_name: parsed.first_name.clone(),
            last_name: parsed.last_name.clone(),
            birth_date: parsed.birth_date.clone(),
            death_date: parsed.death_date.clone(),
            gender: parsed.gender,
            birth_place: parsed.birth_place.clone(),
        }
    }
}

/// Fields to set on an existing person; None leaves the column untouched
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndividualFieldUpdate {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub birth_date: Option<String>,
    pub death_date: Option<String>,
    pub gender: Option<Gender>,
    pub birth_place: Option<String>,
}

impl IndividualFieldUpdate {
    /// Fields that are empty on `existing` and present on `incoming`
    ///
    /// Values already recorded are never overwritten.
    pub fn backfill(existing: &StoredIndividual, incoming: &ParsedIndividual) -> Self {
        fn fill_text(current: &str, incoming: &str) -> Option<String> {
            (current.trim().is_empty() && !incoming.trim().is_empty()).then(|| incoming.to_string())
        }
        fn fill_opt(current: &Option<String>, incoming: &Option<String>) -> Option<String> {
            let empty = current.as_deref().map_or(true, |v| v.trim().is_empty());
            if empty {
                incoming.clone().filter(|v| !v.trim().is_empty())
            } else {
                None
            }
        }

        Self {
            first_name: fill_text(&existing.first_name, &incoming.first_name),
            last_name: fill_text(&existing.last_name, &incoming.last_name),
            birth_date: fill_opt(&existing.birth_date, &incoming.birth_date),
            death_date: fill_opt(&existing.death_date, &incoming.death_date),
            gender: match existing.gender {
                None => incoming.gender,
                Some(_) => None,
            },
            birth_place: fill_opt(&existing.birth_place, &incoming.birth_place),
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Relationship between two stored persons
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NewRelationship {
    pub person1_id: PersonId,
    pub person2_id: PersonId,
    pub kind: RelationshipType,
    pub parent_role: Option<ParentRole>,
}

/// Read access to the tree plus the transactional write boundary
#[async_trait]
pub trait TreeStore: Send + Sync {
    /// Persons whose name is close enough to be worth scoring
    ///
    /// Candidates share a two-letter prefix of the last name (or of the first
    /// name when no last name is given); the matcher does the real scoring.
    async fn find_individuals_by_approximate_name(
        &self,
        first_name: &str,
        last_name: &str,
    ) -> Result<Vec<StoredIndividual>>;

    /// Summary recorded by the commit of `upload_id`, if it reached the tree
    async fn committed_summary(&self, upload_id: Uuid) -> Result<Option<ImportSummary>>;

    /// Open a write transaction
    async fn begin(&self) -> Result<Box<dyn TreeTransaction>>;
}

/// Writes made inside one transaction
///
/// Dropping without `commit` discards every write.
#[async_trait]
pub trait TreeTransaction: Send {
    async fn get_individual(&mut self, id: PersonId) -> Result<Option<StoredIndividual>>;

    async fn create_individual(&mut self, individual: &NewIndividual) -> Result<PersonId>;

    async fn update_individual_fields(&mut self, id: PersonId, update: &IndividualFieldUpdate) -> Result<()>;

    async fn create_relationship(&mut self, relationship: &NewRelationship) -> Result<()>;

    /// Spouse links match in either direction
    async fn relationship_exists(&mut self, relationship: &NewRelationship) -> Result<bool>;

    /// Ledger row for this upload; fails if the upload was already committed
    async fn record_commit(&mut self, upload_id: Uuid, summary: &ImportSummary) -> Result<()>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// [`TreeStore`] over the shared SQLite database
#[derive(Debug, Clone)]
pub struct SqliteTreeStore {
    pool: SqlitePool,
}

impl SqliteTreeStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

const PERSON_COLUMNS: &str = "id, first_name, last_name, birth_date, death_date, gender, birth_place";

fn person_from_row(row: &sqlx::sqlite::SqliteRow) -> StoredIndividual {
    let gender: Option<String> = row.get("gender");
    StoredIndividual {
        id: row.get("id"),
        first_name: row.get("first_name"),
        last_name: row.get("last_name"),
        birth_date: row.get("birth_date"),
        death_date: row.get("death_date"),
        gender: gender.as_deref().and_then(Gender::from_db),
        birth_place: row.get("birth_place"),
        parent_ids: BTreeSet::new(),
    }
}

/// Lowercased prefix used to block the name search
fn name_prefix(name: &str) -> Option<String> {
    let prefix: String = name.trim().to_lowercase().chars().take(2).collect();
    (!prefix.is_empty()).then_some(prefix)
}

#[async_trait]
impl TreeStore for SqliteTreeStore {
    async fn find_individuals_by_approximate_name(
        &self,
        first_name: &str,
        last_name: &str,
    ) -> Result<Vec<StoredIndividual>> {
        let (column, prefix) = match (name_prefix(last_name), name_prefix(first_name)) {
            (Some(prefix), _) => ("last_name", prefix),
            (None, Some(prefix)) => ("first_name", prefix),
            (None, None) => return Ok(Vec::new()),
        };

        let sql = format!(
            "SELECT {} FROM persons WHERE lower(trim({})) LIKE ? || '%' ORDER BY id",
            PERSON_COLUMNS, column
        );
        let rows = sqlx::query(&sql).bind(&prefix).fetch_all(&self.pool).await?;
        let mut persons: Vec<StoredIndividual> = rows.iter().map(person_from_row).collect();

        if persons.is_empty() {
            return Ok(persons);
        }

        let ids: Vec<String> = persons.iter().map(|p| p.id.to_string()).collect();
        let parent_sql = format!(
            "SELECT person1_id, person2_id FROM relationships \
             WHERE rel_type = 'parent_of' AND person2_id IN ({})",
            ids.join(",")
        );
        let mut parents: HashMap<PersonId, BTreeSet<PersonId>> = HashMap::new();
        for row in sqlx::query(&parent_sql).fetch_all(&self.pool).await? {
            let parent: PersonId = row.get("person1_id");
            let child: PersonId = row.get("person2_id");
            parents.entry(child).or_default().insert(parent);
        }

        for person in &mut persons {
            if let Some(ids) = parents.remove(&person.id) {
                person.parent_ids = ids;
            }
        }

        Ok(persons)
    }

    async fn committed_summary(&self, upload_id: Uuid) -> Result<Option<ImportSummary>> {
        let summary: Option<String> =
            sqlx::query_scalar("SELECT summary FROM import_commits WHERE upload_id = ?")
                .bind(upload_id.to_string())
                .fetch_optional(&self.pool)
                .await?;

        summary
            .map(|json| {
                serde_json::from_str(&json)
                    .map_err(|e| Error::Internal(format!("Failed to deserialize commit summary {}: {}", upload_id, e)))
            })
            .transpose()
    }

    async fn begin(&self) -> Result<Box<dyn TreeTransaction>> {
        let tx = begin_monitored(&self.pool, "tree_store::commit").await?;
        Ok(Box::new(SqliteTreeTransaction { tx }))
    }
}

/// Open write transaction on the tree database
pub struct SqliteTreeTransaction {
    tx: MonitoredTransaction,
}

#[async_trait]
impl TreeTransaction for SqliteTreeTransaction {
    async fn get_individual(&mut self, id: PersonId) -> Result<Option<StoredIndividual>> {
        let conn = self.tx.inner_mut()?;
        let sql = format!("SELECT {} FROM persons WHERE id = ?", PERSON_COLUMNS);
        let row = sqlx::query(&sql).bind(id).fetch_optional(&mut **conn).await?;
        let Some(mut person) = row.as_ref().map(person_from_row) else {
            return Ok(None);
        };

        let parents: Vec<PersonId> = sqlx::query_scalar(
            "SELECT person1_id FROM relationships WHERE rel_type = 'parent_of' AND person2_id = ?",
        )
        .bind(id)
        .fetch_all(&mut **conn)
        .await?;
        person.parent_ids = parents.into_iter().collect();

        Ok(Some(person))
    }

    async fn create_individual(&mut self, individual: &NewIndividual) -> Result<PersonId> {
        let conn = self.tx.inner_mut()?;
        let result = sqlx::query(
            r#"
            INSERT INTO persons (first_name, last_name, birth_date, death_date, gender, birth_place)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&individual.first_name)
        .bind(&individual.last_name)
        .bind(&individual.birth_date)
        .bind(&individual.death_date)
        .bind(individual.gender.map(|g| g.as_str()))
        .bind(&individual.birth_place)
        .execute(&mut **conn)
        .await?;

        Ok(result.last_insert_rowid())
    }

    async fn update_individual_fields(&mut self, id: PersonId, update: &IndividualFieldUpdate) -> Result<()> {
        if update.is_empty() {
            return Ok(());
        }

        let conn = self.tx.inner_mut()?;
        sqlx::query(
            r#"
            UPDATE persons SET
                first_name = COALESCE(?, first_name),
                last_name = COALESCE(?, last_name),
                birth_date = COALESCE(?, birth_date),
                death_date = COALESCE(?, death_date),
                gender = COALESCE(?, gender),
                birth_place = COALESCE(?, birth_place),
                updated_at = CURRENT_TIMESTAMP
            WHERE id = ?
            "#,
        )
        .bind(&update.first_name)
        .bind(&update.last_name)
        .bind(&update.birth_date)
        .bind(&update.death_date)
        .bind(update.gender.map(|g| g.as_str()))
        .bind(&update.birth_place)
        .bind(id)
        .execute(&mut **conn)
        .await?;

        Ok(())
    }

    async fn create_relationship(&mut self, relationship: &NewRelationship) -> Result<()> {
        let conn = self.tx.inner_mut()?;
        sqlx::query(
            r#"
            INSERT INTO relationships (person1_id, person2_id, rel_type, parent_role)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(relationship.person1_id)
        .bind(relationship.person2_id)
        .bind(relationship.kind.as_str())
        .bind(relationship.parent_role.map_or("", |r| r.as_str()))
        .execute(&mut **conn)
        .await?;

        Ok(())
    }

    async fn relationship_exists(&mut self, relationship: &NewRelationship) -> Result<bool> {
        let conn = self.tx.inner_mut()?;
        let role = relationship.parent_role.map_or("", |r| r.as_str());

        let count: i64 = match relationship.kind {
            RelationshipType::Spouse => {
                sqlx::query_scalar(
                    r#"
                    SELECT COUNT(*) FROM relationships
                    WHERE rel_type = 'spouse'
                      AND ((person1_id = ? AND person2_id = ?) OR (person1_id = ? AND person2_id = ?))
                    "#,
                )
                .bind(relationship.person1_id)
                .bind(relationship.person2_id)
                .bind(relationship.person2_id)
                .bind(relationship.person1_id)
                .fetch_one(&mut **conn)
                .await?
            }
            RelationshipType::ParentOf => {
                sqlx::query_scalar(
                    r#"
                    SELECT COUNT(*) FROM relationships
                    WHERE rel_type = 'parent_of' AND person1_id = ? AND person2_id = ? AND parent_role = ?
                    "#,
                )
                .bind(relationship.person1_id)
                .bind(relationship.person2_id)
                .bind(role)
                .fetch_one(&mut **conn)
                .await?
            }
        };

        Ok(count > 0)
    }

    async fn record_commit(&mut self, upload_id: Uuid, summary: &ImportSummary) -> Result<()> {
        let payload = serde_json::to_string(summary)
            .map_err(|e| Error::Internal(format!("Failed to serialize commit summary: {}", e)))?;

        let conn = self.tx.inner_mut()?;
        sqlx::query("INSERT INTO import_commits (upload_id, summary, committed_at) VALUES (?, ?, ?)")
            .bind(upload_id.to_string())
            .bind(payload)
            .bind(Utc::now().to_rfc3339())
            .execute(&mut **conn)
            .await?;

        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.tx.rollback().await
    }
}

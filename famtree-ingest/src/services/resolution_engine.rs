//! Resolution engine
//!
//! Applies an import session's decisions to the tree:
//!
//! 1. Validate: every individual with a candidate has a decision; the rest
//!    default to `import_as_new`.
//! 2. Individuals, in file order: create, merge (backfill empty fields of the
//!    target) or skip, building a sourceId → person id mapping.
//! 3. Relationships through the mapping. Ones touching a skipped individual
//!    are dropped and logged; ones already in the tree are not inserted again.
//!
//! All writes of one commit share a single transaction, which also records
//! the summary in the commit ledger. Any storage failure or cancellation
//! rolls the transaction back, fails the session, and reports the counts
//! reached as a partial summary. Once the transaction commits, the commit
//! succeeded whether or not the session save that follows does; a session
//! left RESOLVED is settled from the ledger, never applied twice. Commits
//! are serialized across the whole tree.

use chrono::Utc;
use famtree_common::events::FamtreeEvent;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::{CancellationRegistry, IngestError, IngestResult, SessionStore};
use crate::db::{IndividualFieldUpdate, NewIndividual, NewRelationship, TreeStore, TreeTransaction};
use crate::models::{
    ImportPhase, ImportSession, ImportState, ImportSummary, ParsedIndividual, PartialSummary, PersonId,
    Resolution, SkippedRelationship,
};

/// Default number of writes between cancellation checks and checkpoints
pub const DEFAULT_COMMIT_BATCH_SIZE: usize = 100;

/// Why a commit stopped before finishing
#[derive(Debug)]
enum CommitFailure {
    Storage(famtree_common::Error),
    MissingTarget { source_id: String, target: PersonId },
    Cancelled,
}

impl From<famtree_common::Error> for CommitFailure {
    fn from(err: famtree_common::Error) -> Self {
        CommitFailure::Storage(err)
    }
}

impl std::fmt::Display for CommitFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommitFailure::Storage(err) => write!(f, "{}", err),
            CommitFailure::MissingTarget { source_id, target } => {
                write!(f, "merge target person {} for {} no longer exists", target, source_id)
            }
            CommitFailure::Cancelled => write!(f, "Cancelled by operator"),
        }
    }
}

/// Applies resolved sessions to the tree
pub struct ResolutionEngine {
    sessions: Arc<SessionStore>,
    tree: Arc<dyn TreeStore>,
    tree_lock: Arc<Mutex<()>>,
    cancellations: Arc<CancellationRegistry>,
    batch_size: usize,
}

impl ResolutionEngine {
    pub fn new(
        sessions: Arc<SessionStore>,
        tree: Arc<dyn TreeStore>,
        cancellations: Arc<CancellationRegistry>,
        batch_size: usize,
    ) -> Self {
        Self {
            sessions,
            tree,
            tree_lock: Arc::new(Mutex::new(())),
            cancellations,
            batch_size: batch_size.max(1),
        }
    }

    /// Commit a session's decisions to the tree
    pub async fn commit(&self, upload_id: Uuid) -> IngestResult<ImportSummary> {
        let _guard = self.sessions.lock(upload_id).await;
        let mut session = self.sessions.get(upload_id).await?;

        // RESOLVED at rest means an earlier commit stopped; the ledger says whether it landed
        if session.state == ImportState::Resolved {
            if let Some(summary) = self.tree.committed_summary(upload_id).await? {
                self.reconcile_committed(session, summary).await;
                return Err(IngestError::AlreadyCommitted(upload_id));
            }
        }

        let plan = commit_plan(&session)?;
        advance_to_resolved(&mut session)?;

        let reporter = self.sessions.reporter();
        let operation = format!("Committing {} individuals", plan.len());
        reporter
            .checkpoint(&mut session, ImportPhase::Commit, 70, operation, None)
            .await;
        self.sessions.save(&session).await?;

        info!(
            upload_id = %upload_id,
            individuals = plan.len(),
            relationships = session.relationships.len(),
            "Commit started"
        );

        let token = self.cancellations.register(upload_id).await;
        let started = Instant::now();
        let mut summary = ImportSummary::default();

        let outcome = {
            let _tree_guard = self.tree_lock.lock().await;
            self.run_transaction(&mut session, &plan, &token, started, &mut summary)
                .await
        };
        self.cancellations.release(upload_id).await;

        match outcome {
            Ok(()) => Ok(self.finish_committed(session, summary).await),
            Err((failure, rolled_back)) => {
                // A COMMIT can report failure after it landed
                if let Ok(Some(recorded)) = self.tree.committed_summary(upload_id).await {
                    warn!(upload_id = %upload_id, error = %failure, "Commit reported failure but reached the ledger");
                    return Ok(self.finish_committed(session, recorded).await);
                }
                summary.duration_millis = started.elapsed().as_millis() as u64;
                self.finish_failed(session, summary, failure, rolled_back).await
            }
        }
    }

    /// Settle sessions a previous process left RESOLVED
    ///
    /// Sessions whose commit reached the ledger become COMMITTED; the rest
    /// fail, since their transaction never committed.
    pub async fn recover_interrupted(&self) -> IngestResult<usize> {
        let resolved = self.sessions.list_in_states(&[ImportState::Resolved]).await?;

        for &upload_id in &resolved {
            let _guard = self.sessions.lock(upload_id).await;
            let Some(mut session) = self.sessions.find(upload_id).await? else {
                continue;
            };
            if session.state != ImportState::Resolved {
                continue;
            }
            match self.tree.committed_summary(upload_id).await? {
                Some(summary) => self.reconcile_committed(session, summary).await,
                None => {
                    self.sessions
                        .mark_failed(
                            &mut session,
                            ImportPhase::Commit,
                            "Commit interrupted by restart; no changes were written",
                        )
                        .await?
                }
            }
        }

        Ok(resolved.len())
    }

    /// Open, fill, record and close the transaction
    ///
    /// On failure returns whether the rollback succeeded.
    async fn run_transaction(
        &self,
        session: &mut ImportSession,
        plan: &[(ParsedIndividual, Resolution)],
        token: &CancellationToken,
        started: Instant,
        summary: &mut ImportSummary,
    ) -> Result<(), (CommitFailure, bool)> {
        if token.is_cancelled() {
            return Err((CommitFailure::Cancelled, true));
        }

        let mut tx = self
            .tree
            .begin()
            .await
            .map_err(|e| (CommitFailure::Storage(e), true))?;

        let applied = match self.apply(session, plan, tx.as_mut(), token, summary).await {
            Ok(()) => {
                summary.duration_millis = started.elapsed().as_millis() as u64;
                tx.record_commit(session.upload_id, summary)
                    .await
                    .map_err(CommitFailure::Storage)
            }
            Err(failure) => Err(failure),
        };

        match applied {
            Ok(()) => tx.commit().await.map_err(|e| (CommitFailure::Storage(e), true)),
            Err(failure) => {
                let rolled_back = match tx.rollback().await {
                    Ok(()) => true,
                    Err(e) => {
                        error!(upload_id = %session.upload_id, error = %e, "Rollback failed");
                        false
                    }
                };
                Err((failure, rolled_back))
            }
        }
    }

    async fn apply(
        &self,
        session: &mut ImportSession,
        plan: &[(ParsedIndividual, Resolution)],
        tx: &mut dyn TreeTransaction,
        token: &CancellationToken,
        summary: &mut ImportSummary,
    ) -> Result<(), CommitFailure> {
        let reporter = self.sessions.reporter().clone();
        let mut mapping: HashMap<&str, Option<PersonId>> = HashMap::with_capacity(plan.len());

        for (index, (individual, resolution)) in plan.iter().enumerate() {
            if index > 0 && index % self.batch_size == 0 {
                if token.is_cancelled() {
                    return Err(CommitFailure::Cancelled);
                }
                let percentage = 70 + (20 * index / plan.len()) as u8;
                let operation = format!("Applied {} of {} individuals", index, plan.len());
                reporter
                    .checkpoint(session, ImportPhase::Commit, percentage, operation, None)
                    .await;
            }

            let person_id = match resolution {
                Resolution::ImportAsNew => {
                    let id = tx.create_individual(&NewIndividual::from(individual)).await?;
                    summary.persons_added += 1;
                    Some(id)
                }
                Resolution::Merge { target_person_id } => {
                    let existing = tx.get_individual(*target_person_id).await?.ok_or_else(|| {
                        CommitFailure::MissingTarget {
                            source_id: individual.source_id.clone(),
                            target: *target_person_id,
                        }
                    })?;
                    let update = IndividualFieldUpdate::backfill(&existing, individual);
                    tx.update_individual_fields(*target_person_id, &update).await?;
                    summary.persons_updated += 1;
                    Some(*target_person_id)
                }
                Resolution::Skip => {
                    summary.persons_skipped += 1;
                    None
                }
            };
            mapping.insert(individual.source_id.as_str(), person_id);
        }

        if token.is_cancelled() {
            return Err(CommitFailure::Cancelled);
        }

        let relationships = session.relationships.clone();
        let total = relationships.len();
        let mut skipped = Vec::new();

        for (index, relationship) in relationships.into_iter().enumerate() {
            if index > 0 && index % self.batch_size == 0 {
                if token.is_cancelled() {
                    return Err(CommitFailure::Cancelled);
                }
                let percentage = 90 + (8 * index / total) as u8;
                let operation = format!("Linked {} of {} relationships", index, total);
                reporter
                    .checkpoint(session, ImportPhase::Commit, percentage, operation, None)
                    .await;
            }

            let first = mapping.get(relationship.source_id1.as_str()).copied().flatten();
            let second = mapping.get(relationship.source_id2.as_str()).copied().flatten();

            let reason = match (first, second) {
                (None, _) => Some(format!("{} was not imported", relationship.source_id1)),
                (_, None) => Some(format!("{} was not imported", relationship.source_id2)),
                (Some(a), Some(b)) if a == b => Some(format!("both individuals map to person {}", a)),
                _ => None,
            };
            if let Some(reason) = reason {
                info!(
                    upload_id = %session.upload_id,
                    from = %relationship.source_id1,
                    to = %relationship.source_id2,
                    kind = relationship.kind.as_str(),
                    reason = %reason,
                    "Relationship skipped"
                );
                summary.relationships_skipped += 1;
                skipped.push(SkippedRelationship { relationship, reason });
                continue;
            }

            let (Some(person1_id), Some(person2_id)) = (first, second) else {
                continue;
            };
            let link = NewRelationship {
                person1_id,
                person2_id,
                kind: relationship.kind,
                parent_role: relationship.parent_role,
            };
            if tx.relationship_exists(&link).await? {
                summary.relationships_existing += 1;
                continue;
            }
            tx.create_relationship(&link).await?;
            summary.relationships_created += 1;
        }

        if token.is_cancelled() {
            return Err(CommitFailure::Cancelled);
        }

        session.skipped_relationships = skipped;
        Ok(())
    }

    /// Tree changes are durable at this point; a failed session save only
    /// adds a warning to the summary
    async fn finish_committed(&self, mut session: ImportSession, mut summary: ImportSummary) -> ImportSummary {
        let upload_id = session.upload_id;
        session.summary = Some(summary.clone());

        if let Err(e) = self.mark_committed(&mut session).await {
            warn!(upload_id = %upload_id, error = %e, "Changes committed but session state was not saved");
            summary.warning = Some(format!("Changes committed; session state not saved: {}", e));
        }

        info!(
            upload_id = %upload_id,
            persons_added = summary.persons_added,
            persons_updated = summary.persons_updated,
            persons_skipped = summary.persons_skipped,
            relationships_created = summary.relationships_created,
            relationships_skipped = summary.relationships_skipped,
            duration_ms = summary.duration_millis,
            "Import committed"
        );
        self.sessions
            .reporter()
            .event_bus()
            .emit_lossy(FamtreeEvent::ImportSessionCommitted {
                upload_id,
                persons_added: summary.persons_added,
                persons_updated: summary.persons_updated,
                persons_skipped: summary.persons_skipped,
                relationships_created: summary.relationships_created,
                duration_millis: summary.duration_millis,
                timestamp: Utc::now(),
            });

        summary
    }

    /// Bring a RESOLVED session whose commit is in the ledger up to COMMITTED
    async fn reconcile_committed(&self, mut session: ImportSession, summary: ImportSummary) {
        let upload_id = session.upload_id;
        session.summary = Some(summary);
        match self.mark_committed(&mut session).await {
            Ok(()) => info!(upload_id = %upload_id, "Session marked committed from the commit ledger"),
            Err(e) => warn!(upload_id = %upload_id, error = %e, "Committed session still not saved"),
        }
    }

    async fn mark_committed(&self, session: &mut ImportSession) -> IngestResult<()> {
        session
            .transition_to(ImportState::Committed)
            .map_err(|e| IngestError::InvalidState {
                upload_id: session.upload_id,
                state: e.from,
                action: "commit",
            })?;
        self.sessions.reporter().finish(session).await;
        self.sessions.save(session).await
    }

    async fn finish_failed(
        &self,
        mut session: ImportSession,
        summary: ImportSummary,
        failure: CommitFailure,
        rolled_back: bool,
    ) -> IngestResult<ImportSummary> {
        let upload_id = session.upload_id;
        let mut message = failure.to_string();
        if !rolled_back {
            message.push_str("; rollback failed, some writes may persist");
        }

        error!(
            upload_id = %upload_id,
            rolled_back,
            persons_added = summary.persons_added,
            error = %message,
            "Commit failed"
        );

        session.skipped_relationships.clear();
        if let Err(e) = self
            .sessions
            .mark_failed(&mut session, ImportPhase::Commit, message.clone())
            .await
        {
            // Nothing reached the ledger, so the stored RESOLVED session stays safe to retry
            error!(upload_id = %upload_id, error = %e, "Failed session was not saved");
        }

        match failure {
            CommitFailure::Cancelled if rolled_back => Err(IngestError::Cancelled(upload_id)),
            _ => Err(IngestError::Storage {
                upload_id,
                summary: PartialSummary::new(summary, rolled_back),
                message,
            }),
        }
    }
}

/// Resolution for every individual, in file order
fn commit_plan(session: &ImportSession) -> IngestResult<Vec<(ParsedIndividual, Resolution)>> {
    let upload_id = session.upload_id;
    match session.state {
        ImportState::Parsed | ImportState::AwaitingResolution | ImportState::Resolved => {}
        ImportState::Committed => return Err(IngestError::AlreadyCommitted(upload_id)),
        state => {
            return Err(IngestError::InvalidState {
                upload_id,
                state,
                action: "commit",
            })
        }
    }

    session
        .individuals
        .iter()
        .map(|individual| match session.effective_resolution(&individual.source_id) {
            Some(resolution) => Ok((individual.clone(), resolution)),
            None => {
                let reason = match session.candidates.get(&individual.source_id) {
                    Some(candidate) => format!(
                        "decision required: possible duplicate of person {} (confidence {})",
                        candidate.existing_person_id, candidate.confidence
                    ),
                    None => "decision required".to_string(),
                };
                Err(IngestError::validation(individual.source_id.clone(), reason))
            }
        })
        .collect()
}

fn advance_to_resolved(session: &mut ImportSession) -> IngestResult<()> {
    let path: &[ImportState] = match session.state {
        ImportState::Parsed => &[ImportState::AwaitingResolution, ImportState::Resolved],
        ImportState::AwaitingResolution => &[ImportState::Resolved],
        _ => &[],
    };
    for &next in path {
        session
            .transition_to(next)
            .map_err(|e| IngestError::InvalidState {
                upload_id: session.upload_id,
                state: e.from,
                action: "commit",
            })?;
    }
    Ok(())
}

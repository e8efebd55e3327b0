//! Import workflow coordinator
//!
//! Drives an upload from accepted bytes to a resolvable preview:
//!
//! ```text
//! UPLOADED → PARSING (parse, then match in generation order) → PARSED
//! ```
//!
//! Parsing runs in a background task so the upload request returns as soon
//! as the session exists. Decisions and commit are delegated to the session
//! store and the resolution engine.

use chrono::Utc;
use famtree_common::events::FamtreeEvent;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::{
    gedcom_parser, DuplicateMatcher, IngestError, IngestResult, ResolutionEngine, SessionStore,
};
use crate::db::TreeStore;
use crate::models::{
    DecisionPayload, ImportError, ImportPhase, ImportProgress, ImportSession, ImportState, ImportSummary,
    MatchCandidate, ParsedIndividual, ParsedRelationship, PersonId, RelationshipType,
};

/// Cancellation tokens of in-flight parses and commits
#[derive(Default)]
pub struct CancellationRegistry {
    tokens: RwLock<HashMap<Uuid, CancellationToken>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fresh token for an upload, replacing any previous one
    pub async fn register(&self, upload_id: Uuid) -> CancellationToken {
        let token = CancellationToken::new();
        self.tokens.write().await.insert(upload_id, token.clone());
        token
    }

    /// Cancel in-flight work; false when nothing is running for the upload
    pub async fn cancel(&self, upload_id: Uuid) -> bool {
        match self.tokens.read().await.get(&upload_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub async fn release(&self, upload_id: Uuid) {
        self.tokens.write().await.remove(&upload_id);
    }
}

/// Entry point for the import workflow
pub struct ImportCoordinator {
    sessions: Arc<SessionStore>,
    tree: Arc<dyn TreeStore>,
    matcher: DuplicateMatcher,
    engine: ResolutionEngine,
    cancellations: Arc<CancellationRegistry>,
    batch_size: usize,
}

impl ImportCoordinator {
    pub fn new(
        sessions: Arc<SessionStore>,
        tree: Arc<dyn TreeStore>,
        matcher: DuplicateMatcher,
        commit_batch_size: usize,
    ) -> Self {
        let cancellations = Arc::new(CancellationRegistry::new());
        let engine = ResolutionEngine::new(
            Arc::clone(&sessions),
            Arc::clone(&tree),
            Arc::clone(&cancellations),
            commit_batch_size,
        );
        Self {
            sessions,
            tree,
            matcher,
            engine,
            cancellations,
            batch_size: commit_batch_size.max(1),
        }
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    /// Accept an upload and start parsing it in the background
    pub async fn start_import(self: &Arc<Self>, file_name: &str, bytes: Vec<u8>) -> IngestResult<ImportSession> {
        let session = self.sessions.create(file_name).await?;
        let upload_id = session.upload_id;
        let token = self.cancellations.register(upload_id).await;

        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = coordinator.run_parse(upload_id, bytes, token).await {
                error!(upload_id = %upload_id, error = %e, "Import parse failed");
            }
        });

        Ok(session)
    }

    /// Parse and match one upload; the session ends PARSED or FAILED
    pub async fn run_parse(&self, upload_id: Uuid, bytes: Vec<u8>, token: CancellationToken) -> IngestResult<()> {
        let _guard = self.sessions.lock(upload_id).await;
        let result = self.parse_and_match(upload_id, bytes, &token).await;
        // Released under the lock so a commit's own token can't be dropped
        self.cancellations.release(upload_id).await;
        result
    }

    async fn parse_and_match(&self, upload_id: Uuid, bytes: Vec<u8>, token: &CancellationToken) -> IngestResult<()> {
        let mut session = self.sessions.get(upload_id).await?;
        let reporter = Arc::clone(self.sessions.reporter());

        if token.is_cancelled() {
            return self.cancelled(&mut session, ImportPhase::Upload).await;
        }

        session
            .transition_to(ImportState::Parsing)
            .map_err(|e| IngestError::InvalidState {
                upload_id,
                state: e.from,
                action: "parse",
            })?;
        let operation = format!("Parsing {} ({} bytes)", session.file_name, bytes.len());
        reporter
            .checkpoint(&mut session, ImportPhase::Parse, 5, operation, None)
            .await;
        self.sessions.save(&session).await?;
        info!(upload_id = %upload_id, file_name = %session.file_name, bytes = bytes.len(), "Parsing started");

        let parsed = tokio::task::spawn_blocking(move || gedcom_parser::parse(&bytes))
            .await
            .map_err(|e| famtree_common::Error::Internal(format!("Parser task failed: {}", e)))?;
        let outcome = match parsed {
            Ok(outcome) => outcome,
            Err(decode) => {
                self.sessions
                    .mark_failed(&mut session, ImportPhase::Parse, decode.to_string())
                    .await?;
                return Err(IngestError::Decode(decode));
            }
        };

        for parse_error in outcome.errors {
            reporter.log_error(&mut session, ImportError::from(parse_error));
        }
        session.individuals = outcome.individuals;
        session.relationships = outcome.relationships;

        let operation = format!(
            "Parsed {} individuals, {} relationships",
            session.individuals.len(),
            session.relationships.len()
        );
        reporter
            .checkpoint(&mut session, ImportPhase::Parse, 40, operation, None)
            .await;
        info!(
            upload_id = %upload_id,
            individuals = session.individuals.len(),
            relationships = session.relationships.len(),
            errors = session.errors.len(),
            "Parsing finished"
        );

        match self.find_candidates(&mut session, token).await {
            Some(candidates) => session.candidates = candidates,
            None => return self.cancelled(&mut session, ImportPhase::Match).await,
        }

        session
            .transition_to(ImportState::Parsed)
            .map_err(|e| IngestError::InvalidState {
                upload_id,
                state: e.from,
                action: "finish parse",
            })?;
        let operation = format!("Preview ready: {} decisions required", session.candidates.len());
        reporter
            .checkpoint(&mut session, ImportPhase::Review, 60, operation, None)
            .await;
        self.sessions.save(&session).await?;

        info!(upload_id = %upload_id, candidates = session.candidates.len(), "Preview ready");
        reporter.event_bus().emit_lossy(FamtreeEvent::ImportPreviewReady {
            upload_id,
            individuals: session.individuals.len(),
            relationships: session.relationships.len(),
            candidates: session.candidates.len(),
            errors: session.errors.len(),
            timestamp: Utc::now(),
        });

        Ok(())
    }

    /// Best existing match per individual; None when cancelled
    ///
    /// Parents are matched before their children so the parents criterion
    /// can use them. A failed lookup is logged against the individual and
    /// matching continues.
    async fn find_candidates(
        &self,
        session: &mut ImportSession,
        token: &CancellationToken,
    ) -> Option<BTreeMap<String, MatchCandidate>> {
        let reporter = Arc::clone(self.sessions.reporter());
        let individuals = session.individuals.clone();
        let relationships = session.relationships.clone();
        let parents = parents_by_child(&relationships);
        let order = generation_order(&individuals, &relationships);
        let total = order.len();
        let mut candidates: BTreeMap<String, MatchCandidate> = BTreeMap::new();

        for (done, index) in order.into_iter().enumerate() {
            if done % self.batch_size == 0 {
                if token.is_cancelled() {
                    return None;
                }
                let operation = format!("Matched {} of {} individuals", done, total);
                reporter
                    .checkpoint(session, ImportPhase::Match, 0, operation, Some((done, total)))
                    .await;
            }

            let individual = &individuals[index];
            let resolved_parents: BTreeSet<PersonId> = parents
                .get(individual.source_id.as_str())
                .into_iter()
                .flatten()
                .filter_map(|parent| candidates.get(*parent).map(|c| c.existing_person_id))
                .collect();
            let resolved_parents = (!resolved_parents.is_empty()).then_some(resolved_parents);

            let existing = match self
                .tree
                .find_individuals_by_approximate_name(&individual.first_name, &individual.last_name)
                .await
            {
                Ok(existing) => existing,
                Err(e) => {
                    warn!(upload_id = %session.upload_id, source_id = %individual.source_id, error = %e, "Duplicate lookup failed");
                    reporter.log_error(
                        session,
                        ImportError::for_source(
                            ImportPhase::Match,
                            &individual.source_id,
                            format!("duplicate lookup failed: {}", e),
                        ),
                    );
                    continue;
                }
            };

            if let Some(candidate) = self
                .matcher
                .match_individual(individual, resolved_parents.as_ref(), &existing)
            {
                candidates.insert(individual.source_id.clone(), candidate);
            }
        }

        if token.is_cancelled() {
            return None;
        }
        Some(candidates)
    }

    async fn cancelled(&self, session: &mut ImportSession, phase: ImportPhase) -> IngestResult<()> {
        self.sessions
            .mark_failed(session, phase, "Cancelled by operator")
            .await?;
        Err(IngestError::Cancelled(session.upload_id))
    }

    pub async fn record_decisions(
        &self,
        upload_id: Uuid,
        decisions: Vec<DecisionPayload>,
    ) -> IngestResult<ImportSession> {
        self.sessions.record_decisions(upload_id, decisions).await
    }

    pub async fn commit(&self, upload_id: Uuid) -> IngestResult<ImportSummary> {
        self.engine.commit(upload_id).await
    }

    /// Cancel a parse or commit
    ///
    /// In-flight work is signalled and fails the session itself; a session
    /// that is idle (e.g. awaiting decisions) is failed immediately.
    pub async fn cancel(&self, upload_id: Uuid) -> IngestResult<ImportSession> {
        if self.cancellations.cancel(upload_id).await {
            info!(upload_id = %upload_id, "Cancellation requested for in-flight import");
            return self.sessions.get(upload_id).await;
        }

        let _guard = self.sessions.lock(upload_id).await;
        let mut session = self.sessions.get(upload_id).await?;
        match session.state {
            ImportState::Committed => Err(IngestError::AlreadyCommitted(upload_id)),
            ImportState::Failed => Ok(session),
            state => {
                let phase = match state {
                    ImportState::Uploaded => ImportPhase::Upload,
                    ImportState::Parsing => ImportPhase::Parse,
                    ImportState::Resolved => ImportPhase::Commit,
                    _ => ImportPhase::Review,
                };
                self.sessions
                    .mark_failed(&mut session, phase, "Cancelled by operator")
                    .await?;
                Ok(session)
            }
        }
    }

    pub async fn session(&self, upload_id: Uuid) -> IngestResult<ImportSession> {
        self.sessions.get(upload_id).await
    }

    /// Latest progress, including checkpoints not yet persisted
    pub async fn progress(&self, upload_id: Uuid) -> IngestResult<(ImportState, ImportProgress)> {
        let session = self.sessions.get(upload_id).await?;
        let progress = match self.sessions.reporter().current(upload_id).await {
            Some(live) if live.percentage >= session.progress.percentage => live,
            _ => session.progress,
        };
        Ok((session.state, progress))
    }

    /// Settle sessions a previous process left mid-flight
    ///
    /// Interrupted parses fail; interrupted commits are resolved from the
    /// commit ledger.
    pub async fn recover_stale(&self) -> IngestResult<usize> {
        let parses = self.sessions.recover_stale().await?;
        let commits = self.engine.recover_interrupted().await?;
        Ok(parses + commits)
    }

    /// Evict sessions past the retention window
    pub async fn sweep_expired(&self) -> IngestResult<usize> {
        self.sessions.evict_expired(Utc::now()).await
    }
}

fn parents_by_child(relationships: &[ParsedRelationship]) -> HashMap<&str, Vec<&str>> {
    let mut parents: HashMap<&str, Vec<&str>> = HashMap::new();
    for rel in relationships.iter().filter(|r| r.kind == RelationshipType::ParentOf) {
        parents
            .entry(rel.source_id2.as_str())
            .or_default()
            .push(rel.source_id1.as_str());
    }
    parents
}

/// Indexes of `individuals`, parents before children (file order otherwise)
///
/// Individuals caught in a parent cycle are appended in file order.
fn generation_order(individuals: &[ParsedIndividual], relationships: &[ParsedRelationship]) -> Vec<usize> {
    let index: HashMap<&str, usize> = individuals
        .iter()
        .enumerate()
        .map(|(i, ind)| (ind.source_id.as_str(), i))
        .collect();

    let mut indegree = vec![0usize; individuals.len()];
    let mut children: Vec<Vec<usize>> = vec![Vec::new(); individuals.len()];
    for rel in relationships.iter().filter(|r| r.kind == RelationshipType::ParentOf) {
        if let (Some(&parent), Some(&child)) = (index.get(rel.source_id1.as_str()), index.get(rel.source_id2.as_str())) {
            children[parent].push(child);
            indegree[child] += 1;
        }
    }

    let mut queue: VecDeque<usize> = (0..individuals.len()).filter(|&i| indegree[i] == 0).collect();
    let mut order = Vec::with_capacity(individuals.len());
    let mut placed = vec![false; individuals.len()];

    while let Some(next) = queue.pop_front() {
        order.push(next);
        placed[next] = true;
        for &child in &children[next] {
            indegree[child] -= 1;
            if indegree[child] == 0 {
                queue.push_back(child);
            }
        }
    }

    order.extend((0..individuals.len()).filter(|&i| !placed[i]));
    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ParentRole;

    fn individual(id: &str) -> ParsedIndividual {
        ParsedIndividual {
            source_id: id.to_string(),
            first_name: String::new(),
            last_name: String::new(),
            birth_date: None,
            death_date: None,
            gender: None,
            birth_place: None,
        }
    }

    #[test]
    fn test_generation_order_puts_parents_first() {
        let individuals = vec![individual("@C@"), individual("@P@"), individual("@G@")];
        let relationships = vec![
            ParsedRelationship::parent_of("@P@", "@C@", ParentRole::Father).unwrap(),
            ParsedRelationship::parent_of("@G@", "@P@", ParentRole::Mother).unwrap(),
        ];
        assert_eq!(generation_order(&individuals, &relationships), vec![2, 1, 0]);
    }

    #[test]
    fn test_generation_order_survives_cycles() {
        let individuals = vec![individual("@A@"), individual("@B@"), individual("@C@")];
        let relationships = vec![
            ParsedRelationship::parent_of("@A@", "@B@", ParentRole::Father).unwrap(),
            ParsedRelationship::parent_of("@B@", "@A@", ParentRole::Father).unwrap(),
        ];
        assert_eq!(generation_order(&individuals, &relationships), vec![2, 0, 1]);
    }

    #[tokio::test]
    async fn test_cancel_registry() {
        let registry = CancellationRegistry::new();
        let id = Uuid::new_v4();
        assert!(!registry.cancel(id).await);

        let token = registry.register(id).await;
        assert!(registry.cancel(id).await);
        assert!(token.is_cancelled());

        registry.release(id).await;
        assert!(!registry.cancel(id).await);
    }
}

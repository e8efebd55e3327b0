//! Import session store
//!
//! Process-wide store of import sessions keyed by upload id.
//!
//! **Single writer:** every mutation of a session (parse, decisions, commit,
//! cancel, eviction) runs under that session's lock from [`SessionStore::lock`].
//! Different uploads never contend.
//!
//! **Retention:** uncommitted sessions older than the retention window are
//! evicted and leave a tombstone, so a later lookup reports "upload expired"
//! instead of "not found". Committed sessions are dropped one retention
//! window after they finished.
//!
//! Persistence goes through [`SessionBackend`]: [`MemorySessionBackend`] for
//! tests and single-process use, `db::SqliteSessionBackend` to survive
//! restarts.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use famtree_common::events::FamtreeEvent;
use famtree_common::Result;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::{info, warn};
use uuid::Uuid;

use super::{IngestError, IngestResult, ProgressReporter};
use crate::models::{
    DecisionPayload, ImportError, ImportPhase, ImportSession, ImportState, Resolution, ResolutionDecision,
};

/// Where sessions are kept
#[async_trait]
pub trait SessionBackend: Send + Sync {
    async fn load(&self, upload_id: Uuid) -> Result<Option<ImportSession>>;

    /// Insert or replace
    async fn save(&self, session: &ImportSession) -> Result<()>;

    /// Delete; with `tombstone`, remember the id as expired
    async fn remove(&self, upload_id: Uuid, tombstone: bool) -> Result<()>;

    async fn is_tombstoned(&self, upload_id: Uuid) -> Result<bool>;

    async fn list_created_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Uuid>>;

    async fn list_in_states(&self, states: &[ImportState]) -> Result<Vec<Uuid>>;
}

/// In-process session backend
#[derive(Default)]
pub struct MemorySessionBackend {
    sessions: RwLock<HashMap<Uuid, ImportSession>>,
    tombstones: RwLock<HashSet<Uuid>>,
}

impl MemorySessionBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionBackend for MemorySessionBackend {
    async fn load(&self, upload_id: Uuid) -> Result<Option<ImportSession>> {
        Ok(self.sessions.read().await.get(&upload_id).cloned())
    }

    async fn save(&self, session: &ImportSession) -> Result<()> {
        self.sessions
            .write()
            .await
            .insert(session.upload_id, session.clone());
        Ok(())
    }

    async fn remove(&self, upload_id: Uuid, tombstone: bool) -> Result<()> {
        self.sessions.write().await.remove(&upload_id);
        if tombstone {
            self.tombstones.write().await.insert(upload_id);
        }
        Ok(())
    }

    async fn is_tombstoned(&self, upload_id: Uuid) -> Result<bool> {
        Ok(self.tombstones.read().await.contains(&upload_id))
    }

    async fn list_created_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Uuid>> {
        let sessions = self.sessions.read().await;
        let mut matching: Vec<&ImportSession> = sessions.values().filter(|s| s.created_at < cutoff).collect();
        matching.sort_by_key(|s| s.created_at);
        Ok(matching.into_iter().map(|s| s.upload_id).collect())
    }

    async fn list_in_states(&self, states: &[ImportState]) -> Result<Vec<Uuid>> {
        let sessions = self.sessions.read().await;
        let mut matching: Vec<&ImportSession> = sessions.values().filter(|s| states.contains(&s.state)).collect();
        matching.sort_by_key(|s| s.created_at);
        Ok(matching.into_iter().map(|s| s.upload_id).collect())
    }
}

/// Keyed session store with per-session locks
pub struct SessionStore {
    backend: Arc<dyn SessionBackend>,
    locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
    retention: chrono::Duration,
    reporter: Arc<ProgressReporter>,
}

impl SessionStore {
    pub fn new(backend: Arc<dyn SessionBackend>, retention: chrono::Duration, reporter: Arc<ProgressReporter>) -> Self {
        Self {
            backend,
            locks: Mutex::new(HashMap::new()),
            retention,
            reporter,
        }
    }

    pub fn reporter(&self) -> &Arc<ProgressReporter> {
        &self.reporter
    }

    pub fn retention(&self) -> chrono::Duration {
        self.retention
    }

    /// Exclusive write access to one session
    pub async fn lock(&self, upload_id: Uuid) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks.entry(upload_id).or_default().clone()
        };
        lock.lock_owned().await
    }

    /// Create and persist a session for an accepted upload
    pub async fn create(&self, file_name: &str) -> IngestResult<ImportSession> {
        let session = ImportSession::new(file_name);
        self.backend.save(&session).await?;

        info!(upload_id = %session.upload_id, file_name, "Import session created");
        self.reporter.event_bus().emit_lossy(FamtreeEvent::ImportSessionStarted {
            upload_id: session.upload_id,
            file_name: session.file_name.clone(),
            timestamp: session.created_at,
        });

        Ok(session)
    }

    /// Current snapshot
    ///
    /// Sessions past the retention window report [`IngestError::SessionExpired`]
    /// even before the sweep removes them.
    pub async fn get(&self, upload_id: Uuid) -> IngestResult<ImportSession> {
        match self.backend.load(upload_id).await? {
            Some(session) if session.is_expired(self.retention, Utc::now()) => {
                Err(IngestError::SessionExpired(upload_id))
            }
            Some(session) => Ok(session),
            None if self.backend.is_tombstoned(upload_id).await? => Err(IngestError::SessionExpired(upload_id)),
            None => Err(IngestError::SessionNotFound(upload_id)),
        }
    }

    /// Stored session regardless of retention
    pub async fn find(&self, upload_id: Uuid) -> IngestResult<Option<ImportSession>> {
        Ok(self.backend.load(upload_id).await?)
    }

    pub async fn list_in_states(&self, states: &[ImportState]) -> IngestResult<Vec<Uuid>> {
        Ok(self.backend.list_in_states(states).await?)
    }

    pub async fn save(&self, session: &ImportSession) -> IngestResult<()> {
        self.backend.save(session).await?;
        Ok(())
    }

    /// Validate and record operator decisions
    ///
    /// All decisions are checked before any is applied; the first invalid
    /// one rejects the whole request and leaves the session untouched.
    /// Recording the same decisions again is a no-op apart from timestamps.
    pub async fn record_decisions(
        &self,
        upload_id: Uuid,
        payloads: Vec<DecisionPayload>,
    ) -> IngestResult<ImportSession> {
        let _guard = self.lock(upload_id).await;
        let mut session = self.get(upload_id).await?;

        match session.state {
            ImportState::Parsed | ImportState::AwaitingResolution => {}
            ImportState::Committed => return Err(IngestError::AlreadyCommitted(upload_id)),
            state => {
                return Err(IngestError::InvalidState {
                    upload_id,
                    state,
                    action: "record decisions",
                })
            }
        }

        let decisions = payloads
            .iter()
            .map(|payload| validate_decision(&session, payload))
            .collect::<IngestResult<Vec<_>>>()?;

        for decision in decisions {
            session.decisions.insert(decision.source_id.clone(), decision);
        }
        session
            .transition_to(ImportState::AwaitingResolution)
            .map_err(|e| IngestError::InvalidState {
                upload_id,
                state: e.from,
                action: "record decisions",
            })?;

        let pending = session.pending_decisions().len();
        let operation = format!(
            "{} decisions recorded, {} pending",
            session.decisions.len(),
            pending
        );
        self.reporter
            .checkpoint(&mut session, ImportPhase::Review, 65, operation, None)
            .await;
        self.save(&session).await?;

        info!(upload_id = %upload_id, recorded = payloads.len(), pending, "Decisions recorded");
        Ok(session)
    }

    /// Fail a session, record why, and persist it
    ///
    /// Caller must hold the session lock. Terminal sessions are left alone.
    pub async fn mark_failed(
        &self,
        session: &mut ImportSession,
        phase: ImportPhase,
        reason: impl Into<String>,
    ) -> IngestResult<()> {
        if session.is_terminal() {
            return Ok(());
        }

        let reason = reason.into();
        self.reporter
            .log_error(session, ImportError::general(phase, reason.clone()));
        session
            .transition_to(ImportState::Failed)
            .map_err(|e| IngestError::InvalidState {
                upload_id: session.upload_id,
                state: e.from,
                action: "fail",
            })?;
        self.reporter.finish(session).await;
        self.save(session).await?;

        warn!(upload_id = %session.upload_id, reason = %reason, "Import session failed");
        self.reporter.event_bus().emit_lossy(FamtreeEvent::ImportSessionFailed {
            upload_id: session.upload_id,
            error_message: reason,
            timestamp: Utc::now(),
        });
        Ok(())
    }

    /// Evict sessions past the retention window
    ///
    /// Returns how many sessions were removed.
    pub async fn evict_expired(&self, now: DateTime<Utc>) -> IngestResult<usize> {
        let cutoff = now - self.retention;
        let mut evicted = 0;

        for upload_id in self.backend.list_created_before(cutoff).await? {
            let _guard = self.lock(upload_id).await;
            let Some(session) = self.backend.load(upload_id).await? else {
                continue;
            };

            if session.state == ImportState::Committed {
                let finished = session.ended_at.unwrap_or(session.updated_at);
                if finished < cutoff {
                    self.backend.remove(upload_id, false).await?;
                    evicted += 1;
                }
                continue;
            }

            self.backend.remove(upload_id, true).await?;
            self.reporter.forget(upload_id).await;
            evicted += 1;

            info!(upload_id = %upload_id, state = session.state.as_str(), "Upload expired");
            self.reporter.event_bus().emit_lossy(FamtreeEvent::ImportSessionExpired {
                upload_id,
                timestamp: now,
            });
        }

        self.locks.lock().await.retain(|_, lock| Arc::strong_count(lock) > 1);
        Ok(evicted)
    }

    /// Fail sessions a previous process left mid-parse
    ///
    /// Interrupted commits are settled by the resolution engine, which can
    /// consult the commit ledger.
    pub async fn recover_stale(&self) -> IngestResult<usize> {
        let stale = self
            .backend
            .list_in_states(&[ImportState::Uploaded, ImportState::Parsing])
            .await?;

        for &upload_id in &stale {
            let _guard = self.lock(upload_id).await;
            let Some(mut session) = self.backend.load(upload_id).await? else {
                continue;
            };
            self.mark_failed(&mut session, ImportPhase::Parse, "Import interrupted by restart")
                .await?;
        }

        if !stale.is_empty() {
            warn!(count = stale.len(), "Marked interrupted import sessions as failed");
        }
        Ok(stale.len())
    }
}

fn validate_decision(session: &ImportSession, payload: &DecisionPayload) -> IngestResult<ResolutionDecision> {
    let source_id = payload.source_id.trim();
    if session.individual(source_id).is_none() {
        return Err(IngestError::validation(source_id, "no such individual in this upload"));
    }

    let resolution = payload
        .to_resolution()
        .map_err(|reason| IngestError::validation(source_id, reason))?;

    if let Resolution::Merge { target_person_id } = resolution {
        match session.candidates.get(source_id) {
            Some(candidate) if candidate.existing_person_id == target_person_id => {}
            Some(candidate) => {
                return Err(IngestError::validation(
                    source_id,
                    format!(
                        "targetPersonId {} does not match candidate person {}",
                        target_person_id, candidate.existing_person_id
                    ),
                ))
            }
            None => {
                return Err(IngestError::validation(
                    source_id,
                    "no duplicate candidate, merge is not available",
                ))
            }
        }
    }

    Ok(ResolutionDecision::new(source_id, resolution))
}

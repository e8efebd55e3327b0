//! Import session state machine
//!
//! UPLOADED → PARSING → PARSED → AWAITING_RESOLUTION → RESOLVED → COMMITTED,
//! with FAILED reachable from every non-terminal state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use uuid::Uuid;

use super::{
    ImportError, ImportSummary, MatchCandidate, ParsedIndividual, ParsedRelationship, Resolution,
    ResolutionDecision, SkippedRelationship,
};

/// Import session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ImportState {
    /// Bytes received, parse not started
    Uploaded,
    /// Parser and matcher running
    Parsing,
    /// Preview ready
    Parsed,
    /// At least one decision recorded
    AwaitingResolution,
    /// Decisions frozen, commit in progress
    Resolved,
    /// Changes written to the tree
    Committed,
    /// Decode failure, storage failure or cancellation
    Failed,
}

impl ImportState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImportState::Uploaded => "UPLOADED",
            ImportState::Parsing => "PARSING",
            ImportState::Parsed => "PARSED",
            ImportState::AwaitingResolution => "AWAITING_RESOLUTION",
            ImportState::Resolved => "RESOLVED",
            ImportState::Committed => "COMMITTED",
            ImportState::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ImportState::Committed | ImportState::Failed)
    }

    /// Whether `self → next` is a legal transition
    pub fn can_transition_to(&self, next: ImportState) -> bool {
        use ImportState::*;
        match (self, next) {
            (from, Failed) => !from.is_terminal(),
            (Uploaded, Parsing)
            | (Parsing, Parsed)
            | (Parsed, AwaitingResolution)
            | (AwaitingResolution, AwaitingResolution)
            | (AwaitingResolution, Resolved)
            | (Resolved, Committed) => true,
            _ => false,
        }
    }
}

/// Coarse pipeline phase, used for progress and the error log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImportPhase {
    Upload,
    Parse,
    Match,
    Review,
    Commit,
    Complete,
}

impl ImportPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImportPhase::Upload => "upload",
            ImportPhase::Parse => "parse",
            ImportPhase::Match => "match",
            ImportPhase::Review => "review",
            ImportPhase::Commit => "commit",
            ImportPhase::Complete => "complete",
        }
    }
}

/// Rejected state transition
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("cannot move import session from {from:?} to {to:?}")]
pub struct InvalidTransition {
    pub from: ImportState,
    pub to: ImportState,
}

/// Progress snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportProgress {
    pub phase: ImportPhase,

    /// 0-100, never decreases; 100 only once the session is terminal
    pub percentage: u8,

    /// Estimated remaining time (seconds), None if unknown
    pub estimated_remaining_seconds: Option<u64>,

    /// Current operation description
    pub current_operation: String,

    /// When the current phase started
    pub phase_started_at: DateTime<Utc>,
}

impl Default for ImportProgress {
    fn default() -> Self {
        Self {
            phase: ImportPhase::Upload,
            percentage: 0,
            estimated_remaining_seconds: None,
            current_operation: String::from("Waiting for parser..."),
            phase_started_at: Utc::now(),
        }
    }
}

/// Staged state of one upload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportSession {
    /// Opaque upload identifier
    pub upload_id: Uuid,

    /// File name supplied with the upload
    pub file_name: String,

    /// Current workflow state
    pub state: ImportState,

    /// Parsed individuals, in file order
    pub individuals: Vec<ParsedIndividual>,

    /// Synthesized relationships, in file order
    pub relationships: Vec<ParsedRelationship>,

    /// Best existing match per sourceId (only individuals that have one)
    pub candidates: BTreeMap<String, MatchCandidate>,

    /// Explicit operator decisions per sourceId
    pub decisions: BTreeMap<String, ResolutionDecision>,

    /// Append-only error log
    pub errors: Vec<ImportError>,

    /// Relationships dropped during the last commit attempt
    #[serde(default)]
    pub skipped_relationships: Vec<SkippedRelationship>,

    /// Progress tracking
    pub progress: ImportProgress,

    /// Set once, on successful commit
    pub summary: Option<ImportSummary>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    /// When the session reached a terminal state
    pub ended_at: Option<DateTime<Utc>>,
}

impl ImportSession {
    /// Create new session for an accepted upload
    pub fn new(file_name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            upload_id: Uuid::new_v4(),
            file_name: file_name.into(),
            state: ImportState::Uploaded,
            individuals: Vec::new(),
            relationships: Vec::new(),
            candidates: BTreeMap::new(),
            decisions: BTreeMap::new(),
            errors: Vec::new(),
            skipped_relationships: Vec::new(),
            progress: ImportProgress::default(),
            summary: None,
            created_at: now,
            updated_at: now,
            ended_at: None,
        }
    }

    /// Transition to new state
    pub fn transition_to(&mut self, new_state: ImportState) -> Result<(), InvalidTransition> {
        if !self.state.can_transition_to(new_state) {
            return Err(InvalidTransition {
                from: self.state,
                to: new_state,
            });
        }

        let now = Utc::now();
        self.state = new_state;
        self.updated_at = now;

        if new_state.is_terminal() {
            self.ended_at = Some(now);
        }

        Ok(())
    }

    /// Append to the error log
    pub fn add_error(&mut self, error: ImportError) {
        self.errors.push(error);
    }

    /// Check if session is terminal (finished)
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn individual(&self, source_id: &str) -> Option<&ParsedIndividual> {
        self.individuals.iter().find(|i| i.source_id == source_id)
    }

    /// Decision that applies at commit: the explicit one, else `ImportAsNew`
    /// for individuals without a candidate. None means a decision is still
    /// required.
    pub fn effective_resolution(&self, source_id: &str) -> Option<Resolution> {
        match self.decisions.get(source_id) {
            Some(decision) => Some(decision.resolution),
            None if self.candidates.contains_key(source_id) => None,
            None => Some(Resolution::ImportAsNew),
        }
    }

    /// Individuals with a candidate but no explicit decision, in file order
    pub fn pending_decisions(&self) -> Vec<&str> {
        self.individuals
            .iter()
            .map(|i| i.source_id.as_str())
            .filter(|id| self.effective_resolution(id).is_none())
            .collect()
    }

    /// True when the session outlived the retention window without committing
    pub fn is_expired(&self, retention: chrono::Duration, now: DateTime<Utc>) -> bool {
        self.state != ImportState::Committed && now - self.created_at > retention
    }
}

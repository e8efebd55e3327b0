//! Import pipeline services
//!
//! Data flow: upload bytes → [`gedcom_parser`] → [`duplicate_matcher`] →
//! preview in the [`session_store`] → operator decisions →
//! [`resolution_engine`] → tree writes. [`import_coordinator`] drives the
//! background part of the flow and [`progress_reporter`] publishes progress
//! throughout.

pub mod duplicate_matcher;
pub mod gedcom_parser;
pub mod import_coordinator;
pub mod progress_reporter;
pub mod resolution_engine;
pub mod session_store;

pub use duplicate_matcher::{DuplicateMatcher, DEFAULT_MATCH_THRESHOLD};
pub use gedcom_parser::{parse, DecodeError, ParseOutcome};
pub use import_coordinator::{CancellationRegistry, ImportCoordinator};
pub use progress_reporter::{csv_file_name, errors_to_csv, ProgressReporter};
pub use resolution_engine::ResolutionEngine;
pub use session_store::{MemorySessionBackend, SessionBackend, SessionStore};

use thiserror::Error;
use uuid::Uuid;

use crate::models::{ImportState, PartialSummary};

/// Import pipeline errors
#[derive(Debug, Error)]
pub enum IngestError {
    /// Upload bytes could not be decoded; fails the session
    #[error("Upload could not be decoded: {0}")]
    Decode(#[from] DecodeError),

    /// Request rejected, session unchanged
    #[error("Invalid decision for {source_id}: {reason}")]
    Validation { source_id: String, reason: String },

    #[error("Upload {0} not found")]
    SessionNotFound(Uuid),

    /// Evicted after the retention window; distinct from never existing
    #[error("Upload {0} expired")]
    SessionExpired(Uuid),

    #[error("Upload {upload_id} is {state:?}; cannot {action}")]
    InvalidState {
        upload_id: Uuid,
        state: ImportState,
        action: &'static str,
    },

    #[error("Upload {0} is already committed")]
    AlreadyCommitted(Uuid),

    /// Storage failure during commit; the session is failed
    #[error("Commit of upload {upload_id} failed: {message}")]
    Storage {
        upload_id: Uuid,
        summary: PartialSummary,
        message: String,
    },

    #[error("Upload {0} was cancelled")]
    Cancelled(Uuid),

    #[error(transparent)]
    Common(#[from] famtree_common::Error),
}

pub type IngestResult<T> = std::result::Result<T, IngestError>;

impl IngestError {
    pub fn validation(source_id: impl Into<String>, reason: impl Into<String>) -> Self {
        IngestError::Validation {
            source_id: source_id.into(),
            reason: reason.into(),
        }
    }
}

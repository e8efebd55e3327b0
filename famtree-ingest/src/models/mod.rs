//! Data models for famtree-ingest
//!
//! - Parsed GEDCOM records
//! - Duplicate match candidates
//! - Operator resolution decisions
//! - Import session state machine, progress and outcomes

pub mod decision;
pub mod import_result;
pub mod import_session;
pub mod matching;
pub mod parsed;

pub use decision::{DecisionPayload, Resolution, ResolutionDecision};
pub use import_result::{ImportError, ImportSummary, PartialSummary, SkippedRelationship};
pub use import_session::{ImportPhase, ImportProgress, ImportSession, ImportState, InvalidTransition};
pub use matching::{weighted_confidence, MatchCandidate, MatchCriterion, PersonId};
pub use parsed::{Gender, ParentRole, ParseError, ParsedIndividual, ParsedRelationship, RelationshipType};

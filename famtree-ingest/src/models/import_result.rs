//! Import outcomes and the error log
//!
//! Error log entries are append-only and carry enough context to render as a
//! `phase,reference,reason` CSV row.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{ImportPhase, ParseError, ParsedRelationship};

/// Error log entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportError {
    /// Phase in which the error occurred
    pub phase: ImportPhase,

    /// Line number ("line 12") or sourceId ("@I3@")
    pub reference: String,

    /// Human-readable reason
    pub reason: String,

    /// When the error occurred
    pub occurred_at: DateTime<Utc>,
}

impl ImportError {
    /// Error tied to a source individual
    pub fn for_source(phase: ImportPhase, source_id: &str, reason: impl Into<String>) -> Self {
        Self {
            phase,
            reference: source_id.to_string(),
            reason: reason.into(),
            occurred_at: Utc::now(),
        }
    }

    /// Error not tied to a line or individual
    pub fn general(phase: ImportPhase, reason: impl Into<String>) -> Self {
        Self {
            phase,
            reference: String::new(),
            reason: reason.into(),
            occurred_at: Utc::now(),
        }
    }
}

impl From<ParseError> for ImportError {
    fn from(err: ParseError) -> Self {
        Self {
            phase: ImportPhase::Parse,
            reference: format!("line {}", err.line_number),
            reason: format!("{}: {}", err.reason, err.raw_line.trim()),
            occurred_at: Utc::now(),
        }
    }
}

/// Relationship dropped at commit because one side was not imported
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SkippedRelationship {
    pub relationship: ParsedRelationship,
    pub reason: String,
}

/// Counts produced by a commit
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportSummary {
    pub persons_added: usize,
    /// Individuals merged into an existing person
    pub persons_updated: usize,
    pub persons_skipped: usize,
    pub relationships_created: usize,
    /// Dropped because one side was skipped
    pub relationships_skipped: usize,
    /// Already present in the tree, not inserted again
    pub relationships_existing: usize,
    pub duration_millis: u64,
    /// Set when the tree changes were written but the session could not be saved
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

/// Counts reached by a commit that did not finish
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartialSummary {
    pub summary: ImportSummary,
    /// Always true; distinguishes this payload from a completed summary
    pub partial: bool,
    /// True when every write of the commit was rolled back
    pub rolled_back: bool,
}

impl PartialSummary {
    pub fn new(summary: ImportSummary, rolled_back: bool) -> Self {
        Self {
            summary,
            partial: true,
            rolled_back,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_error_conversion() {
        let err = ImportError::from(ParseError {
            line_number: 7,
            raw_line: "x NAME Bob".to_string(),
            reason: "level is not a non-negative integer".to_string(),
        });
        assert_eq!(err.phase, ImportPhase::Parse);
        assert_eq!(err.reference, "line 7");
        assert!(err.reason.starts_with("level is not a non-negative integer"));
        assert!(err.reason.ends_with("x NAME Bob"));
    }

    #[test]
    fn test_partial_summary_is_marked() {
        let partial = PartialSummary::new(ImportSummary::default(), true);
        let json = serde_json::to_value(&partial).unwrap();
        assert_eq!(json["partial"], true);
        assert_eq!(json["rolledBack"], true);
        assert_eq!(json["summary"]["personsAdded"], 0);
    }
}

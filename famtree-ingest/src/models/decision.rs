//! Operator resolution decisions
//!
//! The wire payload ([`DecisionPayload`]) is deliberately loose so a bad
//! submission can be rejected with the offending `sourceId`. Once validated it
//! becomes a [`ResolutionDecision`] whose [`Resolution`] only carries the
//! fields valid for its case.

use serde::{Deserialize, Serialize};

use super::PersonId;

/// What to do with one parsed individual at commit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "resolution", rename_all = "snake_case")]
pub enum Resolution {
    /// Map onto an existing person, backfilling its empty fields
    Merge {
        #[serde(rename = "targetPersonId")]
        target_person_id: PersonId,
    },
    /// Create a new person
    ImportAsNew,
    /// Ignore the individual and every relationship touching it
    Skip,
}

impl Resolution {
    pub fn label(&self) -> &'static str {
        match self {
            Resolution::Merge { .. } => "merge",
            Resolution::ImportAsNew => "import_as_new",
            Resolution::Skip => "skip",
        }
    }
}

/// Validated decision for one parsed individual
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolutionDecision {
    pub source_id: String,
    #[serde(flatten)]
    pub resolution: Resolution,
}

impl ResolutionDecision {
    pub fn new(source_id: impl Into<String>, resolution: Resolution) -> Self {
        Self {
            source_id: source_id.into(),
            resolution,
        }
    }
}

/// Decision as submitted by a caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionPayload {
    pub source_id: String,
    pub resolution: String,
    #[serde(default)]
    pub target_person_id: Option<PersonId>,
}

impl DecisionPayload {
    /// Shape check: known resolution, `targetPersonId` present iff merge
    ///
    /// Returns a human-readable reason on failure. Whether a merge target
    /// matches the stored candidate is checked by the session store, which
    /// owns the candidates.
    pub fn to_resolution(&self) -> Result<Resolution, String> {
        match (self.resolution.trim(), self.target_person_id) {
            ("merge", Some(target_person_id)) => Ok(Resolution::Merge { target_person_id }),
            ("merge", None) => Err("merge requires targetPersonId".to_string()),
            ("import_as_new", None) => Ok(Resolution::ImportAsNew),
            ("skip", None) => Ok(Resolution::Skip),
            ("import_as_new" | "skip", Some(_)) => Err(format!(
                "targetPersonId is only valid for merge, not {}",
                self.resolution.trim()
            )),
            (other, _) => Err(format!(
                "unknown resolution '{}' (expected merge, import_as_new or skip)",
                other
            )),
        }
    }
}

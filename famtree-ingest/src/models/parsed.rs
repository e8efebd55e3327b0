//! Records produced by the GEDCOM parser

use serde::{Deserialize, Serialize};

/// Recorded sex of an individual (`SEX` tag)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Gender {
    Male,
    Female,
    Unknown,
}

impl Gender {
    /// Parse a GEDCOM `SEX` value (`M`, `F`, `U`), case-insensitive
    pub fn from_gedcom(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "M" => Some(Gender::Male),
            "F" => Some(Gender::Female),
            "U" => Some(Gender::Unknown),
            _ => None,
        }
    }

    /// Storage representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Gender::Male => "male",
            Gender::Female => "female",
            Gender::Unknown => "unknown",
        }
    }

    /// Parse the storage representation
    pub fn from_db(value: &str) -> Option<Self> {
        match value {
            "male" => Some(Gender::Male),
            "female" => Some(Gender::Female),
            "unknown" => Some(Gender::Unknown),
            _ => None,
        }
    }
}

/// Individual extracted from an `INDI` record
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedIndividual {
    /// Cross-reference identifier from the file (e.g. `@I1@`)
    pub source_id: String,
    pub first_name: String,
    pub last_name: String,
    pub birth_date: Option<String>,
    pub death_date: Option<String>,
    pub gender: Option<Gender>,
    pub birth_place: Option<String>,
}

/// Kind of link between two individuals
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RelationshipType {
    /// `source_id1` is a parent of `source_id2`
    ParentOf,
    /// Symmetric marriage/partnership link
    Spouse,
}

impl RelationshipType {
    /// Storage representation
    pub fn as_str(&self) -> &'static str {
        match self {
            RelationshipType::ParentOf => "parent_of",
            RelationshipType::Spouse => "spouse",
        }
    }
}

/// Role of the parent in a `ParentOf` relationship
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParentRole {
    Mother,
    Father,
}

impl ParentRole {
    /// Storage representation
    pub fn as_str(&self) -> &'static str {
        match self {
            ParentRole::Mother => "mother",
            ParentRole::Father => "father",
        }
    }
}

/// Pairwise relationship synthesized from family linkage
///
/// Constructed only through [`ParsedRelationship::parent_of`] and
/// [`ParsedRelationship::spouse`], which enforce that the two sides differ
/// and that `parent_role` is present exactly for `ParentOf`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedRelationship {
    pub source_id1: String,
    pub source_id2: String,
    #[serde(rename = "type")]
    pub kind: RelationshipType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_role: Option<ParentRole>,
}

impl ParsedRelationship {
    /// `parent` is the `role` parent of `child`; None when both ids are equal
    pub fn parent_of(parent: &str, child: &str, role: ParentRole) -> Option<Self> {
        (parent != child).then(|| Self {
            source_id1: parent.to_string(),
            source_id2: child.to_string(),
            kind: RelationshipType::ParentOf,
            parent_role: Some(role),
        })
    }

    /// Spouse link; None when both ids are equal
    pub fn spouse(a: &str, b: &str) -> Option<Self> {
        (a != b).then(|| Self {
            source_id1: a.to_string(),
            source_id2: b.to_string(),
            kind: RelationshipType::Spouse,
            parent_role: None,
        })
    }

    /// True when either side is `source_id`
    pub fn involves(&self, source_id: &str) -> bool {
        self.source_id1 == source_id || self.source_id2 == source_id
    }
}

/// Malformed input line, recorded and skipped
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParseError {
    /// 1-based line number
    pub line_number: usize,
    pub raw_line: String,
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relationship_constructors_reject_self_links() {
        assert!(ParsedRelationship::parent_of("@I1@", "@I1@", ParentRole::Father).is_none());
        assert!(ParsedRelationship::spouse("@I1@", "@I1@").is_none());

        let rel = ParsedRelationship::parent_of("@I1@", "@I2@", ParentRole::Mother).unwrap();
        assert_eq!(rel.kind, RelationshipType::ParentOf);
        assert_eq!(rel.parent_role, Some(ParentRole::Mother));
        assert!(rel.involves("@I2@"));
        assert!(!rel.involves("@I3@"));
    }

    #[test]
    fn test_gender_codes() {
        assert_eq!(Gender::from_gedcom("m"), Some(Gender::Male));
        assert_eq!(Gender::from_gedcom(" F "), Some(Gender::Female));
        assert_eq!(Gender::from_gedcom("U"), Some(Gender::Unknown));
        assert_eq!(Gender::from_gedcom("X"), None);
        assert_eq!(Gender::from_db(Gender::Female.as_str()), Some(Gender::Female));
    }

    #[test]
    fn test_relationship_wire_shape() {
        let rel = ParsedRelationship::spouse("@I1@", "@I2@").unwrap();
        let json = serde_json::to_value(&rel).unwrap();
        assert_eq!(json["type"], "spouse");
        assert_eq!(json["sourceId1"], "@I1@");
        assert!(json.get("parentRole").is_none());
    }
}

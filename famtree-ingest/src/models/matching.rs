//! Duplicate match candidates

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Store-assigned person identifier
pub type PersonId = i64;

/// Criteria contributing to a duplicate-match confidence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MatchCriterion {
    Name,
    BirthDate,
    BirthPlace,
    Parents,
}

impl MatchCriterion {
    pub const ALL: [MatchCriterion; 4] = [
        MatchCriterion::Name,
        MatchCriterion::BirthDate,
        MatchCriterion::BirthPlace,
        MatchCriterion::Parents,
    ];

    /// Fixed weight; the four weights sum to 1.0
    pub fn weight(&self) -> f64 {
        match self {
            MatchCriterion::Name => 0.4,
            MatchCriterion::BirthDate => 0.3,
            MatchCriterion::BirthPlace => 0.1,
            MatchCriterion::Parents => 0.2,
        }
    }
}

/// Best existing person for one parsed individual
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchCandidate {
    pub source_id: String,
    pub existing_person_id: PersonId,
    /// 0-100
    pub confidence: u8,
    /// Per-criterion score (0-100); criteria that could not be evaluated are absent
    pub match_details: BTreeMap<MatchCriterion, u8>,
}

impl MatchCandidate {
    /// Build a candidate, deriving confidence from the present criteria
    pub fn new(
        source_id: impl Into<String>,
        existing_person_id: PersonId,
        match_details: BTreeMap<MatchCriterion, u8>,
    ) -> Self {
        let confidence = weighted_confidence(&match_details);
        Self {
            source_id: source_id.into(),
            existing_person_id,
            confidence,
            match_details,
        }
    }
}

/// Weighted average of the present criteria, renormalized over their weights
/// and rounded half-up. No criteria yields 0.
pub fn weighted_confidence(details: &BTreeMap<MatchCriterion, u8>) -> u8 {
    let (numerator, denominator) = details.iter().fold((0.0_f64, 0.0_f64), |(num, den), (c, s)| {
        (num + f64::from(*s) * c.weight(), den + c.weight())
    });

    if denominator <= 0.0 {
        return 0;
    }

    let average = numerator / denominator;
    // Small epsilon absorbs float noise such as 99.99999999999999 for exact ties
    (average + 0.5 + 1e-9).floor().clamp(0.0, 100.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    fn details(pairs: &[(MatchCriterion, u8)]) -> BTreeMap<MatchCriterion, u8> {
        pairs.iter().copied().collect()
    }

    #[test]
    fn test_weights_sum_to_one() {
        let total: f64 = MatchCriterion::ALL.iter().map(|c| c.weight()).sum();
        assert!((total - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_absent_criteria_are_renormalized() {
        // name + birth date exact, place and parents unknown
        let d = details(&[(MatchCriterion::Name, 100), (MatchCriterion::BirthDate, 100)]);
        assert_eq!(weighted_confidence(&d), 100);
    }

    #[test]
    fn test_rounds_half_up() {
        // (0.4*50 + 0.1*55) / 0.5 = 51.0
        let d = details(&[(MatchCriterion::Name, 50), (MatchCriterion::BirthPlace, 55)]);
        assert_eq!(weighted_confidence(&d), 51);

        // (0.4*81 + 0.3*0) / 0.7 = 46.2857 => 46
        let d = details(&[(MatchCriterion::Name, 81), (MatchCriterion::BirthDate, 0)]);
        assert_eq!(weighted_confidence(&d), 46);

        // (0.4*75 + 0.2*0) / 0.6 = 50.0
        let d = details(&[(MatchCriterion::Name, 75), (MatchCriterion::Parents, 0)]);
        assert_eq!(weighted_confidence(&d), 50);

        // (0.4*61 + 0.2*0)/0.6 = 40.666 => 41
        let d = details(&[(MatchCriterion::Name, 61), (MatchCriterion::Parents, 0)]);
        assert_eq!(weighted_confidence(&d), 41);
    }

    #[test]
    fn test_no_criteria_is_zero() {
        assert_eq!(weighted_confidence(&BTreeMap::new()), 0);
    }

    #[test]
    fn test_candidate_serializes_details_by_name() {
        let candidate = MatchCandidate::new(
            "@I1@",
            42,
            details(&[(MatchCriterion::Name, 100), (MatchCriterion::BirthDate, 100)]),
        );
        let json = serde_json::to_value(&candidate).unwrap();
        assert_eq!(json["confidence"], 100);
        assert_eq!(json["existingPersonId"], 42);
        assert_eq!(json["matchDetails"]["birthDate"], 100);
    }
}

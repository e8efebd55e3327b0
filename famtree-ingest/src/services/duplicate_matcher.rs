//! Duplicate matcher
//!
//! Scores a parsed individual against people already in the tree. Each
//! criterion yields 0-100 or is left out when either side lacks the data:
//!
//! | criterion  | weight | score                                            |
//! |------------|--------|--------------------------------------------------|
//! | name       | 0.4    | 100 on normalized equality, else Levenshtein     |
//! | birthDate  | 0.3    | 100 equal, 0 different                           |
//! | birthPlace | 0.1    | 100 equal, left out otherwise                    |
//! | parents    | 0.2    | 100 if matched parents are recorded parents, 0   |
//!
//! Only the best existing person is kept, and only when its confidence
//! reaches the threshold.

use std::collections::{BTreeMap, BTreeSet};

use crate::db::StoredIndividual;
use crate::models::{MatchCandidate, MatchCriterion, ParsedIndividual, PersonId};

/// Minimum confidence for a candidate to be reported
pub const DEFAULT_MATCH_THRESHOLD: u8 = 50;

/// Duplicate matcher with a fixed confidence threshold
#[derive(Debug, Clone, Copy)]
pub struct DuplicateMatcher {
    threshold: u8,
}

impl Default for DuplicateMatcher {
    fn default() -> Self {
        Self::new(DEFAULT_MATCH_THRESHOLD)
    }
}

impl DuplicateMatcher {
    pub fn new(threshold: u8) -> Self {
        Self {
            threshold: threshold.min(100),
        }
    }

    pub fn threshold(&self) -> u8 {
        self.threshold
    }

    /// Best existing person for `individual`, if any reaches the threshold
    ///
    /// `resolved_parents` holds the existing ids that the individual's parsed
    /// parents were already matched to; None when no parent is matched.
    /// Ties go to the lowest person id.
    pub fn match_individual(
        &self,
        individual: &ParsedIndividual,
        resolved_parents: Option<&BTreeSet<PersonId>>,
        existing: &[StoredIndividual],
    ) -> Option<MatchCandidate> {
        let mut best: Option<MatchCandidate> = None;

        for person in existing {
            let details = self.score(individual, resolved_parents, person);
            let candidate = MatchCandidate::new(individual.source_id.clone(), person.id, details);

            let better = match &best {
                None => true,
                Some(current) => {
                    candidate.confidence > current.confidence
                        || (candidate.confidence == current.confidence
                            && candidate.existing_person_id < current.existing_person_id)
                }
            };
            if better {
                best = Some(candidate);
            }
        }

        best.filter(|c| c.confidence >= self.threshold)
    }

    /// Per-criterion scores; criteria that cannot be evaluated are absent
    pub fn score(
        &self,
        individual: &ParsedIndividual,
        resolved_parents: Option<&BTreeSet<PersonId>>,
        existing: &StoredIndividual,
    ) -> BTreeMap<MatchCriterion, u8> {
        let mut details = BTreeMap::new();

        if let Some(score) = name_score(
            &full_name(&individual.first_name, &individual.last_name),
            &full_name(&existing.first_name, &existing.last_name),
        ) {
            details.insert(MatchCriterion::Name, score);
        }

        if let (Some(a), Some(b)) = (&individual.birth_date, &existing.birth_date) {
            let equal = normalize(a) == normalize(b);
            details.insert(MatchCriterion::BirthDate, if equal { 100 } else { 0 });
        }

        if let (Some(a), Some(b)) = (&individual.birth_place, &existing.birth_place) {
            if normalize(a) == normalize(b) {
                details.insert(MatchCriterion::BirthPlace, 100);
            }
        }

        if let Some(parents) = resolved_parents.filter(|p| !p.is_empty()) {
            if !existing.parent_ids.is_empty() {
                let coincide = parents.is_subset(&existing.parent_ids);
                details.insert(MatchCriterion::Parents, if coincide { 100 } else { 0 });
            }
        }

        details
    }
}

/// Lowercased, trimmed, single-spaced
fn normalize(value: &str) -> String {
    value
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn full_name(first: &str, last: &str) -> String {
    normalize(&format!("{} {}", first, last))
}

fn name_score(a: &str, b: &str) -> Option<u8> {
    if a.is_empty() || b.is_empty() {
        return None;
    }
    if a == b {
        return Some(100);
    }
    let similarity = strsim::normalized_levenshtein(a, b);
    Some((similarity * 100.0).round().clamp(0.0, 100.0) as u8)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::weighted_confidence;

    fn parsed(first: &str, last: &str, birth: Option<&str>) -> ParsedIndividual {
        ParsedIndividual {
            source_id: "@I1@".to_string(),
            first_name: first.to_string(),
            last_name: last.to_string(),
            birth_date: birth.map(String::from),
            death_date: None,
            gender: None,
            birth_place: None,
        }
    }

    fn stored(id: PersonId, first: &str, last: &str, birth: Option<&str>) -> StoredIndividual {
        StoredIndividual {
            id,
            first_name: first.to_string(),
            last_name: last.to_string(),
            birth_date: birth.map(String::from),
            death_date: None,
            gender: None,
            birth_place: None,
            parent_ids: BTreeSet::new(),
        }
    }

    #[test]
    fn test_exact_name_and_birth_date_is_full_confidence() {
        let matcher = DuplicateMatcher::default();
        let candidate = matcher
            .match_individual(
                &parsed("John", "Smith", Some("1 JAN 1900")),
                None,
                &[stored(7, " john ", "SMITH", Some("1 jan 1900"))],
            )
            .unwrap();

        assert_eq!(candidate.confidence, 100);
        assert_eq!(candidate.existing_person_id, 7);
        assert_eq!(candidate.match_details.len(), 2);
        assert!(!candidate.match_details.contains_key(&MatchCriterion::BirthPlace));
        assert!(!candidate.match_details.contains_key(&MatchCriterion::Parents));
    }

    #[test]
    fn test_below_threshold_yields_nothing() {
        let matcher = DuplicateMatcher::default();
        let result = matcher.match_individual(
            &parsed("John", "Smith", Some("1900")),
            None,
            &[stored(1, "Jon", "Smyth", Some("1950"))],
        );
        assert!(result.is_none());
    }

    #[test]
    fn test_graded_name_similarity() {
        let matcher = DuplicateMatcher::default();
        let details = matcher.score(&parsed("Jon", "Smith", None), None, &stored(1, "John", "Smith", None));
        let name = details[&MatchCriterion::Name];
        assert!(name > 80 && name < 100, "name score {}", name);
    }

    #[test]
    fn test_best_candidate_and_tie_break() {
        let matcher = DuplicateMatcher::default();
        let existing = [
            stored(9, "Ann", "Lee", None),
            stored(3, "Ann", "Lee", None),
            stored(5, "Anne", "Lee", None),
        ];
        let candidate = matcher
            .match_individual(&parsed("Ann", "Lee", None), None, &existing)
            .unwrap();
        assert_eq!(candidate.existing_person_id, 3);
    }

    #[test]
    fn test_parents_criterion() {
        let matcher = DuplicateMatcher::default();
        let mut person = stored(1, "Ann", "Lee", None);
        let individual = parsed("Ann", "Lee", None);
        let resolved: BTreeSet<PersonId> = [10].into_iter().collect();

        // unknown on the stored side
        let details = matcher.score(&individual, Some(&resolved), &person);
        assert!(!details.contains_key(&MatchCriterion::Parents));

        person.parent_ids = [10, 11].into_iter().collect();
        let details = matcher.score(&individual, Some(&resolved), &person);
        assert_eq!(details[&MatchCriterion::Parents], 100);

        let other: BTreeSet<PersonId> = [12].into_iter().collect();
        let details = matcher.score(&individual, Some(&other), &person);
        assert_eq!(details[&MatchCriterion::Parents], 0);

        // unknown on the parsed side
        let details = matcher.score(&individual, None, &person);
        assert!(!details.contains_key(&MatchCriterion::Parents));
    }

    #[test]
    fn test_empty_names_are_not_scored() {
        let matcher = DuplicateMatcher::default();
        let details = matcher.score(&parsed("", "", Some("1900")), None, &stored(1, "Ann", "Lee", Some("1900")));
        assert!(!details.contains_key(&MatchCriterion::Name));
        assert_eq!(details[&MatchCriterion::BirthDate], 100);
    }

    #[test]
    fn test_confidence_is_bounded_and_monotonic() {
        for name in (0..=100u8).step_by(5) {
            let mut previous = None;
            for date in [100u8, 0] {
                let details: BTreeMap<_, _> = [
                    (MatchCriterion::Name, name),
                    (MatchCriterion::BirthDate, date),
                    (MatchCriterion::Parents, 100),
                ]
                .into_iter()
                .collect();
                let confidence = weighted_confidence(&details);
                assert!(confidence <= 100);
                if let Some(prev) = previous {
                    assert!(confidence <= prev);
                }
                previous = Some(confidence);
            }
        }
    }
}

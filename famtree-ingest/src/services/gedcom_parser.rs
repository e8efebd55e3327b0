//! GEDCOM record parser
//!
//! Turns raw upload bytes into [`ParsedIndividual`] and [`ParsedRelationship`]
//! records. Only the subset of GEDCOM needed for matching is understood:
//!
//! - `INDI` with `NAME` (and `GIVN`/`SURN`), `SEX`, `BIRT`/`DEAT` with
//!   `DATE`/`PLAC`, `FAMS`, `FAMC`
//! - `FAM` with `HUSB`, `WIFE`, `CHIL`
//!
//! Every other record and tag is skipped silently. Malformed lines become
//! [`ParseError`]s and scanning continues; only bytes that are not UTF-8 fail
//! the whole parse.
//!
//! Scanning is a single fold over the lines. Family linkage is resolved after
//! the scan because `FAM` records usually follow the individuals they
//! reference.

use std::collections::{HashMap, HashSet};
use thiserror::Error;

use crate::models::{Gender, ParentRole, ParseError, ParsedIndividual, ParsedRelationship};

const BYTE_ORDER_MARK: char = '\u{feff}';

/// Upload that cannot be decoded at all
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("file is not valid UTF-8 (invalid byte sequence at offset {offset})")]
    InvalidUtf8 { offset: usize },
}

/// Result of a successful parse
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParseOutcome {
    /// Individuals in file order
    pub individuals: Vec<ParsedIndividual>,
    /// Relationships in family order, deduplicated
    pub relationships: Vec<ParsedRelationship>,
    /// Malformed lines and unresolved references, by line number
    pub errors: Vec<ParseError>,
}

/// Parse raw GEDCOM bytes
pub fn parse(raw: &[u8]) -> Result<ParseOutcome, DecodeError> {
    let text = std::str::from_utf8(raw).map_err(|e| DecodeError::InvalidUtf8 {
        offset: e.valid_up_to(),
    })?;
    let text = text.strip_prefix(BYTE_ORDER_MARK).unwrap_or(text);

    let scanner = split_lines(text)
        .enumerate()
        .fold(Scanner::default(), |mut scanner, (index, line)| {
            scanner.consume(index + 1, line);
            scanner
        });

    Ok(scanner.finish())
}

/// Split on LF or CRLF; files using bare CR are split on CR
fn split_lines(text: &str) -> Box<dyn Iterator<Item = &str> + '_> {
    if text.contains('\n') {
        Box::new(text.lines())
    } else {
        Box::new(text.split('\r'))
    }
}

/// One tokenized line: `level [@xref@] TAG [value]`
#[derive(Debug, PartialEq, Eq)]
struct GedcomLine<'a> {
    level: u32,
    xref: Option<&'a str>,
    tag: &'a str,
    value: &'a str,
}

fn tokenize(line: &str) -> Result<GedcomLine<'_>, &'static str> {
    let line = line.trim();
    let (level, rest) = split_token(line);
    let level: u32 = level
        .parse()
        .map_err(|_| "level is not a non-negative integer")?;

    let (first, rest) = split_token(rest);
    let (xref, tag, rest) = if is_pointer(first) {
        let (tag, rest) = split_token(rest);
        (Some(first), tag, rest)
    } else {
        (None, first, rest)
    };

    if tag.is_empty() {
        return Err("missing tag");
    }

    Ok(GedcomLine {
        level,
        xref,
        tag,
        value: rest.trim(),
    })
}

fn split_token(s: &str) -> (&str, &str) {
    let s = s.trim_start();
    match s.find(char::is_whitespace) {
        Some(pos) => (&s[..pos], &s[pos..]),
        None => (s, ""),
    }
}

fn is_pointer(value: &str) -> bool {
    value.len() > 2
        && value.starts_with('@')
        && value.ends_with('@')
        && !value.contains(char::is_whitespace)
}

fn collapse_whitespace(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn normalize_date(value: &str) -> String {
    collapse_whitespace(value).to_uppercase()
}

/// `Given /Surname/ suffix` → (given, surname); suffix is dropped
fn split_name(value: &str) -> (String, String) {
    match value.find('/') {
        Some(start) => {
            let given = collapse_whitespace(&value[..start]);
            let after = &value[start + 1..];
            let surname = match after.find('/') {
                Some(end) => &after[..end],
                None => after,
            };
            (given, collapse_whitespace(surname))
        }
        None => (collapse_whitespace(value), String::new()),
    }
}

/// Pointer tag seen on a given line
#[derive(Debug, Clone)]
struct Link {
    target: String,
    line_number: usize,
    raw_line: String,
}

#[derive(Debug, Default)]
struct IndividualDraft {
    individual: ParsedIndividual,
    name_seen: bool,
    spouse_of: Vec<Link>,
    child_of: Vec<Link>,
}

#[derive(Debug)]
struct FamilyDraft {
    xref: String,
    line_number: usize,
    raw_line: String,
    husband: Option<Link>,
    wife: Option<Link>,
    children: Vec<Link>,
}

/// Block currently being filled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Block {
    /// Before the first level-0 line
    Start,
    Individual(usize),
    Family(usize),
    /// Level-0 record the importer does not read
    Ignored,
    /// `INDI`/`FAM` header that was itself malformed
    Invalid,
}

/// Level-1 structure a level-2 line belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Context {
    None,
    Name,
    Birth,
    Death,
}

#[derive(Debug)]
struct Scanner {
    individuals: Vec<IndividualDraft>,
    families: Vec<FamilyDraft>,
    individual_index: HashMap<String, usize>,
    family_index: HashMap<String, usize>,
    block: Block,
    context: Context,
    errors: Vec<ParseError>,
}

impl Default for Scanner {
    fn default() -> Self {
        Self {
            individuals: Vec::new(),
            families: Vec::new(),
            individual_index: HashMap::new(),
            family_index: HashMap::new(),
            block: Block::Start,
            context: Context::None,
            errors: Vec::new(),
        }
    }
}

impl Scanner {
    fn error(&mut self, line_number: usize, raw_line: &str, reason: impl Into<String>) {
        self.errors.push(ParseError {
            line_number,
            raw_line: raw_line.to_string(),
            reason: reason.into(),
        });
    }

    fn consume(&mut self, line_number: usize, raw_line: &str) {
        if raw_line.trim().is_empty() {
            return;
        }

        let line = match tokenize(raw_line) {
            Ok(line) => line,
            Err(reason) => return self.error(line_number, raw_line, reason),
        };

        match line.level {
            0 => self.start_record(line_number, raw_line, &line),
            1 => self.record_field(line_number, raw_line, &line),
            2 => self.sub_field(line_number, raw_line, &line),
            _ => {}
        }
    }

    fn start_record(&mut self, line_number: usize, raw_line: &str, line: &GedcomLine<'_>) {
        self.context = Context::None;

        match line.tag {
            "INDI" => {
                let Some(xref) = line.xref else {
                    self.block = Block::Invalid;
                    return self.error(line_number, raw_line, "INDI record without cross-reference pointer");
                };
                if self.individual_index.contains_key(xref) {
                    self.block = Block::Invalid;
                    return self.error(line_number, raw_line, format!("duplicate individual {}", xref));
                }

                let index = self.individuals.len();
                self.individual_index.insert(xref.to_string(), index);
                self.individuals.push(IndividualDraft {
                    individual: ParsedIndividual {
                        source_id: xref.to_string(),
                        ..ParsedIndividual::default()
                    },
                    ..IndividualDraft::default()
                });
                self.block = Block::Individual(index);
            }
            "FAM" => {
                let Some(xref) = line.xref else {
                    self.block = Block::Invalid;
                    return self.error(line_number, raw_line, "FAM record without cross-reference pointer");
                };
                if self.family_index.contains_key(xref) {
                    self.block = Block::Invalid;
                    return self.error(line_number, raw_line, format!("duplicate family {}", xref));
                }

                let index = self.families.len();
                self.family_index.insert(xref.to_string(), index);
                self.families.push(FamilyDraft {
                    xref: xref.to_string(),
                    line_number,
                    raw_line: raw_line.to_string(),
                    husband: None,
                    wife: None,
                    children: Vec::new(),
                });
                self.block = Block::Family(index);
            }
            _ => self.block = Block::Ignored,
        }
    }

    fn record_field(&mut self, line_number: usize, raw_line: &str, line: &GedcomLine<'_>) {
        self.context = Context::None;

        match self.block {
            Block::Start => self.error(line_number, raw_line, "line appears before any record"),
            Block::Individual(index) => self.individual_field(index, line_number, raw_line, line),
            Block::Family(index) => self.family_field(index, line_number, raw_line, line),
            Block::Ignored | Block::Invalid => {}
        }
    }

    fn individual_field(&mut self, index: usize, line_number: usize, raw_line: &str, line: &GedcomLine<'_>) {
        match line.tag {
            "NAME" => {
                if line.value.is_empty() {
                    return self.error(line_number, raw_line, "NAME requires a value");
                }
                let draft = &mut self.individuals[index];
                if draft.name_seen {
                    return;
                }
                let (given, surname) = split_name(line.value);
                draft.individual.first_name = given;
                draft.individual.last_name = surname;
                draft.name_seen = true;
                self.context = Context::Name;
            }
            "SEX" => match Gender::from_gedcom(line.value) {
                Some(gender) => self.individuals[index].individual.gender = Some(gender),
                None => self.error(line_number, raw_line, "SEX must be M, F or U"),
            },
            "BIRT" => self.context = Context::Birth,
            "DEAT" => self.context = Context::Death,
            "FAMS" | "FAMC" => {
                if !is_pointer(line.value) {
                    return self.error(
                        line_number,
                        raw_line,
                        format!("{} requires a family pointer", line.tag),
                    );
                }
                let link = Link {
                    target: line.value.to_string(),
                    line_number,
                    raw_line: raw_line.to_string(),
                };
                let draft = &mut self.individuals[index];
                if line.tag == "FAMS" {
                    draft.spouse_of.push(link);
                } else {
                    draft.child_of.push(link);
                }
            }
            _ => {}
        }
    }

    fn family_field(&mut self, index: usize, line_number: usize, raw_line: &str, line: &GedcomLine<'_>) {
        if !matches!(line.tag, "HUSB" | "WIFE" | "CHIL") {
            return;
        }
        if !is_pointer(line.value) {
            return self.error(
                line_number,
                raw_line,
                format!("{} requires an individual pointer", line.tag),
            );
        }

        let link = Link {
            target: line.value.to_string(),
            line_number,
            raw_line: raw_line.to_string(),
        };
        let family = &mut self.families[index];
        let slot = match line.tag {
            "HUSB" => &mut family.husband,
            "WIFE" => &mut family.wife,
            _ => {
                family.children.push(link);
                return;
            }
        };

        match slot {
            Some(existing) if existing.target != link.target => {
                let reason = format!(
                    "family {} already has {} {}",
                    family.xref, line.tag, existing.target
                );
                self.error(line_number, raw_line, reason);
            }
            Some(_) => {}
            None => *slot = Some(link),
        }
    }

    fn sub_field(&mut self, line_number: usize, raw_line: &str, line: &GedcomLine<'_>) {
        let Block::Individual(index) = self.block else {
            return;
        };

        let context = self.context;
        let value = line.value;
        match (context, line.tag) {
            (Context::Name, "GIVN" | "SURN")
            | (Context::Birth | Context::Death, "DATE" | "PLAC")
                if value.is_empty() =>
            {
                self.error(line_number, raw_line, format!("{} requires a value", line.tag));
            }
            (Context::Name, "GIVN") => {
                self.individuals[index].individual.first_name = collapse_whitespace(value);
            }
            (Context::Name, "SURN") => {
                self.individuals[index].individual.last_name = collapse_whitespace(value);
            }
            (Context::Birth, "DATE") => {
                self.individuals[index].individual.birth_date = Some(normalize_date(value));
            }
            (Context::Birth, "PLAC") => {
                self.individuals[index].individual.birth_place = Some(collapse_whitespace(value));
            }
            (Context::Death, "DATE") => {
                self.individuals[index].individual.death_date = Some(normalize_date(value));
            }
            _ => {}
        }
    }

    /// Resolve family linkage and build the outcome
    fn finish(mut self) -> ParseOutcome {
        self.drop_undefined_family_members();
        self.merge_individual_links();

        let relationships = self.synthesize_relationships();
        let mut errors = self.errors;
        errors.sort_by_key(|e| e.line_number);

        ParseOutcome {
            individuals: self.individuals.into_iter().map(|d| d.individual).collect(),
            relationships,
            errors,
        }
    }

    /// `HUSB`/`WIFE`/`CHIL` pointing at an individual that was never defined
    fn drop_undefined_family_members(&mut self) {
        let mut errors = Vec::new();
        let known = &self.individual_index;
        let mut check = |link: &Link| {
            let defined = known.contains_key(&link.target);
            if !defined {
                errors.push(ParseError {
                    line_number: link.line_number,
                    raw_line: link.raw_line.clone(),
                    reason: format!("reference to undefined individual {}", link.target),
                });
            }
            defined
        };

        for family in &mut self.families {
            if family.husband.as_ref().is_some_and(|l| !check(l)) {
                family.husband = None;
            }
            if family.wife.as_ref().is_some_and(|l| !check(l)) {
                family.wife = None;
            }
            family.children.retain(|l| check(l));
        }

        self.errors.extend(errors);
    }

    /// Fold `FAMS`/`FAMC` from individual blocks into their families
    fn merge_individual_links(&mut self) {
        for draft in &self.individuals {
            let person = &draft.individual;

            for link in &draft.spouse_of {
                let Some(&index) = self.family_index.get(&link.target) else {
                    self.errors.push(undefined_family(link));
                    continue;
                };
                let family = &mut self.families[index];
                let already_linked = [&family.husband, &family.wife]
                    .into_iter()
                    .flatten()
                    .any(|l| l.target == person.source_id);
                if already_linked {
                    continue;
                }

                let slot = match person.gender {
                    Some(Gender::Male) => &mut family.husband,
                    Some(Gender::Female) => &mut family.wife,
                    _ if family.husband.is_none() => &mut family.husband,
                    _ => &mut family.wife,
                };
                match slot {
                    Some(existing) => self.errors.push(ParseError {
                        line_number: link.line_number,
                        raw_line: link.raw_line.clone(),
                        reason: format!(
                            "family {} already has spouse {}",
                            family.xref, existing.target
                        ),
                    }),
                    None => {
                        *slot = Some(Link {
                            target: person.source_id.clone(),
                            ..link.clone()
                        })
                    }
                }
            }

            for link in &draft.child_of {
                let Some(&index) = self.family_index.get(&link.target) else {
                    self.errors.push(undefined_family(link));
                    continue;
                };
                let family = &mut self.families[index];
                if !family.children.iter().any(|c| c.target == person.source_id) {
                    family.children.push(Link {
                        target: person.source_id.clone(),
                        ..link.clone()
                    });
                }
            }
        }
    }

    fn synthesize_relationships(&mut self) -> Vec<ParsedRelationship> {
        let mut seen = HashSet::new();
        let mut relationships = Vec::new();
        let mut errors = Vec::new();

        let mut push = |relationship: Option<ParsedRelationship>, link: &Link, reason: &str| match relationship {
            Some(rel) => {
                if seen.insert(rel.clone()) {
                    relationships.push(rel);
                }
            }
            None => errors.push(ParseError {
                line_number: link.line_number,
                raw_line: link.raw_line.clone(),
                reason: reason.to_string(),
            }),
        };

        for family in &self.families {
            if let (Some(husband), Some(wife)) = (&family.husband, &family.wife) {
                push(
                    ParsedRelationship::spouse(&husband.target, &wife.target),
                    wife,
                    "individual cannot be their own spouse",
                );
            }

            for child in &family.children {
                if let Some(husband) = &family.husband {
                    push(
                        ParsedRelationship::parent_of(&husband.target, &child.target, ParentRole::Father),
                        child,
                        "individual cannot be their own parent",
                    );
                }
                if let Some(wife) = &family.wife {
                    push(
                        ParsedRelationship::parent_of(&wife.target, &child.target, ParentRole::Mother),
                        child,
                        "individual cannot be their own parent",
                    );
                }
            }

            if family.husband.is_none() && family.wife.is_none() && family.children.is_empty() {
                tracing::debug!(family = %family.xref, line = family.line_number, raw = %family.raw_line, "Empty family record");
            }
        }

        self.errors.extend(errors);
        relationships
    }
}

fn undefined_family(link: &Link) -> ParseError {
    ParseError {
        line_number: link.line_number,
        raw_line: link.raw_line.clone(),
        reason: format!("reference to undefined family {}", link.target),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RelationshipType;

    const FAMILY: &str = "\
0 HEAD
1 CHAR UTF-8
0 @I1@ INDI
1 NAME John /Smith/
1 SEX M
1 BIRT
2 DATE 1 jan  1900
2 PLAC Boston,  MA
0 @I2@ INDI
1 NAME Mary /Jones/
1 SEX F
1 DEAT
2 DATE 1980
0 @I3@ INDI
1 NAME Tom /Smith/ Jr.
1 FAMC @F1@
0 @F1@ FAM
1 HUSB @I1@
1 WIFE @I2@
1 CHIL @I3@
0 TRLR
";

    fn parse_str(text: &str) -> ParseOutcome {
        parse(text.as_bytes()).unwrap()
    }

    #[test]
    fn test_parses_individuals_and_fields() {
        let outcome = parse_str(FAMILY);
        assert!(outcome.errors.is_empty(), "{:?}", outcome.errors);
        assert_eq!(outcome.individuals.len(), 3);

        let john = &outcome.individuals[0];
        assert_eq!(john.source_id, "@I1@");
        assert_eq!(john.first_name, "John");
        assert_eq!(john.last_name, "Smith");
        assert_eq!(john.gender, Some(Gender::Male));
        assert_eq!(john.birth_date.as_deref(), Some("1 JAN 1900"));
        assert_eq!(john.birth_place.as_deref(), Some("Boston, MA"));

        assert_eq!(outcome.individuals[1].death_date.as_deref(), Some("1980"));
        assert_eq!(outcome.individuals[2].last_name, "Smith");
    }

    #[test]
    fn test_family_becomes_pairwise_relationships() {
        let outcome = parse_str(FAMILY);
        assert_eq!(
            outcome.relationships,
            vec![
                ParsedRelationship::spouse("@I1@", "@I2@").unwrap(),
                ParsedRelationship::parent_of("@I1@", "@I3@", ParentRole::Father).unwrap(),
                ParsedRelationship::parent_of("@I2@", "@I3@", ParentRole::Mother).unwrap(),
            ]
        );
    }

    #[test]
    fn test_malformed_lines_are_counted_and_skipped() {
        let text = "\
0 @I1@ INDI
1 NAME Ann /Lee/
x NAME Bad
0 @I2@ INDI
1 NAME
1 SEX Q
-1 BIRT
0 INDI
1 NAME Orphan /Line/
0 @I3@ INDI
1 NAME Bo /Lee/
";
        let outcome = parse_str(text);
        assert_eq!(outcome.individuals.len(), 3);
        let lines: Vec<usize> = outcome.errors.iter().map(|e| e.line_number).collect();
        assert_eq!(lines, vec![3, 5, 6, 7, 8]);
        assert_eq!(outcome.errors[0].raw_line, "x NAME Bad");
        assert_eq!(outcome.errors[0].reason, "level is not a non-negative integer");
    }

    #[test]
    fn test_empty_input() {
        assert_eq!(parse(b"").unwrap(), ParseOutcome::default());
        assert_eq!(parse("\u{feff}".as_bytes()).unwrap(), ParseOutcome::default());
    }

    #[test]
    fn test_bare_individual_has_empty_fields() {
        let outcome = parse_str("0 @I7@ INDI\n");
        assert!(outcome.errors.is_empty(), "{:?}", outcome.errors);
        assert_eq!(
            outcome.individuals,
            vec![ParsedIndividual {
                source_id: "@I7@".to_string(),
                ..ParsedIndividual::default()
            }]
        );
    }

    #[test]
    fn test_invalid_utf8_fails_whole_parse() {
        let err = parse(b"0 @I1@ INDI\n1 NAME \xff\xfe\n").unwrap_err();
        assert_eq!(err, DecodeError::InvalidUtf8 { offset: 19 });
    }

    #[test]
    fn test_crlf_and_bom() {
        let text = "\u{feff}0 @I1@ INDI\r\n1 NAME Ann /Lee/\r\n";
        let outcome = parse_str(text);
        assert!(outcome.errors.is_empty());
        assert_eq!(outcome.individuals[0].first_name, "Ann");

        let outcome = parse_str("0 @I1@ INDI\r1 NAME Bo /Lee/\r");
        assert_eq!(outcome.individuals[0].first_name, "Bo");
    }

    #[test]
    fn test_givn_surn_override_name() {
        let text = "\
0 @I1@ INDI
1 NAME Johnny /Smyth/
2 GIVN John
2 SURN Smith
1 NAME Jack /Other/
2 GIVN Ignored
";
        let person = &parse_str(text).individuals[0];
        assert_eq!(person.first_name, "John");
        assert_eq!(person.last_name, "Smith");
    }

    #[test]
    fn test_links_from_individual_side_are_merged() {
        let text = "\
0 @I1@ INDI
1 SEX M
1 FAMS @F1@
0 @I2@ INDI
1 SEX F
1 FAMS @F1@
0 @I3@ INDI
1 FAMC @F1@
0 @F1@ FAM
1 HUSB @I1@
1 CHIL @I3@
";
        let outcome = parse_str(text);
        assert!(outcome.errors.is_empty(), "{:?}", outcome.errors);
        assert_eq!(outcome.relationships.len(), 3);
        assert_eq!(outcome.relationships[0].kind, RelationshipType::Spouse);
    }

    #[test]
    fn test_undefined_references_are_errors() {
        let text = "\
0 @I1@ INDI
1 FAMS @F9@
0 @F1@ FAM
1 HUSB @I1@
1 CHIL @I7@
";
        let outcome = parse_str(text);
        assert!(outcome.relationships.is_empty());
        let reasons: Vec<&str> = outcome.errors.iter().map(|e| e.reason.as_str()).collect();
        assert_eq!(
            reasons,
            vec![
                "reference to undefined family @F9@",
                "reference to undefined individual @I7@",
            ]
        );
    }

    #[test]
    fn test_self_links_rejected() {
        let text = "\
0 @I1@ INDI
0 @F1@ FAM
1 HUSB @I1@
1 CHIL @I1@
";
        let outcome = parse_str(text);
        assert!(outcome.relationships.is_empty());
        assert_eq!(outcome.errors.len(), 1);
        assert_eq!(outcome.errors[0].line_number, 4);
    }

    #[test]
    fn test_duplicate_relationships_collapse() {
        let text = "\
0 @I1@ INDI
0 @I2@ INDI
0 @F1@ FAM
1 HUSB @I1@
1 WIFE @I2@
0 @F2@ FAM
1 HUSB @I1@
1 WIFE @I2@
";
        assert_eq!(parse_str(text).relationships.len(), 1);
    }

    #[test]
    fn test_split_name_variants() {
        assert_eq!(split_name("John /Smith/"), ("John".into(), "Smith".into()));
        assert_eq!(split_name("/Smith/"), ("".into(), "Smith".into()));
        assert_eq!(split_name("Cher"), ("Cher".into(), "".into()));
        assert_eq!(split_name("Ann  Marie /van  Dyke"), ("Ann Marie".into(), "van Dyke".into()));
    }
}

//! Pattern catalog compiler
//!
//! Validates a pattern set and compiles it once into a shared
//! [`CatalogAutomaton`]. A [`Catalog`] is cheap to clone and can be handed
//! to any number of concurrent scans.

use crate::automaton::{CatalogAutomaton, CatalogId, CompiledPattern};
use crate::{Pattern, PatternId, Result, ScanError};
use darkscan_common::Timestamp;
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;

/// Compiled, immutable pattern catalog
#[derive(Debug, Clone)]
pub struct Catalog {
    automaton: Arc<CatalogAutomaton>,
}

impl Catalog {
    /// Compile with exact (case-sensitive) matching
    pub fn compile(patterns: impl IntoIterator<Item = Pattern>) -> Result<Self> {
        CatalogCompiler::new().compile(patterns)
    }

    /// Catalog with no patterns; scans against it never match
    pub fn empty() -> Self {
        Self {
            automaton: Arc::new(CatalogAutomaton::build(&[], false)),
        }
    }

    /// Compiler with non-default options
    pub fn builder() -> CatalogCompiler {
        CatalogCompiler::new()
    }

    /// Parse and compile a JSON catalog
    ///
    /// Accepts either a bare array of patterns or an object
    /// `{ "case_insensitive": bool, "patterns": [...] }`.
    pub fn from_json(json: &str) -> Result<Self> {
        let (case_insensitive, records) = match serde_json::from_str::<CatalogDocument>(json)? {
            CatalogDocument::List(records) => (false, records),
            CatalogDocument::Document {
                case_insensitive,
                patterns,
            } => (case_insensitive, patterns),
        };
        let patterns = records
            .into_iter()
            .map(Pattern::try_from)
            .collect::<Result<Vec<_>>>()?;

        CatalogCompiler::new()
            .case_insensitive(case_insensitive)
            .compile(patterns)
    }

    /// Shared automaton
    pub fn automaton(&self) -> &Arc<CatalogAutomaton> {
        &self.automaton
    }

    /// Catalog identity
    pub fn id(&self) -> CatalogId {
        self.automaton.id()
    }

    /// Number of patterns
    pub fn len(&self) -> usize {
        self.automaton.pattern_count()
    }

    /// True when no patterns were supplied
    pub fn is_empty(&self) -> bool {
        self.automaton.is_empty()
    }

    /// Look up a pattern by id
    pub fn pattern(&self, id: PatternId) -> Option<&CompiledPattern> {
        self.automaton.pattern(id)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum CatalogDocument {
    List(Vec<PatternRecord>),
    Document {
        #[serde(default)]
        case_insensitive: bool,
        patterns: Vec<PatternRecord>,
    },
}

/// Catalog entry as written in JSON; validated by [`Pattern::parse`]
#[derive(Deserialize)]
struct PatternRecord {
    id: u32,
    literal: String,
    category: String,
    severity: u16,
}

impl TryFrom<PatternRecord> for Pattern {
    type Error = ScanError;

    fn try_from(record: PatternRecord) -> Result<Self> {
        Pattern::parse(record.id, record.literal, &record.category, record.severity)
    }
}

/// Catalog compiler options
#[derive(Debug, Clone, Default)]
pub struct CatalogCompiler {
    case_insensitive: bool,
}

impl CatalogCompiler {
    /// Exact matching compiler
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold ASCII letters so `Act Now` also matches `ACT NOW` and `act now`
    pub fn case_insensitive(mut self, enabled: bool) -> Self {
        self.case_insensitive = enabled;
        self
    }

    /// Validate and compile
    pub fn compile(&self, patterns: impl IntoIterator<Item = Pattern>) -> Result<Catalog> {
        let start = Timestamp::now();
        let patterns: Vec<Pattern> = patterns.into_iter().collect();

        let mut seen = HashSet::with_capacity(patterns.len());
        for pattern in &patterns {
            if pattern.literal.is_empty() {
                return Err(ScanError::InvalidPattern {
                    id: pattern.id,
                    reason: "literal is empty".into(),
                });
            }
            if !seen.insert(pattern.id) {
                return Err(ScanError::DuplicatePattern(pattern.id));
            }
        }

        let automaton = CatalogAutomaton::build(&patterns, self.case_insensitive);

        tracing::info!(
            catalog = %automaton.id(),
            patterns = automaton.pattern_count(),
            states = automaton.state_count(),
            classes = automaton.alphabet_len(),
            image_bytes = automaton.image_bytes(),
            time_us = start.elapsed_micros(),
            "Catalog compilation complete"
        );

        Ok(Catalog {
            automaton: Arc::new(automaton),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Category, Severity};
    use darkscan_common::DomainError;

    fn urgency(id: u32, literal: &str, severity: u8) -> Pattern {
        Pattern::new(id, literal, Category::Urgency, Severity::new(severity).unwrap())
    }

    #[test]
    fn test_compile_catalog() {
        let catalog = Catalog::compile(vec![
            urgency(1, "act now", 5),
            urgency(2, "now or never", 8),
        ])
        .unwrap();

        assert_eq!(catalog.len(), 2);
        assert!(!catalog.is_empty());
        assert_eq!(catalog.automaton().max_pattern_len(), 12);
        assert_eq!(catalog.pattern(PatternId::new(2)).unwrap().severity.value(), 8);
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let err = Catalog::compile(vec![urgency(1, "act now", 5), urgency(1, "hurry", 3)])
            .unwrap_err();
        assert!(matches!(err, ScanError::DuplicatePattern(id) if id == PatternId::new(1)));
    }

    #[test]
    fn test_empty_literal_rejected() {
        let err = Catalog::compile(vec![urgency(4, "", 5)]).unwrap_err();
        assert!(matches!(err, ScanError::InvalidPattern { id, .. } if id == PatternId::new(4)));
    }

    #[test]
    fn test_empty_catalog_is_not_an_error() {
        let catalog = Catalog::compile(Vec::new()).unwrap();
        assert!(catalog.is_empty());
        assert_eq!(catalog.automaton().transition_count(), 0);
        assert_eq!(catalog.id(), Catalog::empty().id());
    }

    #[test]
    fn test_from_json_list() {
        let catalog = Catalog::from_json(
            r#"[
                {"id": 1, "literal": "act now", "category": "URGENCY", "severity": 5},
                {"id": 2, "literal": "no thanks", "category": "confirm-shame", "severity": 7}
            ]"#,
        )
        .unwrap();

        assert_eq!(catalog.len(), 2);
        assert!(!catalog.automaton().is_case_insensitive());
        assert_eq!(
            catalog.pattern(PatternId::new(2)).unwrap().category,
            Category::ConfirmShame
        );
    }

    #[test]
    fn test_from_json_document() {
        let catalog = Catalog::from_json(
            r#"{
                "case_insensitive": true,
                "patterns": [{"id": 3, "literal": "Service Fee", "category": "HIDDEN_COST", "severity": 4}]
            }"#,
        )
        .unwrap();

        assert!(catalog.automaton().is_case_insensitive());
        assert_eq!(catalog.len(), 1);
    }

    #[test]
    fn test_from_json_rejects_bad_input() {
        let too_severe =
            r#"[{"id": 1, "literal": "act now", "category": "URGENCY", "severity": 101}]"#;
        assert!(matches!(
            Catalog::from_json(too_severe),
            Err(ScanError::Domain(DomainError::SeverityOutOfRange { value: 101, .. }))
        ));

        let unknown = r#"[{"id": 1, "literal": "act now", "category": "PANIC", "severity": 5}]"#;
        assert!(matches!(
            Catalog::from_json(unknown),
            Err(ScanError::Domain(DomainError::UnknownCategory(_)))
        ));

        let missing_field = r#"[{"id": 1, "literal": "act now", "severity": 5}]"#;
        assert!(matches!(
            Catalog::from_json(missing_field),
            Err(ScanError::CatalogFormat(_))
        ));

        let duplicate = r#"[
            {"id": 1, "literal": "a", "category": "URGENCY", "severity": 1},
            {"id": 1, "literal": "b", "category": "URGENCY", "severity": 1}
        ]"#;
        assert!(matches!(
            Catalog::from_json(duplicate),
            Err(ScanError::DuplicatePattern(_))
        ));

        assert!(Catalog::from_json("not json").is_err());
    }
}

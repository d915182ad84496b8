//! Parallel Dark Pattern Detector
//!
//! Flags spans of extracted webpage text that match a catalog of known
//! manipulative phrasings, scoring each hit by severity.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Detect Pipeline                          │
//! │                                                             │
//! │  ┌─────────────┐   ┌─────────────┐   ┌─────────────┐       │
//! │  │  Catalog    │   │   Device    │   │  Parallel   │       │
//! │  │  Compiler   │──▶│   Memory    │──▶│  Scan Lanes │       │
//! │  │ (flat DFA)  │   │  (staging)  │   │  (chunked)  │       │
//! │  └─────────────┘   └─────────────┘   └──────┬──────┘       │
//! │                                             │               │
//! │                                      ┌──────▼──────┐        │
//! │                                      │   Matches   │        │
//! │                                      │  Aggregator │        │
//! │                                      └─────────────┘        │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! [`Detector::detect`] is the entry point: it stages the compiled catalog
//! and the text, fans the text out over independent lanes, waits for every
//! lane, then sorts, deduplicates and scores the matches.

#![warn(missing_docs)]

pub mod aggregate;
pub mod automaton;
pub mod catalog;
pub mod detector;
pub mod device;
pub mod engine;

pub use aggregate::{aggregate, ExecutionPath, ScanMetadata, ScanResult};
pub use automaton::{CatalogAutomaton, CatalogId, CompiledPattern};
pub use catalog::{Catalog, CatalogCompiler};
pub use darkscan_common::{Category, PatternId, Severity};
pub use detector::{detect, Detector, DetectorConfig, DetectorStatsSnapshot, FallbackPolicy};
pub use device::{DeviceMemory, ScanContext};
pub use engine::{CancelToken, ChunkPlan, MatchRecord, ScanEngine};

use darkscan_common::DomainError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Detector errors
#[derive(Error, Debug)]
pub enum ScanError {
    /// Two catalog entries share an id
    #[error("duplicate pattern id: {0}")]
    DuplicatePattern(PatternId),

    /// Catalog entry rejected at compile time
    #[error("invalid pattern {id}: {reason}")]
    InvalidPattern {
        /// Offending pattern
        id: PatternId,
        /// Why it was rejected
        reason: String,
    },

    /// Staging could not reserve device memory
    #[error("device out of memory: requested {requested} bytes, {available} available")]
    DeviceOutOfMemory {
        /// Bytes the staging step asked for
        requested: usize,
        /// Bytes free at the time of the request
        available: usize,
    },

    /// Strict mode requires at least one pattern
    #[error("catalog is empty")]
    EmptyCatalog,

    /// Detector or engine configuration rejected
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Scan cancelled before the completion barrier
    #[error("scan cancelled")]
    Cancelled,

    /// Catalog JSON could not be decoded
    #[error("catalog format error: {0}")]
    CatalogFormat(#[from] serde_json::Error),

    /// Value object validation failed
    #[error(transparent)]
    Domain(#[from] DomainError),
}

/// Result type for the detector
pub type Result<T> = std::result::Result<T, ScanError>;

/// A literal phrase to detect
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pattern {
    /// Unique identifier
    pub id: PatternId,
    /// Exact phrase to match
    pub literal: String,
    /// Dark pattern family
    pub category: Category,
    /// Weight added to the scan score per match
    pub severity: Severity,
}

impl Pattern {
    /// Create a pattern
    pub fn new(
        id: u32,
        literal: impl Into<String>,
        category: Category,
        severity: Severity,
    ) -> Self {
        Self {
            id: PatternId::new(id),
            literal: literal.into(),
            category,
            severity,
        }
    }

    /// Build a pattern from loosely typed fields, as found in keyword files
    ///
    /// `category` accepts any case and `-` separators; `severity` must be
    /// within `0..=100`.
    pub fn parse(
        id: u32,
        literal: impl Into<String>,
        category: &str,
        severity: u16,
    ) -> Result<Self> {
        Ok(Self::new(
            id,
            literal,
            category.parse()?,
            Severity::try_from(severity)?,
        ))
    }
}

/// Built-in phrase list used by [`default_catalog`]
const DEFAULT_PHRASES: &[(&str, Category, u8)] = &[
    ("act now", Category::Urgency, 6),
    ("limited time", Category::Urgency, 5),
    ("offer ends soon", Category::Urgency, 6),
    ("only today", Category::Urgency, 6),
    ("hurry", Category::Urgency, 4),
    ("now or never", Category::Urgency, 8),
    ("only a few left", Category::Scarcity, 6),
    ("almost sold out", Category::Scarcity, 6),
    ("in high demand", Category::Scarcity, 4),
    ("no thanks, i don't want", Category::ConfirmShame, 8),
    ("no, i prefer paying full price", Category::ConfirmShame, 9),
    ("i don't like saving money", Category::ConfirmShame, 9),
    ("service fee", Category::HiddenCost, 5),
    ("handling fee", Category::HiddenCost, 5),
    ("processing fee", Category::HiddenCost, 5),
    ("people are viewing this", Category::SocialProof, 5),
    ("bought in the last", Category::SocialProof, 4),
    ("recommended for you", Category::Misdirection, 2),
    ("create an account to continue", Category::ForcedAction, 6),
    ("added to your cart", Category::Sneaking, 7),
    ("automatically renews", Category::Sneaking, 6),
    ("call to cancel", Category::Obstruction, 8),
];

/// The built-in dark pattern phrases, ids starting at 1
pub fn default_patterns() -> Vec<Pattern> {
    DEFAULT_PHRASES
        .iter()
        .zip(1u32..)
        .map(|(&(literal, category, severity), id)| {
            Pattern::new(id, literal, category, Severity::saturating(severity))
        })
        .collect()
}

/// Compile the built-in phrases into a case-insensitive catalog
pub fn default_catalog() -> Result<Catalog> {
    CatalogCompiler::new()
        .case_insensitive(true)
        .compile(default_patterns())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_patterns() {
        let patterns = default_patterns();
        assert_eq!(patterns.len(), DEFAULT_PHRASES.len());
        assert_eq!(patterns[0].id, PatternId::new(1));
        assert_eq!(patterns[0].literal, "act now");
        assert!(patterns.iter().all(|p| !p.literal.is_empty()));
    }

    #[test]
    fn test_pattern_parse() {
        let pattern = Pattern::parse(3, "call to cancel", "obstruction", 8).unwrap();
        assert_eq!(pattern.category, Category::Obstruction);
        assert_eq!(pattern.severity.value(), 8);

        assert!(matches!(
            Pattern::parse(4, "hurry", "URGENT", 4),
            Err(ScanError::Domain(DomainError::UnknownCategory(name))) if name == "URGENT"
        ));
        assert!(matches!(
            Pattern::parse(5, "hurry", "urgency", 250),
            Err(ScanError::Domain(DomainError::SeverityOutOfRange { value: 250, max: 100 }))
        ));
    }

    #[test]
    fn test_default_catalog_matches_any_case() {
        let catalog = default_catalog().unwrap();
        let result = detect("HURRY! Only Today: a small Service Fee applies.", &catalog).unwrap();

        let ids: Vec<u32> = result.matched_patterns().iter().map(|id| id.as_u32()).collect();
        assert_eq!(ids, vec![4, 5, 13]);
        assert_eq!(result.by_category.get(&Category::Urgency), Some(&10));
        assert_eq!(result.by_category.get(&Category::HiddenCost), Some(&5));
        assert_eq!(result.total_severity, 15);
    }
}

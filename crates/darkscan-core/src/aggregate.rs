//! Match aggregation
//!
//! Merges lane output into the final, ordered and scored [`ScanResult`].

use crate::automaton::{CatalogAutomaton, CatalogId};
use crate::engine::MatchRecord;
use crate::{Category, PatternId};
use serde::Serialize;
use std::collections::BTreeMap;

/// Where the automaton walk ran
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionPath {
    /// Staged device memory, parallel lanes
    #[default]
    Device,
    /// Host memory, single lane (explicit fallback)
    Host,
}

/// How a result was produced; excluded from result comparisons by callers
/// that only care about matches
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScanMetadata {
    /// Catalog scanned against
    pub catalog: Option<CatalogId>,
    /// Text length in bytes
    pub bytes_scanned: usize,
    /// Lanes used (0 for an empty text or catalog)
    pub lanes: usize,
    /// Wall time from staging to aggregation
    pub scan_time_us: u64,
    /// Execution path taken
    pub execution: ExecutionPath,
}

/// Final, immutable outcome of one scan
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScanResult {
    /// Deduplicated matches ordered by `(start, pattern_id)`
    pub matches: Vec<MatchRecord>,
    /// Sum of every match's severity
    pub total_severity: u64,
    /// Severity per category, for categories with at least one match
    pub by_category: BTreeMap<Category, u64>,
    /// Execution details
    pub metadata: ScanMetadata,
}

impl ScanResult {
    /// Check if anything matched
    pub fn has_matches(&self) -> bool {
        !self.matches.is_empty()
    }

    /// Get match count
    pub fn match_count(&self) -> usize {
        self.matches.len()
    }

    /// Distinct patterns that matched at least once, ascending
    pub fn matched_patterns(&self) -> Vec<PatternId> {
        let mut ids: Vec<PatternId> = self.matches.iter().map(|m| m.pattern_id).collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    /// Severity contributed by one category
    pub fn category_severity(&self, category: Category) -> u64 {
        self.by_category.get(&category).copied().unwrap_or(0)
    }

    /// Category with the largest severity; ties go to the earlier category
    pub fn highest_category(&self) -> Option<Category> {
        self.by_category
            .iter()
            .fold(None, |best: Option<(Category, u64)>, (&category, &score)| match best {
                Some((_, top)) if top >= score => best,
                _ => Some((category, score)),
            })
            .map(|(category, _)| category)
    }
}

/// Sort, deduplicate and score raw lane output
///
/// Records with the same `(pattern_id, start)` collapse to one. Distinct
/// patterns at the same offset all count towards the score.
pub fn aggregate(mut records: Vec<MatchRecord>, automaton: &CatalogAutomaton) -> ScanResult {
    records.sort_unstable_by_key(|r| (r.start, r.pattern_id));
    records.dedup_by_key(|r| (r.start, r.pattern_id));

    let mut total_severity = 0u64;
    let mut by_category = BTreeMap::new();
    for record in &records {
        let pattern = automaton.pattern(record.pattern_id);
        debug_assert!(pattern.is_some(), "record for unknown pattern {}", record.pattern_id);
        if let Some(pattern) = pattern {
            let weight = u64::from(pattern.severity.value());
            total_severity += weight;
            *by_category.entry(pattern.category).or_insert(0) += weight;
        }
    }

    ScanResult {
        matches: records,
        total_severity,
        by_category,
        metadata: ScanMetadata::default(),
    }
}

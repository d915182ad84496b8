//! Flat multi-pattern automaton
//!
//! The catalog compiles into a complete DFA stored as plain integer arrays:
//!
//! ```text
//! byte ──classes[256]──▶ class
//! (state, class) ──transitions[state * alphabet_len + class]──▶ state
//! state ──match_starts[state]..match_starts[state + 1]──▶ match_patterns
//! ```
//!
//! Failure links are resolved while the table is built, and every terminal
//! set already includes the patterns reachable through the failure chain,
//! so the scan step is one table load per byte plus a range check.

use crate::Pattern;
use darkscan_common::{Category, PatternId, Severity};
use serde::{Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;

/// Start state of every automaton
pub const ROOT: u32 = 0;

/// Content-derived catalog identity, used as the staging cache key
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CatalogId(u128);

impl CatalogId {
    /// Fingerprint an ordered pattern list and its matching mode
    fn fingerprint(patterns: &[Pattern], case_insensitive: bool) -> Self {
        let mut hasher = Sha256::new();
        hasher.update([case_insensitive as u8]);
        for p in patterns {
            hasher.update(p.id.as_u32().to_le_bytes());
            hasher.update((p.literal.len() as u64).to_le_bytes());
            hasher.update(p.literal.as_bytes());
            hasher.update(p.category.as_str().as_bytes());
            hasher.update([p.severity.value()]);
        }
        let digest = hasher.finalize();
        let mut head = [0u8; 16];
        head.copy_from_slice(&digest[..16]);
        Self(u128::from_be_bytes(head))
    }

    /// Raw value
    pub const fn as_u128(&self) -> u128 {
        self.0
    }
}

impl Serialize for CatalogId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl fmt::Display for CatalogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0.to_be_bytes()))
    }
}

/// Host-side metadata for one compiled pattern
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompiledPattern {
    /// Catalog id
    pub id: PatternId,
    /// Literal as supplied
    pub literal: String,
    /// Family used for the per-category breakdown
    pub category: Category,
    /// Score weight
    pub severity: Severity,
}

impl CompiledPattern {
    /// Literal length in bytes
    pub fn len(&self) -> usize {
        self.literal.len()
    }

    /// Never true for a compiled pattern; literals are validated non-empty
    pub fn is_empty(&self) -> bool {
        self.literal.is_empty()
    }
}

#[derive(Default)]
struct TrieNode {
    children: BTreeMap<u8, u32>,
    outputs: Vec<u32>,
}

/// Compiled catalog: an arena of states addressed by `u32`
///
/// Immutable after construction and shared between scans behind an `Arc`.
#[derive(Debug)]
pub struct CatalogAutomaton {
    id: CatalogId,
    case_insensitive: bool,
    classes: [u8; 256],
    alphabet_len: usize,
    transitions: Vec<u32>,
    match_starts: Vec<u32>,
    match_patterns: Vec<u32>,
    pattern_ids: Vec<u32>,
    pattern_lens: Vec<u32>,
    patterns: Vec<CompiledPattern>,
    index_by_id: HashMap<PatternId, u32>,
    max_pattern_len: usize,
}

impl CatalogAutomaton {
    /// Build from validated patterns (non-empty literals, unique ids)
    pub(crate) fn build(patterns: &[Pattern], case_insensitive: bool) -> Self {
        let id = CatalogId::fingerprint(patterns, case_insensitive);
        let compiled: Vec<CompiledPattern> = patterns
            .iter()
            .map(|p| CompiledPattern {
                id: p.id,
                literal: p.literal.clone(),
                category: p.category,
                severity: p.severity,
            })
            .collect();
        let index_by_id = compiled
            .iter()
            .enumerate()
            .map(|(i, p)| (p.id, i as u32))
            .collect();
        let pattern_ids = compiled.iter().map(|p| p.id.as_u32()).collect();
        let pattern_lens = compiled.iter().map(|p| p.len() as u32).collect();
        let max_pattern_len = compiled.iter().map(CompiledPattern::len).max().unwrap_or(0);

        if patterns.is_empty() {
            return Self {
                id,
                case_insensitive,
                classes: [0; 256],
                alphabet_len: 0,
                transitions: Vec::new(),
                match_starts: vec![0, 0],
                match_patterns: Vec::new(),
                pattern_ids,
                pattern_lens,
                patterns: compiled,
                index_by_id,
                max_pattern_len,
            };
        }

        let folded: Vec<Vec<u8>> = patterns
            .iter()
            .map(|p| {
                p.literal
                    .bytes()
                    .map(|b| if case_insensitive { b.to_ascii_lowercase() } else { b })
                    .collect()
            })
            .collect();
        let (classes, alphabet_len) = byte_classes(&folded, case_insensitive);

        // Trie over class sequences
        let mut trie = vec![TrieNode::default()];
        for (index, literal) in folded.iter().enumerate() {
            let mut state = ROOT as usize;
            for &byte in literal {
                let class = classes[byte as usize];
                state = match trie[state].children.get(&class) {
                    Some(&next) => next as usize,
                    None => {
                        let next = trie.len();
                        trie.push(TrieNode::default());
                        trie[state].children.insert(class, next as u32);
                        next
                    }
                };
            }
            trie[state].outputs.push(index as u32);
        }

        // Breadth-first failure resolution into a complete transition table
        let state_count = trie.len();
        let mut transitions = vec![ROOT; state_count * alphabet_len];
        let mut fail = vec![ROOT; state_count];
        let mut outputs: Vec<Vec<u32>> = trie.iter().map(|n| n.outputs.clone()).collect();
        let mut queue = VecDeque::with_capacity(state_count);

        for (&class, &child) in &trie[ROOT as usize].children {
            transitions[class as usize] = child;
            queue.push_back(child);
        }

        while let Some(state) = queue.pop_front() {
            let s = state as usize;
            let f = fail[s] as usize;

            if f != ROOT as usize {
                let inherited = outputs[f].clone();
                outputs[s].extend(inherited);
            }

            for class in 0..alphabet_len {
                let via_fail = transitions[f * alphabet_len + class];
                match trie[s].children.get(&(class as u8)) {
                    Some(&child) => {
                        transitions[s * alphabet_len + class] = child;
                        fail[child as usize] = via_fail;
                        queue.push_back(child);
                    }
                    None => transitions[s * alphabet_len + class] = via_fail,
                }
            }
        }

        let mut match_starts = Vec::with_capacity(state_count + 1);
        let mut match_patterns = Vec::new();
        for mut set in outputs {
            set.sort_unstable();
            match_starts.push(match_patterns.len() as u32);
            match_patterns.extend(set);
        }
        match_starts.push(match_patterns.len() as u32);

        Self {
            id,
            case_insensitive,
            classes,
            alphabet_len,
            transitions,
            match_starts,
            match_patterns,
            pattern_ids,
            pattern_lens,
            patterns: compiled,
            index_by_id,
            max_pattern_len,
        }
    }

    /// Catalog identity
    pub fn id(&self) -> CatalogId {
        self.id
    }

    /// Whether ASCII letters match regardless of case
    pub fn is_case_insensitive(&self) -> bool {
        self.case_insensitive
    }

    /// True when the catalog has no patterns; such an automaton never matches
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Number of compiled patterns
    pub fn pattern_count(&self) -> usize {
        self.patterns.len()
    }

    /// Number of states (zero for the degenerate automaton)
    pub fn state_count(&self) -> usize {
        if self.alphabet_len == 0 {
            0
        } else {
            self.transitions.len() / self.alphabet_len
        }
    }

    /// Number of byte equivalence classes
    pub fn alphabet_len(&self) -> usize {
        self.alphabet_len
    }

    /// Number of entries in the transition table
    pub fn transition_count(&self) -> usize {
        self.transitions.len()
    }

    /// Longest literal in bytes; chunk overlap is this minus one
    pub fn max_pattern_len(&self) -> usize {
        self.max_pattern_len
    }

    /// Compiled patterns in catalog order
    pub fn patterns(&self) -> &[CompiledPattern] {
        &self.patterns
    }

    /// Look up a pattern by id
    pub fn pattern(&self, id: PatternId) -> Option<&CompiledPattern> {
        self.index_by_id
            .get(&id)
            .map(|&index| &self.patterns[index as usize])
    }

    /// Size of the flat tables copied to device memory
    pub fn image_bytes(&self) -> usize {
        let words = self.transitions.len()
            + self.match_starts.len()
            + self.match_patterns.len()
            + self.pattern_ids.len()
            + self.pattern_lens.len();
        self.classes.len() + words * std::mem::size_of::<u32>()
    }

    /// Borrow the flat tables for a scan over host memory
    pub fn view(&self) -> AutomatonView<'_> {
        AutomatonView {
            classes: &self.classes,
            alphabet_len: self.alphabet_len,
            transitions: &self.transitions,
            match_starts: &self.match_starts,
            match_patterns: &self.match_patterns,
            pattern_ids: &self.pattern_ids,
            pattern_lens: &self.pattern_lens,
            max_pattern_len: self.max_pattern_len,
        }
    }

    pub(crate) fn classes(&self) -> &[u8; 256] {
        &self.classes
    }

    pub(crate) fn tables(&self) -> [&[u32]; 5] {
        [
            &self.transitions,
            &self.match_starts,
            &self.match_patterns,
            &self.pattern_ids,
            &self.pattern_lens,
        ]
    }
}

/// Assign one class per byte used by a literal, plus one shared class for
/// every other byte. Case-insensitive catalogs alias `A-Z` onto `a-z`.
fn byte_classes(literals: &[Vec<u8>], case_insensitive: bool) -> ([u8; 256], usize) {
    let mut used = [false; 256];
    for literal in literals {
        for &byte in literal {
            used[byte as usize] = true;
        }
    }

    let mut classes = [0u8; 256];
    let mut next = 0usize;
    for (byte, &is_used) in used.iter().enumerate() {
        if is_used {
            classes[byte] = next as u8;
            next += 1;
        }
    }

    let mut has_other = false;
    for byte in 0..=255u8 {
        if used[byte as usize] {
            continue;
        }
        let lower = byte.to_ascii_lowercase();
        if case_insensitive && byte.is_ascii_uppercase() && used[lower as usize] {
            classes[byte as usize] = classes[lower as usize];
        } else {
            // Only reachable when next < 256
            classes[byte as usize] = next as u8;
            has_other = true;
        }
    }

    (classes, next + has_other as usize)
}

/// Borrowed flat tables, shared by host and staged scans
#[derive(Debug, Clone, Copy)]
pub struct AutomatonView<'a> {
    classes: &'a [u8],
    alphabet_len: usize,
    transitions: &'a [u32],
    match_starts: &'a [u32],
    match_patterns: &'a [u32],
    pattern_ids: &'a [u32],
    pattern_lens: &'a [u32],
    max_pattern_len: usize,
}

impl<'a> AutomatonView<'a> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn from_parts(
        classes: &'a [u8],
        alphabet_len: usize,
        transitions: &'a [u32],
        match_starts: &'a [u32],
        match_patterns: &'a [u32],
        pattern_ids: &'a [u32],
        pattern_lens: &'a [u32],
        max_pattern_len: usize,
    ) -> Self {
        Self {
            classes,
            alphabet_len,
            transitions,
            match_starts,
            match_patterns,
            pattern_ids,
            pattern_lens,
            max_pattern_len,
        }
    }

    /// True for the degenerate automaton with no transitions
    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.transitions.is_empty()
    }

    /// Longest literal in bytes
    #[inline(always)]
    pub fn max_pattern_len(&self) -> usize {
        self.max_pattern_len
    }

    /// One DFA step
    #[inline(always)]
    pub fn next_state(&self, state: u32, byte: u8) -> u32 {
        let class = self.classes[byte as usize] as usize;
        self.transitions[state as usize * self.alphabet_len + class]
    }

    /// Pattern indices terminating at `state`
    #[inline(always)]
    pub fn matches(&self, state: u32) -> &'a [u32] {
        let s = state as usize;
        let start = self.match_starts[s] as usize;
        let end = self.match_starts[s + 1] as usize;
        &self.match_patterns[start..end]
    }

    /// Catalog id of the pattern at `index`
    #[inline(always)]
    pub fn pattern_id(&self, index: u32) -> PatternId {
        PatternId::new(self.pattern_ids[index as usize])
    }

    /// Literal length of the pattern at `index`
    #[inline(always)]
    pub fn pattern_len(&self, index: u32) -> usize {
        self.pattern_lens[index as usize] as usize
    }
}

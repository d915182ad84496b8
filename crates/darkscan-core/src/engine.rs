//! Parallel scan engine
//!
//! Splits the staged text into fixed-size chunks and walks the automaton
//! over each chunk in its own lane. A lane starts `max_pattern_len - 1`
//! bytes before its chunk to warm the automaton up, then emits only the
//! matches that END inside its chunk:
//!
//! ```text
//!  text   |-------- chunk 0 --------|-------- chunk 1 --------|---- chunk 2 ----|
//!  lane 0 |=========================|
//!  lane 1                      |~~~~|=========================|
//!  lane 2                                                |~~~~|=================|
//!                               warm-up (overlap, no emission)
//! ```
//!
//! Every occurrence therefore has exactly one owning lane, whatever the
//! chunk size. Lanes share nothing mutable and never synchronise; the only
//! barriers are staging (before) and the rayon join (after).

use crate::automaton::{AutomatonView, CatalogAutomaton, ROOT};
use crate::device::ScanContext;
use crate::{PatternId, Result, ScanError};
use rayon::prelude::*;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Default bytes per lane
pub const DEFAULT_CHUNK_SIZE: usize = 8 * 1024;

/// Bytes a lane walks between cancellation checks
pub const CANCEL_POLL_INTERVAL: usize = 4 * 1024;

/// One detected occurrence, offsets in bytes from the start of the text
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct MatchRecord {
    /// Pattern that matched
    pub pattern_id: PatternId,
    /// First byte of the match
    pub start: usize,
    /// One past the last byte of the match
    pub end: usize,
}

impl MatchRecord {
    /// Match length in bytes
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    /// Always false; matches are never empty
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Cooperative cancellation flag shared between a caller and its scan
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// New, not cancelled
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Check whether cancellation was requested
    #[inline(always)]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Byte ranges for one lane
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    /// Where the automaton walk begins (start minus overlap, clamped to 0)
    pub walk_start: usize,
    /// First byte owned by this lane
    pub start: usize,
    /// One past the last byte owned by this lane
    pub end: usize,
}

/// Partition of a text into lanes
#[derive(Debug, Clone)]
pub struct ChunkPlan {
    chunks: Vec<Chunk>,
    overlap: usize,
}

impl ChunkPlan {
    /// Plan chunks of `chunk_size` bytes with `max_pattern_len - 1` overlap
    pub fn new(text_len: usize, chunk_size: usize, max_pattern_len: usize) -> Result<Self> {
        if chunk_size == 0 {
            return Err(ScanError::InvalidConfig("chunk size must be positive".into()));
        }
        if chunk_size < max_pattern_len {
            return Err(ScanError::InvalidConfig(format!(
                "chunk size {chunk_size} is shorter than the longest pattern ({max_pattern_len} bytes)"
            )));
        }

        let overlap = max_pattern_len.saturating_sub(1);
        let chunks = (0..text_len)
            .step_by(chunk_size)
            .map(|start| Chunk {
                walk_start: start.saturating_sub(overlap),
                start,
                end: (start + chunk_size).min(text_len),
            })
            .collect();

        Ok(Self { chunks, overlap })
    }

    /// Planned lanes in text order
    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    /// Number of lanes
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    /// True for an empty text
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Warm-up bytes carried into each lane
    pub fn overlap(&self) -> usize {
        self.overlap
    }
}

/// Data-parallel automaton walker
#[derive(Debug)]
pub struct ScanEngine {
    chunk_size: usize,
    pool: Option<rayon::ThreadPool>,
}

impl ScanEngine {
    /// Engine on the global rayon pool
    pub fn new(chunk_size: usize) -> Result<Self> {
        Self::with_lanes(chunk_size, None)
    }

    /// Engine limited to `max_lanes` concurrent lanes
    pub fn with_lanes(chunk_size: usize, max_lanes: Option<usize>) -> Result<Self> {
        if chunk_size == 0 {
            return Err(ScanError::InvalidConfig("chunk size must be positive".into()));
        }

        let pool = match max_lanes {
            None => None,
            Some(0) => {
                return Err(ScanError::InvalidConfig("max lanes must be positive".into()));
            }
            Some(lanes) => Some(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(lanes)
                    .thread_name(|i| format!("darkscan-lane-{}", i))
                    .build()
                    .map_err(|e| ScanError::InvalidConfig(e.to_string()))?,
            ),
        };

        Ok(Self { chunk_size, pool })
    }

    /// Bytes per lane
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Lane partition this engine would use
    pub fn plan(&self, text_len: usize, max_pattern_len: usize) -> Result<ChunkPlan> {
        ChunkPlan::new(text_len, self.chunk_size, max_pattern_len)
    }

    /// Scan a staged context; record order is unspecified
    pub fn scan(&self, context: &ScanContext, cancel: &CancelToken) -> Result<Vec<MatchRecord>> {
        self.scan_view(context.automaton(), context.text(), cancel)
    }

    fn scan_view(
        &self,
        view: AutomatonView<'_>,
        text: &[u8],
        cancel: &CancelToken,
    ) -> Result<Vec<MatchRecord>> {
        if cancel.is_cancelled() {
            return Err(ScanError::Cancelled);
        }
        if view.is_empty() || text.is_empty() {
            return Ok(Vec::new());
        }

        let plan = self.plan(text.len(), view.max_pattern_len())?;

        let run = || {
            plan.chunks()
                .par_iter()
                .map(|&chunk| scan_lane(&view, text, chunk, cancel))
                .collect::<Result<Vec<_>>>()
        };
        let lanes = match &self.pool {
            Some(pool) => pool.install(run),
            None => run(),
        }?;

        let mut records = Vec::with_capacity(lanes.iter().map(Vec::len).sum());
        for lane in lanes {
            records.extend(lane);
        }

        tracing::debug!(
            lanes = plan.len(),
            overlap = plan.overlap(),
            records = records.len(),
            "Parallel scan complete"
        );

        Ok(records)
    }
}

/// Walk the automaton over host memory in a single lane
///
/// This is the explicit fallback when staging fails; it produces the same
/// records as the parallel path.
pub fn scan_host(
    automaton: &CatalogAutomaton,
    text: &[u8],
    cancel: &CancelToken,
) -> Result<Vec<MatchRecord>> {
    if cancel.is_cancelled() {
        return Err(ScanError::Cancelled);
    }
    let view = automaton.view();
    if view.is_empty() || text.is_empty() {
        return Ok(Vec::new());
    }

    let whole = Chunk {
        walk_start: 0,
        start: 0,
        end: text.len(),
    };
    scan_lane(&view, text, whole, cancel)
}

/// Scan kernel for one lane
fn scan_lane(
    view: &AutomatonView<'_>,
    text: &[u8],
    chunk: Chunk,
    cancel: &CancelToken,
) -> Result<Vec<MatchRecord>> {
    debug_assert!(chunk.walk_start <= chunk.start && chunk.start < chunk.end);
    debug_assert!(chunk.end <= text.len());

    let mut records = Vec::new();
    let mut state = ROOT;

    // Warm-up: at most max_pattern_len - 1 bytes, owned by the previous lane
    for &byte in &text[chunk.walk_start..chunk.start] {
        state = view.next_state(state, byte);
    }

    let owned = &text[chunk.start..chunk.end];
    for (block_index, block) in owned.chunks(CANCEL_POLL_INTERVAL).enumerate() {
        if cancel.is_cancelled() {
            return Err(ScanError::Cancelled);
        }

        let base = chunk.start + block_index * CANCEL_POLL_INTERVAL;
        for (i, &byte) in block.iter().enumerate() {
            state = view.next_state(state, byte);
            let hits = view.matches(state);
            if hits.is_empty() {
                continue;
            }

            let end = base + i + 1;
            for &index in hits {
                let len = view.pattern_len(index);
                debug_assert!(len <= end - chunk.walk_start);
                records.push(MatchRecord {
                    pattern_id: view.pattern_id(index),
                    start: end - len,
                    end,
                });
            }
        }
    }

    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceMemory;
    use crate::{Catalog, Category, Pattern, Severity};
    use proptest::prelude::*;

    fn example_catalog() -> Catalog {
        Catalog::compile(vec![
            Pattern::new(1, "act now", Category::Urgency, Severity::saturating(5)),
            Pattern::new(2, "now or never", Category::Urgency, Severity::saturating(8)),
        ])
        .unwrap()
    }

    fn scan_sorted(catalog: &Catalog, text: &[u8], chunk_size: usize) -> Vec<MatchRecord> {
        let device = DeviceMemory::new(1 << 24);
        let engine = ScanEngine::new(chunk_size).unwrap();
        let ctx = device.stage(catalog.automaton(), text).unwrap();
        let mut records = engine.scan(&ctx, &CancelToken::new()).unwrap();
        records.sort_unstable();
        records
    }

    fn naive(catalog: &Catalog, text: &[u8]) -> Vec<MatchRecord> {
        let mut records = Vec::new();
        for p in catalog.automaton().patterns() {
            let literal = p.literal.as_bytes();
            for start in 0..text.len().saturating_sub(literal.len() - 1) {
                if &text[start..start + literal.len()] == literal {
                    records.push(MatchRecord {
                        pattern_id: p.id,
                        start,
                        end: start + literal.len(),
                    });
                }
            }
        }
        records.sort_unstable();
        records
    }

    fn record(id: u32, start: usize, end: usize) -> MatchRecord {
        MatchRecord {
            pattern_id: PatternId::new(id),
            start,
            end,
        }
    }

    #[test]
    fn test_scan_example() {
        let catalog = example_catalog();
        let text = b"Buy act now or never before it's gone";

        let records = scan_sorted(&catalog, text, DEFAULT_CHUNK_SIZE);
        assert_eq!(records, vec![record(1, 4, 11), record(2, 8, 20)]);
        assert_eq!(&text[4..11], b"act now");
        assert_eq!(&text[8..20], b"now or never");
    }

    #[test]
    fn test_boundary_spanning_matches() {
        let catalog = example_catalog();
        let text = b"Buy act now or never before it's gone".repeat(40);
        let expected = naive(&catalog, &text);
        assert_eq!(expected.len(), 80);

        for chunk_size in [12, 13, 17, 64, 100, 1000, text.len(), text.len() + 5] {
            assert_eq!(scan_sorted(&catalog, &text, chunk_size), expected, "chunk {chunk_size}");
        }
    }

    #[test]
    fn test_lanes_do_not_duplicate() {
        let catalog = Catalog::compile(vec![Pattern::new(
            1,
            "aa",
            Category::Urgency,
            Severity::saturating(1),
        )])
        .unwrap();
        let text = vec![b'a'; 50];

        let records = scan_sorted(&catalog, &text, 2);
        assert_eq!(records.len(), 49);
        assert!(records.windows(2).all(|w| w[0] != w[1]));
    }

    #[test]
    fn test_chunk_plan() {
        let plan = ChunkPlan::new(25, 10, 4).unwrap();
        assert_eq!(plan.len(), 3);
        assert_eq!(plan.overlap(), 3);
        assert_eq!(
            plan.chunks(),
            &[
                Chunk { walk_start: 0, start: 0, end: 10 },
                Chunk { walk_start: 7, start: 10, end: 20 },
                Chunk { walk_start: 17, start: 20, end: 25 },
            ]
        );

        assert!(ChunkPlan::new(0, 10, 4).unwrap().is_empty());
        assert!(matches!(ChunkPlan::new(25, 3, 4), Err(ScanError::InvalidConfig(_))));
        assert!(matches!(ChunkPlan::new(25, 0, 0), Err(ScanError::InvalidConfig(_))));
    }

    #[test]
    fn test_chunk_smaller_than_pattern_rejected() {
        let catalog = example_catalog();
        let device = DeviceMemory::new(1 << 20);
        let engine = ScanEngine::new(8).unwrap();
        let ctx = device.stage(catalog.automaton(), b"act now or never").unwrap();

        assert!(matches!(
            engine.scan(&ctx, &CancelToken::new()),
            Err(ScanError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_cancelled_scan() {
        let catalog = example_catalog();
        let device = DeviceMemory::with_cache(1 << 24, false);
        let engine = ScanEngine::new(1024).unwrap();
        let text = b"act now ".repeat(10_000);
        let token = CancelToken::new();
        token.cancel();

        {
            let ctx = device.stage(catalog.automaton(), &text).unwrap();
            assert!(matches!(engine.scan(&ctx, &token), Err(ScanError::Cancelled)));
        }
        assert_eq!(device.allocated(), 0);
        assert!(matches!(
            scan_host(catalog.automaton(), &text, &token),
            Err(ScanError::Cancelled)
        ));
    }

    #[test]
    fn test_lane_polls_cancellation() {
        let catalog = example_catalog();
        let text = b"act now or never. ".repeat(1000);
        let view = catalog.automaton().view();
        let whole = Chunk {
            walk_start: 0,
            start: 0,
            end: text.len(),
        };
        let token = CancelToken::new();

        assert_eq!(scan_lane(&view, &text, whole, &token).unwrap().len(), 2000);

        // The lane itself must stop; no partial records come back
        token.cancel();
        assert!(matches!(
            scan_lane(&view, &text, whole, &token),
            Err(ScanError::Cancelled)
        ));
    }

    #[test]
    fn test_cancel_during_scan() {
        let catalog = example_catalog();
        let device = DeviceMemory::new(1 << 26);
        let engine = ScanEngine::with_lanes(64 * 1024, Some(2)).unwrap();
        let mut text = vec![b'x'; 16 << 20];
        text.extend_from_slice(b"act now");
        let ctx = device.stage(catalog.automaton(), &text).unwrap();
        let token = CancelToken::new();

        let outcome = std::thread::scope(|s| {
            let scan = s.spawn(|| engine.scan(&ctx, &token));
            token.cancel();
            scan.join().unwrap()
        });

        assert!(matches!(outcome, Err(ScanError::Cancelled)));
        drop(ctx);
        assert_eq!(device.allocated(), catalog.automaton().image_bytes());
    }

    #[test]
    fn test_bounded_lane_pool() {
        let catalog = example_catalog();
        let text = b"act now or never. ".repeat(500);
        let device = DeviceMemory::new(1 << 24);
        let engine = ScanEngine::with_lanes(64, Some(2)).unwrap();
        let ctx = device.stage(catalog.automaton(), &text).unwrap();

        let mut records = engine.scan(&ctx, &CancelToken::new()).unwrap();
        records.sort_unstable();
        assert_eq!(records, naive(&catalog, &text));
        assert!(matches!(
            ScanEngine::with_lanes(64, Some(0)),
            Err(ScanError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_host_matches_parallel() {
        let catalog = example_catalog();
        let text = b"now or never, act now, act now or never".repeat(30);

        let mut host = scan_host(catalog.automaton(), &text, &CancelToken::new()).unwrap();
        host.sort_unstable();
        assert_eq!(host, scan_sorted(&catalog, &text, 16));
    }

    #[test]
    fn test_empty_inputs() {
        let catalog = example_catalog();
        assert!(scan_sorted(&catalog, b"", 16).is_empty());
        assert!(scan_sorted(&Catalog::empty(), b"act now", 16).is_empty());
    }

    #[test]
    fn test_agrees_with_aho_corasick() {
        let catalog = crate::default_catalog().unwrap();
        let text = "Hurry, only today! Items almost sold out; a service fee and handling fee apply. \
                    Call to cancel. Act now or never. No thanks, I don't want savings. "
            .repeat(200)
            .to_ascii_lowercase();

        let literals: Vec<&str> = catalog
            .automaton()
            .patterns()
            .iter()
            .map(|p| p.literal.as_str())
            .collect();
        let oracle = aho_corasick::AhoCorasick::new(&literals).unwrap();
        let mut expected: Vec<MatchRecord> = oracle
            .find_overlapping_iter(&text)
            .map(|m| MatchRecord {
                pattern_id: catalog.automaton().patterns()[m.pattern().as_usize()].id,
                start: m.start(),
                end: m.end(),
            })
            .collect();
        expected.sort_unstable();

        assert!(!expected.is_empty());
        assert_eq!(scan_sorted(&catalog, text.as_bytes(), 100), expected);
    }

    fn literal_set() -> impl Strategy<Value = Vec<String>> {
        prop::collection::vec("[ab ]{1,4}", 1..6)
    }

    fn build(literals: &[String]) -> Catalog {
        Catalog::compile(literals.iter().zip(1u32..).map(|(literal, id)| {
            Pattern::new(id, literal.clone(), Category::Scarcity, Severity::saturating(1))
        }))
        .unwrap()
    }

    proptest! {
        #[test]
        fn matches_naive_reference(literals in literal_set(), text in "[abc ]{0,300}", chunk in 4usize..64) {
            let catalog = build(&literals);
            prop_assert_eq!(scan_sorted(&catalog, text.as_bytes(), chunk), naive(&catalog, text.as_bytes()));
        }

        #[test]
        fn chunk_size_does_not_change_records(literals in literal_set(), text in "[ab ]{0,300}", c1 in 4usize..40, c2 in 4usize..400) {
            let catalog = build(&literals);
            prop_assert_eq!(
                scan_sorted(&catalog, text.as_bytes(), c1),
                scan_sorted(&catalog, text.as_bytes(), c2)
            );
        }

        #[test]
        fn every_record_is_an_exact_occurrence(literals in literal_set(), text in "[ab ]{0,200}") {
            let catalog = build(&literals);
            let bytes = text.as_bytes();
            for r in scan_sorted(&catalog, bytes, 4) {
                let literal = &catalog.pattern(r.pattern_id).unwrap().literal;
                prop_assert!(r.start < r.end && r.end <= bytes.len());
                prop_assert_eq!(&bytes[r.start..r.end], literal.as_bytes());
            }
        }
    }
}

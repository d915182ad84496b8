//! Device memory manager
//!
//! Models accelerator-resident storage with a hard capacity. Every staged
//! buffer carries an [`Allocation`] guard, so memory goes back to the pool
//! on every exit path: normal return, error, cancellation or unwind.
//!
//! # Design
//!
//! - Reservation is a CAS on one atomic counter (no locks on the hot path)
//! - Compiled catalogs are staged once and cached by [`CatalogId`]; when a
//!   reservation fails, images no running scan holds are reclaimed first
//! - Text is staged per scan with `max_pattern_len - 1` bytes of padding

use crate::automaton::{AutomatonView, CatalogAutomaton, CatalogId};
use crate::{Result, ScanError};
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Capacity accounting shared by the manager and its live allocations
#[derive(Debug)]
struct Ledger {
    capacity: usize,
    allocated: AtomicUsize,
    peak: AtomicUsize,
}

/// Reserved device bytes, returned to the ledger on drop
#[derive(Debug)]
struct Allocation {
    ledger: Arc<Ledger>,
    bytes: usize,
}

impl Drop for Allocation {
    fn drop(&mut self) {
        self.ledger.allocated.fetch_sub(self.bytes, Ordering::AcqRel);
    }
}

/// Device-resident copy of a compiled catalog's flat tables
#[derive(Debug)]
pub struct StagedAutomaton {
    catalog: CatalogId,
    classes: Box<[u8]>,
    alphabet_len: usize,
    transitions: Box<[u32]>,
    match_starts: Box<[u32]>,
    match_patterns: Box<[u32]>,
    pattern_ids: Box<[u32]>,
    pattern_lens: Box<[u32]>,
    max_pattern_len: usize,
    _allocation: Allocation,
}

impl StagedAutomaton {
    fn copy_from(automaton: &CatalogAutomaton, allocation: Allocation) -> Self {
        let [transitions, match_starts, match_patterns, pattern_ids, pattern_lens] =
            automaton.tables();
        Self {
            catalog: automaton.id(),
            classes: automaton.classes().to_vec().into_boxed_slice(),
            alphabet_len: automaton.alphabet_len(),
            transitions: transitions.into(),
            match_starts: match_starts.into(),
            match_patterns: match_patterns.into(),
            pattern_ids: pattern_ids.into(),
            pattern_lens: pattern_lens.into(),
            max_pattern_len: automaton.max_pattern_len(),
            _allocation: allocation,
        }
    }

    /// Catalog this image was staged from
    pub fn catalog(&self) -> CatalogId {
        self.catalog
    }

    /// Bytes reserved for this image
    pub fn size_bytes(&self) -> usize {
        self._allocation.bytes
    }

    /// Borrow the staged tables
    pub fn view(&self) -> AutomatonView<'_> {
        AutomatonView::from_parts(
            &self.classes,
            self.alphabet_len,
            &self.transitions,
            &self.match_starts,
            &self.match_patterns,
            &self.pattern_ids,
            &self.pattern_lens,
            self.max_pattern_len,
        )
    }
}

/// Device-resident copy of one text buffer
#[derive(Debug)]
struct StagedText {
    data: Box<[u8]>,
    len: usize,
    _allocation: Allocation,
}

/// Everything one scan needs on the device
///
/// Dropping the context releases the text reservation; the automaton image
/// is released too unless the manager keeps it cached.
#[derive(Debug)]
pub struct ScanContext {
    automaton: Arc<StagedAutomaton>,
    text: StagedText,
}

impl ScanContext {
    /// Staged automaton tables
    pub fn automaton(&self) -> AutomatonView<'_> {
        self.automaton.view()
    }

    /// Catalog the context was staged for
    pub fn catalog(&self) -> CatalogId {
        self.automaton.catalog()
    }

    /// Staged text, without padding
    pub fn text(&self) -> &[u8] {
        &self.text.data[..self.text.len]
    }

    /// Logical text length
    pub fn text_len(&self) -> usize {
        self.text.len
    }

    /// Padded length reserved for the text
    pub fn padded_len(&self) -> usize {
        self.text.data.len()
    }
}

/// Bounded device memory with a staged-catalog cache
#[derive(Debug)]
pub struct DeviceMemory {
    ledger: Arc<Ledger>,
    cache: DashMap<CatalogId, Arc<StagedAutomaton>>,
    cache_enabled: bool,
}

impl DeviceMemory {
    /// Create with `capacity` bytes and catalog caching enabled
    pub fn new(capacity: usize) -> Self {
        Self::with_cache(capacity, true)
    }

    /// Create with explicit caching policy
    pub fn with_cache(capacity: usize, cache_enabled: bool) -> Self {
        Self {
            ledger: Arc::new(Ledger {
                capacity,
                allocated: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }),
            cache: DashMap::new(),
            cache_enabled,
        }
    }

    /// Total capacity in bytes
    pub fn capacity(&self) -> usize {
        self.ledger.capacity
    }

    /// Bytes currently reserved
    pub fn allocated(&self) -> usize {
        self.ledger.allocated.load(Ordering::Acquire)
    }

    /// Bytes free for new reservations
    pub fn available(&self) -> usize {
        self.capacity().saturating_sub(self.allocated())
    }

    /// Highest reservation level observed
    pub fn peak(&self) -> usize {
        self.ledger.peak.load(Ordering::Relaxed)
    }

    /// Number of catalogs with a cached image
    pub fn cached_catalogs(&self) -> usize {
        self.cache.len()
    }

    /// Whether a catalog image is cached
    pub fn is_cached(&self, catalog: CatalogId) -> bool {
        self.cache.contains_key(&catalog)
    }

    fn reserve(&self, bytes: usize) -> Result<Allocation> {
        let ledger = &self.ledger;
        let previous = ledger
            .allocated
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                current
                    .checked_add(bytes)
                    .filter(|&total| total <= ledger.capacity)
            })
            .map_err(|current| ScanError::DeviceOutOfMemory {
                requested: bytes,
                available: ledger.capacity.saturating_sub(current),
            })?;
        ledger.peak.fetch_max(previous + bytes, Ordering::Relaxed);

        Ok(Allocation {
            ledger: Arc::clone(ledger),
            bytes,
        })
    }

    /// Reserve, reclaiming idle cached images once if the device is full
    fn reserve_reclaiming(&self, bytes: usize) -> Result<Allocation> {
        match self.reserve(bytes) {
            Err(ScanError::DeviceOutOfMemory { .. }) if self.reclaim_idle() > 0 => {
                self.reserve(bytes)
            }
            outcome => outcome,
        }
    }

    /// Drop cached images no live context holds. Returns the bytes freed.
    pub fn reclaim_idle(&self) -> usize {
        let mut freed = 0;
        // The cache holds the only reference to an idle image
        self.cache.retain(|_, staged| {
            let idle = Arc::strong_count(staged) == 1;
            if idle {
                freed += staged.size_bytes();
            }
            !idle
        });

        if freed > 0 {
            tracing::debug!(freed, allocated = self.allocated(), "Reclaimed idle catalog images");
        }
        freed
    }

    fn stage_automaton(&self, automaton: &CatalogAutomaton) -> Result<(Arc<StagedAutomaton>, bool)> {
        if let Some(staged) = self.cache.get(&automaton.id()) {
            return Ok((Arc::clone(staged.value()), true));
        }

        let allocation = self.reserve_reclaiming(automaton.image_bytes())?;
        let staged = Arc::new(StagedAutomaton::copy_from(automaton, allocation));

        if !self.cache_enabled {
            return Ok((staged, false));
        }

        // A concurrent stage of the same catalog may have won; keep theirs
        let cached = self
            .cache
            .entry(automaton.id())
            .or_insert_with(|| Arc::clone(&staged));
        Ok((Arc::clone(cached.value()), false))
    }

    /// Copy the automaton (unless cached) and the text to the device
    ///
    /// Both copies finish before this returns, so no lane can observe a
    /// partially staged buffer.
    pub fn stage(&self, automaton: &CatalogAutomaton, text: &[u8]) -> Result<ScanContext> {
        let (staged, cache_hit) = self.stage_automaton(automaton)?;

        let padding = automaton.max_pattern_len().saturating_sub(1);
        let padded_len = text.len() + padding;
        let allocation = self.reserve_reclaiming(padded_len)?;

        let mut data = Vec::with_capacity(padded_len);
        data.extend_from_slice(text);
        data.resize(padded_len, 0);

        tracing::debug!(
            catalog = %automaton.id(),
            text_bytes = text.len(),
            padding,
            cache_hit,
            allocated = self.allocated(),
            "Staged scan context"
        );

        Ok(ScanContext {
            automaton: staged,
            text: StagedText {
                data: data.into_boxed_slice(),
                len: text.len(),
                _allocation: allocation,
            },
        })
    }

    /// Release a context explicitly; equivalent to dropping it
    pub fn release(&self, context: ScanContext) {
        drop(context);
    }

    /// Drop a catalog's cached image. Returns true if one was cached.
    ///
    /// Contexts still holding the image keep it alive until they finish.
    pub fn evict(&self, catalog: CatalogId) -> bool {
        self.cache.remove(&catalog).is_some()
    }

    /// Drop every cached image
    pub fn clear_cache(&self) {
        self.cache.clear();
    }
}

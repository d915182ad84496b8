//! darkscan Common - Shared types for the dark pattern detector
//!
//! This crate provides the small, dependency-light primitives shared by the
//! detector crates:
//! - Pattern value objects (ids, categories, bounded severities)
//! - Metrics and telemetry
//! - Error handling

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod metrics;
pub mod value_objects;

pub use error::*;
pub use value_objects::*;

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Monotonic scan clock, immune to wall-clock steps
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(Instant);

impl Timestamp {
    /// Capture the current instant
    #[inline(always)]
    pub fn now() -> Self {
        Self(Instant::now())
    }

    /// Nanoseconds from `earlier` to this timestamp, 0 if `earlier` is later
    #[inline(always)]
    pub fn nanos_since(&self, earlier: Timestamp) -> u64 {
        self.0.saturating_duration_since(earlier.0).as_nanos() as u64
    }

    /// Duration since this timestamp in microseconds
    #[inline(always)]
    pub fn elapsed_micros(&self) -> u64 {
        self.0.elapsed().as_micros() as u64
    }
}

/// Lock-free counter for scan statistics
#[derive(Debug, Default)]
pub struct AtomicCounter(AtomicU64);

impl AtomicCounter {
    /// Create new counter
    pub const fn new(value: u64) -> Self {
        Self(AtomicU64::new(value))
    }

    /// Increment and return previous value
    #[inline(always)]
    pub fn inc(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }

    /// Add value and return previous
    #[inline(always)]
    pub fn add(&self, val: u64) -> u64 {
        self.0.fetch_add(val, Ordering::Relaxed)
    }

    /// Get current value
    #[inline(always)]
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

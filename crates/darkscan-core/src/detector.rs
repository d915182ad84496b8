//! Scan facade
//!
//! [`Detector`] ties the pipeline together: stage, scan, join, aggregate.
//! One detector is `Send + Sync` and can serve many concurrent scans; each
//! scan gets its own staged text while compiled catalogs are staged once.

use crate::aggregate::{aggregate, ExecutionPath, ScanMetadata, ScanResult};
use crate::catalog::Catalog;
use crate::device::DeviceMemory;
use crate::engine::{scan_host, CancelToken, ScanEngine, DEFAULT_CHUNK_SIZE};
use crate::{Result, ScanError};
use darkscan_common::metrics::{HistogramSnapshot, LatencyHistogram};
use darkscan_common::{AtomicCounter, Timestamp};
use serde::{Deserialize, Serialize};

/// Default simulated device memory (256 MiB)
pub const DEFAULT_DEVICE_CAPACITY: usize = 256 * 1024 * 1024;

/// What to do when staging runs out of device memory
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackPolicy {
    /// Surface `DeviceOutOfMemory`
    #[default]
    Fail,
    /// Scan in host memory on a single lane
    Host,
}

/// Detector configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Bytes owned by each lane; must be at least the longest pattern
    pub chunk_size: usize,
    /// Simulated device memory in bytes
    pub device_capacity: usize,
    /// Reject empty catalogs instead of returning an empty result
    pub strict: bool,
    /// Out-of-memory behaviour
    pub fallback: FallbackPolicy,
    /// Keep staged catalog images between scans
    pub cache_catalogs: bool,
    /// Lane pool size; `None` uses the global rayon pool
    pub max_lanes: Option<usize>,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            device_capacity: DEFAULT_DEVICE_CAPACITY,
            strict: false,
            fallback: FallbackPolicy::Fail,
            cache_catalogs: true,
            max_lanes: None,
        }
    }
}

impl DetectorConfig {
    /// Reject values the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(ScanError::InvalidConfig("chunk_size must be positive".into()));
        }
        if self.device_capacity == 0 {
            return Err(ScanError::InvalidConfig(
                "device_capacity must be positive".into(),
            ));
        }
        if self.max_lanes == Some(0) {
            return Err(ScanError::InvalidConfig("max_lanes must be positive".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct DetectorStats {
    scans: AtomicCounter,
    bytes_scanned: AtomicCounter,
    matches: AtomicCounter,
    host_fallbacks: AtomicCounter,
    cancelled: AtomicCounter,
    failures: AtomicCounter,
    latency: LatencyHistogram,
}

/// Point-in-time detector statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetectorStatsSnapshot {
    /// Completed scans
    pub scans: u64,
    /// Bytes covered by completed scans
    pub bytes_scanned: u64,
    /// Matches reported by completed scans
    pub matches: u64,
    /// Scans that ran on the host after staging failed
    pub host_fallbacks: u64,
    /// Scans stopped by a cancel token
    pub cancelled: u64,
    /// Scans that returned any other error
    pub failures: u64,
    /// Latency of completed scans
    pub latency: HistogramSnapshot,
}

/// Parallel dark pattern detector
#[derive(Debug)]
pub struct Detector {
    config: DetectorConfig,
    device: DeviceMemory,
    engine: ScanEngine,
    stats: DetectorStats,
}

impl Detector {
    /// Create a detector
    pub fn new(config: DetectorConfig) -> Result<Self> {
        config.validate()?;
        let engine = ScanEngine::with_lanes(config.chunk_size, config.max_lanes)?;
        let device = DeviceMemory::with_cache(config.device_capacity, config.cache_catalogs);

        tracing::info!(
            chunk_size = config.chunk_size,
            device_capacity = config.device_capacity,
            max_lanes = ?config.max_lanes,
            fallback = ?config.fallback,
            "Detector initialized"
        );

        Ok(Self {
            config,
            device,
            engine,
            stats: DetectorStats::default(),
        })
    }

    /// Active configuration
    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// Device memory backing this detector
    pub fn device(&self) -> &DeviceMemory {
        &self.device
    }

    /// Scan `text` against `catalog`
    pub fn detect(&self, text: impl AsRef<[u8]>, catalog: &Catalog) -> Result<ScanResult> {
        self.detect_with_cancel(text, catalog, &CancelToken::new())
    }

    /// Scan with a cancel token
    ///
    /// A cancelled scan returns [`ScanError::Cancelled`], never a partial
    /// result, and releases its staged text.
    pub fn detect_with_cancel(
        &self,
        text: impl AsRef<[u8]>,
        catalog: &Catalog,
        cancel: &CancelToken,
    ) -> Result<ScanResult> {
        let text = text.as_ref();
        let start = Timestamp::now();

        match self.run(text, catalog, cancel) {
            Ok(mut result) => {
                let elapsed_us = start.elapsed_micros();
                result.metadata.scan_time_us = elapsed_us;

                self.stats.scans.inc();
                self.stats.bytes_scanned.add(text.len() as u64);
                self.stats.matches.add(result.matches.len() as u64);
                self.stats.latency.record(elapsed_us);

                tracing::debug!(
                    catalog = %catalog.id(),
                    bytes = text.len(),
                    matches = result.matches.len(),
                    total_severity = result.total_severity,
                    time_us = elapsed_us,
                    "Scan complete"
                );
                Ok(result)
            }
            Err(ScanError::Cancelled) => {
                self.stats.cancelled.inc();
                tracing::warn!(catalog = %catalog.id(), bytes = text.len(), "Scan cancelled");
                Err(ScanError::Cancelled)
            }
            Err(e) => {
                self.stats.failures.inc();
                Err(e)
            }
        }
    }

    fn run(&self, text: &[u8], catalog: &Catalog, cancel: &CancelToken) -> Result<ScanResult> {
        let mut metadata = ScanMetadata {
            catalog: Some(catalog.id()),
            bytes_scanned: text.len(),
            ..ScanMetadata::default()
        };

        if catalog.is_empty() {
            if self.config.strict {
                return Err(ScanError::EmptyCatalog);
            }
            return Ok(ScanResult {
                metadata,
                ..ScanResult::default()
            });
        }

        let automaton = catalog.automaton();
        let records = match self.device.stage(automaton, text) {
            Ok(context) => {
                let records = self.engine.scan(&context, cancel);
                self.device.release(context);
                metadata.lanes = text.len().div_ceil(self.engine.chunk_size());
                records?
            }
            Err(ScanError::DeviceOutOfMemory {
                requested,
                available,
            }) if self.config.fallback == FallbackPolicy::Host => {
                tracing::warn!(
                    catalog = %catalog.id(),
                    requested,
                    available,
                    "Device memory exhausted, scanning on host"
                );
                self.stats.host_fallbacks.inc();
                metadata.lanes = usize::from(!text.is_empty());
                metadata.execution = ExecutionPath::Host;
                scan_host(automaton, text, cancel)?
            }
            Err(e) => return Err(e),
        };

        let mut result = aggregate(records, automaton);
        result.metadata = metadata;
        Ok(result)
    }

    /// Drop a catalog's staged image. Returns true if one was cached.
    pub fn evict(&self, catalog: &Catalog) -> bool {
        self.device.evict(catalog.id())
    }

    /// Get statistics snapshot
    pub fn stats(&self) -> DetectorStatsSnapshot {
        DetectorStatsSnapshot {
            scans: self.stats.scans.get(),
            bytes_scanned: self.stats.bytes_scanned.get(),
            matches: self.stats.matches.get(),
            host_fallbacks: self.stats.host_fallbacks.get(),
            cancelled: self.stats.cancelled.get(),
            failures: self.stats.failures.get(),
            latency: self.stats.latency.snapshot(),
        }
    }
}

/// One-shot scan with a default detector
///
/// Nothing is cached between calls; keep a [`Detector`] around to reuse
/// staged catalogs.
pub fn detect(text: impl AsRef<[u8]>, catalog: &Catalog) -> Result<ScanResult> {
    Detector::new(DetectorConfig::default())?.detect(text, catalog)
}

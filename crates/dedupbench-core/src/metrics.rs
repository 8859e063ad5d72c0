//! Run results and process-wide engine counters.
//!
//! [`RunResult`] is the per-run row handed to a reporting layer. It
//! serialises with the field names of the result-row schema
//! (`sourcePath`, `repeatRatePercent`, ...). [`EngineMetrics`] accumulates
//! across runs and renders in the Prometheus text format.

use crate::fingerprint::HashAlgorithm;
use crate::recover::RecoveryStats;
use crate::segment::SegmentationStats;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

/// Aggregate for one (source, block size, algorithm) run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResult {
    /// Source file segmented, empty for a recovery replayed on its own
    pub source_path: PathBuf,
    /// Hash algorithm
    pub algorithm: HashAlgorithm,
    /// Nominal block size in bytes
    pub block_size: u64,
    /// Blocks read from the source
    pub total_blocks: u64,
    /// Digests inserted as first sightings
    pub distinct_digests: u64,
    /// Blocks whose digest was already indexed
    pub repeat_count: u64,
    /// `repeat_count / total_blocks * 100`
    pub repeat_rate_percent: f64,
    /// Wall time of segmentation
    pub segmentation_time_seconds: f64,
    /// Trail records resolved to real bytes
    pub recovered_blocks: u64,
    /// `recovered_blocks / trail records * 100`
    pub recovered_rate_percent: f64,
    /// Wall time of recovery
    pub recovery_time_seconds: f64,
    /// Trail records with no index entry
    #[serde(default)]
    pub missing_records: u64,
    /// Trail records whose recorded source could not be opened
    #[serde(default)]
    pub missing_sources: u64,
    /// Trail records whose source was shorter than recorded
    #[serde(default)]
    pub short_reads: u64,
    /// Trail written or replayed, when it outlives the run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trail_path: Option<PathBuf>,
}

/// `part / whole * 100`, 0 for an empty whole.
pub(crate) fn percent(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64 * 100.0
    }
}

impl RunResult {
    /// Zeroed row for a run about to start.
    pub fn new(source_path: impl Into<PathBuf>, algorithm: HashAlgorithm, block_size: u64) -> Self {
        Self {
            source_path: source_path.into(),
            algorithm,
            block_size,
            total_blocks: 0,
            distinct_digests: 0,
            repeat_count: 0,
            repeat_rate_percent: 0.0,
            segmentation_time_seconds: 0.0,
            recovered_blocks: 0,
            recovered_rate_percent: 0.0,
            recovery_time_seconds: 0.0,
            missing_records: 0,
            missing_sources: 0,
            short_reads: 0,
            trail_path: None,
        }
    }

    /// Row for a recovery replayed from `trail` alone. The source is not
    /// known, only the files each record points at.
    pub fn for_trail(trail: impl Into<PathBuf>, algorithm: HashAlgorithm, block_size: u64) -> Self {
        Self::new(PathBuf::new(), algorithm, block_size).with_trail(trail)
    }

    /// Record the trail path.
    pub fn with_trail(mut self, trail: impl Into<PathBuf>) -> Self {
        self.trail_path = Some(trail.into());
        self
    }

    /// Fold in the segmentation half.
    pub fn with_segmentation(mut self, stats: &SegmentationStats) -> Self {
        self.total_blocks = stats.total_blocks;
        self.distinct_digests = stats.distinct;
        self.repeat_count = stats.repeats;
        self.repeat_rate_percent = stats.repeat_rate_percent();
        self.segmentation_time_seconds = stats.elapsed.as_secs_f64();
        self
    }

    /// Fold in the recovery half.
    pub fn with_recovery(mut self, stats: &RecoveryStats) -> Self {
        self.recovered_blocks = stats.recovered;
        self.recovered_rate_percent = stats.recovered_rate_percent();
        self.recovery_time_seconds = stats.elapsed.as_secs_f64();
        self.missing_records = stats.missing_records;
        self.missing_sources = stats.missing_sources;
        self.short_reads = stats.short_reads;
        self
    }

    /// Column titles for tabular output
    pub const COLUMNS: [&'static str; 11] = [
        "source",
        "algorithm",
        "block_size",
        "blocks",
        "distinct",
        "repeats",
        "repeat_%",
        "seg_s",
        "recovered",
        "recovered_%",
        "rec_s",
    ];

    /// Cells in [`RunResult::COLUMNS`] order
    pub fn cells(&self) -> [String; 11] {
        let source = if self.source_path.as_os_str().is_empty() {
            "-".to_string()
        } else {
            self.source_path.display().to_string()
        };
        [
            source,
            self.algorithm.to_string(),
            self.block_size.to_string(),
            self.total_blocks.to_string(),
            self.distinct_digests.to_string(),
            self.repeat_count.to_string(),
            format!("{:.2}", self.repeat_rate_percent),
            format!("{:.3}", self.segmentation_time_seconds),
            self.recovered_blocks.to_string(),
            format!("{:.2}", self.recovered_rate_percent),
            format!("{:.3}", self.recovery_time_seconds),
        ]
    }
}

/// Counter or gauge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    /// Monotonic
    Counter,
    /// Point-in-time
    Gauge,
}

/// The value of a metric.
#[derive(Debug, Clone, PartialEq)]
pub enum MetricValue {
    /// A counter value
    Counter(u64),
    /// A gauge value
    Gauge(f64),
}

/// One exported metric.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineMetric {
    /// Metric name
    pub name: String,
    /// Help text
    pub help: String,
    /// Kind
    pub kind: MetricKind,
    /// Value
    pub value: MetricValue,
}

/// Lock-free counters updated by the pipelines.
#[derive(Debug, Default)]
pub struct EngineMetrics {
    blocks_hashed: AtomicU64,
    bytes_hashed: AtomicU64,
    dedup_hits: AtomicU64,
    dedup_misses: AtomicU64,
    blocks_recovered: AtomicU64,
    blocks_unrecoverable: AtomicU64,
    runs_completed: AtomicU64,
    runs_failed: AtomicU64,
}

impl EngineMetrics {
    /// All counters at zero
    pub fn new() -> Self {
        Self::default()
    }

    /// A block was read and hashed.
    #[inline]
    pub fn record_block(&self, bytes: u64) {
        self.blocks_hashed.fetch_add(1, Ordering::Relaxed);
        self.bytes_hashed.fetch_add(bytes, Ordering::Relaxed);
    }

    /// A digest was already indexed.
    #[inline]
    pub fn record_dedup_hit(&self) {
        self.dedup_hits.fetch_add(1, Ordering::Relaxed);
    }

    /// A digest was seen for the first time.
    #[inline]
    pub fn record_dedup_miss(&self) {
        self.dedup_misses.fetch_add(1, Ordering::Relaxed);
    }

    /// A trail record was resolved to source bytes.
    #[inline]
    pub fn record_recovered(&self) {
        self.blocks_recovered.fetch_add(1, Ordering::Relaxed);
    }

    /// A trail record was replaced by a zero-filled placeholder.
    #[inline]
    pub fn record_unrecoverable(&self) {
        self.blocks_unrecoverable.fetch_add(1, Ordering::Relaxed);
    }

    /// A pipeline run finished, successfully or not.
    pub fn record_run(&self, ok: bool) {
        if ok {
            self.runs_completed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.runs_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// `hits / (hits + misses)`, 0 before any lookup.
    pub fn dedup_ratio(&self) -> f64 {
        let hits = self.dedup_hits.load(Ordering::Relaxed);
        let misses = self.dedup_misses.load(Ordering::Relaxed);
        percent(hits, hits + misses) / 100.0
    }

    /// Snapshot every metric.
    pub fn collect(&self) -> Vec<EngineMetric> {
        let counter = |name: &str, help: &str, v: &AtomicU64| EngineMetric {
            name: format!("dedupbench_{}", name),
            help: help.to_string(),
            kind: MetricKind::Counter,
            value: MetricValue::Counter(v.load(Ordering::Relaxed)),
        };
        vec![
            counter("blocks_hashed_total", "Blocks read and hashed", &self.blocks_hashed),
            counter("bytes_hashed_total", "Bytes read and hashed", &self.bytes_hashed),
            counter("dedup_hits_total", "Blocks whose digest was already indexed", &self.dedup_hits),
            counter("dedup_misses_total", "Blocks inserted as first sightings", &self.dedup_misses),
            EngineMetric {
                name: "dedupbench_dedup_ratio".to_string(),
                help: "Dedup hit ratio (hits / (hits + misses))".to_string(),
                kind: MetricKind::Gauge,
                value: MetricValue::Gauge(self.dedup_ratio()),
            },
            counter("blocks_recovered_total", "Trail records rebuilt from source bytes", &self.blocks_recovered),
            counter(
                "blocks_unrecoverable_total",
                "Trail records replaced by zero-filled placeholders",
                &self.blocks_unrecoverable,
            ),
            counter("runs_completed_total", "Pipeline runs that finished", &self.runs_completed),
            counter("runs_failed_total", "Pipeline runs that failed", &self.runs_failed),
        ]
    }

    /// Prometheus text exposition of [`EngineMetrics::collect`].
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        for m in self.collect() {
            let (kind, value) = match m.value {
                MetricValue::Counter(v) => ("counter", v.to_string()),
                MetricValue::Gauge(v) => ("gauge", format!("{}", v)),
            };
            let _ = writeln!(out, "# HELP {} {}", m.name, m.help);
            let _ = writeln!(out, "# TYPE {} {}", m.name, kind);
            let _ = writeln!(out, "{} {}", m.name, value);
        }
        out
    }
}

//! Segmentation: one pass over a source file.
//!
//! Each fixed-size block is hashed, counted in the dedup index and appended
//! to the trail. Duplicates are appended too; the trail is the full block
//! sequence in source order.

use crate::error::{DedupError, Result};
use crate::events::{LogLevel, Progress, ProgressThrottle, RunContext, RunKind, RunPhase, RunTracker};
use crate::fingerprint::{digest, HashAlgorithm};
use crate::index::{DedupIndex, Namespace};
use crate::metrics::percent;
use crate::reader::BlockReader;
use crate::trail::TrailWriter;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, instrument};

/// What to segment and where the trail goes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentRequest {
    /// File to read
    pub source: PathBuf,
    /// Trail file to create
    pub trail: PathBuf,
    /// Block size in bytes, > 0
    pub block_size: u64,
    /// Digest algorithm
    pub algorithm: HashAlgorithm,
    /// Truncate an existing trail instead of failing
    #[serde(default)]
    pub overwrite: bool,
}

/// Counters for one segmentation run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SegmentationStats {
    /// Blocks read (= trail records written)
    pub total_blocks: u64,
    /// First sightings inserted
    pub distinct: u64,
    /// Blocks whose digest was already indexed
    pub repeats: u64,
    /// Source bytes consumed
    pub bytes: u64,
    /// Wall time
    pub elapsed: Duration,
}

impl SegmentationStats {
    /// `repeats / total_blocks * 100`
    pub fn repeat_rate_percent(&self) -> f64 {
        percent(self.repeats, self.total_blocks)
    }
}

fn block_len(block_size: u64) -> Result<usize> {
    usize::try_from(block_size).map_err(|_| DedupError::InvalidBlockSize(block_size))
}

/// Path recorded in the index for later recovery; absolute when resolvable.
fn recorded_path(source: &Path) -> PathBuf {
    std::fs::canonicalize(source).unwrap_or_else(|_| source.to_path_buf())
}

/// Segment `req.source` into `req.trail`, counting blocks in the namespace
/// for `(req.block_size, req.algorithm)`.
///
/// The index must be reachable before any file is touched. Nothing is
/// rolled back on failure: records already counted and trail bytes already
/// written stay.
#[instrument(skip(index, ctx), fields(source = %req.source.display(), block_size = req.block_size, algorithm = %req.algorithm))]
pub fn run_segmentation(
    index: &mut DedupIndex,
    req: &SegmentRequest,
    ctx: &RunContext,
) -> Result<SegmentationStats> {
    let mut tracker = RunTracker::new(RunKind::Segmentation, &*ctx.sink);
    tracker.advance(RunPhase::ValidatingPreconditions);
    let outcome = segment(index, req, ctx, &mut tracker);
    match &outcome {
        Ok(stats) => ctx.log(
            LogLevel::Success,
            format!(
                "segmented {} into {} blocks ({} distinct, {} repeats, {:.2}% repeat rate)",
                req.source.display(),
                stats.total_blocks,
                stats.distinct,
                stats.repeats,
                stats.repeat_rate_percent()
            ),
        ),
        Err(err) => {
            tracker.fail(err);
            ctx.log(
                LogLevel::Error,
                format!("segmentation of {} failed: {}", req.source.display(), err),
            );
        }
    }
    ctx.metrics.record_run(outcome.is_ok());
    outcome
}

fn segment(
    index: &mut DedupIndex,
    req: &SegmentRequest,
    ctx: &RunContext,
    tracker: &mut RunTracker<'_>,
) -> Result<SegmentationStats> {
    let started = Instant::now();
    let ns = Namespace::new(req.block_size, req.algorithm)?;
    let len = block_len(req.block_size)?;
    index.ping()?;
    if index.ensure_namespace(&ns)? {
        ctx.log(LogLevel::Info, format!("created namespace `{}`", ns));
    }

    let mut reader = BlockReader::open(&req.source)?;
    let mut trail = TrailWriter::create(&req.trail, req.algorithm, req.overwrite)?;
    let source_path = recorded_path(&req.source);
    let total = reader.size();
    tracker.advance(RunPhase::Running);

    let mut stats = SegmentationStats::default();
    let mut throttle = ProgressThrottle::new(ctx.progress_interval_bytes);
    let mut offset = 0u64;
    while !reader.is_at_end() {
        ctx.cancel.check(stats.total_blocks)?;
        let block = reader.read_next(len)?;
        if block.is_empty() {
            // file shrank since it was opened
            break;
        }
        let size = block.len() as u64;
        let d = digest(&block, req.algorithm);
        match index.lookup_counter(&ns, &d)? {
            0 => {
                index.insert_first_sighting(&ns, &d, &source_path, offset, size)?;
                stats.distinct += 1;
                ctx.metrics.record_dedup_miss();
            }
            seen => {
                index.increment_counter(&ns, &d, seen + 1)?;
                stats.repeats += 1;
                ctx.metrics.record_dedup_hit();
            }
        }
        trail.append_digest(&d)?;
        ctx.metrics.record_block(size);
        offset += size;
        stats.total_blocks += 1;

        if throttle.should_report(offset) {
            ctx.progress(Progress {
                kind: RunKind::Segmentation,
                blocks_done: stats.total_blocks,
                bytes_done: offset,
                bytes_total: total,
            });
        }
    }

    tracker.advance(RunPhase::Finalizing);
    let records = trail.finish()?;
    index.flush()?;
    debug!(records, bytes = offset, "trail closed");
    stats.bytes = offset;
    stats.elapsed = started.elapsed();
    ctx.progress(Progress {
        kind: RunKind::Segmentation,
        blocks_done: stats.total_blocks,
        bytes_done: offset,
        bytes_total: total,
    });
    tracker.advance(RunPhase::Done);
    Ok(stats)
}

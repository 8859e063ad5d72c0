//! Recovery: rebuild a file from a trail and the dedup index alone.
//!
//! Each trail record is resolved to its first sighting and the bytes are
//! copied from the recorded source. A record that cannot be resolved is
//! written as `block_size` zero bytes and counted, never raised.

use crate::error::{DedupError, Result};
use crate::events::{LogLevel, Progress, ProgressThrottle, RunContext, RunKind, RunPhase, RunTracker};
use crate::fingerprint::HashAlgorithm;
use crate::index::{BlockRecord, DedupIndex, Namespace};
use crate::metrics::percent;
use crate::reader::BlockReader;
use crate::trail::{create_output, TrailReader};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, instrument, warn};

/// Which trail to replay and where the rebuilt file goes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoverRequest {
    /// Trail produced by segmentation
    pub trail: PathBuf,
    /// File to create
    pub output: PathBuf,
    /// Block size the trail was written with
    pub block_size: u64,
    /// Algorithm the trail was written with
    pub algorithm: HashAlgorithm,
    /// Truncate an existing output instead of failing
    #[serde(default)]
    pub overwrite: bool,
}

/// Counters for one recovery run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryStats {
    /// Trail records read
    pub total_records: u64,
    /// Records rebuilt from source bytes
    pub recovered: u64,
    /// Records whose digest is not indexed
    pub missing_records: u64,
    /// Records whose recorded source could not be opened
    pub missing_sources: u64,
    /// Records whose source is now shorter than `offset + size`
    pub short_reads: u64,
    /// Bytes written to the output
    pub bytes_written: u64,
    /// Wall time
    pub elapsed: Duration,
}

impl RecoveryStats {
    /// Records written as zero-filled placeholders
    pub fn unrecoverable(&self) -> u64 {
        self.missing_records + self.missing_sources + self.short_reads
    }

    /// `recovered / total_records * 100`
    pub fn recovered_rate_percent(&self) -> f64 {
        percent(self.recovered, self.total_records)
    }
}

/// The last source opened during a run, or the last one that failed to open.
#[derive(Default)]
enum SourceCache {
    #[default]
    Empty,
    Open(BlockReader),
    Missing(PathBuf),
}

impl SourceCache {
    /// Reader for `path`, reopening only when the path changes.
    fn reader_for(&mut self, path: &Path) -> Option<&mut BlockReader> {
        let cached = match &*self {
            SourceCache::Open(reader) => reader.path() == path,
            SourceCache::Missing(missing) => missing == path,
            SourceCache::Empty => false,
        };
        if !cached {
            *self = match BlockReader::open(path) {
                Ok(reader) => SourceCache::Open(reader),
                Err(err) => {
                    warn!(error = %err, "recorded source unavailable");
                    SourceCache::Missing(path.to_path_buf())
                }
            };
        }
        match self {
            SourceCache::Open(reader) => Some(reader),
            _ => None,
        }
    }
}

enum Resolved {
    Bytes(Vec<u8>),
    MissingRecord,
    MissingSource,
    ShortRead,
}

fn resolve(cache: &mut SourceCache, record: Option<BlockRecord>) -> Result<Resolved> {
    let Some(record) = record else {
        return Ok(Resolved::MissingRecord);
    };
    let Some(reader) = cache.reader_for(&record.source_path) else {
        return Ok(Resolved::MissingSource);
    };
    let size = usize::try_from(record.size).map_err(|_| {
        DedupError::Store(format!(
            "record {} has an unaddressable size {}",
            record.digest, record.size
        ))
    })?;
    let bytes = reader.read_at(record.offset, size)?;
    if bytes.len() < size {
        debug!(
            digest = %record.digest,
            path = %record.source_path.display(),
            offset = record.offset,
            wanted = size,
            got = bytes.len(),
            "source shorter than recorded"
        );
        return Ok(Resolved::ShortRead);
    }
    Ok(Resolved::Bytes(bytes))
}

/// Rebuild `req.output` from `req.trail` using the namespace for
/// `(req.block_size, req.algorithm)`.
///
/// Fails with `NamespaceNotFound` before reading any record if the
/// namespace was never created. A truncated trailing record aborts the
/// rest of the run with `CorruptTrail`.
#[instrument(skip(index, ctx), fields(trail = %req.trail.display(), block_size = req.block_size, algorithm = %req.algorithm))]
pub fn run_recovery(index: &DedupIndex, req: &RecoverRequest, ctx: &RunContext) -> Result<RecoveryStats> {
    let mut tracker = RunTracker::new(RunKind::Recovery, &*ctx.sink);
    tracker.advance(RunPhase::ValidatingPreconditions);
    let outcome = recover(index, req, ctx, &mut tracker);
    match &outcome {
        Ok(stats) if stats.unrecoverable() > 0 => ctx.log(
            LogLevel::Warning,
            format!(
                "recovered {}/{} blocks into {} ({} not indexed, {} source missing, {} short)",
                stats.recovered,
                stats.total_records,
                req.output.display(),
                stats.missing_records,
                stats.missing_sources,
                stats.short_reads
            ),
        ),
        Ok(stats) => ctx.log(
            LogLevel::Success,
            format!(
                "recovered {}/{} blocks into {}",
                stats.recovered,
                stats.total_records,
                req.output.display()
            ),
        ),
        Err(err) => {
            tracker.fail(err);
            ctx.log(
                LogLevel::Error,
                format!("recovery from {} failed: {}", req.trail.display(), err),
            );
        }
    }
    ctx.metrics.record_run(outcome.is_ok());
    outcome
}

/// `block_size` zero bytes, streamed so no block-sized buffer is held.
fn write_placeholder(out: &mut impl Write, block_size: u64) -> io::Result<u64> {
    io::copy(&mut io::repeat(0).take(block_size), out)
}

fn recover(
    index: &DedupIndex,
    req: &RecoverRequest,
    ctx: &RunContext,
    tracker: &mut RunTracker<'_>,
) -> Result<RecoveryStats> {
    let started = Instant::now();
    let ns = Namespace::new(req.block_size, req.algorithm)?;
    index.ping()?;
    if !index.namespace_exists(&ns)? {
        return Err(DedupError::NamespaceNotFound(ns.name()));
    }

    let mut trail = TrailReader::open(&req.trail, req.algorithm)?;
    let mut out = BufWriter::new(create_output(&req.output, req.overwrite)?);
    let unwritable = |source: std::io::Error| DedupError::OutputUnwritable {
        path: req.output.clone(),
        source,
    };
    let expected_bytes = trail.expected_records().saturating_mul(req.block_size);
    let mut cache = SourceCache::Empty;
    tracker.advance(RunPhase::Running);

    let mut stats = RecoveryStats::default();
    let mut throttle = ProgressThrottle::new(ctx.progress_interval_bytes);
    while let Some(d) = trail.next_digest()? {
        ctx.cancel.check(stats.total_records)?;
        stats.total_records += 1;
        let record = index.fetch_record(&ns, &d)?;
        let written = match resolve(&mut cache, record)? {
            Resolved::Bytes(bytes) => {
                out.write_all(&bytes).map_err(unwritable)?;
                stats.recovered += 1;
                ctx.metrics.record_recovered();
                bytes.len() as u64
            }
            placeholder => {
                match placeholder {
                    Resolved::MissingRecord => stats.missing_records += 1,
                    Resolved::MissingSource => stats.missing_sources += 1,
                    _ => stats.short_reads += 1,
                }
                let written = write_placeholder(&mut out, req.block_size).map_err(unwritable)?;
                ctx.metrics.record_unrecoverable();
                written
            }
        };
        stats.bytes_written += written;

        if throttle.should_report(stats.bytes_written) {
            ctx.progress(Progress {
                kind: RunKind::Recovery,
                blocks_done: stats.total_records,
                bytes_done: stats.bytes_written,
                bytes_total: expected_bytes,
            });
        }
    }

    tracker.advance(RunPhase::Finalizing);
    out.flush().map_err(unwritable)?;
    let file: &File = out.get_ref();
    file.sync_all().map_err(unwritable)?;
    stats.elapsed = started.elapsed();
    ctx.progress(Progress {
        kind: RunKind::Recovery,
        blocks_done: stats.total_records,
        bytes_done: stats.bytes_written,
        bytes_total: expected_bytes,
    });
    tracker.advance(RunPhase::Done);
    Ok(stats)
}

//! Benchmark orchestration: segment then recover, once per block size.

use crate::error::{DedupError, Result};
use crate::events::{EngineEvent, LogLevel, RunContext};
use crate::fingerprint::HashAlgorithm;
use crate::index::{DedupIndex, Namespace};
use crate::metrics::RunResult;
use crate::recover::{run_recovery, RecoverRequest};
use crate::segment::{run_segmentation, SegmentRequest};
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{info, instrument, warn};

/// One source, one algorithm, several block sizes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BenchmarkPlan {
    /// File to segment
    pub source: PathBuf,
    /// Digest algorithm for every run
    pub algorithm: HashAlgorithm,
    /// Block sizes, run in the given order
    pub block_sizes: Vec<u64>,
    /// Where trails and recovered files are written
    pub work_dir: PathBuf,
    /// Leave trails and recovered files behind
    #[serde(default)]
    pub keep_artifacts: bool,
}

impl BenchmarkPlan {
    /// Reject an empty or zero block size list.
    pub fn validate(&self) -> Result<()> {
        if self.block_sizes.is_empty() {
            return Err(DedupError::InvalidBlockSize(0));
        }
        if let Some(&bad) = self.block_sizes.iter().find(|&&b| b == 0) {
            return Err(DedupError::InvalidBlockSize(bad));
        }
        Ok(())
    }

    /// Trail and recovered-file paths for one namespace.
    pub fn artifact_paths(&self, ns: &Namespace) -> (PathBuf, PathBuf) {
        let stem = self
            .source
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "source".to_string());
        let base = format!("{}_{}", stem, ns.name());
        (
            self.work_dir.join(format!("{}.hb", base)),
            self.work_dir.join(format!("{}.recovered", base)),
        )
    }
}

fn remove_artifact(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "could not remove artifact"),
    }
}

/// Run every block size in `plan` sequentially and return one row each.
///
/// The namespace for each block size is dropped before its run so repeat
/// rates and timings never include a previous run's records.
#[instrument(skip(index, ctx), fields(source = %plan.source.display(), algorithm = %plan.algorithm))]
pub fn run_benchmark(
    index: &mut DedupIndex,
    plan: &BenchmarkPlan,
    ctx: &RunContext,
) -> Result<Vec<RunResult>> {
    plan.validate()?;
    std::fs::create_dir_all(&plan.work_dir).map_err(|source| DedupError::OutputUnwritable {
        path: plan.work_dir.clone(),
        source,
    })?;

    let mut results = Vec::with_capacity(plan.block_sizes.len());
    for &block_size in &plan.block_sizes {
        ctx.cancel.check(0)?;
        let ns = Namespace::new(block_size, plan.algorithm)?;
        let (trail, output) = plan.artifact_paths(&ns);
        let removed = index.drop_namespace(&ns)?;
        if removed > 0 {
            ctx.log(
                LogLevel::Info,
                format!("reset `{}` ({} records from an earlier run)", ns, removed),
            );
        }

        let outcome = run_pair(index, plan, block_size, &trail, &output, ctx);
        if !plan.keep_artifacts {
            remove_artifact(&trail);
            remove_artifact(&output);
        }
        let mut result = outcome?;
        if plan.keep_artifacts {
            result = result.with_trail(&trail);
        }
        info!(
            block_size,
            repeat_rate = result.repeat_rate_percent,
            recovered_rate = result.recovered_rate_percent,
            "benchmark step finished"
        );
        ctx.sink.emit(EngineEvent::RunResult(result.clone()));
        results.push(result);
    }
    Ok(results)
}

fn run_pair(
    index: &mut DedupIndex,
    plan: &BenchmarkPlan,
    block_size: u64,
    trail: &Path,
    output: &Path,
    ctx: &RunContext,
) -> Result<RunResult> {
    let seg = run_segmentation(
        index,
        &SegmentRequest {
            source: plan.source.clone(),
            trail: trail.to_path_buf(),
            block_size,
            algorithm: plan.algorithm,
            overwrite: true,
        },
        ctx,
    )?;
    let rec = run_recovery(
        index,
        &RecoverRequest {
            trail: trail.to_path_buf(),
            output: output.to_path_buf(),
            block_size,
            algorithm: plan.algorithm,
            overwrite: true,
        },
        ctx,
    )?;
    Ok(RunResult::new(&plan.source, plan.algorithm, block_size)
        .with_segmentation(&seg)
        .with_recovery(&rec))
}

//! Engine configuration, loadable from TOML or JSON.

use crate::bench::BenchmarkPlan;
use crate::error::{DedupError, Result};
use crate::events::DEFAULT_PROGRESS_INTERVAL;
use crate::fingerprint::HashAlgorithm;
use crate::index::ConnectionParams;
use crate::store::PersistOptions;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Benchmark defaults, used when the host does not supply its own plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BenchmarkSettings {
    /// Digest algorithm
    pub algorithm: HashAlgorithm,
    /// Block sizes to sweep
    pub block_sizes: Vec<u64>,
    /// Scratch directory for trails and recovered files
    pub work_dir: PathBuf,
    /// Keep trails and recovered files after each run
    pub keep_artifacts: bool,
}

impl Default for BenchmarkSettings {
    fn default() -> Self {
        Self {
            algorithm: HashAlgorithm::Sha256,
            block_sizes: vec![512, 1024, 2048, 4096, 8192, 16384, 32768, 65536],
            work_dir: PathBuf::from("dedupbench-work"),
            keep_artifacts: false,
        }
    }
}

/// Engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Where the dedup index lives
    pub connection: ConnectionParams,
    /// Bytes between progress events
    pub progress_interval_bytes: u64,
    /// Request queue depth of the worker
    pub channel_capacity: usize,
    /// fsync every WAL append
    pub durable_writes: bool,
    /// Compact the WAL after this many appends, 0 never
    pub checkpoint_every: u64,
    /// Benchmark defaults
    pub benchmark: BenchmarkSettings,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let persist = PersistOptions::default();
        Self {
            connection: ConnectionParams::default(),
            progress_interval_bytes: DEFAULT_PROGRESS_INTERVAL,
            channel_capacity: 64,
            durable_writes: persist.durable_writes,
            checkpoint_every: persist.checkpoint_every,
            benchmark: BenchmarkSettings::default(),
        }
    }
}

impl EngineConfig {
    /// Load from a `.toml` or `.json` file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| DedupError::Config(format!("{}: {}", path.display(), e)))?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: EngineConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents)
                .map_err(|e| DedupError::Config(format!("{}: {}", path.display(), e)))?,
            "json" => serde_json::from_str(&contents)
                .map_err(|e| DedupError::Config(format!("{}: {}", path.display(), e)))?,
            _ => {
                return Err(DedupError::Config(format!(
                    "unsupported config file extension: {}",
                    ext
                )))
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.channel_capacity == 0 {
            return Err(DedupError::Config("channel_capacity must be at least 1".into()));
        }
        if self.benchmark.block_sizes.contains(&0) {
            return Err(DedupError::Config("benchmark.block_sizes must not contain 0".into()));
        }
        Ok(())
    }

    /// Connection parameters with the durability knobs applied.
    pub fn connection_params(&self) -> ConnectionParams {
        ConnectionParams {
            persist: PersistOptions {
                durable_writes: self.durable_writes,
                checkpoint_every: self.checkpoint_every,
            },
            ..self.connection.clone()
        }
    }

    /// Benchmark plan for `source` from the configured defaults.
    pub fn plan_for(&self, source: impl Into<PathBuf>) -> BenchmarkPlan {
        BenchmarkPlan {
            source: source.into(),
            algorithm: self.benchmark.algorithm,
            block_sizes: self.benchmark.block_sizes.clone(),
            work_dir: self.benchmark.work_dir.clone(),
            keep_artifacts: self.benchmark.keep_artifacts,
        }
    }
}

#![warn(missing_docs)]

//! dedupbench engine: fixed-size chunking, content-addressed dedup counting and
//! blind recovery from a hash-block trail.
//!
//! Segment path: Source → Block (fixed size) → Digest → Dedup index (count) → Trail
//! Recover path: Trail → Digest → Dedup index (first sighting) → Source bytes | zero block → Output

pub mod bench;
pub mod config;
pub mod error;
pub mod events;
pub mod fingerprint;
pub mod index;
pub mod metrics;
pub mod reader;
pub mod recover;
pub mod segment;
pub mod store;
pub mod trail;
pub mod worker;

pub use bench::{run_benchmark, BenchmarkPlan};
pub use config::{BenchmarkSettings, EngineConfig};
pub use error::{DedupError, Result};
pub use events::{
    CancelFlag, EngineEvent, EventSink, LogLevel, LogLine, NullSink, Progress, ProgressThrottle,
    RunContext, RunKind, RunPhase, RunTracker,
};
pub use fingerprint::{digest, Digest, HashAlgorithm};
pub use index::{BlockRecord, ConnectionParams, DedupIndex, Namespace, StoreDialect};
pub use metrics::{EngineMetric, EngineMetrics, MetricKind, MetricValue, RunResult};
pub use reader::BlockReader;
pub use recover::{run_recovery, RecoverRequest, RecoveryStats};
pub use segment::{run_segmentation, SegmentRequest, SegmentationStats};
pub use store::{KvStore, MemoryKvStore, PersistOptions, PersistentKvStore};
pub use trail::{TrailReader, TrailWriter};
pub use worker::{EngineHandle, EngineRequest, EngineWorker, WorkerStatus};

//! Error types for the dedupbench engine

use std::path::PathBuf;

/// All errors that can occur while segmenting, indexing or recovering
#[derive(Debug, thiserror::Error)]
pub enum DedupError {
    /// Index store unreachable, unknown dialect or database cannot be opened
    #[error("index unavailable: {0}")]
    IndexUnavailable(String),
    /// Source file cannot be opened for reading
    #[error("cannot open {}: {source}", path.display())]
    FileUnavailable {
        /// Offending path
        path: PathBuf,
        /// Underlying I/O failure
        #[source]
        source: std::io::Error,
    },
    /// Output file (trail or reconstruction) already exists
    #[error("output {} already exists", path.display())]
    OutputExists {
        /// Offending path
        path: PathBuf,
    },
    /// Output file cannot be created or written
    #[error("cannot write output {}: {source}", path.display())]
    OutputUnwritable {
        /// Offending path
        path: PathBuf,
        /// Underlying I/O failure
        #[source]
        source: std::io::Error,
    },
    /// Recovery requested against a namespace that was never created
    #[error("namespace `{0}` does not exist")]
    NamespaceNotFound(String),
    /// First-sighting insert on a digest that is already indexed
    #[error("digest {digest} already exists in namespace `{namespace}`")]
    Conflict {
        /// Namespace name
        namespace: String,
        /// Digest in hex
        digest: String,
    },
    /// Counter update on a digest that is not indexed
    #[error("digest {digest} not found in namespace `{namespace}`")]
    NotFound {
        /// Namespace name
        namespace: String,
        /// Digest in hex
        digest: String,
    },
    /// Trail file ends with a partial digest record
    #[error(
        "corrupt trail {}: {found} trailing bytes at offset {offset}, expected {expected}-byte records",
        path.display()
    )]
    CorruptTrail {
        /// Trail path
        path: PathBuf,
        /// Byte offset of the partial record
        offset: u64,
        /// Bytes actually present
        found: usize,
        /// Record length implied by the algorithm
        expected: usize,
    },
    /// Unknown hash algorithm tag
    #[error("unsupported hash algorithm `{0}`")]
    UnsupportedAlgorithm(String),
    /// Block size must be positive
    #[error("invalid block size {0}")]
    InvalidBlockSize(u64),
    /// Digest handed to the trail writer has the wrong length
    #[error("digest length {found} does not match record length {expected}")]
    DigestLength {
        /// Length of the offending digest
        found: usize,
        /// Record length of the trail
        expected: usize,
    },
    /// A read or write against the index store failed mid-run
    #[error("index store error: {0}")]
    Store(String),
    /// Configuration could not be loaded or is inconsistent
    #[error("configuration error: {0}")]
    Config(String),
    /// Run stopped by a cancellation request
    #[error("run cancelled after {blocks} blocks")]
    Cancelled {
        /// Blocks processed before the stop
        blocks: u64,
    },
    /// The engine worker is gone
    #[error("engine worker stopped")]
    WorkerStopped,
    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias used across the engine
pub type Result<T> = std::result::Result<T, DedupError>;

impl DedupError {
    /// Short machine-friendly label, used in logs and failed-run reasons
    pub fn kind(&self) -> &'static str {
        match self {
            DedupError::IndexUnavailable(_) => "index_unavailable",
            DedupError::FileUnavailable { .. } => "file_unavailable",
            DedupError::OutputExists { .. } => "output_exists",
            DedupError::OutputUnwritable { .. } => "output_unwritable",
            DedupError::NamespaceNotFound(_) => "namespace_not_found",
            DedupError::Conflict { .. } => "conflict",
            DedupError::NotFound { .. } => "not_found",
            DedupError::CorruptTrail { .. } => "corrupt_trail",
            DedupError::UnsupportedAlgorithm(_) => "unsupported_algorithm",
            DedupError::InvalidBlockSize(_) => "invalid_block_size",
            DedupError::DigestLength { .. } => "digest_length",
            DedupError::Store(_) => "store",
            DedupError::Config(_) => "config",
            DedupError::Cancelled { .. } => "cancelled",
            DedupError::WorkerStopped => "worker_stopped",
            DedupError::Io(_) => "io",
        }
    }
}

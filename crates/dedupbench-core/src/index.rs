//! Namespaced dedup index: digest -> first sighting + counter.
//!
//! Each (block size, algorithm) pair owns one namespace, laid out as a key
//! prefix on the underlying [`KvStore`]. A marker key records that the
//! namespace exists; record keys are `rec\0<namespace>\0<digest>`.
//!
//! Segmentation drives lookup -> insert-or-increment without store-level
//! atomicity, so one namespace must only ever have one writer. The engine
//! worker guarantees that by owning the only [`DedupIndex`] handle.

use crate::error::{DedupError, Result};
use crate::fingerprint::{Digest, HashAlgorithm};
use crate::store::{KvStore, MemoryKvStore, PersistOptions, PersistentKvStore};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, info, warn};

const MARKER_PREFIX: &[u8] = b"ns\0";
const RECORD_PREFIX: &[u8] = b"rec\0";

/// Which backend hosts the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreDialect {
    /// Process-local, discarded on disconnect
    Memory,
    /// WAL + checkpoint files under `data_dir/<database>`
    Wal,
}

impl fmt::Display for StoreDialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreDialect::Memory => f.write_str("memory"),
            StoreDialect::Wal => f.write_str("wal"),
        }
    }
}

impl FromStr for StoreDialect {
    type Err = DedupError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "memory" | "mem" => Ok(StoreDialect::Memory),
            "wal" | "file" => Ok(StoreDialect::Wal),
            other => Err(DedupError::IndexUnavailable(format!(
                "unknown store dialect `{}`",
                other
            ))),
        }
    }
}

/// Connection parameters for the index store.
///
/// Host, port and credentials are carried for the host application and for
/// diagnostics; the bundled backends only use `dialect`, `data_dir` and
/// `database`.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionParams {
    /// Store host
    pub host: String,
    /// Store port
    pub port: u16,
    /// Backend dialect
    pub dialect: StoreDialect,
    /// User name
    pub user: String,
    /// Password, never printed
    pub password: String,
    /// Database (catalog) name
    pub database: String,
    /// Root directory for file-backed databases
    pub data_dir: PathBuf,
    /// Durability knobs for the `wal` dialect
    #[serde(skip)]
    pub persist: PersistOptions,
}

impl Default for ConnectionParams {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            dialect: StoreDialect::Wal,
            user: String::new(),
            password: String::new(),
            database: "dedupbench".to_string(),
            data_dir: PathBuf::from("dedupbench-data"),
            persist: PersistOptions::default(),
        }
    }
}

impl ConnectionParams {
    /// In-memory connection, mostly for tests
    pub fn memory() -> Self {
        Self {
            dialect: StoreDialect::Memory,
            ..Self::default()
        }
    }

    /// File-backed connection rooted at `data_dir`
    pub fn wal(data_dir: impl Into<PathBuf>, database: impl Into<String>) -> Self {
        Self {
            dialect: StoreDialect::Wal,
            data_dir: data_dir.into(),
            database: database.into(),
            ..Self::default()
        }
    }

    /// Directory a `wal` database lives in
    pub fn database_dir(&self) -> PathBuf {
        self.data_dir.join(&self.database)
    }

    /// `dialect://user@host:port/database`, without the password
    pub fn describe(&self) -> String {
        let user = if self.user.is_empty() {
            String::new()
        } else {
            format!("{}@", self.user)
        };
        format!(
            "{}://{}{}:{}/{}",
            self.dialect, user, self.host, self.port, self.database
        )
    }
}

impl fmt::Debug for ConnectionParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionParams")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("dialect", &self.dialect)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("database", &self.database)
            .field("data_dir", &self.data_dir)
            .finish()
    }
}

/// One dedup namespace, scoped to a (block size, algorithm) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Namespace {
    block_size: u64,
    algorithm: HashAlgorithm,
}

impl Namespace {
    /// Fails with `InvalidBlockSize` for a zero block size.
    pub fn new(block_size: u64, algorithm: HashAlgorithm) -> Result<Self> {
        if block_size == 0 {
            return Err(DedupError::InvalidBlockSize(block_size));
        }
        Ok(Self {
            block_size,
            algorithm,
        })
    }

    /// Block size in bytes
    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    /// Hash algorithm
    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    /// Deterministic lower-case name, `tb_<block size>bytes_<algorithm>`
    pub fn name(&self) -> String {
        self.to_string()
    }

    fn marker_key(&self) -> Vec<u8> {
        let mut key = MARKER_PREFIX.to_vec();
        key.extend_from_slice(self.name().as_bytes());
        key
    }

    fn record_prefix(&self) -> Vec<u8> {
        let mut key = RECORD_PREFIX.to_vec();
        key.extend_from_slice(self.name().as_bytes());
        key.push(0);
        key
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tb_{}bytes_{}", self.block_size, self.algorithm.tag())
    }
}

fn record_key(prefix: &[u8], digest: &Digest) -> Vec<u8> {
    let mut key = Vec::with_capacity(prefix.len() + digest.len());
    key.extend_from_slice(prefix);
    key.extend_from_slice(digest.as_bytes());
    key
}

/// First sighting of a digest plus how many times it has been seen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockRecord {
    /// Block digest (the key)
    pub digest: Digest,
    /// File the first copy was read from
    pub source_path: PathBuf,
    /// Byte offset of the first copy
    pub offset: u64,
    /// Length of the block in bytes
    pub size: u64,
    /// Times this digest has been seen, at least 1
    pub counter: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredRecord {
    source_path: PathBuf,
    offset: u64,
    size: u64,
    counter: u64,
}

enum Backend {
    Memory(MemoryKvStore),
    Wal(PersistentKvStore),
}

impl Backend {
    fn kv(&self) -> &dyn KvStore {
        match self {
            Backend::Memory(store) => store,
            Backend::Wal(store) => store,
        }
    }
}

/// An open connection to the dedup index.
///
/// The handle is explicit: every operation goes through it and nothing is
/// registered process-wide, so independent engines never share state.
pub struct DedupIndex {
    backend: Backend,
    params: ConnectionParams,
    /// Namespaces known to exist, with their record key prefix
    known: HashMap<Namespace, Vec<u8>>,
}

fn with_context(err: DedupError, context: impl FnOnce() -> String) -> DedupError {
    match err {
        DedupError::Store(msg) => DedupError::Store(format!("{}: {}", context(), msg)),
        DedupError::Io(e) => DedupError::Store(format!("{}: {}", context(), e)),
        other => other,
    }
}

impl DedupIndex {
    /// Open the database named by `params`, creating it if absent.
    pub fn connect(params: &ConnectionParams) -> Result<Self> {
        let backend = match params.dialect {
            StoreDialect::Memory => Backend::Memory(MemoryKvStore::new()),
            StoreDialect::Wal => {
                if params.database.trim().is_empty() {
                    return Err(DedupError::IndexUnavailable(
                        "database name must not be empty".to_string(),
                    ));
                }
                let dir = params.database_dir();
                let store = PersistentKvStore::open(&dir, params.persist).map_err(|e| {
                    DedupError::IndexUnavailable(format!("{}: {}", params.describe(), e))
                })?;
                Backend::Wal(store)
            }
        };
        let mut index = Self {
            backend,
            params: params.clone(),
            known: HashMap::new(),
        };
        index.known = index
            .list_namespaces()?
            .into_iter()
            .map(|ns| (ns, ns.record_prefix()))
            .collect();
        info!(
            target = %params.describe(),
            namespaces = index.known.len(),
            "connected to dedup index"
        );
        Ok(index)
    }

    /// True if a `wal` database already exists on disk. Memory databases
    /// never outlive their connection.
    pub fn database_exists(params: &ConnectionParams) -> bool {
        match params.dialect {
            StoreDialect::Memory => false,
            StoreDialect::Wal => params.database_dir().is_dir(),
        }
    }

    /// Parameters this connection was opened with
    pub fn params(&self) -> &ConnectionParams {
        &self.params
    }

    /// Verify the store is still reachable.
    pub fn ping(&self) -> Result<()> {
        self.backend.kv().ping().map_err(|e| match e {
            DedupError::IndexUnavailable(msg) => DedupError::IndexUnavailable(msg),
            other => DedupError::IndexUnavailable(other.to_string()),
        })
    }

    /// Create the namespace if absent. Returns true if it was created.
    pub fn ensure_namespace(&mut self, ns: &Namespace) -> Result<bool> {
        if self.namespace_exists(ns)? {
            self.known.insert(*ns, ns.record_prefix());
            return Ok(false);
        }
        let marker = bincode::serialize(ns)
            .map_err(|e| DedupError::Store(format!("encoding namespace `{}`: {}", ns, e)))?;
        self.backend
            .kv()
            .put(ns.marker_key(), marker)
            .map_err(|e| with_context(e, || format!("creating namespace `{}`", ns)))?;
        self.known.insert(*ns, ns.record_prefix());
        info!(namespace = %ns, "created namespace");
        Ok(true)
    }

    /// Delete the namespace and all its records if present. Returns the
    /// number of records removed.
    pub fn drop_namespace(&mut self, ns: &Namespace) -> Result<u64> {
        let kv = self.backend.kv();
        let removed = kv
            .delete_prefix(&ns.record_prefix())
            .map_err(|e| with_context(e, || format!("dropping namespace `{}`", ns)))?;
        kv.delete(&ns.marker_key())
            .map_err(|e| with_context(e, || format!("dropping namespace `{}`", ns)))?;
        if self.known.remove(ns).is_some() || removed > 0 {
            info!(namespace = %ns, removed, "dropped namespace");
        }
        Ok(removed)
    }

    /// Whether the namespace exists
    pub fn namespace_exists(&self, ns: &Namespace) -> Result<bool> {
        self.backend
            .kv()
            .contains_key(&ns.marker_key())
            .map_err(|e| with_context(e, || format!("checking namespace `{}`", ns)))
    }

    /// Every namespace in this database
    pub fn list_namespaces(&self) -> Result<Vec<Namespace>> {
        let markers = self
            .backend
            .kv()
            .scan_prefix(MARKER_PREFIX)
            .map_err(|e| with_context(e, || "listing namespaces".to_string()))?;
        markers
            .into_iter()
            .map(|(key, value)| {
                bincode::deserialize::<Namespace>(&value).map_err(|e| {
                    DedupError::Store(format!(
                        "corrupt namespace marker `{}`: {}",
                        String::from_utf8_lossy(&key[MARKER_PREFIX.len()..]),
                        e
                    ))
                })
            })
            .collect()
    }

    /// Record key prefix of a namespace known to exist.
    fn require(&self, ns: &Namespace) -> Result<&[u8]> {
        self.known
            .get(ns)
            .map(Vec::as_slice)
            .ok_or_else(|| DedupError::NamespaceNotFound(ns.name()))
    }

    fn load(&self, ns: &Namespace, digest: &Digest) -> Result<Option<StoredRecord>> {
        let key = record_key(self.require(ns)?, digest);
        let raw = self
            .backend
            .kv()
            .get(&key)
            .map_err(|e| with_context(e, || format!("reading {} in `{}`", digest, ns)))?;
        raw.map(|bytes| {
            bincode::deserialize::<StoredRecord>(&bytes).map_err(|e| {
                DedupError::Store(format!("corrupt record {} in `{}`: {}", digest, ns, e))
            })
        })
        .transpose()
    }

    fn save(&self, ns: &Namespace, digest: &Digest, record: &StoredRecord) -> Result<()> {
        let bytes = bincode::serialize(record).map_err(|e| {
            DedupError::Store(format!("encoding record {} in `{}`: {}", digest, ns, e))
        })?;
        let key = record_key(self.require(ns)?, digest);
        self.backend
            .kv()
            .put(key, bytes)
            .map_err(|e| with_context(e, || format!("writing {} in `{}`", digest, ns)))
    }

    /// Times `digest` has been seen; 0 means never.
    pub fn lookup_counter(&self, ns: &Namespace, digest: &Digest) -> Result<u64> {
        Ok(self.load(ns, digest)?.map_or(0, |r| r.counter))
    }

    /// Record the first sighting of `digest` with counter 1. Fails with
    /// `Conflict` if the digest is already indexed.
    pub fn insert_first_sighting(
        &mut self,
        ns: &Namespace,
        digest: &Digest,
        source_path: &Path,
        offset: u64,
        size: u64,
    ) -> Result<()> {
        if self.load(ns, digest)?.is_some() {
            warn!(namespace = %ns, %digest, "first-sighting insert on an indexed digest");
            return Err(DedupError::Conflict {
                namespace: ns.name(),
                digest: digest.to_hex(),
            });
        }
        self.save(
            ns,
            digest,
            &StoredRecord {
                source_path: source_path.to_path_buf(),
                offset,
                size,
                counter: 1,
            },
        )
    }

    /// Overwrite the counter of an indexed digest. The counter never
    /// decreases; location fields are left untouched.
    pub fn increment_counter(&mut self, ns: &Namespace, digest: &Digest, new_count: u64) -> Result<()> {
        let mut record = self.load(ns, digest)?.ok_or_else(|| DedupError::NotFound {
            namespace: ns.name(),
            digest: digest.to_hex(),
        })?;
        if new_count < record.counter {
            return Err(DedupError::Store(format!(
                "counter of {} in `{}` would drop from {} to {}",
                digest, ns, record.counter, new_count
            )));
        }
        record.counter = new_count;
        self.save(ns, digest, &record)
    }

    /// Resolve a digest to its first sighting.
    pub fn fetch_record(&self, ns: &Namespace, digest: &Digest) -> Result<Option<BlockRecord>> {
        Ok(self.load(ns, digest)?.map(|r| BlockRecord {
            digest: *digest,
            source_path: r.source_path,
            offset: r.offset,
            size: r.size,
            counter: r.counter,
        }))
    }

    /// Number of distinct digests in the namespace
    pub fn row_count(&self, ns: &Namespace) -> Result<u64> {
        let prefix = self.require(ns)?;
        self.backend
            .kv()
            .count_prefix(prefix)
            .map_err(|e| with_context(e, || format!("counting rows of `{}`", ns)))
    }

    /// Make every record written so far durable.
    pub fn flush(&self) -> Result<()> {
        self.backend
            .kv()
            .flush()
            .map_err(|e| with_context(e, || format!("flushing {}", self.params.describe())))
    }

    /// Flush and release the connection.
    pub fn close(self) -> Result<()> {
        match &self.backend {
            Backend::Memory(_) => {}
            Backend::Wal(store) => store.checkpoint()?,
        }
        debug!(target = %self.params.describe(), "disconnected from dedup index");
        Ok(())
    }

    /// Close the connection and delete the whole database.
    pub fn drop_database(self) -> Result<()> {
        let Self { backend, params, .. } = self;
        match backend {
            Backend::Memory(store) => drop(store),
            Backend::Wal(store) => {
                let dir = store.dir().to_path_buf();
                drop(store);
                std::fs::remove_dir_all(&dir).map_err(|e| {
                    DedupError::Store(format!("dropping database {}: {}", dir.display(), e))
                })?;
            }
        }
        info!(target = %params.describe(), "dropped database");
        Ok(())
    }
}

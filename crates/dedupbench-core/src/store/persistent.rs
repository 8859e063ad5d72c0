//! Persistent file-backed KV store with WAL and checkpoint support.
//!
//! Uses an in-memory BTreeMap as read cache, a write-ahead log (WAL) for durability,
//! and checkpoint files for fast reopen.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::kvstore::{lock_err, prefix_range, BatchOp, Key, KvPair, KvStore, Value};
use crate::error::{DedupError, Result};

const WAL_FILENAME: &str = "wal.bin";
const CHECKPOINT_FILENAME: &str = "checkpoint.bin";

#[derive(Debug, Serialize, Deserialize, Clone)]
enum WalOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

#[derive(Debug, Serialize, Deserialize)]
struct WalEntry {
    seq: u64,
    op: WalOp,
}

#[derive(Debug, Serialize, Deserialize)]
struct Checkpoint {
    seq: u64,
    entries: Vec<(Vec<u8>, Vec<u8>)>,
}

/// Durability knobs for [`PersistentKvStore`].
#[derive(Debug, Clone, Copy)]
pub struct PersistOptions {
    /// fsync the WAL after every append
    pub durable_writes: bool,
    /// Checkpoint and truncate the WAL after this many appends (0 = never)
    pub checkpoint_every: u64,
}

impl Default for PersistOptions {
    fn default() -> Self {
        Self {
            durable_writes: false,
            checkpoint_every: 1 << 20,
        }
    }
}

/// Persistent file-backed KV store.
///
/// On open, loads the last checkpoint and replays any remaining WAL entries.
pub struct PersistentKvStore {
    data: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
    wal: Mutex<WalWriter>,
    dir: PathBuf,
    seq: RwLock<u64>,
    options: PersistOptions,
}

struct WalWriter {
    out: BufWriter<File>,
    appended: u64,
}

impl WalWriter {
    fn new(path: &Path) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(WalWriter {
            out: BufWriter::new(file),
            appended: 0,
        })
    }

    fn append(&mut self, entry: &WalEntry, durable: bool) -> std::io::Result<()> {
        let encoded = bincode::serialize(entry)
            .map_err(|e| std::io::Error::new(ErrorKind::InvalidData, e))?;
        let len_bytes = (encoded.len() as u32).to_le_bytes();
        self.out.write_all(&len_bytes)?;
        self.out.write_all(&encoded)?;
        if durable {
            self.sync()?;
        }
        self.appended += 1;
        Ok(())
    }

    fn sync(&mut self) -> std::io::Result<()> {
        self.out.flush()?;
        self.out.get_ref().sync_all()
    }

    fn truncate(&mut self) -> std::io::Result<()> {
        self.out.flush()?;
        self.out.get_ref().set_len(0)?;
        self.out.get_ref().sync_all()?;
        self.appended = 0;
        Ok(())
    }
}

impl PersistentKvStore {
    /// Opens or creates a persistent KV store in the given directory.
    pub fn open(dir: &Path, options: PersistOptions) -> Result<Self> {
        fs::create_dir_all(dir)?;

        let wal_path = dir.join(WAL_FILENAME);
        let checkpoint_path = dir.join(CHECKPOINT_FILENAME);

        let mut data = BTreeMap::new();
        let mut seq = load_checkpoint(&checkpoint_path, &mut data)?;
        seq = replay_wal(&wal_path, &mut data, seq)?;
        debug!(dir = %dir.display(), keys = data.len(), seq, "opened persistent store");

        let wal = WalWriter::new(&wal_path)?;
        Ok(Self {
            data: RwLock::new(data),
            wal: Mutex::new(wal),
            dir: dir.to_path_buf(),
            seq: RwLock::new(seq),
            options,
        })
    }

    /// Directory holding the WAL and checkpoint
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Creates a checkpoint of the current state and truncates the WAL.
    pub fn checkpoint(&self) -> Result<()> {
        let data = self.data.read().map_err(lock_err)?;
        let seq = *self.seq.read().map_err(lock_err)?;

        let checkpoint = Checkpoint {
            seq,
            entries: data.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        };
        let encoded = bincode::serialize(&checkpoint)
            .map_err(|e| DedupError::Store(format!("failed to serialize checkpoint: {}", e)))?;

        let checkpoint_path = self.dir.join(CHECKPOINT_FILENAME);
        let mut tmp_path = checkpoint_path.clone();
        tmp_path.set_extension("tmp");
        {
            let mut tmp_file = File::create(&tmp_path)?;
            tmp_file.write_all(&encoded)?;
            tmp_file.sync_all()?;
        }
        fs::rename(&tmp_path, &checkpoint_path)?;

        let mut wal = self.wal.lock().map_err(lock_err)?;
        wal.truncate()?;
        debug!(dir = %self.dir.display(), keys = data.len(), seq, "checkpoint written");
        Ok(())
    }

    fn next_seq(&self) -> Result<u64> {
        let mut seq = self.seq.write().map_err(lock_err)?;
        *seq += 1;
        Ok(*seq)
    }

    /// Append to the WAL. Returns true when a checkpoint is due; the caller
    /// must apply the op to the cache before checkpointing.
    fn write_wal(&self, op: WalOp) -> Result<bool> {
        let seq = self.next_seq()?;
        let entry = WalEntry { seq, op };
        let mut wal = self.wal.lock().map_err(lock_err)?;
        wal.append(&entry, self.options.durable_writes)?;
        Ok(self.options.checkpoint_every > 0 && wal.appended >= self.options.checkpoint_every)
    }
}

fn load_checkpoint(path: &Path, data: &mut BTreeMap<Vec<u8>, Vec<u8>>) -> Result<u64> {
    if !path.exists() {
        return Ok(0);
    }
    let mut contents = Vec::new();
    File::open(path)?.read_to_end(&mut contents)?;
    if contents.is_empty() {
        return Ok(0);
    }
    let checkpoint: Checkpoint = bincode::deserialize(&contents)
        .map_err(|e| DedupError::Store(format!("failed to deserialize checkpoint: {}", e)))?;
    data.extend(checkpoint.entries);
    Ok(checkpoint.seq)
}

fn replay_wal(path: &Path, data: &mut BTreeMap<Vec<u8>, Vec<u8>>, seq: u64) -> Result<u64> {
    if !path.exists() {
        return Ok(seq);
    }
    let mut file = File::open(path)?;
    let file_len = file.metadata()?.len();
    let mut valid_len = 0u64;
    let mut max_seq = seq;
    loop {
        let mut len_buf = [0u8; 4];
        match file.read_exact(&mut len_buf) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }
        let len = u32::from_le_bytes(len_buf) as usize;
        let mut op_buf = vec![0u8; len];
        if let Err(e) = file.read_exact(&mut op_buf) {
            if e.kind() == ErrorKind::UnexpectedEof {
                // torn tail from an unsynced append
                warn!(path = %path.display(), "discarding truncated WAL entry");
                break;
            }
            return Err(e.into());
        }
        let entry: WalEntry = bincode::deserialize(&op_buf)
            .map_err(|e| DedupError::Store(format!("failed to deserialize WAL entry: {}", e)))?;
        valid_len += 4 + len as u64;
        if entry.seq <= seq {
            continue;
        }
        max_seq = max_seq.max(entry.seq);
        match entry.op {
            WalOp::Put { key, value } => {
                data.insert(key, value);
            }
            WalOp::Delete { key } => {
                data.remove(&key);
            }
        }
    }
    if valid_len < file_len {
        // appends must not land behind garbage
        OpenOptions::new().write(true).open(path)?.set_len(valid_len)?;
    }
    Ok(max_seq)
}

impl KvStore for PersistentKvStore {
    fn get(&self, key: &[u8]) -> Result<Option<Value>> {
        let data = self.data.read().map_err(lock_err)?;
        Ok(data.get(key).cloned())
    }

    fn put(&self, key: Key, value: Value) -> Result<()> {
        let due = self.write_wal(WalOp::Put {
            key: key.clone(),
            value: value.clone(),
        })?;
        self.data.write().map_err(lock_err)?.insert(key, value);
        if due {
            self.checkpoint()?;
        }
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        let due = self.write_wal(WalOp::Delete { key: key.to_vec() })?;
        self.data.write().map_err(lock_err)?.remove(key);
        if due {
            self.checkpoint()?;
        }
        Ok(())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<KvPair>> {
        let data = self.data.read().map_err(lock_err)?;
        let pairs = prefix_range(&data, prefix)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Ok(pairs)
    }

    fn contains_key(&self, key: &[u8]) -> Result<bool> {
        let data = self.data.read().map_err(lock_err)?;
        Ok(data.contains_key(key))
    }

    fn write_batch(&self, ops: Vec<BatchOp>) -> Result<()> {
        let mut due = false;
        for op in &ops {
            due |= match op {
                BatchOp::Put { key, value } => self.write_wal(WalOp::Put {
                    key: key.clone(),
                    value: value.clone(),
                })?,
                BatchOp::Delete { key } => self.write_wal(WalOp::Delete { key: key.clone() })?,
            };
        }
        {
            let mut data = self.data.write().map_err(lock_err)?;
            for op in ops {
                match op {
                    BatchOp::Put { key, value } => {
                        data.insert(key, value);
                    }
                    BatchOp::Delete { key } => {
                        data.remove(&key);
                    }
                }
            }
        }
        if due {
            self.checkpoint()?;
        }
        Ok(())
    }

    fn count_prefix(&self, prefix: &[u8]) -> Result<u64> {
        let data = self.data.read().map_err(lock_err)?;
        let n = prefix_range(&data, prefix).count();
        Ok(n as u64)
    }

    fn ping(&self) -> Result<()> {
        match fs::metadata(&self.dir) {
            Ok(meta) if meta.is_dir() => Ok(()),
            Ok(_) => Err(DedupError::IndexUnavailable(format!(
                "{} is not a directory",
                self.dir.display()
            ))),
            Err(e) => Err(DedupError::IndexUnavailable(format!(
                "{}: {}",
                self.dir.display(),
                e
            ))),
        }
    }

    fn flush(&self) -> Result<()> {
        let mut wal = self.wal.lock().map_err(lock_err)?;
        wal.sync()?;
        Ok(())
    }
}

//! Keyed stores that host the dedup index

pub mod kvstore;
pub mod persistent;

pub use kvstore::{BatchOp, KvPair, KvStore, MemoryKvStore};
pub use persistent::{PersistOptions, PersistentKvStore};

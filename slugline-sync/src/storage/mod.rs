//! Durable storage tiers for the offline update queue.
//!
//! Three tiers with a fixed fallback order, chosen once at queue open:
//!
//! ```text
//! ┌────────────────────┐  open fails  ┌────────────────────┐  open fails
//! │ rocks (per-entry   │ ───────────► │ blob (single JSON  │ ───────────►
//! │ keys, LZ4, primary)│              │ file, legacy tier) │
//! └────────────────────┘              └────────────────────┘
//!                                       ┌────────────────────┐
//!                                       │ memory (BTreeMap,  │
//!                                       │ lost on restart)   │
//!                                       └────────────────────┘
//! ```
//!
//! All tiers speak [`QueueStore`]: an id-ordered map of queue entries. FIFO
//! semantics fall out of id ordering — `pop_min` removes the oldest entry,
//! and a drained entry that fails transiently goes back to the front simply
//! by re-`put`ting it under its original (smallest) id.

pub mod blob;
pub mod memory;
pub mod rocks;

pub use blob::BlobQueueStore;
pub use memory::MemoryQueueStore;
pub use rocks::{RocksQueueConfig, RocksQueueStore};

use crate::update::QueueEntry;

/// On-disk layout version for queued entries. Bump when the entry encoding
/// changes; openers skip entries they cannot decode.
pub const QUEUE_SCHEMA_VERSION: u32 = 1;

/// Errors raised by a storage tier.
#[derive(Debug, Clone)]
pub enum QueueStoreError {
    /// Underlying database error (rocks tier).
    Database(String),
    /// Entry could not be encoded or decoded.
    Serialization(String),
    /// Filesystem error (blob tier).
    Io(String),
}

impl std::fmt::Display for QueueStoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueueStoreError::Database(e) => write!(f, "Database error: {e}"),
            QueueStoreError::Serialization(e) => write!(f, "Serialization error: {e}"),
            QueueStoreError::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for QueueStoreError {}

impl From<std::io::Error> for QueueStoreError {
    fn from(e: std::io::Error) -> Self {
        QueueStoreError::Io(e.to_string())
    }
}

/// One storage tier: an id-ordered durable map of [`QueueEntry`] values.
///
/// Implementations must keep entries sorted by id so that `pop_min` and
/// `peek_min` observe FIFO order.
pub trait QueueStore: Send {
    /// Insert or overwrite the entry under its id.
    fn put(&mut self, entry: &QueueEntry) -> Result<(), QueueStoreError>;

    /// Remove and return the entry with the smallest id.
    fn pop_min(&mut self) -> Result<Option<QueueEntry>, QueueStoreError>;

    /// Return the entry with the smallest id without removing it.
    fn peek_min(&self) -> Result<Option<QueueEntry>, QueueStoreError>;

    fn len(&self) -> Result<usize, QueueStoreError>;

    fn is_empty(&self) -> Result<bool, QueueStoreError> {
        Ok(self.len()? == 0)
    }

    /// Remove all entries.
    fn clear(&mut self) -> Result<(), QueueStoreError>;

    /// Highest id currently stored, used to resume the id counter on reopen.
    fn max_id(&self) -> Result<Option<u64>, QueueStoreError>;

    /// All entries in id order. Used for migration between tiers.
    fn entries(&self) -> Result<Vec<QueueEntry>, QueueStoreError>;

    /// Flush buffered writes to durable media (no-op for memory).
    fn flush(&mut self) -> Result<(), QueueStoreError>;
}

//! Durable FIFO queue for updates that could not be persisted.
//!
//! The queue is the offline half of the provider: when the backend is down
//! or the persist breaker is open, outgoing updates land here and are
//! drained in order once connectivity returns.
//!
//! Opening never fails. The facade walks the tier fallback chain (rocks →
//! blob → memory) until one opens, logging each downgrade. When the rocks
//! tier is available and a legacy blob file exists, its entries are migrated
//! into RocksDB and the blob file is deleted.
//!
//! Capacity is bounded (default 100 entries) with reject-new semantics: the
//! oldest queued work is the most valuable, so a full queue refuses new
//! entries rather than evicting old ones.

use std::path::PathBuf;

use crate::storage::{
    BlobQueueStore, MemoryQueueStore, QueueStore, QueueStoreError, RocksQueueConfig,
    RocksQueueStore, QUEUE_SCHEMA_VERSION,
};
use crate::update::{QueueEntry, UpdatePayload};

/// Which storage tier the queue ended up on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    Rocks,
    Blob,
    Memory,
}

impl StorageBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageBackend::Rocks => "rocks",
            StorageBackend::Blob => "blob",
            StorageBackend::Memory => "memory",
        }
    }
}

impl std::fmt::Display for StorageBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Queue configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Maximum queued entries; enqueue rejects beyond this.
    pub capacity: usize,
    /// RocksDB directory for the primary tier. None skips the tier.
    pub rocks_path: Option<PathBuf>,
    /// JSON blob path for the secondary tier. None skips the tier.
    pub blob_path: Option<PathBuf>,
}

impl QueueConfig {
    /// Durable queue rooted at `dir`: rocks database plus legacy blob path.
    pub fn durable(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self {
            capacity: 100,
            rocks_path: Some(dir.join("queue_db")),
            blob_path: Some(dir.join("queue.json")),
        }
    }

    /// Memory-only queue, for tests that don't exercise durability.
    pub fn in_memory() -> Self {
        Self {
            capacity: 100,
            rocks_path: None,
            blob_path: None,
        }
    }
}

/// Durable FIFO queue over whichever storage tier opened.
pub struct DurableQueue {
    store: Box<dyn QueueStore>,
    backend: StorageBackend,
    capacity: usize,
    /// Next id handed to an enqueued entry; resumed from the store on open.
    next_id: u64,
}

impl DurableQueue {
    /// Open the queue, falling back through the tiers. Never fails: the
    /// memory tier always opens.
    pub fn open(config: QueueConfig) -> Self {
        let (store, backend) = Self::open_store(&config);
        let next_id = match store.max_id() {
            Ok(Some(max)) => max + 1,
            Ok(None) => 1,
            Err(e) => {
                log::warn!("could not recover queue id counter: {e}");
                1
            }
        };
        if let Ok(len) = store.len() {
            if len > 0 {
                log::info!("queue opened on {backend} tier with {len} pending entries");
            }
        }
        Self {
            store,
            backend,
            capacity: config.capacity,
            next_id,
        }
    }

    fn open_store(config: &QueueConfig) -> (Box<dyn QueueStore>, StorageBackend) {
        if let Some(rocks_path) = &config.rocks_path {
            match RocksQueueStore::open(RocksQueueConfig::new(rocks_path)) {
                Ok(mut store) => {
                    if let Some(blob_path) = &config.blob_path {
                        Self::migrate_blob(&mut store, blob_path);
                    }
                    return (Box::new(store), StorageBackend::Rocks);
                }
                Err(e) => {
                    log::warn!(
                        "rocks queue tier failed to open at {}: {e}; falling back to blob",
                        rocks_path.display()
                    );
                }
            }
        }

        if let Some(blob_path) = &config.blob_path {
            match BlobQueueStore::open(blob_path) {
                Ok(store) => return (Box::new(store), StorageBackend::Blob),
                Err(e) => {
                    log::warn!(
                        "blob queue tier failed to open at {}: {e}; falling back to memory",
                        blob_path.display()
                    );
                }
            }
        }

        if config.rocks_path.is_some() || config.blob_path.is_some() {
            log::warn!("queue running on memory tier; entries will not survive a restart");
        }
        (Box::new(MemoryQueueStore::new()), StorageBackend::Memory)
    }

    /// Move legacy blob entries into the rocks store, then delete the blob.
    /// Corrupt blob entries were already skipped by the blob opener.
    fn migrate_blob(rocks: &mut RocksQueueStore, blob_path: &std::path::Path) {
        if !blob_path.exists() {
            return;
        }
        let blob = match BlobQueueStore::open(blob_path) {
            Ok(blob) => blob,
            Err(e) => {
                log::warn!("unreadable legacy queue blob {}: {e}", blob_path.display());
                return;
            }
        };
        let entries = match blob.entries() {
            Ok(entries) => entries,
            Err(e) => {
                log::warn!("could not list legacy queue blob entries: {e}");
                return;
            }
        };

        let mut migrated = 0usize;
        for entry in &entries {
            match rocks.put(entry) {
                Ok(()) => migrated += 1,
                Err(e) => {
                    log::warn!("failed to migrate queue entry {}: {e}", entry.id);
                    // Keep the blob so nothing is lost
                    return;
                }
            }
        }
        if migrated > 0 {
            log::info!("migrated {migrated} queued entries from blob to rocks");
        }
        if let Err(e) = BlobQueueStore::remove_file(blob_path) {
            log::warn!("could not remove migrated queue blob: {e}");
        }
    }

    /// Append a payload. Returns false when the queue is at capacity —
    /// the oldest entries are kept, the new one is rejected.
    pub fn enqueue(&mut self, payload: UpdatePayload) -> Result<bool, QueueStoreError> {
        if self.store.len()? >= self.capacity {
            log::warn!(
                "update queue full ({} entries); rejecting new update",
                self.capacity
            );
            return Ok(false);
        }
        let entry = QueueEntry::new(self.next_id, payload);
        self.store.put(&entry)?;
        self.next_id += 1;
        Ok(true)
    }

    /// Remove and return the oldest entry.
    pub fn dequeue(&mut self) -> Result<Option<QueueEntry>, QueueStoreError> {
        self.store.pop_min()
    }

    /// Return the oldest entry without removing it.
    pub fn peek(&self) -> Result<Option<QueueEntry>, QueueStoreError> {
        self.store.peek_min()
    }

    /// Put a dequeued entry back at the front of the queue. The entry keeps
    /// its original id, which is smaller than anything enqueued since.
    pub fn requeue_front(&mut self, entry: QueueEntry) -> Result<(), QueueStoreError> {
        self.store.put(&entry)
    }

    pub fn len(&self) -> usize {
        self.store.len().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) -> Result<(), QueueStoreError> {
        self.store.clear()
    }

    /// Which tier the queue is running on.
    pub fn storage_backend(&self) -> StorageBackend {
        self.backend
    }

    pub fn schema_version(&self) -> u32 {
        QUEUE_SCHEMA_VERSION
    }

    /// Flush buffered writes to durable media.
    pub fn flush(&mut self) -> Result<(), QueueStoreError> {
        self.store.flush()
    }

    /// Flush and release the store.
    pub fn close(mut self) {
        if let Err(e) = self.store.flush() {
            log::warn!("queue flush on close failed: {e}");
        }
    }
}

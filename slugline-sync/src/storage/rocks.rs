//! RocksDB queue tier — the primary durable store.
//!
//! Column families:
//! - `entries` — queued updates, keyed by id (8 bytes big-endian), value
//!   bincode-encoded entry, LZ4 compressed
//! - `meta`    — schema version and other small bookkeeping values
//!
//! Big-endian id keys make RocksDB's byte-lexicographic key order equal to
//! numeric id order, so FIFO iteration is a plain forward scan.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteOptions,
};
use std::path::{Path, PathBuf};

use super::{QueueStore, QueueStoreError, QUEUE_SCHEMA_VERSION};
use crate::update::QueueEntry;

const CF_ENTRIES: &str = "entries";
const CF_META: &str = "meta";
const COLUMN_FAMILIES: &[&str] = &[CF_ENTRIES, CF_META];

const META_SCHEMA_KEY: &[u8] = b"schema_version";

/// RocksDB tier configuration.
#[derive(Debug, Clone)]
pub struct RocksQueueConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 8MB — the queue is small)
    pub block_cache_size: usize,
    /// Enable fsync on every write (default: true — this is durability storage)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 64)
    pub max_open_files: i32,
}

impl RocksQueueConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            sync_writes: true,
            max_open_files: 64,
        }
    }

    /// Config for testing (no fsync, tiny cache).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 1024 * 1024,
            sync_writes: false,
            max_open_files: 32,
        }
    }
}

/// RocksDB-backed queue store with per-entry keys.
pub struct RocksQueueStore {
    /// Single-threaded mode — concurrency is handled by the queue facade
    db: DBWithThreadMode<SingleThreaded>,
    config: RocksQueueConfig,
}

impl RocksQueueStore {
    /// Open the store, creating the database and column families if needed.
    ///
    /// Records the schema version in the meta CF on first open; refuses to
    /// open a database written by a newer layout.
    pub fn open(config: RocksQueueConfig) -> Result<Self, QueueStoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(2);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(&config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )
        .map_err(|e| QueueStoreError::Database(e.to_string()))?;

        let store = Self { db, config };
        store.check_schema()?;
        Ok(store)
    }

    fn cf_options(config: &RocksQueueConfig) -> Options {
        let mut opts = Options::default();
        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        opts.set_block_based_table_factory(&block_opts);
        // Values are LZ4'd by hand before insert; skip double compression
        opts.set_compression_type(DBCompressionType::None);
        opts
    }

    fn check_schema(&self) -> Result<(), QueueStoreError> {
        let cf = self.cf(CF_META)?;
        match self
            .db
            .get_cf(&cf, META_SCHEMA_KEY)
            .map_err(|e| QueueStoreError::Database(e.to_string()))?
        {
            Some(bytes) if bytes.len() == 4 => {
                let stored = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
                if stored > QUEUE_SCHEMA_VERSION {
                    return Err(QueueStoreError::Database(format!(
                        "Queue schema version {stored} is newer than supported {QUEUE_SCHEMA_VERSION}"
                    )));
                }
                Ok(())
            }
            _ => {
                self.db
                    .put_cf(&cf, META_SCHEMA_KEY, QUEUE_SCHEMA_VERSION.to_be_bytes())
                    .map_err(|e| QueueStoreError::Database(e.to_string()))?;
                Ok(())
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, QueueStoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| QueueStoreError::Database(format!("Column family '{name}' not found")))
    }

    fn write_opts(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.config.sync_writes);
        opts
    }

    fn encode_value(entry: &QueueEntry) -> Result<Vec<u8>, QueueStoreError> {
        let raw = entry.encode().map_err(QueueStoreError::Serialization)?;
        Ok(lz4_flex::compress_prepend_size(&raw))
    }

    fn decode_value(bytes: &[u8]) -> Result<QueueEntry, QueueStoreError> {
        let raw = lz4_flex::decompress_size_prepended(bytes)
            .map_err(|e| QueueStoreError::Serialization(e.to_string()))?;
        QueueEntry::decode(&raw).map_err(QueueStoreError::Serialization)
    }

    /// First decodable (smallest-id) entry in the entries CF.
    ///
    /// A corrupt value at the head is deleted and skipped, never returned:
    /// leaving it in place would fail every subsequent dequeue and strand
    /// all valid entries behind it.
    fn first_entry(&self) -> Result<Option<(Vec<u8>, QueueEntry)>, QueueStoreError> {
        loop {
            let head = {
                let cf = self.cf(CF_ENTRIES)?;
                let mut iter = self.db.iterator_cf(&cf, IteratorMode::Start);
                match iter.next() {
                    Some(Ok((key, value))) => Some((key.to_vec(), value.to_vec())),
                    Some(Err(e)) => return Err(QueueStoreError::Database(e.to_string())),
                    None => None,
                }
            };
            let (key, value) = match head {
                Some(found) => found,
                None => return Ok(None),
            };
            match Self::decode_value(&value) {
                Ok(entry) => return Ok(Some((key, entry))),
                Err(e) => {
                    log::warn!(
                        "dropping corrupt queue entry at head of {}: {e}",
                        self.path().display()
                    );
                    let cf = self.cf(CF_ENTRIES)?;
                    self.db
                        .delete_cf_opt(&cf, &key, &self.write_opts())
                        .map_err(|e| QueueStoreError::Database(e.to_string()))?;
                }
            }
        }
    }
}

impl QueueStore for RocksQueueStore {
    fn put(&mut self, entry: &QueueEntry) -> Result<(), QueueStoreError> {
        let cf = self.cf(CF_ENTRIES)?;
        let value = Self::encode_value(entry)?;
        self.db
            .put_cf_opt(&cf, entry.id.to_be_bytes(), value, &self.write_opts())
            .map_err(|e| QueueStoreError::Database(e.to_string()))
    }

    fn pop_min(&mut self) -> Result<Option<QueueEntry>, QueueStoreError> {
        let (key, entry) = match self.first_entry()? {
            Some(found) => found,
            None => return Ok(None),
        };
        let cf = self.cf(CF_ENTRIES)?;
        self.db
            .delete_cf_opt(&cf, &key, &self.write_opts())
            .map_err(|e| QueueStoreError::Database(e.to_string()))?;
        Ok(Some(entry))
    }

    fn peek_min(&self) -> Result<Option<QueueEntry>, QueueStoreError> {
        Ok(self.first_entry()?.map(|(_, entry)| entry))
    }

    fn len(&self) -> Result<usize, QueueStoreError> {
        let cf = self.cf(CF_ENTRIES)?;
        let mut count = 0usize;
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            item.map_err(|e| QueueStoreError::Database(e.to_string()))?;
            count += 1;
        }
        Ok(count)
    }

    fn clear(&mut self) -> Result<(), QueueStoreError> {
        let cf = self.cf(CF_ENTRIES)?;
        let keys: Vec<Vec<u8>> = self
            .db
            .iterator_cf(&cf, IteratorMode::Start)
            .map(|item| {
                item.map(|(key, _)| key.to_vec())
                    .map_err(|e| QueueStoreError::Database(e.to_string()))
            })
            .collect::<Result<_, _>>()?;
        for key in keys {
            self.db
                .delete_cf_opt(&cf, &key, &self.write_opts())
                .map_err(|e| QueueStoreError::Database(e.to_string()))?;
        }
        Ok(())
    }

    fn max_id(&self) -> Result<Option<u64>, QueueStoreError> {
        let cf = self.cf(CF_ENTRIES)?;
        let mut iter = self.db.iterator_cf(&cf, IteratorMode::End);
        match iter.next() {
            Some(Ok((key, _))) if key.len() == 8 => {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(&key);
                Ok(Some(u64::from_be_bytes(buf)))
            }
            Some(Ok(_)) => Ok(None),
            Some(Err(e)) => Err(QueueStoreError::Database(e.to_string())),
            None => Ok(None),
        }
    }

    fn entries(&self) -> Result<Vec<QueueEntry>, QueueStoreError> {
        let cf = self.cf(CF_ENTRIES)?;
        let mut out = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (_, value) = item.map_err(|e| QueueStoreError::Database(e.to_string()))?;
            match Self::decode_value(&value) {
                Ok(entry) => out.push(entry),
                Err(e) => {
                    // Undecodable entry is skipped, not fatal
                    log::warn!("skipping corrupt queue entry in {}: {e}", self.path().display());
                }
            }
        }
        Ok(out)
    }

    fn flush(&mut self) -> Result<(), QueueStoreError> {
        self.db
            .flush()
            .map_err(|e| QueueStoreError::Database(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::update::UpdatePayload;

    fn entry(id: u64) -> QueueEntry {
        QueueEntry::new(id, UpdatePayload::new(vec![id as u8; 32]))
    }

    #[test]
    fn test_open_put_pop() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = RocksQueueStore::open(RocksQueueConfig::for_testing(dir.path())).unwrap();

        store.put(&entry(1)).unwrap();
        store.put(&entry(2)).unwrap();
        assert_eq!(store.len().unwrap(), 2);

        assert_eq!(store.pop_min().unwrap().unwrap().id, 1);
        assert_eq!(store.pop_min().unwrap().unwrap().id, 2);
        assert!(store.pop_min().unwrap().is_none());
    }

    #[test]
    fn test_fifo_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let config = RocksQueueConfig::for_testing(dir.path());

        {
            let mut store = RocksQueueStore::open(config.clone()).unwrap();
            for id in 1..=3 {
                store.put(&entry(id)).unwrap();
            }
            store.flush().unwrap();
        }

        let mut store = RocksQueueStore::open(config).unwrap();
        assert_eq!(store.len().unwrap(), 3);
        assert_eq!(store.max_id().unwrap(), Some(3));
        assert_eq!(store.pop_min().unwrap().unwrap().id, 1);
    }

    #[test]
    fn test_put_back_restores_front() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = RocksQueueStore::open(RocksQueueConfig::for_testing(dir.path())).unwrap();

        store.put(&entry(1)).unwrap();
        store.put(&entry(2)).unwrap();

        let front = store.pop_min().unwrap().unwrap();
        store.put(&front).unwrap();

        assert_eq!(store.peek_min().unwrap().unwrap().id, 1);
        assert_eq!(store.len().unwrap(), 2);
    }

    #[test]
    fn test_clear() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = RocksQueueStore::open(RocksQueueConfig::for_testing(dir.path())).unwrap();

        for id in 1..=5 {
            store.put(&entry(id)).unwrap();
        }
        store.clear().unwrap();
        assert!(store.is_empty().unwrap());
        assert!(store.max_id().unwrap().is_none());
    }

    #[test]
    fn test_entries_in_id_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = RocksQueueStore::open(RocksQueueConfig::for_testing(dir.path())).unwrap();

        // Inserted out of order; big-endian keys sort them back
        for id in [300u64, 2, 1000, 45] {
            store.put(&entry(id)).unwrap();
        }

        let ids: Vec<u64> = store.entries().unwrap().iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![2, 45, 300, 1000]);
    }

    #[test]
    fn test_corrupt_head_entry_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = RocksQueueStore::open(RocksQueueConfig::for_testing(dir.path())).unwrap();

        store.put(&entry(1)).unwrap();
        store.put(&entry(2)).unwrap();
        // Plant undecodable bytes ahead of the valid entries
        let cf = store.db.cf_handle(CF_ENTRIES).unwrap();
        store.db.put_cf(&cf, 0u64.to_be_bytes(), b"not an entry").unwrap();

        // The garbage head is dropped, not returned, and never blocks
        // the entries behind it
        assert_eq!(store.peek_min().unwrap().unwrap().id, 1);
        assert_eq!(store.pop_min().unwrap().unwrap().id, 1);
        assert_eq!(store.pop_min().unwrap().unwrap().id, 2);
        assert!(store.pop_min().unwrap().is_none());
    }

    #[test]
    fn test_payload_roundtrip_through_compression() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = RocksQueueStore::open(RocksQueueConfig::for_testing(dir.path())).unwrap();

        let original = QueueEntry::new(1, UpdatePayload::new((0..=255).collect()));
        store.put(&original).unwrap();

        let loaded = store.pop_min().unwrap().unwrap();
        assert_eq!(loaded, original);
    }
}

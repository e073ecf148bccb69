//! Single-file JSON queue tier.
//!
//! Legacy format and the fallback when RocksDB cannot be opened: the whole
//! queue lives in one JSON document, rewritten on every mutation. Fine for
//! the queue's bounded size (~100 entries), and trivially inspectable when
//! debugging stuck offline clients.
//!
//! Writes go through a temp file + rename so a crash mid-write leaves the
//! previous blob intact. Corrupt entries inside an otherwise readable blob
//! are skipped with a warning rather than failing the whole open.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use super::{QueueStore, QueueStoreError, QUEUE_SCHEMA_VERSION};
use crate::update::QueueEntry;

/// Serialized blob layout.
#[derive(Debug, Serialize, Deserialize)]
struct BlobFile {
    schema_version: u32,
    entries: Vec<QueueEntry>,
}

/// Queue store persisting all entries as one JSON file.
pub struct BlobQueueStore {
    path: PathBuf,
    /// In-memory mirror, kept sorted by id. Rewritten to disk on mutation.
    entries: Vec<QueueEntry>,
}

impl BlobQueueStore {
    /// Open (or create) the blob at `path`, loading any readable entries.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, QueueStoreError> {
        let path = path.into();
        let entries = if path.exists() {
            Self::load_entries(&path)?
        } else {
            Vec::new()
        };
        Ok(Self { path, entries })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Parse the blob leniently: a corrupt entry is skipped, not fatal.
    fn load_entries(path: &Path) -> Result<Vec<QueueEntry>, QueueStoreError> {
        let raw = fs::read_to_string(path)?;
        if raw.trim().is_empty() {
            return Ok(Vec::new());
        }

        let value: serde_json::Value = serde_json::from_str(&raw)
            .map_err(|e| QueueStoreError::Serialization(e.to_string()))?;

        let schema_version = value
            .get("schema_version")
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as u32;
        if schema_version > QUEUE_SCHEMA_VERSION {
            return Err(QueueStoreError::Serialization(format!(
                "Blob schema version {schema_version} is newer than supported {QUEUE_SCHEMA_VERSION}"
            )));
        }

        let raw_entries = match value.get("entries").and_then(|v| v.as_array()) {
            Some(arr) => arr.clone(),
            None => return Ok(Vec::new()),
        };

        let mut entries = Vec::with_capacity(raw_entries.len());
        for (index, raw_entry) in raw_entries.into_iter().enumerate() {
            match serde_json::from_value::<QueueEntry>(raw_entry) {
                Ok(entry) => entries.push(entry),
                Err(e) => {
                    log::warn!(
                        "skipping corrupt queue entry {index} in {}: {e}",
                        path.display()
                    );
                }
            }
        }
        entries.sort_by_key(|e| e.id);
        Ok(entries)
    }

    fn write_out(&self) -> Result<(), QueueStoreError> {
        let blob = BlobFile {
            schema_version: QUEUE_SCHEMA_VERSION,
            entries: self.entries.clone(),
        };
        let json = serde_json::to_string(&blob)
            .map_err(|e| QueueStoreError::Serialization(e.to_string()))?;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Delete the blob file, used after migration into the rocks tier.
    pub fn remove_file(path: &Path) -> Result<(), QueueStoreError> {
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }
}

impl QueueStore for BlobQueueStore {
    fn put(&mut self, entry: &QueueEntry) -> Result<(), QueueStoreError> {
        match self.entries.binary_search_by_key(&entry.id, |e| e.id) {
            Ok(pos) => self.entries[pos] = entry.clone(),
            Err(pos) => self.entries.insert(pos, entry.clone()),
        }
        self.write_out()
    }

    fn pop_min(&mut self) -> Result<Option<QueueEntry>, QueueStoreError> {
        if self.entries.is_empty() {
            return Ok(None);
        }
        let entry = self.entries.remove(0);
        self.write_out()?;
        Ok(Some(entry))
    }

    fn peek_min(&self) -> Result<Option<QueueEntry>, QueueStoreError> {
        Ok(self.entries.first().cloned())
    }

    fn len(&self) -> Result<usize, QueueStoreError> {
        Ok(self.entries.len())
    }

    fn clear(&mut self) -> Result<(), QueueStoreError> {
        self.entries.clear();
        self.write_out()
    }

    fn max_id(&self) -> Result<Option<u64>, QueueStoreError> {
        Ok(self.entries.last().map(|e| e.id))
    }

    fn entries(&self) -> Result<Vec<QueueEntry>, QueueStoreError> {
        Ok(self.entries.clone())
    }

    fn flush(&mut self) -> Result<(), QueueStoreError> {
        Ok(())
    }
}

//! In-memory queue tier — the last-resort fallback.
//!
//! Entries do not survive a restart. The queue logs a warning when it lands
//! here so operators know offline durability is gone.

use std::collections::BTreeMap;

use super::{QueueStore, QueueStoreError};
use crate::update::QueueEntry;

/// Volatile queue store backed by a `BTreeMap` keyed by entry id.
#[derive(Debug, Default)]
pub struct MemoryQueueStore {
    entries: BTreeMap<u64, QueueEntry>,
}

impl MemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl QueueStore for MemoryQueueStore {
    fn put(&mut self, entry: &QueueEntry) -> Result<(), QueueStoreError> {
        self.entries.insert(entry.id, entry.clone());
        Ok(())
    }

    fn pop_min(&mut self) -> Result<Option<QueueEntry>, QueueStoreError> {
        let id = match self.entries.keys().next() {
            Some(id) => *id,
            None => return Ok(None),
        };
        Ok(self.entries.remove(&id))
    }

    fn peek_min(&self) -> Result<Option<QueueEntry>, QueueStoreError> {
        Ok(self.entries.values().next().cloned())
    }

    fn len(&self) -> Result<usize, QueueStoreError> {
        Ok(self.entries.len())
    }

    fn clear(&mut self) -> Result<(), QueueStoreError> {
        self.entries.clear();
        Ok(())
    }

    fn max_id(&self) -> Result<Option<u64>, QueueStoreError> {
        Ok(self.entries.keys().next_back().copied())
    }

    fn entries(&self) -> Result<Vec<QueueEntry>, QueueStoreError> {
        Ok(self.entries.values().cloned().collect())
    }

    fn flush(&mut self) -> Result<(), QueueStoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::update::UpdatePayload;

    fn entry(id: u64) -> QueueEntry {
        QueueEntry::new(id, UpdatePayload::new(vec![id as u8]))
    }

    #[test]
    fn test_fifo_order() {
        let mut store = MemoryQueueStore::new();
        store.put(&entry(1)).unwrap();
        store.put(&entry(2)).unwrap();
        store.put(&entry(3)).unwrap();

        assert_eq!(store.len().unwrap(), 3);
        assert_eq!(store.pop_min().unwrap().unwrap().id, 1);
        assert_eq!(store.pop_min().unwrap().unwrap().id, 2);
        assert_eq!(store.pop_min().unwrap().unwrap().id, 3);
        assert!(store.pop_min().unwrap().is_none());
    }

    #[test]
    fn test_peek_does_not_remove() {
        let mut store = MemoryQueueStore::new();
        store.put(&entry(7)).unwrap();

        assert_eq!(store.peek_min().unwrap().unwrap().id, 7);
        assert_eq!(store.len().unwrap(), 1);
    }

    #[test]
    fn test_put_back_restores_front() {
        let mut store = MemoryQueueStore::new();
        store.put(&entry(1)).unwrap();
        store.put(&entry(2)).unwrap();

        let front = store.pop_min().unwrap().unwrap();
        store.put(&front).unwrap();

        assert_eq!(store.peek_min().unwrap().unwrap().id, 1);
    }

    #[test]
    fn test_max_id_and_clear() {
        let mut store = MemoryQueueStore::new();
        assert!(store.max_id().unwrap().is_none());

        store.put(&entry(5)).unwrap();
        store.put(&entry(9)).unwrap();
        assert_eq!(store.max_id().unwrap(), Some(9));

        store.clear().unwrap();
        assert!(store.is_empty().unwrap());
    }
}

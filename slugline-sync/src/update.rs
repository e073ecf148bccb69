//! Core data model for document synchronization.
//!
//! Updates are opaque Yrs binary deltas. This module never interprets their
//! internal structure — the CRDT wire layout belongs to the `yrs` crate and
//! is treated as a black box throughout the provider.

use serde::{Deserialize, Serialize};
use std::time::SystemTime;
use uuid::Uuid;

/// Identifies a script document together with its owning project.
///
/// The project id is carried for backend access scoping only; the sync core
/// never enforces authorization itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DocumentId {
    pub doc: Uuid,
    pub project: Uuid,
}

impl DocumentId {
    pub fn new(doc: Uuid, project: Uuid) -> Self {
        Self { doc, project }
    }

    /// Generate a fresh id pair (for testing and local-first creation).
    pub fn random() -> Self {
        Self {
            doc: Uuid::new_v4(),
            project: Uuid::new_v4(),
        }
    }
}

impl std::fmt::Display for DocumentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.project, self.doc)
    }
}

/// An opaque, immutable CRDT delta in Yrs v1 binary encoding.
///
/// Newtype wrapper so the rest of the crate cannot accidentally poke at the
/// bytes. Debug prints only the length — delta bytes are noise in logs.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdatePayload(Vec<u8>);

impl UpdatePayload {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<u8>> for UpdatePayload {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl std::fmt::Debug for UpdatePayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "UpdatePayload({} bytes)", self.0.len())
    }
}

/// One row of the backend's append-only update log.
///
/// `payload` is the transport-string encoding (see [`crate::codec`]) of an
/// update; `sequence` is assigned by the backend on append and is
/// monotonically increasing per document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequencedUpdate {
    pub sequence: u64,
    pub payload: String,
}

/// An update delivered over the backend's change-notification channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteUpdate {
    pub sequence: u64,
    /// Client that appended the update. Matches the provider's own client id
    /// for self-originated echoes, which the provider drops.
    pub author: Uuid,
    pub payload: String,
}

/// A pending outgoing update persisted in the durable queue.
///
/// `id` is the queue-local insertion sequence; FIFO order is the order of
/// ids. Entries are immutable once enqueued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: u64,
    pub payload: UpdatePayload,
    /// Wall-clock enqueue time, seconds since epoch. Diagnostic only.
    pub queued_at_secs: u64,
}

impl QueueEntry {
    pub fn new(id: u64, payload: UpdatePayload) -> Self {
        let queued_at_secs = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        Self {
            id,
            payload,
            queued_at_secs,
        }
    }

    /// Serialize for the keyed durable store.
    pub fn encode(&self) -> Result<Vec<u8>, String> {
        bincode::serde::encode_to_vec(self, bincode::config::standard()).map_err(|e| e.to_string())
    }

    /// Deserialize from the keyed durable store.
    pub fn decode(bytes: &[u8]) -> Result<Self, String> {
        let (entry, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| e.to_string())?;
        Ok(entry)
    }
}

//! # slugline-sync — Document synchronization for collaborative scripts
//!
//! Keeps a script document in step with its backend: CRDT merge via Yrs,
//! resilient persistence behind circuit breakers, and a durable offline
//! queue for edits made while the backend is unreachable.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   observe/apply    ┌───────────────┐
//! │ SyncProvider │ ◄────────────────► │ Yrs Doc       │
//! │ (per doc)    │                    │ (local state) │
//! └──────┬───────┘                    └───────────────┘
//!        │ transport strings (base64)
//!        ▼
//! ┌──────────────┐     breakers      ┌───────────────┐
//! │ BreakerSet   │ ◄───────────────► │DocumentBackend│
//! │ load/sub/    │   retry inside    │ (service)     │
//! │ persist      │                   └───────────────┘
//! └──────┬───────┘
//!        │ failure
//!        ▼
//! ┌──────────────┐   rocks → blob → memory
//! │ DurableQueue │   (fallback tiers)
//! └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`update`] — data model (document ids, opaque payloads, queue entries)
//! - [`codec`] — base64 transport codec with structural validation
//! - [`retry`] — bounded exponential backoff
//! - [`breaker`] — circuit breaker triplet guarding backend calls
//! - [`storage`] — durable queue tiers (RocksDB, JSON blob, memory)
//! - [`queue`] — FIFO queue facade with tier fallback and migration
//! - [`backend`] — backend trait + in-memory implementation
//! - [`provider`] — the synchronization provider itself

pub mod backend;
pub mod breaker;
pub mod codec;
pub mod provider;
pub mod queue;
pub mod retry;
pub mod storage;
pub mod update;

// Re-exports for convenience
pub use backend::{
    AppendOutcome, BackendError, DocumentBackend, DocumentVersion, MemoryBackend,
    UpdateSubscription, PROTOCOL_VERSION,
};
pub use breaker::{
    BreakerConfig, BreakerError, BreakerSet, BreakerState, BreakerStats, CircuitBreaker,
};
pub use codec::{CodecError, MAX_ENCODE_BYTES, MAX_TRANSPORT_BYTES};
pub use provider::{ProviderConfig, ProviderError, ProviderStatus, SyncProvider};
pub use queue::{DurableQueue, QueueConfig, StorageBackend};
pub use retry::RetryPolicy;
pub use storage::{QueueStore, QueueStoreError, QUEUE_SCHEMA_VERSION};
pub use update::{DocumentId, QueueEntry, RemoteUpdate, SequencedUpdate, UpdatePayload};

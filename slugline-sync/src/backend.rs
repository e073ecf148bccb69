//! Backend collaborator boundary.
//!
//! The provider talks to the document service through [`DocumentBackend`],
//! a trait dealing in transport strings (see [`crate::codec`]) so the CRDT
//! binary layout never crosses the wire boundary uninterpreted. The real
//! service is remote; [`MemoryBackend`] is the in-crate implementation used
//! by tests and demos, with failure injection for exercising the breaker,
//! retry, and queue paths.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use uuid::Uuid;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, ReadTxn, Transact, Update};

use crate::codec;
use crate::update::{DocumentId, RemoteUpdate, SequencedUpdate};

/// Wire protocol version this crate speaks. A backend reporting a higher
/// version parks the provider in `UpdateRequired`.
pub const PROTOCOL_VERSION: u32 = 1;

/// Version row for a document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentVersion {
    /// Sequence of the last appended update; 0 for a fresh document.
    pub version: u64,
    /// Yrs state vector (v1 encoding) of the backend's materialized state,
    /// for clients that want a delta-sized load instead of full history.
    pub state_vector: Vec<u8>,
}

/// Result of a successful append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendOutcome {
    pub new_version: u64,
    /// Sequence assigned to the appended update.
    pub sequence: u64,
}

/// Backend call failures, split along the retry boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// Document does not exist.
    NotFound(DocumentId),
    /// Optimistic-concurrency version mismatch on append.
    Conflict { expected: u64, actual: u64 },
    /// Backend unreachable or returning server errors.
    Unavailable,
    /// A call exceeded its deadline.
    Timeout,
    /// Backend rejected the request as malformed.
    Rejected(String),
}

impl BackendError {
    /// Transient errors are worth retrying; the rest propagate immediately.
    pub fn is_transient(&self) -> bool {
        matches!(self, BackendError::Unavailable | BackendError::Timeout)
    }
}

impl std::fmt::Display for BackendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendError::NotFound(id) => write!(f, "Document not found: {id}"),
            BackendError::Conflict { expected, actual } => {
                write!(f, "Version conflict: expected {expected}, actual {actual}")
            }
            BackendError::Unavailable => write!(f, "Backend unavailable"),
            BackendError::Timeout => write!(f, "Backend call timed out"),
            BackendError::Rejected(reason) => write!(f, "Backend rejected request: {reason}"),
        }
    }
}

impl std::error::Error for BackendError {}

/// Live change-feed subscription for one document.
///
/// Dropping the receiver (or calling `unsubscribe` on the backend with the
/// handle) ends delivery.
pub struct UpdateSubscription {
    pub handle: u64,
    pub receiver: mpsc::UnboundedReceiver<RemoteUpdate>,
}

/// The document service as seen by the provider.
#[async_trait]
pub trait DocumentBackend: Send + Sync {
    /// Wire protocol version the service speaks.
    async fn protocol_version(&self) -> Result<u32, BackendError>;

    /// Current version of a document. Fresh documents report version 0.
    async fn load_document_version(&self, id: DocumentId) -> Result<DocumentVersion, BackendError>;

    /// All updates with sequence strictly greater than `since`, in
    /// ascending sequence order.
    async fn load_updates_since(
        &self,
        id: DocumentId,
        since: u64,
    ) -> Result<Vec<SequencedUpdate>, BackendError>;

    /// Append one transport-encoded update, guarded by optimistic
    /// concurrency on `expected_version`.
    async fn append_update(
        &self,
        id: DocumentId,
        author: Uuid,
        transport: &str,
        expected_version: u64,
    ) -> Result<AppendOutcome, BackendError>;

    /// Open a change-feed subscription. Every append to the document is
    /// delivered to every subscriber, including the appending client's own
    /// subscription — echo filtering is the provider's job.
    async fn subscribe(&self, id: DocumentId) -> Result<UpdateSubscription, BackendError>;

    /// Close a subscription by handle. Unknown handles are a no-op.
    async fn unsubscribe(&self, id: DocumentId, handle: u64) -> Result<(), BackendError>;
}

struct DocState {
    /// Append-only log; index i holds sequence i+1.
    updates: Vec<(Uuid, String)>,
    subscribers: Vec<(u64, mpsc::UnboundedSender<RemoteUpdate>)>,
}

impl DocState {
    fn new() -> Self {
        Self {
            updates: Vec::new(),
            subscribers: Vec::new(),
        }
    }

    fn version(&self) -> u64 {
        self.updates.len() as u64
    }

    /// State vector of the log materialized into a scratch document.
    /// Undecodable log entries contribute nothing.
    fn state_vector(&self) -> Vec<u8> {
        let doc = Doc::new();
        {
            let mut txn = doc.transact_mut();
            for (_, transport) in &self.updates {
                let payload = match codec::decode(transport) {
                    Ok(payload) => payload,
                    Err(_) => continue,
                };
                let update = match Update::decode_v1(payload.as_bytes()) {
                    Ok(update) => update,
                    Err(_) => continue,
                };
                let _ = txn.apply_update(update);
            }
        }
        let sv = doc.transact().state_vector().encode_v1();
        sv
    }
}

struct MemoryBackendInner {
    docs: Mutex<HashMap<DocumentId, DocState>>,
    next_handle: AtomicU64,
    unavailable: AtomicBool,
    protocol_version: AtomicU64,
    append_count: AtomicU64,
}

/// In-memory [`DocumentBackend`] with failure injection.
#[derive(Clone)]
pub struct MemoryBackend {
    inner: Arc<MemoryBackendInner>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MemoryBackendInner {
                docs: Mutex::new(HashMap::new()),
                next_handle: AtomicU64::new(1),
                unavailable: AtomicBool::new(false),
                protocol_version: AtomicU64::new(PROTOCOL_VERSION as u64),
                append_count: AtomicU64::new(0),
            }),
        }
    }

    /// Flip the backend into (or out of) a failing state: every call
    /// returns [`BackendError::Unavailable`] while set.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Override the reported protocol version (for gating tests).
    pub fn set_protocol_version(&self, version: u32) {
        self.inner
            .protocol_version
            .store(version as u64, Ordering::SeqCst);
    }

    /// Total successful appends across all documents.
    pub fn append_count(&self) -> u64 {
        self.inner.append_count.load(Ordering::SeqCst)
    }

    /// Transport payloads of a document's log, in sequence order.
    pub fn update_log(&self, id: DocumentId) -> Vec<String> {
        let docs = self.inner.docs.lock().expect("backend lock poisoned");
        docs.get(&id)
            .map(|doc| doc.updates.iter().map(|(_, p)| p.clone()).collect())
            .unwrap_or_default()
    }

    fn check_available(&self) -> Result<(), BackendError> {
        if self.inner.unavailable.load(Ordering::SeqCst) {
            Err(BackendError::Unavailable)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl DocumentBackend for MemoryBackend {
    async fn protocol_version(&self) -> Result<u32, BackendError> {
        self.check_available()?;
        Ok(self.inner.protocol_version.load(Ordering::SeqCst) as u32)
    }

    async fn load_document_version(&self, id: DocumentId) -> Result<DocumentVersion, BackendError> {
        self.check_available()?;
        let docs = self.inner.docs.lock().expect("backend lock poisoned");
        match docs.get(&id) {
            Some(doc) => Ok(DocumentVersion {
                version: doc.version(),
                state_vector: doc.state_vector(),
            }),
            None => Ok(DocumentVersion {
                version: 0,
                state_vector: yrs::StateVector::default().encode_v1(),
            }),
        }
    }

    async fn load_updates_since(
        &self,
        id: DocumentId,
        since: u64,
    ) -> Result<Vec<SequencedUpdate>, BackendError> {
        self.check_available()?;
        let docs = self.inner.docs.lock().expect("backend lock poisoned");
        let doc = match docs.get(&id) {
            Some(doc) => doc,
            None => return Ok(Vec::new()),
        };
        Ok(doc
            .updates
            .iter()
            .enumerate()
            .map(|(i, (_, payload))| SequencedUpdate {
                sequence: i as u64 + 1,
                payload: payload.clone(),
            })
            .filter(|u| u.sequence > since)
            .collect())
    }

    async fn append_update(
        &self,
        id: DocumentId,
        author: Uuid,
        transport: &str,
        expected_version: u64,
    ) -> Result<AppendOutcome, BackendError> {
        self.check_available()?;
        if transport.is_empty() {
            return Err(BackendError::Rejected("empty update payload".into()));
        }

        let mut docs = self.inner.docs.lock().expect("backend lock poisoned");
        let doc = docs.entry(id).or_insert_with(DocState::new);

        let actual = doc.version();
        if expected_version != actual {
            return Err(BackendError::Conflict {
                expected: expected_version,
                actual,
            });
        }

        doc.updates.push((author, transport.to_string()));
        let sequence = doc.version();
        self.inner.append_count.fetch_add(1, Ordering::SeqCst);

        // Fan out to every live subscriber, pruning closed channels
        let notification = RemoteUpdate {
            sequence,
            author,
            payload: transport.to_string(),
        };
        doc.subscribers
            .retain(|(_, tx)| tx.send(notification.clone()).is_ok());

        Ok(AppendOutcome {
            new_version: sequence,
            sequence,
        })
    }

    async fn subscribe(&self, id: DocumentId) -> Result<UpdateSubscription, BackendError> {
        self.check_available()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = self.inner.next_handle.fetch_add(1, Ordering::SeqCst);

        let mut docs = self.inner.docs.lock().expect("backend lock poisoned");
        docs.entry(id)
            .or_insert_with(DocState::new)
            .subscribers
            .push((handle, tx));

        Ok(UpdateSubscription {
            handle,
            receiver: rx,
        })
    }

    async fn unsubscribe(&self, id: DocumentId, handle: u64) -> Result<(), BackendError> {
        let mut docs = self.inner.docs.lock().expect("backend lock poisoned");
        if let Some(doc) = docs.get_mut(&id) {
            doc.subscribers.retain(|(h, _)| *h != handle);
        }
        Ok(())
    }
}

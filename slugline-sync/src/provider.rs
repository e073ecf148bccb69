//! The synchronization provider: one live document, kept in step with the
//! backend.
//!
//! ```text
//!            local edits                      remote authors
//!                │                                  │
//!                ▼                                  ▼
//!  ┌──────────────────────────┐        ┌──────────────────────────┐
//!  │ yrs::Doc                 │        │ backend change feed      │
//!  │  observe_update_v1       │        │  (subscription)          │
//!  └───────────┬──────────────┘        └───────────┬──────────────┘
//!              │ update bytes                      │ RemoteUpdate
//!              ▼                                   ▼
//!       persist pipeline                    echo filter + apply
//!  (codec → breaker → retry)             (author == self? drop)
//!              │ failure
//!              ▼
//!        durable queue ──── drained on reconnect / breaker close
//! ```
//!
//! Echo loops are broken twice: remote updates are applied under a private
//! transaction origin the local observer skips, and change-feed items
//! authored by this client are dropped before they reach the document.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;
use yrs::updates::decoder::Decode;
use yrs::{Doc, Origin, Transact, Update};

use crate::backend::{BackendError, DocumentBackend, PROTOCOL_VERSION};
use crate::breaker::{BreakerConfig, BreakerError, BreakerSet, BreakerState};
use crate::codec::{self, CodecError};
use crate::queue::{DurableQueue, QueueConfig};
use crate::retry::RetryPolicy;
use crate::storage::QueueStoreError;
use crate::update::{DocumentId, UpdatePayload};

/// Transaction origin tag for updates the provider applies itself.
/// The local-update observer skips transactions carrying this tag.
const SYNC_ORIGIN: &str = "slugline-sync";

/// Provider lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderStatus {
    Initializing,
    Connected,
    Disconnected,
    /// Initial load or queue drain in progress.
    Syncing,
    /// Backend speaks a newer protocol; this client must be upgraded.
    UpdateRequired,
}

impl ProviderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderStatus::Initializing => "initializing",
            ProviderStatus::Connected => "connected",
            ProviderStatus::Disconnected => "disconnected",
            ProviderStatus::Syncing => "syncing",
            ProviderStatus::UpdateRequired => "update-required",
        }
    }
}

impl std::fmt::Display for ProviderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Provider errors.
#[derive(Debug)]
pub enum ProviderError {
    Backend(BackendError),
    /// The named breaker rejected the call without executing it.
    BreakerOpen(&'static str),
    Codec(CodecError),
    /// The update could not be decoded or applied by yrs.
    Crdt(String),
    Queue(QueueStoreError),
    UpdateRequired { backend: u32, supported: u32 },
    Destroyed,
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderError::Backend(e) => write!(f, "Backend error: {e}"),
            ProviderError::BreakerOpen(name) => write!(f, "Circuit breaker '{name}' is open"),
            ProviderError::Codec(e) => write!(f, "Codec error: {e}"),
            ProviderError::Crdt(e) => write!(f, "CRDT error: {e}"),
            ProviderError::Queue(e) => write!(f, "Queue error: {e}"),
            ProviderError::UpdateRequired { backend, supported } => write!(
                f,
                "Backend protocol version {backend} exceeds supported version {supported}; client update required"
            ),
            ProviderError::Destroyed => write!(f, "Provider has been destroyed"),
        }
    }
}

impl std::error::Error for ProviderError {}

impl From<BackendError> for ProviderError {
    fn from(e: BackendError) -> Self {
        ProviderError::Backend(e)
    }
}

impl From<CodecError> for ProviderError {
    fn from(e: CodecError) -> Self {
        ProviderError::Codec(e)
    }
}

impl From<QueueStoreError> for ProviderError {
    fn from(e: QueueStoreError) -> Self {
        ProviderError::Queue(e)
    }
}

/// Observer invoked on lifecycle transitions with the new status.
pub type StatusObserver = Box<dyn Fn(ProviderStatus) + Send + Sync>;

/// Provider configuration.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub breaker: BreakerConfig,
    pub retry: RetryPolicy,
    pub queue: QueueConfig,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            breaker: BreakerConfig::default(),
            retry: RetryPolicy::default(),
            queue: QueueConfig::in_memory(),
        }
    }
}

impl ProviderConfig {
    /// Production config with a durable queue rooted at `dir`.
    pub fn durable(dir: impl Into<PathBuf>) -> Self {
        Self {
            queue: QueueConfig::durable(dir),
            ..Default::default()
        }
    }

    /// Config for tests: fast breaker and retry, memory-only queue.
    pub fn for_testing() -> Self {
        Self {
            breaker: BreakerConfig::for_testing(),
            retry: RetryPolicy::for_testing(),
            queue: QueueConfig::in_memory(),
        }
    }
}

/// State shared between the provider handle and its background tasks.
struct Shared {
    id: DocumentId,
    client_id: Uuid,
    doc: Doc,
    backend: Arc<dyn DocumentBackend>,
    breakers: BreakerSet,
    breaker_config: BreakerConfig,
    retry: RetryPolicy,
    queue: Mutex<DurableQueue>,
    status: StdMutex<ProviderStatus>,
    status_observers: StdMutex<Vec<StatusObserver>>,
    /// Last backend version this client has observed, used as the
    /// optimistic-concurrency expectation on append.
    known_version: AtomicU64,
    /// Single-drainer guard so concurrent drain triggers don't interleave.
    draining: AtomicBool,
    destroyed: AtomicBool,
}

impl Shared {
    /// Apply update bytes to the document under the sync origin tag.
    fn apply_sync_update(&self, bytes: &[u8]) -> Result<(), ProviderError> {
        let update = Update::decode_v1(bytes).map_err(|e| ProviderError::Crdt(e.to_string()))?;
        let mut txn = self.doc.transact_mut_with(SYNC_ORIGIN);
        txn.apply_update(update)
            .map_err(|e| ProviderError::Crdt(e.to_string()))
    }

    fn set_status(&self, status: ProviderStatus) {
        let changed = {
            let mut current = self.status.lock().expect("status lock poisoned");
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        };
        if changed {
            log::debug!("provider for {} is now {status}", self.id);
            let observers = self
                .status_observers
                .lock()
                .expect("status observer lock poisoned");
            for observer in observers.iter() {
                observer(status);
            }
        }
    }

    /// One breaker-guarded, retrying append of a transport string.
    ///
    /// The breaker sees this whole call as a single outcome: the retry loop
    /// runs inside it, with a per-attempt timeout, under an outer timeout
    /// sized to cover every attempt plus backoff. Version conflicts refresh
    /// the known version and retry, so a concurrent remote append resolves
    /// itself on the next attempt.
    async fn send_transport(&self, transport: &str) -> Result<(), ProviderError> {
        let per_attempt = self.breaker_config.call_timeout;
        let budget = self.retry.wall_clock_budget(per_attempt);

        let result = self
            .breakers
            .persist
            .fire_with_timeout(budget, || async {
                self.retry
                    .execute_when(
                        || async {
                            let expected = self.known_version.load(Ordering::SeqCst);
                            let call = self.backend.append_update(
                                self.id,
                                self.client_id,
                                transport,
                                expected,
                            );
                            match tokio::time::timeout(per_attempt, call).await {
                                Ok(Ok(outcome)) => {
                                    self.known_version
                                        .store(outcome.new_version, Ordering::SeqCst);
                                    Ok(())
                                }
                                Ok(Err(BackendError::Conflict { expected, actual })) => {
                                    log::error!(
                                        "version conflict persisting update to {}: expected {expected}, actual {actual}",
                                        self.id
                                    );
                                    self.known_version.store(actual, Ordering::SeqCst);
                                    Err(BackendError::Conflict { expected, actual })
                                }
                                Ok(Err(e)) => Err(e),
                                Err(_) => Err(BackendError::Timeout),
                            }
                        },
                        |e| e.is_transient() || matches!(e, BackendError::Conflict { .. }),
                    )
                    .await
            })
            .await;

        match result {
            Ok(()) => Ok(()),
            Err(BreakerError::Open) => {
                Err(ProviderError::BreakerOpen(self.breakers.persist.name()))
            }
            Err(BreakerError::Timeout(_)) => Err(ProviderError::Backend(BackendError::Timeout)),
            Err(BreakerError::Inner(e)) => Err(ProviderError::Backend(e)),
        }
    }

    /// True when a failed persist should park the payload in the queue.
    /// Structural rejections are dropped instead; replaying them can never
    /// succeed.
    fn should_queue(err: &ProviderError) -> bool {
        match err {
            ProviderError::BreakerOpen(_) => true,
            ProviderError::Backend(e) => {
                e.is_transient() || matches!(e, BackendError::Conflict { .. })
            }
            _ => false,
        }
    }

    async fn persist_payload(&self, payload: UpdatePayload) -> Result<(), ProviderError> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(ProviderError::Destroyed);
        }
        let transport = match codec::encode(&payload) {
            Ok(transport) => transport,
            Err(e) => {
                log::warn!("dropping invalid outgoing update for {}: {e}", self.id);
                return Err(ProviderError::Codec(e));
            }
        };

        match self.send_transport(&transport).await {
            Ok(()) => Ok(()),
            Err(err) => {
                if Self::should_queue(&err) {
                    let mut queue = self.queue.lock().await;
                    match queue.enqueue(payload) {
                        Ok(true) => {
                            log::info!(
                                "queued update for {} ({} pending): {err}",
                                self.id,
                                queue.len()
                            );
                        }
                        Ok(false) => {
                            log::error!("update queue full; update for {} lost", self.id);
                        }
                        Err(e) => {
                            log::error!("failed to queue update for {}: {e}", self.id);
                        }
                    }
                }
                Err(err)
            }
        }
    }

    /// Drain queued updates in FIFO order.
    ///
    /// Stops at the first transient failure, putting the entry back at the
    /// front so replay order is preserved. Structural failures drop the
    /// entry and draining continues, so a poison entry cannot strand the
    /// queue behind it.
    async fn drain_pending(&self) -> Result<usize, ProviderError> {
        if self
            .draining
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(0);
        }
        let result = self.drain_inner().await;
        self.draining.store(false, Ordering::SeqCst);
        result
    }

    async fn drain_inner(&self) -> Result<usize, ProviderError> {
        let mut drained = 0usize;
        loop {
            let entry = match self.queue.lock().await.dequeue() {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => return Err(ProviderError::Queue(e)),
            };

            let transport = match codec::encode(&entry.payload) {
                Ok(transport) => transport,
                Err(e) => {
                    log::warn!("dropping corrupt queued update {}: {e}", entry.id);
                    continue;
                }
            };

            match self.send_transport(&transport).await {
                Ok(()) => drained += 1,
                Err(err) if Self::should_queue(&err) => {
                    self.queue.lock().await.requeue_front(entry)?;
                    log::info!(
                        "queue drain for {} paused after {drained} entries: {err}",
                        self.id
                    );
                    break;
                }
                Err(err) => {
                    log::warn!("dropping rejected queued update {}: {err}", entry.id);
                }
            }
        }
        Ok(drained)
    }
}

/// Resources owned by the current connection.
#[derive(Default)]
struct Connection {
    subscription_handle: Option<u64>,
    remote_task: Option<JoinHandle<()>>,
    persist_task: Option<JoinHandle<()>>,
    drain_task: Option<JoinHandle<()>>,
    doc_observer: Option<yrs::Subscription>,
    drain_hook_installed: bool,
}

/// Synchronization provider for one document.
pub struct SyncProvider {
    shared: Arc<Shared>,
    conn: Mutex<Connection>,
}

impl SyncProvider {
    /// Create a provider for `id`, identifying outgoing updates as
    /// `client_id`. The document starts empty; `connect` loads state.
    pub fn new(
        id: DocumentId,
        client_id: Uuid,
        backend: Arc<dyn DocumentBackend>,
        config: ProviderConfig,
    ) -> Self {
        let queue = DurableQueue::open(config.queue.clone());
        Self {
            shared: Arc::new(Shared {
                id,
                client_id,
                doc: Doc::new(),
                backend,
                breakers: BreakerSet::new(config.breaker.clone()),
                breaker_config: config.breaker,
                retry: config.retry,
                queue: Mutex::new(queue),
                status: StdMutex::new(ProviderStatus::Initializing),
                status_observers: StdMutex::new(Vec::new()),
                known_version: AtomicU64::new(0),
                draining: AtomicBool::new(false),
                destroyed: AtomicBool::new(false),
            }),
            conn: Mutex::new(Connection::default()),
        }
    }

    /// Handle to the live document. Clones share the same underlying state;
    /// edits through any handle flow into the sync pipeline.
    pub fn document(&self) -> Doc {
        self.shared.doc.clone()
    }

    pub fn document_id(&self) -> DocumentId {
        self.shared.id
    }

    pub fn client_id(&self) -> Uuid {
        self.shared.client_id
    }

    pub fn status(&self) -> ProviderStatus {
        *self.shared.status.lock().expect("status lock poisoned")
    }

    /// The breakers guarding this provider's backend calls (diagnostic).
    pub fn breakers(&self) -> &BreakerSet {
        &self.shared.breakers
    }

    /// Backend version last observed by this client.
    pub fn known_version(&self) -> u64 {
        self.shared.known_version.load(Ordering::SeqCst)
    }

    pub async fn queued_updates(&self) -> usize {
        self.shared.queue.lock().await.len()
    }

    /// Register an observer for lifecycle transitions.
    pub fn on_status_change(&self, observer: impl Fn(ProviderStatus) + Send + Sync + 'static) {
        self.shared
            .status_observers
            .lock()
            .expect("status observer lock poisoned")
            .push(Box::new(observer));
    }

    /// Connect: protocol gate, initial load, subscription, local listener,
    /// queue drain. Idempotent — a connected provider returns immediately.
    pub async fn connect(&self) -> Result<(), ProviderError> {
        if self.shared.destroyed.load(Ordering::SeqCst) {
            return Err(ProviderError::Destroyed);
        }
        let mut conn = self.conn.lock().await;
        if self.status() == ProviderStatus::Connected {
            return Ok(());
        }
        self.shared.set_status(ProviderStatus::Syncing);

        match self.connect_inner(&mut conn).await {
            Ok(()) => {
                self.shared.set_status(ProviderStatus::Connected);
                // Drain errors are logged, never surfaced from connect
                match self.shared.drain_pending().await {
                    Ok(n) if n > 0 => log::info!("drained {n} queued updates on connect"),
                    Ok(_) => {}
                    Err(e) => log::warn!("queue drain on connect failed: {e}"),
                }
                Ok(())
            }
            Err(err @ ProviderError::UpdateRequired { .. }) => {
                self.shared.set_status(ProviderStatus::UpdateRequired);
                Err(err)
            }
            Err(err) => {
                self.shared.set_status(ProviderStatus::Disconnected);
                Err(err)
            }
        }
    }

    async fn connect_inner(&self, conn: &mut Connection) -> Result<(), ProviderError> {
        let shared = &self.shared;

        // Protocol gate, guarded by the load breaker like the rest of the
        // initial handshake
        let backend_version = shared
            .breakers
            .load
            .fire(|| async { shared.backend.protocol_version().await })
            .await
            .map_err(|e| Self::from_breaker(shared.breakers.load.name(), e))?;
        if backend_version > PROTOCOL_VERSION {
            return Err(ProviderError::UpdateRequired {
                backend: backend_version,
                supported: PROTOCOL_VERSION,
            });
        }

        // Subscribe before loading history so an append racing the load is
        // never lost: it either shows up in the history or sits buffered in
        // the feed channel until the remote task starts. The overlap is
        // harmless — replaying an already-applied update is a no-op.
        let subscription = shared
            .breakers
            .subscribe
            .fire(|| async { shared.backend.subscribe(shared.id).await })
            .await
            .map_err(|e| Self::from_breaker(shared.breakers.subscribe.name(), e))?;
        conn.subscription_handle = Some(subscription.handle);

        // Initial load: current version plus the full update history
        let (version, updates) = shared
            .breakers
            .load
            .fire(|| async {
                let version = shared.backend.load_document_version(shared.id).await?;
                let updates = shared.backend.load_updates_since(shared.id, 0).await?;
                Ok::<_, BackendError>((version, updates))
            })
            .await
            .map_err(|e| Self::from_breaker(shared.breakers.load.name(), e))?;

        // Replay in sequence order under the sync origin. Idempotent by
        // CRDT semantics; a corrupt history entry is skipped, not fatal.
        for update in updates {
            let payload = match codec::decode(&update.payload) {
                Ok(payload) => payload,
                Err(e) => {
                    log::warn!(
                        "skipping undecodable history entry {} for {}: {e}",
                        update.sequence,
                        shared.id
                    );
                    continue;
                }
            };
            if let Err(e) = shared.apply_sync_update(payload.as_bytes()) {
                log::warn!(
                    "skipping unappliable history entry {} for {}: {e}",
                    update.sequence,
                    shared.id
                );
            }
        }
        shared.known_version.store(version.version, Ordering::SeqCst);

        // Start consuming the feed only now that history is applied
        let mut receiver = subscription.receiver;
        let remote_shared = shared.clone();
        conn.remote_task = Some(tokio::spawn(async move {
            while let Some(remote) = receiver.recv().await {
                // Our own appends come back over the feed; drop them here
                if remote.author == remote_shared.client_id {
                    remote_shared
                        .known_version
                        .fetch_max(remote.sequence, Ordering::SeqCst);
                    continue;
                }
                let payload = match codec::decode(&remote.payload) {
                    Ok(payload) => payload,
                    Err(e) => {
                        log::warn!(
                            "dropping undecodable remote update {} for {}: {e}",
                            remote.sequence,
                            remote_shared.id
                        );
                        continue;
                    }
                };
                if let Err(e) = remote_shared.apply_sync_update(payload.as_bytes()) {
                    log::warn!(
                        "failed to apply remote update {} for {}: {e}",
                        remote.sequence,
                        remote_shared.id
                    );
                    continue;
                }
                remote_shared
                    .known_version
                    .fetch_max(remote.sequence, Ordering::SeqCst);
            }
        }));

        // Local-mutation listener: observer feeds a channel, one consumer
        // task persists. Installed once and kept across reconnects.
        if conn.doc_observer.is_none() {
            let (update_tx, mut update_rx) = mpsc::unbounded_channel::<Vec<u8>>();
            let sync_origin = Origin::from(SYNC_ORIGIN);
            let observer = shared
                .doc
                .observe_update_v1(move |txn, event| {
                    let from_sync = txn.origin() == Some(&sync_origin);
                    if !from_sync {
                        let _ = update_tx.send(event.update.clone());
                    }
                })
                .map_err(|e| ProviderError::Crdt(e.to_string()))?;
            conn.doc_observer = Some(observer);

            let persist_shared = shared.clone();
            conn.persist_task = Some(tokio::spawn(async move {
                while let Some(bytes) = update_rx.recv().await {
                    if let Err(e) = persist_shared
                        .persist_payload(UpdatePayload::new(bytes))
                        .await
                    {
                        log::debug!("local update persistence deferred: {e}");
                    }
                }
            }));
        }

        // Persist breaker closing again means the backend recovered; kick
        // off a drain without waiting for the next connect
        if !conn.drain_hook_installed {
            let (drain_tx, mut drain_rx) = mpsc::unbounded_channel::<()>();
            shared.breakers.persist.on_state_change(move |state| {
                if state == BreakerState::Closed {
                    let _ = drain_tx.send(());
                }
            });
            let drain_shared = shared.clone();
            conn.drain_task = Some(tokio::spawn(async move {
                while drain_rx.recv().await.is_some() {
                    match drain_shared.drain_pending().await {
                        Ok(0) => {}
                        Ok(n) => log::info!("drained {n} queued updates after breaker close"),
                        Err(e) => log::warn!("queue drain failed: {e}"),
                    }
                }
            }));
            conn.drain_hook_installed = true;
        }

        Ok(())
    }

    fn from_breaker(name: &'static str, err: BreakerError<BackendError>) -> ProviderError {
        match err {
            BreakerError::Open => ProviderError::BreakerOpen(name),
            BreakerError::Timeout(_) => ProviderError::Backend(BackendError::Timeout),
            BreakerError::Inner(e) => ProviderError::Backend(e),
        }
    }

    /// Persist one update now. On transient failure or an open breaker the
    /// payload is queued for later drain and the error is returned; invalid
    /// payloads are dropped.
    pub async fn persist_update(&self, payload: UpdatePayload) -> Result<(), ProviderError> {
        self.shared.persist_payload(payload).await
    }

    /// Replay queued updates in FIFO order. Returns how many were sent.
    pub async fn drain_pending(&self) -> Result<usize, ProviderError> {
        if self.shared.destroyed.load(Ordering::SeqCst) {
            return Err(ProviderError::Destroyed);
        }
        self.shared.drain_pending().await
    }

    /// Tear down the subscription. Idempotent; the document and queue stay
    /// usable and a later `connect` resumes syncing.
    pub async fn disconnect(&self) {
        let mut conn = self.conn.lock().await;
        if let Some(handle) = conn.subscription_handle.take() {
            if let Err(e) = self.shared.backend.unsubscribe(self.shared.id, handle).await {
                log::warn!("unsubscribe for {} failed: {e}", self.shared.id);
            }
        }
        if let Some(task) = conn.remote_task.take() {
            task.abort();
        }
        self.shared.set_status(ProviderStatus::Disconnected);
    }

    /// Release everything: subscription, listeners, background tasks, and
    /// the queue handle (flushed, not cleared). Safe to call repeatedly.
    pub async fn destroy(&self) {
        if self.shared.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.disconnect().await;
        let mut conn = self.conn.lock().await;
        conn.doc_observer = None;
        if let Some(task) = conn.persist_task.take() {
            task.abort();
        }
        if let Some(task) = conn.drain_task.take() {
            task.abort();
        }
        if let Err(e) = self.shared.queue.lock().await.flush() {
            log::warn!("queue flush on destroy failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{AppendOutcome, DocumentVersion, MemoryBackend, UpdateSubscription};
    use crate::update::SequencedUpdate;
    use std::time::Duration;
    use tokio::time::sleep;
    use yrs::{GetString, ReadTxn, Text, WriteTxn};

    fn provider_for(backend: &MemoryBackend) -> SyncProvider {
        SyncProvider::new(
            DocumentId::random(),
            Uuid::new_v4(),
            Arc::new(backend.clone()),
            ProviderConfig::for_testing(),
        )
    }

    fn local_edit(doc: &Doc, text: &str) {
        let mut txn = doc.transact_mut();
        let body = txn.get_or_insert_text("body");
        let len = body.len(&txn);
        body.insert(&mut txn, len, text);
    }

    fn body_text(doc: &Doc) -> String {
        let txn = doc.transact();
        txn.get_text("body")
            .map(|t| t.get_string(&txn))
            .unwrap_or_default()
    }

    /// Transport string of an update inserting `text` into a fresh doc.
    fn transport_update(text: &str) -> String {
        let doc = Doc::new();
        {
            let mut txn = doc.transact_mut();
            let body = txn.get_or_insert_text("body");
            body.insert(&mut txn, 0, text);
        }
        let bytes = doc
            .transact()
            .encode_state_as_update_v1(&yrs::StateVector::default());
        codec::encode(&UpdatePayload::new(bytes)).unwrap()
    }

    #[tokio::test]
    async fn test_connect_marks_connected() {
        let backend = MemoryBackend::new();
        let provider = provider_for(&backend);
        assert_eq!(provider.status(), ProviderStatus::Initializing);

        provider.connect().await.unwrap();
        assert_eq!(provider.status(), ProviderStatus::Connected);

        // Second connect is a no-op
        provider.connect().await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_applies_existing_history() {
        let backend = MemoryBackend::new();
        let provider = provider_for(&backend);
        let other = Uuid::new_v4();

        backend
            .append_update(provider.document_id(), other, &transport_update("EXT. "), 0)
            .await
            .unwrap();
        backend
            .append_update(provider.document_id(), other, &transport_update("RANCH"), 1)
            .await
            .unwrap();

        provider.connect().await.unwrap();
        assert_eq!(provider.known_version(), 2);

        let text = body_text(&provider.document());
        assert!(text.contains("EXT. "));
        assert!(text.contains("RANCH"));
        // History replay must not echo back as new appends
        sleep(Duration::from_millis(50)).await;
        assert_eq!(backend.append_count(), 2);
    }

    /// Backend whose first history load lets a remote append slip in after
    /// the history snapshot is taken but before it is returned.
    struct RacingBackend {
        inner: MemoryBackend,
        author: Uuid,
        raced: AtomicBool,
    }

    #[async_trait::async_trait]
    impl DocumentBackend for RacingBackend {
        async fn protocol_version(&self) -> Result<u32, BackendError> {
            self.inner.protocol_version().await
        }

        async fn load_document_version(
            &self,
            id: DocumentId,
        ) -> Result<DocumentVersion, BackendError> {
            self.inner.load_document_version(id).await
        }

        async fn load_updates_since(
            &self,
            id: DocumentId,
            since: u64,
        ) -> Result<Vec<SequencedUpdate>, BackendError> {
            let history = self.inner.load_updates_since(id, since).await?;
            if !self.raced.swap(true, Ordering::SeqCst) {
                let version = self.inner.load_document_version(id).await?.version;
                self.inner
                    .append_update(id, self.author, &transport_update("RACED SCENE"), version)
                    .await?;
            }
            Ok(history)
        }

        async fn append_update(
            &self,
            id: DocumentId,
            author: Uuid,
            transport: &str,
            expected_version: u64,
        ) -> Result<AppendOutcome, BackendError> {
            self.inner
                .append_update(id, author, transport, expected_version)
                .await
        }

        async fn subscribe(&self, id: DocumentId) -> Result<UpdateSubscription, BackendError> {
            self.inner.subscribe(id).await
        }

        async fn unsubscribe(&self, id: DocumentId, handle: u64) -> Result<(), BackendError> {
            self.inner.unsubscribe(id, handle).await
        }
    }

    #[tokio::test]
    async fn test_append_racing_initial_load_not_lost() {
        let backend = RacingBackend {
            inner: MemoryBackend::new(),
            author: Uuid::new_v4(),
            raced: AtomicBool::new(false),
        };
        let provider = SyncProvider::new(
            DocumentId::random(),
            Uuid::new_v4(),
            Arc::new(backend),
            ProviderConfig::for_testing(),
        );

        // The racing append is missing from the loaded history, but the
        // subscription is already open, so it arrives over the feed
        provider.connect().await.unwrap();
        sleep(Duration::from_millis(100)).await;

        assert_eq!(body_text(&provider.document()), "RACED SCENE");
        assert_eq!(provider.known_version(), 1);
    }

    #[tokio::test]
    async fn test_local_edit_persists() {
        let backend = MemoryBackend::new();
        let provider = provider_for(&backend);
        provider.connect().await.unwrap();

        local_edit(&provider.document(), "INT. OFFICE - DAY");
        sleep(Duration::from_millis(100)).await;

        assert_eq!(backend.append_count(), 1);
        assert_eq!(provider.known_version(), 1);
        // Our own change-feed echo must not be re-applied or re-persisted
        sleep(Duration::from_millis(50)).await;
        assert_eq!(backend.append_count(), 1);
        assert_eq!(body_text(&provider.document()), "INT. OFFICE - DAY");
    }

    #[tokio::test]
    async fn test_remote_update_applied_without_echo() {
        let backend = MemoryBackend::new();
        let provider = provider_for(&backend);
        provider.connect().await.unwrap();

        let other = Uuid::new_v4();
        backend
            .append_update(
                provider.document_id(),
                other,
                &transport_update("FADE IN:"),
                0,
            )
            .await
            .unwrap();
        sleep(Duration::from_millis(100)).await;

        assert_eq!(body_text(&provider.document()), "FADE IN:");
        assert_eq!(provider.known_version(), 1);
        // Applying the remote update must not trigger a persist
        assert_eq!(backend.append_count(), 1);
    }

    #[tokio::test]
    async fn test_persist_failure_queues() {
        let backend = MemoryBackend::new();
        let provider = provider_for(&backend);
        provider.connect().await.unwrap();
        backend.set_unavailable(true);

        let payload = codec::decode(&transport_update("lost scene")).unwrap();
        let err = provider.persist_update(payload).await.unwrap_err();
        assert!(matches!(err, ProviderError::Backend(_)));
        assert_eq!(provider.queued_updates().await, 1);
    }

    #[tokio::test]
    async fn test_drain_after_recovery() {
        let backend = MemoryBackend::new();
        let provider = provider_for(&backend);
        provider.connect().await.unwrap();

        backend.set_unavailable(true);
        for text in ["one", "two", "three"] {
            let payload = codec::decode(&transport_update(text)).unwrap();
            let _ = provider.persist_update(payload).await;
        }
        assert_eq!(provider.queued_updates().await, 3);

        backend.set_unavailable(false);
        let drained = provider.drain_pending().await.unwrap();
        assert_eq!(drained, 3);
        assert_eq!(provider.queued_updates().await, 0);
        assert_eq!(backend.append_count(), 3);
    }

    #[tokio::test]
    async fn test_structural_failure_dropped_not_queued() {
        let backend = MemoryBackend::new();
        let provider = provider_for(&backend);
        provider.connect().await.unwrap();

        let err = provider
            .persist_update(UpdatePayload::new(Vec::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Codec(CodecError::Empty)));
        assert_eq!(provider.queued_updates().await, 0);
    }

    #[tokio::test]
    async fn test_protocol_gate_parks_in_update_required() {
        let backend = MemoryBackend::new();
        backend.set_protocol_version(PROTOCOL_VERSION + 1);
        let provider = provider_for(&backend);

        let err = provider.connect().await.unwrap_err();
        assert!(matches!(err, ProviderError::UpdateRequired { .. }));
        assert_eq!(provider.status(), ProviderStatus::UpdateRequired);
    }

    #[tokio::test]
    async fn test_connect_failure_marks_disconnected() {
        let backend = MemoryBackend::new();
        backend.set_unavailable(true);
        let provider = provider_for(&backend);

        assert!(provider.connect().await.is_err());
        assert_eq!(provider.status(), ProviderStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_status_observer_sees_transitions() {
        let backend = MemoryBackend::new();
        let provider = provider_for(&backend);
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = seen.clone();
        provider.on_status_change(move |status| {
            sink.lock().unwrap().push(status);
        });

        provider.connect().await.unwrap();
        provider.disconnect().await;

        let transitions = seen.lock().unwrap().clone();
        assert_eq!(
            transitions,
            vec![
                ProviderStatus::Syncing,
                ProviderStatus::Connected,
                ProviderStatus::Disconnected
            ]
        );
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent() {
        let backend = MemoryBackend::new();
        let provider = provider_for(&backend);
        provider.connect().await.unwrap();

        provider.destroy().await;
        provider.destroy().await;

        let err = provider
            .persist_update(UpdatePayload::new(vec![1]))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Destroyed));
        assert!(matches!(
            provider.connect().await.unwrap_err(),
            ProviderError::Destroyed
        ));
    }

    #[tokio::test]
    async fn test_queue_drains_on_reconnect() {
        let backend = MemoryBackend::new();
        let provider = provider_for(&backend);
        provider.connect().await.unwrap();

        backend.set_unavailable(true);
        let payload = codec::decode(&transport_update("offline edit")).unwrap();
        let _ = provider.persist_update(payload).await;
        provider.disconnect().await;

        backend.set_unavailable(false);
        provider.connect().await.unwrap();
        assert_eq!(provider.queued_updates().await, 0);
        assert_eq!(backend.append_count(), 1);
    }
}

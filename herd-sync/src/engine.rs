/// Sync engine
///
/// Drains the sync queue against the API transport whenever conditions
/// permit: one item at a time, in enqueue order, applying the retry/drop
/// policy and republishing aggregate status after each state change.
/// Failed items are retried only on the next externally-triggered pass;
/// there is no internal backoff timer.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::mpsc;

use herd_store::Store;

use crate::connectivity::ConnectivityMonitor;
use crate::error::{Result, SyncError};
use crate::operation::{Method, OperationId, QueuedOperation};
use crate::queue::SyncQueue;
use crate::status::{StatusBroadcaster, SyncStatus};
use crate::transport::ApiTransport;
use crate::SubscriptionId;

/// Store collection holding sync bookkeeping, keyed by `id`.
pub const SYNC_METADATA: &str = "sync_metadata";

const LAST_SYNC_KEY: &str = "last_sync";

/// Sync engine configuration.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Retry ceiling stamped into each operation at enqueue time
    pub max_retries: u32,
    /// Upper bound on queued operations
    pub max_queue_len: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            max_queue_len: 1000,
        }
    }
}

/// States of a drain pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EngineState {
    Idle,
    Draining,
}

/// Sync events that can be observed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SyncEvent {
    /// A drain pass started
    PassStarted { pending: usize },
    /// An operation was replayed and confirmed
    OperationSynced { id: OperationId },
    /// An operation failed and stays queued for the next pass
    OperationRetried { id: OperationId, retry_count: u32 },
    /// An operation was dropped after exhausting its retry budget.
    /// This is explicit, observable data loss.
    RetryExhausted { operation: QueuedOperation },
    /// A drain pass finished
    PassCompleted { summary: DrainSummary },
}

/// Aggregate outcome of one drain pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrainSummary {
    pub succeeded: usize,
    pub retried: usize,
    pub dropped: usize,
    /// True when connectivity was lost mid-pass; the remainder of the
    /// snapshot stays queued, unattempted.
    pub aborted: bool,
}

/// Main sync engine. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine").finish_non_exhaustive()
    }
}

struct EngineInner {
    store: Store,
    queue: SyncQueue,
    monitor: Arc<ConnectivityMonitor>,
    transport: Arc<dyn ApiTransport>,
    broadcaster: Arc<StatusBroadcaster>,
    /// Re-entrancy guard: only one drain pass may be active
    state: Mutex<EngineState>,
    event_tx: mpsc::UnboundedSender<SyncEvent>,
    event_rx: Mutex<Option<mpsc::UnboundedReceiver<SyncEvent>>>,
    trigger_tx: mpsc::UnboundedSender<()>,
    trigger_rx: Mutex<Option<mpsc::UnboundedReceiver<()>>>,
    shutdown_tx: Mutex<Option<mpsc::Sender<()>>>,
    monitor_subs: Mutex<Vec<SubscriptionId>>,
}

impl SyncEngine {
    /// Create a new sync engine.
    ///
    /// Reads the queue and persisted bookkeeping once, so a store that
    /// cannot be used surfaces `StorageUnavailable` here rather than
    /// silently behaving as always-online.
    pub async fn new(
        store: Store,
        monitor: Arc<ConnectivityMonitor>,
        transport: Arc<dyn ApiTransport>,
        config: SyncConfig,
    ) -> Result<Self> {
        let queue = SyncQueue::new(store.clone(), config.max_retries, config.max_queue_len);
        let pending = queue.len().await?;
        let last_sync = load_last_sync(&store).await?;

        let broadcaster = Arc::new(StatusBroadcaster::new(SyncStatus::new(
            monitor.is_online(),
            pending,
            last_sync,
        )));

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (trigger_tx, trigger_rx) = mpsc::unbounded_channel();

        Ok(Self {
            inner: Arc::new(EngineInner {
                store,
                queue,
                monitor,
                transport,
                broadcaster,
                state: Mutex::new(EngineState::Idle),
                event_tx,
                event_rx: Mutex::new(Some(event_rx)),
                trigger_tx,
                trigger_rx: Mutex::new(Some(trigger_rx)),
                shutdown_tx: Mutex::new(None),
                monitor_subs: Mutex::new(Vec::new()),
            }),
        })
    }

    /// Wire up connectivity triggers and spawn the drain loop.
    ///
    /// Triggers are: transition to online, foreground while already
    /// online, and explicit `force_sync` calls. A second call is a no-op.
    pub fn start(&self) {
        let Some(mut trigger_rx) = self.inner.trigger_rx.lock().take() else {
            tracing::warn!("sync engine already started");
            return;
        };

        let inner = &self.inner;
        let mut subs = inner.monitor_subs.lock();

        let broadcaster = inner.broadcaster.clone();
        let trigger = inner.trigger_tx.clone();
        subs.push(inner.monitor.on_online(move || {
            broadcaster.update(|s| s.is_online = true);
            let _ = trigger.send(());
        }));

        let broadcaster = inner.broadcaster.clone();
        subs.push(inner.monitor.on_offline(move || {
            broadcaster.update(|s| s.is_online = false);
        }));

        let trigger = inner.trigger_tx.clone();
        subs.push(inner.monitor.on_foreground(move || {
            let _ = trigger.send(());
        }));
        drop(subs);

        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
        *inner.shutdown_tx.lock() = Some(shutdown_tx);

        let engine = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    triggered = trigger_rx.recv() => {
                        if triggered.is_none() {
                            break;
                        }
                        if let Err(e) = engine.drain().await {
                            tracing::error!(error = %e, "drain pass failed");
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        tracing::info!("sync engine shutting down");
                        break;
                    }
                }
            }
        });
    }

    /// Stop the drain loop and detach from the connectivity monitor.
    pub async fn stop(&self) {
        let tx = self.inner.shutdown_tx.lock().take();
        if let Some(tx) = tx {
            let _ = tx.send(()).await;
        }
        for id in self.inner.monitor_subs.lock().drain(..) {
            self.inner.monitor.unsubscribe(id);
        }
    }

    /// Queue a mutation and, when online, trigger a pass for it.
    ///
    /// This is the path callers use when a direct request failed for lack
    /// of connectivity, or proactively while offline.
    pub async fn submit(
        &self,
        method: Method,
        endpoint: impl Into<String>,
        payload: Option<Value>,
    ) -> Result<OperationId> {
        let id = self.inner.queue.enqueue(method, endpoint, payload).await?;
        self.refresh_pending_count().await?;

        if self.inner.monitor.is_online() {
            let _ = self.inner.trigger_tx.send(());
        }
        Ok(id)
    }

    /// Run a drain pass immediately.
    ///
    /// Fails with `Offline` without starting a pass when the monitor
    /// reports offline. While another pass is active the call returns an
    /// empty summary; the running pass already covers the queued work.
    pub async fn force_sync(&self) -> Result<DrainSummary> {
        if !self.inner.monitor.is_online() {
            return Err(SyncError::Offline);
        }
        self.drain().await
    }

    /// Current status snapshot.
    pub fn status(&self) -> SyncStatus {
        self.inner.broadcaster.current()
    }

    /// The status broadcaster, for observers to subscribe to.
    pub fn broadcaster(&self) -> &Arc<StatusBroadcaster> {
        &self.inner.broadcaster
    }

    /// The underlying queue.
    pub fn queue(&self) -> &SyncQueue {
        &self.inner.queue
    }

    /// Claim the event stream. Yields `None` after the first call.
    pub fn events(&self) -> Option<mpsc::UnboundedReceiver<SyncEvent>> {
        self.inner.event_rx.lock().take()
    }

    /// One full drain pass over a snapshot of the queue.
    async fn drain(&self) -> Result<DrainSummary> {
        {
            let mut state = self.inner.state.lock();
            if *state == EngineState::Draining {
                // A pass in progress covers all queued work; the extra
                // trigger is dropped.
                return Ok(DrainSummary::default());
            }
            *state = EngineState::Draining;
        }

        self.inner.broadcaster.update(|s| s.is_syncing = true);
        let result = self.run_pass().await;
        *self.inner.state.lock() = EngineState::Idle;

        match result {
            Ok(summary) => {
                let completed_at = chrono::Utc::now().timestamp_millis();
                self.inner.broadcaster.update(|s| {
                    s.is_syncing = false;
                    s.last_sync_time = Some(completed_at);
                });
                if let Err(e) = self.persist_last_sync(completed_at).await {
                    tracing::warn!(error = %e, "failed to persist last-sync time");
                }

                tracing::info!(
                    succeeded = summary.succeeded,
                    retried = summary.retried,
                    dropped = summary.dropped,
                    aborted = summary.aborted,
                    "drain pass completed"
                );
                self.emit(SyncEvent::PassCompleted {
                    summary: summary.clone(),
                });
                Ok(summary)
            }
            Err(e) => {
                self.inner.broadcaster.update(|s| s.is_syncing = false);
                Err(e)
            }
        }
    }

    async fn run_pass(&self) -> Result<DrainSummary> {
        let mut snapshot = self.inner.queue.list_pending().await?;
        // The store does not guarantee order; enqueue order is the
        // contract, with the id as insertion-order tie-break.
        snapshot.sort_by(|a, b| {
            a.enqueued_at
                .cmp(&b.enqueued_at)
                .then_with(|| a.id.as_str().cmp(b.id.as_str()))
        });

        self.emit(SyncEvent::PassStarted {
            pending: snapshot.len(),
        });

        let total = snapshot.len();
        let mut attempted = 0usize;
        let mut summary = DrainSummary::default();

        for mut op in snapshot {
            if !self.inner.monitor.is_online() {
                tracing::info!(
                    remaining = total - attempted,
                    "connectivity lost mid-pass, leaving remainder queued"
                );
                summary.aborted = true;
                break;
            }
            attempted += 1;

            tracing::debug!(
                id = %op.id,
                method = %op.method,
                endpoint = %op.endpoint,
                attempt = op.retry_count + 1,
                "replaying operation"
            );

            match self
                .inner
                .transport
                .send(op.method, &op.endpoint, op.payload.as_ref())
                .await
            {
                Ok(_) => {
                    self.inner.queue.remove(&op.id).await?;
                    self.refresh_pending_count().await?;
                    summary.succeeded += 1;
                    self.emit(SyncEvent::OperationSynced { id: op.id.clone() });
                }
                Err(err) => {
                    let retry_count = self.inner.queue.bump_retry(&op.id).await?;
                    if retry_count >= op.max_retries {
                        self.inner.queue.remove(&op.id).await?;
                        self.refresh_pending_count().await?;
                        summary.dropped += 1;

                        op.retry_count = retry_count;
                        tracing::warn!(
                            id = %op.id,
                            method = %op.method,
                            endpoint = %op.endpoint,
                            retries = retry_count,
                            error = %err,
                            "retry budget exhausted, dropping operation"
                        );
                        self.emit(SyncEvent::RetryExhausted { operation: op });
                    } else {
                        summary.retried += 1;
                        tracing::debug!(
                            id = %op.id,
                            retry_count,
                            error = %err,
                            "replay failed, operation left queued"
                        );
                        self.emit(SyncEvent::OperationRetried {
                            id: op.id.clone(),
                            retry_count,
                        });
                    }
                }
            }
        }

        Ok(summary)
    }

    async fn refresh_pending_count(&self) -> Result<()> {
        let pending = self.inner.queue.len().await?;
        self.inner.broadcaster.update(|s| s.pending_count = pending);
        Ok(())
    }

    async fn persist_last_sync(&self, timestamp: i64) -> Result<()> {
        let mut record = herd_store::Record::new();
        record.insert("id".to_string(), json!(LAST_SYNC_KEY));
        record.insert("value".to_string(), json!(timestamp));
        self.inner.store.put(SYNC_METADATA, record).await?;
        Ok(())
    }

    fn emit(&self, event: SyncEvent) {
        let _ = self.inner.event_tx.send(event);
    }
}

async fn load_last_sync(store: &Store) -> Result<Option<i64>> {
    let record = store.get(SYNC_METADATA, LAST_SYNC_KEY).await?;
    Ok(record.and_then(|r| r.get("value").and_then(Value::as_i64)))
}

/// Builder for assembling a sync engine.
pub struct SyncEngineBuilder {
    store: Option<Store>,
    monitor: Option<Arc<ConnectivityMonitor>>,
    transport: Option<Arc<dyn ApiTransport>>,
    config: SyncConfig,
}

impl SyncEngineBuilder {
    pub fn new() -> Self {
        Self {
            store: None,
            monitor: None,
            transport: None,
            config: SyncConfig::default(),
        }
    }

    pub fn with_store(mut self, store: Store) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_monitor(mut self, monitor: Arc<ConnectivityMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn with_transport(mut self, transport: Arc<dyn ApiTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.config.max_retries = retries;
        self
    }

    pub fn with_max_queue_len(mut self, len: usize) -> Self {
        self.config.max_queue_len = len;
        self
    }

    pub async fn build(self) -> Result<SyncEngine> {
        let store = self
            .store
            .ok_or_else(|| SyncError::Config("a store is required".to_string()))?;
        let monitor = self
            .monitor
            .unwrap_or_else(|| Arc::new(ConnectivityMonitor::assume_online()));
        let transport = self
            .transport
            .ok_or_else(|| SyncError::Config("a transport is required".to_string()))?;

        SyncEngine::new(store, monitor, transport, self.config).await
    }
}

impl Default for SyncEngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectivity::ConnState;
    use crate::transport::MemoryTransport;
    use tempfile::TempDir;

    async fn engine_with(
        initial: ConnState,
    ) -> (TempDir, Arc<MemoryTransport>, Arc<ConnectivityMonitor>, SyncEngine) {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path()).await.unwrap();
        let monitor = Arc::new(ConnectivityMonitor::new(initial));
        let transport = Arc::new(MemoryTransport::new());

        let engine = SyncEngine::new(
            store,
            monitor.clone(),
            transport.clone(),
            SyncConfig::default(),
        )
        .await
        .unwrap();

        (dir, transport, monitor, engine)
    }

    #[tokio::test]
    async fn test_engine_starts_idle() {
        let (_dir, _transport, _monitor, engine) = engine_with(ConnState::Online).await;

        let status = engine.status();
        assert!(!status.is_syncing);
        assert!(status.is_online);
        assert_eq!(status.pending_count, 0);
        assert_eq!(status.last_sync_time, None);
    }

    #[tokio::test]
    async fn test_force_sync_offline_fails_immediately() {
        let (_dir, transport, _monitor, engine) = engine_with(ConnState::Offline).await;

        engine.submit(Method::Post, "/sessions", None).await.unwrap();
        let err = engine.force_sync().await.unwrap_err();
        assert!(matches!(err, SyncError::Offline));
        assert_eq!(transport.call_count(), 0);
        assert_eq!(engine.status().pending_count, 1);
    }

    #[tokio::test]
    async fn test_empty_drain_stamps_last_sync() {
        let (_dir, transport, _monitor, engine) = engine_with(ConnState::Online).await;

        let summary = engine.force_sync().await.unwrap();
        assert_eq!(summary, DrainSummary::default());
        assert_eq!(transport.call_count(), 0);

        let status = engine.status();
        assert!(status.last_sync_time.is_some());
        assert_eq!(status.pending_count, 0);
        assert!(!status.is_syncing);
    }

    #[tokio::test]
    async fn test_builder_requires_transport() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path()).await.unwrap();

        let err = SyncEngineBuilder::new()
            .with_store(store)
            .build()
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Config(_)));
    }

    #[tokio::test]
    async fn test_last_sync_survives_restart() {
        let dir = TempDir::new().unwrap();

        let first = {
            let store = Store::open(dir.path()).await.unwrap();
            let engine = SyncEngine::new(
                store,
                Arc::new(ConnectivityMonitor::assume_online()),
                Arc::new(MemoryTransport::new()),
                SyncConfig::default(),
            )
            .await
            .unwrap();
            engine.force_sync().await.unwrap();
            engine.status().last_sync_time.unwrap()
        };

        let store = Store::open(dir.path()).await.unwrap();
        let engine = SyncEngine::new(
            store,
            Arc::new(ConnectivityMonitor::assume_online()),
            Arc::new(MemoryTransport::new()),
            SyncConfig::default(),
        )
        .await
        .unwrap();
        assert_eq!(engine.status().last_sync_time, Some(first));
    }
}

/// Shared helpers for herdsync integration tests.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tempfile::TempDir;

use herd_store::Store;
use herd_sync::{
    ApiTransport, ConnState, ConnectivityMonitor, MemoryTransport, Method, SyncConfig,
    SyncEngine, TransportError, TransportResponse,
};

/// A fully wired engine over a temp store and a scripted transport.
pub struct TestHarness {
    pub dir: TempDir,
    pub store: Store,
    pub monitor: Arc<ConnectivityMonitor>,
    pub transport: Arc<MemoryTransport>,
    pub engine: SyncEngine,
}

pub async fn harness(initial: ConnState) -> TestHarness {
    harness_with(initial, SyncConfig::default()).await
}

pub async fn harness_with(initial: ConnState, config: SyncConfig) -> TestHarness {
    let dir = TempDir::new().expect("temp dir");
    let store = Store::open(dir.path()).await.expect("open store");
    let monitor = Arc::new(ConnectivityMonitor::new(initial));
    let transport = Arc::new(MemoryTransport::new());

    let engine = SyncEngine::new(
        store.clone(),
        monitor.clone(),
        transport.clone() as Arc<dyn ApiTransport>,
        config,
    )
    .await
    .expect("engine");

    TestHarness {
        dir,
        store,
        monitor,
        transport,
        engine,
    }
}

/// Transport that flips the monitor offline after a set number of calls,
/// for deterministic mid-pass connectivity loss.
pub struct DropConnectivityTransport {
    inner: MemoryTransport,
    monitor: Arc<ConnectivityMonitor>,
    go_offline_after: usize,
}

impl DropConnectivityTransport {
    pub fn new(monitor: Arc<ConnectivityMonitor>, go_offline_after: usize) -> Self {
        Self {
            inner: MemoryTransport::new(),
            monitor,
            go_offline_after,
        }
    }

    pub fn call_count(&self) -> usize {
        self.inner.call_count()
    }
}

#[async_trait]
impl ApiTransport for DropConnectivityTransport {
    async fn send(
        &self,
        method: Method,
        endpoint: &str,
        payload: Option<&Value>,
    ) -> Result<TransportResponse, TransportError> {
        let response = self.inner.send(method, endpoint, payload).await;
        if self.inner.call_count() >= self.go_offline_after {
            self.monitor.signal_offline();
        }
        response
    }
}

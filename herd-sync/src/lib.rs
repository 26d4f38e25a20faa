/// Offline-first sync core for herdsync
///
/// Persists mutating requests that could not be confirmed by the remote
/// backend, replays them in order when connectivity returns, and publishes
/// aggregate sync status for interested observers (typically a UI badge).

pub mod cache;
pub mod connectivity;
pub mod engine;
pub mod error;
pub mod operation;
pub mod queue;
pub mod status;
pub mod transport;

pub use cache::EntityCache;
pub use connectivity::{ConnState, ConnectivityMonitor};
pub use engine::{DrainSummary, SyncConfig, SyncEngine, SyncEngineBuilder, SyncEvent};
pub use error::{Result, SyncError};
pub use operation::{Method, OperationId, QueuedOperation};
pub use queue::SyncQueue;
pub use status::{StatusBroadcaster, SyncStatus};
pub use transport::{ApiTransport, MemoryTransport, TransportError, TransportResponse};

#[cfg(feature = "http-transport")]
pub use transport::HttpTransport;

/// Handle returned by subscription registries; pass back to unsubscribe.
pub type SubscriptionId = u64;

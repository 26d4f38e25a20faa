/// Sync queue
///
/// Typed wrapper over the store's pending-operations collection. The queue
/// itself makes no ordering promises; the engine sorts by `enqueued_at`
/// before replaying.

use serde_json::Value;

use herd_store::{Record, Store};

use crate::error::{Result, SyncError};
use crate::operation::{Method, OperationId, QueuedOperation};

/// Store collection holding not-yet-confirmed operations, keyed by `id`.
pub const PENDING_OPERATIONS: &str = "pending_operations";

/// Append-only log of not-yet-confirmed mutating operations.
#[derive(Clone)]
pub struct SyncQueue {
    store: Store,
    max_retries: u32,
    max_queue_len: usize,
}

impl SyncQueue {
    pub fn new(store: Store, max_retries: u32, max_queue_len: usize) -> Self {
        Self {
            store,
            max_retries,
            max_queue_len,
        }
    }

    /// Persist a new operation with a zero retry count. Returns its id.
    pub async fn enqueue(
        &self,
        method: Method,
        endpoint: impl Into<String>,
        payload: Option<Value>,
    ) -> Result<OperationId> {
        if self.store.len(PENDING_OPERATIONS).await? >= self.max_queue_len {
            return Err(SyncError::QueueFull(self.max_queue_len));
        }

        let op = QueuedOperation::new(method, endpoint, payload, self.max_retries);
        let id = op.id.clone();
        self.store.put(PENDING_OPERATIONS, to_record(&op)?).await?;

        tracing::debug!(id = %id, method = %op.method, endpoint = %op.endpoint, "operation queued");
        Ok(id)
    }

    /// All currently queued operations, in unspecified order.
    pub async fn list_pending(&self) -> Result<Vec<QueuedOperation>> {
        let records = self.store.get_all(PENDING_OPERATIONS).await?;
        records.into_iter().map(from_record).collect()
    }

    /// Delete a confirmed or abandoned operation.
    pub async fn remove(&self, id: &OperationId) -> Result<()> {
        self.store.delete(PENDING_OPERATIONS, id.as_str()).await?;
        Ok(())
    }

    /// Increment an operation's retry count and persist it; returns the
    /// new count for comparison against the operation's ceiling.
    pub async fn bump_retry(&self, id: &OperationId) -> Result<u32> {
        let record = self
            .store
            .get(PENDING_OPERATIONS, id.as_str())
            .await?
            .ok_or_else(|| herd_store::Error::NotFound(id.to_string()))?;

        let mut op = from_record(record)?;
        let count = op.mark_retry();
        self.store.put(PENDING_OPERATIONS, to_record(&op)?).await?;
        Ok(count)
    }

    /// Count of queued operations.
    pub async fn len(&self) -> Result<usize> {
        Ok(self.store.len(PENDING_OPERATIONS).await?)
    }

    /// Drop every queued operation. Pending mutations are lost.
    pub async fn clear(&self) -> Result<()> {
        self.store.clear(PENDING_OPERATIONS).await?;
        Ok(())
    }
}

fn to_record(op: &QueuedOperation) -> Result<Record> {
    match serde_json::to_value(op) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) | Err(_) => Err(herd_store::Error::InvalidArgument(
            "operation did not serialize to an object".to_string(),
        )
        .into()),
    }
}

fn from_record(record: Record) -> Result<QueuedOperation> {
    serde_json::from_value(Value::Object(record)).map_err(|e| {
        herd_store::Error::Corruption(format!("queued operation failed to parse: {}", e)).into()
    })
}

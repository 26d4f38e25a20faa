/// Queued operation types
///
/// A queued operation is the persisted record of a mutation that could not
/// be confirmed by the remote system at the time it was issued.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Request verb for a queued operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unique identifier for a queued operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OperationId(pub String);

impl OperationId {
    /// Generate a fresh id: enqueue timestamp plus a random suffix, so ids
    /// sort roughly by creation time and never collide within a queue.
    pub fn generate() -> Self {
        Self(format!(
            "{}-{}",
            chrono::Utc::now().timestamp_millis(),
            uuid::Uuid::new_v4()
        ))
    }

    /// Create from a string
    pub fn from_str(s: &str) -> Self {
        Self(s.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A single pending mutation awaiting confirmation by the remote system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedOperation {
    /// Unique ID for this operation
    pub id: OperationId,
    /// Request verb
    pub method: Method,
    /// Target resource path, opaque to the sync core
    pub endpoint: String,
    /// Associated data, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    /// When this operation was created (epoch millis); replay ordering key
    pub enqueued_at: i64,
    /// Number of failed send attempts so far
    pub retry_count: u32,
    /// Ceiling on retry_count; past it the operation is dropped
    pub max_retries: u32,
}

impl QueuedOperation {
    pub fn new(
        method: Method,
        endpoint: impl Into<String>,
        payload: Option<Value>,
        max_retries: u32,
    ) -> Self {
        Self {
            id: OperationId::generate(),
            method,
            endpoint: endpoint.into(),
            payload,
            enqueued_at: chrono::Utc::now().timestamp_millis(),
            retry_count: 0,
            max_retries,
        }
    }

    /// Record a failed replay attempt; returns the new count.
    pub fn mark_retry(&mut self) -> u32 {
        self.retry_count += 1;
        self.retry_count
    }

    /// True once the retry budget is spent and the operation must be
    /// dropped rather than retried again.
    pub fn retries_exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }
}

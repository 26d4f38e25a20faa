/// API transport boundary
///
/// The sync core replays operations through this trait and only needs
/// failures to be distinguishable from successes; it never inspects
/// status codes or response bodies.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;

use crate::operation::Method;

/// A single replay attempt failed: network error, remote rejection, or
/// timeout. Contained by the engine's retry/drop policy, never
/// propagated past it.
#[derive(Error, Debug, Clone)]
#[error("transport failure: {message}")]
pub struct TransportError {
    pub message: String,
}

impl TransportError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Successful transport response. The body is kept for callers that
/// replay interactively; the engine ignores it.
#[derive(Debug, Clone, Default)]
pub struct TransportResponse {
    pub body: Option<Value>,
}

/// Boundary to the remote backend.
#[async_trait]
pub trait ApiTransport: Send + Sync {
    async fn send(
        &self,
        method: Method,
        endpoint: &str,
        payload: Option<&Value>,
    ) -> Result<TransportResponse, TransportError>;
}

/// One observed transport invocation.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub method: Method,
    pub endpoint: String,
    pub payload: Option<Value>,
}

enum FailurePlan {
    Always,
    Times(u32),
}

/// Scripted in-process transport for tests and examples.
///
/// Records every invocation; unscripted endpoints succeed, scripted ones
/// fail according to their plan.
#[derive(Default)]
pub struct MemoryTransport {
    calls: Mutex<Vec<RecordedCall>>,
    failures: Mutex<HashMap<String, FailurePlan>>,
    latency: Mutex<Option<std::time::Duration>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every response, to exercise in-flight behavior.
    pub fn set_latency(&self, latency: std::time::Duration) {
        *self.latency.lock() = Some(latency);
    }

    /// Make every call to `endpoint` fail.
    pub fn fail_always(&self, endpoint: &str) {
        self.failures
            .lock()
            .insert(endpoint.to_string(), FailurePlan::Always);
    }

    /// Make the next `times` calls to `endpoint` fail, then succeed.
    pub fn fail_times(&self, endpoint: &str, times: u32) {
        self.failures
            .lock()
            .insert(endpoint.to_string(), FailurePlan::Times(times));
    }

    /// Every invocation observed so far, in call order.
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Invocations that targeted `endpoint`.
    pub fn calls_to(&self, endpoint: &str) -> Vec<RecordedCall> {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.endpoint == endpoint)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl ApiTransport for MemoryTransport {
    async fn send(
        &self,
        method: Method,
        endpoint: &str,
        payload: Option<&Value>,
    ) -> Result<TransportResponse, TransportError> {
        self.calls.lock().push(RecordedCall {
            method,
            endpoint: endpoint.to_string(),
            payload: payload.cloned(),
        });

        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let mut failures = self.failures.lock();
        match failures.get_mut(endpoint) {
            Some(FailurePlan::Always) => Err(TransportError::new("scripted failure")),
            Some(FailurePlan::Times(remaining)) => {
                if *remaining > 0 {
                    *remaining -= 1;
                    Err(TransportError::new("scripted transient failure"))
                } else {
                    Ok(TransportResponse::default())
                }
            }
            None => Ok(TransportResponse::default()),
        }
    }
}

/// HTTP transport backed by reqwest.
///
/// Non-2xx responses and timeouts surface as `TransportError` and flow
/// through the engine's ordinary retry/drop path.
#[cfg(feature = "http-transport")]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
}

#[cfg(feature = "http-transport")]
impl HttpTransport {
    pub fn new(
        base_url: impl Into<String>,
        timeout: std::time::Duration,
    ) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::new(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[cfg(feature = "http-transport")]
#[async_trait]
impl ApiTransport for HttpTransport {
    async fn send(
        &self,
        method: Method,
        endpoint: &str,
        payload: Option<&Value>,
    ) -> Result<TransportResponse, TransportError> {
        let url = format!("{}{}", self.base_url, endpoint);
        let http_method = match method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Patch => reqwest::Method::PATCH,
            Method::Delete => reqwest::Method::DELETE,
        };

        let mut request = self.client.request(http_method, &url);
        if let Some(payload) = payload {
            request = request.json(payload);
        }

        let response = request
            .send()
            .await
            .map_err(|e| TransportError::new(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::new(format!(
                "remote rejected {} {}: {}",
                method, endpoint, status
            )));
        }

        let body = response.json::<Value>().await.ok();
        Ok(TransportResponse { body })
    }
}

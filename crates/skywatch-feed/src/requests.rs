//! Correlation of outbound requests with inbound responses.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;

use crate::error::FeedError;

type Reply = Result<serde_json::Value, FeedError>;

/// Pending requests keyed by client-generated correlation id.
#[derive(Clone, Default)]
pub struct RequestTracker {
    pending: Arc<Mutex<HashMap<String, oneshot::Sender<Reply>>>>,
}

/// A registered request awaiting its response.
pub struct PendingRequest {
    pub request_id: String,
    rx: oneshot::Receiver<Reply>,
}

impl RequestTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self) -> PendingRequest {
        let request_id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        if let Ok(mut pending) = self.pending.lock() {
            pending.insert(request_id.clone(), tx);
        }
        PendingRequest { request_id, rx }
    }

    /// Deliver a response. Returns false for unknown or already settled ids.
    pub fn resolve(&self, request_id: &str, data: serde_json::Value, error: Option<String>) -> bool {
        let Some(tx) = self.take(request_id) else {
            tracing::debug!("Dropping response for unknown request {}", request_id);
            return false;
        };
        let reply = match error {
            Some(message) => Err(FeedError::Remote(message)),
            None => Ok(data),
        };
        tx.send(reply).is_ok()
    }

    pub fn cancel(&self, request_id: &str) {
        self.take(request_id);
    }

    /// Reject every pending request, used when the connection drops.
    pub fn fail_all(&self) {
        let drained: Vec<oneshot::Sender<Reply>> = match self.pending.lock() {
            Ok(mut pending) => pending.drain().map(|(_, tx)| tx).collect(),
            Err(_) => return,
        };
        for tx in drained {
            let _ = tx.send(Err(FeedError::Disconnected));
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }

    /// Wait for the response, rejecting with a timeout error when it does
    /// not arrive within `timeout`.
    pub async fn wait(
        &self,
        request: PendingRequest,
        request_type: &str,
        timeout: Duration,
    ) -> Result<serde_json::Value, FeedError> {
        let PendingRequest { request_id, rx } = request;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(FeedError::Disconnected),
            Err(_) => {
                self.cancel(&request_id);
                Err(FeedError::Timeout {
                    request_type: request_type.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    fn take(&self, request_id: &str) -> Option<oneshot::Sender<Reply>> {
        self.pending.lock().ok()?.remove(request_id)
    }
}

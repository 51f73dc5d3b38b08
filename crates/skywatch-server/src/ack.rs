//! Acknowledgment state in two layers.
//!
//! The intent layer records what the user acknowledged and is authoritative
//! for display. The confirmed layer only changes when the backend accepts
//! the acknowledgment. A failed remote call never rolls back intent, so the
//! two layers are eventually consistent at best.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::BoxFuture;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AckError {
    #[error("unknown safety event: {0}")]
    UnknownEvent(String),
    #[error("acknowledgment request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("acknowledgment rejected with status {0}")]
    Rejected(u16),
}

/// Remote side of an acknowledgment.
pub trait AckTransport: Send + Sync {
    fn acknowledge<'a>(&'a self, event_id: &'a str) -> BoxFuture<'a, Result<(), AckError>>;
}

/// Posts acknowledgments to the backend that raised the hazard.
pub struct HttpAckClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpAckClient {
    pub fn new(base_url: &str) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(5))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, event_id: &str) -> String {
        format!("{}/api/v1/safety/events/{}/acknowledge", self.base_url, event_id)
    }
}

impl AckTransport for HttpAckClient {
    fn acknowledge<'a>(&'a self, event_id: &'a str) -> BoxFuture<'a, Result<(), AckError>> {
        Box::pin(async move {
            let response = self.client.post(self.url(event_id)).send().await?;
            let status = response.status();
            if status.is_success() {
                Ok(())
            } else {
                Err(AckError::Rejected(status.as_u16()))
            }
        })
    }
}

/// Used when no backend is configured; every acknowledgment stays local.
pub struct LocalOnlyTransport;

impl AckTransport for LocalOnlyTransport {
    fn acknowledge<'a>(&'a self, event_id: &'a str) -> BoxFuture<'a, Result<(), AckError>> {
        Box::pin(async move {
            tracing::debug!("No acknowledgment backend configured, keeping {} local", event_id);
            Ok(())
        })
    }
}

#[derive(Clone)]
pub struct AcknowledgmentStore {
    intent: Arc<DashMap<String, DateTime<Utc>>>,
    confirmed: Arc<DashMap<String, DateTime<Utc>>>,
    transport: Arc<dyn AckTransport>,
}

impl AcknowledgmentStore {
    pub fn new(transport: Arc<dyn AckTransport>) -> Self {
        Self {
            intent: Arc::new(DashMap::new()),
            confirmed: Arc::new(DashMap::new()),
            transport,
        }
    }

    /// Record the user's intent and start the remote call in the background.
    ///
    /// Returns false when the event was already acknowledged; no second
    /// remote call is made in that case.
    pub fn acknowledge(&self, event_id: &str) -> bool {
        match self.intent.entry(event_id.to_string()) {
            Entry::Occupied(_) => return false,
            Entry::Vacant(slot) => {
                slot.insert(Utc::now());
            }
        }

        let transport = self.transport.clone();
        let confirmed = self.confirmed.clone();
        let event_id = event_id.to_string();
        tokio::spawn(async move {
            match transport.acknowledge(&event_id).await {
                Ok(()) => {
                    confirmed.insert(event_id, Utc::now());
                }
                Err(err) => {
                    tracing::warn!("Remote acknowledgment of {} failed, keeping local state: {}", event_id, err);
                }
            }
        });
        true
    }

    pub fn is_acknowledged(&self, event_id: &str) -> bool {
        self.intent.contains_key(event_id)
    }

    pub fn is_confirmed(&self, event_id: &str) -> bool {
        self.confirmed.contains_key(event_id)
    }

    /// Acknowledged locally but not yet accepted by the backend.
    pub fn unconfirmed(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .intent
            .iter()
            .filter(|entry| !self.confirmed.contains_key(entry.key()))
            .map(|entry| entry.key().clone())
            .collect();
        ids.sort();
        ids
    }

    /// Drop both layers for an event that has re-armed.
    pub fn clear(&self, event_id: &str) {
        self.intent.remove(event_id);
        self.confirmed.remove(event_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Flaky {
        calls: AtomicUsize,
        fail: bool,
    }

    impl AckTransport for Flaky {
        fn acknowledge<'a>(&'a self, _event_id: &'a str) -> BoxFuture<'a, Result<(), AckError>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let fail = self.fail;
            Box::pin(async move {
                if fail {
                    Err(AckError::Rejected(503))
                } else {
                    Ok(())
                }
            })
        }
    }

    async fn settle() {
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_success_confirms() {
        let transport = Arc::new(Flaky { calls: AtomicUsize::new(0), fail: false });
        let store = AcknowledgmentStore::new(transport.clone());

        assert!(store.acknowledge("evt-1"));
        assert!(store.is_acknowledged("evt-1"));
        settle().await;
        assert!(store.is_confirmed("evt-1"));
        assert!(store.unconfirmed().is_empty());

        // Idempotent: no second remote call
        assert!(!store.acknowledge("evt-1"));
        settle().await;
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failure_keeps_local_intent() {
        let store = AcknowledgmentStore::new(Arc::new(Flaky { calls: AtomicUsize::new(0), fail: true }));
        assert!(store.acknowledge("evt-2"));
        settle().await;
        assert!(store.is_acknowledged("evt-2"));
        assert!(!store.is_confirmed("evt-2"));
        assert_eq!(store.unconfirmed(), vec!["evt-2".to_string()]);

        store.clear("evt-2");
        assert!(!store.is_acknowledged("evt-2"));
    }

    #[test]
    fn test_http_url() {
        let client = HttpAckClient::new("http://backend:5000/");
        assert_eq!(client.url("evt-9"), "http://backend:5000/api/v1/safety/events/evt-9/acknowledge");
    }
}

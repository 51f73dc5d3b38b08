//! The live telemetry set.
//!
//! Feed messages mutate a map under a lock; readers get an immutable
//! `Arc<TelemetrySnapshot>` cut under the same lock and cached until the
//! next mutation bumps the version.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use skywatch_core::{normalize_hex, ReferencePoint, TelemetryRecord, TelemetrySnapshot};
use skywatch_feed::FeedMessage;
use tokio::sync::watch;

#[derive(Default)]
struct Inner {
    records: HashMap<String, TelemetryRecord>,
    reference: Option<ReferencePoint>,
    version: u64,
    cached: Option<Arc<TelemetrySnapshot>>,
}

pub struct TelemetryStore {
    inner: RwLock<Inner>,
    version_tx: watch::Sender<u64>,
}

impl Default for TelemetryStore {
    fn default() -> Self {
        Self::new(None)
    }
}

impl TelemetryStore {
    pub fn new(reference: Option<ReferencePoint>) -> Self {
        let (version_tx, _) = watch::channel(0);
        Self {
            inner: RwLock::new(Inner {
                reference,
                ..Inner::default()
            }),
            version_tx,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(|p| p.into_inner())
    }

    /// Apply a telemetry message. Returns false for messages that carry no
    /// telemetry (hazards, responses).
    pub fn apply(&self, message: &FeedMessage) -> bool {
        match message {
            FeedMessage::Snapshot { aircraft, reference } => {
                self.replace(aircraft.iter().cloned(), *reference);
            }
            FeedMessage::Update { aircraft } | FeedMessage::New { aircraft } => {
                self.upsert(aircraft.iter().cloned());
            }
            FeedMessage::Remove { hex } => {
                self.remove(hex);
            }
            FeedMessage::Hazard(_) | FeedMessage::Response { .. } => return false,
        }
        true
    }

    /// Replace the whole set. A snapshot without a reference keeps the
    /// configured one.
    pub fn replace(
        &self,
        records: impl IntoIterator<Item = TelemetryRecord>,
        reference: Option<ReferencePoint>,
    ) {
        let mut inner = self.write();
        inner.records = records
            .into_iter()
            .map(|mut r| {
                r.hex = normalize_hex(&r.hex);
                r
            })
            .filter(|r| !r.hex.is_empty())
            .map(|r| (r.hex.clone(), r))
            .collect();
        if reference.is_some() {
            inner.reference = reference;
        }
        self.bump(&mut inner);
    }

    /// Insert or overwrite records by identifier.
    pub fn upsert(&self, records: impl IntoIterator<Item = TelemetryRecord>) {
        let mut inner = self.write();
        for mut record in records {
            record.hex = normalize_hex(&record.hex);
            if record.hex.is_empty() {
                continue;
            }
            inner.records.insert(record.hex.clone(), record);
        }
        self.bump(&mut inner);
    }

    pub fn remove(&self, hexes: &[String]) {
        let mut inner = self.write();
        let before = inner.records.len();
        for hex in hexes {
            inner.records.remove(&normalize_hex(hex));
        }
        if inner.records.len() != before {
            self.bump(&mut inner);
        }
    }

    fn bump(&self, inner: &mut Inner) {
        inner.version += 1;
        inner.cached = None;
        self.version_tx.send_replace(inner.version);
    }

    /// Immutable view of the current set.
    pub fn snapshot(&self) -> Arc<TelemetrySnapshot> {
        {
            let inner = self.read();
            if let Some(cached) = &inner.cached {
                return cached.clone();
            }
        }
        let mut inner = self.write();
        if let Some(cached) = &inner.cached {
            return cached.clone();
        }
        let snapshot = Arc::new(TelemetrySnapshot::new(
            inner.version,
            inner.reference,
            inner.records.clone(),
        ));
        inner.cached = Some(snapshot.clone());
        snapshot
    }

    pub fn get(&self, hex: &str) -> Option<TelemetryRecord> {
        self.read().records.get(&normalize_hex(hex)).cloned()
    }

    pub fn version(&self) -> u64 {
        self.read().version
    }

    pub fn len(&self) -> usize {
        self.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().records.is_empty()
    }

    /// Wakes on every version bump.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.version_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(hex: &str, alt: f64) -> TelemetryRecord {
        let mut r = TelemetryRecord::new(hex);
        r.alt_baro = Some(alt);
        r
    }

    #[test]
    fn test_snapshot_is_immutable_and_cached() {
        let store = TelemetryStore::default();
        store.upsert([record("a1", 1000.0)]);

        let first = store.snapshot();
        assert!(Arc::ptr_eq(&first, &store.snapshot()));

        store.upsert([record("A1", 2000.0), record("b2", 500.0)]);
        let second = store.snapshot();
        assert_eq!(first.len(), 1);
        assert_eq!(first.get("A1").unwrap().alt_baro, Some(1000.0));
        assert_eq!(second.len(), 2);
        assert_eq!(second.get("a1").unwrap().alt_baro, Some(2000.0));
        assert!(second.version > first.version);
    }

    #[test]
    fn test_apply_feed_messages() {
        let store = TelemetryStore::default();
        let snapshot = FeedMessage::parse(
            r#"{"type":"snapshot","aircraft":[{"hex":"a1"},{"hex":"b2"}],"reference":{"lat":1.0,"lon":2.0}}"#,
        )
        .unwrap();
        assert!(store.apply(&snapshot));
        assert_eq!(store.len(), 2);
        assert!(store.snapshot().reference.is_some());

        let new = FeedMessage::parse(r#"{"type":"new","aircraft":[{"hex":"c3"}]}"#).unwrap();
        store.apply(&new);
        let remove = FeedMessage::parse(r#"{"type":"remove","hex":["a1","zz"]}"#).unwrap();
        store.apply(&remove);

        let snap = store.snapshot();
        assert!(snap.get("A1").is_none());
        assert!(snap.get("C3").is_some());
        assert_eq!(snap.len(), 2);

        let hazard =
            FeedMessage::parse(r#"{"type":"hazard","event_type":"tcas_ta","hex":"b2"}"#).unwrap();
        let version = store.version();
        assert!(!store.apply(&hazard));
        assert_eq!(store.version(), version);
    }

    #[test]
    fn test_snapshot_drops_blank_identifiers() {
        let store = TelemetryStore::default();
        let message = FeedMessage::parse(
            r#"{"type":"snapshot","aircraft":[{"hex":"a1"},{"hex":"  "},{"hex":""}]}"#,
        )
        .unwrap();
        store.apply(&message);
        assert_eq!(store.len(), 1);
        assert!(store.snapshot().get("").is_none());

        store.replace([record(" ", 100.0), record("b2", 200.0)], None);
        let snap = store.snapshot();
        assert_eq!(snap.len(), 1);
        assert!(snap.get("B2").is_some());
    }

    #[test]
    fn test_remove_unknown_keeps_version() {
        let store = TelemetryStore::default();
        store.upsert([record("a1", 0.0)]);
        let version = store.version();
        store.remove(&["nope".to_string()]);
        assert_eq!(store.version(), version);
    }

    #[tokio::test]
    async fn test_subscribers_see_bumps() {
        let store = TelemetryStore::default();
        let mut rx = store.subscribe();
        store.upsert([record("a1", 0.0)]);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), 1);
    }
}

//! Safety events: classification and the active/history log.
//!
//! Events come from two sources: hazards pushed by the backend (already
//! classified) and emergencies detected locally from telemetry. Both are
//! normalized into [`SafetyEvent`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use crate::models::{emergency_squawk, normalize_hex, TelemetryRecord, TelemetrySnapshot};

/// How long an unacknowledged event counts as active.
pub const ACTIVE_WINDOW: Duration = Duration::from_secs(60);
/// Events kept after leaving the active window.
pub const HISTORY_CAPACITY: usize = 100;

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[serde(alias = "info")]
    Low,
    #[default]
    Warning,
    Critical,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SafetyEventType {
    #[serde(alias = "proximity")]
    ProximityConflict,
    TcasTa,
    TcasRa,
    RapidDescent,
    AltitudeDeviation,
    Emergency,
    #[default]
    #[serde(other)]
    Other,
}

impl SafetyEventType {
    fn slug(self) -> &'static str {
        match self {
            SafetyEventType::ProximityConflict => "proximity_conflict",
            SafetyEventType::TcasTa => "tcas_ta",
            SafetyEventType::TcasRa => "tcas_ra",
            SafetyEventType::RapidDescent => "rapid_descent",
            SafetyEventType::AltitudeDeviation => "altitude_deviation",
            SafetyEventType::Emergency => "emergency",
            SafetyEventType::Other => "other",
        }
    }
}

/// A detected hazardous condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyEvent {
    pub id: String,
    pub event_type: SafetyEventType,
    pub severity: Severity,
    pub hex: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hex_2: Option<String>,
    #[serde(default)]
    pub details: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub acknowledged: bool,
}

impl SafetyEvent {
    /// Notification identity for this event.
    ///
    /// Emergencies are keyed by aircraft and squawk so one occurrence only
    /// notifies once; other hazards by event id.
    pub fn dedup_tag(&self) -> String {
        if self.event_type == SafetyEventType::Emergency {
            let squawk = self
                .details
                .get("squawk")
                .and_then(|v| v.as_str())
                .unwrap_or("flag");
            format!("emergency-{}-{}", self.hex, squawk)
        } else {
            format!("safety-{}", self.id)
        }
    }

    pub fn involves(&self, hex: &str) -> bool {
        let hex = normalize_hex(hex);
        self.hex == hex || self.hex_2.as_deref() == Some(hex.as_str())
    }

    pub fn title(&self) -> String {
        match self.event_type {
            SafetyEventType::Emergency => {
                let label = self
                    .details
                    .get("label")
                    .and_then(|v| v.as_str())
                    .unwrap_or("Emergency");
                format!("{label}: {}", self.display_name())
            }
            other => match &self.hex_2 {
                Some(second) => format!("{} {} / {}", other.slug(), self.hex, second),
                None => format!("{} {}", other.slug(), self.hex),
            },
        }
    }

    fn display_name(&self) -> String {
        self.details
            .get("callsign")
            .and_then(|v| v.as_str())
            .filter(|s| !s.trim().is_empty())
            .map(|s| s.trim().to_string())
            .unwrap_or_else(|| self.hex.clone())
    }
}

/// Hazard message pushed by the backend detector.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct HazardPush {
    #[serde(default, alias = "event_id")]
    pub id: Option<String>,
    pub event_type: SafetyEventType,
    #[serde(default)]
    pub severity: Severity,
    #[serde(default, alias = "icao")]
    pub hex: Option<String>,
    #[serde(default, alias = "icao_2")]
    pub hex_2: Option<String>,
    #[serde(default)]
    pub details: serde_json::Value,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Normalize a backend hazard push.
///
/// Returns `None` when the push names no participant. A missing id is
/// synthesized from the type and the sorted participants, so repeated
/// pushes of the same pair map to the same event.
pub fn classify_hazard(push: HazardPush) -> Option<SafetyEvent> {
    let mut participants: Vec<String> = [push.hex.as_deref(), push.hex_2.as_deref()]
        .into_iter()
        .flatten()
        .map(normalize_hex)
        .filter(|h| !h.is_empty())
        .collect();
    if participants.is_empty() {
        return None;
    }
    participants.dedup();

    let id = push
        .id
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| {
            let mut sorted = participants.clone();
            sorted.sort();
            format!("{}-{}", push.event_type.slug(), sorted.join("-"))
        });

    let mut iter = participants.into_iter();
    let hex = iter.next()?;
    Some(SafetyEvent {
        id,
        event_type: push.event_type,
        severity: push.severity,
        hex,
        hex_2: iter.next(),
        details: push.details,
        timestamp: push.timestamp.unwrap_or_else(Utc::now),
        acknowledged: false,
    })
}

/// Local synthesis: an emergency squawk or emergency flag is critical.
pub fn classify_emergency(record: &TelemetryRecord, now: DateTime<Utc>) -> Option<SafetyEvent> {
    if !record.has_emergency() {
        return None;
    }
    let squawk = record.emergency_squawk();
    let key = squawk.unwrap_or("flag");
    let label = squawk.and_then(emergency_squawk).unwrap_or("Emergency");

    Some(SafetyEvent {
        id: format!("emergency-{}-{}", record.hex, key),
        event_type: SafetyEventType::Emergency,
        severity: Severity::Critical,
        hex: record.hex.clone(),
        hex_2: None,
        details: serde_json::json!({
            "squawk": key,
            "label": label,
            "callsign": record.callsign(),
            "altitude_ft": record.altitude_ft(),
        }),
        timestamp: now,
        acknowledged: false,
    })
}

/// Every emergency currently visible in a snapshot.
pub fn classify_snapshot(snapshot: &TelemetrySnapshot, now: DateTime<Utc>) -> Vec<SafetyEvent> {
    let mut events: Vec<SafetyEvent> = snapshot
        .records()
        .filter_map(|r| classify_emergency(r, now))
        .collect();
    events.sort_by(|a, b| a.id.cmp(&b.id));
    events
}

#[derive(Debug, Clone)]
struct TrackedEvent {
    event: SafetyEvent,
    observed_at: Instant,
}

/// Recent events plus a bounded history.
///
/// An event is active while unacknowledged and observed within
/// [`ACTIVE_WINDOW`]. Aged events move to history, newest first.
#[derive(Debug, Default)]
pub struct SafetyEventLog {
    recent: HashMap<String, TrackedEvent>,
    history: VecDeque<SafetyEvent>,
}

impl SafetyEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert, or re-arm an event already known under the same id.
    pub fn record(&mut self, mut event: SafetyEvent, observed_at: Instant) {
        self.history.retain(|e| e.id != event.id);
        event.acknowledged = false;
        self.recent.insert(
            event.id.clone(),
            TrackedEvent { event, observed_at },
        );
    }

    /// Refresh the observation time of a recent event, keeping its
    /// acknowledgment. Returns false when the event is not recent.
    pub fn touch(&mut self, id: &str, observed_at: Instant) -> bool {
        match self.recent.get_mut(id) {
            Some(tracked) => {
                tracked.observed_at = tracked.observed_at.max(observed_at);
                true
            }
            None => false,
        }
    }

    /// Bring an aged event back into the recent set. The acknowledgment of
    /// the history copy carries over. Returns false when the id is not in
    /// history.
    pub fn reactivate(&mut self, mut event: SafetyEvent, observed_at: Instant) -> bool {
        let Some(pos) = self.history.iter().position(|e| e.id == event.id) else {
            return false;
        };
        if let Some(previous) = self.history.remove(pos) {
            event.acknowledged = previous.acknowledged;
        }
        self.recent.insert(
            event.id.clone(),
            TrackedEvent { event, observed_at },
        );
        true
    }

    pub fn contains(&self, id: &str) -> bool {
        self.recent.contains_key(id) || self.history.iter().any(|e| e.id == id)
    }

    pub fn get(&self, id: &str) -> Option<&SafetyEvent> {
        self.recent
            .get(id)
            .map(|t| &t.event)
            .or_else(|| self.history.iter().find(|e| e.id == id))
    }

    /// Mark acknowledged. Returns false when unknown or already acknowledged.
    pub fn acknowledge(&mut self, id: &str) -> bool {
        let target = match self.recent.get_mut(id) {
            Some(tracked) => Some(&mut tracked.event),
            None => self.history.iter_mut().find(|e| e.id == id),
        };
        match target {
            Some(event) if !event.acknowledged => {
                event.acknowledged = true;
                true
            }
            _ => false,
        }
    }

    pub fn is_active(&self, id: &str, now: Instant) -> bool {
        self.recent
            .get(id)
            .is_some_and(|t| !t.event.acknowledged && within_window(t.observed_at, now))
    }

    /// Active events, most severe first.
    pub fn active(&self, now: Instant) -> Vec<SafetyEvent> {
        let mut events: Vec<SafetyEvent> = self
            .recent
            .values()
            .filter(|t| !t.event.acknowledged && within_window(t.observed_at, now))
            .map(|t| t.event.clone())
            .collect();
        events.sort_by(|a, b| b.severity.cmp(&a.severity).then(b.timestamp.cmp(&a.timestamp)));
        events
    }

    pub fn max_active_severity(&self, now: Instant) -> Option<Severity> {
        self.recent
            .values()
            .filter(|t| !t.event.acknowledged && within_window(t.observed_at, now))
            .map(|t| t.event.severity)
            .max()
    }

    /// When the next active event leaves the window.
    pub fn next_expiry(&self, now: Instant) -> Option<Instant> {
        self.recent
            .values()
            .filter(|t| !t.event.acknowledged && within_window(t.observed_at, now))
            .map(|t| t.observed_at + ACTIVE_WINDOW)
            .min()
    }

    /// Move aged events into history. Returns the ids that moved.
    pub fn prune(&mut self, now: Instant) -> Vec<String> {
        let aged: Vec<String> = self
            .recent
            .iter()
            .filter(|(_, t)| !within_window(t.observed_at, now))
            .map(|(id, _)| id.clone())
            .collect();

        let mut moved: Vec<TrackedEvent> = aged
            .iter()
            .filter_map(|id| self.recent.remove(id))
            .collect();
        moved.sort_by_key(|t| t.observed_at);
        for tracked in moved {
            self.history.push_front(tracked.event);
        }
        self.history.truncate(HISTORY_CAPACITY);
        aged
    }

    /// Events that left the active window, newest first.
    pub fn history(&self) -> Vec<SafetyEvent> {
        self.history.iter().cloned().collect()
    }

    /// Events still inside the window, acknowledged or not, newest first.
    pub fn recent(&self) -> Vec<SafetyEvent> {
        let mut events: Vec<&TrackedEvent> = self.recent.values().collect();
        events.sort_by(|a, b| b.observed_at.cmp(&a.observed_at));
        events.into_iter().map(|t| t.event.clone()).collect()
    }
}

fn within_window(observed_at: Instant, now: Instant) -> bool {
    now.saturating_duration_since(observed_at) < ACTIVE_WINDOW
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn push(value: serde_json::Value) -> HazardPush {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_classify_hazard_pair() {
        let event = classify_hazard(push(json!({
            "event_type": "proximity_conflict",
            "severity": "warning",
            "icao": "def456",
            "icao_2": "abc123",
            "details": {"horizontal_nm": 0.8}
        })))
        .unwrap();
        assert_eq!(event.id, "proximity_conflict-ABC123-DEF456");
        assert_eq!(event.hex, "DEF456");
        assert_eq!(event.hex_2.as_deref(), Some("ABC123"));
        assert_eq!(event.severity, Severity::Warning);
        assert_eq!(event.dedup_tag(), "safety-proximity_conflict-ABC123-DEF456");
        assert!(event.involves("abc123"));
    }

    #[test]
    fn test_classify_hazard_keeps_backend_id() {
        let event = classify_hazard(push(json!({
            "event_id": "evt-9",
            "event_type": "tcas_ra",
            "severity": "critical",
            "hex": "a1"
        })))
        .unwrap();
        assert_eq!(event.id, "evt-9");
        assert_eq!(event.dedup_tag(), "safety-evt-9");
    }

    #[test]
    fn test_classify_hazard_without_participant() {
        assert!(classify_hazard(push(json!({"event_type": "tcas_ta", "hex": "  "}))).is_none());
    }

    #[test]
    fn test_unknown_severity_alias() {
        let p = push(json!({"event_type": "something_new", "severity": "info", "hex": "a1"}));
        assert_eq!(p.severity, Severity::Low);
        assert_eq!(p.event_type, SafetyEventType::Other);
    }

    #[test]
    fn test_classify_emergency_squawk() {
        let mut record = TelemetryRecord::new("a1b2c3");
        record.squawk = Some("7700".into());
        record.flight = Some("SWA12".into());
        let event = classify_emergency(&record, Utc::now()).unwrap();
        assert_eq!(event.severity, Severity::Critical);
        assert_eq!(event.event_type, SafetyEventType::Emergency);
        assert_eq!(event.dedup_tag(), "emergency-A1B2C3-7700");
        assert_eq!(event.title(), "Emergency: SWA12");

        record.squawk = Some("1200".into());
        assert!(classify_emergency(&record, Utc::now()).is_none());

        record.emergency = true;
        let flagged = classify_emergency(&record, Utc::now()).unwrap();
        assert_eq!(flagged.dedup_tag(), "emergency-A1B2C3-flag");
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Critical > Severity::Warning);
        assert!(Severity::Warning > Severity::Low);
    }

    fn event(id: &str, severity: Severity) -> SafetyEvent {
        SafetyEvent {
            id: id.to_string(),
            event_type: SafetyEventType::ProximityConflict,
            severity,
            hex: "A1".into(),
            hex_2: None,
            details: serde_json::Value::Null,
            timestamp: Utc::now(),
            acknowledged: false,
        }
    }

    #[test]
    fn test_active_window_and_history() {
        let start = Instant::now();
        let mut log = SafetyEventLog::new();
        log.record(event("a", Severity::Low), start);
        log.record(event("b", Severity::Critical), start + Duration::from_secs(30));

        let at_40 = start + Duration::from_secs(40);
        assert_eq!(log.max_active_severity(at_40), Some(Severity::Critical));
        assert_eq!(log.next_expiry(at_40), Some(start + ACTIVE_WINDOW));

        let at_61 = start + Duration::from_secs(61);
        assert_eq!(log.active(at_61).len(), 1);
        assert_eq!(log.prune(at_61), vec!["a".to_string()]);
        assert_eq!(log.history().len(), 1);
        assert!(log.contains("a"));
        assert!(!log.is_active("a", at_61));

        assert!(log.acknowledge("b"));
        assert!(!log.acknowledge("b"));
        assert_eq!(log.max_active_severity(at_61), None);
    }

    #[test]
    fn test_history_is_bounded() {
        let start = Instant::now();
        let mut log = SafetyEventLog::new();
        for i in 0..(HISTORY_CAPACITY + 20) {
            log.record(event(&format!("e{i}"), Severity::Low), start + Duration::from_millis(i as u64));
        }
        log.prune(start + Duration::from_secs(120));
        let history = log.history();
        assert_eq!(history.len(), HISTORY_CAPACITY);
        // Newest first
        assert_eq!(history[0].id, format!("e{}", HISTORY_CAPACITY + 19));
    }

    #[test]
    fn test_record_rearms_from_history() {
        let start = Instant::now();
        let mut log = SafetyEventLog::new();
        log.record(event("a", Severity::Warning), start);
        log.acknowledge("a");
        log.prune(start + Duration::from_secs(90));
        assert_eq!(log.history().len(), 1);

        let later = start + Duration::from_secs(100);
        log.record(event("a", Severity::Warning), later);
        assert!(log.history().is_empty());
        assert!(log.is_active("a", later));
    }

    #[test]
    fn test_touch_keeps_acknowledgment() {
        let start = Instant::now();
        let mut log = SafetyEventLog::new();
        log.record(event("a", Severity::Critical), start);
        log.acknowledge("a");

        let later = start + Duration::from_secs(50);
        assert!(log.touch("a", later));
        assert!(log.get("a").unwrap().acknowledged);
        // Still recent well past the original window
        assert!(log.prune(start + Duration::from_secs(100)).is_empty());
        assert!(!log.touch("missing", later));
    }

    #[test]
    fn test_reactivate_restores_aged_event() {
        let start = Instant::now();
        let mut log = SafetyEventLog::new();
        log.record(event("open", Severity::Critical), start);
        log.record(event("seen", Severity::Warning), start);
        log.acknowledge("seen");
        log.prune(start + Duration::from_secs(61));
        assert!(log.active(start + Duration::from_secs(61)).is_empty());

        let back = start + Duration::from_secs(70);
        assert!(log.reactivate(event("open", Severity::Critical), back));
        assert!(log.reactivate(event("seen", Severity::Warning), back));
        assert!(log.history().is_empty());
        assert!(log.is_active("open", back));
        // Acknowledged before it aged out, so it stays quiet
        assert!(log.get("seen").unwrap().acknowledged);
        assert_eq!(log.max_active_severity(back), Some(Severity::Critical));

        assert!(!log.reactivate(event("never", Severity::Low), back));
        assert!(!log.contains("never"));
    }
}

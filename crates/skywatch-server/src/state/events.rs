//! Application events published on the broadcast bus and streamed to
//! WebSocket clients.

use serde::Serialize;
use skywatch_core::{FiredAlert, RuleDraft, SafetyEvent, TelemetryRecord};

use crate::escalation::AlarmCue;
use crate::notify::Notification;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AppEvent {
    Telemetry { version: u64, aircraft: usize },
    RuleAlert(FiredAlert),
    SafetyEvent(SafetyEvent),
    Acknowledged { event_id: String },
    AlarmCue(AlarmCue),
    AlarmSilenced,
    Notification(Notification),
    /// A user asked to author a rule for this aircraft.
    CreateRuleFromRecord {
        record: TelemetryRecord,
        draft: RuleDraft,
    },
}

impl AppEvent {
    pub fn to_json(&self) -> Option<String> {
        match serde_json::to_string(self) {
            Ok(text) => Some(text),
            Err(err) => {
                tracing::warn!("Failed to serialize app event: {}", err);
                None
            }
        }
    }
}

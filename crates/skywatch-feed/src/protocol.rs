//! Wire messages exchanged with the telemetry collaborator.
//!
//! Every frame is a JSON object with a `type` discriminator. Aircraft are
//! keyed by uppercase identifier.

use serde::{Deserialize, Serialize};
use skywatch_core::{HazardPush, ReferencePoint, TelemetryRecord};

/// Inbound frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FeedMessage {
    /// Full replacement of the telemetry set.
    Snapshot {
        #[serde(default)]
        aircraft: Vec<TelemetryRecord>,
        #[serde(default)]
        reference: Option<ReferencePoint>,
    },
    /// Changed aircraft; unknown identifiers are inserted.
    Update {
        #[serde(default)]
        aircraft: Vec<TelemetryRecord>,
    },
    /// Newly seen aircraft.
    New {
        #[serde(default)]
        aircraft: Vec<TelemetryRecord>,
    },
    /// Aircraft no longer tracked.
    Remove {
        #[serde(default, alias = "icaos")]
        hex: Vec<String>,
    },
    /// Pre-classified hazard from the backend detector.
    Hazard(HazardPush),
    /// Answer to a correlated request.
    Response {
        request_id: String,
        #[serde(default)]
        data: serde_json::Value,
        #[serde(default)]
        error: Option<String>,
    },
}

impl FeedMessage {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            FeedMessage::Snapshot { .. } => "snapshot",
            FeedMessage::Update { .. } => "update",
            FeedMessage::New { .. } => "new",
            FeedMessage::Remove { .. } => "remove",
            FeedMessage::Hazard(_) => "hazard",
            FeedMessage::Response { .. } => "response",
        }
    }
}

/// Outbound frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Request {
        request_id: String,
        request_type: String,
        #[serde(default)]
        params: serde_json::Value,
    },
}

//! REST API routes.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::ack::AckError;
use crate::api::ws;
use crate::escalation::{EscalationStatus, SafetyEventsView};
use crate::notify::NotificationSettings;
use crate::preview::parse_preview;
use crate::state::AppState;
use skywatch_core::{
    match_snapshot, normalize_hex, AlertRule, FiredAlert, MatchSet, NotificationChannels,
    ReferencePoint, RuleDefinition, RuleDraft, TelemetryRecord,
};

const AIRCRAFT_INFO_REQUEST: &str = "aircraft-info";

/// Create the API router.
pub fn create_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(|| async { "OK" }))
        .route("/v1/aircraft", get(list_aircraft))
        .route("/v1/rules", get(list_rules).post(create_rule))
        .route("/v1/rules/preview", post(preview_rule))
        .route("/v1/rules/from-aircraft/:hex", post(rule_from_aircraft))
        .route("/v1/rules/:rule_id", get(get_rule).delete(delete_rule))
        .route("/v1/rules/:rule_id/channels", put(update_channels))
        .route("/v1/safety/events", get(list_safety_events))
        .route("/v1/safety/events/:event_id/ack", post(acknowledge_event))
        .route("/v1/alarm", get(alarm_status))
        .route("/v1/alarm/mute", post(set_mute))
        .route("/v1/notifications", get(notification_settings).put(update_notifications))
        .route(
            "/v1/alerts/history",
            get(list_alert_history).delete(clear_alert_history),
        )
        .route("/v1/stream", get(ws::ws_handler))
}

fn bad_request(message: impl std::fmt::Display) -> (StatusCode, Json<Value>) {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "error": message.to_string() })),
    )
}

// === Aircraft ===

#[derive(Debug, Serialize)]
pub struct AircraftResponse {
    pub version: u64,
    pub reference: Option<ReferencePoint>,
    pub aircraft: Vec<TelemetryRecord>,
}

async fn list_aircraft(State(state): State<Arc<AppState>>) -> Json<AircraftResponse> {
    let snapshot = state.telemetry().snapshot();
    let mut aircraft: Vec<TelemetryRecord> = snapshot.records().cloned().collect();
    aircraft.sort_by(|a, b| a.hex.cmp(&b.hex));
    Json(AircraftResponse {
        version: snapshot.version,
        reference: snapshot.reference,
        aircraft,
    })
}

// === Rules ===

async fn list_rules(State(state): State<Arc<AppState>>) -> Json<Vec<AlertRule>> {
    Json(state.list_rules())
}

async fn get_rule(
    State(state): State<Arc<AppState>>,
    Path(rule_id): Path<String>,
) -> Result<Json<AlertRule>, StatusCode> {
    state.get_rule(&rule_id).map(Json).ok_or(StatusCode::NOT_FOUND)
}

/// Ingest a rule in any accepted shape. When the body omits `channels`, the
/// selection persisted for that rule id (if any) is applied.
async fn create_rule(
    State(state): State<Arc<AppState>>,
    Json(mut body): Json<Value>,
) -> impl IntoResponse {
    let explicit_channels = body.get("channels").is_some();
    if !explicit_channels {
        let rule_id = body.get("id").and_then(Value::as_str).map(str::to_string);
        if let (Some(rule_id), Some(map)) = (rule_id, body.as_object_mut()) {
            if let Some(channels) = state.stored_channels(&rule_id).await {
                if let Ok(value) = serde_json::to_value(channels) {
                    map.insert("channels".to_string(), value);
                }
            }
        }
    }

    let definition: RuleDefinition = match serde_json::from_value(body) {
        Ok(definition) => definition,
        Err(err) => return bad_request(err).into_response(),
    };
    let rule = match AlertRule::try_from(definition) {
        Ok(rule) => rule,
        Err(err) => {
            tracing::warn!("Rejected rule: {}", err);
            return bad_request(err).into_response();
        }
    };

    if explicit_channels {
        state.save_channels(&rule.id, &rule.channels).await;
    }
    state.upsert_rule(rule.clone());
    (StatusCode::CREATED, Json(rule)).into_response()
}

async fn delete_rule(
    State(state): State<Arc<AppState>>,
    Path(rule_id): Path<String>,
) -> StatusCode {
    if state.remove_rule(&rule_id).is_some() {
        state.forget_channels(&rule_id).await;
        tracing::info!("Deleted rule {}", rule_id);
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

async fn update_channels(
    State(state): State<Arc<AppState>>,
    Path(rule_id): Path<String>,
    Json(channels): Json<NotificationChannels>,
) -> Result<Json<AlertRule>, StatusCode> {
    state
        .set_rule_channels(&rule_id, channels)
        .await
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

#[derive(Debug, Deserialize)]
pub struct PreviewRequest {
    #[serde(default)]
    pub conditions: Value,
}

/// Match an in-progress rule against the current snapshot right away.
async fn preview_rule(
    State(state): State<Arc<AppState>>,
    Json(req): Json<PreviewRequest>,
) -> Result<Json<MatchSet>, (StatusCode, Json<Value>)> {
    let conditions = parse_preview(&req.conditions).map_err(bad_request)?;
    let snapshot = state.telemetry().snapshot();
    let set = match conditions {
        Some(conditions) => match_snapshot(&conditions, &snapshot),
        None => MatchSet {
            snapshot_version: snapshot.version,
            evaluated: snapshot.len(),
            matches: Vec::new(),
        },
    };
    Ok(Json(set))
}

/// Look the aircraft up locally, then ask the feed for it.
async fn rule_from_aircraft(
    State(state): State<Arc<AppState>>,
    Path(hex): Path<String>,
) -> Result<Json<RuleDraft>, StatusCode> {
    let record = match state.telemetry().get(&hex) {
        Some(record) => record,
        None => fetch_aircraft(&state, &hex).await.ok_or(StatusCode::NOT_FOUND)?,
    };
    Ok(Json(state.create_rule_from_record(record)))
}

async fn fetch_aircraft(state: &AppState, hex: &str) -> Option<TelemetryRecord> {
    let feed = state.feed()?;
    let hex = normalize_hex(hex);
    let response = feed
        .request(
            AIRCRAFT_INFO_REQUEST,
            json!({ "hex": hex }),
            state.config().feed_request_timeout_ms,
        )
        .await;
    let value = match response {
        Ok(value) => value,
        Err(err) => {
            tracing::warn!("Aircraft lookup for {} failed: {}", hex, err);
            return None;
        }
    };
    // The feed answers with either the record or `{aircraft: record}`.
    let value = match value.get("aircraft") {
        Some(inner) if inner.is_object() => inner.clone(),
        _ => value,
    };
    match serde_json::from_value::<TelemetryRecord>(value) {
        Ok(mut record) => {
            record.hex = normalize_hex(&record.hex);
            Some(record)
        }
        Err(err) => {
            tracing::warn!("Unreadable aircraft-info response for {}: {}", hex, err);
            None
        }
    }
}

// === Safety events ===

async fn list_safety_events(State(state): State<Arc<AppState>>) -> Json<SafetyEventsView> {
    Json(state.escalation().events())
}

async fn acknowledge_event(
    State(state): State<Arc<AppState>>,
    Path(event_id): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    match state.escalation().acknowledge(&event_id) {
        Ok(changed) => Ok(Json(json!({
            "event_id": event_id,
            "acknowledged": true,
            "changed": changed,
        }))),
        Err(AckError::UnknownEvent(_)) => Err(StatusCode::NOT_FOUND),
        Err(err) => {
            tracing::warn!("Acknowledging {} failed: {}", event_id, err);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

// === Alarm ===

async fn alarm_status(State(state): State<Arc<AppState>>) -> Json<EscalationStatus> {
    Json(state.escalation().status())
}

#[derive(Debug, Deserialize)]
pub struct MuteRequest {
    pub muted: bool,
}

async fn set_mute(
    State(state): State<Arc<AppState>>,
    Json(req): Json<MuteRequest>,
) -> Json<Value> {
    let changed = state.set_muted(req.muted).await;
    Json(json!({ "muted": req.muted, "changed": changed }))
}

// === Notifications ===

async fn notification_settings(
    State(state): State<Arc<AppState>>,
) -> Json<NotificationSettings> {
    Json(state.notifier().settings())
}

#[derive(Debug, Deserialize)]
pub struct NotificationUpdate {
    pub enabled: bool,
}

async fn update_notifications(
    State(state): State<Arc<AppState>>,
    Json(req): Json<NotificationUpdate>,
) -> Json<NotificationSettings> {
    state.notifier().set_enabled(req.enabled);
    Json(state.notifier().settings())
}

// === Alert history ===

async fn list_alert_history(State(state): State<Arc<AppState>>) -> Json<Vec<FiredAlert>> {
    Json(state.alert_history())
}

async fn clear_alert_history(State(state): State<Arc<AppState>>) -> StatusCode {
    state.clear_alert_history().await;
    StatusCode::NO_CONTENT
}

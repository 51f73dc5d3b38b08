use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use serde_json::{json, Value};
use skywatch_core::{classify_hazard, HazardPush, TelemetryRecord};
use std::sync::Arc;
use tower::ServiceExt;

use crate::{api, config::Config, persistence, state::AppEvent, state::AppState};

async fn setup_app() -> (axum::Router, Arc<AppState>) {
    let mut config = Config::from_env();
    config.database_path = ":memory:".to_string();
    config.ack_base_url = None;

    let db = persistence::init_database(&config.database_path, config.database_max_connections)
        .await
        .expect("init db");
    let state = Arc::new(AppState::with_database(db, config));
    state.load_preferences().await.expect("load prefs");

    let app = api::routes().with_state(state.clone());
    (app, state)
}

async fn read_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("read body");
    serde_json::from_slice(&bytes).expect("parse json")
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn seed_military(state: &AppState) {
    let mut mil = TelemetryRecord::new("ae1234");
    mil.military = true;
    mil.flight = Some("RCH123".into());
    let mut civ = TelemetryRecord::new("a1b2c3");
    civ.flight = Some("UAL12".into());
    state.telemetry().upsert([mil, civ]);
}

#[tokio::test]
async fn health_check() {
    let (app, _state) = setup_app().await;
    let response = app.oneshot(get("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn create_rule_normalizes_flat_conditions() {
    let (app, _state) = setup_app().await;

    let response = app
        .clone()
        .oneshot(post_json(
            "/v1/rules",
            json!({
                "id": "mil",
                "name": "Military",
                "conditions": [{"type": "military", "operator": "eq", "value": ""}]
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    let response = app.oneshot(get("/v1/rules")).await.unwrap();
    let rules = read_json(response).await;
    let rules = rules.as_array().unwrap();
    assert_eq!(rules.len(), 1);
    assert_eq!(rules[0]["id"], "mil");
    assert_eq!(rules[0]["conditions"]["groups"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn create_rule_rejects_empty_tree() {
    let (app, state) = setup_app().await;

    let response = app
        .oneshot(post_json(
            "/v1/rules",
            json!({"id": "empty", "conditions": {"logic": "AND", "groups": []}}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = read_json(response).await;
    assert_eq!(body["error"], "rule conditions tree has no groups");
    assert!(state.list_rules().is_empty());
}

#[tokio::test]
async fn channels_survive_reingest_until_deleted() {
    let (app, state) = setup_app().await;

    let quiet = json!({"desktop": false, "sound": true, "history": true});
    let response = app
        .clone()
        .oneshot(post_json(
            "/v1/rules",
            json!({"id": "r1", "conditions": [{"type": "military"}], "channels": quiet}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    // Same rule without a channel selection picks up the stored one
    let response = app
        .clone()
        .oneshot(post_json(
            "/v1/rules",
            json!({"id": "r1", "conditions": [{"type": "military"}]}),
        ))
        .await
        .unwrap();
    let rule = read_json(response).await;
    assert_eq!(rule["channels"], quiet);

    let delete = Request::builder()
        .method("DELETE")
        .uri("/v1/rules/r1")
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(delete).await.unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert!(state.stored_channels("r1").await.is_none());

    let delete = Request::builder()
        .method("DELETE")
        .uri("/v1/rules/r1")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(delete).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn update_channels_for_unknown_rule_is_404() {
    let (app, _state) = setup_app().await;
    let request = Request::builder()
        .method("PUT")
        .uri("/v1/rules/nope/channels")
        .header("content-type", "application/json")
        .body(Body::from(
            json!({"desktop": true, "sound": false, "history": true}).to_string(),
        ))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn preview_tolerates_incomplete_groups() {
    let (app, state) = setup_app().await;
    seed_military(&state);

    let response = app
        .oneshot(post_json(
            "/v1/rules/preview",
            json!({
                "conditions": {
                    "logic": "OR",
                    "groups": [
                        {"logic": "AND", "conditions": [{"type": "military"}]},
                        {"logic": "AND", "conditions": []}
                    ]
                }
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let set = read_json(response).await;
    assert_eq!(set["evaluated"], 2);
    let matches = set["matches"].as_array().unwrap();
    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0]["record"]["hex"], "AE1234");
    assert_eq!(matches[0]["reasons"][0], "Military aircraft");
}

#[tokio::test]
async fn rule_from_aircraft_emits_draft_event() {
    let (app, state) = setup_app().await;
    seed_military(&state);
    let mut rx = state.tx.subscribe();

    let response = app
        .clone()
        .oneshot(post_json("/v1/rules/from-aircraft/ae1234", json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let draft = read_json(response).await;
    assert_eq!(draft["name"], "Track RCH123");

    match rx.try_recv().unwrap() {
        AppEvent::CreateRuleFromRecord { record, .. } => assert_eq!(record.hex, "AE1234"),
        other => panic!("unexpected event {other:?}"),
    }

    // Unknown locally and no feed connected
    let response = app
        .oneshot(post_json("/v1/rules/from-aircraft/ffffff", json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn acknowledge_safety_event() {
    let (app, state) = setup_app().await;

    let response = app
        .clone()
        .oneshot(post_json("/v1/safety/events/missing/ack", json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let push: HazardPush = serde_json::from_value(json!({
        "event_type": "tcas_ra",
        "severity": "critical",
        "icao": "abc123",
        "icao_2": "def456"
    }))
    .unwrap();
    let event = classify_hazard(push).unwrap();
    let event_id = event.id.clone();
    state.escalation().ingest(event);

    let uri = format!("/v1/safety/events/{event_id}/ack");
    let response = app.clone().oneshot(post_json(&uri, json!({}))).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(read_json(response).await["changed"], true);

    let response = app.clone().oneshot(post_json(&uri, json!({}))).await.unwrap();
    assert_eq!(read_json(response).await["changed"], false);

    let response = app.oneshot(get("/v1/safety/events")).await.unwrap();
    let view = read_json(response).await;
    assert!(view["active"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn mute_is_persisted_and_idempotent() {
    let (app, state) = setup_app().await;

    let response = app
        .clone()
        .oneshot(post_json("/v1/alarm/mute", json!({"muted": true})))
        .await
        .unwrap();
    assert_eq!(read_json(response).await["changed"], true);

    let response = app
        .clone()
        .oneshot(post_json("/v1/alarm/mute", json!({"muted": true})))
        .await
        .unwrap();
    assert_eq!(read_json(response).await["changed"], false);

    let response = app.oneshot(get("/v1/alarm")).await.unwrap();
    let status = read_json(response).await;
    assert_eq!(status["muted"], true);
    assert_eq!(status["stage"], "idle");
    assert!(state.escalation().is_muted());
}

#[tokio::test]
async fn alert_history_starts_empty() {
    let (app, _state) = setup_app().await;
    let response = app.oneshot(get("/v1/alerts/history")).await.unwrap();
    assert_eq!(read_json(response).await, json!([]));
}

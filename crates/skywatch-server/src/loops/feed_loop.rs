//! Telemetry feed connection loop.
//!
//! Keeps a WebSocket session to the feed open, applies telemetry messages
//! to the store and hands hazard pushes to the escalation controller.
//! Reconnects with backoff when the session drops.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use skywatch_core::{classify_hazard, HazardPush};
use skywatch_feed::{FeedClient, FeedMessage};
use tokio::sync::broadcast;

use crate::backoff::Backoff;
use crate::escalation::IngestOutcome;
use crate::state::{AppEvent, AppState};

const RECONNECT_BASE_SECS: u64 = 1;
const RECONNECT_MAX_SECS: u64 = 30;

pub async fn run_feed_loop(state: Arc<AppState>, mut shutdown: broadcast::Receiver<()>) {
    let url = state.config().feed_url.clone();
    let mut backoff = Backoff::new(
        Duration::from_secs(RECONNECT_BASE_SECS),
        Duration::from_secs(RECONNECT_MAX_SECS),
    );

    loop {
        if !backoff.ready() {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = tokio::time::sleep(backoff.remaining()) => {}
            }
        }

        let (client, mut messages) = match FeedClient::connect(&url).await {
            Ok(connected) => connected,
            Err(err) => {
                let delay = backoff.fail();
                tracing::warn!("Telemetry feed connect to {} failed: {} (retrying in {:?})", url, err, delay);
                continue;
            }
        };

        tracing::info!("Connected to telemetry feed {}", url);
        backoff.reset();
        let client = Arc::new(client);
        state.set_feed(Some(client.clone()));

        let stopping = loop {
            tokio::select! {
                _ = shutdown.recv() => break true,
                message = messages.recv() => match message {
                    Some(message) => handle_message(&state, message),
                    None => break false,
                }
            }
        };

        state.set_feed(None);
        client.close();
        if stopping {
            break;
        }
        let delay = backoff.fail();
        tracing::warn!("Telemetry feed disconnected, reconnecting in {:?}", delay);
    }

    tracing::info!("Feed loop shutting down");
}

/// Route one inbound feed message.
pub fn handle_message(state: &AppState, message: FeedMessage) {
    match message {
        FeedMessage::Hazard(push) => {
            ingest_hazard(state, push);
        }
        other => {
            if state.telemetry().apply(&other) {
                state.publish(AppEvent::Telemetry {
                    version: state.telemetry().version(),
                    aircraft: state.telemetry().len(),
                });
            }
        }
    }
}

/// Classify a backend hazard push and escalate it. Pushes that name no
/// aircraft are dropped.
pub fn ingest_hazard(state: &AppState, push: HazardPush) -> Option<IngestOutcome> {
    let Some(event) = classify_hazard(push) else {
        tracing::warn!("Dropping hazard push without participants");
        return None;
    };
    let observed_at = observed_instant(event.timestamp, Utc::now());
    Some(state.escalation().ingest_at(event, observed_at))
}

/// Map a wall-clock detection time onto the monotonic clock. Future
/// timestamps count as now.
fn observed_instant(timestamp: DateTime<Utc>, wall_now: DateTime<Utc>) -> Instant {
    let now = tokio::time::Instant::now().into_std();
    let age = (wall_now - timestamp).to_std().unwrap_or(Duration::ZERO);
    now.checked_sub(age).unwrap_or(now)
}

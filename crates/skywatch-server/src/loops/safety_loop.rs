//! Local emergency detection and escalation upkeep.
//!
//! Scans every new telemetry version for emergency squawks and flags, and
//! ticks the escalation controller once a second so aged events move to
//! history and expired notification tags leave the ledgers.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use skywatch_core::classify_snapshot;
use tokio::sync::broadcast;
use tokio::time::interval;

use crate::escalation::IngestOutcome;
use crate::state::AppState;

const SAFETY_TICK_MS: u64 = 1000;

pub async fn run_safety_loop(state: Arc<AppState>, mut shutdown: broadcast::Receiver<()>) {
    let mut ticker = interval(Duration::from_millis(SAFETY_TICK_MS));
    let mut versions = state.telemetry().subscribe();

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                state.escalation().shutdown();
                tracing::info!("Safety loop shutting down");
                break;
            }
            _ = ticker.tick() => {
                scan_snapshot(&state);
                state.escalation().tick();
            }
            changed = versions.changed() => {
                if changed.is_err() {
                    break;
                }
                scan_snapshot(&state);
            }
        }
    }
}

/// Classify the current snapshot. Returns how many events were newly raised.
///
/// Repeated sightings keep emergency tags alive in the ledger, so the grace
/// period counts from the last scan that still saw the condition.
pub fn scan_snapshot(state: &AppState) -> usize {
    let snapshot = state.telemetry().snapshot();
    classify_snapshot(&snapshot, Utc::now())
        .into_iter()
        .filter(|event| state.escalation().ingest(event.clone()) == IngestOutcome::Raised)
        .count()
}

//! Debounced live matching for rules being edited.
//!
//! Edits are coalesced for [`PREVIEW_DEBOUNCE`]; only the latest edit is
//! evaluated. Each pass runs over one snapshot taken at pass start, and a
//! new telemetry version re-runs the current rule.

use std::sync::Arc;
use std::time::Duration;

use skywatch_core::{match_snapshot, normalize_conditions, MatchSet, RuleConditions, RuleError};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::state::AppState;

pub const PREVIEW_DEBOUNCE: Duration = Duration::from_millis(300);

pub struct PreviewService {
    edits: watch::Sender<Option<RuleConditions>>,
    results: watch::Receiver<Option<Arc<MatchSet>>>,
    task: JoinHandle<()>,
}

impl PreviewService {
    pub fn spawn(state: Arc<AppState>) -> Self {
        let (edits, edits_rx) = watch::channel(None);
        let (results_tx, results) = watch::channel(None);
        let task = tokio::spawn(run_preview(state, edits_rx, results_tx));
        Self { edits, results, task }
    }

    /// Replace the rule being previewed. `None` clears the preview.
    pub fn submit(&self, conditions: Option<RuleConditions>) {
        self.edits.send_replace(conditions);
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<MatchSet>>> {
        self.results.clone()
    }
}

impl Drop for PreviewService {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Parse conditions for preview. Trees are taken as-is, so a tree still
/// missing conditions in some group simply matches less. `Ok(None)` means
/// there is nothing to preview yet.
pub fn parse_preview(value: &serde_json::Value) -> Result<Option<RuleConditions>, RuleError> {
    match value {
        serde_json::Value::Null => Ok(None),
        serde_json::Value::Object(map) if map.contains_key("groups") => {
            serde_json::from_value(value.clone())
                .map(Some)
                .map_err(|e| RuleError::Malformed(e.to_string()))
        }
        other => match normalize_conditions(Some(other), None) {
            Ok(conditions) => Ok(Some(conditions)),
            Err(RuleError::MissingConditions | RuleError::EmptyConditions) => Ok(None),
            Err(err) => Err(err),
        },
    }
}

async fn run_preview(
    state: Arc<AppState>,
    mut edits: watch::Receiver<Option<RuleConditions>>,
    results: watch::Sender<Option<Arc<MatchSet>>>,
) {
    let mut versions = state.telemetry().subscribe();

    loop {
        tokio::select! {
            changed = edits.changed() => {
                if changed.is_err() {
                    break;
                }
                // Wait for the edits to settle
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(PREVIEW_DEBOUNCE) => break,
                        changed = edits.changed() => {
                            if changed.is_err() {
                                return;
                            }
                        }
                    }
                }
            }
            changed = versions.changed() => {
                if changed.is_err() {
                    break;
                }
                if edits.borrow().is_none() {
                    continue;
                }
            }
        }

        let conditions = edits.borrow_and_update().clone();
        let outcome = conditions.map(|conditions| {
            let snapshot = state.telemetry().snapshot();
            Arc::new(match_snapshot(&conditions, &snapshot))
        });
        if results.send(outcome).is_err() {
            break;
        }
    }
}

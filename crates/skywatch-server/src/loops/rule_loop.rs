//! Rule alert loop.
//!
//! Periodically evaluates every enabled rule inside its active window
//! against the latest telemetry snapshot. A rule fires at most once per
//! aircraft per cooldown; fired alerts go to the rule's selected channels.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use skywatch_core::{match_snapshot, AlertRule, DedupLedger, FiredAlert, Retention};
use tokio::sync::broadcast;
use tokio::time::interval;

use crate::escalation::{AlarmCue, Cadence};
use crate::notify::Notification;
use crate::state::{AppEvent, AppState};

const MIN_INTERVAL_MS: u64 = 100;

pub async fn run_rule_loop(state: Arc<AppState>, mut shutdown: broadcast::Receiver<()>) {
    let period = state.config().rule_loop_interval_ms.max(MIN_INTERVAL_MS);
    let mut ticker = interval(Duration::from_millis(period));
    let mut alerter = RuleAlerter::new();

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                tracing::info!("Rule loop shutting down");
                break;
            }
            _ = ticker.tick() => {
                let fired = alerter.run(&state).await;
                if !fired.is_empty() {
                    tracing::info!("Fired {} rule alert(s)", fired.len());
                }
            }
        }
    }
}

/// Owns the cooldown ledger for rule alerts.
#[derive(Default)]
pub struct RuleAlerter {
    ledger: DedupLedger,
}

impl RuleAlerter {
    pub fn new() -> Self {
        Self::default()
    }

    /// One evaluation pass over a single snapshot.
    pub async fn run(&mut self, state: &AppState) -> Vec<FiredAlert> {
        let snapshot = state.telemetry().snapshot();
        let wall_now = Utc::now();
        let now = tokio::time::Instant::now().into_std();
        self.ledger.sweep(now);

        let mut fired = Vec::new();
        for rule in state.active_rules(wall_now) {
            let matches = match_snapshot(&rule.conditions, &snapshot);
            for hit in matches.matches {
                let tag = rule.alert_tag(&hit.record.hex);
                if !self.ledger.observe(&tag, cooldown(&rule), now) {
                    continue;
                }
                let alert = FiredAlert {
                    rule_id: rule.id.clone(),
                    rule_name: rule.name.clone(),
                    hex: hit.record.hex.clone(),
                    callsign: hit.record.callsign().map(str::to_string),
                    severity: rule.severity,
                    reasons: hit.reasons,
                    distance_nm: hit.distance_nm,
                    fired_at: wall_now,
                };
                deliver(state, &rule, &alert, tag).await;
                fired.push(alert);
            }
        }
        fired
    }

    pub fn is_cooling_down(&self, tag: &str, now: Instant) -> bool {
        self.ledger.contains(tag, now)
    }
}

fn cooldown(rule: &AlertRule) -> Retention {
    Retention::AfterFired(Duration::from_secs(rule.cooldown_secs))
}

async fn deliver(state: &AppState, rule: &AlertRule, alert: &FiredAlert, tag: String) {
    tracing::info!(
        "Rule '{}' matched {} ({})",
        rule.name,
        alert.hex,
        alert.reasons.join(", ")
    );

    if rule.channels.history {
        state.record_alert(alert.clone()).await;
    }
    if rule.channels.desktop {
        state.notifier().dispatch(&Notification::for_alert(alert, tag));
    }
    if rule.channels.sound && !state.escalation().is_muted() {
        state.publish(AppEvent::AlarmCue(AlarmCue {
            severity: rule.severity,
            volume: Cadence::for_severity(rule.severity).volume,
            repeat: false,
        }));
    }
    state.publish(AppEvent::RuleAlert(alert.clone()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use skywatch_core::TelemetryRecord;

    fn rule(value: serde_json::Value) -> AlertRule {
        serde_json::from_value(value).unwrap()
    }

    fn state_with_military() -> AppState {
        let state = AppState::new(Config::from_env());
        let mut record = TelemetryRecord::new("ae1234");
        record.military = true;
        record.flight = Some("RCH123".into());
        state.telemetry().upsert([record, TelemetryRecord::new("a1b2c3")]);
        state
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_once_per_cooldown() {
        let state = state_with_military();
        state.upsert_rule(rule(serde_json::json!({
            "id": "mil",
            "name": "Military",
            "conditions": [{"type": "military", "operator": "eq", "value": ""}],
            "cooldown_secs": 60
        })));

        let mut alerter = RuleAlerter::new();
        let fired = alerter.run(&state).await;
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].hex, "AE1234");
        assert_eq!(fired[0].callsign.as_deref(), Some("RCH123"));
        assert_eq!(fired[0].reasons, vec!["Military aircraft".to_string()]);
        assert!(alerter.run(&state).await.is_empty());

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(alerter.run(&state).await.len(), 1);
        assert_eq!(state.alert_history().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_and_expired_rules_are_skipped() {
        let state = state_with_military();
        state.upsert_rule(rule(serde_json::json!({
            "id": "off",
            "enabled": false,
            "conditions": [{"type": "military"}]
        })));
        state.upsert_rule(rule(serde_json::json!({
            "id": "old",
            "expires_at": "2001-01-01T00:00:00Z",
            "conditions": [{"type": "military"}]
        })));

        let mut alerter = RuleAlerter::new();
        assert!(alerter.run(&state).await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_history_channel_respected() {
        let state = state_with_military();
        state.upsert_rule(rule(serde_json::json!({
            "id": "quiet",
            "conditions": [{"type": "military"}],
            "channels": {"desktop": false, "sound": false, "history": false}
        })));
        let mut rx = state.tx.subscribe();

        let mut alerter = RuleAlerter::new();
        assert_eq!(alerter.run(&state).await.len(), 1);
        assert!(state.alert_history().is_empty());
        assert!(matches!(rx.try_recv().unwrap(), AppEvent::RuleAlert(_)));
        assert!(alerter.is_cooling_down("rule-quiet-AE1234", tokio::time::Instant::now().into_std()));
    }
}

//! Application state shared by the API and the background loops.

use std::sync::{Arc, Mutex, RwLock};

use anyhow::Result;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use skywatch_core::{
    draft_from_record, AlertHistory, AlertRule, FiredAlert, NotificationChannels, RuleDraft,
    TelemetryRecord,
};
use skywatch_feed::FeedClient;
use tokio::sync::broadcast;

use crate::ack::{AckTransport, AcknowledgmentStore, HttpAckClient, LocalOnlyTransport};
use crate::config::Config;
use crate::escalation::{AlarmSink, BusAlarmSink, EscalationController};
use crate::notify::{BusNotificationSink, NotificationDispatcher, NotificationSink};
use crate::persistence::prefs::{rule_channels_key, ALERT_HISTORY_KEY, SOUND_MUTED_KEY};
use crate::persistence::{Database, PreferenceStore};

use super::{AppEvent, TelemetryStore};

const EVENT_BUS_CAPACITY: usize = 1024;

pub struct AppState {
    config: Config,
    telemetry: TelemetryStore,
    rules: DashMap<String, AlertRule>,
    escalation: EscalationController,
    notifier: NotificationDispatcher,
    history: Mutex<AlertHistory>,
    feed: RwLock<Option<Arc<FeedClient>>>,
    prefs: Option<PreferenceStore>,
    pub tx: broadcast::Sender<AppEvent>,
}

impl AppState {
    /// In-memory state; preferences are not persisted.
    pub fn new(config: Config) -> Self {
        Self::build(config, None)
    }

    pub fn with_database(db: Database, config: Config) -> Self {
        Self::build(config, Some(PreferenceStore::new(db)))
    }

    fn build(config: Config, prefs: Option<PreferenceStore>) -> Self {
        let (tx, _) = broadcast::channel(EVENT_BUS_CAPACITY);

        let sink: Arc<dyn NotificationSink> = Arc::new(BusNotificationSink::new(tx.clone()));
        let notifier = NotificationDispatcher::new(sink, config.notification_settings());

        let transport: Arc<dyn AckTransport> = match config.ack_base_url.as_deref() {
            Some(url) => Arc::new(HttpAckClient::new(url)),
            None => Arc::new(LocalOnlyTransport),
        };
        let alarm: Arc<dyn AlarmSink> = Arc::new(BusAlarmSink::new(tx.clone()));
        let escalation = EscalationController::new(
            alarm,
            notifier.clone(),
            AcknowledgmentStore::new(transport),
            tx.clone(),
        );

        Self {
            telemetry: TelemetryStore::new(config.reference),
            rules: DashMap::new(),
            escalation,
            notifier,
            history: Mutex::new(AlertHistory::new()),
            feed: RwLock::new(None),
            prefs,
            tx,
            config,
        }
    }

    /// Restore persisted alert history and the mute preference.
    pub async fn load_preferences(&self) -> Result<()> {
        let Some(prefs) = &self.prefs else {
            return Ok(());
        };
        if let Some(history) = prefs.get::<AlertHistory>(ALERT_HISTORY_KEY).await? {
            tracing::info!("Restored {} fired alert(s)", history.len());
            if let Ok(mut current) = self.history.lock() {
                *current = history;
            }
        }
        if let Some(muted) = prefs.get::<bool>(SOUND_MUTED_KEY).await? {
            self.escalation.set_muted(muted);
        }
        Ok(())
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn telemetry(&self) -> &TelemetryStore {
        &self.telemetry
    }

    pub fn escalation(&self) -> &EscalationController {
        &self.escalation
    }

    pub fn notifier(&self) -> &NotificationDispatcher {
        &self.notifier
    }

    pub fn publish(&self, event: AppEvent) {
        // Nobody listening is fine.
        let _ = self.tx.send(event);
    }

    // === Rules ===

    pub fn upsert_rule(&self, rule: AlertRule) -> Option<AlertRule> {
        tracing::info!("Rule '{}' ({}) stored", rule.name, rule.id);
        self.rules.insert(rule.id.clone(), rule)
    }

    pub fn remove_rule(&self, rule_id: &str) -> Option<AlertRule> {
        self.rules.remove(rule_id).map(|(_, rule)| rule)
    }

    pub fn get_rule(&self, rule_id: &str) -> Option<AlertRule> {
        self.rules.get(rule_id).map(|r| r.value().clone())
    }

    pub fn list_rules(&self) -> Vec<AlertRule> {
        let mut rules: Vec<AlertRule> = self.rules.iter().map(|r| r.value().clone()).collect();
        rules.sort_by(|a, b| a.id.cmp(&b.id));
        rules
    }

    /// Enabled rules inside their active window.
    pub fn active_rules(&self, now: DateTime<Utc>) -> Vec<AlertRule> {
        let mut rules: Vec<AlertRule> = self
            .rules
            .iter()
            .filter(|r| r.value().is_active_at(now))
            .map(|r| r.value().clone())
            .collect();
        rules.sort_by(|a, b| a.id.cmp(&b.id));
        rules
    }

    /// Channel selection persisted for a rule, if any. Storage failures
    /// degrade to "none stored".
    pub async fn stored_channels(&self, rule_id: &str) -> Option<NotificationChannels> {
        let prefs = self.prefs.as_ref()?;
        match prefs.get(&rule_channels_key(rule_id)).await {
            Ok(channels) => channels,
            Err(err) => {
                tracing::warn!("Failed to read channels for rule {}: {}", rule_id, err);
                None
            }
        }
    }

    pub async fn save_channels(&self, rule_id: &str, channels: &NotificationChannels) {
        let Some(prefs) = &self.prefs else {
            return;
        };
        if let Err(err) = prefs.set(&rule_channels_key(rule_id), channels).await {
            tracing::warn!("Failed to persist channels for rule {}: {}", rule_id, err);
        }
    }

    pub async fn forget_channels(&self, rule_id: &str) {
        let Some(prefs) = &self.prefs else {
            return;
        };
        if let Err(err) = prefs.delete(&rule_channels_key(rule_id)).await {
            tracing::warn!("Failed to delete channels for rule {}: {}", rule_id, err);
        }
    }

    /// Change a stored rule's channels and persist the selection.
    pub async fn set_rule_channels(
        &self,
        rule_id: &str,
        channels: NotificationChannels,
    ) -> Option<AlertRule> {
        let updated = {
            let mut rule = self.rules.get_mut(rule_id)?;
            rule.channels = channels;
            rule.clone()
        };
        self.save_channels(rule_id, &channels).await;
        Some(updated)
    }

    // === Alert history ===

    pub fn alert_history(&self) -> Vec<FiredAlert> {
        self.history.lock().map(|h| h.to_vec()).unwrap_or_default()
    }

    /// Add a fired alert to the ring buffer and persist it.
    pub async fn record_alert(&self, alert: FiredAlert) {
        let snapshot = match self.history.lock() {
            Ok(mut history) => {
                history.push(alert);
                history.clone()
            }
            Err(_) => return,
        };
        if let Some(prefs) = &self.prefs {
            if let Err(err) = prefs.set(ALERT_HISTORY_KEY, &snapshot).await {
                tracing::warn!("Failed to persist alert history: {}", err);
            }
        }
    }

    pub async fn clear_alert_history(&self) {
        if let Ok(mut history) = self.history.lock() {
            history.clear();
        }
        if let Some(prefs) = &self.prefs {
            if let Err(err) = prefs.delete(ALERT_HISTORY_KEY).await {
                tracing::warn!("Failed to clear alert history: {}", err);
            }
        }
    }

    // === Alarm ===

    /// Mute or unmute and persist the preference.
    pub async fn set_muted(&self, muted: bool) -> bool {
        let changed = self.escalation.set_muted(muted);
        if let Some(prefs) = &self.prefs {
            if let Err(err) = prefs.set(SOUND_MUTED_KEY, &muted).await {
                tracing::warn!("Failed to persist mute preference: {}", err);
            }
        }
        changed
    }

    // === Feed ===

    pub fn set_feed(&self, client: Option<Arc<FeedClient>>) {
        if let Ok(mut feed) = self.feed.write() {
            *feed = client;
        }
    }

    pub fn feed(&self) -> Option<Arc<FeedClient>> {
        self.feed.read().ok().and_then(|f| f.clone())
    }

    /// Emit the create-rule event for an aircraft and return the draft.
    pub fn create_rule_from_record(&self, record: TelemetryRecord) -> RuleDraft {
        let draft = draft_from_record(&record);
        tracing::info!("Rule draft '{}' requested for {}", draft.name, record.hex);
        self.publish(AppEvent::CreateRuleFromRecord {
            record,
            draft: draft.clone(),
        });
        draft
    }
}

//! Safety-event escalation.
//!
//! The controller is either idle or running exactly one alarm loop whose
//! cadence follows the highest severity among active, unacknowledged
//! events. Every timer it starts is owned by a handle stored in the
//! controller state; dropping or stopping the handle aborts the task.
//!
//! Time is read from the tokio clock so paused-clock tests drive it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use serde::Serialize;
use skywatch_core::{
    DedupLedger, Retention, SafetyEvent, SafetyEventLog, SafetyEventType, Severity,
    EMERGENCY_GRACE,
};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::ack::{AckError, AcknowledgmentStore};
use crate::notify::{Notification, NotificationDispatcher};
use crate::state::AppEvent;

/// Low-severity events acknowledge themselves this long after detection.
pub const AUTO_ACK_DELAY: Duration = Duration::from_secs(5);
/// The repeat cue plays this long before a forced acknowledgment.
pub const REPEAT_CUE_LEAD: Duration = Duration::from_millis(1500);

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Cadence {
    pub interval_ms: u64,
    pub volume: f32,
}

impl Cadence {
    pub fn for_severity(severity: Severity) -> Self {
        match severity {
            Severity::Low => Cadence { interval_ms: 4000, volume: 0.3 },
            Severity::Warning => Cadence { interval_ms: 2000, volume: 0.6 },
            Severity::Critical => Cadence { interval_ms: 1000, volume: 1.0 },
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AlarmCue {
    pub severity: Severity,
    pub volume: f32,
    /// The one-off cue played ahead of an auto-acknowledgment.
    pub repeat: bool,
}

/// Audio output for alarm cues.
pub trait AlarmSink: Send + Sync {
    fn play(&self, cue: AlarmCue);
    fn silence(&self);
}

/// Forwards cues to connected clients, which own the speakers.
pub struct BusAlarmSink {
    tx: broadcast::Sender<AppEvent>,
}

impl BusAlarmSink {
    pub fn new(tx: broadcast::Sender<AppEvent>) -> Self {
        Self { tx }
    }
}

impl AlarmSink for BusAlarmSink {
    fn play(&self, cue: AlarmCue) {
        let _ = self.tx.send(AppEvent::AlarmCue(cue));
    }

    fn silence(&self) {
        let _ = self.tx.send(AppEvent::AlarmSilenced);
    }
}

/// Cancellation handle for the running alarm loop.
#[must_use = "dropping the handle stops the loop"]
pub struct LoopHandle {
    severity: Severity,
    last_cue: Arc<Mutex<Option<Instant>>>,
    task: JoinHandle<()>,
}

impl LoopHandle {
    pub fn severity(&self) -> Severity {
        self.severity
    }

    /// When this loop last played a cue.
    pub fn last_cue(&self) -> Option<Instant> {
        *self.last_cue.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn stop(self) {
        self.task.abort();
    }
}

impl Drop for LoopHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Start an alarm loop at `severity`. The first cue plays at `first_cue`,
/// or immediately when that is `None` or already past.
pub fn start_loop(
    sink: Arc<dyn AlarmSink>,
    severity: Severity,
    first_cue: Option<Instant>,
) -> LoopHandle {
    let cadence = Cadence::for_severity(severity);
    let last_cue = Arc::new(Mutex::new(None));
    let played = last_cue.clone();
    let start = first_cue
        .map(tokio::time::Instant::from_std)
        .unwrap_or_else(tokio::time::Instant::now);
    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(start, cadence.interval());
        loop {
            ticker.tick().await;
            *played.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(now());
            sink.play(AlarmCue {
                severity,
                volume: cadence.volume,
                repeat: false,
            });
        }
    });
    LoopHandle {
        severity,
        last_cue,
        task,
    }
}

/// Stopping a loop requires the handle that started it.
pub fn stop_loop(handle: LoopHandle) {
    handle.stop();
}

/// A one-shot timer owned by the controller.
#[must_use = "dropping the handle cancels the timer"]
struct TimerHandle {
    deadline: Instant,
    task: JoinHandle<()>,
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// First sighting: recorded, notified and escalated.
    Raised,
    /// Already known; its observation time was refreshed.
    Refreshed,
    /// Still tagged but aged out of the active window; tracked again
    /// without a new notification.
    Reactivated,
    /// The controller has shut down.
    Ignored,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum AlarmStage {
    Idle,
    Looping { severity: Severity, cadence: Cadence },
}

#[derive(Debug, Clone, Serialize)]
pub struct EscalationStatus {
    #[serde(flatten)]
    pub stage: AlarmStage,
    pub muted: bool,
    pub active: Vec<SafetyEvent>,
    pub auto_ack_pending: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SafetyEventsView {
    pub active: Vec<SafetyEvent>,
    pub recent: Vec<SafetyEvent>,
    pub history: Vec<SafetyEvent>,
    pub unconfirmed_acks: Vec<String>,
}

struct ControllerState {
    log: SafetyEventLog,
    hazards: DedupLedger,
    emergencies: DedupLedger,
    muted: bool,
    shut_down: bool,
    alarm: Option<LoopHandle>,
    /// Last cue of the loop stopped by muting; a resumed loop keeps its spacing.
    muted_cue: Option<Instant>,
    auto_acks: HashMap<String, TimerHandle>,
    expiry: Option<TimerHandle>,
}

struct Shared {
    state: Mutex<ControllerState>,
    alarm: Arc<dyn AlarmSink>,
    notifier: NotificationDispatcher,
    acks: AcknowledgmentStore,
    events: broadcast::Sender<AppEvent>,
}

/// Owns the event log, the notification ledgers and every alarm timer.
#[derive(Clone)]
pub struct EscalationController {
    shared: Arc<Shared>,
}

fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

impl EscalationController {
    pub fn new(
        alarm: Arc<dyn AlarmSink>,
        notifier: NotificationDispatcher,
        acks: AcknowledgmentStore,
        events: broadcast::Sender<AppEvent>,
    ) -> Self {
        let state = ControllerState {
            log: SafetyEventLog::new(),
            hazards: DedupLedger::default(),
            emergencies: DedupLedger::default(),
            muted: false,
            shut_down: false,
            alarm: None,
            muted_cue: None,
            auto_acks: HashMap::new(),
            expiry: None,
        };
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(state),
                alarm,
                notifier,
                acks,
                events,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ControllerState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn from_weak(weak: &Weak<Shared>) -> Option<Self> {
        weak.upgrade().map(|shared| Self { shared })
    }

    /// Ingest an event observed now.
    pub fn ingest(&self, event: SafetyEvent) -> IngestOutcome {
        self.ingest_at(event, now())
    }

    /// Ingest an event first observed at `observed_at`.
    ///
    /// The dedup ledger decides whether this is a new occurrence. Repeats
    /// only refresh the observation time, or bring an aged-out event back
    /// into the active window, so acknowledgment survives them.
    pub fn ingest_at(&self, event: SafetyEvent, observed_at: Instant) -> IngestOutcome {
        let now = now();
        let mut state = self.lock();
        if state.shut_down {
            return IngestOutcome::Ignored;
        }

        let tag = event.dedup_tag();
        let fired = match event.event_type {
            SafetyEventType::Emergency => {
                state
                    .emergencies
                    .observe(&tag, Retention::AfterLastSeen(EMERGENCY_GRACE), now)
            }
            _ => state.hazards.observe(&tag, Retention::Indefinite, now),
        };

        if !fired {
            if state.log.touch(&event.id, observed_at) {
                self.reconcile_locked(&mut state, now);
                return IngestOutcome::Refreshed;
            }
            // Aged out but still tagged: active again, without a new notification
            let id = event.id.clone();
            let severity = event.severity;
            if !state.log.reactivate(event.clone(), observed_at) {
                state.log.record(event, observed_at);
            }
            let acknowledged = state.log.get(&id).is_some_and(|e| e.acknowledged);
            if severity == Severity::Low && !acknowledged && !state.auto_acks.contains_key(&id) {
                self.schedule_auto_ack(&mut state, &id, observed_at);
            }
            self.reconcile_locked(&mut state, now);
            tracing::debug!("Reactivated {} ({}) without renotifying", id, tag);
            return IngestOutcome::Reactivated;
        }

        self.shared.acks.clear(&event.id);
        state.log.record(event.clone(), observed_at);
        if event.severity == Severity::Low {
            self.schedule_auto_ack(&mut state, &event.id, observed_at);
        }
        self.reconcile_locked(&mut state, now);
        drop(state);

        tracing::warn!("Safety event {} [{:?}] {}", event.id, event.severity, event.title());
        self.shared.notifier.dispatch(&Notification::for_event(&event));
        let _ = self.shared.events.send(AppEvent::SafetyEvent(event));
        IngestOutcome::Raised
    }

    /// Acknowledge an event. Returns whether this call changed anything.
    ///
    /// Local state changes first; the remote call runs in the background
    /// and its failure does not undo the acknowledgment.
    pub fn acknowledge(&self, event_id: &str) -> Result<bool, AckError> {
        let now = now();
        let mut state = self.lock();
        if !state.log.contains(event_id) {
            return Err(AckError::UnknownEvent(event_id.to_string()));
        }
        state.auto_acks.remove(event_id);
        let changed = state.log.acknowledge(event_id);
        if changed {
            self.reconcile_locked(&mut state, now);
        }
        drop(state);

        if changed {
            tracing::info!("Acknowledged safety event {}", event_id);
            self.shared.acks.acknowledge(event_id);
            let _ = self.shared.events.send(AppEvent::Acknowledged {
                event_id: event_id.to_string(),
            });
        }
        Ok(changed)
    }

    /// Mute or unmute the alarm. Acknowledgment state is left untouched.
    ///
    /// Returns false when the mute state did not change; in particular a
    /// repeated unmute never restarts the loop.
    pub fn set_muted(&self, muted: bool) -> bool {
        let now = now();
        let mut state = self.lock();
        if state.muted == muted {
            return false;
        }
        state.muted = muted;
        if muted {
            if let Some(handle) = state.alarm.take() {
                state.muted_cue = handle.last_cue();
                stop_loop(handle);
            }
            self.shared.alarm.silence();
        } else {
            self.reconcile_locked(&mut state, now);
            state.muted_cue = None;
        }
        tracing::info!("Alarm {}", if muted { "muted" } else { "unmuted" });
        true
    }

    pub fn is_muted(&self) -> bool {
        self.lock().muted
    }

    /// Move aged events to history, drop expired ledger entries and bring
    /// the alarm in line with what is still active.
    pub fn tick(&self) {
        let now = now();
        let mut state = self.lock();
        if state.shut_down {
            return;
        }
        let aged = state.log.prune(now);
        for id in &aged {
            state.auto_acks.remove(id);
        }
        let evicted = state.hazards.sweep(now) + state.emergencies.sweep(now);
        if !aged.is_empty() || evicted > 0 {
            tracing::debug!("Aged out {} event(s), evicted {} ledger tag(s)", aged.len(), evicted);
        }
        self.reconcile_locked(&mut state, now);
    }

    /// Stop every timer and refuse further events.
    pub fn shutdown(&self) {
        let mut state = self.lock();
        if state.shut_down {
            return;
        }
        state.shut_down = true;
        if let Some(handle) = state.alarm.take() {
            stop_loop(handle);
        }
        state.auto_acks.clear();
        state.expiry = None;
        self.shared.alarm.silence();
        tracing::info!("Escalation controller shut down");
    }

    pub fn status(&self) -> EscalationStatus {
        let now = now();
        let state = self.lock();
        let stage = match &state.alarm {
            Some(handle) => AlarmStage::Looping {
                severity: handle.severity(),
                cadence: Cadence::for_severity(handle.severity()),
            },
            None => AlarmStage::Idle,
        };
        let mut auto_ack_pending: Vec<String> = state.auto_acks.keys().cloned().collect();
        auto_ack_pending.sort();
        EscalationStatus {
            stage,
            muted: state.muted,
            active: state.log.active(now),
            auto_ack_pending,
        }
    }

    pub fn events(&self) -> SafetyEventsView {
        let now = now();
        let state = self.lock();
        SafetyEventsView {
            active: state.log.active(now),
            recent: state.log.recent(),
            history: state.log.history(),
            unconfirmed_acks: self.shared.acks.unconfirmed(),
        }
    }

    pub fn event(&self, event_id: &str) -> Option<SafetyEvent> {
        self.lock().log.get(event_id).cloned()
    }

    /// Whether a notification tag is currently suppressed.
    pub fn is_notified(&self, tag: &str) -> bool {
        let now = now();
        let state = self.lock();
        state.hazards.contains(tag, now) || state.emergencies.contains(tag, now)
    }

    fn reconcile_locked(&self, state: &mut ControllerState, now: Instant) {
        let target = if state.muted || state.shut_down {
            None
        } else {
            state.log.max_active_severity(now)
        };
        let current = state.alarm.as_ref().map(LoopHandle::severity);

        if current != target {
            if let Some(handle) = state.alarm.take() {
                stop_loop(handle);
            }
            match target {
                Some(severity) => {
                    tracing::info!("Alarm loop at {:?}", severity);
                    let first_cue = state
                        .muted_cue
                        .take()
                        .map(|last| last + Cadence::for_severity(severity).interval())
                        .filter(|at| *at > now);
                    state.alarm = Some(start_loop(self.shared.alarm.clone(), severity, first_cue));
                }
                None => {
                    tracing::info!("Alarm idle");
                    self.shared.alarm.silence();
                }
            }
        }

        self.reschedule_expiry(state, now);
    }

    fn reschedule_expiry(&self, state: &mut ControllerState, now: Instant) {
        let next = if state.shut_down {
            None
        } else {
            state.log.next_expiry(now)
        };
        let Some(deadline) = next else {
            state.expiry = None;
            return;
        };
        if state
            .expiry
            .as_ref()
            .is_some_and(|timer| timer.deadline == deadline && !timer.task.is_finished())
        {
            return;
        }

        let weak = Arc::downgrade(&self.shared);
        let task = tokio::spawn(async move {
            tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await;
            if let Some(controller) = Self::from_weak(&weak) {
                controller.tick();
            }
        });
        state.expiry = Some(TimerHandle { deadline, task });
    }

    fn schedule_auto_ack(&self, state: &mut ControllerState, event_id: &str, detected_at: Instant) {
        let deadline = detected_at + AUTO_ACK_DELAY;
        let cue_at = deadline
            .checked_sub(REPEAT_CUE_LEAD)
            .unwrap_or(deadline);
        let weak = Arc::downgrade(&self.shared);
        let id = event_id.to_string();

        let task = tokio::spawn(async move {
            tokio::time::sleep_until(tokio::time::Instant::from_std(cue_at)).await;
            match Self::from_weak(&weak) {
                Some(controller) => controller.repeat_cue(&id),
                None => return,
            }
            tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await;
            if let Some(controller) = Self::from_weak(&weak) {
                tracing::debug!("Auto-acknowledging low severity event {}", id);
                if let Err(err) = controller.acknowledge(&id) {
                    tracing::debug!("Auto-acknowledge skipped: {}", err);
                }
            }
        });
        state
            .auto_acks
            .insert(event_id.to_string(), TimerHandle { deadline, task });
    }

    fn repeat_cue(&self, event_id: &str) {
        let now = now();
        let state = self.lock();
        if state.muted || state.shut_down || !state.log.is_active(event_id, now) {
            return;
        }
        let severity = state
            .log
            .get(event_id)
            .map(|e| e.severity)
            .unwrap_or(Severity::Low);
        self.shared.alarm.play(AlarmCue {
            severity,
            volume: Cadence::for_severity(severity).volume,
            repeat: true,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ack::LocalOnlyTransport;
    use crate::notify::{NotificationSettings, NotificationSink, NotifyError};
    use chrono::Utc;

    #[derive(Default)]
    struct Speaker {
        cues: Mutex<Vec<AlarmCue>>,
    }

    impl AlarmSink for Speaker {
        fn play(&self, cue: AlarmCue) {
            self.cues.lock().unwrap().push(cue);
        }
        fn silence(&self) {}
    }

    #[derive(Default)]
    struct Inbox {
        tags: Mutex<Vec<String>>,
    }

    impl NotificationSink for Inbox {
        fn show(&self, notification: &Notification) -> Result<(), NotifyError> {
            self.tags.lock().unwrap().push(notification.tag.clone());
            Ok(())
        }
    }

    fn controller() -> (EscalationController, Arc<Speaker>, Arc<Inbox>) {
        let speaker = Arc::new(Speaker::default());
        let inbox = Arc::new(Inbox::default());
        let (tx, _) = broadcast::channel(64);
        let controller = EscalationController::new(
            speaker.clone(),
            NotificationDispatcher::new(inbox.clone(), NotificationSettings::default()),
            AcknowledgmentStore::new(Arc::new(LocalOnlyTransport)),
            tx,
        );
        (controller, speaker, inbox)
    }

    fn hazard(id: &str, severity: Severity) -> SafetyEvent {
        SafetyEvent {
            id: id.to_string(),
            event_type: SafetyEventType::ProximityConflict,
            severity,
            hex: "A1B2C3".into(),
            hex_2: Some("D4E5F6".into()),
            details: serde_json::Value::Null,
            timestamp: Utc::now(),
            acknowledged: false,
        }
    }

    #[test]
    fn test_cadence_orders_by_severity() {
        let low = Cadence::for_severity(Severity::Low);
        let warning = Cadence::for_severity(Severity::Warning);
        let critical = Cadence::for_severity(Severity::Critical);
        assert!(low.interval() > warning.interval());
        assert!(warning.interval() > critical.interval());
        assert!(low.volume < warning.volume && warning.volume < critical.volume);
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_follows_highest_severity() {
        let (controller, _, _) = controller();
        controller.ingest(hazard("w", Severity::Warning));
        assert!(matches!(
            controller.status().stage,
            AlarmStage::Looping { severity: Severity::Warning, .. }
        ));

        controller.ingest(hazard("c", Severity::Critical));
        assert!(matches!(
            controller.status().stage,
            AlarmStage::Looping { severity: Severity::Critical, .. }
        ));

        controller.acknowledge("c").unwrap();
        assert!(matches!(
            controller.status().stage,
            AlarmStage::Looping { severity: Severity::Warning, .. }
        ));

        controller.acknowledge("w").unwrap();
        assert_eq!(controller.status().stage, AlarmStage::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeat_push_does_not_renotify_or_rearm() {
        let (controller, _, inbox) = controller();
        assert_eq!(controller.ingest(hazard("h", Severity::Warning)), IngestOutcome::Raised);
        controller.acknowledge("h").unwrap();

        assert_eq!(controller.ingest(hazard("h", Severity::Warning)), IngestOutcome::Refreshed);
        assert!(controller.event("h").unwrap().acknowledged);
        assert_eq!(controller.status().stage, AlarmStage::Idle);
        assert_eq!(inbox.tags.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acknowledge_is_idempotent() {
        let (controller, _, _) = controller();
        controller.ingest(hazard("h", Severity::Critical));
        assert!(controller.acknowledge("h").unwrap());
        assert!(!controller.acknowledge("h").unwrap());
        assert!(matches!(
            controller.acknowledge("nope"),
            Err(AckError::UnknownEvent(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_events_age_out_after_window() {
        let (controller, speaker, _) = controller();
        controller.ingest(hazard("h", Severity::Critical));

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(controller.status().stage, AlarmStage::Idle);
        let view = controller.events();
        assert!(view.active.is_empty());
        assert_eq!(view.history.len(), 1);
        assert!(!view.history[0].acknowledged);

        let cues = speaker.cues.lock().unwrap().len();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(speaker.cues.lock().unwrap().len(), cues);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_everything() {
        let (controller, speaker, _) = controller();
        controller.ingest(hazard("low", Severity::Low));
        controller.ingest(hazard("crit", Severity::Critical));
        tokio::task::yield_now().await;

        controller.shutdown();
        let cues = speaker.cues.lock().unwrap().len();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(speaker.cues.lock().unwrap().len(), cues);
        // The auto-ack timer died with the controller state
        assert!(!controller.event("low").unwrap().acknowledged);
        assert_eq!(controller.ingest(hazard("late", Severity::Warning)), IngestOutcome::Ignored);
    }
}

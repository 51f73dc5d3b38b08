//! User-facing notification dispatch.
//!
//! Dispatch never fails from the caller's point of view: missing platform
//! support, missing permission or a disabled preference turn it into a
//! logged no-op, and sink errors are logged and swallowed.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::Serialize;
use skywatch_core::{FiredAlert, SafetyEvent, Severity};
use thiserror::Error;
use tokio::sync::broadcast;

use crate::state::AppEvent;

/// Non-critical notifications close on their own after this long.
pub const AUTO_DISMISS: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notification rejected: {0}")]
    Rejected(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    Granted,
    Denied,
    Default,
}

impl Permission {
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "granted" => Permission::Granted,
            "denied" => Permission::Denied,
            _ => Permission::Default,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct NotificationSettings {
    pub supported: bool,
    pub permission: Permission,
    pub enabled: bool,
}

impl Default for NotificationSettings {
    fn default() -> Self {
        Self {
            supported: true,
            permission: Permission::Granted,
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub tag: String,
    pub title: String,
    pub body: String,
    pub severity: Severity,
    pub require_interaction: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_dismiss_ms: Option<u64>,
}

impl Notification {
    /// Critical notifications stay up until dismissed; the rest time out.
    pub fn new(tag: impl Into<String>, title: impl Into<String>, body: impl Into<String>, severity: Severity) -> Self {
        let critical = severity == Severity::Critical;
        Self {
            tag: tag.into(),
            title: title.into(),
            body: body.into(),
            severity,
            require_interaction: critical,
            auto_dismiss_ms: (!critical).then(|| AUTO_DISMISS.as_millis() as u64),
        }
    }

    pub fn for_event(event: &SafetyEvent) -> Self {
        let body = match event.details.get("altitude_ft").and_then(|v| v.as_f64()) {
            Some(alt) => format!("{} at {:.0} ft", event.hex, alt),
            None => match &event.hex_2 {
                Some(other) => format!("{} and {}", event.hex, other),
                None => event.hex.clone(),
            },
        };
        Self::new(event.dedup_tag(), event.title(), body, event.severity)
    }

    pub fn for_alert(alert: &FiredAlert, tag: String) -> Self {
        let who = alert.callsign.as_deref().unwrap_or(&alert.hex);
        let body = if alert.reasons.is_empty() {
            who.to_string()
        } else {
            format!("{}: {}", who, alert.reasons.join(", "))
        };
        Self::new(tag, alert.rule_name.clone(), body, alert.severity)
    }
}

/// Platform notification facility.
pub trait NotificationSink: Send + Sync {
    fn show(&self, notification: &Notification) -> Result<(), NotifyError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Shown,
    Unsupported,
    PermissionMissing,
    Disabled,
    Failed,
}

#[derive(Clone)]
pub struct NotificationDispatcher {
    sink: Arc<dyn NotificationSink>,
    settings: Arc<RwLock<NotificationSettings>>,
}

impl NotificationDispatcher {
    pub fn new(sink: Arc<dyn NotificationSink>, settings: NotificationSettings) -> Self {
        Self {
            sink,
            settings: Arc::new(RwLock::new(settings)),
        }
    }

    pub fn settings(&self) -> NotificationSettings {
        self.settings.read().map(|s| *s).unwrap_or_default()
    }

    pub fn set_enabled(&self, enabled: bool) {
        if let Ok(mut settings) = self.settings.write() {
            settings.enabled = enabled;
        }
    }

    pub fn set_permission(&self, permission: Permission) {
        if let Ok(mut settings) = self.settings.write() {
            settings.permission = permission;
        }
    }

    pub fn dispatch(&self, notification: &Notification) -> DispatchOutcome {
        let settings = self.settings();
        if !settings.supported {
            tracing::debug!("Notifications unsupported, skipping {}", notification.tag);
            return DispatchOutcome::Unsupported;
        }
        if settings.permission != Permission::Granted {
            tracing::debug!("Notification permission {:?}, skipping {}", settings.permission, notification.tag);
            return DispatchOutcome::PermissionMissing;
        }
        if !settings.enabled {
            tracing::debug!("Notifications disabled, skipping {}", notification.tag);
            return DispatchOutcome::Disabled;
        }

        match self.sink.show(notification) {
            Ok(()) => DispatchOutcome::Shown,
            Err(err) => {
                tracing::warn!("Notification {} failed: {}", notification.tag, err);
                DispatchOutcome::Failed
            }
        }
    }
}

/// Delivers notifications to connected clients over the event bus.
pub struct BusNotificationSink {
    tx: broadcast::Sender<AppEvent>,
}

impl BusNotificationSink {
    pub fn new(tx: broadcast::Sender<AppEvent>) -> Self {
        Self { tx }
    }
}

impl NotificationSink for BusNotificationSink {
    fn show(&self, notification: &Notification) -> Result<(), NotifyError> {
        tracing::info!("Notify [{:?}] {}: {}", notification.severity, notification.title, notification.body);
        // No subscribers is not an error: nobody is watching right now.
        let _ = self.tx.send(AppEvent::Notification(notification.clone()));
        Ok(())
    }
}

//! Server configuration from environment.

use std::env;

use skywatch_core::ReferencePoint;

use crate::notify::{NotificationSettings, Permission};

#[derive(Debug, Clone)]
pub struct Config {
    pub server_port: u16,
    pub feed_url: String,
    /// Base URL of the backend that receives acknowledgments. Acks stay
    /// local when unset.
    pub ack_base_url: Option<String>,
    pub database_path: String,
    pub database_max_connections: u32,
    pub rule_loop_interval_ms: u64,
    pub feed_request_timeout_ms: u64,
    pub reference: Option<ReferencePoint>,
    pub notifications_enabled: bool,
    pub notification_permission: Permission,
}

impl Config {
    pub fn from_env() -> Self {
        let reference = match (env_parse::<f64>("SKYWATCH_REF_LAT"), env_parse::<f64>("SKYWATCH_REF_LON")) {
            (Some(lat), Some(lon)) => Some(ReferencePoint::new(lat, lon)),
            _ => None,
        };

        Self {
            server_port: env_parse("SKYWATCH_PORT").unwrap_or(3000),
            feed_url: env::var("SKYWATCH_FEED_URL")
                .unwrap_or_else(|_| "ws://localhost:8080/ws".to_string()),
            ack_base_url: env::var("SKYWATCH_ACK_URL")
                .ok()
                .map(|s| s.trim().trim_end_matches('/').to_string())
                .filter(|s| !s.is_empty()),
            database_path: env::var("SKYWATCH_DB_PATH")
                .unwrap_or_else(|_| "data/skywatch.db".to_string()),
            database_max_connections: env_parse("SKYWATCH_DB_MAX_CONNECTIONS").unwrap_or(5),
            rule_loop_interval_ms: env_parse("SKYWATCH_RULE_INTERVAL_MS").unwrap_or(1000),
            feed_request_timeout_ms: env_parse("SKYWATCH_FEED_TIMEOUT_MS").unwrap_or(5000),
            reference,
            notifications_enabled: env_bool("SKYWATCH_NOTIFICATIONS", true),
            notification_permission: env::var("SKYWATCH_NOTIFICATION_PERMISSION")
                .ok()
                .map(|s| Permission::parse(&s))
                .unwrap_or(Permission::Granted),
        }
    }

    pub fn notification_settings(&self) -> NotificationSettings {
        NotificationSettings {
            supported: true,
            permission: self.notification_permission,
            enabled: self.notifications_enabled,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

fn env_bool(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(value) => matches!(
            value.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => default,
    }
}

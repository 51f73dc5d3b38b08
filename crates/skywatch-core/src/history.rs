//! Ring buffer of fired rule alerts, newest first.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::safety::Severity;

pub const ALERT_HISTORY_CAPACITY: usize = 100;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FiredAlert {
    pub rule_id: String,
    pub rule_name: String,
    pub hex: String,
    #[serde(default)]
    pub callsign: Option<String>,
    pub severity: Severity,
    #[serde(default)]
    pub reasons: Vec<String>,
    #[serde(default)]
    pub distance_nm: Option<f64>,
    pub fired_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AlertHistory {
    entries: VecDeque<FiredAlert>,
}

impl AlertHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, alert: FiredAlert) {
        self.entries.push_front(alert);
        self.entries.truncate(ALERT_HISTORY_CAPACITY);
    }

    pub fn iter(&self) -> impl Iterator<Item = &FiredAlert> {
        self.entries.iter()
    }

    pub fn to_vec(&self) -> Vec<FiredAlert> {
        self.entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

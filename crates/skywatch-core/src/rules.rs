//! Alert rules: condition trees, ingestion and matching.
//!
//! Rules arrive in one of several historical shapes: a `{logic, groups}`
//! tree, a flat list of conditions, or a single `{type, operator, value}`
//! condition (possibly spread over the rule's own top-level fields).
//! [`AlertRule`] only ever holds the canonical tree; the other shapes are
//! normalized when the rule is ingested.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::conditions::{Condition, ConditionType, Operator};
use crate::error::RuleError;
use crate::models::TelemetryRecord;
use crate::safety::Severity;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Logic {
    #[default]
    #[serde(alias = "and")]
    And,
    #[serde(alias = "or")]
    Or,
}

/// Conditions combined by AND/OR.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConditionGroup {
    #[serde(default)]
    pub logic: Logic,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl ConditionGroup {
    pub fn new(logic: Logic, conditions: Vec<Condition>) -> Self {
        Self { logic, conditions }
    }

    /// An empty group never matches, whatever its logic.
    pub fn evaluate(&self, record: &TelemetryRecord, distance: Option<f64>) -> bool {
        self.explain(record, distance).is_some()
    }

    /// On a match, the reasons of every satisfied condition in the group.
    pub fn explain(&self, record: &TelemetryRecord, distance: Option<f64>) -> Option<Vec<String>> {
        if self.conditions.is_empty() {
            return None;
        }
        let results: Vec<Option<String>> = self
            .conditions
            .iter()
            .map(|c| c.explain(record, distance))
            .collect();
        combine(self.logic, results)
    }
}

/// Top-level tree: groups combined by AND/OR.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleConditions {
    #[serde(default)]
    pub logic: Logic,
    #[serde(default)]
    pub groups: Vec<ConditionGroup>,
}

/// Result of matching a rule against one record.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MatchOutcome {
    pub matched: bool,
    /// One entry per satisfied leaf condition; empty when not matched.
    pub reasons: Vec<String>,
}

impl RuleConditions {
    pub fn new(logic: Logic, groups: Vec<ConditionGroup>) -> Self {
        Self { logic, groups }
    }

    /// A one-condition AND tree.
    pub fn single(condition: Condition) -> Self {
        Self::new(
            Logic::And,
            vec![ConditionGroup::new(Logic::And, vec![condition])],
        )
    }

    pub fn evaluate(&self, record: &TelemetryRecord, distance: Option<f64>) -> MatchOutcome {
        if self.groups.is_empty() {
            return MatchOutcome::default();
        }
        let results: Vec<Option<Vec<String>>> = self
            .groups
            .iter()
            .map(|g| g.explain(record, distance))
            .collect();
        match combine(self.logic, results) {
            Some(nested) => MatchOutcome {
                matched: true,
                reasons: nested.into_iter().flatten().collect(),
            },
            None => MatchOutcome::default(),
        }
    }

    pub fn matches(&self, record: &TelemetryRecord, distance: Option<f64>) -> bool {
        self.evaluate(record, distance).matched
    }

    /// Strict check applied at ingestion.
    pub fn validate(&self) -> Result<(), RuleError> {
        if self.groups.is_empty() {
            return Err(RuleError::EmptyConditions);
        }
        if let Some(idx) = self.groups.iter().position(|g| g.conditions.is_empty()) {
            return Err(RuleError::EmptyGroup(idx));
        }
        Ok(())
    }

    pub fn leaf_count(&self) -> usize {
        self.groups.iter().map(|g| g.conditions.len()).sum()
    }
}

/// AND keeps every satisfied entry only when all are satisfied; OR keeps the
/// satisfied ones when at least one is.
fn combine<T>(logic: Logic, results: Vec<Option<T>>) -> Option<Vec<T>> {
    match logic {
        Logic::And => results.into_iter().collect(),
        Logic::Or => {
            let hits: Vec<T> = results.into_iter().flatten().collect();
            (!hits.is_empty()).then_some(hits)
        }
    }
}

/// Delivery channels selected for a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationChannels {
    #[serde(default = "default_true")]
    pub desktop: bool,
    #[serde(default)]
    pub sound: bool,
    #[serde(default = "default_true")]
    pub history: bool,
}

impl Default for NotificationChannels {
    fn default() -> Self {
        Self {
            desktop: true,
            sound: false,
            history: true,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_cooldown() -> u64 {
    300
}

/// A rule as submitted by an author, before normalization.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RuleDefinition {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub severity: Severity,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub starts_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub conditions: Option<serde_json::Value>,
    /// Legacy single-condition fields stored on the rule itself.
    #[serde(default, rename = "type")]
    pub legacy_type: Option<ConditionType>,
    #[serde(default, rename = "operator")]
    pub legacy_operator: Option<Operator>,
    #[serde(default, rename = "value")]
    pub legacy_value: Option<serde_json::Value>,
    #[serde(default = "default_cooldown", alias = "cooldown")]
    pub cooldown_secs: u64,
    #[serde(default)]
    pub channels: NotificationChannels,
}

/// An ingested rule. Holds the canonical condition tree only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RuleDefinition")]
pub struct AlertRule {
    pub id: String,
    pub name: String,
    pub severity: Severity,
    pub enabled: bool,
    pub starts_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub conditions: RuleConditions,
    pub cooldown_secs: u64,
    pub channels: NotificationChannels,
}

impl TryFrom<RuleDefinition> for AlertRule {
    type Error = RuleError;

    fn try_from(def: RuleDefinition) -> Result<Self, Self::Error> {
        let id = def
            .id
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or(RuleError::MissingId)?
            .to_string();
        if let (Some(start), Some(end)) = (def.starts_at, def.expires_at) {
            if end <= start {
                return Err(RuleError::InvertedWindow);
            }
        }
        let legacy = def.legacy_type.map(|kind| Condition {
            kind,
            operator: def.legacy_operator.unwrap_or_default(),
            value: def
                .legacy_value
                .as_ref()
                .map(value_to_text)
                .unwrap_or_default(),
        });
        let conditions = normalize_conditions(def.conditions.as_ref(), legacy)?;
        let name = if def.name.trim().is_empty() {
            id.clone()
        } else {
            def.name
        };

        Ok(Self {
            id,
            name,
            severity: def.severity,
            enabled: def.enabled,
            starts_at: def.starts_at,
            expires_at: def.expires_at,
            conditions,
            cooldown_secs: def.cooldown_secs,
            channels: def.channels,
        })
    }
}

impl AlertRule {
    pub fn evaluate(&self, record: &TelemetryRecord, distance: Option<f64>) -> MatchOutcome {
        self.conditions.evaluate(record, distance)
    }

    /// Enabled and inside its active window.
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.enabled
            && self.starts_at.map_or(true, |start| start <= now)
            && self.expires_at.map_or(true, |end| now < end)
    }

    /// Dedup tag for a rule alert on one aircraft.
    pub fn alert_tag(&self, hex: &str) -> String {
        format!("rule-{}-{}", self.id, hex)
    }
}

/// Resolve a legacy condition representation to the canonical tree.
///
/// Tried in order until one yields content: a tree with at least one
/// group, a flat list, a single condition object, then the legacy
/// top-level condition. A tree that is present but empty is rejected when
/// nothing else supplies conditions.
pub fn normalize_conditions(
    raw: Option<&serde_json::Value>,
    legacy: Option<Condition>,
) -> Result<RuleConditions, RuleError> {
    let mut saw_empty_tree = false;

    match raw {
        Some(value @ serde_json::Value::Object(map)) if map.contains_key("groups") => {
            let tree: RuleConditions = serde_json::from_value(value.clone())
                .map_err(|e| RuleError::Malformed(e.to_string()))?;
            if tree.groups.is_empty() {
                saw_empty_tree = true;
            } else {
                tree.validate()?;
                return Ok(tree);
            }
        }
        Some(value @ serde_json::Value::Array(items)) if !items.is_empty() => {
            let conditions: Vec<Condition> = serde_json::from_value(value.clone())
                .map_err(|e| RuleError::Malformed(e.to_string()))?;
            return Ok(RuleConditions::new(
                Logic::And,
                vec![ConditionGroup::new(Logic::And, conditions)],
            ));
        }
        Some(value @ serde_json::Value::Object(map)) if map.contains_key("type") => {
            let condition: Condition = serde_json::from_value(value.clone())
                .map_err(|e| RuleError::Malformed(e.to_string()))?;
            return Ok(RuleConditions::single(condition));
        }
        _ => {}
    }

    if let Some(condition) = legacy {
        return Ok(RuleConditions::single(condition));
    }
    if saw_empty_tree {
        Err(RuleError::EmptyConditions)
    } else {
        Err(RuleError::MissingConditions)
    }
}

fn value_to_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Null => String::new(),
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Prefilled rule offered when a user asks to create a rule from an aircraft.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuleDraft {
    pub name: String,
    pub severity: Severity,
    pub conditions: RuleConditions,
}

pub fn draft_from_record(record: &TelemetryRecord) -> RuleDraft {
    let mut conditions = vec![Condition::new(
        ConditionType::Identifier,
        Operator::Eq,
        record.hex.clone(),
    )];
    if let Some(callsign) = record.callsign() {
        conditions.push(Condition::new(
            ConditionType::Callsign,
            Operator::Eq,
            callsign.to_uppercase(),
        ));
    }
    let label = record.callsign().unwrap_or(&record.hex).to_uppercase();

    RuleDraft {
        name: format!("Track {label}"),
        severity: Severity::Warning,
        conditions: RuleConditions::new(
            Logic::And,
            vec![ConditionGroup::new(Logic::Or, conditions)],
        ),
    }
}

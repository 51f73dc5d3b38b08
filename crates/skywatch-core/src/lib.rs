pub mod conditions;
pub mod dedup;
pub mod error;
pub mod history;
pub mod matching;
pub mod models;
pub mod rules;
pub mod safety;
pub mod spatial;

pub use conditions::{Condition, ConditionClass, ConditionType, Operator};
pub use dedup::{DedupEntry, DedupLedger, Retention, EMERGENCY_GRACE};
pub use error::RuleError;
pub use history::{AlertHistory, FiredAlert, ALERT_HISTORY_CAPACITY};
pub use matching::{match_snapshot, MatchSet, RuleMatch};
pub use models::{normalize_hex, TelemetryRecord, TelemetrySnapshot, EMERGENCY_SQUAWKS};
pub use rules::{
    draft_from_record, normalize_conditions, AlertRule, ConditionGroup, Logic, MatchOutcome,
    NotificationChannels, RuleConditions, RuleDefinition, RuleDraft,
};
pub use safety::{
    classify_emergency, classify_hazard, classify_snapshot, HazardPush, SafetyEvent,
    SafetyEventLog, SafetyEventType, Severity, ACTIVE_WINDOW,
};
pub use spatial::{haversine_nm, ReferencePoint};

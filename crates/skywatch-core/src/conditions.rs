//! Typed conditions and their evaluation against a single telemetry record.
//!
//! Evaluation never fails: missing fields, unknown types and malformed
//! thresholds all resolve to "no match".

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

use crate::models::TelemetryRecord;

/// Field a condition inspects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionType {
    #[serde(alias = "hex", alias = "icao")]
    Identifier,
    Callsign,
    Squawk,
    AltitudeAbove,
    AltitudeBelow,
    SpeedAbove,
    SpeedBelow,
    VerticalRate,
    DistanceWithin,
    DistanceFromReference,
    Military,
    Emergency,
    LawEnforcement,
    Helicopter,
    #[serde(alias = "type")]
    AircraftType,
    Registration,
    Category,
    #[serde(other)]
    Unknown,
}

impl ConditionType {
    pub fn class(self) -> ConditionClass {
        use ConditionType::*;
        match self {
            Identifier | Callsign | Squawk | AircraftType | Registration | Category => {
                ConditionClass::Text
            }
            AltitudeAbove | AltitudeBelow | SpeedAbove | SpeedBelow | VerticalRate
            | DistanceWithin | DistanceFromReference => ConditionClass::Numeric,
            Military | Emergency | LawEnforcement | Helicopter => ConditionClass::Flag,
            Unknown => ConditionClass::Unknown,
        }
    }
}

/// Operator family a condition type accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionClass {
    Text,
    Numeric,
    Flag,
    Unknown,
}

impl ConditionClass {
    /// The operator a condition of this class evaluates with. Anything
    /// outside the family falls back to equality.
    pub fn resolve(self, op: Operator) -> Operator {
        match (self, op) {
            (
                ConditionClass::Text,
                Operator::Neq | Operator::Contains | Operator::StartsWith | Operator::EndsWith,
            ) => op,
            (
                ConditionClass::Numeric,
                Operator::Neq | Operator::Lt | Operator::Gt | Operator::Lte | Operator::Gte,
            ) => op,
            _ => Operator::Eq,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operator {
    #[default]
    #[serde(alias = "equals", alias = "==")]
    Eq,
    #[serde(alias = "ne", alias = "not_equals", alias = "!=")]
    Neq,
    Contains,
    #[serde(alias = "starts_with")]
    StartsWith,
    #[serde(alias = "ends_with")]
    EndsWith,
    #[serde(alias = "<")]
    Lt,
    #[serde(alias = ">")]
    Gt,
    #[serde(alias = "<=")]
    Lte,
    #[serde(alias = ">=")]
    Gte,
    Is,
    #[serde(other)]
    Unknown,
}

impl Operator {
    fn describe(self) -> &'static str {
        match self {
            Operator::Neq => "is not",
            Operator::Contains => "contains",
            Operator::StartsWith => "starts with",
            Operator::EndsWith => "ends with",
            Operator::Lt => "<",
            Operator::Gt => ">",
            Operator::Lte => "<=",
            Operator::Gte => ">=",
            _ => "is",
        }
    }
}

/// One typed comparison against a telemetry field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    #[serde(rename = "type")]
    pub kind: ConditionType,
    #[serde(default)]
    pub operator: Operator,
    #[serde(default, deserialize_with = "value_as_text")]
    pub value: String,
}

impl Condition {
    pub fn new(kind: ConditionType, operator: Operator, value: impl Into<String>) -> Self {
        Self {
            kind,
            operator,
            value: value.into(),
        }
    }

    /// Operator after resolving it against the type's class.
    pub fn effective_operator(&self) -> Operator {
        self.kind.class().resolve(self.operator)
    }

    /// Evaluate against one record.
    ///
    /// `distance` overrides the record's own range for distance conditions.
    pub fn evaluate(&self, record: &TelemetryRecord, distance: Option<f64>) -> bool {
        self.explain(record, distance).is_some()
    }

    /// Evaluate and, on a match, return the human-readable reason.
    pub fn explain(&self, record: &TelemetryRecord, distance: Option<f64>) -> Option<String> {
        use ConditionType::*;
        match self.kind {
            Identifier => self.text_match("Hex", Some(record.hex.as_str())),
            Callsign => self.text_match("Callsign", record.callsign()),
            Squawk => self.text_match("Squawk", record.squawk.as_deref()),
            AircraftType => self.text_match("Type", record.type_code.as_deref()),
            Registration => self.text_match("Registration", record.registration.as_deref()),
            Category => self.text_match("Category", record.category.as_deref()),
            AltitudeAbove => {
                let (alt, limit) = (record.altitude_ft()?, self.threshold()?);
                (alt > limit).then(|| format!("Altitude {alt:.0} ft above {limit:.0} ft"))
            }
            AltitudeBelow => {
                let (alt, limit) = (record.altitude_ft()?, self.threshold()?);
                (alt < limit).then(|| format!("Altitude {alt:.0} ft below {limit:.0} ft"))
            }
            SpeedAbove => {
                let (gs, limit) = (record.ground_speed_kt()?, self.threshold()?);
                (gs > limit).then(|| format!("Speed {gs:.0} kt above {limit:.0} kt"))
            }
            SpeedBelow => {
                let (gs, limit) = (record.ground_speed_kt()?, self.threshold()?);
                (gs < limit).then(|| format!("Speed {gs:.0} kt below {limit:.0} kt"))
            }
            VerticalRate => {
                let (rate, limit) = (record.vertical_rate_fpm()?, self.threshold()?);
                let op = self.effective_operator();
                compare(op, rate, limit).then(|| {
                    format!("Vertical rate {rate:.0} fpm {} {limit:.0} fpm", op.describe())
                })
            }
            DistanceWithin | DistanceFromReference => {
                let range = distance
                    .or(record.distance_nm)
                    .filter(|d| d.is_finite())?;
                let limit = self.threshold()?;
                match self.effective_operator() {
                    Operator::Gt => {
                        (range > limit).then(|| format!("Beyond {limit} nm ({range:.1} nm)"))
                    }
                    Operator::Gte => {
                        (range >= limit).then(|| format!("Beyond {limit} nm ({range:.1} nm)"))
                    }
                    _ => (range <= limit).then(|| format!("Within {limit} nm ({range:.1} nm)")),
                }
            }
            Military => self.flag_match(record.military, "Military aircraft", "Non-military aircraft"),
            Emergency => self.flag_match(record.has_emergency(), "Emergency", "No emergency"),
            LawEnforcement => self.flag_match(
                record.law_enforcement,
                "Law enforcement aircraft",
                "Not law enforcement",
            ),
            Helicopter => self.flag_match(record.is_helicopter(), "Helicopter", "Not a helicopter"),
            Unknown => None,
        }
    }

    fn threshold(&self) -> Option<f64> {
        self.value
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
    }

    fn text_match(&self, label: &str, actual: Option<&str>) -> Option<String> {
        let actual = actual?.trim().to_uppercase();
        let expected = self.value.trim().to_uppercase();
        let op = self.effective_operator();
        let hit = match op {
            Operator::Neq => actual != expected,
            Operator::Contains => actual.contains(&expected),
            Operator::StartsWith => actual.starts_with(&expected),
            Operator::EndsWith => actual.ends_with(&expected),
            _ => actual == expected,
        };
        hit.then(|| format!("{label} {} {expected}", op.describe()))
    }

    fn flag_match(&self, actual: bool, when_true: &str, when_false: &str) -> Option<String> {
        let expected = expects_true(&self.value);
        (actual == expected).then(|| {
            if actual {
                when_true.to_string()
            } else {
                when_false.to_string()
            }
        })
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} {:?} {:?}", self.kind, self.operator, self.value)
    }
}

/// `""`, `true`, `yes` and `1` (any case) mean "expect the flag set".
pub fn expects_true(value: &str) -> bool {
    let v = value.trim();
    v.is_empty()
        || v.eq_ignore_ascii_case("true")
        || v.eq_ignore_ascii_case("yes")
        || v == "1"
}

fn compare(op: Operator, actual: f64, limit: f64) -> bool {
    match op {
        Operator::Neq => actual != limit,
        Operator::Lt => actual < limit,
        Operator::Gt => actual > limit,
        Operator::Lte => actual <= limit,
        Operator::Gte => actual >= limit,
        _ => actual == limit,
    }
}

/// Rule authors send values as strings, numbers or booleans.
fn value_as_text<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(serde_json::Value::Null) => String::new(),
        Some(serde_json::Value::String(s)) => s,
        Some(other) => other.to_string(),
    })
}

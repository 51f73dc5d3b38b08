//! Core data models for live aircraft telemetry.

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::spatial::ReferencePoint;

/// Squawk codes that always indicate an emergency.
pub const EMERGENCY_SQUAWKS: [&str; 3] = ["7500", "7600", "7700"];

/// Human label for an emergency squawk.
pub fn emergency_squawk(squawk: &str) -> Option<&'static str> {
    match squawk.trim() {
        "7500" => Some("Hijack"),
        "7600" => Some("Radio failure"),
        "7700" => Some("Emergency"),
        _ => None,
    }
}

/// One aircraft as reported by the telemetry feed.
///
/// Field names follow the feed's JSON; the feed may send several altitude
/// and vertical-rate sources which collapse to one logical value through
/// [`TelemetryRecord::altitude_ft`] and [`TelemetryRecord::vertical_rate_fpm`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRecord {
    #[serde(alias = "icao", deserialize_with = "uppercase_id")]
    pub hex: String,
    #[serde(default, alias = "callsign")]
    pub flight: Option<String>,
    /// ICAO aircraft type designator, e.g. `B738`
    #[serde(default, rename = "t", alias = "type_code")]
    pub type_code: Option<String>,
    #[serde(default, rename = "r", alias = "registration")]
    pub registration: Option<String>,
    #[serde(default, deserialize_with = "lenient_altitude")]
    pub alt_baro: Option<f64>,
    #[serde(default, deserialize_with = "lenient_altitude")]
    pub alt_geom: Option<f64>,
    #[serde(default, deserialize_with = "lenient_altitude")]
    pub altitude: Option<f64>,
    /// Ground speed in knots
    #[serde(default, alias = "ground_speed", deserialize_with = "lenient_f64")]
    pub gs: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub track: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub baro_rate: Option<f64>,
    #[serde(default, alias = "vertical_rate", deserialize_with = "lenient_f64")]
    pub geom_rate: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub lat: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub lon: Option<f64>,
    #[serde(default)]
    pub squawk: Option<String>,
    /// Range from the reference point in nautical miles, when the feed supplies it
    #[serde(default, alias = "distance", deserialize_with = "lenient_f64")]
    pub distance_nm: Option<f64>,
    #[serde(default, deserialize_with = "lenient_flag")]
    pub military: bool,
    #[serde(default, deserialize_with = "lenient_flag")]
    pub emergency: bool,
    #[serde(default, deserialize_with = "lenient_flag")]
    pub law_enforcement: bool,
    #[serde(default, deserialize_with = "lenient_flag")]
    pub helicopter: bool,
    /// ADS-B emitter category, e.g. `A3`
    #[serde(default)]
    pub category: Option<String>,
}

impl TelemetryRecord {
    pub fn new(hex: impl AsRef<str>) -> Self {
        Self {
            hex: normalize_hex(hex.as_ref()),
            ..Default::default()
        }
    }

    /// Logical altitude in feet: barometric, then geometric, then generic.
    pub fn altitude_ft(&self) -> Option<f64> {
        self.alt_baro
            .or(self.alt_geom)
            .or(self.altitude)
            .filter(|v| v.is_finite())
    }

    pub fn vertical_rate_fpm(&self) -> Option<f64> {
        self.baro_rate.or(self.geom_rate).filter(|v| v.is_finite())
    }

    pub fn ground_speed_kt(&self) -> Option<f64> {
        self.gs.filter(|v| v.is_finite())
    }

    pub fn position(&self) -> Option<(f64, f64)> {
        match (self.lat, self.lon) {
            (Some(lat), Some(lon)) if lat.is_finite() && lon.is_finite() => Some((lat, lon)),
            _ => None,
        }
    }

    pub fn callsign(&self) -> Option<&str> {
        self.flight.as_deref().map(str::trim).filter(|s| !s.is_empty())
    }

    pub fn is_helicopter(&self) -> bool {
        self.helicopter
            || self
                .category
                .as_deref()
                .is_some_and(|c| c.trim().eq_ignore_ascii_case("A7"))
    }

    /// True when squawking an emergency code or flagged by the feed.
    pub fn has_emergency(&self) -> bool {
        self.emergency || self.emergency_squawk().is_some()
    }

    pub fn emergency_squawk(&self) -> Option<&str> {
        self.squawk
            .as_deref()
            .map(str::trim)
            .filter(|s| EMERGENCY_SQUAWKS.contains(s))
    }

    /// Range used for distance conditions: feed-supplied first, then computed
    /// from the reference point.
    pub fn resolve_distance(&self, reference: Option<&ReferencePoint>) -> Option<f64> {
        if let Some(d) = self.distance_nm.filter(|d| d.is_finite()) {
            return Some(d);
        }
        let reference = reference?;
        let (lat, lon) = self.position()?;
        reference.distance_to(lat, lon)
    }
}

/// Canonical identifier form: trimmed, uppercase.
pub fn normalize_hex(hex: &str) -> String {
    hex.trim().to_ascii_uppercase()
}

/// Immutable view of the telemetry set at one instant.
///
/// Handed to evaluators as an `Arc`; never mutated after construction.
#[derive(Debug, Clone, Default)]
pub struct TelemetrySnapshot {
    pub version: u64,
    pub reference: Option<ReferencePoint>,
    records: Arc<HashMap<String, TelemetryRecord>>,
}

impl TelemetrySnapshot {
    pub fn new(
        version: u64,
        reference: Option<ReferencePoint>,
        records: HashMap<String, TelemetryRecord>,
    ) -> Self {
        Self {
            version,
            reference,
            records: Arc::new(records),
        }
    }

    /// Build from a list, keeping the last record seen per identifier.
    /// Records without an identifier are dropped.
    pub fn from_records(
        version: u64,
        reference: Option<ReferencePoint>,
        records: impl IntoIterator<Item = TelemetryRecord>,
    ) -> Self {
        let map = records
            .into_iter()
            .map(|mut r| {
                r.hex = normalize_hex(&r.hex);
                r
            })
            .filter(|r| !r.hex.is_empty())
            .map(|r| (r.hex.clone(), r))
            .collect();
        Self::new(version, reference, map)
    }

    pub fn get(&self, hex: &str) -> Option<&TelemetryRecord> {
        self.records.get(&normalize_hex(hex))
    }

    pub fn records(&self) -> impl Iterator<Item = &TelemetryRecord> {
        self.records.values()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

fn uppercase_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    let raw = String::deserialize(deserializer)?;
    Ok(normalize_hex(&raw))
}

fn lenient_f64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<f64>, D::Error> {
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(value_to_f64))
}

fn lenient_altitude<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<f64>, D::Error> {
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::String(s)) if s.trim().eq_ignore_ascii_case("ground") => Some(0.0),
        other => other.as_ref().and_then(value_to_f64),
    })
}

fn lenient_flag<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::Bool(b)) => b,
        Some(serde_json::Value::Number(n)) => n.as_f64().is_some_and(|v| v != 0.0),
        Some(serde_json::Value::String(s)) => {
            let s = s.trim();
            !(s.is_empty()
                || s.eq_ignore_ascii_case("none")
                || s.eq_ignore_ascii_case("false")
                || s == "0")
        }
        _ => false,
    })
}

fn value_to_f64(value: &serde_json::Value) -> Option<f64> {
    let v = match value {
        serde_json::Value::Number(n) => n.as_f64()?,
        serde_json::Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    v.is_finite().then_some(v)
}

//! Apply one rule across a telemetry snapshot.
//!
//! Used for rule previews and by the rule alert loop. The pass reads a
//! single immutable snapshot; the live telemetry set is never touched.

use serde::Serialize;
use std::cmp::Ordering;

use crate::models::{TelemetryRecord, TelemetrySnapshot};
use crate::rules::RuleConditions;

/// A record that satisfied the rule, with its range and match trace.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuleMatch {
    pub record: TelemetryRecord,
    pub distance_nm: Option<f64>,
    pub reasons: Vec<String>,
}

/// Result of a pass, tagged with the snapshot version it ran against.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MatchSet {
    pub snapshot_version: u64,
    pub evaluated: usize,
    pub matches: Vec<RuleMatch>,
}

/// Every record matching `conditions`, nearest first.
///
/// Records without a range sort after those with one, then by identifier
/// so the order is stable across passes.
pub fn match_snapshot(conditions: &RuleConditions, snapshot: &TelemetrySnapshot) -> MatchSet {
    let mut matches: Vec<RuleMatch> = snapshot
        .records()
        .filter_map(|record| {
            let distance = record.resolve_distance(snapshot.reference.as_ref());
            let outcome = conditions.evaluate(record, distance);
            outcome.matched.then(|| RuleMatch {
                record: record.clone(),
                distance_nm: distance,
                reasons: outcome.reasons,
            })
        })
        .collect();

    matches.sort_by(compare_matches);

    MatchSet {
        snapshot_version: snapshot.version,
        evaluated: snapshot.len(),
        matches,
    }
}

fn compare_matches(a: &RuleMatch, b: &RuleMatch) -> Ordering {
    match (a.distance_nm, b.distance_nm) {
        (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
    .then_with(|| a.record.hex.cmp(&b.record.hex))
}

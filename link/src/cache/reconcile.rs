//! Similarity matching between a broadcast row and locally pending rows.
//!
//! A broadcast INSERT for a row this client created optimistically carries
//! the server id, while the local copy still carries a temporary negative id.
//! Instead of inserting a duplicate, the cache looks for a pending row whose
//! non-system fields mostly agree with the broadcast and promotes it.

use chrono::{DateTime, NaiveDateTime};
use serde_json::Value as JsonValue;

use crate::models::{CacheRow, ReconciliationPolicy, Row};

/// Fraction of comparable fields on `pending` that agree with `incoming`.
///
/// `None` when `pending` has fewer comparable fields than the policy
/// requires.
pub(crate) fn match_ratio(pending: &Row, incoming: &Row, policy: &ReconciliationPolicy) -> Option<f64> {
    let mut compared = 0usize;
    let mut equal = 0usize;
    for (key, value) in pending {
        if policy.is_system_field(key) {
            continue;
        }
        compared += 1;
        if values_match(Some(value), incoming.get(key), policy.timestamp_tolerance_ms) {
            equal += 1;
        }
    }

    if compared < policy.min_comparable_fields.max(1) {
        return None;
    }
    Some(equal as f64 / compared as f64)
}

/// Index of the pending row that best matches `incoming`.
///
/// Only tentative rows (pending, negative id) are candidates. Ties go to the
/// earliest-created row, which is the first one in snapshot order.
pub(crate) fn find_pending_match(
    rows: &[CacheRow],
    incoming: &Row,
    policy: &ReconciliationPolicy,
) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (idx, row) in rows.iter().enumerate() {
        if !(row.pending && row.is_tentative()) {
            continue;
        }
        let Some(ratio) = match_ratio(&row.data, incoming, policy) else {
            continue;
        };
        if ratio + f64::EPSILON < policy.match_ratio {
            continue;
        }
        match best {
            Some((_, best_ratio)) if ratio <= best_ratio => {},
            _ => best = Some((idx, ratio)),
        }
    }
    best.map(|(idx, _)| idx)
}

fn is_nullish(value: Option<&JsonValue>) -> bool {
    matches!(value, None | Some(JsonValue::Null))
}

fn values_match(a: Option<&JsonValue>, b: Option<&JsonValue>, tolerance_ms: i64) -> bool {
    if is_nullish(a) || is_nullish(b) {
        return is_nullish(a) && is_nullish(b);
    }
    let (Some(a), Some(b)) = (a, b) else {
        return false;
    };

    match (a, b) {
        (JsonValue::Number(x), JsonValue::Number(y)) => x.as_f64() == y.as_f64(),
        (JsonValue::String(x), JsonValue::String(y)) => {
            if x == y {
                return true;
            }
            match (parse_timestamp_ms(x), parse_timestamp_ms(y)) {
                (Some(tx), Some(ty)) => (tx - ty).abs() <= tolerance_ms,
                _ => false,
            }
        },
        _ => a == b,
    }
}

/// Millis since Unix epoch for RFC 3339 and Postgres-style timestamps.
///
/// Timestamps without an offset are read as UTC.
pub(crate) fn parse_timestamp_ms(value: &str) -> Option<i64> {
    let value = value.trim();
    // Cheap reject for ordinary strings.
    if value.len() < 10 || !value.as_bytes()[..4].iter().all(u8::is_ascii_digit) {
        return None;
    }

    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Some(ts.timestamp_millis());
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f%#z", "%Y-%m-%dT%H:%M:%S%.f%#z"] {
        if let Ok(ts) = DateTime::parse_from_str(value, format) {
            return Some(ts.timestamp_millis());
        }
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(ts) = NaiveDateTime::parse_from_str(value, format) {
            return Some(ts.and_utc().timestamp_millis());
        }
    }
    None
}

//! Value combination for concurrent state writes.

use super::ResolutionStrategy;
use crate::error::{CoordinationError, Result};
use crate::state::transform::add_numbers;
use chrono::DateTime;
use serde_json::Value;

/// Strategy picked for `key` when the caller asked for a plain `merge`.
pub fn strategy_for_key(key: &str) -> ResolutionStrategy {
    let key = key.to_lowercase();
    if key.ends_with("_list") || key.ends_with("_array") {
        ResolutionStrategy::MergeLists
    } else if key.ends_with("_count") || key.ends_with("_total") {
        ResolutionStrategy::SumValues
    } else if key.ends_with("_timestamp") || key.ends_with("_updated") {
        ResolutionStrategy::LatestTimestamp
    } else {
        ResolutionStrategy::LastWriteWins
    }
}

/// Combine the stored value with the concurrent proposal.
pub fn combine(
    strategy: ResolutionStrategy,
    stored: Option<&Value>,
    proposed: &Value,
) -> Result<Value> {
    let Some(stored) = stored.filter(|v| !v.is_null()) else {
        return Ok(proposed.clone());
    };

    match strategy {
        ResolutionStrategy::MergeLists => Ok(merge_lists(stored, proposed)),
        ResolutionStrategy::SumValues => match (stored, proposed) {
            (Value::Number(a), Value::Number(b)) => Ok(Value::Number(add_numbers(a, b)?)),
            _ => Err(CoordinationError::validation(
                "sum_values needs two numeric values",
            )),
        },
        ResolutionStrategy::LatestTimestamp => Ok(latest(stored, proposed).clone()),
        ResolutionStrategy::LastWriteWins => Ok(proposed.clone()),
        other => Err(CoordinationError::validation(format!(
            "{other} does not combine values"
        ))),
    }
}

/// Stored items first, then proposed items not already present.
fn merge_lists(stored: &Value, proposed: &Value) -> Value {
    let as_items = |v: &Value| match v {
        Value::Array(items) => items.clone(),
        other => vec![other.clone()],
    };
    let mut merged = as_items(stored);
    for item in as_items(proposed) {
        if !merged.contains(&item) {
            merged.push(item);
        }
    }
    Value::Array(merged)
}

/// The later of two timestamps (RFC 3339 strings or epoch numbers). When the
/// values cannot be compared the proposal wins.
fn latest<'a>(stored: &'a Value, proposed: &'a Value) -> &'a Value {
    let instant = |v: &Value| -> Option<f64> {
        match v {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|t| t.timestamp_millis() as f64 / 1000.0),
            _ => None,
        }
    };
    match (instant(stored), instant(proposed)) {
        (Some(a), Some(b)) if a > b => stored,
        _ => proposed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_strategy_from_key_suffix() {
        assert_eq!(strategy_for_key("files_list"), ResolutionStrategy::MergeLists);
        assert_eq!(strategy_for_key("ids_array"), ResolutionStrategy::MergeLists);
        assert_eq!(strategy_for_key("error_count"), ResolutionStrategy::SumValues);
        assert_eq!(strategy_for_key("bytes_total"), ResolutionStrategy::SumValues);
        assert_eq!(strategy_for_key("build_timestamp"), ResolutionStrategy::LatestTimestamp);
        assert_eq!(strategy_for_key("last_updated"), ResolutionStrategy::LatestTimestamp);
        assert_eq!(strategy_for_key("status"), ResolutionStrategy::LastWriteWins);
    }

    #[test]
    fn test_merge_lists_keeps_order_and_dedups() {
        let merged = combine(ResolutionStrategy::MergeLists, Some(&json!(["a", "b"])), &json!(["b", "c"])).unwrap();
        assert_eq!(merged, json!(["a", "b", "c"]));
    }

    #[test]
    fn test_sum_values() {
        let sum = combine(ResolutionStrategy::SumValues, Some(&json!(3)), &json!(4)).unwrap();
        assert_eq!(sum, json!(7));
        assert!(combine(ResolutionStrategy::SumValues, Some(&json!("x")), &json!(4)).is_err());
    }

    #[test]
    fn test_latest_timestamp() {
        let later = combine(
            ResolutionStrategy::LatestTimestamp,
            Some(&json!("2026-05-02T10:00:00Z")),
            &json!("2026-05-01T10:00:00Z"),
        )
        .unwrap();
        assert_eq!(later, json!("2026-05-02T10:00:00Z"));
    }

    #[test]
    fn test_missing_stored_value_takes_proposal() {
        let value = combine(ResolutionStrategy::SumValues, None, &json!(2)).unwrap();
        assert_eq!(value, json!(2));
    }
}

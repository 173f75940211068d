// src/store/filters.rs

//! Field filters and ordering for `list` operations.
//!
//! Filters are AND-ed across fields and OR-ed across the values given for one
//! field. Two field names are reserved:
//! - `metadata`: each value is a JSON object; every pair must be present in
//!   the asset's metadata.
//! - `match`: substring match on the asset's `name`.
//!
//! Any other field name is looked up in the asset's JSON projection, with
//! `.` separating nested fields. Array fields match when any element does.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde_json::Value;

pub type Filters = BTreeMap<String, Vec<String>>;

pub const METADATA_FILTER: &str = "metadata";
pub const MATCH_FILTER: &str = "match";

/// Convenience constructor: `filters([("status", vec!["done"])])`.
pub fn filters<I, K, V>(pairs: I) -> Filters
where
    I: IntoIterator<Item = (K, Vec<V>)>,
    K: Into<String>,
    V: Into<String>,
{
    pairs
        .into_iter()
        .map(|(k, vs)| (k.into(), vs.into_iter().map(Into::into).collect()))
        .collect()
}

/// Whether `value` satisfies every filter.
pub fn matches(value: &Value, filters: &Filters) -> bool {
    filters
        .iter()
        .all(|(field, wanted)| wanted.is_empty() || field_matches(value, field, wanted))
}

fn field_matches(value: &Value, field: &str, wanted: &[String]) -> bool {
    match field {
        MATCH_FILTER => {
            let name = value.get("name").and_then(Value::as_str).unwrap_or("");
            wanted.iter().any(|w| name.contains(w.as_str()))
        }
        METADATA_FILTER => wanted
            .iter()
            .any(|w| metadata_matches(value.get("metadata"), w)),
        _ => match lookup(value, field) {
            None => false,
            Some(Value::Array(items)) => items
                .iter()
                .any(|item| wanted.iter().any(|w| scalar_eq(item, w))),
            Some(v) => wanted.iter().any(|w| scalar_eq(v, w)),
        },
    }
}

fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(value, |v, segment| v.get(segment))
}

fn scalar_eq(value: &Value, wanted: &str) -> bool {
    match value {
        Value::String(s) => s == wanted,
        Value::Bool(b) => b.to_string() == wanted,
        Value::Number(n) => {
            n.to_string() == wanted || wanted.parse::<f64>().ok() == n.as_f64()
        }
        Value::Null => wanted == "null",
        _ => false,
    }
}

fn metadata_matches(metadata: Option<&Value>, filter: &str) -> bool {
    let Ok(Value::Object(expected)) = serde_json::from_str::<Value>(filter) else {
        return false;
    };
    match metadata {
        Some(Value::Object(actual)) => expected.iter().all(|(k, v)| actual.get(k) == Some(v)),
        _ => expected.is_empty(),
    }
}

/// Stable sort of `(item, projection)` rows by a projected field.
pub fn sort_rows<T>(rows: &mut [(T, Value)], field: &str, ascending: bool) {
    rows.sort_by(|(_, a), (_, b)| {
        let ordering = compare_by_field(a, b, field);
        if ascending { ordering } else { ordering.reverse() }
    });
}

/// Compare two assets by `field`; missing or null values sort first.
pub fn compare_by_field(a: &Value, b: &Value, field: &str) -> Ordering {
    let left = lookup(a, field);
    let right = lookup(b, field);
    match (left, right) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (None | Some(Value::Null), None | Some(Value::Null)) => Ordering::Equal,
        (None | Some(Value::Null), _) => Ordering::Less,
        (_, None | Some(Value::Null)) => Ordering::Greater,
        (Some(x), Some(y)) => x.to_string().cmp(&y.to_string()),
    }
}

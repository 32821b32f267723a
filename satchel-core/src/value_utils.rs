// satchel-core/src/value_utils.rs
//! Value helpers shared by query matching, index ordering and sorting.
//!
//! A single canonical comparison is used everywhere two JSON values need an
//! order (index-entry members, executor sort, range operators) so that the
//! index layer and the in-process executor can never disagree about order.

use serde_json::Value;
use std::cmp::Ordering;

/// Look up a possibly nested value by dot path (e.g. "address.city").
/// Array segments may be numeric indices.
pub fn get_nested_value<'a>(value: &'a Value, field: &str) -> Option<&'a Value> {
    if field.is_empty() {
        return None;
    }
    let mut current = value;
    for part in field.split('.') {
        match current {
            Value::Object(map) => {
                current = map.get(part)?;
            }
            Value::Array(arr) => {
                let index = part.parse::<usize>().ok()?;
                current = arr.get(index)?;
            }
            _ => return None,
        }
    }
    Some(current)
}

/// Rank used to order values of different JSON types.
/// null < bool < number < string < array < object
pub fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

/// Canonical total order over JSON values.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => {
            let fx = x.as_f64().unwrap_or(0.0);
            let fy = y.as_f64().unwrap_or(0.0);
            fx.partial_cmp(&fy).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => {
            for (ex, ey) in x.iter().zip(y.iter()) {
                let ord = compare_values(ex, ey);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        (Value::Object(_), Value::Object(_)) => {
            // Objects have no useful order; compare serialized form for
            // determinism only.
            let sx = a.to_string();
            let sy = b.to_string();
            sx.cmp(&sy)
        }
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

/// Comparison for optional values where a missing value sorts before
/// everything (MongoDB treats missing as null when sorting documents).
pub fn compare_optional(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(v)) => {
            if v.is_null() {
                Ordering::Equal
            } else {
                Ordering::Less
            }
        }
        (Some(v), None) => {
            if v.is_null() {
                Ordering::Equal
            } else {
                Ordering::Greater
            }
        }
        (Some(x), Some(y)) => compare_values(x, y),
    }
}

/// True when the two values belong to the same comparison family, i.e. a
/// range operator between them is meaningful.
pub fn same_comparison_family(a: &Value, b: &Value) -> bool {
    type_rank(a) == type_rank(b)
}

// satchel-core/src/query/operators.rs
//! Matching semantics for the individual comparison operators.
//!
//! `doc_value` is `None` when the field is absent from the document. The
//! array rules follow MongoDB: a comparison against an array field matches
//! when any element matches.

use super::Comparison;
use crate::value_utils::{compare_values, same_comparison_family};
use serde_json::Value;
use std::cmp::Ordering;

/// Evaluate one comparison against a (possibly absent) document value.
pub fn matches_comparison(doc_value: Option<&Value>, condition: &Comparison) -> bool {
    match condition {
        Comparison::Eq(target) => eq_matches(doc_value, target),
        Comparison::Ne(target) => !eq_matches(doc_value, target),
        Comparison::Lt(target) => range_matches(doc_value, target, |ord| ord == Ordering::Less),
        Comparison::Lte(target) => range_matches(doc_value, target, |ord| {
            matches!(ord, Ordering::Less | Ordering::Equal)
        }),
        Comparison::Gt(target) => {
            range_matches(doc_value, target, |ord| ord == Ordering::Greater)
        }
        Comparison::Gte(target) => range_matches(doc_value, target, |ord| {
            matches!(ord, Ordering::Greater | Ordering::Equal)
        }),
        Comparison::In(targets) => in_matches(doc_value, targets),
        Comparison::Nin(targets) => !in_matches(doc_value, targets),
        Comparison::Exists(expected) => doc_value.is_some() == *expected,
    }
}

/// `$eq`: equality, with array-element matching and `null` matching a
/// missing field.
fn eq_matches(doc_value: Option<&Value>, target: &Value) -> bool {
    match doc_value {
        None => target.is_null(),
        Some(v) => {
            if v == target {
                return true;
            }
            if let Value::Array(arr) = v {
                return arr.iter().any(|elem| elem == target);
            }
            false
        }
    }
}

/// Range operators only compare within one type family; an array field
/// matches when any element does.
fn range_matches<F>(doc_value: Option<&Value>, target: &Value, predicate: F) -> bool
where
    F: Fn(Ordering) -> bool,
{
    let Some(v) = doc_value else {
        return false;
    };
    match v {
        Value::Array(arr) => arr
            .iter()
            .any(|elem| scalar_range_matches(elem, target, &predicate)),
        other => scalar_range_matches(other, target, &predicate),
    }
}

fn scalar_range_matches<F>(value: &Value, target: &Value, predicate: &F) -> bool
where
    F: Fn(Ordering) -> bool,
{
    same_comparison_family(value, target) && predicate(compare_values(value, target))
}

/// `$in`: membership, with array-element matching and `null` in the operand
/// list matching a missing field.
fn in_matches(doc_value: Option<&Value>, targets: &[Value]) -> bool {
    match doc_value {
        None => targets.iter().any(|t| t.is_null()),
        Some(v) => {
            if targets.contains(v) {
                return true;
            }
            if let Value::Array(arr) = v {
                return arr.iter().any(|elem| targets.contains(elem));
            }
            false
        }
    }
}

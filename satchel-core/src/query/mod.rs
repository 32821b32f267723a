// satchel-core/src/query/mod.rs
//! MongoDB-style query filters, parsed into a fixed operator vocabulary.
//!
//! The filter is parsed once into typed [`Comparison`]s; the planner and the
//! executor both consume this representation, so index-side pushdown and
//! in-process matching share one set of operator semantics. Unsupported
//! operators are rejected at parse time.

pub mod operators;

use crate::document::Document;
use crate::error::{Result, SatchelError};
use serde_json::Value;

pub use operators::matches_comparison;

/// One comparison against a single field.
#[derive(Debug, Clone, PartialEq)]
pub enum Comparison {
    Eq(Value),
    Ne(Value),
    Lt(Value),
    Lte(Value),
    Gt(Value),
    Gte(Value),
    In(Vec<Value>),
    Nin(Vec<Value>),
    Exists(bool),
}

impl Comparison {
    /// Operator name as written in a filter
    pub fn name(&self) -> &'static str {
        match self {
            Comparison::Eq(_) => "$eq",
            Comparison::Ne(_) => "$ne",
            Comparison::Lt(_) => "$lt",
            Comparison::Lte(_) => "$lte",
            Comparison::Gt(_) => "$gt",
            Comparison::Gte(_) => "$gte",
            Comparison::In(_) => "$in",
            Comparison::Nin(_) => "$nin",
            Comparison::Exists(_) => "$exists",
        }
    }
}

/// All comparisons a filter applies to one field (implicitly ANDed).
#[derive(Debug, Clone, PartialEq)]
pub struct FieldClause {
    pub field: String,
    pub conditions: Vec<Comparison>,
}

/// A parsed filter: ANDed field clauses plus an optional top-level `$or`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Filter {
    pub clauses: Vec<FieldClause>,
    pub or_branches: Option<Vec<Filter>>,
}

impl Filter {
    /// The empty filter; matches every document.
    pub fn empty() -> Self {
        Filter::default()
    }

    /// Parse a JSON filter. `$or` is accepted at the top level only.
    pub fn parse(value: &Value) -> Result<Filter> {
        Self::parse_inner(value, true)
    }

    fn parse_inner(value: &Value, allow_or: bool) -> Result<Filter> {
        let obj = value.as_object().ok_or_else(|| {
            SatchelError::invalid(format!("filter must be an object, got: {}", value))
        })?;

        let mut filter = Filter::empty();
        for (key, val) in obj {
            if key == "$or" {
                if !allow_or {
                    return Err(SatchelError::invalid(
                        "$or is only supported at the top level",
                    ));
                }
                let branches = val.as_array().ok_or_else(|| {
                    SatchelError::invalid("$or requires an array of filters")
                })?;
                if branches.is_empty() {
                    return Err(SatchelError::invalid("$or requires at least one branch"));
                }
                let mut parsed = Vec::with_capacity(branches.len());
                for branch in branches {
                    parsed.push(Self::parse_inner(branch, false)?);
                }
                filter.or_branches = Some(parsed);
            } else if key.starts_with('$') {
                return Err(SatchelError::invalid(format!(
                    "unsupported query operator: {}",
                    key
                )));
            } else {
                filter.clauses.push(Self::parse_clause(key, val)?);
            }
        }
        Ok(filter)
    }

    fn parse_clause(field: &str, value: &Value) -> Result<FieldClause> {
        let conditions = match value {
            Value::Object(map) if map.keys().any(|k| k.starts_with('$')) => {
                let mut conditions = Vec::with_capacity(map.len());
                for (op, operand) in map {
                    conditions.push(Self::parse_operator(field, op, operand)?);
                }
                conditions
            }
            // Anything else (including plain objects) is implicit equality
            other => vec![Comparison::Eq(other.clone())],
        };
        Ok(FieldClause {
            field: field.to_string(),
            conditions,
        })
    }

    fn parse_operator(field: &str, op: &str, operand: &Value) -> Result<Comparison> {
        let array_operand = |op: &str| -> Result<Vec<Value>> {
            operand
                .as_array()
                .cloned()
                .ok_or_else(|| SatchelError::invalid(format!("{} requires an array", op)))
        };

        match op {
            "$eq" => Ok(Comparison::Eq(operand.clone())),
            "$ne" => Ok(Comparison::Ne(operand.clone())),
            "$lt" => Ok(Comparison::Lt(operand.clone())),
            "$lte" => Ok(Comparison::Lte(operand.clone())),
            "$gt" => Ok(Comparison::Gt(operand.clone())),
            "$gte" => Ok(Comparison::Gte(operand.clone())),
            "$in" => Ok(Comparison::In(array_operand("$in")?)),
            "$nin" => Ok(Comparison::Nin(array_operand("$nin")?)),
            "$exists" => match operand {
                Value::Bool(b) => Ok(Comparison::Exists(*b)),
                _ => Err(SatchelError::invalid("$exists requires a boolean")),
            },
            other => Err(SatchelError::invalid(format!(
                "unsupported query operator on field '{}': {}",
                field, other
            ))),
        }
    }

    /// Does the document literally satisfy this filter.
    pub fn matches(&self, doc: &Document) -> bool {
        for clause in &self.clauses {
            let value = doc.get(&clause.field);
            for condition in &clause.conditions {
                if !matches_comparison(value, condition) {
                    return false;
                }
            }
        }
        if let Some(branches) = &self.or_branches {
            return branches.iter().any(|branch| branch.matches(doc));
        }
        true
    }

    /// All conditions this filter applies to `field` (outside `$or`).
    pub fn conditions_for(&self, field: &str) -> Vec<&Comparison> {
        self.clauses
            .iter()
            .filter(|c| c.field == field)
            .flat_map(|c| c.conditions.iter())
            .collect()
    }

    /// The concrete values the filter pins `field` to, if enumerable:
    /// a singleton for `$eq`/implicit equality, the operand array for `$in`.
    /// Range operators, `$ne`, `$nin` and `$exists` cannot be enumerated.
    pub fn concrete_values_for(&self, field: &str) -> Option<Vec<Value>> {
        let mut result: Option<Vec<Value>> = None;
        for condition in self.conditions_for(field) {
            let values = match condition {
                Comparison::Eq(v) => vec![v.clone()],
                Comparison::In(vs) => vs.clone(),
                _ => continue,
            };
            result = Some(match result {
                // Multiple enumerable conditions on one field intersect
                Some(existing) => existing
                    .into_iter()
                    .filter(|v| values.contains(v))
                    .collect(),
                None => values,
            });
        }
        result
    }

    /// True when the filter has no clauses and no `$or`.
    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty() && self.or_branches.is_none()
    }
}

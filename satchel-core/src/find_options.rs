// satchel-core/src/find_options.rs
// Find query options: sort, limit, projection (deferred)

use crate::document::Document;
use crate::error::{Result, SatchelError};
use crate::value_utils::compare_optional;
use serde_json::Value;

/// Options for find queries
#[derive(Debug, Clone, Default)]
pub struct FindOptions {
    /// Sort: [(field, direction)], direction: 1 (asc) or -1 (desc)
    pub sort: Option<Vec<(String, i32)>>,

    /// Limit: maximum number of documents to return
    pub limit: Option<usize>,

    /// Projection spec. Accepted but not yet evaluated; `find` raises
    /// `not-implemented` when set.
    pub projection: Option<Value>,
}

impl FindOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sort(mut self, sort: Vec<(String, i32)>) -> Self {
        self.sort = Some(sort);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Parse options from their JSON form: `{sort?, limit?, projection?}`.
    pub fn from_json(value: &Value) -> Result<Self> {
        let obj = value.as_object().ok_or_else(|| {
            SatchelError::invalid(format!("options must be an object, got: {}", value))
        })?;

        let mut options = FindOptions::new();
        for (key, val) in obj {
            match key.as_str() {
                "sort" => {
                    let spec = val.as_object().ok_or_else(|| {
                        SatchelError::invalid("sort must be an object of field: direction")
                    })?;
                    let mut sort = Vec::with_capacity(spec.len());
                    for (field, direction) in spec {
                        let direction = direction.as_i64().ok_or_else(|| {
                            SatchelError::invalid("sort direction must be 1 or -1")
                        })?;
                        if direction != 1 && direction != -1 {
                            return Err(SatchelError::invalid("sort direction must be 1 or -1"));
                        }
                        sort.push((field.clone(), direction as i32));
                    }
                    options.sort = Some(sort);
                }
                "limit" => {
                    let limit = val
                        .as_u64()
                        .ok_or_else(|| SatchelError::invalid("limit must be a non-negative integer"))?;
                    options.limit = Some(limit as usize);
                }
                "projection" => {
                    options.projection = Some(val.clone());
                }
                other => {
                    return Err(SatchelError::invalid(format!(
                        "unsupported find option: {}",
                        other
                    )));
                }
            }
        }
        Ok(options)
    }

    /// Reject option combinations the executor cannot honor yet.
    pub fn validate(&self) -> Result<()> {
        if self.projection.is_some() {
            return Err(SatchelError::NotImplemented(
                "projection is not supported yet".to_string(),
            ));
        }
        Ok(())
    }
}

/// In-process multi-key sort, dot notation supported via `Document::get`.
pub fn apply_sort(docs: &mut [Document], sort: &[(String, i32)]) {
    if sort.is_empty() {
        return;
    }

    docs.sort_by(|a, b| {
        for (field, direction) in sort {
            let cmp = compare_optional(a.get(field), b.get(field));
            if cmp != std::cmp::Ordering::Equal {
                return if *direction == 1 { cmp } else { cmp.reverse() };
            }
        }
        std::cmp::Ordering::Equal
    });
}

/// Truncate to `limit` documents
pub fn apply_limit(docs: &mut Vec<Document>, limit: Option<usize>) {
    if let Some(limit) = limit {
        docs.truncate(limit);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn docs(values: Vec<Value>) -> Vec<Document> {
        values
            .iter()
            .map(|v| Document::from_value(v).unwrap())
            .collect()
    }

    #[test]
    fn test_from_json() {
        let options =
            FindOptions::from_json(&json!({"sort": {"priority": 1}, "limit": 2})).unwrap();
        assert_eq!(options.sort, Some(vec![("priority".to_string(), 1)]));
        assert_eq!(options.limit, Some(2));
    }

    #[test]
    fn test_from_json_rejects_bad_direction() {
        assert!(FindOptions::from_json(&json!({"sort": {"priority": 2}})).is_err());
        assert!(FindOptions::from_json(&json!({"sort": {"priority": "asc"}})).is_err());
        assert!(FindOptions::from_json(&json!({"limit": -1})).is_err());
        assert!(FindOptions::from_json(&json!({"skip": 3})).is_err());
    }

    #[test]
    fn test_projection_is_deferred() {
        let options = FindOptions::from_json(&json!({"projection": {"name": 1}})).unwrap();
        assert!(matches!(
            options.validate(),
            Err(SatchelError::NotImplemented(_))
        ));
        assert!(FindOptions::new().validate().is_ok());
    }

    #[test]
    fn test_apply_sort_ascending() {
        let mut d = docs(vec![
            json!({"_id": 1, "age": 30}),
            json!({"_id": 2, "age": 10}),
            json!({"_id": 3, "age": 20}),
        ]);
        apply_sort(&mut d, &[("age".to_string(), 1)]);
        let ages: Vec<_> = d.iter().map(|doc| doc.get("age").cloned()).collect();
        assert_eq!(ages, vec![Some(json!(10)), Some(json!(20)), Some(json!(30))]);
    }

    #[test]
    fn test_apply_sort_descending_with_tiebreak() {
        let mut d = docs(vec![
            json!({"_id": 1, "a": 1, "b": "x"}),
            json!({"_id": 2, "a": 2, "b": "x"}),
            json!({"_id": 3, "a": 1, "b": "y"}),
        ]);
        apply_sort(&mut d, &[("b".to_string(), 1), ("a".to_string(), -1)]);
        let ids: Vec<_> = d.iter().map(|doc| doc.id.key_string()).collect();
        assert_eq!(ids, vec!["2", "1", "3"]);
    }

    #[test]
    fn test_apply_sort_missing_sorts_first_ascending() {
        let mut d = docs(vec![
            json!({"_id": 1, "age": 30}),
            json!({"_id": 2}),
        ]);
        apply_sort(&mut d, &[("age".to_string(), 1)]);
        assert_eq!(d[0].id.key_string(), "2");
    }

    #[test]
    fn test_apply_limit() {
        let mut d = docs(vec![
            json!({"_id": 1}),
            json!({"_id": 2}),
            json!({"_id": 3}),
        ]);
        apply_limit(&mut d, Some(2));
        assert_eq!(d.len(), 2);

        apply_limit(&mut d, None);
        assert_eq!(d.len(), 2);
    }
}

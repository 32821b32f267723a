// satchel-core/src/document.rs
use crate::value_utils::get_nested_value;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

/// MongoDB-like document: a required `_id` plus arbitrary JSON fields.
///
/// Serialization goes through [`Document::to_value`]; the derived
/// `Deserialize` + the `_id` mirror in `fields` would otherwise emit the id
/// twice.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Document {
    #[serde(rename = "_id")]
    pub id: DocumentId,

    #[serde(flatten)]
    pub fields: HashMap<String, Value>,
}

impl Serialize for Document {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

/// Document ID types.
/// Untagged so ids appear as plain values in document bodies: {"_id": 2}.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(untagged)]
pub enum DocumentId {
    Int(i64),
    String(String),
    ObjectId(String),
}

impl DocumentId {
    /// Generate a fresh ObjectId-like id (UUID v4)
    pub fn new_object_id() -> Self {
        DocumentId::ObjectId(Uuid::new_v4().to_string())
    }

    /// The string form used for object keys and per-id locks.
    /// Stable across a round-trip through JSON.
    pub fn key_string(&self) -> String {
        match self {
            DocumentId::Int(i) => i.to_string(),
            DocumentId::String(s) => s.clone(),
            DocumentId::ObjectId(oid) => oid.clone(),
        }
    }

    /// The id as a JSON value (for query matching and index sorting)
    pub fn to_value(&self) -> Value {
        match self {
            DocumentId::Int(i) => Value::from(*i),
            DocumentId::String(s) => Value::String(s.clone()),
            DocumentId::ObjectId(oid) => Value::String(oid.clone()),
        }
    }
}

impl std::fmt::Display for DocumentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.key_string())
    }
}

impl Document {
    /// Create a new document. `_id` is mirrored into `fields` so query
    /// matching can treat it like any other field.
    pub fn new(id: DocumentId, mut fields: HashMap<String, Value>) -> Self {
        fields.insert("_id".to_string(), id.to_value());
        Document { id, fields }
    }

    /// Build a Document from a serde_json::Value.
    ///
    /// `#[serde(rename = "_id")]` + `#[serde(flatten)]` consumes `_id` during
    /// deserialization, so it is re-inserted into `fields` afterwards; query
    /// matching relies on `get("_id")` working.
    pub fn from_value(value: &Value) -> serde_json::Result<Self> {
        let mut doc: Self = serde_json::from_value(value.clone())?;
        doc.fields
            .insert("_id".to_string(), serde_json::to_value(&doc.id)?);
        Ok(doc)
    }

    /// Parse a document from a JSON string
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        let value: Value = serde_json::from_str(json)?;
        Self::from_value(&value)
    }

    /// The document as a JSON value, `_id` first, no duplicates
    pub fn to_value(&self) -> Value {
        let mut map = serde_json::Map::new();
        map.insert("_id".to_string(), self.id.to_value());
        for (k, v) in &self.fields {
            if k != "_id" {
                map.insert(k.clone(), v.clone());
            }
        }
        Value::Object(map)
    }

    /// Serialize to a JSON string (the stored object body)
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(&self.to_value())
    }

    /// Field lookup with dot-notation support (e.g. "address.city").
    /// The first segment addresses a top-level field; the remainder walks
    /// into its value via [`get_nested_value`].
    pub fn get(&self, field: &str) -> Option<&Value> {
        if field.is_empty() {
            return None;
        }
        match field.split_once('.') {
            None => self.fields.get(field),
            Some((head, rest)) => get_nested_value(self.fields.get(head)?, rest),
        }
    }

    /// Set a field with dot-notation support (MongoDB `$set` semantics).
    /// Missing intermediate objects are created; scalars on the path are
    /// replaced by objects; array segments must be in-range indices or the
    /// write is dropped.
    pub fn set_nested(&mut self, field: &str, value: Value) {
        match field.split_once('.') {
            None => {
                self.fields.insert(field.to_string(), value);
            }
            Some((head, rest)) => {
                let segments: Vec<&str> = rest.split('.').collect();
                let root = self
                    .fields
                    .entry(head.to_string())
                    .or_insert_with(|| Value::Object(serde_json::Map::new()));
                write_path(root, &segments, value);
            }
        }
    }

    /// Does the document contain a (top-level) field
    pub fn contains(&self, field: &str) -> bool {
        self.fields.contains_key(field)
    }
}

/// Write `value` at `path` inside `target`, walking segment by segment.
/// Containers are only grown through objects; arrays are addressable but
/// never extended.
fn write_path(target: &mut Value, path: &[&str], value: Value) {
    let (last, parents) = path.split_last().expect("write_path needs a segment");

    let mut current = target;
    for segment in parents {
        current = match current {
            Value::Array(items) => {
                match segment.parse::<usize>().ok().filter(|&n| n < items.len()) {
                    Some(index) => &mut items[index],
                    None => return,
                }
            }
            other => {
                if !other.is_object() {
                    *other = Value::Object(serde_json::Map::new());
                }
                other
                    .as_object_mut()
                    .expect("object ensured above")
                    .entry(segment.to_string())
                    .or_insert_with(|| Value::Object(serde_json::Map::new()))
            }
        };
    }

    match current {
        Value::Array(items) => {
            if let Some(index) = last.parse::<usize>().ok().filter(|&n| n < items.len()) {
                items[index] = value;
            }
        }
        other => {
            if !other.is_object() {
                *other = Value::Object(serde_json::Map::new());
            }
            other
                .as_object_mut()
                .expect("object ensured above")
                .insert(last.to_string(), value);
        }
    }
}

impl From<Document> for Value {
    fn from(doc: Document) -> Self {
        doc.to_value()
    }
}

// satchel-core/src/collection/memory.rs
//! Volatile in-process collection.
//!
//! Reference implementation of the [`CollectionStore`] contract used by
//! tests and the shell's `memory` repository: same observable behaviour as
//! the object-store backend minus durability and cross-process visibility.
//! Queries are a scan plus in-process filter/sort/limit; index definitions
//! are tracked only so the index lifecycle operations behave identically.

use super::{
    parse_set_update, CollectionStore, Cursor, DeleteResult, InsertManyResult, InsertOneResult,
    UpdateResult, ID_INDEX_NAME,
};
use crate::document::{Document, DocumentId};
use crate::error::{Result, SatchelError};
use crate::find_options::{apply_limit, apply_sort, FindOptions};
use crate::index::IndexDefinition;
use crate::query::Filter;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

/// In-memory implementation of [`CollectionStore`]
pub struct MemoryCollection {
    name: String,
    docs: Mutex<HashMap<DocumentId, Document>>,
    indexes: Mutex<HashMap<String, IndexDefinition>>,
    closed: AtomicBool,
}

impl MemoryCollection {
    pub fn new(name: impl Into<String>) -> Self {
        MemoryCollection {
            name: name.into(),
            docs: Mutex::new(HashMap::new()),
            indexes: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(SatchelError::ClientClosed)
        } else {
            Ok(())
        }
    }

    fn matching_documents(&self, filter: &Filter) -> Vec<Document> {
        self.docs
            .lock()
            .values()
            .filter(|doc| filter.matches(doc))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl CollectionStore for MemoryCollection {
    fn name(&self) -> &str {
        &self.name
    }

    async fn insert_one(&self, mut doc: Value) -> Result<InsertOneResult> {
        self.check_open()?;
        let obj = doc
            .as_object_mut()
            .ok_or_else(|| SatchelError::invalid("document must be an object"))?;
        if !obj.contains_key("_id") {
            obj.insert("_id".to_string(), DocumentId::new_object_id().to_value());
        }
        let document = Document::from_value(&doc)
            .map_err(|err| SatchelError::invalid(format!("invalid document: {}", err)))?;
        let id = document.id.clone();
        self.docs.lock().insert(id.clone(), document);
        Ok(InsertOneResult {
            acknowledged: true,
            inserted_id: id,
        })
    }

    async fn insert_many(&self, docs: Vec<Value>) -> Result<InsertManyResult> {
        self.check_open()?;
        let mut inserted_ids = Vec::with_capacity(docs.len());
        for doc in docs {
            inserted_ids.push(self.insert_one(doc).await?.inserted_id);
        }
        Ok(InsertManyResult {
            inserted_count: inserted_ids.len(),
            inserted_ids,
        })
    }

    async fn replace_one(&self, filter: &Value, mut doc: Value) -> Result<UpdateResult> {
        self.check_open()?;
        let parsed = Filter::parse(filter)?;
        let filter_id = parsed
            .concrete_values_for("_id")
            .and_then(|values| values.into_iter().next());

        let obj = doc
            .as_object_mut()
            .ok_or_else(|| SatchelError::invalid("replacement must be an object"))?;
        let doc_id = obj.get("_id").cloned();
        match (&filter_id, &doc_id) {
            (Some(id), Some(doc_id)) if id != doc_id => {
                return Err(SatchelError::invalid(
                    "replacement _id conflicts with the filter",
                ));
            }
            (Some(id), None) => {
                obj.insert("_id".to_string(), id.clone());
            }
            (None, Some(_)) => {}
            (None, None) => {
                return Err(SatchelError::invalid("replaceOne requires an _id"));
            }
            _ => {}
        }

        let document = Document::from_value(&doc)
            .map_err(|err| SatchelError::invalid(format!("invalid document: {}", err)))?;
        let id = document.id.clone();
        let previous = self.docs.lock().insert(id.clone(), document);
        let matched = previous.is_some();
        Ok(UpdateResult {
            matched_count: matched as usize,
            modified_count: matched as usize,
            upserted_id: (!matched).then_some(id),
        })
    }

    async fn update_one(&self, filter: &Value, update: &Value) -> Result<UpdateResult> {
        self.check_open()?;
        let set = parse_set_update(update)?;

        let Some(mut document) = self.find_one(filter, FindOptions::new()).await? else {
            return Ok(UpdateResult {
                matched_count: 0,
                modified_count: 0,
                upserted_id: None,
            });
        };

        let before = document.clone();
        for (field, value) in set {
            document.set_nested(field, value.clone());
        }
        let modified = document != before;
        if modified {
            self.docs.lock().insert(document.id.clone(), document);
        }
        Ok(UpdateResult {
            matched_count: 1,
            modified_count: modified as usize,
            upserted_id: None,
        })
    }

    async fn delete_one(&self, filter: &Value) -> Result<DeleteResult> {
        self.check_open()?;
        let Some(document) = self.find_one(filter, FindOptions::new()).await? else {
            return Ok(DeleteResult { deleted_count: 0 });
        };
        self.docs.lock().remove(&document.id);
        Ok(DeleteResult { deleted_count: 1 })
    }

    async fn delete_many(&self, filter: &Value) -> Result<DeleteResult> {
        self.check_open()?;
        let parsed = Filter::parse(filter)?;
        let matching = self.matching_documents(&parsed);
        let mut docs = self.docs.lock();
        for doc in &matching {
            docs.remove(&doc.id);
        }
        Ok(DeleteResult {
            deleted_count: matching.len(),
        })
    }

    async fn find(&self, filter: &Value, options: FindOptions) -> Result<Cursor> {
        self.check_open()?;
        options.validate()?;
        let parsed = Filter::parse(filter)?;

        let mut docs = self.matching_documents(&parsed);
        if let Some(sort) = &options.sort {
            apply_sort(&mut docs, sort);
        }
        apply_limit(&mut docs, options.limit);
        Ok(Cursor::ready(docs))
    }

    async fn find_one(&self, filter: &Value, options: FindOptions) -> Result<Option<Document>> {
        let mut cursor = self.find(filter, options.with_limit(1)).await?;
        cursor.next().await
    }

    async fn count_documents(&self, filter: &Value) -> Result<usize> {
        self.check_open()?;
        let parsed = Filter::parse(filter)?;
        Ok(self.matching_documents(&parsed).len())
    }

    async fn distinct(&self, field: &str, filter: &Value) -> Result<Vec<Value>> {
        self.check_open()?;
        let parsed = Filter::parse(filter)?;
        Ok(super::distinct_values(&self.matching_documents(&parsed), field))
    }

    async fn explain(&self, filter: &Value, options: FindOptions) -> Result<Value> {
        self.check_open()?;
        options.validate()?;
        Filter::parse(filter)?;
        // The volatile backend always scans
        Ok(serde_json::json!({
            "sources": [{"stage": "COLLSCAN"}],
            "sortPushed": false,
            "limitPushed": false,
        }))
    }

    async fn create_index(&self, keys: &Value, opts: Option<&Value>) -> Result<String> {
        self.check_open()?;
        let mut definition = IndexDefinition::from_key_spec(keys)?;
        definition.apply_options(opts)?;
        if definition.keys.len() == 1 && definition.keys[0].field == "_id" {
            return Ok(ID_INDEX_NAME.to_string());
        }
        let name = definition.name.clone();
        self.indexes.lock().entry(name.clone()).or_insert(definition);
        Ok(name)
    }

    async fn drop_index(&self, name: &str) -> Result<()> {
        self.check_open()?;
        if name == ID_INDEX_NAME {
            return Err(SatchelError::invalid("cannot drop the _id index"));
        }
        self.indexes.lock().remove(name);
        Ok(())
    }

    async fn list_indexes(&self) -> Result<Vec<Value>> {
        self.check_open()?;
        let mut result = vec![serde_json::json!({
            "v": 2,
            "key": {"_id": 1},
            "name": ID_INDEX_NAME,
        })];
        let mut definitions: Vec<_> = self.indexes.lock().values().cloned().collect();
        definitions.sort_by(|a, b| a.name.cmp(&b.name));
        result.extend(definitions.iter().map(IndexDefinition::to_list_value));
        Ok(result)
    }

    async fn flush(&self) -> Result<()> {
        self.check_open()?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

// satchel-core/src/collection/mod.rs
//! Collection stores.
//!
//! [`CollectionStore`] is the MongoDB-compatible operation contract; the
//! production implementation is [`ObjectCollection`] (documents and index
//! entries as objects in object storage), [`MemoryCollection`] is the
//! volatile reference implementation.
//!
//! Storage layout of an object-backed collection:
//!
//! ```text
//! <collection>/data/<id>.json                document body
//! <collection>/indices/<name>.json           index metadata
//! <collection>/indices/<name>/<key>.json     index entries
//! ```

pub mod cursor;
pub mod memory;

pub use cursor::Cursor;
pub use memory::MemoryCollection;

use crate::document::{Document, DocumentId};
use crate::error::{Result, SatchelError};
use crate::find_options::FindOptions;
use crate::index::{encode_key_component, CollectionIndex, IndexDefinition};
use crate::planner::{execute_find, scan_all_documents, DEFAULT_FETCH_FAN_OUT};
use crate::query::Filter;
use crate::storage::{ObjectStore, ObjectStoreError, Precondition};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Name of the synthetic primary-key index
pub const ID_INDEX_NAME: &str = "_id_";

/// Prefix under which a collection's documents live
pub fn data_prefix(collection: &str) -> String {
    format!("{}/data/", collection)
}

/// Object key of one document body
pub fn document_object_key(collection: &str, id: &DocumentId) -> String {
    format!(
        "{}{}.json",
        data_prefix(collection),
        encode_key_component(&id.key_string())
    )
}

fn indices_prefix(collection: &str) -> String {
    format!("{}/indices/", collection)
}

fn index_metadata_key(collection: &str, index: &str) -> String {
    format!("{}{}.json", indices_prefix(collection), index)
}

// ============================================================================
// OPERATION RESULTS
// ============================================================================

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct InsertOneResult {
    pub acknowledged: bool,
    #[serde(rename = "insertedId")]
    pub inserted_id: DocumentId,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct InsertManyResult {
    #[serde(rename = "insertedIds")]
    pub inserted_ids: Vec<DocumentId>,
    #[serde(rename = "insertedCount")]
    pub inserted_count: usize,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct UpdateResult {
    #[serde(rename = "matchedCount")]
    pub matched_count: usize,
    #[serde(rename = "modifiedCount")]
    pub modified_count: usize,
    #[serde(rename = "upsertedId", skip_serializing_if = "Option::is_none")]
    pub upserted_id: Option<DocumentId>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DeleteResult {
    #[serde(rename = "deletedCount")]
    pub deleted_count: usize,
}

// ============================================================================
// THE COLLECTION CONTRACT
// ============================================================================

/// MongoDB-compatible collection operations.
///
/// Both backends satisfy the same externally observable behaviour; the
/// in-memory one trades away durability and cross-process visibility.
#[async_trait]
pub trait CollectionStore: Send + Sync {
    fn name(&self) -> &str;

    async fn insert_one(&self, doc: Value) -> Result<InsertOneResult>;
    async fn insert_many(&self, docs: Vec<Value>) -> Result<InsertManyResult>;
    async fn replace_one(&self, filter: &Value, doc: Value) -> Result<UpdateResult>;
    /// `update` must be `{"$set": {...}}`; anything else is
    /// `invalid-argument`.
    async fn update_one(&self, filter: &Value, update: &Value) -> Result<UpdateResult>;
    async fn delete_one(&self, filter: &Value) -> Result<DeleteResult>;
    async fn delete_many(&self, filter: &Value) -> Result<DeleteResult>;

    async fn find(&self, filter: &Value, options: FindOptions) -> Result<Cursor>;
    async fn find_one(&self, filter: &Value, options: FindOptions) -> Result<Option<Document>>;
    async fn count_documents(&self, filter: &Value) -> Result<usize>;
    /// Distinct values of `field` among matching documents, array fields
    /// expanded, in canonical value order.
    async fn distinct(&self, field: &str, filter: &Value) -> Result<Vec<Value>>;
    /// Describe how a `find` with these arguments would execute.
    async fn explain(&self, filter: &Value, options: FindOptions) -> Result<Value>;

    async fn create_index(&self, keys: &Value, opts: Option<&Value>) -> Result<String>;
    async fn drop_index(&self, name: &str) -> Result<()>;
    /// Always includes the synthetic `_id_` index.
    async fn list_indexes(&self) -> Result<Vec<Value>>;

    /// Wait for all background index persistence
    async fn flush(&self) -> Result<()>;
    /// Close the handle; all later operations raise `client-closed`.
    async fn close(&self) -> Result<()>;
}

// ============================================================================
// OBJECT-STORE BACKED COLLECTION
// ============================================================================

/// Durable collection over an [`ObjectStore`]
pub struct ObjectCollection {
    name: String,
    store: Arc<dyn ObjectStore>,
    indexes: DashMap<String, Arc<CollectionIndex>>,
    /// Serialises writes to the same document through this instance
    doc_locks: DashMap<String, Arc<Mutex<()>>>,
    closed: AtomicBool,
}

impl ObjectCollection {
    /// Open (or lazily create) a collection, loading the index metadata
    /// already present in the bucket.
    pub async fn open(name: impl Into<String>, store: Arc<dyn ObjectStore>) -> Result<Arc<Self>> {
        let collection = Arc::new(ObjectCollection {
            name: name.into(),
            store,
            indexes: DashMap::new(),
            doc_locks: DashMap::new(),
            closed: AtomicBool::new(false),
        });
        collection.refresh_indexes().await?;
        debug!(collection = %collection.name, indexes = collection.indexes.len(), "collection opened");
        Ok(collection)
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(SatchelError::ClientClosed)
        } else {
            Ok(())
        }
    }

    fn doc_lock(&self, id: &DocumentId) -> Arc<Mutex<()>> {
        self.doc_locks
            .entry(id.key_string())
            .or_default()
            .value()
            .clone()
    }

    fn current_indexes(&self) -> Vec<Arc<CollectionIndex>> {
        self.indexes.iter().map(|e| e.value().clone()).collect()
    }

    /// Load index metadata objects other writers may have created.
    async fn refresh_indexes(&self) -> Result<()> {
        let listed = self
            .store
            .list(&indices_prefix(&self.name), Some("/"))
            .await
            .map_err(SatchelError::from)?;
        for summary in listed {
            let Some(file) = summary.key.strip_prefix(&indices_prefix(&self.name)) else {
                continue;
            };
            let Some(index_name) = file.strip_suffix(".json") else {
                continue;
            };
            if self.indexes.contains_key(index_name) {
                continue;
            }
            let body = self.store.get(&summary.key).await.map_err(SatchelError::from)?;
            let definition: IndexDefinition =
                serde_json::from_slice(&body.bytes).map_err(|err| {
                    SatchelError::server(format!("corrupt index metadata {}: {}", summary.key, err))
                })?;
            let index = CollectionIndex::new(
                self.name.clone(),
                definition,
                Arc::clone(&self.store),
            );
            self.indexes.insert(index.name().to_string(), index);
        }
        Ok(())
    }

    /// Read the current version of a document, if any
    async fn read_document(&self, id: &DocumentId) -> Result<Option<Document>> {
        match self.store.get(&document_object_key(&self.name, id)).await {
            Ok(body) => {
                let value: Value = serde_json::from_slice(&body.bytes).map_err(|err| {
                    SatchelError::server(format!("corrupt document {}: {}", id, err))
                })?;
                let doc = Document::from_value(&value).map_err(|err| {
                    SatchelError::server(format!("corrupt document {}: {}", id, err))
                })?;
                Ok(Some(doc))
            }
            Err(ObjectStoreError::NotFound) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Write a document body and bring every index up to date. Index
    /// updates are enqueued only after the document put succeeded.
    /// Returns the previous version.
    async fn write_document(&self, doc: &Document) -> Result<Option<Document>> {
        let lock = self.doc_lock(&doc.id);
        let _guard = lock.lock().await;

        let previous = self.read_document(&doc.id).await?;
        let body = serde_json::to_vec(&doc.to_value())
            .map_err(|err| SatchelError::server(format!("serialize document: {}", err)))?;
        self.store
            .put(
                &document_object_key(&self.name, &doc.id),
                Bytes::from(body),
                Precondition::None,
            )
            .await
            .map_err(SatchelError::from)?;

        for index in self.current_indexes() {
            match &previous {
                Some(old) => index.update_on_document_update(old, doc).await?,
                None => index.add_document(doc).await?,
            }
        }
        Ok(previous)
    }

    /// Delete a document body and remove it from every index
    async fn delete_document(&self, doc: &Document) -> Result<()> {
        let lock = self.doc_lock(&doc.id);
        let _guard = lock.lock().await;

        self.store
            .delete(&document_object_key(&self.name, &doc.id))
            .await
            .map_err(SatchelError::from)?;
        for index in self.current_indexes() {
            index.remove_document(doc).await?;
        }
        Ok(())
    }

    fn parse_document(value: &Value) -> Result<Document> {
        Document::from_value(value)
            .map_err(|err| SatchelError::invalid(format!("invalid document: {}", err)))
    }

    /// Persist-queue status per index: pending, running, latency estimate
    pub fn persist_status(&self) -> Vec<(String, crate::index::PersistStatus)> {
        self.current_indexes()
            .iter()
            .map(|index| (index.name().to_string(), index.status()))
            .collect()
    }
}

#[async_trait]
impl CollectionStore for ObjectCollection {
    fn name(&self) -> &str {
        &self.name
    }

    async fn insert_one(&self, mut doc: Value) -> Result<InsertOneResult> {
        self.check_open()?;
        let obj = doc
            .as_object_mut()
            .ok_or_else(|| SatchelError::invalid("document must be an object"))?;
        if !obj.contains_key("_id") {
            obj.insert(
                "_id".to_string(),
                DocumentId::new_object_id().to_value(),
            );
        }

        let document = Self::parse_document(&doc)?;
        self.write_document(&document).await?;
        Ok(InsertOneResult {
            acknowledged: true,
            inserted_id: document.id,
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

        let document = Self::parse_document(&doc)?;
        let previous = self.write_document(&document).await?;
        let matched = previous.is_some();
        Ok(UpdateResult {
            matched_count: matched as usize,
            modified_count: matched as usize,
            upserted_id: (!matched).then(|| document.id.clone()),
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
            self.write_document(&document).await?;
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
        self.delete_document(&document).await?;
        Ok(DeleteResult { deleted_count: 1 })
    }

    async fn delete_many(&self, filter: &Value) -> Result<DeleteResult> {
        self.check_open()?;
        let docs = self.find(filter, FindOptions::new()).await?.to_array().await?;
        let deleted_count = docs.len();
        for doc in &docs {
            self.delete_document(doc).await?;
        }
        Ok(DeleteResult { deleted_count })
    }

    async fn find(&self, filter: &Value, options: FindOptions) -> Result<Cursor> {
        self.check_open()?;
        options.validate()?;
        let parsed = Filter::parse(filter)?;
        let store = Arc::clone(&self.store);
        let name = self.name.clone();
        let indexes = self.current_indexes();
        Ok(Cursor::new(Box::pin(async move {
            execute_find(&store, &name, &parsed, &options, &indexes).await
        })))
    }

    async fn find_one(&self, filter: &Value, options: FindOptions) -> Result<Option<Document>> {
        let mut cursor = self.find(filter, options.with_limit(1)).await?;
        cursor.next().await
    }

    async fn count_documents(&self, filter: &Value) -> Result<usize> {
        self.check_open()?;
        Ok(self
            .find(filter, FindOptions::new())
            .await?
            .to_array()
            .await?
            .len())
    }

    async fn distinct(&self, field: &str, filter: &Value) -> Result<Vec<Value>> {
        self.check_open()?;
        let docs = self.find(filter, FindOptions::new()).await?.to_array().await?;
        Ok(distinct_values(&docs, field))
    }

    async fn explain(&self, filter: &Value, options: FindOptions) -> Result<Value> {
        self.check_open()?;
        options.validate()?;
        let parsed = Filter::parse(filter)?;
        let plan = crate::planner::plan_query(&parsed, &options, &self.current_indexes());
        Ok(crate::planner::explain_plan(&plan))
    }

    async fn create_index(&self, keys: &Value, opts: Option<&Value>) -> Result<String> {
        self.check_open()?;
        let mut definition = IndexDefinition::from_key_spec(keys)?;
        definition.apply_options(opts)?;
        if definition.keys.len() == 1 && definition.keys[0].field == "_id" {
            return Ok(ID_INDEX_NAME.to_string());
        }
        if self.indexes.contains_key(&definition.name) {
            // createIndex is idempotent
            return Ok(definition.name);
        }

        let name = definition.name.clone();
        let body = serde_json::to_vec(&definition)
            .map_err(|err| SatchelError::server(format!("serialize index metadata: {}", err)))?;
        self.store
            .put(
                &index_metadata_key(&self.name, &name),
                Bytes::from(body),
                Precondition::None,
            )
            .await
            .map_err(SatchelError::from)?;

        let index = CollectionIndex::new(self.name.clone(), definition, Arc::clone(&self.store));

        // Backfill from the documents already in the collection
        let docs =
            scan_all_documents(&self.store, &self.name, DEFAULT_FETCH_FAN_OUT).await?;
        let backfilled = docs.len();
        for doc in &docs {
            index.add_document(doc).await?;
        }
        index.flush().await?;

        info!(collection = %self.name, index = %name, backfilled, "index created");
        self.indexes.insert(name.clone(), index);
        Ok(name)
    }

    async fn drop_index(&self, name: &str) -> Result<()> {
        self.check_open()?;
        if name == ID_INDEX_NAME {
            return Err(SatchelError::invalid("cannot drop the _id index"));
        }
        if let Some((_, index)) = self.indexes.remove(name) {
            index.drop_objects().await?;
            return Ok(());
        }
        // Not in memory; another process may have created it
        match self.store.get(&index_metadata_key(&self.name, name)).await {
            Ok(body) => {
                let definition: IndexDefinition =
                    serde_json::from_slice(&body.bytes).map_err(|err| {
                        SatchelError::server(format!("corrupt index metadata {}: {}", name, err))
                    })?;
                let index =
                    CollectionIndex::new(self.name.clone(), definition, Arc::clone(&self.store));
                index.drop_objects().await
            }
            // dropIndex is idempotent
            Err(ObjectStoreError::NotFound) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn list_indexes(&self) -> Result<Vec<Value>> {
        self.check_open()?;
        self.refresh_indexes().await?;

        let mut result = vec![serde_json::json!({
            "v": 2,
            "key": {"_id": 1},
            "name": ID_INDEX_NAME,
        })];
        let mut definitions: Vec<_> = self
            .indexes
            .iter()
            .map(|e| e.value().definition().clone())
            .collect();
        definitions.sort_by(|a, b| a.name.cmp(&b.name));
        result.extend(definitions.iter().map(IndexDefinition::to_list_value));
        Ok(result)
    }

    async fn flush(&self) -> Result<()> {
        self.check_open()?;
        for index in self.current_indexes() {
            index.flush().await?;
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(()); // idempotent
        }
        for index in self.current_indexes() {
            index.shut_down();
        }
        debug!(collection = %self.name, "collection closed");
        Ok(())
    }
}

/// Distinct field values across documents, array fields expanded, sorted
/// by the canonical value order.
pub(crate) fn distinct_values(docs: &[Document], field: &str) -> Vec<Value> {
    let mut values: Vec<Value> = Vec::new();
    let mut push_unique = |value: &Value| {
        if !values.contains(value) {
            values.push(value.clone());
        }
    };
    for doc in docs {
        match doc.get(field) {
            Some(Value::Array(items)) => {
                for item in items {
                    push_unique(item);
                }
            }
            Some(value) => push_unique(value),
            None => {}
        }
    }
    values.sort_by(crate::value_utils::compare_values);
    values
}

/// Validate an update document: exactly `{"$set": {<field>: <value>, …}}`.
pub(crate) fn parse_set_update(update: &Value) -> Result<&serde_json::Map<String, Value>> {
    let obj = update
        .as_object()
        .ok_or_else(|| SatchelError::invalid("update must be an object"))?;
    if obj.is_empty() {
        return Err(SatchelError::invalid("update is empty"));
    }
    for key in obj.keys() {
        if key != "$set" {
            return Err(SatchelError::invalid(format!(
                "unsupported update operator: {}",
                key
            )));
        }
    }
    let set = obj
        .get("$set")
        .and_then(Value::as_object)
        .ok_or_else(|| SatchelError::invalid("$set requires an object"))?;
    if set.contains_key("_id") {
        return Err(SatchelError::invalid("$set cannot change _id"));
    }
    Ok(set)
}

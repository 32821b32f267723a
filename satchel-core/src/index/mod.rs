// satchel-core/src/index/mod.rs
//! Persistent secondary indexes over object storage.
//!
//! Layout per index (inside the collection prefix):
//!
//! ```text
//! <collection>/indices/<name>.json               metadata {name, keys}
//! <collection>/indices/<name>/<value-key>.json   entry body [[id, sort], …]
//! ```
//!
//! Documents are bucketed by their value key: the `|`-joined, per-segment
//! URL-encoded values at the index's bucket fields (all key fields except
//! the last; a single-field index buckets by that field). The last field
//! supplies the entry-internal sort value, so range/sort/limit work can
//! happen inside one entry without touching documents.
//!
//! Entries are cached for the life of the process and revalidated by ETag
//! on the read path. Writers never block on storage consistency: mutations
//! mark the cached entry dirty and the persist queue writes it out with an
//! `If-Match` precondition, merging and retrying on conflict.

pub mod entry;
pub mod persist;

pub use entry::{EntryScan, IndexEntry, ScanDirection};
pub use persist::{PersistOutcome, PersistQueue, PersistStatus, PersistTarget};

use crate::document::{Document, DocumentId};
use crate::error::{Result, SatchelError};
use crate::query::Filter;
use crate::storage::{ObjectStore, ObjectStoreError, Precondition};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use percent_encoding::{percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::sync::{Arc, Weak};
use tracing::{debug, error, warn};

use self::persist::{DEFAULT_PERSIST_WORKERS, IMMEDIATE_RETRY_LIMIT};

/// Characters kept verbatim in key segments
const SEGMENT_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.');

/// Percent-encode one key segment
pub fn encode_key_component(raw: &str) -> String {
    percent_encode(raw.as_bytes(), SEGMENT_SET).to_string()
}

/// Encode a field value as a key segment
pub fn encode_segment(value: &Value) -> String {
    match value {
        Value::String(s) => encode_key_component(s),
        Value::Number(n) => encode_key_component(&n.to_string()),
        Value::Bool(b) => b.to_string(),
        Value::Null => "null".to_string(),
        other => encode_key_component(&other.to_string()),
    }
}

/// Field ordering within an index key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    Ascending,
    Descending,
    Text,
}

impl Order {
    pub fn from_value(value: &Value) -> Result<Order> {
        match value {
            Value::Number(n) => match n.as_i64() {
                Some(1) => Ok(Order::Ascending),
                Some(-1) => Ok(Order::Descending),
                _ => Err(SatchelError::invalid(format!(
                    "index order must be 1, -1 or \"text\", got: {}",
                    value
                ))),
            },
            Value::String(s) if s == "text" => Ok(Order::Text),
            other => Err(SatchelError::invalid(format!(
                "index order must be 1, -1 or \"text\", got: {}",
                other
            ))),
        }
    }

    /// The form used in index names and `listIndexes` output
    pub fn to_value(self) -> Value {
        match self {
            Order::Ascending => Value::from(1),
            Order::Descending => Value::from(-1),
            Order::Text => Value::String("text".to_string()),
        }
    }

    fn name_suffix(self) -> &'static str {
        match self {
            Order::Ascending => "1",
            Order::Descending => "-1",
            Order::Text => "text",
        }
    }
}

impl Serialize for Order {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Order::Ascending => serializer.serialize_i32(1),
            Order::Descending => serializer.serialize_i32(-1),
            Order::Text => serializer.serialize_str("text"),
        }
    }
}

impl<'de> Deserialize<'de> for Order {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Order::from_value(&value).map_err(serde::de::Error::custom)
    }
}

/// One field of an index key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeySpec {
    pub field: String,
    pub order: Order,
}

/// Index metadata; this struct is the stored metadata object's body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDefinition {
    pub name: String,
    pub keys: Vec<KeySpec>,
}

impl IndexDefinition {
    /// Parse a `createIndex` key spec: a field name, a `{field: order}`
    /// mapping, or a list of either.
    pub fn from_key_spec(spec: &Value) -> Result<IndexDefinition> {
        let mut keys = Vec::new();
        Self::collect_keys(spec, &mut keys)?;
        if keys.is_empty() {
            return Err(SatchelError::invalid("index key spec is empty"));
        }

        let name = keys
            .iter()
            .map(|k| format!("{}_{}", k.field, k.order.name_suffix()))
            .collect::<Vec<_>>()
            .join("_");

        Ok(IndexDefinition { name, keys })
    }

    fn collect_keys(spec: &Value, keys: &mut Vec<KeySpec>) -> Result<()> {
        match spec {
            Value::String(field) => {
                keys.push(KeySpec {
                    field: field.clone(),
                    order: Order::Ascending,
                });
                Ok(())
            }
            Value::Object(map) => {
                for (field, order) in map {
                    keys.push(KeySpec {
                        field: field.clone(),
                        order: Order::from_value(order)?,
                    });
                }
                Ok(())
            }
            Value::Array(items) => {
                for item in items {
                    match item {
                        Value::String(_) | Value::Object(_) => Self::collect_keys(item, keys)?,
                        other => {
                            return Err(SatchelError::invalid(format!(
                                "invalid index key spec element: {}",
                                other
                            )));
                        }
                    }
                }
                Ok(())
            }
            other => Err(SatchelError::invalid(format!(
                "invalid index key spec: {}",
                other
            ))),
        }
    }

    /// Apply `createIndex` options. `name` overrides the generated index
    /// name; anything else is rejected.
    pub fn apply_options(&mut self, opts: Option<&Value>) -> Result<()> {
        let Some(opts) = opts else {
            return Ok(());
        };
        let obj = opts
            .as_object()
            .ok_or_else(|| SatchelError::invalid("index options must be an object"))?;
        for (key, value) in obj {
            match key.as_str() {
                "name" => {
                    let name = value.as_str().ok_or_else(|| {
                        SatchelError::invalid("index option 'name' must be a string")
                    })?;
                    if name.is_empty() || name.contains('/') {
                        return Err(SatchelError::invalid(format!(
                            "invalid index name: '{}'",
                            name
                        )));
                    }
                    self.name = name.to_string();
                }
                other => {
                    return Err(SatchelError::invalid(format!(
                        "unsupported index option: {}",
                        other
                    )));
                }
            }
        }
        Ok(())
    }

    /// `listIndexes` form: `{v, key, name}`
    pub fn to_list_value(&self) -> Value {
        let mut key = serde_json::Map::new();
        for spec in &self.keys {
            key.insert(spec.field.clone(), spec.order.to_value());
        }
        serde_json::json!({"v": 2, "key": key, "name": self.name})
    }
}

/// A named index over one collection's documents
pub struct CollectionIndex {
    definition: IndexDefinition,
    collection: String,
    store: Arc<dyn ObjectStore>,
    cache: DashMap<String, Arc<Mutex<IndexEntry>>>,
    queue: Arc<PersistQueue>,
}

impl CollectionIndex {
    pub fn new(
        collection: impl Into<String>,
        definition: IndexDefinition,
        store: Arc<dyn ObjectStore>,
    ) -> Arc<Self> {
        let queue = PersistQueue::new(DEFAULT_PERSIST_WORKERS);
        let index = Arc::new(CollectionIndex {
            definition,
            collection: collection.into(),
            store,
            cache: DashMap::new(),
            queue,
        });
        let target: Arc<dyn PersistTarget> = index.clone();
        let weak: Weak<dyn PersistTarget> = Arc::downgrade(&target);
        index.queue.bind(weak);
        index
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn definition(&self) -> &IndexDefinition {
        &self.definition
    }

    /// The fields whose values form the value key: all key fields except
    /// the last, or the single field of a one-field index.
    pub fn bucket_fields(&self) -> &[KeySpec] {
        let keys = &self.definition.keys;
        if keys.len() <= 1 {
            keys
        } else {
            &keys[..keys.len() - 1]
        }
    }

    /// The field whose value orders members within an entry
    pub fn last_field(&self) -> &KeySpec {
        self.definition.keys.last().expect("index has no keys")
    }

    fn last_descending(&self) -> bool {
        self.last_field().order == Order::Descending
    }

    pub fn metadata_object_key(&self) -> String {
        format!("{}/indices/{}.json", self.collection, self.definition.name)
    }

    fn entry_prefix(&self) -> String {
        format!("{}/indices/{}/", self.collection, self.definition.name)
    }

    pub fn entry_object_key(&self, value_key: &str) -> String {
        format!("{}{}.json", self.entry_prefix(), value_key)
    }

    /// The value key this document belongs to, or `None` when the document
    /// has no usable value for the index's first field (such documents are
    /// not indexed).
    pub fn value_key_of(&self, doc: &Document) -> Option<String> {
        let first = &self.definition.keys[0];
        match doc.get(&first.field) {
            None | Some(Value::Null) => return None,
            Some(_) => {}
        }

        let segments: Vec<String> = self
            .bucket_fields()
            .iter()
            .map(|spec| encode_segment(doc.get(&spec.field).unwrap_or(&Value::Null)))
            .collect();
        Some(segments.join("|"))
    }

    /// The member sort value for a document (last index field; null when
    /// absent).
    pub fn sort_value_of(&self, doc: &Document) -> Value {
        doc.get(&self.last_field().field)
            .cloned()
            .unwrap_or(Value::Null)
    }

    /// The lookup keys this query induces on the index.
    ///
    /// `None`: some bucket field has no enumerable values, the index cannot
    /// serve the query. `Some(vec![])`: covered, but a field's value set is
    /// empty, so the query has no candidates here.
    pub fn keys_for_query(&self, filter: &Filter) -> Option<Vec<String>> {
        let mut partials = vec![String::new()];
        for (i, spec) in self.bucket_fields().iter().enumerate() {
            let values = filter.concrete_values_for(&spec.field)?;
            if values.is_empty() {
                return Some(Vec::new());
            }
            // Null-prefixed documents are never indexed, so a null lookup
            // value would silently miss matches; leave it to the scan path.
            if values.iter().any(|v| v.is_null()) {
                return None;
            }
            let mut next = Vec::with_capacity(partials.len() * values.len());
            for partial in &partials {
                for value in &values {
                    let segment = encode_segment(value);
                    if i == 0 {
                        next.push(segment);
                    } else {
                        next.push(format!("{}|{}", partial, segment));
                    }
                }
            }
            partials = next;
        }
        Some(partials)
    }

    /// Fetch an entry through the cache.
    ///
    /// With `revalidate`, a cheap `head` decides whether the cached copy is
    /// still current; a stale or missing copy is re-read and merged over any
    /// unpersisted local deltas.
    async fn get_entry(&self, key: &str, revalidate: bool) -> Result<Arc<Mutex<IndexEntry>>> {
        let cached = self.cache.get(key).map(|e| e.value().clone());
        if let Some(entry) = cached {
            if !revalidate {
                return Ok(entry);
            }
            let remote = self
                .store
                .head(&self.entry_object_key(key))
                .await
                .map_err(SatchelError::from)?;
            let local = entry.lock().etag().map(str::to_string);
            match (remote, local) {
                (Some(remote), Some(local)) if remote == local => {
                    entry.lock().mark_validated();
                    return Ok(entry);
                }
                (None, None) => {
                    entry.lock().mark_validated();
                    return Ok(entry);
                }
                _ => {} // stale; fall through to a full fetch
            }
        }

        let entry = self
            .cache
            .entry(key.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(IndexEntry::new(key, self.last_descending())))
            })
            .value()
            .clone();

        // Conditional fetch when a (possibly stale) copy with an ETag is
        // held; plain fetch otherwise.
        let object_key = self.entry_object_key(key);
        let local_etag = entry.lock().etag().map(str::to_string);
        let fetched = match &local_etag {
            Some(etag) => self.store.get_if_none_match(&object_key, etag).await,
            None => self.store.get(&object_key).await.map(Some),
        };
        match fetched {
            // Not modified after all
            Ok(None) => entry.lock().mark_validated(),
            Ok(Some(body)) => {
                let members = IndexEntry::parse_body(&body.bytes).map_err(|err| {
                    SatchelError::server(format!("corrupt index entry {}: {}", object_key, err))
                })?;
                entry.lock().update_from_storage(members, Some(body.etag));
            }
            Err(ObjectStoreError::NotFound) => {
                // Materialise an empty entry with no ETag
                entry.lock().update_from_storage(Vec::new(), None);
            }
            Err(err) => return Err(err.into()),
        }
        Ok(entry)
    }

    /// Index a document. No-op when the document has no value for the
    /// index's first field.
    pub async fn add_document(&self, doc: &Document) -> Result<()> {
        let Some(key) = self.value_key_of(doc) else {
            return Ok(());
        };
        let entry = self.get_entry(&key, false).await?;
        let changed = entry.lock().add(doc.id.clone(), self.sort_value_of(doc));
        if changed {
            self.queue.enqueue(&key);
        }
        Ok(())
    }

    /// Remove a document from its entry
    pub async fn remove_document(&self, doc: &Document) -> Result<()> {
        let Some(key) = self.value_key_of(doc) else {
            return Ok(());
        };
        let entry = self.get_entry(&key, false).await?;
        let changed = entry.lock().remove(&doc.id);
        if changed {
            self.queue.enqueue(&key);
        }
        Ok(())
    }

    /// Re-index a replaced document. Same value key: in-place sort-value
    /// update. Different key: remove from the old entry, add to the new.
    pub async fn update_on_document_update(&self, old: &Document, new: &Document) -> Result<()> {
        let old_key = self.value_key_of(old);
        let new_key = self.value_key_of(new);
        match (&old_key, &new_key) {
            (Some(old_k), Some(new_k)) if old_k == new_k => {
                let entry = self.get_entry(old_k, false).await?;
                let changed = entry.lock().add(new.id.clone(), self.sort_value_of(new));
                if changed {
                    self.queue.enqueue(old_k);
                }
                Ok(())
            }
            _ => {
                if old_key.is_some() {
                    self.remove_document(old).await?;
                }
                if new_key.is_some() {
                    self.add_document(new).await?;
                }
                Ok(())
            }
        }
    }

    /// Members of one entry satisfying a pushed-down scan, with their sort
    /// values (for cross-entry merging). Revalidates the cached entry.
    pub async fn scan_key(&self, key: &str, scan: &EntryScan) -> Result<Vec<(DocumentId, Value)>> {
        let entry = self.get_entry(key, true).await?;
        let result = entry.lock().scan(scan);
        Ok(result)
    }

    /// Ordered document ids for a value key; `residual` pushes comparison
    /// and limit filters into the entry iteration.
    pub async fn find_ids_for_key(
        &self,
        key: &str,
        residual: Option<&EntryScan>,
    ) -> Result<Vec<DocumentId>> {
        let default_scan = EntryScan::default();
        let scan = residual.unwrap_or(&default_scan);
        Ok(self
            .scan_key(key, scan)
            .await?
            .into_iter()
            .map(|(id, _)| id)
            .collect())
    }

    /// Wait for every queued and in-flight persist of this index
    pub async fn flush(&self) -> Result<()> {
        self.queue.flush().await;
        Ok(())
    }

    pub fn status(&self) -> PersistStatus {
        self.queue.status()
    }

    /// Stop background work for this index
    pub fn shut_down(&self) {
        self.queue.cancel();
    }

    /// Delete the metadata object and every entry object of this index.
    pub async fn drop_objects(&self) -> Result<()> {
        self.queue.cancel();
        self.store
            .delete(&self.metadata_object_key())
            .await
            .map_err(SatchelError::from)?;
        let entries = self
            .store
            .list(&self.entry_prefix(), None)
            .await
            .map_err(SatchelError::from)?;
        for summary in entries {
            self.store
                .delete(&summary.key)
                .await
                .map_err(SatchelError::from)?;
        }
        self.cache.clear();
        Ok(())
    }
}

#[async_trait]
impl PersistTarget for CollectionIndex {
    /// Drain one dirty entry to storage.
    ///
    /// `If-Match` (or `If-None-Match` for a never-persisted entry) guards
    /// the write; a precondition failure re-reads the stored entry, merges
    /// the local deltas over it and retries, at most
    /// [`IMMEDIATE_RETRY_LIMIT`] times before handing the key back to the
    /// scheduler for backoff. Transient storage errors always reschedule
    /// and do not consume immediate retries.
    async fn persist_key(&self, key: &str) -> PersistOutcome {
        let Some(entry) = self.cache.get(key).map(|e| e.value().clone()) else {
            return PersistOutcome::Success;
        };
        let object_key = self.entry_object_key(key);

        for _ in 0..IMMEDIATE_RETRY_LIMIT {
            let snapshot = {
                let entry = entry.lock();
                if !entry.is_dirty() {
                    return PersistOutcome::Success;
                }
                match entry.persist_snapshot() {
                    Ok(snapshot) => snapshot,
                    Err(err) => {
                        error!(index = %self.definition.name, key, %err, "index entry serialization failed");
                        return PersistOutcome::Failed;
                    }
                }
            };

            let precondition = match &snapshot.etag {
                Some(etag) => Precondition::IfMatch(etag.clone()),
                None => Precondition::IfNoneMatch,
            };

            match self
                .store
                .put(&object_key, Bytes::from(snapshot.body), precondition)
                .await
            {
                Ok(etag) => {
                    entry.lock().commit_persist(snapshot.generation, etag);
                    return PersistOutcome::Success;
                }
                Err(ObjectStoreError::PreconditionFailed) => {
                    debug!(index = %self.definition.name, key, "persist conflict, merging");
                    match self.store.get(&object_key).await {
                        Ok(body) => match IndexEntry::parse_body(&body.bytes) {
                            Ok(members) => {
                                entry.lock().update_from_storage(members, Some(body.etag));
                            }
                            Err(err) => {
                                error!(index = %self.definition.name, key, %err, "corrupt index entry during merge");
                                return PersistOutcome::Failed;
                            }
                        },
                        Err(ObjectStoreError::NotFound) => {
                            // The stored entry vanished; write from scratch
                            entry.lock().update_from_storage(Vec::new(), None);
                        }
                        Err(err) if err.is_transient() => {
                            warn!(index = %self.definition.name, key, %err, "transient error during merge");
                            return PersistOutcome::RetryScheduled;
                        }
                        Err(err) => {
                            error!(index = %self.definition.name, key, %err, "merge read failed");
                            return PersistOutcome::Failed;
                        }
                    }
                }
                Err(err) if err.is_transient() => {
                    warn!(index = %self.definition.name, key, %err, "transient error during persist");
                    return PersistOutcome::RetryScheduled;
                }
                Err(err) => {
                    error!(index = %self.definition.name, key, %err, "persist failed");
                    return PersistOutcome::Failed;
                }
            }
        }

        debug!(index = %self.definition.name, key, "immediate retries exhausted, rescheduling");
        PersistOutcome::RetryScheduled
    }
}

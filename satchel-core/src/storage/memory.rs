// satchel-core/src/storage/memory.rs
//! In-memory object store.
//!
//! Used by tests and by the shell's `memory` repository. ETags are a
//! monotonically increasing version counter, so conditional writes behave
//! like S3's. Two engine instances holding the same `Arc<MemoryObjectStore>`
//! model two independent processes sharing one bucket.
//!
//! Every operation is counted; tests use the counters as a storage spy to
//! assert effort bounds (e.g. "this find performed exactly 2 gets").

use super::{
    ObjectBody, ObjectStore, ObjectStoreError, ObjectSummary, Precondition, StoreResult,
};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

#[derive(Debug, Clone)]
struct StoredObject {
    body: Bytes,
    etag: String,
}

/// Operation counters since the last `reset`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub gets: usize,
    pub puts: usize,
    pub heads: usize,
    pub lists: usize,
    pub deletes: usize,
}

#[derive(Default)]
struct Counters {
    gets: AtomicUsize,
    puts: AtomicUsize,
    heads: AtomicUsize,
    lists: AtomicUsize,
    deletes: AtomicUsize,
}

/// In-memory implementation of [`ObjectStore`]
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<BTreeMap<String, StoredObject>>,
    next_version: AtomicU64,
    counters: Counters,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_etag(&self) -> String {
        let version = self.next_version.fetch_add(1, Ordering::SeqCst) + 1;
        format!("\"v{}\"", version)
    }

    /// Snapshot of the operation counters
    pub fn stats(&self) -> StoreStats {
        StoreStats {
            gets: self.counters.gets.load(Ordering::SeqCst),
            puts: self.counters.puts.load(Ordering::SeqCst),
            heads: self.counters.heads.load(Ordering::SeqCst),
            lists: self.counters.lists.load(Ordering::SeqCst),
            deletes: self.counters.deletes.load(Ordering::SeqCst),
        }
    }

    pub fn reset_stats(&self) {
        self.counters.gets.store(0, Ordering::SeqCst);
        self.counters.puts.store(0, Ordering::SeqCst);
        self.counters.heads.store(0, Ordering::SeqCst);
        self.counters.lists.store(0, Ordering::SeqCst);
        self.counters.deletes.store(0, Ordering::SeqCst);
    }

    /// Number of stored objects (test helper)
    pub fn object_count(&self) -> usize {
        self.objects.lock().len()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn get(&self, key: &str) -> StoreResult<ObjectBody> {
        self.counters.gets.fetch_add(1, Ordering::SeqCst);
        let objects = self.objects.lock();
        match objects.get(key) {
            Some(stored) => Ok(ObjectBody {
                bytes: stored.body.clone(),
                etag: stored.etag.clone(),
            }),
            None => Err(ObjectStoreError::NotFound),
        }
    }

    async fn get_if_none_match(&self, key: &str, etag: &str) -> StoreResult<Option<ObjectBody>> {
        self.counters.gets.fetch_add(1, Ordering::SeqCst);
        let objects = self.objects.lock();
        match objects.get(key) {
            Some(stored) if stored.etag == etag => Ok(None),
            Some(stored) => Ok(Some(ObjectBody {
                bytes: stored.body.clone(),
                etag: stored.etag.clone(),
            })),
            None => Err(ObjectStoreError::NotFound),
        }
    }

    async fn put(&self, key: &str, body: Bytes, precondition: Precondition) -> StoreResult<String> {
        self.counters.puts.fetch_add(1, Ordering::SeqCst);
        let mut objects = self.objects.lock();

        match &precondition {
            Precondition::None => {}
            Precondition::IfMatch(expected) => match objects.get(key) {
                Some(stored) if &stored.etag == expected => {}
                _ => return Err(ObjectStoreError::PreconditionFailed),
            },
            Precondition::IfNoneMatch => {
                if objects.contains_key(key) {
                    return Err(ObjectStoreError::PreconditionFailed);
                }
            }
        }

        let etag = self.next_etag();
        objects.insert(
            key.to_string(),
            StoredObject {
                body,
                etag: etag.clone(),
            },
        );
        Ok(etag)
    }

    async fn head(&self, key: &str) -> StoreResult<Option<String>> {
        self.counters.heads.fetch_add(1, Ordering::SeqCst);
        let objects = self.objects.lock();
        Ok(objects.get(key).map(|stored| stored.etag.clone()))
    }

    async fn list(&self, prefix: &str, delimiter: Option<&str>) -> StoreResult<Vec<ObjectSummary>> {
        self.counters.lists.fetch_add(1, Ordering::SeqCst);
        let objects = self.objects.lock();
        let mut result = Vec::new();
        for (key, stored) in objects.range(prefix.to_string()..) {
            if !key.starts_with(prefix) {
                break;
            }
            if let Some(delim) = delimiter {
                if key[prefix.len()..].contains(delim) {
                    continue;
                }
            }
            result.push(ObjectSummary {
                key: key.clone(),
                etag: stored.etag.clone(),
            });
        }
        Ok(result)
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        self.counters.deletes.fetch_add(1, Ordering::SeqCst);
        let mut objects = self.objects.lock();
        Ok(objects.remove(key).is_some())
    }
}

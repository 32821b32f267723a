// satchel-core/src/database.rs
//! Database: an explicit container owning collections by name.
//!
//! Collections are acquired on demand and cached for the life of the
//! database handle. No process-wide registries; everything hangs off this
//! struct.

use crate::collection::{CollectionStore, MemoryCollection, ObjectCollection};
use crate::error::{Result, SatchelError};
use crate::storage::ObjectStore;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

enum DatabaseBackend {
    Memory,
    Object(Arc<dyn ObjectStore>),
}

pub struct Database {
    name: String,
    backend: DatabaseBackend,
    collections: DashMap<String, Arc<dyn CollectionStore>>,
    closed: AtomicBool,
}

impl Database {
    /// Database over the volatile in-process backend
    pub fn in_memory(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Database {
            name: name.into(),
            backend: DatabaseBackend::Memory,
            collections: DashMap::new(),
            closed: AtomicBool::new(false),
        })
    }

    /// Database whose collections live in the given object store
    pub fn with_object_store(name: impl Into<String>, store: Arc<dyn ObjectStore>) -> Arc<Self> {
        Arc::new(Database {
            name: name.into(),
            backend: DatabaseBackend::Object(store),
            collections: DashMap::new(),
            closed: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(SatchelError::ClientClosed)
        } else {
            Ok(())
        }
    }

    /// Acquire a collection handle, creating it on first use.
    pub async fn collection(&self, name: &str) -> Result<Arc<dyn CollectionStore>> {
        self.check_open()?;
        if let Some(existing) = self.collections.get(name) {
            return Ok(existing.value().clone());
        }

        let created: Arc<dyn CollectionStore> = match &self.backend {
            DatabaseBackend::Memory => Arc::new(MemoryCollection::new(name)),
            DatabaseBackend::Object(store) => {
                ObjectCollection::open(name, Arc::clone(store)).await?
            }
        };
        let handle = self
            .collections
            .entry(name.to_string())
            .or_insert(created)
            .value()
            .clone();
        Ok(handle)
    }

    /// Close the database and every collection acquired through it.
    /// Idempotent.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        for entry in self.collections.iter() {
            entry.value().close().await?;
        }
        debug!(database = %self.name, "database closed");
        Ok(())
    }
}

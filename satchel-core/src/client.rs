// satchel-core/src/client.rs
//! Client surface: `connect(repository_type)`, `db(name?)`,
//! `collection(name)`, `close()`.
//!
//! Repository specs: `memory` for the volatile backend, or
//! `s3://bucket[/prefix]` for the durable one. The S3 client is built from
//! the ambient AWS environment once at connect time; each database gets its
//! own key prefix under the repository prefix.

use crate::collection::CollectionStore;
use crate::database::Database;
use crate::error::{Result, SatchelError};
use crate::storage::{ObjectStore, S3ObjectStore};
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;

/// Database name used when `db()` is called without one
pub const DEFAULT_DATABASE: &str = "app";

/// Parsed repository spec
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Repository {
    Memory,
    S3 { bucket: String, prefix: String },
}

impl Repository {
    pub fn parse(spec: &str) -> Result<Repository> {
        let spec = spec.trim();
        if spec.eq_ignore_ascii_case("memory") {
            return Ok(Repository::Memory);
        }
        if let Some(rest) = spec.strip_prefix("s3://") {
            let (bucket, prefix) = rest.split_once('/').unwrap_or((rest, ""));
            if bucket.is_empty() {
                return Err(SatchelError::invalid("s3 repository needs a bucket"));
            }
            return Ok(Repository::S3 {
                bucket: bucket.to_string(),
                prefix: prefix.trim_matches('/').to_string(),
            });
        }
        Err(SatchelError::invalid(format!(
            "unknown repository type '{}'; expected \"memory\" or \"s3://bucket[/prefix]\"",
            spec
        )))
    }
}

enum ClientBackend {
    Memory,
    S3 {
        client: aws_sdk_s3::Client,
        bucket: String,
        prefix: String,
    },
}

struct ClientInner {
    backend: ClientBackend,
    databases: DashMap<String, Arc<Database>>,
    closed: AtomicBool,
}

/// Handle to one repository; cheap to clone.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Connect to a repository described by `spec`.
    pub async fn connect(spec: &str) -> Result<Client> {
        let repository = Repository::parse(spec)?;
        let backend = match repository {
            Repository::Memory => ClientBackend::Memory,
            Repository::S3 { bucket, prefix } => ClientBackend::S3 {
                client: crate::storage::s3::client_from_env().await,
                bucket,
                prefix,
            },
        };
        info!(repository = spec, "connected");
        Ok(Client {
            inner: Arc::new(ClientInner {
                backend,
                databases: DashMap::new(),
                closed: AtomicBool::new(false),
            }),
        })
    }

    fn check_open(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            Err(SatchelError::ClientClosed)
        } else {
            Ok(())
        }
    }

    /// A database handle; `None` selects [`DEFAULT_DATABASE`].
    pub fn db(&self, name: Option<&str>) -> Result<Arc<Database>> {
        self.check_open()?;
        let name = name.unwrap_or(DEFAULT_DATABASE);
        if let Some(existing) = self.inner.databases.get(name) {
            return Ok(existing.value().clone());
        }

        let database = match &self.inner.backend {
            ClientBackend::Memory => Database::in_memory(name),
            ClientBackend::S3 {
                client,
                bucket,
                prefix,
            } => {
                let key_prefix = if prefix.is_empty() {
                    name.to_string()
                } else {
                    format!("{}/{}", prefix, name)
                };
                let store: Arc<dyn ObjectStore> =
                    Arc::new(S3ObjectStore::new(client.clone(), bucket.clone(), key_prefix));
                Database::with_object_store(name, store)
            }
        };
        let handle = self
            .inner
            .databases
            .entry(name.to_string())
            .or_insert(database)
            .value()
            .clone();
        Ok(handle)
    }

    /// Convenience: a collection in the default database.
    pub async fn collection(&self, name: &str) -> Result<Arc<dyn CollectionStore>> {
        self.db(None)?.collection(name).await
    }

    /// Close the client and everything acquired through it. Idempotent.
    pub async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        for entry in self.inner.databases.iter() {
            entry.value().close().await?;
        }
        info!("client closed");
        Ok(())
    }
}

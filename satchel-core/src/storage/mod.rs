// satchel-core/src/storage/mod.rs
//! Object-store adapter: a thin, normalised wrapper over a (bucket, key)
//! addressable store with ETags and write preconditions.
//!
//! Backends:
//! - [`S3ObjectStore`] - production, aws-sdk-s3
//! - [`MemoryObjectStore`] - in-process store for tests; shareable between
//!   engine instances to model independent processes on one bucket
//!
//! Every backend error is normalised into one of four kinds so the layers
//! above never see SDK-specific types.

pub mod memory;
pub mod s3;

pub use memory::{MemoryObjectStore, StoreStats};
pub use s3::S3ObjectStore;

use crate::error::SatchelError;
use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

/// All stored objects are JSON
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Normalised storage errors
#[derive(Debug, Error)]
pub enum ObjectStoreError {
    #[error("object not found")]
    NotFound,

    #[error("precondition failed")]
    PreconditionFailed,

    /// Timeouts, connection resets, DNS failures
    #[error("transient storage error: {0}")]
    Transient(String),

    /// Everything else
    #[error("storage error: {0}")]
    Fatal(String),
}

impl ObjectStoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ObjectStoreError::Transient(_))
    }
}

impl From<ObjectStoreError> for SatchelError {
    fn from(err: ObjectStoreError) -> Self {
        match err {
            ObjectStoreError::NotFound => SatchelError::NotFound("object not found".to_string()),
            ObjectStoreError::PreconditionFailed => {
                SatchelError::Conflict("etag precondition failed".to_string())
            }
            ObjectStoreError::Transient(msg) => SatchelError::Network(msg),
            ObjectStoreError::Fatal(msg) => SatchelError::Server(msg),
        }
    }
}

pub type StoreResult<T> = std::result::Result<T, ObjectStoreError>;

/// A fetched object with its version tag
#[derive(Debug, Clone)]
pub struct ObjectBody {
    pub bytes: Bytes,
    pub etag: String,
}

/// One listing entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectSummary {
    pub key: String,
    pub etag: String,
}

/// Write precondition for `put`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Precondition {
    /// Unconditional overwrite
    None,
    /// Write only if the current ETag matches
    IfMatch(String),
    /// Write only if the object does not exist yet
    IfNoneMatch,
}

/// The five-operation contract every backend implements.
///
/// Keys are logical: a backend may prepend its own key prefix.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch an object. `not-found` is an error here; callers that expect
    /// absence match on it.
    async fn get(&self, key: &str) -> StoreResult<ObjectBody>;

    /// Conditional fetch. `Ok(None)` means "not modified" (the stored ETag
    /// still equals `etag`).
    async fn get_if_none_match(&self, key: &str, etag: &str) -> StoreResult<Option<ObjectBody>>;

    /// Write an object, returning the new ETag.
    async fn put(&self, key: &str, body: Bytes, precondition: Precondition) -> StoreResult<String>;

    /// Cheap revalidation: current ETag, or `None` when the object is absent.
    async fn head(&self, key: &str) -> StoreResult<Option<String>>;

    /// List objects under a prefix. With a delimiter only direct children
    /// (keys whose remainder contains no delimiter) are returned.
    async fn list(&self, prefix: &str, delimiter: Option<&str>) -> StoreResult<Vec<ObjectSummary>>;

    /// Idempotent delete; reports whether the object existed.
    async fn delete(&self, key: &str) -> StoreResult<bool>;
}

// satchel-core/src/lib.rs
//! Satchel: a document collection store with a MongoDB-compatible surface
//! over object storage.
//!
//! Documents and index entries are individual JSON objects in an object
//! store (S3 in production, an in-process store for tests). The interesting
//! machinery is the indexing core: persistent per-key secondary indexes
//! with optimistic-concurrency merging, an asynchronous persist queue, and
//! a query planner that turns `find` calls into O(matching) object reads
//! instead of a full list+get scan.

pub mod client;
pub mod collection;
pub mod database;
pub mod document;
pub mod error;
pub mod find_options;
pub mod index;
pub mod planner;
pub mod query;
pub mod storage;
pub mod value_utils;

#[cfg(test)]
mod test_concurrency;
#[cfg(test)]
mod test_end_to_end;

// Public exports
pub use client::{Client, Repository, DEFAULT_DATABASE};
pub use collection::{
    CollectionStore, Cursor, DeleteResult, InsertManyResult, InsertOneResult, MemoryCollection,
    ObjectCollection, UpdateResult,
};
pub use database::Database;
pub use document::{Document, DocumentId};
pub use error::{Result, SatchelError};
pub use find_options::FindOptions;
pub use index::{CollectionIndex, IndexDefinition, Order, PersistStatus};
pub use query::Filter;
pub use storage::{MemoryObjectStore, ObjectStore, S3ObjectStore};

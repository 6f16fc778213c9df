//! Storage backend abstraction for the mapper.
//!
//! This module defines the traits that abstract over the storage collaborator. A backend
//! stores raw records (BSON documents with a reserved `_id` key) in named collections, plus
//! a binary large-object sub-store that shares the same identifier space.
//!
//! # Overview
//!
//! The [`StoreBackend`] trait provides the minimal async interface a repository needs:
//! find, insert, update, remove and index creation, and their file-store variants.
//! Implementations are required to be thread-safe (`Send + Sync`) and are shared by all
//! repositories of a [`Mapper`](crate::mapper::Mapper) behind an `Arc`.
//!
//! # Write operators
//!
//! The update document passed to [`StoreBackend::update_one`] contains at most two operator
//! keys, `$set` (assign these field paths) and `$unset` (remove these field paths). A document
//! without operator keys replaces the stored record.
//!
//! # Examples
//!
//! ```ignore
//! use docmapper::backend::StoreBackend;
//! use bson::doc;
//!
//! let backend = MyBackendImpl::new();
//!
//! let ids = backend.insert_many("users", vec![doc! { "name": "Alice" }]).await?;
//! backend.update_one("users", &Filter::eq("_id", ids[0]), doc! { "$set": { "name": "Bob" } }).await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use async_trait::async_trait;
use bson::{Document, oid::ObjectId};
use std::fmt::Debug;

use crate::{
    definition::IndexDef,
    error::DocumentStoreResult,
    query::{Expr, Query},
};

/// A file to write into a backend's binary large-object store.
#[derive(Debug, Clone)]
pub struct NewFile {
    /// Declared fields stored alongside the bytes.
    pub metadata: Document,
    /// The file content.
    pub bytes: Vec<u8>,
}

/// Abstract interface for storage backends.
///
/// # Thread Safety
///
/// All implementations must be thread-safe and support concurrent access from multiple
/// async tasks. The exact concurrency model is implementation-specific.
///
/// # Error Handling
///
/// Operations return [`DocumentStoreResult<T>`](crate::error::DocumentStoreResult). Backends
/// report driver failures as [`DocumentStoreError::Backend`](crate::error::DocumentStoreError::Backend);
/// repositories attach the shape name and operation before propagating them.
#[async_trait]
pub trait StoreBackend: Send + Sync + Debug {
    /// Finds the records of a collection matching a query.
    ///
    /// Filtering, projection, sorting, offset and limit are all taken from `query`. A missing
    /// collection yields an empty result.
    ///
    /// # Arguments
    ///
    /// * `collection` - The name of the collection to query
    /// * `query` - The [`Query`] specifying filter, projection, sort, limit and offset
    async fn find(&self, collection: &str, query: &Query) -> DocumentStoreResult<Vec<Document>>;

    /// Finds the first record of a collection matching a filter.
    ///
    /// The default implementation runs [`StoreBackend::find`] with a limit of one.
    async fn find_one(
        &self,
        collection: &str,
        filter: Option<&Expr>,
        fields: Option<&[String]>,
    ) -> DocumentStoreResult<Option<Document>> {
        let query = Query {
            filter: filter.cloned(),
            fields: fields.map(|fields| fields.to_vec()),
            limit: Some(1),
            ..Query::default()
        };

        Ok(self.find(collection, &query).await?.into_iter().next())
    }

    /// Inserts records in one batch and returns the identifier of each, in input order.
    ///
    /// Records without an `_id` key are assigned a freshly generated identifier.
    async fn insert_many(
        &self,
        collection: &str,
        documents: Vec<Document>,
    ) -> DocumentStoreResult<Vec<ObjectId>>;

    /// Applies an update to the first record matching `filter`.
    ///
    /// Returns `true` if a record matched.
    async fn update_one(
        &self,
        collection: &str,
        filter: &Expr,
        update: Document,
    ) -> DocumentStoreResult<bool>;

    /// Removes every record matching `filter` (all records when `None`) and returns the count.
    async fn remove_many(&self, collection: &str, filter: Option<&Expr>) -> DocumentStoreResult<u64>;

    /// Creates an index if it does not exist yet.
    ///
    /// Calling this repeatedly with the same index is a no-op.
    async fn ensure_index(&self, collection: &str, index: &IndexDef) -> DocumentStoreResult<()>;

    /// Stores files and returns the identifier of each, in input order.
    async fn insert_files(
        &self,
        collection: &str,
        files: Vec<NewFile>,
    ) -> DocumentStoreResult<Vec<ObjectId>>;

    /// Finds stored files.
    ///
    /// Each returned record contains the metadata fields of one file plus `_id` and `length`.
    /// Filters and sorts apply to the metadata fields.
    async fn find_files(&self, collection: &str, query: &Query) -> DocumentStoreResult<Vec<Document>>;

    /// Applies `$set`/`$unset` operators to the metadata of a stored file.
    async fn update_file(
        &self,
        collection: &str,
        id: ObjectId,
        update: Document,
    ) -> DocumentStoreResult<bool>;

    /// Reads the bytes of a stored file.
    async fn read_file(&self, collection: &str, id: ObjectId) -> DocumentStoreResult<Vec<u8>>;

    /// Removes stored files matching `filter` together with their bytes.
    async fn remove_files(&self, collection: &str, filter: Option<&Expr>) -> DocumentStoreResult<u64>;

    /// Cleanly shuts down the backend, releasing all resources.
    ///
    /// The default implementation is a no-op, but backends with external connections
    /// should override this.
    async fn shutdown(self) -> DocumentStoreResult<()>
    where
        Self: Sized,
    {
        Ok(())
    }
}

#[async_trait]
pub trait StoreBackendBuilder {
    type Backend: StoreBackend;

    async fn build(self) -> DocumentStoreResult<Self::Backend>;
}

//! Logged access to one collection of one connection.
//!
//! A [`Collection`] is the only path from a [`Repository`](crate::repository::Repository) to its
//! storage backend. Every call emits a `tracing` debug event and, when the mapper was built with
//! a [`QueryLogger`], one [`QueryLog`] record describing the operation.
//!
//! # Example
//!
//! ```ignore
//! let mapper = Mapper::builder(container)
//!     .connection("main", InMemoryStore::new())
//!     .logger(|log: &QueryLog| println!("{} {} {}", log.connection, log.collection, log.operation))
//!     .build()?;
//! ```

use std::{fmt, sync::Arc};

use bson::{Bson, Document, doc, oid::ObjectId, ser::serialize_to_bson};
use serde::Serialize;

use crate::{
    backend::{NewFile, StoreBackend},
    definition::IndexDef,
    error::DocumentStoreResult,
    query::{Expr, Query},
};

/// One storage operation, as reported to a [`QueryLogger`].
#[derive(Debug, Clone, PartialEq)]
pub struct QueryLog {
    pub connection: String,
    pub collection: String,
    /// The backend operation, e.g. `insert_many` or `find`.
    pub operation: &'static str,
    /// The arguments of the operation in storage syntax.
    pub payload: Document,
}

/// Receives a [`QueryLog`] for every storage operation.
pub type QueryLogger = Arc<dyn Fn(&QueryLog) + Send + Sync>;

/// A backend handle bound to one collection.
#[derive(Clone)]
pub struct Collection {
    connection: String,
    name: String,
    backend: Arc<dyn StoreBackend>,
    logger: Option<QueryLogger>,
}

impl fmt::Debug for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collection")
            .field("connection", &self.connection)
            .field("name", &self.name)
            .field("backend", &self.backend)
            .field("logger", &self.logger.is_some())
            .finish()
    }
}

fn to_bson<T: Serialize + ?Sized>(value: &T) -> Bson {
    serialize_to_bson(value).unwrap_or_else(|e| Bson::String(e.to_string()))
}

impl Collection {
    pub(crate) fn new(
        connection: impl Into<String>,
        name: impl Into<String>,
        backend: Arc<dyn StoreBackend>,
        logger: Option<QueryLogger>,
    ) -> Self {
        Self {
            connection: connection.into(),
            name: name.into(),
            backend,
            logger,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn connection(&self) -> &str {
        &self.connection
    }

    pub fn backend(&self) -> &Arc<dyn StoreBackend> {
        &self.backend
    }

    fn log(&self, operation: &'static str, payload: impl FnOnce() -> Document) {
        tracing::debug!(
            connection = %self.connection,
            collection = %self.name,
            operation,
            "storage operation"
        );

        if let Some(logger) = &self.logger {
            logger(&QueryLog {
                connection: self.connection.clone(),
                collection: self.name.clone(),
                operation,
                payload: payload(),
            });
        }
    }

    pub async fn insert_many(&self, documents: Vec<Document>) -> DocumentStoreResult<Vec<ObjectId>> {
        self.log("insert_many", || doc! { "documents": documents.clone() });
        self.backend.insert_many(&self.name, documents).await
    }

    pub async fn update_one(&self, filter: &Expr, update: Document) -> DocumentStoreResult<bool> {
        self.log("update_one", || {
            doc! { "filter": to_bson(filter), "update": update.clone() }
        });
        self.backend.update_one(&self.name, filter, update).await
    }

    pub async fn find(&self, query: &Query) -> DocumentStoreResult<Vec<Document>> {
        self.log("find", || doc! { "query": to_bson(query) });
        self.backend.find(&self.name, query).await
    }

    pub async fn find_one(
        &self,
        filter: Option<&Expr>,
        fields: Option<&[String]>,
    ) -> DocumentStoreResult<Option<Document>> {
        self.log("find_one", || {
            doc! { "filter": to_bson(&filter), "fields": to_bson(&fields) }
        });
        self.backend.find_one(&self.name, filter, fields).await
    }

    pub async fn remove_many(&self, filter: Option<&Expr>) -> DocumentStoreResult<u64> {
        self.log("remove_many", || doc! { "filter": to_bson(&filter) });
        self.backend.remove_many(&self.name, filter).await
    }

    pub async fn ensure_index(&self, index: &IndexDef) -> DocumentStoreResult<()> {
        self.log("ensure_index", || doc! { "index": to_bson(index) });
        self.backend.ensure_index(&self.name, index).await
    }

    pub async fn insert_files(&self, files: Vec<NewFile>) -> DocumentStoreResult<Vec<ObjectId>> {
        self.log("insert_files", || {
            let files = files
                .iter()
                .map(|file| {
                    let length = file.bytes.len() as i64;
                    doc! { "metadata": file.metadata.clone(), "length": length }
                })
                .collect::<Vec<_>>();
            doc! { "files": files }
        });
        self.backend.insert_files(&self.name, files).await
    }

    pub async fn find_files(&self, query: &Query) -> DocumentStoreResult<Vec<Document>> {
        self.log("find_files", || doc! { "query": to_bson(query) });
        self.backend.find_files(&self.name, query).await
    }

    pub async fn update_file(&self, id: ObjectId, update: Document) -> DocumentStoreResult<bool> {
        self.log("update_file", || doc! { "id": id, "update": update.clone() });
        self.backend.update_file(&self.name, id, update).await
    }

    pub async fn remove_files(&self, filter: Option<&Expr>) -> DocumentStoreResult<u64> {
        self.log("remove_files", || doc! { "filter": to_bson(&filter) });
        self.backend.remove_files(&self.name, filter).await
    }
}

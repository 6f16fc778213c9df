//! In-memory storage implementation.
//!
//! Records are kept as BSON documents in insertion order, per collection, behind an
//! async-aware read-write lock. Files live in a separate map per collection, holding their
//! metadata and bytes side by side.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use bson::{Bson, Document, oid::ObjectId};
use indexmap::IndexMap;
use mea::rwlock::RwLock;

use docmapper_core::{
    backend::{NewFile, StoreBackend, StoreBackendBuilder},
    definition::IndexDef,
    error::{DocumentStoreError, DocumentStoreResult},
    query::{Expr, Query},
};

use crate::evaluator::{DocumentEvaluator, compare_records};

type Records = IndexMap<ObjectId, Document>;

#[derive(Debug, Clone)]
struct StoredFile {
    metadata: Document,
    bytes: Vec<u8>,
}

impl StoredFile {
    /// The record seen by queries: metadata plus `_id` and `length`.
    fn record(&self, id: ObjectId) -> Document {
        let mut record = Document::new();
        record.insert("_id", id);
        for (key, value) in &self.metadata {
            record.insert(key.clone(), value.clone());
        }
        record.insert("length", self.bytes.len() as i64);
        record
    }
}

#[derive(Debug, Default)]
struct StoreState {
    collections: HashMap<String, Records>,
    files: HashMap<String, IndexMap<ObjectId, StoredFile>>,
    indexes: HashMap<String, Vec<IndexDef>>,
}

/// Thread-safe in-memory storage backend.
///
/// `InMemoryStore` is cloneable and uses an `Arc`-wrapped internal state; clones share the
/// same data. Queries scan every record of a collection; declared indexes are recorded but
/// not used.
///
/// # Example
///
/// ```ignore
/// use docmapper_memory::InMemoryStore;
/// use docmapper::backend::StoreBackend;
/// use bson::doc;
///
/// let store = InMemoryStore::new();
/// let ids = store.insert_many("users", vec![doc! { "name": "Alice" }]).await?;
/// assert_eq!(store.count("users").await, 1);
/// ```
#[derive(Default, Clone, Debug)]
pub struct InMemoryStore {
    state: Arc<RwLock<StoreState>>,
}

impl InMemoryStore {
    /// Creates a new, empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a builder for constructing an `InMemoryStore`.
    pub fn builder() -> InMemoryStoreBuilder {
        InMemoryStoreBuilder
    }

    /// Every record of a collection, in insertion order.
    pub async fn records(&self, collection: &str) -> Vec<Document> {
        self.state
            .read()
            .await
            .collections
            .get(collection)
            .map(|records| records.values().cloned().collect())
            .unwrap_or_default()
    }

    /// The number of records in a collection.
    pub async fn count(&self, collection: &str) -> usize {
        self.state
            .read()
            .await
            .collections
            .get(collection)
            .map_or(0, IndexMap::len)
    }

    /// The indexes created on a collection.
    pub async fn indexes(&self, collection: &str) -> Vec<IndexDef> {
        self.state
            .read()
            .await
            .indexes
            .get(collection)
            .cloned()
            .unwrap_or_default()
    }

    /// The names of the collections holding records.
    pub async fn list_collections(&self) -> Vec<String> {
        let mut names = self
            .state
            .read()
            .await
            .collections
            .keys()
            .cloned()
            .collect::<Vec<_>>();
        names.sort();
        names
    }
}

fn record_id(record: &Document) -> DocumentStoreResult<ObjectId> {
    match record.get("_id") {
        Some(Bson::ObjectId(id)) => Ok(*id),
        Some(other) => Err(DocumentStoreError::Backend(format!(
            "unsupported identifier {other}"
        ))),
        None => Ok(ObjectId::new()),
    }
}

/// Applies filter, sort, offset, limit and projection.
fn run_query(records: impl Iterator<Item = Document>, query: &Query) -> DocumentStoreResult<Vec<Document>> {
    let mut matched = Vec::new();
    for record in records {
        if DocumentEvaluator::matches(&record, query.filter.as_ref())? {
            matched.push(record);
        }
    }

    if !query.sort.is_empty() {
        matched.sort_by(|left, right| compare_records(left, right, &query.sort));
    }

    Ok(matched
        .into_iter()
        .skip(query.offset.unwrap_or(0))
        .take(query.limit.unwrap_or(usize::MAX))
        .map(|record| match &query.fields {
            Some(fields) => project(record, fields),
            None => record,
        })
        .collect())
}

fn project(record: Document, fields: &[String]) -> Document {
    record
        .into_iter()
        .filter(|(key, _)| {
            key == "_id"
                || fields
                    .iter()
                    .any(|field| field.split('.').next() == Some(key.as_str()))
        })
        .collect()
}

fn set_path(document: &mut Document, path: &str, value: Bson) -> DocumentStoreResult<()> {
    match path.split_once('.') {
        None => {
            document.insert(path, value);
            Ok(())
        }
        Some((head, rest)) => {
            let entry = document
                .entry(head.to_string())
                .or_insert_with(|| Bson::Document(Document::new()));

            match entry {
                Bson::Document(inner) => set_path(inner, rest, value),
                other => Err(DocumentStoreError::Backend(format!(
                    "cannot set \"{rest}\" inside the {:?} value at \"{head}\"",
                    other.element_type()
                ))),
            }
        }
    }
}

fn unset_path(document: &mut Document, path: &str) {
    match path.split_once('.') {
        None => {
            document.remove(path);
        }
        Some((head, rest)) => {
            if let Some(Bson::Document(inner)) = document.get_mut(head) {
                unset_path(inner, rest);
            }
        }
    }
}

/// Applies `$set`/`$unset` operators, or replaces the record when `update` has none.
fn apply_update(record: &mut Document, update: Document) -> DocumentStoreResult<()> {
    let has_operators = update.keys().any(|key| key.starts_with('$'));

    if !has_operators {
        let id = record.get("_id").cloned();
        record.clear();
        if let Some(id) = id {
            record.insert("_id", id);
        }
        for (key, value) in update {
            if key != "_id" {
                record.insert(key, value);
            }
        }
        return Ok(());
    }

    for (operator, arguments) in update {
        let Bson::Document(arguments) = arguments else {
            return Err(DocumentStoreError::Backend(format!(
                "the arguments of \"{operator}\" must be a document"
            )));
        };

        match operator.as_str() {
            "$set" => {
                for (path, value) in arguments {
                    set_path(record, &path, value)?;
                }
            }
            "$unset" => {
                for path in arguments.keys() {
                    unset_path(record, path);
                }
            }
            other => {
                return Err(DocumentStoreError::Backend(format!(
                    "unsupported update operator \"{other}\""
                )));
            }
        }
    }

    Ok(())
}

#[async_trait]
impl StoreBackend for InMemoryStore {
    async fn find(&self, collection: &str, query: &Query) -> DocumentStoreResult<Vec<Document>> {
        let state = self.state.read().await;
        let Some(records) = state.collections.get(collection) else {
            return Ok(vec![]);
        };

        run_query(records.values().cloned(), query)
    }

    async fn insert_many(
        &self,
        collection: &str,
        documents: Vec<Document>,
    ) -> DocumentStoreResult<Vec<ObjectId>> {
        let mut state = self.state.write().await;
        let records = state.collections.entry(collection.to_string()).or_default();

        let mut prepared = Vec::with_capacity(documents.len());
        for document in documents {
            let id = record_id(&document)?;
            if records.contains_key(&id) || prepared.iter().any(|(other, _)| *other == id) {
                return Err(DocumentStoreError::Backend(format!(
                    "duplicate identifier {id} in \"{collection}\""
                )));
            }

            let mut record = Document::new();
            record.insert("_id", id);
            for (key, value) in document {
                if key != "_id" {
                    record.insert(key, value);
                }
            }
            prepared.push((id, record));
        }

        let ids = prepared.iter().map(|(id, _)| *id).collect();
        records.extend(prepared);

        Ok(ids)
    }

    async fn update_one(
        &self,
        collection: &str,
        filter: &Expr,
        update: Document,
    ) -> DocumentStoreResult<bool> {
        let mut state = self.state.write().await;
        let Some(records) = state.collections.get_mut(collection) else {
            return Ok(false);
        };

        for record in records.values_mut() {
            if DocumentEvaluator::matches(record, Some(filter))? {
                apply_update(record, update)?;
                return Ok(true);
            }
        }

        Ok(false)
    }

    async fn remove_many(&self, collection: &str, filter: Option<&Expr>) -> DocumentStoreResult<u64> {
        let mut state = self.state.write().await;
        let Some(records) = state.collections.get_mut(collection) else {
            return Ok(0);
        };

        let mut removed = Vec::new();
        for (id, record) in records.iter() {
            if DocumentEvaluator::matches(record, filter)? {
                removed.push(*id);
            }
        }
        for id in &removed {
            records.shift_remove(id);
        }

        Ok(removed.len() as u64)
    }

    async fn ensure_index(&self, collection: &str, index: &IndexDef) -> DocumentStoreResult<()> {
        let mut state = self.state.write().await;
        let indexes = state.indexes.entry(collection.to_string()).or_default();

        if !indexes.contains(index) {
            tracing::trace!(collection, keys = ?index.keys, "recording index");
            indexes.push(index.clone());
        }

        Ok(())
    }

    async fn insert_files(
        &self,
        collection: &str,
        files: Vec<NewFile>,
    ) -> DocumentStoreResult<Vec<ObjectId>> {
        let mut state = self.state.write().await;
        let stored = state.files.entry(collection.to_string()).or_default();

        let mut ids = Vec::with_capacity(files.len());
        for file in files {
            let id = record_id(&file.metadata)?;
            let metadata = file
                .metadata
                .into_iter()
                .filter(|(key, _)| key != "_id" && key != "length")
                .collect();
            stored.insert(
                id,
                StoredFile {
                    metadata,
                    bytes: file.bytes,
                },
            );
            ids.push(id);
        }

        Ok(ids)
    }

    async fn find_files(&self, collection: &str, query: &Query) -> DocumentStoreResult<Vec<Document>> {
        let state = self.state.read().await;
        let Some(stored) = state.files.get(collection) else {
            return Ok(vec![]);
        };

        run_query(stored.iter().map(|(id, file)| file.record(*id)), query)
    }

    async fn update_file(
        &self,
        collection: &str,
        id: ObjectId,
        update: Document,
    ) -> DocumentStoreResult<bool> {
        let mut state = self.state.write().await;
        let Some(file) = state
            .files
            .get_mut(collection)
            .and_then(|stored| stored.get_mut(&id))
        else {
            return Ok(false);
        };

        apply_update(&mut file.metadata, update)?;
        file.metadata.remove("_id");

        Ok(true)
    }

    async fn read_file(&self, collection: &str, id: ObjectId) -> DocumentStoreResult<Vec<u8>> {
        self.state
            .read()
            .await
            .files
            .get(collection)
            .and_then(|stored| stored.get(&id))
            .map(|file| file.bytes.clone())
            .ok_or_else(|| DocumentStoreError::Backend(format!("no file {id} in \"{collection}\"")))
    }

    async fn remove_files(&self, collection: &str, filter: Option<&Expr>) -> DocumentStoreResult<u64> {
        let mut state = self.state.write().await;
        let Some(stored) = state.files.get_mut(collection) else {
            return Ok(0);
        };

        let mut removed = Vec::new();
        for (id, file) in stored.iter() {
            if DocumentEvaluator::matches(&file.record(*id), filter)? {
                removed.push(*id);
            }
        }
        for id in &removed {
            stored.shift_remove(id);
        }

        Ok(removed.len() as u64)
    }
}

/// Builder for constructing [`InMemoryStore`] instances.
///
/// ```ignore
/// use docmapper::backend::StoreBackendBuilder;
///
/// let store = InMemoryStore::builder().build().await?;
/// ```
#[derive(Default)]
pub struct InMemoryStoreBuilder;

#[async_trait]
impl StoreBackendBuilder for InMemoryStoreBuilder {
    type Backend = InMemoryStore;

    async fn build(self) -> DocumentStoreResult<Self::Backend> {
        Ok(InMemoryStore::new())
    }
}

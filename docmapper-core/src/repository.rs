//! Querying and persisting the documents of one shape.
//!
//! A [`Repository`] turns raw storage records into [`Document`]s and documents back into
//! storage writes. Saving and deleting fire the lifecycle [`Event`]s of the shape around the
//! storage calls:
//!
//! | operation | before the storage call | after the storage call |
//! |-----------|-------------------------|------------------------|
//! | insert    | `preInsert`, `preSave`  | `postInsert`, `postSave` |
//! | update    | `preUpdate`, `preSave`  | `postUpdate`, `postSave` |
//! | delete    | `preDelete`             | `postDelete`           |
//!
//! New documents of one [`Repository::save`] call are written in a single batch; updates are
//! written one document at a time. An update with nothing to write skips the storage call but
//! still fires its events. A failing hook stops the pipeline where it is; writes already made
//! are not rolled back.
//!
//! # Example
//!
//! ```ignore
//! let articles = container.repository("Article")?;
//!
//! let article = articles.create()?;
//! article.set("title", "Hello")?;
//! articles.save([&article]).await?;
//!
//! let found = articles
//!     .find(FindOptions::new().sort("title", SortDirection::Asc).limit(10))
//!     .await?;
//! ```

use std::sync::Arc;

use bson::Bson;
use indexmap::IndexMap;

use crate::{
    backend::NewFile,
    collection::Collection,
    container::Container,
    definition::{Definition, Event},
    document::Document,
    error::{DocumentStoreError, DocumentStoreResult},
    query::{Expr, Filter, Query, Sort, SortDirection},
    value::{FileHandle, Value},
};

/// What to find, and how to shape the result.
#[derive(Debug, Clone, Default)]
pub struct FindOptions {
    pub filter: Option<Expr>,
    /// Restricts the loaded fields; `_id` is always loaded.
    pub fields: Option<Vec<String>>,
    pub sort: Vec<Sort>,
    pub limit: Option<usize>,
    pub skip: Option<usize>,
    /// Returns the first document only.
    pub one: bool,
    /// Keys the result by `_id` or by the value of a declared field.
    pub index_by: Option<String>,
}

impl FindOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, filter: Expr) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    pub fn sort(mut self, field: impl Into<String>, direction: SortDirection) -> Self {
        self.sort.push(Sort {
            field: field.into(),
            direction,
        });
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn skip(mut self, skip: usize) -> Self {
        self.skip = Some(skip);
        self
    }

    pub fn one(mut self) -> Self {
        self.one = true;
        self
    }

    pub fn index_by(mut self, key: impl Into<String>) -> Self {
        self.index_by = Some(key.into());
        self
    }
}

/// The documents found by [`Repository::find`].
#[derive(Debug, Clone)]
pub enum FindResult {
    /// Returned when [`FindOptions::one`] is set.
    One(Document),
    /// The documents in storage order.
    Many(Vec<Document>),
    /// The documents keyed by [`FindOptions::index_by`]. On duplicate keys the document found
    /// last wins.
    Indexed(IndexMap<String, Document>),
}

impl FindResult {
    pub fn len(&self) -> usize {
        match self {
            FindResult::One(_) => 1,
            FindResult::Many(documents) => documents.len(),
            FindResult::Indexed(documents) => documents.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn into_documents(self) -> Vec<Document> {
        match self {
            FindResult::One(document) => vec![document],
            FindResult::Many(documents) => documents,
            FindResult::Indexed(documents) => documents.into_values().collect(),
        }
    }

    pub fn into_one(self) -> Option<Document> {
        self.into_documents().into_iter().next()
    }

    pub fn into_indexed(self) -> Option<IndexMap<String, Document>> {
        match self {
            FindResult::Indexed(documents) => Some(documents),
            _ => None,
        }
    }
}

#[derive(Debug)]
struct RepositoryInner {
    definition: Arc<Definition>,
    container: Container,
    collection: Collection,
}

/// The storage facade of one document shape.
///
/// Cloning yields a handle onto the same repository.
#[derive(Debug, Clone)]
pub struct Repository {
    inner: Arc<RepositoryInner>,
}

impl Repository {
    pub(crate) fn new(definition: Arc<Definition>, container: Container, collection: Collection) -> Self {
        Self {
            inner: Arc::new(RepositoryInner {
                definition,
                container,
                collection,
            }),
        }
    }

    pub fn definition(&self) -> &Arc<Definition> {
        &self.inner.definition
    }

    pub fn shape(&self) -> &str {
        self.inner.definition.name()
    }

    pub fn container(&self) -> &Container {
        &self.inner.container
    }

    pub fn collection(&self) -> &Collection {
        &self.inner.collection
    }

    /// Creates a new, empty document of this repository's shape.
    pub fn create(&self) -> DocumentStoreResult<Document> {
        Document::new(self.inner.definition.clone(), self.inner.container.clone())
    }

    fn file_field(&self) -> DocumentStoreResult<Option<&str>> {
        self.inner.definition.file_field()
    }

    fn check_document(&self, document: &Document) -> DocumentStoreResult<()> {
        if document.shape() != self.shape() {
            return Err(DocumentStoreError::InvalidArgument(format!(
                "the repository of \"{}\" cannot store a \"{}\" document",
                self.shape(),
                document.shape()
            )));
        }

        Ok(())
    }

    /// Fires each event on every document in turn, one event after the other.
    fn notify(&self, events: &[Event], documents: &[Document]) -> DocumentStoreResult<()> {
        for event in events {
            for document in documents {
                self.inner.definition.notify(*event, document)?;
            }
        }

        Ok(())
    }

    fn hydrate(&self, mut record: bson::Document) -> DocumentStoreResult<Document> {
        let document = self.create()?;

        let Some(file_field) = self.file_field()? else {
            document.set_data(record)?;
            return Ok(document);
        };

        let length = match record.remove("length") {
            Some(Bson::Int64(length)) => length as u64,
            Some(Bson::Int32(length)) => length as u64,
            _ => 0,
        };
        let Some(Bson::ObjectId(id)) = record.get("_id").cloned() else {
            return Err(DocumentStoreError::InvalidDocument(format!(
                "a stored \"{}\" file has no identifier",
                self.shape()
            )));
        };

        document.set_data(record)?;
        document.load_field(
            file_field,
            Value::File(FileHandle::new(
                id,
                length,
                self.inner.collection.name(),
                self.inner.collection.backend().clone(),
            )),
        );

        Ok(document)
    }

    /// Finds documents.
    ///
    /// Returns `None` when nothing matches, never an empty result.
    ///
    /// # Errors
    ///
    /// Returns [`DocumentStoreError::InvalidArgument`] if `index_by` is neither `_id` nor a
    /// declared field, and [`DocumentStoreError::Storage`] if the backend fails.
    pub async fn find(&self, options: FindOptions) -> DocumentStoreResult<Option<FindResult>> {
        if let Some(key) = &options.index_by {
            if key != "_id" && self.inner.definition.field(key).is_none() {
                return Err(DocumentStoreError::InvalidArgument(format!(
                    "cannot index \"{}\" documents by \"{key}\"",
                    self.shape()
                )));
            }
        }

        let query = Query {
            filter: options.filter,
            fields: options.fields,
            limit: if options.one { Some(1) } else { options.limit },
            offset: options.skip,
            sort: options.sort,
        };

        let records = match self.file_field()? {
            Some(_) => self.inner.collection.find_files(&query).await,
            None => self.inner.collection.find(&query).await,
        }
        .map_err(|e| e.in_storage(self.shape(), "find"))?;

        if records.is_empty() {
            return Ok(None);
        }

        let documents = records
            .into_iter()
            .map(|record| self.hydrate(record))
            .collect::<DocumentStoreResult<Vec<_>>>()?;

        if options.one {
            return Ok(documents.into_iter().next().map(FindResult::One));
        }

        let Some(key) = options.index_by else {
            return Ok(Some(FindResult::Many(documents)));
        };

        let mut indexed = IndexMap::with_capacity(documents.len());
        for document in documents {
            let index = if key == "_id" {
                document.id().map(|id| id.to_hex()).unwrap_or_default()
            } else {
                document.raw_value(&key)?.to_key()
            };
            indexed.insert(index, document);
        }

        Ok(Some(FindResult::Indexed(indexed)))
    }

    /// Finds the first document matching `filter`.
    pub async fn find_one(&self, filter: Option<Expr>) -> DocumentStoreResult<Option<Document>> {
        let options = FindOptions {
            filter,
            one: true,
            ..FindOptions::default()
        };

        Ok(self.find(options).await?.and_then(FindResult::into_one))
    }

    /// Finds a document by identifier, given in portable string form or as an `ObjectId`.
    pub async fn get(&self, id: impl Into<Value>) -> DocumentStoreResult<Option<Document>> {
        let id = id.into().to_object_id()?;

        self.find_one(Some(Filter::eq("_id", id))).await
    }

    /// Saves documents: new ones are inserted in one batch, saved ones are updated one by one.
    ///
    /// # Errors
    ///
    /// Returns [`DocumentStoreError::InvalidOperation`] before anything is written if any
    /// document has no changes, and any error raised by a hook or the backend.
    pub async fn save<'a, I>(&self, documents: I) -> DocumentStoreResult<()>
    where
        I: IntoIterator<Item = &'a Document> + Send,
    {
        let documents = documents.into_iter().cloned().collect::<Vec<_>>();

        for document in &documents {
            self.check_document(document)?;

            if !document.is_modified() {
                return Err(DocumentStoreError::InvalidOperation(format!(
                    "cannot save an unmodified \"{}\" document",
                    self.shape()
                )));
            }
        }

        let (inserts, updates): (Vec<_>, Vec<_>) = documents
            .into_iter()
            .partition(|document| document.is_new());

        tracing::debug!(
            shape = %self.shape(),
            inserts = inserts.len(),
            updates = updates.len(),
            "saving documents"
        );

        if !inserts.is_empty() {
            self.insert(&inserts).await?;
        }

        for document in &updates {
            self.update(document).await?;
        }

        Ok(())
    }

    async fn insert(&self, documents: &[Document]) -> DocumentStoreResult<()> {
        self.notify(&[Event::PreInsert, Event::PreSave], documents)?;

        let records = documents
            .iter()
            .map(Document::query_for_save)
            .collect::<DocumentStoreResult<Vec<_>>>()?;

        let file_field = self.file_field()?;
        let (ids, lengths) = match file_field {
            Some(file_field) => {
                let files = records
                    .into_iter()
                    .map(|mut metadata| match metadata.remove(file_field) {
                        Some(Bson::Binary(binary)) => Ok(NewFile {
                            metadata,
                            bytes: binary.bytes,
                        }),
                        _ => Err(DocumentStoreError::InvalidArgument(format!(
                            "a new \"{}\" document needs its \"{file_field}\" field",
                            self.shape()
                        ))),
                    })
                    .collect::<DocumentStoreResult<Vec<_>>>()?;
                let lengths = files.iter().map(|file| file.bytes.len() as u64).collect();

                (self.inner.collection.insert_files(files).await, lengths)
            }
            None => (self.inner.collection.insert_many(records).await, Vec::new()),
        };
        let ids = ids.map_err(|e| e.in_storage(self.shape(), "insert"))?;

        if ids.len() != documents.len() {
            return Err(DocumentStoreError::Storage {
                shape: self.shape().to_string(),
                operation: "insert",
                message: format!("expected {} identifiers, got {}", documents.len(), ids.len()),
            });
        }

        for (index, (document, id)) in documents.iter().zip(ids).enumerate() {
            document.set_id(id);
            if let (Some(file_field), Some(length)) = (file_field, lengths.get(index)) {
                document.load_field(
                    file_field,
                    Value::File(FileHandle::new(
                        id,
                        *length,
                        self.inner.collection.name(),
                        self.inner.collection.backend().clone(),
                    )),
                );
            }
            document.clear_modified();
        }

        self.notify(&[Event::PostInsert, Event::PostSave], documents)?;

        Ok(())
    }

    async fn update(&self, document: &Document) -> DocumentStoreResult<()> {
        self.notify(&[Event::PreUpdate, Event::PreSave], std::slice::from_ref(document))?;

        let update = document.query_for_save()?;
        let id = document.id().ok_or_else(|| {
            DocumentStoreError::State(format!("a saved \"{}\" document lost its identifier", self.shape()))
        })?;

        if update.is_empty() {
            tracing::debug!(shape = %self.shape(), id = %id, "nothing to update");
        } else {
            match self.file_field()? {
                Some(file_field) => {
                    let rewrites_file = update
                        .get_document("$set")
                        .is_ok_and(|set| set.contains_key(file_field));
                    if rewrites_file {
                        return Err(DocumentStoreError::InvalidOperation(format!(
                            "the file of a stored \"{}\" document cannot be replaced",
                            self.shape()
                        )));
                    }

                    self.inner.collection.update_file(id, update).await
                }
                None => {
                    self.inner
                        .collection
                        .update_one(&Filter::eq("_id", id), update)
                        .await
                }
            }
            .map_err(|e| e.in_storage(self.shape(), "update"))?;
        }

        document.clear_modified();
        self.notify(&[Event::PostUpdate, Event::PostSave], std::slice::from_ref(document))
    }

    /// Deletes saved documents in one storage call.
    ///
    /// # Errors
    ///
    /// Returns [`DocumentStoreError::InvalidOperation`] before anything is removed if any
    /// document was never saved, and any error raised by a hook or the backend.
    pub async fn delete<'a, I>(&self, documents: I) -> DocumentStoreResult<()>
    where
        I: IntoIterator<Item = &'a Document> + Send,
    {
        let documents = documents.into_iter().cloned().collect::<Vec<_>>();
        if documents.is_empty() {
            return Ok(());
        }

        let mut ids = Vec::with_capacity(documents.len());
        for document in &documents {
            self.check_document(document)?;

            match document.id() {
                Some(id) => ids.push(id),
                None => {
                    return Err(DocumentStoreError::InvalidOperation(format!(
                        "cannot delete a new \"{}\" document",
                        self.shape()
                    )));
                }
            }
        }

        self.notify(&[Event::PreDelete], &documents)?;

        let filter = Filter::ids(ids);
        match self.file_field()? {
            Some(_) => self.inner.collection.remove_files(Some(&filter)).await,
            None => self.inner.collection.remove_many(Some(&filter)).await,
        }
        .map_err(|e| e.in_storage(self.shape(), "delete"))?;

        self.notify(&[Event::PostDelete], &documents)?;

        Ok(())
    }

    /// Removes every record matching `filter` (all records when `None`), without loading
    /// documents or firing events. Returns the number of records removed.
    pub async fn remove(&self, filter: Option<Expr>) -> DocumentStoreResult<u64> {
        match self.file_field()? {
            Some(_) => self.inner.collection.remove_files(filter.as_ref()).await,
            None => self.inner.collection.remove_many(filter.as_ref()).await,
        }
        .map_err(|e| e.in_storage(self.shape(), "remove"))
    }

    /// Creates every index declared by the shape. Existing indexes are left alone.
    pub async fn ensure_indexes(&self) -> DocumentStoreResult<()> {
        for index in self.inner.definition.indexes() {
            self.inner
                .collection
                .ensure_index(index)
                .await
                .map_err(|e| e.in_storage(self.shape(), "ensure_indexes"))?;
        }

        Ok(())
    }

    /// Calls a method contributed by one of the shape's extensions, with this repository as
    /// its context.
    ///
    /// # Errors
    ///
    /// Returns [`DocumentStoreError::NotFound`] if no extension provides `method`.
    pub async fn call(&self, method: &str, args: Vec<Value>) -> DocumentStoreResult<Value> {
        let extension = self.inner.definition.repository_method(method)?.clone();

        extension.call_repository_method(method, self, args).await
    }
}

use async_trait::async_trait;
use bson::{Bson, Document, doc, oid::ObjectId};
use futures::{AsyncReadExt, AsyncWriteExt, TryStreamExt};
use mongodb::{
    Client, Collection as MongoCollection, Database, IndexModel,
    gridfs::GridFsBucket,
    options::{ClientOptions, FindOptions, GridFsBucketOptions, IndexOptions},
};

use docmapper_core::{
    backend::{NewFile, StoreBackend, StoreBackendBuilder},
    definition::IndexDef,
    error::{DocumentStoreError, DocumentStoreResult},
    query::{Expr, Query},
};

use crate::query::MongoQueryTranslator;

fn backend_error(e: impl std::fmt::Display) -> DocumentStoreError {
    DocumentStoreError::Backend(e.to_string())
}

/// MongoDB storage backend.
///
/// Each collection of the mapper is a MongoDB collection of the configured database. The file
/// store of a collection is the GridFS bucket of the same name: declared fields are kept in
/// the `metadata` of the files record, the bytes in its chunks.
#[derive(Debug)]
pub struct MongoDbStore {
    client: Client,
    database: String,
}

impl MongoDbStore {
    pub fn new(client: Client, database: String) -> Self {
        Self { client, database }
    }

    pub fn builder(dsn: &str, database: &str) -> MongoDbStoreBuilder {
        MongoDbStoreBuilder::new(dsn, database)
    }

    fn database(&self) -> Database {
        self.client.database(&self.database)
    }

    fn get_collection(&self, collection_name: &str) -> MongoCollection<Document> {
        self.database().collection(collection_name)
    }

    fn bucket(&self, collection_name: &str) -> GridFsBucket {
        self.database().gridfs_bucket(
            GridFsBucketOptions::builder()
                .bucket_name(collection_name.to_string())
                .build(),
        )
    }

    fn files_collection(&self, collection_name: &str) -> MongoCollection<Document> {
        self.get_collection(&format!("{collection_name}.files"))
    }

    /// Flattens a GridFS files record into metadata plus `_id` and `length`.
    fn file_record(mut stored: Document) -> Document {
        let mut record = Document::new();
        if let Some(id) = stored.remove("_id") {
            record.insert("_id", id);
        }
        if let Ok(metadata) = stored.get_document_mut("metadata") {
            for (key, value) in std::mem::take(metadata) {
                record.insert(key, value);
            }
        }
        let length = match stored.get("length") {
            Some(Bson::Int64(length)) => *length,
            Some(Bson::Int32(length)) => i64::from(*length),
            _ => 0,
        };
        record.insert("length", length);
        record
    }

    async fn run_find(
        &self,
        collection: MongoCollection<Document>,
        mut translator: MongoQueryTranslator,
        query: &Query,
    ) -> DocumentStoreResult<Vec<Document>> {
        let mut options = FindOptions::default();
        options.limit = query.limit.map(|limit| limit as i64);
        options.skip = query.offset.map(|skip| skip as u64);
        options.sort = translator.sort(&query.sort);
        options.projection = translator.projection(query.fields.as_deref());

        collection
            .find(translator.filter(query.filter.as_ref())?)
            .with_options(options)
            .await
            .map_err(backend_error)?
            .try_collect::<Vec<Document>>()
            .await
            .map_err(backend_error)
    }

    async fn shutdown(self) -> DocumentStoreResult<()> {
        self.client.shutdown().await;

        Ok(())
    }
}

#[async_trait]
impl StoreBackend for MongoDbStore {
    async fn find(&self, collection: &str, query: &Query) -> DocumentStoreResult<Vec<Document>> {
        self.run_find(self.get_collection(collection), MongoQueryTranslator::new(), query)
            .await
    }

    async fn insert_many(
        &self,
        collection: &str,
        documents: Vec<Document>,
    ) -> DocumentStoreResult<Vec<ObjectId>> {
        if documents.is_empty() {
            return Ok(vec![]);
        }

        let mut ids = Vec::with_capacity(documents.len());
        let documents = documents
            .into_iter()
            .map(|document| {
                let id = match document.get("_id") {
                    Some(Bson::ObjectId(id)) => *id,
                    Some(other) => {
                        return Err(DocumentStoreError::Backend(format!(
                            "unsupported identifier {other}"
                        )));
                    }
                    None => ObjectId::new(),
                };
                ids.push(id);

                let mut record = doc! { "_id": id };
                for (key, value) in document {
                    if key != "_id" {
                        record.insert(key, value);
                    }
                }
                Ok(record)
            })
            .collect::<DocumentStoreResult<Vec<_>>>()?;

        self.get_collection(collection)
            .insert_many(documents)
            .await
            .map_err(backend_error)?;

        Ok(ids)
    }

    async fn update_one(
        &self,
        collection: &str,
        filter: &Expr,
        update: Document,
    ) -> DocumentStoreResult<bool> {
        let filter = MongoQueryTranslator::new().filter(Some(filter))?;
        let collection = self.get_collection(collection);

        let matched = if update.keys().any(|key| key.starts_with('$')) {
            collection
                .update_one(filter, update)
                .await
                .map_err(backend_error)?
                .matched_count
        } else {
            collection
                .replace_one(filter, update)
                .await
                .map_err(backend_error)?
                .matched_count
        };

        Ok(matched > 0)
    }

    async fn remove_many(&self, collection: &str, filter: Option<&Expr>) -> DocumentStoreResult<u64> {
        Ok(self
            .get_collection(collection)
            .delete_many(MongoQueryTranslator::new().filter(filter)?)
            .await
            .map_err(backend_error)?
            .deleted_count)
    }

    async fn ensure_index(&self, collection: &str, index: &IndexDef) -> DocumentStoreResult<()> {
        let mut options = IndexOptions::default();
        options.unique = index.options.unique.then_some(true);
        options.sparse = index.options.sparse.then_some(true);
        options.name = index.options.name.clone();

        self.get_collection(collection)
            .create_index(
                IndexModel::builder()
                    .keys(index.key_document())
                    .options(options)
                    .build(),
            )
            .await
            .map_err(backend_error)?;

        Ok(())
    }

    async fn insert_files(
        &self,
        collection: &str,
        files: Vec<NewFile>,
    ) -> DocumentStoreResult<Vec<ObjectId>> {
        let bucket = self.bucket(collection);
        let mut ids = Vec::with_capacity(files.len());

        for file in files {
            let id = ObjectId::new();
            let mut metadata = file.metadata;
            metadata.remove("_id");

            let mut upload = bucket
                .open_upload_stream(id.to_hex())
                .id(Bson::ObjectId(id))
                .metadata(metadata)
                .await
                .map_err(backend_error)?;
            upload.write_all(&file.bytes).await.map_err(backend_error)?;
            upload.close().await.map_err(backend_error)?;

            ids.push(id);
        }

        Ok(ids)
    }

    async fn find_files(&self, collection: &str, query: &Query) -> DocumentStoreResult<Vec<Document>> {
        Ok(self
            .run_find(
                self.files_collection(collection),
                MongoQueryTranslator::for_files(),
                query,
            )
            .await?
            .into_iter()
            .map(Self::file_record)
            .collect())
    }

    async fn update_file(
        &self,
        collection: &str,
        id: ObjectId,
        update: Document,
    ) -> DocumentStoreResult<bool> {
        let update = MongoQueryTranslator::for_files().update(update);

        Ok(self
            .files_collection(collection)
            .update_one(doc! { "_id": id }, update)
            .await
            .map_err(backend_error)?
            .matched_count
            > 0)
    }

    async fn read_file(&self, collection: &str, id: ObjectId) -> DocumentStoreResult<Vec<u8>> {
        let mut download = self
            .bucket(collection)
            .open_download_stream(Bson::ObjectId(id))
            .await
            .map_err(backend_error)?;

        let mut bytes = Vec::new();
        download.read_to_end(&mut bytes).await.map_err(backend_error)?;

        Ok(bytes)
    }

    async fn remove_files(&self, collection: &str, filter: Option<&Expr>) -> DocumentStoreResult<u64> {
        let filter = MongoQueryTranslator::for_files().filter(filter)?;
        let ids = self
            .files_collection(collection)
            .find(filter)
            .projection(doc! { "_id": 1 })
            .await
            .map_err(backend_error)?
            .try_collect::<Vec<Document>>()
            .await
            .map_err(backend_error)?;

        let bucket = self.bucket(collection);
        let mut removed = 0;
        for stored in ids {
            if let Some(id) = stored.get("_id") {
                bucket.delete(id.clone()).await.map_err(backend_error)?;
                removed += 1;
            }
        }

        Ok(removed)
    }

    async fn shutdown(self) -> DocumentStoreResult<()> {
        self.shutdown().await
    }
}

pub struct MongoDbStoreBuilder {
    dsn: String,
    database: String,
}

impl MongoDbStoreBuilder {
    pub fn new(dsn: &str, database: &str) -> Self {
        Self {
            dsn: dsn.to_string(),
            database: database.to_string(),
        }
    }
}

#[async_trait]
impl StoreBackendBuilder for MongoDbStoreBuilder {
    type Backend = MongoDbStore;

    async fn build(self) -> DocumentStoreResult<Self::Backend> {
        Ok(MongoDbStore::new(
            Client::with_options(
                ClientOptions::parse(&self.dsn)
                    .await
                    .map_err(|e| DocumentStoreError::Initialization(e.to_string()))?,
            )
            .map_err(|e| DocumentStoreError::Initialization(e.to_string()))?,
            self.database,
        ))
    }
}

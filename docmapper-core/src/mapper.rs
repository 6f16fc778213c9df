//! Connections and repositories of an application.
//!
//! A [`Mapper`] owns a set of named storage connections and hands out one cached
//! [`Repository`] per shape. Which connection and collection a shape uses comes from its
//! [`Definition`](crate::definition::Definition), overridden by the [`MapperConfig`].
//!
//! # Example
//!
//! ```ignore
//! use docmapper::prelude::*;
//!
//! let mapper = Mapper::builder(container.clone())
//!     .connection("main", InMemoryStore::new())
//!     .connection("archive", InMemoryStore::new())
//!     .default_connection("main")
//!     .build()?;
//! container.set_default(&mapper);
//!
//! let articles = mapper.find("Article", FindOptions::new().limit(10)).await?;
//! ```

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Weak},
};

use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::{
    backend::StoreBackend,
    collection::{Collection, QueryLog, QueryLogger},
    container::Container,
    document::Document,
    error::{DocumentStoreError, DocumentStoreResult},
    query::Expr,
    repository::{FindOptions, FindResult, Repository},
    value::Value,
};

/// The plain, loadable part of a mapper's configuration.
///
/// # Example
///
/// ```ignore
/// let config: MapperConfig = serde_json::from_str(r#"{
///     "default_connection": "main",
///     "collections": { "Article": "blog_articles" }
/// }"#)?;
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MapperConfig {
    /// The connection of shapes that do not name one. Defaults to the first connection.
    #[serde(default)]
    pub default_connection: Option<String>,
    /// Collection names by shape, taking precedence over the definitions.
    #[serde(default)]
    pub collections: HashMap<String, String>,
}

struct MapperInner {
    container: Container,
    connections: IndexMap<String, Arc<dyn StoreBackend>>,
    config: MapperConfig,
    logger: Option<QueryLogger>,
    repositories: RwLock<HashMap<String, Repository>>,
}

/// Named connections plus a cache of repositories.
///
/// Cloning yields a handle onto the same mapper.
#[derive(Clone)]
pub struct Mapper {
    inner: Arc<MapperInner>,
}

/// A non-owning handle to a [`Mapper`], as kept by a [`Container`].
#[derive(Clone)]
pub struct WeakMapper(Weak<MapperInner>);

impl WeakMapper {
    pub fn upgrade(&self) -> Option<Mapper> {
        self.0.upgrade().map(|inner| Mapper { inner })
    }
}

impl fmt::Debug for Mapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mapper")
            .field("connections", &self.inner.connections.keys().collect::<Vec<_>>())
            .field("config", &self.inner.config)
            .field("logger", &self.inner.logger.is_some())
            .finish_non_exhaustive()
    }
}

impl Mapper {
    pub fn builder(container: Container) -> MapperBuilder {
        MapperBuilder::new(container)
    }

    pub fn container(&self) -> &Container {
        &self.inner.container
    }

    pub fn downgrade(&self) -> WeakMapper {
        WeakMapper(Arc::downgrade(&self.inner))
    }

    pub fn has_connection(&self, name: &str) -> bool {
        self.inner.connections.contains_key(name)
    }

    /// # Errors
    ///
    /// Returns [`DocumentStoreError::NotFound`] if no connection has this name.
    pub fn connection(&self, name: &str) -> DocumentStoreResult<&Arc<dyn StoreBackend>> {
        self.inner
            .connections
            .get(name)
            .ok_or_else(|| DocumentStoreError::not_found("connection", name))
    }

    pub fn connection_names(&self) -> Vec<&str> {
        self.inner.connections.keys().map(String::as_str).collect()
    }

    /// The name of the connection used by shapes that do not name one.
    pub fn default_connection_name(&self) -> DocumentStoreResult<&str> {
        match &self.inner.config.default_connection {
            Some(name) => Ok(name),
            None => self
                .inner
                .connections
                .keys()
                .next()
                .map(String::as_str)
                .ok_or_else(|| DocumentStoreError::State("the mapper has no connections".into())),
        }
    }

    /// The repository of a document shape, created on first use.
    pub fn repository(&self, shape: &str) -> DocumentStoreResult<Repository> {
        if let Some(repository) = self.inner.repositories.read().get(shape) {
            return Ok(repository.clone());
        }

        let definition = self.inner.container.definition(shape)?;
        let connection = match definition.connection() {
            Some(name) => name.to_string(),
            None => self.default_connection_name()?.to_string(),
        };
        let backend = self.connection(&connection)?.clone();
        let collection = self
            .inner
            .config
            .collections
            .get(shape)
            .cloned()
            .unwrap_or_else(|| definition.collection());

        let repository = Repository::new(
            definition,
            self.inner.container.clone(),
            Collection::new(connection, collection, backend, self.inner.logger.clone()),
        );

        Ok(self
            .inner
            .repositories
            .write()
            .entry(shape.to_string())
            .or_insert(repository)
            .clone())
    }

    pub async fn find(&self, shape: &str, options: FindOptions) -> DocumentStoreResult<Option<FindResult>> {
        self.repository(shape)?.find(options).await
    }

    pub async fn find_one(&self, shape: &str, filter: Option<Expr>) -> DocumentStoreResult<Option<Document>> {
        self.repository(shape)?.find_one(filter).await
    }

    pub async fn get(&self, shape: &str, id: impl Into<Value>) -> DocumentStoreResult<Option<Document>> {
        self.repository(shape)?.get(id).await
    }

    pub async fn remove(&self, shape: &str, filter: Option<Expr>) -> DocumentStoreResult<u64> {
        self.repository(shape)?.remove(filter).await
    }

    pub async fn save<'a, I>(&self, shape: &str, documents: I) -> DocumentStoreResult<()>
    where
        I: IntoIterator<Item = &'a Document> + Send,
    {
        self.repository(shape)?.save(documents).await
    }

    pub async fn delete<'a, I>(&self, shape: &str, documents: I) -> DocumentStoreResult<()>
    where
        I: IntoIterator<Item = &'a Document> + Send,
    {
        self.repository(shape)?.delete(documents).await
    }
}

/// Builds a [`Mapper`].
pub struct MapperBuilder {
    container: Container,
    connections: IndexMap<String, Arc<dyn StoreBackend>>,
    config: MapperConfig,
    logger: Option<QueryLogger>,
}

impl MapperBuilder {
    pub fn new(container: Container) -> Self {
        Self {
            container,
            connections: IndexMap::new(),
            config: MapperConfig::default(),
            logger: None,
        }
    }

    /// Adds a named connection, replacing any connection with the same name.
    pub fn connection(mut self, name: impl Into<String>, backend: impl StoreBackend + 'static) -> Self {
        self.connections.insert(name.into(), Arc::new(backend));
        self
    }

    /// Adds a named connection that is shared with other mappers.
    pub fn shared_connection(mut self, name: impl Into<String>, backend: Arc<dyn StoreBackend>) -> Self {
        self.connections.insert(name.into(), backend);
        self
    }

    pub fn default_connection(mut self, name: impl Into<String>) -> Self {
        self.config.default_connection = Some(name.into());
        self
    }

    /// Overrides the collection of one shape.
    pub fn collection(mut self, shape: impl Into<String>, collection: impl Into<String>) -> Self {
        self.config.collections.insert(shape.into(), collection.into());
        self
    }

    /// Applies a loaded configuration on top of the builder's settings.
    pub fn config(mut self, config: MapperConfig) -> Self {
        if config.default_connection.is_some() {
            self.config.default_connection = config.default_connection;
        }
        self.config.collections.extend(config.collections);
        self
    }

    /// Receives a [`QueryLog`] for every storage operation of every repository.
    pub fn logger<F>(mut self, logger: F) -> Self
    where
        F: Fn(&QueryLog) + Send + Sync + 'static,
    {
        self.logger = Some(Arc::new(logger));
        self
    }

    /// # Errors
    ///
    /// Returns [`DocumentStoreError::NotFound`] if the default connection was not added.
    pub fn build(self) -> DocumentStoreResult<Mapper> {
        if let Some(name) = &self.config.default_connection {
            if !self.connections.contains_key(name) {
                return Err(DocumentStoreError::not_found("connection", name.clone()));
            }
        }

        Ok(Mapper {
            inner: Arc::new(MapperInner {
                container: self.container,
                connections: self.connections,
                config: self.config,
                logger: self.logger,
                repositories: RwLock::new(HashMap::new()),
            }),
        })
    }
}

//! Shape registration and the compile-once definition cache.
//!
//! A [`Container`] knows every shape of an application: how to define it, its compiled
//! [`Definition`] once first requested, and which [`Mapper`] serves it. There is no ambient
//! global container; the application creates one and hands clones to whatever needs it.
//!
//! # Example
//!
//! ```ignore
//! struct Article;
//!
//! impl Shape for Article {
//!     const NAME: &'static str = "Article";
//!
//!     fn define(definition: &mut Definition) -> DocumentStoreResult<()> {
//!         definition.add_field("title", "string")?;
//!         Ok(())
//!     }
//! }
//!
//! let container = Container::default();
//! container.register::<Article>()?;
//!
//! let mapper = Mapper::builder(container.clone())
//!     .connection("main", InMemoryStore::new())
//!     .build()?;
//! container.set_default(&mapper);
//!
//! let article = container.create("Article")?;
//! ```

use std::{collections::HashMap, fmt, sync::Arc};

use parking_lot::{ReentrantMutex, RwLock};

use crate::{
    definition::{Definition, ShapeKind},
    document::Document,
    error::{DocumentStoreError, DocumentStoreResult},
    mapper::{Mapper, WeakMapper},
    repository::Repository,
    types::TypeRegistry,
};

/// A document shape known at compile time.
pub trait Shape {
    const NAME: &'static str;
    const KIND: ShapeKind = ShapeKind::Document;

    /// Declares the fields, references, embeds and everything else of the shape.
    fn define(definition: &mut Definition) -> DocumentStoreResult<()>;
}

type DefineFn = Arc<dyn Fn(&mut Definition) -> DocumentStoreResult<()> + Send + Sync>;

#[derive(Clone)]
struct Registration {
    kind: ShapeKind,
    define: DefineFn,
}

struct ContainerInner {
    types: TypeRegistry,
    shapes: RwLock<HashMap<String, Registration>>,
    definitions: RwLock<HashMap<String, Arc<Definition>>>,
    /// Held while a definition compiles, so each define function runs once per shape.
    compiling: ReentrantMutex<()>,
    mappers: RwLock<HashMap<String, WeakMapper>>,
    default_mapper: RwLock<Option<WeakMapper>>,
}

/// Registered shapes, their compiled definitions and their mapper bindings.
///
/// Cloning yields a handle onto the same container.
#[derive(Clone)]
pub struct Container {
    inner: Arc<ContainerInner>,
}

impl fmt::Debug for Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Container")
            .field("shapes", &self.shapes())
            .field("compiled", &self.inner.definitions.read().len())
            .finish_non_exhaustive()
    }
}

/// A container over the process-wide [`TypeRegistry`].
impl Default for Container {
    fn default() -> Self {
        Self::new(TypeRegistry::global())
    }
}

impl Container {
    pub fn new(types: TypeRegistry) -> Self {
        Self {
            inner: Arc::new(ContainerInner {
                types,
                shapes: RwLock::new(HashMap::new()),
                definitions: RwLock::new(HashMap::new()),
                compiling: ReentrantMutex::new(()),
                mappers: RwLock::new(HashMap::new()),
                default_mapper: RwLock::new(None),
            }),
        }
    }

    pub fn types(&self) -> &TypeRegistry {
        &self.inner.types
    }

    /// Registers a shape implemented as a type.
    pub fn register<S: Shape + 'static>(&self) -> DocumentStoreResult<()> {
        self.register_with(S::NAME, S::KIND, S::define)
    }

    /// Registers a shape from a define function.
    ///
    /// # Errors
    ///
    /// Returns [`DocumentStoreError::InvalidArgument`] if a shape with this name is registered.
    pub fn register_with<F>(&self, name: impl Into<String>, kind: ShapeKind, define: F) -> DocumentStoreResult<()>
    where
        F: Fn(&mut Definition) -> DocumentStoreResult<()> + Send + Sync + 'static,
    {
        let name = name.into();
        let mut shapes = self.inner.shapes.write();

        if shapes.contains_key(&name) {
            return Err(DocumentStoreError::InvalidArgument(format!(
                "the shape \"{name}\" is already registered"
            )));
        }

        shapes.insert(
            name,
            Registration {
                kind,
                define: Arc::new(define),
            },
        );

        Ok(())
    }

    pub fn has_shape(&self, name: &str) -> bool {
        self.inner.shapes.read().contains_key(name)
    }

    /// Registered shape names, sorted.
    pub fn shapes(&self) -> Vec<String> {
        let mut names = self.inner.shapes.read().keys().cloned().collect::<Vec<_>>();
        names.sort();
        names
    }

    /// The compiled definition of a shape, compiling it on first use.
    ///
    /// # Errors
    ///
    /// Returns [`DocumentStoreError::NotFound`] for an unregistered shape, and any error raised
    /// by the define function or by [`Definition::close`].
    pub fn definition(&self, name: &str) -> DocumentStoreResult<Arc<Definition>> {
        if let Some(definition) = self.inner.definitions.read().get(name) {
            return Ok(definition.clone());
        }

        let _compiling = self.inner.compiling.lock();
        if let Some(definition) = self.inner.definitions.read().get(name) {
            return Ok(definition.clone());
        }

        let registration = self
            .inner
            .shapes
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| DocumentStoreError::not_found("shape", name))?;

        let mut definition = Definition::new(name, registration.kind);
        (registration.define)(&mut definition)?;
        definition.close(&self.inner.types)?;

        tracing::debug!(shape = %name, "compiled definition");

        let definition = Arc::new(definition);
        self.inner
            .definitions
            .write()
            .insert(name.to_string(), definition.clone());

        Ok(definition)
    }

    /// Drops every compiled definition; they are compiled again on next use.
    pub fn clear_definitions(&self) {
        self.inner.definitions.write().clear();
    }

    /// Creates a new, empty document of a shape.
    pub fn create(&self, shape: &str) -> DocumentStoreResult<Document> {
        Document::new(self.definition(shape)?, self.clone())
    }

    /// Serves `shape` with `mapper`.
    pub fn bind(&self, shape: impl Into<String>, mapper: &Mapper) {
        self.inner.mappers.write().insert(shape.into(), mapper.downgrade());
    }

    pub fn unbind(&self, shape: &str) -> bool {
        self.inner.mappers.write().remove(shape).is_some()
    }

    /// Serves every shape without an explicit binding with `mapper`.
    pub fn set_default(&self, mapper: &Mapper) {
        *self.inner.default_mapper.write() = Some(mapper.downgrade());
    }

    pub fn has_default(&self) -> bool {
        self.inner.default_mapper.read().is_some()
    }

    pub fn clear_default(&self) {
        *self.inner.default_mapper.write() = None;
    }

    /// The mapper serving `shape`: its binding, or else the default mapper.
    ///
    /// # Errors
    ///
    /// Returns [`DocumentStoreError::NotFound`] if neither exists and
    /// [`DocumentStoreError::State`] if the mapper has been dropped.
    pub fn mapper_for(&self, shape: &str) -> DocumentStoreResult<Mapper> {
        let bound = self.inner.mappers.read().get(shape).cloned();
        let mapper = match bound {
            Some(mapper) => mapper,
            None => self
                .inner
                .default_mapper
                .read()
                .clone()
                .ok_or_else(|| DocumentStoreError::not_found("mapper", shape))?,
        };

        mapper.upgrade().ok_or_else(|| {
            DocumentStoreError::State(format!("the mapper serving \"{shape}\" has been dropped"))
        })
    }

    /// The repository of a document shape.
    ///
    /// # Errors
    ///
    /// Returns [`DocumentStoreError::InvalidOperation`] for embedded shapes, which are only
    /// stored inside their parents.
    pub fn repository(&self, shape: &str) -> DocumentStoreResult<Repository> {
        let definition = self.definition(shape)?;

        if definition.kind() != ShapeKind::Document {
            return Err(DocumentStoreError::InvalidOperation(format!(
                "the embedded shape \"{shape}\" has no repository"
            )));
        }

        self.mapper_for(shape)?.repository(shape)
    }
}

//! Main docmapper crate: an object-document mapper for schemaless document stores.
//!
//! This crate is the primary entry point for users of the docmapper framework. It re-exports
//! the core types and provides access to the storage backends.
//!
//! # Features
//!
//! - **Declared shapes** - Fields, references, embeds, relations and indexes declared once per shape
//! - **Precise change tracking** - Saves write only the fields that changed, as `$set`/`$unset`
//! - **Lazy loading** - References and relations are queried on first access and cached
//! - **Lifecycle events** - Hooks and extensions around insert, update, save and delete
//! - **Multiple backends** - In-memory and MongoDB storage behind one backend trait
//!
//! # Quick Start
//!
//! ```ignore
//! use docmapper::{prelude::*, memory::InMemoryStore};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), DocumentStoreError> {
//!     let container = Container::default();
//!     container.register_with("Article", ShapeKind::Document, |definition| {
//!         definition.add_field("title", "string")?;
//!         definition.add_field("content", "string")?;
//!         definition.add_reference("author", "Author", "author_id", Cardinality::One)?;
//!         Ok(())
//!     })?;
//!     container.register_with("Author", ShapeKind::Document, |definition| {
//!         definition.add_field("name", "string")?;
//!         Ok(())
//!     })?;
//!
//!     let mapper = Mapper::builder(container.clone())
//!         .connection("main", InMemoryStore::new())
//!         .build()?;
//!     container.set_default(&mapper);
//!
//!     let author = container.create("Author")?;
//!     author.set("name", "Ada")?;
//!     author.save().await?;
//!
//!     let article = container.create("Article")?;
//!     article.set("title", "Hello")?;
//!     article.set("author", &author)?;
//!     article.save().await?;
//!
//!     // Writes `{ "$set": { "content": "..." } }` and nothing else.
//!     article.set("content", "...")?;
//!     article.save().await?;
//!
//!     let found = mapper
//!         .find("Article", FindOptions::new().filter(Filter::eq("title", "Hello")))
//!         .await?;
//!
//!     Ok(())
//! }
//! ```
//!
//! # Backends
//!
//! - [`memory`] - Fast in-memory storage for development and testing
//! - [`mongodb`] - Persistent MongoDB backend (requires `mongodb` feature)

pub mod prelude;

pub use docmapper_core::{
    backend, collection, container, definition, document, error, extension, group, mapper, query,
    repository, types, value,
};

// Re-export BSON types for convenience
pub use bson;

/// Extensions with repository methods implement [`extension::Extension`] with this attribute.
pub use async_trait::async_trait;

/// In-memory storage backend implementations.
pub mod memory {
    pub use docmapper_memory::{InMemoryStore, InMemoryStoreBuilder};
}

/// MongoDB storage backend implementations.
///
/// This module is only available when the `mongodb` feature is enabled.
#[cfg(feature = "mongodb")]
pub mod mongodb {
    pub use docmapper_mongodb::{MongoDbStore, MongoDbStoreBuilder};
}

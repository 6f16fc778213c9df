//! In-memory storage backend for docmapper.
//!
//! This crate provides a thread-safe, in-memory implementation of the `StoreBackend` trait.
//! It uses async-aware read-write locks for concurrent access and is meant for development
//! and testing.
//!
//! # Features
//!
//! - **Thread-safe access** - Concurrent reads and writes using async-aware RwLock
//! - **Full query support** - Filtering on dotted paths, multi-key sorting, paging and projection
//! - **Write operators** - `$set` and `$unset`, or whole-record replacement
//! - **File store** - Files kept next to their metadata, sharing the record identifier space
//!
//! # Quick Start
//!
//! ```ignore
//! use docmapper::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let container = Container::default();
//!     container.register_with("User", ShapeKind::Document, |definition| {
//!         definition.add_field("name", "string")?;
//!         Ok(())
//!     })?;
//!
//!     let mapper = Mapper::builder(container.clone())
//!         .connection("main", InMemoryStore::builder().build().await?)
//!         .build()?;
//!     container.set_default(&mapper);
//!
//!     let user = container.create("User")?;
//!     user.set("name", "Alice")?;
//!     user.save().await?;
//!
//!     Ok(())
//! }
//! ```

#[allow(unused_extern_crates)]
extern crate self as docmapper_memory;

pub mod evaluator;
pub mod store;

pub use store::{InMemoryStore, InMemoryStoreBuilder};

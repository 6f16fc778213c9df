//! MongoDB backend implementation for docmapper.
//!
//! This crate provides a MongoDB-based implementation of the `StoreBackend` trait, enabling
//! persistent storage with MongoDB's query engine. Files are stored in GridFS.
//!
//! To use this backend, include the `mongodb` feature in your `Cargo.toml`:
//!
//! ```toml
//! [dependencies]
//! docmapper = { version = "x.y.z", features = ["mongodb"] }
//! ```
//!
//! # Features
//!
//! - **Persistent storage** - Data is persisted to MongoDB Atlas or self-hosted MongoDB
//! - **Full query support** - Filters are translated into MongoDB query documents
//! - **Indexing** - Declared indexes are created with `createIndexes`
//! - **File store** - One GridFS bucket per file shape, declared fields kept as file metadata
//!
//! # Example
//!
//! ```ignore
//! use docmapper::{backend::StoreBackendBuilder, mongodb::MongoDbStore, prelude::*};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = MongoDbStore::builder("mongodb://localhost:27017", "my_database")
//!         .build()
//!         .await?;
//!
//!     let mapper = Mapper::builder(Container::default())
//!         .connection("main", store)
//!         .build()?;
//!
//!     Ok(())
//! }
//! ```

#[allow(unused_extern_crates)]
extern crate self as docmapper_mongodb;

pub mod query;
pub mod store;

pub use store::{MongoDbStore, MongoDbStoreBuilder};

//! The core of docmapper: an object-document mapper for schemaless document stores.
//!
//! Shapes are declared once and compiled into immutable [`Definition`](definition::Definition)s.
//! Every [`Document`](document::Document) records which fields changed since it was loaded, so
//! a save writes exactly those fields and nothing else.
//!
//! - **Types** ([`types`]) - Converters between native values and storage values
//! - **Definitions** ([`definition`]) - Declaring and compiling document shapes
//! - **Extensions** ([`extension`]) - Reusable bundles of fields, hooks and methods
//! - **Documents** ([`document`]) - Field values with change tracking, references and embeds
//! - **Groups** ([`group`]) - Observable ordered collections of documents
//! - **Repositories** ([`repository`]) - Finding, saving and deleting documents of one shape
//! - **Containers and mappers** ([`container`], [`mapper`]) - Wiring shapes to connections
//! - **Store backend abstraction** ([`backend`]) - Traits for implementing storage backends
//! - **Query and filtering API** ([`query`]) - Backend-neutral filter construction
//! - **Error handling** ([`error`]) - Error and result types
//!
//! # Example
//!
//! ```ignore
//! use docmapper_core::{container::Container, definition::ShapeKind};
//!
//! let container = Container::default();
//! container.register_with("Article", ShapeKind::Document, |definition| {
//!     definition.add_field("title", "string")?;
//!     definition.add_field("content", "string")?;
//!     Ok(())
//! })?;
//!
//! let article = container.create("Article")?;
//! article.set("title", "Hello")?;
//! assert!(article.is_field_modified("title"));
//! ```

#[allow(unused_extern_crates)]
extern crate self as docmapper_core;

pub mod backend;
pub mod collection;
pub mod container;
pub mod definition;
pub mod document;
pub mod error;
pub mod extension;
pub mod group;
pub mod mapper;
pub mod query;
pub mod repository;
pub mod types;
pub mod value;

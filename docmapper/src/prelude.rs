//! Convenient re-exports of commonly used types from docmapper.
//!
//! ```ignore
//! use docmapper::prelude::*;
//! ```

pub use docmapper_core::{
    backend::{StoreBackend, StoreBackendBuilder},
    collection::QueryLog,
    container::{Container, Shape},
    definition::{Cardinality, Definition, Event, IndexDef, ShapeKind},
    document::{Data, Document},
    error::{DocumentStoreError, DocumentStoreResult},
    extension::{Extension, ExtensionOptions},
    group::Group,
    mapper::{Mapper, MapperConfig},
    query::{Expr, Filter, Query, Sort, SortDirection},
    repository::{FindOptions, FindResult, Repository},
    types::{Type, TypeRegistry},
    value::{FileHandle, Value},
};

//! Filters, sort keys and the query passed to storage backends.
//!
//! The mapper treats a filter as an opaque [`Expr`] tree. Repositories build a handful of them
//! themselves (identifier lookups for references, foreign-key matches for relations) and hand
//! the caller's filters through untouched. Each backend evaluates or translates the tree with
//! a [`QueryVisitor`].
//!
//! ```ignore
//! use docmapper::query::{Filter, Query, SortDirection};
//!
//! let query = Query::builder()
//!     .filter(Filter::eq("is_active", true).and(Filter::starts_with("title", "Rust")))
//!     .sort("title", SortDirection::Asc)
//!     .limit(10)
//!     .build();
//! ```
//!
//! Field names may be dotted paths into embedded documents, such as `source.name`.

use bson::{Bson, oid::ObjectId};
use serde::{Deserialize, Serialize};

use crate::error::DocumentStoreError;

/// Direction of a sort key or index key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    Asc,
    Desc,
}

impl SortDirection {
    /// `1` or `-1`, as written in storage sort and index documents.
    pub fn as_i32(&self) -> i32 {
        match self {
            SortDirection::Asc => 1,
            SortDirection::Desc => -1,
        }
    }
}

/// One sort key. Keys of a query apply in order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sort {
    pub field: String,
    pub direction: SortDirection,
}

impl Sort {
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: SortDirection::Asc,
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: SortDirection::Desc,
        }
    }
}

/// Comparison applied by an [`Expr::Field`] node.
///
/// `Contains` and `NotContains` test substrings of string fields and elements of array
/// fields. `AnyOf` and `NoneOf` test a field against a list of candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    Contains,
    NotContains,
    StartsWith,
    EndsWith,
    AnyOf,
    NoneOf,
}

/// A filter over raw storage records.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Expr {
    And(Vec<Expr>),
    Or(Vec<Expr>),
    Not(Box<Expr>),
    /// Whether the key is present in the record at all.
    Exists(String, bool),
    Field {
        field: String,
        op: FieldOp,
        value: Bson,
    },
}

impl Expr {
    pub fn field(field: String, op: FieldOp, value: Bson) -> Self {
        Expr::Field { field, op, value }
    }

    /// Requires both filters. Chained calls build one flat conjunction.
    pub fn and(self, other: Expr) -> Self {
        match self {
            Expr::And(mut all) => {
                all.push(other);
                Expr::And(all)
            }
            first => Expr::And(vec![first, other]),
        }
    }

    /// Requires either filter. Chained calls build one flat disjunction.
    pub fn or(self, other: Expr) -> Self {
        match self {
            Expr::Or(mut any) => {
                any.push(other);
                Expr::Or(any)
            }
            first => Expr::Or(vec![first, other]),
        }
    }

    pub fn not(self) -> Self {
        Expr::Not(Box::new(self))
    }
}

/// What a backend needs to run a find.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Query {
    pub filter: Option<Expr>,
    /// Keys to return; `_id` is always returned. `None` returns whole records.
    pub fields: Option<Vec<String>>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    pub sort: Vec<Sort>,
}

impl Query {
    pub fn new() -> Self {
        Query::default()
    }

    pub fn builder() -> QueryBuilder {
        QueryBuilder::default()
    }
}

/// Constructors for [`Expr`] nodes.
pub struct Filter;

macro_rules! field_filters {
    ($($(#[$meta:meta])* $name:ident => $op:ident),* $(,)?) => {
        impl Filter {
            $(
                $(#[$meta])*
                pub fn $name(field: impl Into<String>, value: impl Into<Bson>) -> Expr {
                    Expr::field(field.into(), FieldOp::$op, value.into())
                }
            )*
        }
    };
}

field_filters! {
    eq => Eq,
    ne => Ne,
    gt => Gt,
    gte => Gte,
    lt => Lt,
    lte => Lte,
    starts_with => StartsWith,
    ends_with => EndsWith,
    /// Substring of a string field, or element of an array field.
    contains => Contains,
    not_contains => NotContains,
    /// `value` is an array of candidates; a scalar is a single candidate.
    any_of => AnyOf,
    none_of => NoneOf,
}

impl Filter {
    pub fn exists(field: impl Into<String>) -> Expr {
        Expr::Exists(field.into(), true)
    }

    pub fn not_exists(field: impl Into<String>) -> Expr {
        Expr::Exists(field.into(), false)
    }

    pub fn and(filters: impl IntoIterator<Item = Expr>) -> Expr {
        Expr::And(filters.into_iter().collect())
    }

    pub fn or(filters: impl IntoIterator<Item = Expr>) -> Expr {
        Expr::Or(filters.into_iter().collect())
    }

    /// Matches the records whose identifier is one of `ids`.
    pub fn ids(ids: impl IntoIterator<Item = ObjectId>) -> Expr {
        Filter::any_of(
            "_id",
            Bson::Array(ids.into_iter().map(Bson::ObjectId).collect()),
        )
    }
}

#[derive(Debug, Clone, Default)]
pub struct QueryBuilder {
    query: Query,
}

impl QueryBuilder {
    pub fn filter(mut self, filter: Expr) -> Self {
        self.query.filter = Some(filter);
        self
    }

    pub fn fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.query.fields = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.query.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.query.offset = Some(offset);
        self
    }

    pub fn sort(mut self, field: impl Into<String>, direction: SortDirection) -> Self {
        self.query.sort.push(Sort {
            field: field.into(),
            direction,
        });
        self
    }

    pub fn build(self) -> Query {
        self.query
    }
}

/// A backend-side walk over an [`Expr`] tree.
///
/// Implementors handle each node kind; [`QueryVisitor::visit_expr`] dispatches.
pub trait QueryVisitor {
    type Output;
    type Error: Into<DocumentStoreError>;

    fn visit_and(&mut self, exprs: &[Expr]) -> Result<Self::Output, Self::Error>;
    fn visit_or(&mut self, exprs: &[Expr]) -> Result<Self::Output, Self::Error>;
    fn visit_not(&mut self, expr: &Expr) -> Result<Self::Output, Self::Error>;
    fn visit_exists(&mut self, field: &str, should_exist: bool) -> Result<Self::Output, Self::Error>;
    fn visit_field(&mut self, field: &str, op: &FieldOp, value: &Bson) -> Result<Self::Output, Self::Error>;

    fn visit_expr(&mut self, expr: &Expr) -> Result<Self::Output, Self::Error> {
        match expr {
            Expr::And(exprs) => self.visit_and(exprs),
            Expr::Or(exprs) => self.visit_or(exprs),
            Expr::Not(inner) => self.visit_not(inner),
            Expr::Exists(field, should_exist) => self.visit_exists(field, *should_exist),
            Expr::Field { field, op, value } => self.visit_field(field, op, value),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chained_conditions_stay_flat() {
        let filter = Filter::eq("a", 1).and(Filter::eq("b", 2)).and(Filter::eq("c", 3));
        let Expr::And(all) = &filter else {
            panic!("expected a conjunction, got {filter:?}");
        };
        assert_eq!(all.len(), 3);

        let nested = Filter::eq("a", 1).or(Filter::eq("b", 2)).and(Filter::exists("c"));
        assert!(matches!(&nested, Expr::And(all) if matches!(all[0], Expr::Or(_))));
    }

    #[test]
    fn identifier_filters_list_object_ids() {
        let id = ObjectId::new();

        assert_eq!(
            Filter::ids([id]),
            Expr::Field {
                field: "_id".into(),
                op: FieldOp::AnyOf,
                value: Bson::Array(vec![Bson::ObjectId(id)]),
            }
        );
    }

    #[test]
    fn builder_collects_every_option() {
        let query = Query::builder()
            .filter(Filter::ne("title", "draft"))
            .fields(["title"])
            .sort("title", SortDirection::Asc)
            .sort("rank", SortDirection::Desc)
            .offset(5)
            .limit(10)
            .build();

        assert_eq!(query.sort, vec![Sort::asc("title"), Sort::desc("rank")]);
        assert_eq!(query.fields, Some(vec!["title".to_string()]));
        assert_eq!((query.offset, query.limit), (Some(5), Some(10)));
        assert_eq!(SortDirection::Desc.as_i32(), -1);
    }
}

//! Query translation from the filter AST to MongoDB query syntax.
//!
//! This module translates abstract filter expressions into MongoDB BSON documents for
//! execution by the MongoDB query engine. Records of the file store keep their declared
//! fields under `metadata`, so the translator can prefix field paths.

use bson::{Bson, Document, doc};

use docmapper_core::{
    error::DocumentStoreError,
    query::{Expr, FieldOp, QueryVisitor, Sort},
};

/// Keys of a GridFS files record that live at the top level rather than under `metadata`.
const FILE_KEYS: [&str; 2] = ["_id", "length"];

/// Translates filter expressions into MongoDB query documents.
#[derive(Debug, Default)]
pub(crate) struct MongoQueryTranslator {
    prefix: Option<&'static str>,
}

impl MongoQueryTranslator {
    /// A translator for plain collections.
    pub fn new() -> Self {
        Self::default()
    }

    /// A translator for the files collection of a GridFS bucket.
    pub fn for_files() -> Self {
        Self {
            prefix: Some("metadata"),
        }
    }

    /// The stored path of a field.
    pub fn path(&self, field: &str) -> String {
        match self.prefix {
            Some(prefix) if !FILE_KEYS.contains(&field) => format!("{prefix}.{field}"),
            _ => field.to_string(),
        }
    }

    pub fn filter(&mut self, filter: Option<&Expr>) -> Result<Document, DocumentStoreError> {
        match filter {
            Some(expr) => self.visit_expr(expr),
            None => Ok(doc! {}),
        }
    }

    pub fn sort(&self, sort: &[Sort]) -> Option<Document> {
        if sort.is_empty() {
            return None;
        }

        Some(
            sort.iter()
                .map(|key| (self.path(&key.field), Bson::Int32(key.direction.as_i32())))
                .collect(),
        )
    }

    pub fn projection(&self, fields: Option<&[String]>) -> Option<Document> {
        let fields = fields?;
        let mut projection = fields
            .iter()
            .map(|field| (self.path(field), Bson::Int32(1)))
            .collect::<Document>();

        if self.prefix.is_some() {
            projection.insert("length", 1);
        }

        Some(projection)
    }

    /// Prefixes the field paths of `$set`/`$unset` operators.
    pub fn update(&self, update: Document) -> Document {
        update
            .into_iter()
            .map(|(operator, arguments)| match arguments {
                Bson::Document(arguments) if operator.starts_with('$') => {
                    let arguments = arguments
                        .into_iter()
                        .map(|(path, value)| (self.path(&path), value))
                        .collect::<Document>();
                    (operator, Bson::Document(arguments))
                }
                other => (operator, other),
            })
            .collect()
    }
}

fn escape_regex(pattern: &str) -> String {
    let mut escaped = String::with_capacity(pattern.len());
    for c in pattern.chars() {
        if "\\^$.|?*+()[]{}".contains(c) {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

impl QueryVisitor for MongoQueryTranslator {
    type Output = Document;
    type Error = DocumentStoreError;

    fn visit_and(&mut self, exprs: &[Expr]) -> Result<Self::Output, Self::Error> {
        Ok(doc! {
            "$and": exprs
                .iter()
                .map(|expr| self.visit_expr(expr))
                .collect::<Result<Vec<_>, _>>()?,
        })
    }

    fn visit_or(&mut self, exprs: &[Expr]) -> Result<Self::Output, Self::Error> {
        Ok(doc! {
            "$or": exprs
                .iter()
                .map(|expr| self.visit_expr(expr))
                .collect::<Result<Vec<_>, _>>()?,
        })
    }

    fn visit_not(&mut self, expr: &Expr) -> Result<Self::Output, Self::Error> {
        // `$not` only applies to operator expressions, `$nor` negates whole filters.
        Ok(doc! {
            "$nor": [self.visit_expr(expr)?],
        })
    }

    fn visit_exists(&mut self, field: &str, should_exist: bool) -> Result<Self::Output, Self::Error> {
        let path = self.path(field);
        Ok(doc! {
            path: { "$exists": should_exist },
        })
    }

    fn visit_field(&mut self, field: &str, op: &FieldOp, value: &Bson) -> Result<Self::Output, Self::Error> {
        let path = self.path(field);
        Ok(doc! {
            path: match op {
                FieldOp::Eq => doc! { "$eq": value },
                FieldOp::Ne => doc! { "$ne": value },
                FieldOp::Gt => doc! { "$gt": value },
                FieldOp::Gte => doc! { "$gte": value },
                FieldOp::Lt => doc! { "$lt": value },
                FieldOp::Lte => doc! { "$lte": value },
                FieldOp::Contains => match value {
                    Bson::String(s) => doc! { "$regex": escape_regex(s) },
                    Bson::Array(arr) => doc! { "$all": arr },
                    other => doc! { "$elemMatch": { "$eq": other } },
                },
                FieldOp::NotContains => match value {
                    Bson::String(s) => doc! { "$not": { "$regex": escape_regex(s) } },
                    Bson::Array(arr) => doc! { "$nin": arr },
                    other => doc! { "$ne": other },
                },
                FieldOp::StartsWith => match value {
                    Bson::String(s) => doc! { "$regex": format!("^{}", escape_regex(s)) },
                    _ => return Err(DocumentStoreError::Backend("StartsWith operator requires a string value".to_string())),
                },
                FieldOp::EndsWith => match value {
                    Bson::String(s) => doc! { "$regex": format!("{}$", escape_regex(s)) },
                    _ => return Err(DocumentStoreError::Backend("EndsWith operator requires a string value".to_string())),
                },
                FieldOp::AnyOf => match value {
                    Bson::Array(_) => doc! { "$in": value },
                    other => doc! { "$in": [other] },
                },
                FieldOp::NoneOf => match value {
                    Bson::Array(_) => doc! { "$nin": value },
                    other => doc! { "$nin": [other] },
                },
            }
        })
    }
}

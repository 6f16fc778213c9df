//! Pluggable behavior attached to document shapes.
//!
//! An [`Extension`] is attached to a [`Definition`] while it is open. It may declare extra
//! fields in [`Extension::setup`], listen to lifecycle [`Event`]s, and contribute methods that
//! callers reach through [`Document::call`] and [`Repository::call`]. Which events and methods an
//! extension handles is declared up front and baked into the closed definition's dispatch
//! tables, so nothing is probed at runtime.
//!
//! # Example
//!
//! ```ignore
//! #[derive(Debug)]
//! struct Timestampable {
//!     options: ExtensionOptions,
//! }
//!
//! impl Timestampable {
//!     fn new(options: impl IntoIterator<Item = (&'static str, Value)>) -> DocumentStoreResult<Self> {
//!         let options = ExtensionOptions::with_defaults([("field", Value::from("created_at"))])
//!             .merge(options)?;
//!         Ok(Self { options })
//!     }
//! }
//!
//! #[async_trait]
//! impl Extension for Timestampable {
//!     fn name(&self) -> &str { "timestampable" }
//!
//!     fn setup(&self, definition: &mut Definition) -> DocumentStoreResult<()> {
//!         definition.add_field(self.options.option("field")?.to_key(), "date")?;
//!         Ok(())
//!     }
//!
//!     fn events(&self) -> &[Event] { &[Event::PreInsert] }
//!
//!     fn notify(&self, _event: Event, document: &Document) -> DocumentStoreResult<()> {
//!         document.set(&self.options.option("field")?.to_key(), Utc::now())
//!     }
//! }
//! ```

use std::fmt::Debug;

use async_trait::async_trait;
use indexmap::IndexMap;

use crate::{
    definition::{Definition, Event},
    document::Document,
    error::{DocumentStoreError, DocumentStoreResult},
    repository::Repository,
    value::Value,
};

/// A unit of behavior attached to a document shape.
///
/// Every method has a no-op default, so an extension only implements what it uses.
#[async_trait]
pub trait Extension: Send + Sync + Debug {
    /// A short name, used in logs and error messages.
    fn name(&self) -> &str;

    /// The options of this extension, if it takes any.
    fn options(&self) -> Option<&ExtensionOptions> {
        None
    }

    /// Runs when the extension is attached to a definition, before the definition is closed.
    fn setup(&self, _definition: &mut Definition) -> DocumentStoreResult<()> {
        Ok(())
    }

    /// The lifecycle events [`Extension::notify`] is called for.
    fn events(&self) -> &[Event] {
        &[]
    }

    fn notify(&self, _event: Event, _document: &Document) -> DocumentStoreResult<()> {
        Ok(())
    }

    /// Names of the methods this extension adds to documents.
    fn document_methods(&self) -> &[&'static str] {
        &[]
    }

    fn call_document_method(
        &self,
        method: &str,
        _document: &Document,
        _args: Vec<Value>,
    ) -> DocumentStoreResult<Value> {
        Err(DocumentStoreError::not_found("document method", method))
    }

    /// Names of the methods this extension adds to repositories.
    fn repository_methods(&self) -> &[&'static str] {
        &[]
    }

    /// Handles a repository method with the invoking repository as context.
    async fn call_repository_method(
        &self,
        method: &str,
        _repository: &Repository,
        _args: Vec<Value>,
    ) -> DocumentStoreResult<Value> {
        Err(DocumentStoreError::not_found("repository method", method))
    }
}

/// Named extension options, validated against the defaults an extension declares.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtensionOptions {
    values: IndexMap<String, Value>,
}

impl ExtensionOptions {
    /// Declares the accepted options and their default values.
    pub fn with_defaults<I, K, V>(defaults: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        Self {
            values: defaults
                .into_iter()
                .map(|(name, value)| (name.into(), value.into()))
                .collect(),
        }
    }

    /// Overrides declared options with the given values.
    ///
    /// # Errors
    ///
    /// Returns [`DocumentStoreError::Definition`] listing every option that was not declared.
    pub fn merge<I, K, V>(mut self, options: I) -> DocumentStoreResult<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        let mut invalid = Vec::new();

        for (name, value) in options {
            let name = name.into();
            match self.values.get_mut(&name) {
                Some(slot) => *slot = value.into(),
                None => invalid.push(name),
            }
        }

        if !invalid.is_empty() {
            return Err(DocumentStoreError::Definition(format!(
                "invalid extension options \"{}\"",
                invalid.join(", ")
            )));
        }

        Ok(self)
    }

    pub fn has_option(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    /// # Errors
    ///
    /// Returns [`DocumentStoreError::NotFound`] if the option was not declared.
    pub fn option(&self, name: &str) -> DocumentStoreResult<&Value> {
        self.values
            .get(name)
            .ok_or_else(|| DocumentStoreError::not_found("option", name))
    }

    pub fn options(&self) -> &IndexMap<String, Value> {
        &self.values
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn declared_options_can_be_overridden() {
        let options = ExtensionOptions::with_defaults([("field", "slug"), ("unique", "yes")])
            .merge([("field", "permalink")])
            .unwrap();

        assert_eq!(options.option("field").unwrap(), &Value::from("permalink"));
        assert_eq!(options.option("unique").unwrap(), &Value::from("yes"));
        assert!(options.has_option("unique"));
        assert_eq!(options.options().len(), 2);
    }

    #[test]
    fn unknown_options_are_rejected() {
        let result = ExtensionOptions::with_defaults([("field", "slug")])
            .merge([("fields", "title"), ("other", "x")]);

        match result {
            Err(DocumentStoreError::Definition(message)) => {
                assert!(message.contains("fields, other"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn missing_options_are_not_found() {
        let options = ExtensionOptions::default();

        assert!(matches!(
            options.option("field"),
            Err(DocumentStoreError::NotFound("option", _))
        ));
    }
}

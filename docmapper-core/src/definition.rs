//! Shape declarations and their compiled metadata.
//!
//! A [`Definition`] is assembled while open, then closed once. Closing validates the
//! declarations and computes everything the runtime needs on the hot path: the default data
//! template, the initial modified-set, the ordered list of field converters, the binary
//! large-object field, the lifecycle hook dispatch table and the extension method tables.
//!
//! # Example
//!
//! ```ignore
//! use docmapper::definition::{Cardinality, Definition};
//!
//! let mut definition = Definition::document("Article");
//! definition
//!     .add_field("title", "string")?
//!     .add_field_with_default("is_active", "boolean", false)?
//!     .add_field("author_id", "id")?
//!     .add_reference("author", "Author", "author_id", Cardinality::One)?
//!     .add_embed("source", "Source", Cardinality::One)?;
//!
//! definition.close(&TypeRegistry::global())?;
//! assert_eq!(definition.collection(), "article");
//! ```

use std::{collections::HashMap, fmt, sync::Arc};

use bson::Bson;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::{
    document::Document,
    error::{DocumentStoreError, DocumentStoreResult},
    extension::Extension,
    query::SortDirection,
    types::{TypeRef, TypeRegistry},
    value::Value,
};

/// Whether a shape is stored in its own collection or inside a parent record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShapeKind {
    Document,
    Embedded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Cardinality {
    One,
    Many,
}

/// Lifecycle events fired by repositories around storage calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Event {
    PreInsert,
    PostInsert,
    PreUpdate,
    PostUpdate,
    PreSave,
    PostSave,
    PreDelete,
    PostDelete,
}

impl Event {
    pub const ALL: [Event; 8] = [
        Event::PreInsert,
        Event::PostInsert,
        Event::PreUpdate,
        Event::PostUpdate,
        Event::PreSave,
        Event::PostSave,
        Event::PreDelete,
        Event::PostDelete,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Event::PreInsert => "preInsert",
            Event::PostInsert => "postInsert",
            Event::PreUpdate => "preUpdate",
            Event::PostUpdate => "postUpdate",
            Event::PreSave => "preSave",
            Event::PostSave => "postSave",
            Event::PreDelete => "preDelete",
            Event::PostDelete => "postDelete",
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A shape-level lifecycle hook.
pub type Hook = Arc<dyn Fn(&Document) -> DocumentStoreResult<()> + Send + Sync>;
/// Replaces the generic write path of one field.
pub type Setter = Arc<dyn Fn(&Document, Value) -> DocumentStoreResult<()> + Send + Sync>;
/// Replaces the generic read path of one field.
pub type Getter = Arc<dyn Fn(&Document) -> DocumentStoreResult<Value> + Send + Sync>;

#[derive(Debug, Clone, PartialEq)]
pub struct FieldDef {
    pub type_name: String,
    pub default: Option<Value>,
}

/// A foreign key stored in `field` plus a lazily resolved document (or group) of `target`.
#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceDef {
    pub target: String,
    pub field: String,
    pub cardinality: Cardinality,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EmbedDef {
    pub target: String,
    pub cardinality: Cardinality,
}

/// A reverse lookup of the `target` documents whose `field` holds this document's identifier.
#[derive(Debug, Clone, PartialEq)]
pub struct RelationDef {
    pub target: String,
    pub field: String,
    pub cardinality: Cardinality,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexOptions {
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub sparse: bool,
    #[serde(default)]
    pub name: Option<String>,
}

/// A storage-side index over one or more keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexDef {
    pub keys: Vec<(String, SortDirection)>,
    #[serde(default)]
    pub options: IndexOptions,
}

impl IndexDef {
    pub fn new<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = (S, SortDirection)>,
        S: Into<String>,
    {
        Self {
            keys: keys
                .into_iter()
                .map(|(key, direction)| (key.into(), direction))
                .collect(),
            options: IndexOptions::default(),
        }
    }

    pub fn unique(mut self) -> Self {
        self.options.unique = true;
        self
    }

    pub fn sparse(mut self) -> Self {
        self.options.sparse = true;
        self
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.options.name = Some(name.into());
        self
    }

    /// The key specification in storage syntax, e.g. `{ "title": 1 }`.
    pub fn key_document(&self) -> bson::Document {
        self.keys
            .iter()
            .map(|(key, direction)| (key.clone(), Bson::Int32(direction.as_i32())))
            .collect()
    }
}

/// The template a new document's data is copied from.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DefaultData {
    /// Every field, holding its default or null.
    pub fields: IndexMap<String, Value>,
    pub references: Vec<String>,
    pub embeds: Vec<String>,
    pub relations: Vec<String>,
}

#[derive(Clone, Default)]
struct EventDispatch {
    shape: Option<Hook>,
    extensions: Vec<usize>,
}

#[derive(Clone)]
struct Compiled {
    default_data: DefaultData,
    default_fields_modified: IndexMap<String, Value>,
    converters: IndexMap<String, TypeRef>,
    file_field: Option<String>,
    events: HashMap<Event, EventDispatch>,
    document_methods: HashMap<String, usize>,
    repository_methods: HashMap<String, usize>,
}

/// Compiled, immutable-once-closed metadata for one document shape.
pub struct Definition {
    name: String,
    kind: ShapeKind,
    fields: IndexMap<String, FieldDef>,
    references: IndexMap<String, ReferenceDef>,
    embeds: IndexMap<String, EmbedDef>,
    relations: IndexMap<String, RelationDef>,
    indexes: Vec<IndexDef>,
    extensions: Vec<Arc<dyn Extension>>,
    hooks: HashMap<Event, Hook>,
    setters: HashMap<String, Setter>,
    getters: HashMap<String, Getter>,
    connection: Option<String>,
    collection: Option<String>,
    compiled: Option<Compiled>,
}

impl fmt::Debug for Definition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Definition")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("fields", &self.fields)
            .field("references", &self.references)
            .field("embeds", &self.embeds)
            .field("relations", &self.relations)
            .field("indexes", &self.indexes)
            .field("extensions", &self.extensions)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Definition {
    pub fn new(name: impl Into<String>, kind: ShapeKind) -> Self {
        Self {
            name: name.into(),
            kind,
            fields: IndexMap::new(),
            references: IndexMap::new(),
            embeds: IndexMap::new(),
            relations: IndexMap::new(),
            indexes: Vec::new(),
            extensions: Vec::new(),
            hooks: HashMap::new(),
            setters: HashMap::new(),
            getters: HashMap::new(),
            connection: None,
            collection: None,
            compiled: None,
        }
    }

    /// Starts the definition of a shape stored in its own collection.
    pub fn document(name: impl Into<String>) -> Self {
        Self::new(name, ShapeKind::Document)
    }

    /// Starts the definition of a shape stored inside parent records.
    pub fn embedded(name: impl Into<String>) -> Self {
        Self::new(name, ShapeKind::Embedded)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ShapeKind {
        self.kind
    }

    pub fn is_closed(&self) -> bool {
        self.compiled.is_some()
    }

    fn check_open(&self) -> DocumentStoreResult<()> {
        if self.is_closed() {
            return Err(DocumentStoreError::State(format!(
                "the definition of \"{}\" is closed",
                self.name
            )));
        }

        Ok(())
    }

    fn check_document(&self, what: &str) -> DocumentStoreResult<()> {
        if self.kind != ShapeKind::Document {
            return Err(DocumentStoreError::Definition(format!(
                "the embedded shape \"{}\" cannot declare {what}",
                self.name
            )));
        }

        Ok(())
    }

    fn check_name(&self, name: &str) -> DocumentStoreResult<()> {
        self.check_open()?;

        if self.has_name(name) {
            return Err(DocumentStoreError::Definition(format!(
                "the name \"{name}\" is already used in \"{}\"",
                self.name
            )));
        }

        Ok(())
    }

    /// Whether `name` is taken by a field, reference, embed or relation.
    pub fn has_name(&self, name: &str) -> bool {
        self.fields.contains_key(name)
            || self.references.contains_key(name)
            || self.embeds.contains_key(name)
            || self.relations.contains_key(name)
    }

    /// Declares a field of the given type.
    ///
    /// # Errors
    ///
    /// Returns [`DocumentStoreError::Definition`] if the name is taken and
    /// [`DocumentStoreError::State`] if the definition is closed.
    pub fn add_field(
        &mut self,
        name: impl Into<String>,
        type_name: impl Into<String>,
    ) -> DocumentStoreResult<&mut Self> {
        let name = name.into();
        self.check_name(&name)?;
        self.fields.insert(
            name,
            FieldDef {
                type_name: type_name.into(),
                default: None,
            },
        );

        Ok(self)
    }

    /// Declares a field whose new documents start with `default`.
    pub fn add_field_with_default(
        &mut self,
        name: impl Into<String>,
        type_name: impl Into<String>,
        default: impl Into<Value>,
    ) -> DocumentStoreResult<&mut Self> {
        let name = name.into();
        self.check_name(&name)?;
        self.fields.insert(
            name,
            FieldDef {
                type_name: type_name.into(),
                default: Some(default.into()),
            },
        );

        Ok(self)
    }

    /// Declares a reference whose identifier (or identifiers) live in `field`.
    ///
    /// `field` must be declared as a field by the time the definition is closed.
    pub fn add_reference(
        &mut self,
        name: impl Into<String>,
        target: impl Into<String>,
        field: impl Into<String>,
        cardinality: Cardinality,
    ) -> DocumentStoreResult<&mut Self> {
        let name = name.into();
        self.check_name(&name)?;
        self.check_document("references")?;
        self.references.insert(
            name,
            ReferenceDef {
                target: target.into(),
                field: field.into(),
                cardinality,
            },
        );

        Ok(self)
    }

    pub fn add_embed(
        &mut self,
        name: impl Into<String>,
        target: impl Into<String>,
        cardinality: Cardinality,
    ) -> DocumentStoreResult<&mut Self> {
        let name = name.into();
        self.check_name(&name)?;
        self.embeds.insert(
            name,
            EmbedDef {
                target: target.into(),
                cardinality,
            },
        );

        Ok(self)
    }

    /// Declares a relation: the `target` documents whose `field` holds this document's identifier.
    pub fn add_relation(
        &mut self,
        name: impl Into<String>,
        target: impl Into<String>,
        field: impl Into<String>,
        cardinality: Cardinality,
    ) -> DocumentStoreResult<&mut Self> {
        let name = name.into();
        self.check_name(&name)?;
        self.check_document("relations")?;
        self.relations.insert(
            name,
            RelationDef {
                target: target.into(),
                field: field.into(),
                cardinality,
            },
        );

        Ok(self)
    }

    pub fn add_index(&mut self, index: IndexDef) -> DocumentStoreResult<&mut Self> {
        self.check_open()?;
        self.check_document("indexes")?;
        self.indexes.push(index);

        Ok(self)
    }

    /// Attaches an extension after letting it [set up](Extension::setup) this definition.
    ///
    /// Extensions are dispatched to in the order they were attached.
    pub fn add_extension(&mut self, extension: impl Extension + 'static) -> DocumentStoreResult<&mut Self> {
        self.check_open()?;
        self.check_document("extensions")?;
        extension.setup(self)?;
        self.extensions.push(Arc::new(extension));

        Ok(self)
    }

    /// Declares the shape-level hook for `event`, replacing any previous one.
    pub fn add_hook<F>(&mut self, event: Event, hook: F) -> DocumentStoreResult<&mut Self>
    where
        F: Fn(&Document) -> DocumentStoreResult<()> + Send + Sync + 'static,
    {
        self.check_open()?;
        self.check_document("lifecycle hooks")?;
        self.hooks.insert(event, Arc::new(hook));

        Ok(self)
    }

    /// Routes [`Document::set`] for `field` through `setter`.
    ///
    /// The setter usually validates or normalizes the value, then calls
    /// [`Document::set_raw`].
    pub fn add_setter<F>(&mut self, field: impl Into<String>, setter: F) -> DocumentStoreResult<&mut Self>
    where
        F: Fn(&Document, Value) -> DocumentStoreResult<()> + Send + Sync + 'static,
    {
        self.check_open()?;
        self.setters.insert(field.into(), Arc::new(setter));

        Ok(self)
    }

    /// Routes reads of `field` through `getter`.
    pub fn add_getter<F>(&mut self, field: impl Into<String>, getter: F) -> DocumentStoreResult<&mut Self>
    where
        F: Fn(&Document) -> DocumentStoreResult<Value> + Send + Sync + 'static,
    {
        self.check_open()?;
        self.getters.insert(field.into(), Arc::new(getter));

        Ok(self)
    }

    pub fn set_connection(&mut self, connection: impl Into<String>) -> DocumentStoreResult<&mut Self> {
        self.check_open()?;
        self.check_document("a connection")?;
        self.connection = Some(connection.into());

        Ok(self)
    }

    pub fn set_collection(&mut self, collection: impl Into<String>) -> DocumentStoreResult<&mut Self> {
        self.check_open()?;
        self.check_document("a collection")?;
        self.collection = Some(collection.into());

        Ok(self)
    }

    /// Validates the declarations and computes the derived data.
    ///
    /// # Errors
    ///
    /// - [`DocumentStoreError::State`] if the definition is already closed
    /// - [`DocumentStoreError::NotFound`] if a field names an unregistered type
    /// - [`DocumentStoreError::Definition`] if a reference points to an undeclared field, an
    ///   override names an undeclared field, or the file field rules are broken
    pub fn close(&mut self, types: &TypeRegistry) -> DocumentStoreResult<()> {
        if self.is_closed() {
            return Err(DocumentStoreError::State(format!(
                "the definition of \"{}\" is already closed",
                self.name
            )));
        }

        let mut converters = IndexMap::with_capacity(self.fields.len());
        for (name, field) in &self.fields {
            converters.insert(name.clone(), types.get(&field.type_name)?);
        }

        let file_fields = converters
            .iter()
            .filter(|(_, converter)| converter.is_file())
            .map(|(name, _)| name.clone())
            .collect::<Vec<_>>();
        let file_field = match file_fields.as_slice() {
            [] => None,
            [name] if self.kind == ShapeKind::Embedded => {
                return Err(DocumentStoreError::Definition(format!(
                    "the embedded shape \"{}\" cannot declare the file field \"{name}\"",
                    self.name
                )));
            }
            [name] if name != "file" => {
                return Err(DocumentStoreError::Definition(format!(
                    "the file field of \"{}\" must be named \"file\", not \"{name}\"",
                    self.name
                )));
            }
            [name] => Some(name.clone()),
            _ => {
                return Err(DocumentStoreError::Definition(format!(
                    "\"{}\" declares more than one file field",
                    self.name
                )));
            }
        };

        for (name, reference) in &self.references {
            if !self.fields.contains_key(&reference.field) {
                return Err(DocumentStoreError::Definition(format!(
                    "the reference \"{name}\" of \"{}\" uses the undeclared field \"{}\"",
                    self.name, reference.field
                )));
            }
        }

        for field in self.setters.keys().chain(self.getters.keys()) {
            if !self.fields.contains_key(field) {
                return Err(DocumentStoreError::Definition(format!(
                    "\"{}\" overrides the undeclared field \"{field}\"",
                    self.name
                )));
            }
        }

        let mut default_data = DefaultData::default();
        let mut default_fields_modified = IndexMap::new();
        for (name, field) in &self.fields {
            let default = field.default.clone().unwrap_or_default();
            if !default.is_null() {
                default_fields_modified.insert(name.clone(), Value::Null);
            }
            default_data.fields.insert(name.clone(), default);
        }
        default_data.references = self.references.keys().cloned().collect();
        default_data.embeds = self.embeds.keys().cloned().collect();
        default_data.relations = self.relations.keys().cloned().collect();

        let mut events = HashMap::new();
        for event in Event::ALL {
            let dispatch = EventDispatch {
                shape: self.hooks.get(&event).cloned(),
                extensions: self
                    .extensions
                    .iter()
                    .enumerate()
                    .filter(|(_, extension)| extension.events().contains(&event))
                    .map(|(index, _)| index)
                    .collect(),
            };

            if dispatch.shape.is_some() || !dispatch.extensions.is_empty() {
                events.insert(event, dispatch);
            }
        }

        let mut document_methods = HashMap::new();
        let mut repository_methods = HashMap::new();
        for (index, extension) in self.extensions.iter().enumerate() {
            for method in extension.document_methods() {
                document_methods.entry(method.to_string()).or_insert(index);
            }
            for method in extension.repository_methods() {
                repository_methods.entry(method.to_string()).or_insert(index);
            }
        }

        tracing::trace!(shape = %self.name, fields = converters.len(), "definition closed");

        self.compiled = Some(Compiled {
            default_data,
            default_fields_modified,
            converters,
            file_field,
            events,
            document_methods,
            repository_methods,
        });

        Ok(())
    }

    fn compiled(&self) -> DocumentStoreResult<&Compiled> {
        self.compiled.as_ref().ok_or_else(|| {
            DocumentStoreError::State(format!("the definition of \"{}\" is not closed", self.name))
        })
    }

    pub fn fields(&self) -> &IndexMap<String, FieldDef> {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.get(name)
    }

    pub fn references(&self) -> &IndexMap<String, ReferenceDef> {
        &self.references
    }

    pub fn reference(&self, name: &str) -> Option<&ReferenceDef> {
        self.references.get(name)
    }

    pub fn embeds(&self) -> &IndexMap<String, EmbedDef> {
        &self.embeds
    }

    pub fn embed(&self, name: &str) -> Option<&EmbedDef> {
        self.embeds.get(name)
    }

    pub fn relations(&self) -> &IndexMap<String, RelationDef> {
        &self.relations
    }

    pub fn relation(&self, name: &str) -> Option<&RelationDef> {
        self.relations.get(name)
    }

    pub fn indexes(&self) -> &[IndexDef] {
        &self.indexes
    }

    pub fn extensions(&self) -> &[Arc<dyn Extension>] {
        &self.extensions
    }

    pub fn connection(&self) -> Option<&str> {
        self.connection.as_deref()
    }

    /// The collection override, or the underscored shape name.
    pub fn collection(&self) -> String {
        self.collection
            .clone()
            .unwrap_or_else(|| underscore(&self.name))
    }

    pub fn setter(&self, field: &str) -> Option<&Setter> {
        self.setters.get(field)
    }

    pub fn getter(&self, field: &str) -> Option<&Getter> {
        self.getters.get(field)
    }

    pub fn default_data(&self) -> DocumentStoreResult<&DefaultData> {
        Ok(&self.compiled()?.default_data)
    }

    /// Fields that start modified on a new document, each mapped to its null baseline.
    pub fn default_fields_modified(&self) -> DocumentStoreResult<&IndexMap<String, Value>> {
        Ok(&self.compiled()?.default_fields_modified)
    }

    /// The name of the binary large-object field, if the shape has one.
    pub fn file_field(&self) -> DocumentStoreResult<Option<&str>> {
        Ok(self.compiled()?.file_field.as_deref())
    }

    pub fn is_file(&self) -> DocumentStoreResult<bool> {
        Ok(self.compiled()?.file_field.is_some())
    }

    /// The converter of one field.
    pub fn converter(&self, field: &str) -> DocumentStoreResult<&TypeRef> {
        self.compiled()?
            .converters
            .get(field)
            .ok_or_else(|| DocumentStoreError::not_found("field", field))
    }

    /// Converts one non-null field value to its storage form.
    pub fn field_to_storage(&self, field: &str, value: &Value) -> DocumentStoreResult<Bson> {
        match value {
            Value::Null => Ok(Bson::Null),
            value => self.converter(field)?.to_storage(value),
        }
    }

    /// Converts the declared fields present in `data`, in declaration order.
    ///
    /// Absent fields stay absent; keys that are not fields are ignored.
    pub fn data_to_storage(&self, data: &IndexMap<String, Value>) -> DocumentStoreResult<bson::Document> {
        let mut storage = bson::Document::new();

        for (name, converter) in &self.compiled()?.converters {
            match data.get(name) {
                Some(Value::Null) => {
                    storage.insert(name.clone(), Bson::Null);
                }
                Some(value) => {
                    storage.insert(name.clone(), converter.to_storage(value)?);
                }
                None => {}
            }
        }

        Ok(storage)
    }

    /// Moves the declared fields out of `raw`, converted to their native form.
    ///
    /// Keys that are not fields (the identifier, embeds...) are left in `raw`.
    pub fn data_to_native(&self, raw: &mut bson::Document) -> DocumentStoreResult<IndexMap<String, Value>> {
        let mut fields = IndexMap::new();

        for (name, converter) in &self.compiled()?.converters {
            if let Some(value) = raw.remove(name) {
                let value = match value {
                    Bson::Null => Value::Null,
                    value => converter.to_native(&value)?,
                };
                fields.insert(name.clone(), value);
            }
        }

        Ok(fields)
    }

    /// Whether any hook listens to `event`.
    pub fn has_event(&self, event: Event) -> DocumentStoreResult<bool> {
        Ok(self.compiled()?.events.contains_key(&event))
    }

    /// Fires `event` on `document`: the shape-level hook first, then each extension that
    /// declared the event, in attachment order. The first failure stops the dispatch.
    pub fn notify(&self, event: Event, document: &Document) -> DocumentStoreResult<()> {
        let Some(dispatch) = self.compiled()?.events.get(&event) else {
            return Ok(());
        };

        if let Some(hook) = &dispatch.shape {
            hook(document)?;
        }
        for index in &dispatch.extensions {
            self.extensions[*index].notify(event, document)?;
        }

        Ok(())
    }

    /// The extension handling the document method `method`.
    pub fn document_method(&self, method: &str) -> DocumentStoreResult<&Arc<dyn Extension>> {
        self.compiled()?
            .document_methods
            .get(method)
            .map(|index| &self.extensions[*index])
            .ok_or_else(|| DocumentStoreError::not_found("document method", method))
    }

    /// The extension handling the repository method `method`.
    pub fn repository_method(&self, method: &str) -> DocumentStoreResult<&Arc<dyn Extension>> {
        self.compiled()?
            .repository_methods
            .get(method)
            .map(|index| &self.extensions[*index])
            .ok_or_else(|| DocumentStoreError::not_found("repository method", method))
    }
}

/// Converts a shape name into a collection name: `ArticleCategory` becomes `article_category`.
pub fn underscore(name: &str) -> String {
    let chars = name.chars().collect::<Vec<_>>();
    let mut result = String::with_capacity(name.len() + 4);

    for (index, current) in chars.iter().enumerate() {
        if current.is_uppercase() && index > 0 {
            let previous = chars[index - 1];
            let next_is_lower = chars.get(index + 1).is_some_and(|next| next.is_lowercase());

            if previous.is_lowercase()
                || previous.is_ascii_digit()
                || (previous.is_uppercase() && next_is_lower)
            {
                result.push('_');
            }
        }
        result.extend(current.to_lowercase());
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn article() -> Definition {
        let mut definition = Definition::document("Article");
        definition
            .add_field("title", "string")
            .unwrap()
            .add_field_with_default("is_active", "boolean", false)
            .unwrap()
            .add_field("author_id", "id")
            .unwrap()
            .add_reference("author", "Author", "author_id", Cardinality::One)
            .unwrap()
            .add_embed("source", "Source", Cardinality::One)
            .unwrap()
            .add_relation("votes", "Vote", "article_id", Cardinality::Many)
            .unwrap();
        definition
    }

    #[test]
    fn names_are_unique_across_namespaces() {
        let mut definition = article();

        for name in ["title", "author", "source", "votes"] {
            assert!(matches!(
                definition.add_field(name, "string"),
                Err(DocumentStoreError::Definition(_))
            ));
        }
        assert!(definition.add_embed("title", "Source", Cardinality::Many).is_err());
    }

    #[test]
    fn closing_computes_defaults() {
        let mut definition = article();
        definition.close(&TypeRegistry::new()).unwrap();

        let defaults = definition.default_data().unwrap();
        assert_eq!(defaults.fields["title"], Value::Null);
        assert_eq!(defaults.fields["is_active"], Value::Bool(false));
        assert_eq!(defaults.references, vec!["author"]);
        assert_eq!(defaults.embeds, vec!["source"]);
        assert_eq!(defaults.relations, vec!["votes"]);

        let modified = definition.default_fields_modified().unwrap();
        assert_eq!(modified.len(), 1);
        assert_eq!(modified["is_active"], Value::Null);
    }

    #[test]
    fn closed_definitions_are_immutable() {
        let mut definition = article();
        assert!(matches!(
            definition.default_data(),
            Err(DocumentStoreError::State(_))
        ));

        definition.close(&TypeRegistry::new()).unwrap();
        assert!(matches!(
            definition.add_field("content", "string"),
            Err(DocumentStoreError::State(_))
        ));
        assert!(matches!(
            definition.close(&TypeRegistry::new()),
            Err(DocumentStoreError::State(_))
        ));
    }

    #[test]
    fn unknown_types_fail_at_close() {
        let mut definition = Definition::document("Article");
        definition.add_field("title", "text").unwrap();

        assert!(matches!(
            definition.close(&TypeRegistry::new()),
            Err(DocumentStoreError::NotFound("type", name)) if name == "text"
        ));
    }

    #[test]
    fn file_field_rules() {
        let types = TypeRegistry::new();

        let mut valid = Definition::document("Image");
        valid.add_field("file", "file").unwrap().add_field("name", "string").unwrap();
        valid.close(&types).unwrap();
        assert_eq!(valid.file_field().unwrap(), Some("file"));

        let mut misnamed = Definition::document("Image");
        misnamed.add_field("content", "file").unwrap();
        assert!(matches!(misnamed.close(&types), Err(DocumentStoreError::Definition(_))));

        let mut twice = Definition::document("Image");
        twice.add_field("file", "file").unwrap().add_field("thumb", "file").unwrap();
        assert!(matches!(twice.close(&types), Err(DocumentStoreError::Definition(_))));
    }

    #[test]
    fn embedded_shapes_reject_top_level_declarations() {
        let mut definition = Definition::embedded("Source");

        assert!(definition.add_reference("a", "Author", "a_id", Cardinality::One).is_err());
        assert!(definition.add_relation("b", "Author", "b_id", Cardinality::One).is_err());
        assert!(definition.set_collection("sources").is_err());
        assert!(definition.add_index(IndexDef::new([("name", SortDirection::Asc)])).is_err());
    }

    #[test]
    fn references_need_their_field() {
        let mut definition = Definition::document("Article");
        definition
            .add_reference("author", "Author", "author_id", Cardinality::One)
            .unwrap();

        assert!(matches!(
            definition.close(&TypeRegistry::new()),
            Err(DocumentStoreError::Definition(_))
        ));
    }

    #[test]
    fn batch_converters_are_sparse() {
        let mut definition = article();
        definition.close(&TypeRegistry::new()).unwrap();

        let data = IndexMap::from([
            ("is_active".to_string(), Value::Bool(true)),
            ("unknown".to_string(), Value::Int(1)),
        ]);
        assert_eq!(
            definition.data_to_storage(&data).unwrap(),
            bson::doc! { "is_active": true }
        );

        let mut raw = bson::doc! { "_id": 1, "title": "Hi", "source": { "name": "x" } };
        let fields = definition.data_to_native(&mut raw).unwrap();
        assert_eq!(fields["title"], Value::from("Hi"));
        assert_eq!(raw, bson::doc! { "_id": 1, "source": { "name": "x" } });
    }

    #[test]
    fn collection_names_are_underscored() {
        assert_eq!(underscore("Article"), "article");
        assert_eq!(underscore("ArticleCategory"), "article_category");
        assert_eq!(underscore("HTMLPage"), "html_page");

        let mut definition = Definition::document("ArticleCategory");
        assert_eq!(definition.collection(), "article_category");
        definition.set_collection("categories").unwrap();
        assert_eq!(definition.collection(), "categories");
    }
}

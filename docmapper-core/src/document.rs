//! The live document runtime.
//!
//! A [`Document`] holds the current values of one instance of a shape together with a precise
//! record of which fields changed since the document was last loaded or saved. It is a cheap,
//! shared handle: clones point to the same instance, which is what lets a [`Group`] hold a
//! document that the caller keeps mutating.
//!
//! # Change tracking
//!
//! The first time a field changes, its previous value is recorded. Setting it back to that
//! value removes the record, so an exact revert leaves the document clean. Embedded documents
//! track their own changes and report them through [`Document::is_modified`] of their parent.
//!
//! # Example
//!
//! ```ignore
//! let article = container.create("Article")?;
//! article.set("title", "Hello")?;
//! assert!(article.is_modified());
//! assert_eq!(article.query_for_save()?, doc! { "title": "Hello" });
//!
//! article.save().await?;
//! article.set("title", Value::Null)?;
//! assert_eq!(article.query_for_save()?, doc! { "$unset": { "title": 1 } });
//! ```

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Weak},
};

use bson::{Bson, oid::ObjectId};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use parking_lot::{Mutex, MutexGuard};

use crate::{
    container::Container,
    definition::{Cardinality, Definition, EmbedDef, ReferenceDef, RelationDef},
    error::{DocumentStoreError, DocumentStoreResult},
    group::Group,
    query::Filter,
    repository::{FindOptions, FindResult},
    value::{FileHandle, Value},
};

/// What a document exchanges through [`Document::get`] and [`Document::set`].
#[derive(Debug, Clone)]
pub enum Data {
    Value(Value),
    Document(Document),
    Group(Group),
}

impl Data {
    pub fn kind(&self) -> &'static str {
        match self {
            Data::Value(value) => value.kind(),
            Data::Document(_) => "document",
            Data::Group(_) => "group",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Data::Value(Value::Null))
    }

    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Data::Value(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_document(&self) -> Option<&Document> {
        match self {
            Data::Document(document) => Some(document),
            _ => None,
        }
    }

    pub fn as_group(&self) -> Option<&Group> {
        match self {
            Data::Group(group) => Some(group),
            _ => None,
        }
    }

    pub fn into_value(self) -> DocumentStoreResult<Value> {
        match self {
            Data::Value(value) => Ok(value),
            other => Err(DocumentStoreError::InvalidArgument(format!(
                "expected a value, got a {}",
                other.kind()
            ))),
        }
    }

    pub fn into_document(self) -> DocumentStoreResult<Document> {
        match self {
            Data::Document(document) => Ok(document),
            other => Err(DocumentStoreError::InvalidArgument(format!(
                "expected a document, got {}",
                other.kind()
            ))),
        }
    }

    pub fn into_group(self) -> DocumentStoreResult<Group> {
        match self {
            Data::Group(group) => Ok(group),
            other => Err(DocumentStoreError::InvalidArgument(format!(
                "expected a group, got {}",
                other.kind()
            ))),
        }
    }
}

/// Values compare by content, documents and groups by identity.
impl PartialEq for Data {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Data::Value(a), Data::Value(b)) => a == b,
            (Data::Document(a), Data::Document(b)) => a.ptr_eq(b),
            (Data::Group(a), Data::Group(b)) => a.ptr_eq(b),
            _ => false,
        }
    }
}

impl From<Document> for Data {
    fn from(document: Document) -> Self {
        Data::Document(document)
    }
}

impl From<&Document> for Data {
    fn from(document: &Document) -> Self {
        Data::Document(document.clone())
    }
}

impl From<Group> for Data {
    fn from(group: Group) -> Self {
        Data::Group(group)
    }
}

impl From<&Group> for Data {
    fn from(group: &Group) -> Self {
        Data::Group(group.clone())
    }
}

macro_rules! data_from_value {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for Data {
                fn from(value: $ty) -> Self {
                    Data::Value(Value::from(value))
                }
            }
        )*
    };
}

data_from_value!(
    Value,
    &str,
    String,
    bool,
    i32,
    i64,
    f64,
    DateTime<Utc>,
    ObjectId,
    Vec<Value>,
    IndexMap<String, Value>,
    FileHandle,
);

impl<T: Into<Value>> From<Option<T>> for Data {
    fn from(value: Option<T>) -> Self {
        Data::Value(Value::from(value))
    }
}

#[derive(Debug)]
struct DocumentState {
    id: Option<ObjectId>,
    fields: IndexMap<String, Value>,
    fields_modified: IndexMap<String, Value>,
    references: IndexMap<String, Option<Data>>,
    embeds: IndexMap<String, Option<Data>>,
    relations: IndexMap<String, Option<Data>>,
}

struct DocumentInner {
    definition: Arc<Definition>,
    container: Container,
    state: Mutex<DocumentState>,
}

/// A live instance of a shape.
#[derive(Clone)]
pub struct Document {
    inner: Arc<DocumentInner>,
}

/// A non-owning handle to a [`Document`].
#[derive(Clone)]
pub struct WeakDocument(Weak<DocumentInner>);

impl WeakDocument {
    pub fn upgrade(&self) -> Option<Document> {
        self.0.upgrade().map(|inner| Document { inner })
    }
}

impl fmt::Debug for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("Document");
        debug.field("shape", &self.shape());

        // A document can be formatted from code that already holds its state.
        match self.inner.state.try_lock() {
            Some(state) => debug
                .field("id", &state.id)
                .field("fields", &state.fields)
                .field("fields_modified", &state.fields_modified)
                .finish(),
            None => debug.finish_non_exhaustive(),
        }
    }
}

impl Document {
    /// Creates a new document from the default data of a closed definition.
    ///
    /// Fields declared with a default start out modified.
    ///
    /// # Errors
    ///
    /// Returns [`DocumentStoreError::State`] if the definition is not closed.
    pub fn new(definition: Arc<Definition>, container: Container) -> DocumentStoreResult<Self> {
        let defaults = definition.default_data()?;
        let empty = |names: &[String]| {
            names
                .iter()
                .map(|name| (name.clone(), None))
                .collect::<IndexMap<_, _>>()
        };

        let state = DocumentState {
            id: None,
            fields: defaults.fields.clone(),
            fields_modified: definition.default_fields_modified()?.clone(),
            references: empty(&defaults.references),
            embeds: empty(&defaults.embeds),
            relations: empty(&defaults.relations),
        };

        Ok(Self {
            inner: Arc::new(DocumentInner {
                definition,
                container,
                state: Mutex::new(state),
            }),
        })
    }

    fn state(&self) -> MutexGuard<'_, DocumentState> {
        self.inner.state.lock()
    }

    pub fn definition(&self) -> &Arc<Definition> {
        &self.inner.definition
    }

    /// The name of the shape this document is an instance of.
    pub fn shape(&self) -> &str {
        self.inner.definition.name()
    }

    pub fn container(&self) -> &Container {
        &self.inner.container
    }

    /// The storage identifier, `None` until the document is first saved.
    pub fn id(&self) -> Option<ObjectId> {
        self.state().id
    }

    pub(crate) fn set_id(&self, id: ObjectId) {
        self.state().id = Some(id);
    }

    pub fn is_new(&self) -> bool {
        self.state().id.is_none()
    }

    /// Whether both handles point to the same instance.
    pub fn ptr_eq(&self, other: &Document) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn downgrade(&self) -> WeakDocument {
        WeakDocument(Arc::downgrade(&self.inner))
    }

    fn check_shape(&self, document: &Document, target: &str, name: &str) -> DocumentStoreResult<()> {
        if document.shape() != target {
            return Err(DocumentStoreError::InvalidArgument(format!(
                "\"{name}\" of \"{}\" expects a \"{target}\" document, got \"{}\"",
                self.shape(),
                document.shape()
            )));
        }

        Ok(())
    }

    /// Sets a field, reference or embed.
    ///
    /// Fields go through their setter override when the shape declares one. A reference to a
    /// single document also writes the document's identifier into the reference field; a
    /// reference to a group writes every identifier and keeps them in sync as the group changes.
    ///
    /// # Errors
    ///
    /// - [`DocumentStoreError::NotFound`] if `name` is not declared
    /// - [`DocumentStoreError::InvalidArgument`] for a value of the wrong shape or container kind
    /// - [`DocumentStoreError::InvalidOperation`] for relations, which cannot be set
    pub fn set(&self, name: &str, value: impl Into<Data>) -> DocumentStoreResult<()> {
        let value = value.into();
        let definition = self.definition();

        if definition.field(name).is_some() {
            let value = value.into_value()?;
            return match definition.setter(name) {
                Some(setter) => setter(self, value),
                None => self.set_raw(name, value),
            };
        }

        if let Some(reference) = definition.reference(name) {
            return self.set_reference(name, reference, value);
        }

        if let Some(embed) = definition.embed(name) {
            return self.set_embed(name, embed, value);
        }

        if definition.relation(name).is_some() {
            return Err(DocumentStoreError::InvalidOperation(format!(
                "the relation \"{name}\" of \"{}\" cannot be set",
                self.shape()
            )));
        }

        Err(DocumentStoreError::not_found("field", name))
    }

    /// Sets a field through the generic path, bypassing any setter override.
    pub fn set_raw(&self, name: &str, value: impl Into<Value>) -> DocumentStoreResult<()> {
        let value = value.into();
        let mut guard = self.state();
        let state = &mut *guard;

        let Some(current) = state.fields.get_mut(name) else {
            return Err(DocumentStoreError::not_found("field", name));
        };

        match state.fields_modified.get(name) {
            Some(previous) if *previous == value => {
                state.fields_modified.shift_remove(name);
            }
            Some(_) => {}
            None if *current == value => {}
            None => {
                state.fields_modified.insert(name.to_string(), current.clone());
            }
        }
        *current = value;

        Ok(())
    }

    /// Stores a field value loaded from storage without tracking it.
    pub(crate) fn load_field(&self, name: &str, value: Value) {
        self.state().fields.insert(name.to_string(), value);
    }

    fn set_reference(&self, name: &str, reference: &ReferenceDef, value: Data) -> DocumentStoreResult<()> {
        match (reference.cardinality, value) {
            (_, Data::Value(Value::Null)) => {
                self.set_raw(&reference.field, Value::Null)?;
                self.state().references.insert(name.to_string(), None);
            }
            (Cardinality::One, Data::Document(document)) => {
                self.check_shape(&document, &reference.target, name)?;
                self.set_raw(&reference.field, Value::from(document.id()))?;
                self.state()
                    .references
                    .insert(name.to_string(), Some(Data::Document(document)));
            }
            (Cardinality::Many, Data::Group(group)) => {
                for element in &group {
                    self.check_shape(&element, &reference.target, name)?;
                }
                self.watch_reference_group(name, &group);
                self.state()
                    .references
                    .insert(name.to_string(), Some(Data::Group(group)));
                self.sync_reference_field(name)?;
            }
            (cardinality, value) => {
                return Err(DocumentStoreError::InvalidArgument(format!(
                    "the reference \"{name}\" of \"{}\" expects {}, got {}",
                    self.shape(),
                    expected(cardinality),
                    value.kind()
                )));
            }
        }

        Ok(())
    }

    fn watch_reference_group(&self, name: &str, group: &Group) {
        let owner = self.downgrade();
        let name = name.to_string();

        group.set_callback(move |_| match owner.upgrade() {
            Some(owner) => owner.sync_reference_field(&name),
            None => Ok(()),
        });
    }

    /// Rewrites the identifier list of a many-reference from its cached group.
    ///
    /// Identifiers are kept as native `ObjectId`s so storage filters on the field match them.
    fn sync_reference_field(&self, name: &str) -> DocumentStoreResult<()> {
        let Some(reference) = self.definition().reference(name) else {
            return Err(DocumentStoreError::not_found("reference", name));
        };

        let cached = self.state().references.get(name).cloned().flatten();
        let Some(Data::Group(group)) = cached else {
            return Ok(());
        };

        let ids = group
            .iter()
            .filter_map(|element| element.id())
            .map(|id| Value::Raw(Bson::ObjectId(id)))
            .collect::<Vec<_>>();

        self.set_raw(&reference.field, Value::Array(ids))
    }

    fn set_embed(&self, name: &str, embed: &EmbedDef, value: Data) -> DocumentStoreResult<()> {
        let data = match (embed.cardinality, value) {
            (_, Data::Value(Value::Null)) => None,
            (Cardinality::One, Data::Document(document)) => {
                self.check_shape(&document, &embed.target, name)?;
                Some(Data::Document(document))
            }
            (Cardinality::Many, Data::Group(group)) => {
                for element in &group {
                    self.check_shape(&element, &embed.target, name)?;
                }
                Some(Data::Group(group))
            }
            (cardinality, value) => {
                return Err(DocumentStoreError::InvalidArgument(format!(
                    "the embed \"{name}\" of \"{}\" expects {}, got {}",
                    self.shape(),
                    expected(cardinality),
                    value.kind()
                )));
            }
        };

        self.state().embeds.insert(name.to_string(), data);

        Ok(())
    }

    /// Reads a field, through its getter override when the shape declares one.
    pub fn value(&self, name: &str) -> DocumentStoreResult<Value> {
        if let Some(getter) = self.definition().getter(name) {
            return getter(self);
        }

        self.raw_value(name)
    }

    /// Reads a field, bypassing any getter override.
    pub fn raw_value(&self, name: &str) -> DocumentStoreResult<Value> {
        self.state()
            .fields
            .get(name)
            .cloned()
            .ok_or_else(|| DocumentStoreError::not_found("field", name))
    }

    /// Returns an embed, creating an empty document or group on first access.
    pub fn embedded(&self, name: &str) -> DocumentStoreResult<Data> {
        let Some(embed) = self.definition().embed(name) else {
            return Err(DocumentStoreError::not_found("embed", name));
        };

        if let Some(data) = self.state().embeds.get(name).cloned().flatten() {
            return Ok(data);
        }

        let data = match embed.cardinality {
            Cardinality::One => Data::Document(self.container().create(&embed.target)?),
            Cardinality::Many => Data::Group(Group::new()),
        };

        let mut state = self.state();
        let slot = state.embeds.entry(name.to_string()).or_insert(None);

        Ok(slot.get_or_insert(data).clone())
    }

    /// Reads any declared name.
    ///
    /// References and relations are resolved against their target repository on first access
    /// and cached on the document. A reference whose field is null resolves to null (one) or an
    /// empty group (many); a relation of a new document or without matches resolves to null.
    ///
    /// # Errors
    ///
    /// Returns [`DocumentStoreError::NotFound`] if `name` is not declared or a referenced
    /// document no longer exists, and any storage error raised while resolving.
    pub async fn get(&self, name: &str) -> DocumentStoreResult<Data> {
        let definition = self.definition();

        if definition.field(name).is_some() {
            return self.value(name).map(Data::Value);
        }

        if definition.embed(name).is_some() {
            return self.embedded(name);
        }

        if let Some(reference) = definition.reference(name) {
            return self.resolve_reference(name, reference).await;
        }

        if let Some(relation) = definition.relation(name) {
            return self.resolve_relation(name, relation).await;
        }

        Err(DocumentStoreError::not_found("field", name))
    }

    async fn resolve_reference(&self, name: &str, reference: &ReferenceDef) -> DocumentStoreResult<Data> {
        if let Some(data) = self.state().references.get(name).cloned().flatten() {
            return Ok(data);
        }

        let key = self.raw_value(&reference.field)?;
        let repository = self.container().repository(&reference.target)?;

        let data = match reference.cardinality {
            Cardinality::One => {
                if key.is_null() {
                    return Ok(Data::Value(Value::Null));
                }

                let id = key.to_object_id()?;
                match repository.get(id).await? {
                    Some(document) => Data::Document(document),
                    None => return Err(DocumentStoreError::not_found("reference", id.to_hex())),
                }
            }
            Cardinality::Many => {
                let ids = match &key {
                    Value::Null => Vec::new(),
                    Value::Array(values) => values
                        .iter()
                        .map(Value::to_object_id)
                        .collect::<DocumentStoreResult<Vec<_>>>()?,
                    other => {
                        return Err(DocumentStoreError::InvalidDocument(format!(
                            "the reference field \"{}\" holds a {} instead of an array",
                            reference.field,
                            other.kind()
                        )));
                    }
                };

                let found = if ids.is_empty() {
                    Vec::new()
                } else {
                    repository
                        .find(FindOptions::new().filter(Filter::ids(ids.iter().copied())))
                        .await?
                        .map(FindResult::into_documents)
                        .unwrap_or_default()
                };

                let by_id = found
                    .into_iter()
                    .filter_map(|document| document.id().map(|id| (id, document)))
                    .collect::<HashMap<_, _>>();
                let group = ids
                    .iter()
                    .filter_map(|id| by_id.get(id).cloned())
                    .collect::<Group>();

                self.watch_reference_group(name, &group);
                Data::Group(group)
            }
        };

        self.state()
            .references
            .insert(name.to_string(), Some(data.clone()));

        Ok(data)
    }

    async fn resolve_relation(&self, name: &str, relation: &RelationDef) -> DocumentStoreResult<Data> {
        if let Some(data) = self.state().relations.get(name).cloned().flatten() {
            return Ok(data);
        }

        let Some(id) = self.id() else {
            return Ok(Data::Value(Value::Null));
        };

        let repository = self.container().repository(&relation.target)?;
        let key = repository
            .definition()
            .field_to_storage(&relation.field, &Value::from(id))?;
        let filter = Filter::eq(relation.field.clone(), key);

        let data = match relation.cardinality {
            Cardinality::One => match repository.find_one(Some(filter)).await? {
                Some(document) => Data::Document(document),
                None => return Ok(Data::Value(Value::Null)),
            },
            Cardinality::Many => {
                let documents = repository
                    .find(FindOptions::new().filter(filter))
                    .await?
                    .map(FindResult::into_documents)
                    .unwrap_or_default();

                if documents.is_empty() {
                    return Ok(Data::Value(Value::Null));
                }
                Data::Group(Group::with_elements(documents))
            }
        };

        self.state()
            .relations
            .insert(name.to_string(), Some(data.clone()));

        Ok(data)
    }

    fn embeds_snapshot(&self) -> Vec<(String, Data)> {
        self.state()
            .embeds
            .iter()
            .filter_map(|(name, embed)| embed.clone().map(|embed| (name.clone(), embed)))
            .collect()
    }

    /// Whether this document or any embedded document has unsaved changes.
    ///
    /// Only field changes count. Adding or removing clean elements of an embed-many group does
    /// not mark the owner modified, so such a change is only written along with a field change.
    pub fn is_modified(&self) -> bool {
        let embeds = {
            let state = self.state();
            if !state.fields_modified.is_empty() {
                return true;
            }
            state.embeds.values().flatten().cloned().collect::<Vec<_>>()
        };

        embeds.iter().any(|embed| match embed {
            Data::Document(document) => document.is_modified(),
            Data::Group(group) => group.iter().any(|element| element.is_modified()),
            Data::Value(_) => false,
        })
    }

    /// The modified fields, each mapped to its value before the first change.
    pub fn fields_modified(&self) -> IndexMap<String, Value> {
        self.state().fields_modified.clone()
    }

    pub fn is_field_modified(&self, name: &str) -> bool {
        self.state().fields_modified.contains_key(name)
    }

    /// Forgets the field changes of this document only.
    pub fn clear_fields_modified(&self) {
        self.state().fields_modified.clear();
    }

    /// Forgets the changes of this document and, recursively, of its embeds.
    pub fn clear_modified(&self) {
        let embeds = {
            let mut state = self.state();
            state.fields_modified.clear();
            state.embeds.values().flatten().cloned().collect::<Vec<_>>()
        };

        for embed in embeds {
            match embed {
                Data::Document(document) => document.clear_modified(),
                Data::Group(group) => group.iter().for_each(|element| element.clear_modified()),
                Data::Value(_) => {}
            }
        }
    }

    /// Restores every modified field to its value before the first change.
    pub fn revert_fields_modified(&self) {
        let mut guard = self.state();
        let state = &mut *guard;

        for (name, previous) in state.fields_modified.drain(..) {
            state.fields.insert(name, previous);
        }
    }

    /// Exports the non-null fields and the embeds that exist, recursively.
    pub fn to_array(&self) -> IndexMap<String, Value> {
        let fields = self.state().fields.clone();
        let mut array = fields
            .into_iter()
            .filter(|(_, value)| !value.is_null())
            .collect::<IndexMap<_, _>>();

        for (name, embed) in self.embeds_snapshot() {
            let value = match embed {
                Data::Document(document) => Value::Map(document.to_array()),
                Data::Group(group) => Value::Array(
                    group
                        .iter()
                        .map(|element| Value::Map(element.to_array()))
                        .collect(),
                ),
                Data::Value(_) => continue,
            };
            array.insert(name, value);
        }

        array
    }

    /// [`Document::to_array`] as relaxed extended JSON.
    pub fn to_json(&self) -> serde_json::Value {
        Value::Map(self.to_array()).to_json()
    }

    /// Sets fields and embeds from a map, the inverse of [`Document::to_array`].
    ///
    /// Fields go through [`Document::set`]. Embeds are filled recursively; the elements of a
    /// many-embed are replaced.
    pub fn from_array<I, K>(&self, data: I) -> DocumentStoreResult<()>
    where
        I: IntoIterator<Item = (K, Value)>,
        K: AsRef<str>,
    {
        for (name, value) in data {
            let name = name.as_ref();

            if self.definition().field(name).is_some() {
                self.set(name, value)?;
                continue;
            }

            let Some(embed) = self.definition().embed(name) else {
                return Err(DocumentStoreError::not_found("field", name));
            };

            match embed.cardinality {
                Cardinality::One => {
                    let child = self.embedded(name)?.into_document()?;
                    child.from_array(into_map(name, value)?)?;
                }
                Cardinality::Many => {
                    let group = self.embedded(name)?.into_group()?;
                    let items = match value {
                        Value::Array(items) => items,
                        other => {
                            return Err(DocumentStoreError::InvalidArgument(format!(
                                "the embed \"{name}\" expects an array, got {}",
                                other.kind()
                            )));
                        }
                    };

                    let mut elements = Vec::with_capacity(items.len());
                    for item in items {
                        let element = self.container().create(&embed.target)?;
                        element.from_array(into_map(name, item)?)?;
                        elements.push(element);
                    }
                    group.set_elements(elements)?;
                }
            }
        }

        Ok(())
    }

    /// Loads a raw storage record, replacing the tracked state.
    ///
    /// `_id` becomes the identifier, declared fields are converted to their native form and
    /// embeds are loaded recursively. Keys that are not declared are skipped. The document is
    /// unmodified afterwards, and cached references and relations are dropped.
    pub fn set_data(&self, mut raw: bson::Document) -> DocumentStoreResult<()> {
        let id = match raw.remove("_id") {
            Some(Bson::ObjectId(id)) => Some(id),
            Some(other) => {
                return Err(DocumentStoreError::InvalidDocument(format!(
                    "\"_id\" must be an identifier, got {other}"
                )));
            }
            None => None,
        };

        let definition = self.definition();
        let fields = definition.data_to_native(&mut raw)?;

        let mut embeds = Vec::new();
        for (key, value) in raw {
            let Some(embed) = definition.embed(&key) else {
                tracing::warn!(shape = %self.shape(), key = %key, "skipping unknown key while hydrating");
                continue;
            };

            let data = match (embed.cardinality, value) {
                (_, Bson::Null) => None,
                (Cardinality::One, Bson::Document(record)) => {
                    let child = self.container().create(&embed.target)?;
                    child.set_data(record)?;
                    Some(Data::Document(child))
                }
                (Cardinality::Many, Bson::Array(items)) => {
                    let mut elements = Vec::with_capacity(items.len());
                    for item in items {
                        let Bson::Document(record) = item else {
                            return Err(DocumentStoreError::InvalidDocument(format!(
                                "the embed \"{key}\" of \"{}\" holds a non-document element",
                                self.shape()
                            )));
                        };
                        let element = self.container().create(&embed.target)?;
                        element.set_data(record)?;
                        elements.push(element);
                    }
                    Some(Data::Group(Group::with_elements(elements)))
                }
                (cardinality, other) => {
                    return Err(DocumentStoreError::InvalidDocument(format!(
                        "the embed \"{key}\" of \"{}\" expects {}, got {:?}",
                        self.shape(),
                        expected(cardinality),
                        other.element_type()
                    )));
                }
            };
            embeds.push((key, data));
        }

        tracing::trace!(shape = %self.shape(), fields = fields.len(), embeds = embeds.len(), "hydrated document");

        let mut state = self.state();
        if id.is_some() {
            state.id = id;
        }
        state.fields.extend(fields);
        state.embeds.extend(embeds);
        state.references.values_mut().for_each(|slot| *slot = None);
        state.relations.values_mut().for_each(|slot| *slot = None);
        state.fields_modified.clear();

        Ok(())
    }

    /// Converts the non-null fields and existing embeds to a storage record, recursively.
    pub fn to_storage(&self) -> DocumentStoreResult<bson::Document> {
        let fields = self
            .state()
            .fields
            .iter()
            .filter(|(_, value)| !value.is_null())
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect::<IndexMap<_, _>>();

        let mut storage = self.definition().data_to_storage(&fields)?;
        for (name, embed) in self.embeds_snapshot() {
            storage.insert(name, embed_to_storage(&embed)?);
        }

        Ok(storage)
    }

    /// Computes the storage write for the pending changes.
    ///
    /// A new document yields a full record of its modified non-null fields and its embeds. A
    /// saved document yields `$set` for changed values and every existing embed, and `$unset`
    /// for fields changed to null. Fields appear in declaration order. An empty result means
    /// there is nothing to write.
    pub fn query_for_save(&self) -> DocumentStoreResult<bson::Document> {
        let (is_new, modified) = {
            let state = self.state();
            let modified = state
                .fields_modified
                .keys()
                .map(|name| {
                    let value = state.fields.get(name).cloned().unwrap_or_default();
                    (name.clone(), value)
                })
                .collect::<IndexMap<_, _>>();
            (state.id.is_none(), modified)
        };
        let embeds = self.embeds_snapshot();
        let definition = self.definition();

        let values = modified
            .iter()
            .filter(|(_, value)| !value.is_null())
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect::<IndexMap<_, _>>();
        let mut set = definition.data_to_storage(&values)?;
        for (name, embed) in embeds {
            set.insert(name, embed_to_storage(&embed)?);
        }

        if is_new {
            return Ok(set);
        }

        let unset = definition
            .fields()
            .keys()
            .filter(|name| modified.get(*name).is_some_and(Value::is_null))
            .map(|name| (name.clone(), Bson::Int32(1)))
            .collect::<bson::Document>();

        let mut query = bson::Document::new();
        if !set.is_empty() {
            query.insert("$set", set);
        }
        if !unset.is_empty() {
            query.insert("$unset", unset);
        }

        Ok(query)
    }

    /// Calls a method contributed by one of the shape's extensions.
    pub fn call(&self, method: &str, args: Vec<Value>) -> DocumentStoreResult<Value> {
        self.definition()
            .document_method(method)?
            .call_document_method(method, self, args)
    }

    /// Saves this document through the repository of its shape.
    pub async fn save(&self) -> DocumentStoreResult<()> {
        self.container().repository(self.shape())?.save([self]).await
    }

    /// Deletes this document through the repository of its shape.
    pub async fn delete(&self) -> DocumentStoreResult<()> {
        self.container().repository(self.shape())?.delete([self]).await
    }
}

fn expected(cardinality: Cardinality) -> &'static str {
    match cardinality {
        Cardinality::One => "a document",
        Cardinality::Many => "a group",
    }
}

fn into_map(name: &str, value: Value) -> DocumentStoreResult<IndexMap<String, Value>> {
    match value {
        Value::Map(map) => Ok(map),
        other => Err(DocumentStoreError::InvalidArgument(format!(
            "the embed \"{name}\" expects a map, got {}",
            other.kind()
        ))),
    }
}

fn embed_to_storage(embed: &Data) -> DocumentStoreResult<Bson> {
    match embed {
        Data::Document(document) => Ok(Bson::Document(document.to_storage()?)),
        Data::Group(group) => group
            .iter()
            .map(|element| element.to_storage().map(Bson::Document))
            .collect::<DocumentStoreResult<Vec<_>>>()
            .map(Bson::Array),
        Data::Value(_) => Ok(Bson::Null),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bson::doc;

    use super::*;
    use crate::{
        definition::{Definition, ShapeKind},
        types::TypeRegistry,
    };

    fn container() -> Container {
        let container = Container::new(TypeRegistry::new());
        container
            .register_with("Article", ShapeKind::Document, |definition: &mut Definition| {
                definition
                    .add_field("title", "string")?
                    .add_field("content", "string")?
                    .add_field_with_default("is_active", "boolean", true)?
                    .add_field("author_id", "id")?
                    .add_field("category_ids", "raw")?
                    .add_reference("author", "Author", "author_id", Cardinality::One)?
                    .add_reference("categories", "Category", "category_ids", Cardinality::Many)?
                    .add_embed("source", "Source", Cardinality::One)?
                    .add_embed("comments", "Comment", Cardinality::Many)?
                    .add_relation("votes", "Vote", "article_id", Cardinality::Many)?;
                Ok(())
            })
            .unwrap();
        container
            .register_with("Author", ShapeKind::Document, |definition: &mut Definition| {
                definition.add_field("name", "string")?;
                Ok(())
            })
            .unwrap();
        container
            .register_with("Category", ShapeKind::Document, |definition: &mut Definition| {
                definition.add_field("name", "string")?;
                Ok(())
            })
            .unwrap();
        container
            .register_with("Source", ShapeKind::Embedded, |definition: &mut Definition| {
                definition
                    .add_field("name", "string")?
                    .add_field("url", "string")?
                    .add_embed("info", "Info", Cardinality::One)?;
                Ok(())
            })
            .unwrap();
        container
            .register_with("Info", ShapeKind::Embedded, |definition: &mut Definition| {
                definition.add_field("note", "string")?;
                Ok(())
            })
            .unwrap();
        container
            .register_with("Comment", ShapeKind::Embedded, |definition: &mut Definition| {
                definition.add_field("text", "string")?;
                Ok(())
            })
            .unwrap();
        container
    }

    fn article(container: &Container) -> Document {
        let article = container.create("Article").unwrap();
        article.clear_modified();
        article
    }

    #[test]
    fn defaults_start_modified() {
        let container = container();
        let article = container.create("Article").unwrap();

        assert_eq!(article.value("is_active").unwrap(), Value::Bool(true));
        assert_eq!(article.value("title").unwrap(), Value::Null);
        assert!(article.is_modified());
        assert_eq!(article.fields_modified()["is_active"], Value::Null);

        article.clear_modified();
        assert!(!article.is_modified());
    }

    #[test]
    fn reverting_to_the_baseline_cancels_tracking() {
        let container = container();
        let article = article(&container);

        article.set("title", "v0").unwrap();
        article.clear_modified();

        article.set("title", "v1").unwrap();
        assert!(article.is_field_modified("title"));
        article.set("title", "v2").unwrap();
        assert_eq!(article.fields_modified()["title"], Value::from("v0"));
        article.set("title", "v0").unwrap();

        assert!(!article.is_field_modified("title"));
        assert!(!article.is_modified());
    }

    #[test]
    fn setting_the_current_value_is_not_a_change() {
        let container = container();
        let article = article(&container);

        article.set("title", Value::Null).unwrap();

        assert!(!article.is_modified());
    }

    #[test]
    fn revert_restores_previous_values() {
        let container = container();
        let article = article(&container);
        article.set("title", "saved").unwrap();
        article.clear_modified();

        article.set("title", "changed").unwrap();
        article.set("content", "new").unwrap();
        article.revert_fields_modified();

        assert_eq!(article.value("title").unwrap(), Value::from("saved"));
        assert_eq!(article.value("content").unwrap(), Value::Null);
        assert!(!article.is_modified());
    }

    #[test]
    fn unknown_names_are_not_found() {
        let container = container();
        let article = article(&container);

        assert!(matches!(
            article.set("nope", "x"),
            Err(DocumentStoreError::NotFound("field", _))
        ));
        assert!(matches!(
            article.value("nope"),
            Err(DocumentStoreError::NotFound("field", _))
        ));
        assert!(matches!(
            article.set("votes", Group::new()),
            Err(DocumentStoreError::InvalidOperation(_))
        ));
    }

    #[test]
    fn embedded_changes_reach_the_parent() {
        let container = container();
        let article = article(&container);

        let source = article.embedded("source").unwrap().into_document().unwrap();
        assert!(!article.is_modified());

        source.set("name", "wiki").unwrap();
        assert!(article.is_modified());
        assert!(article.fields_modified().is_empty());

        article.clear_modified();
        assert!(!source.is_modified());
        assert!(!article.is_modified());
    }

    #[test]
    fn embeds_are_materialized_once() {
        let container = container();
        let article = article(&container);

        let first = article.embedded("source").unwrap();
        let second = article.embedded("source").unwrap();
        assert_eq!(first, second);

        let comments = article.embedded("comments").unwrap().into_group().unwrap();
        assert!(comments.is_empty());
    }

    #[test]
    fn embeds_check_shape_and_kind() {
        let container = container();
        let article = article(&container);
        let author = container.create("Author").unwrap();

        assert!(matches!(
            article.set("source", &author),
            Err(DocumentStoreError::InvalidArgument(_))
        ));
        assert!(matches!(
            article.set("source", Group::new()),
            Err(DocumentStoreError::InvalidArgument(_))
        ));
        assert!(matches!(
            article.set("comments", Group::with_elements([author])),
            Err(DocumentStoreError::InvalidArgument(_))
        ));
    }

    #[test]
    fn references_write_their_foreign_key() {
        let container = container();
        let article = article(&container);
        let author = container.create("Author").unwrap();
        let id = ObjectId::new();
        author.set_id(id);

        article.set("author", &author).unwrap();

        assert_eq!(article.value("author_id").unwrap(), Value::from(id));
        assert!(article.is_field_modified("author_id"));

        let category = container.create("Category").unwrap();
        assert!(matches!(
            article.set("author", &category),
            Err(DocumentStoreError::InvalidArgument(_))
        ));
    }

    #[test]
    fn reference_groups_keep_the_foreign_key_in_sync() {
        let container = container();
        let article = article(&container);
        let ids = [ObjectId::new(), ObjectId::new()];
        let categories = ids
            .iter()
            .map(|id| {
                let category = container.create("Category").unwrap();
                category.set_id(*id);
                category
            })
            .collect::<Vec<_>>();

        let group = Group::with_elements([categories[0].clone()]);
        article.set("categories", &group).unwrap();
        assert_eq!(
            article.value("category_ids").unwrap(),
            Value::Array(vec![Value::Raw(Bson::ObjectId(ids[0]))])
        );

        group.add(categories[1].clone()).unwrap();
        assert_eq!(
            article.value("category_ids").unwrap(),
            Value::Array(vec![Value::Raw(Bson::ObjectId(ids[0])), Value::Raw(Bson::ObjectId(ids[1]))])
        );

        group.remove(0).unwrap();
        assert_eq!(
            article.value("category_ids").unwrap(),
            Value::Array(vec![Value::Raw(Bson::ObjectId(ids[1]))])
        );
    }

    #[test]
    fn setters_and_getters_override_fields() {
        let container = Container::new(TypeRegistry::new());
        container
            .register_with("Tag", ShapeKind::Document, |definition: &mut Definition| {
                definition
                    .add_field("name", "string")?
                    .add_setter("name", |document, value| {
                        let name = value.as_str().unwrap_or_default().to_lowercase();
                        document.set_raw("name", name)
                    })?
                    .add_getter("name", |document| {
                        let name = document.raw_value("name")?;
                        Ok(Value::from(format!("#{}", name.as_str().unwrap_or_default())))
                    })?;
                Ok(())
            })
            .unwrap();

        let tag = container.create("Tag").unwrap();
        tag.set("name", "Rust").unwrap();

        assert_eq!(tag.raw_value("name").unwrap(), Value::from("rust"));
        assert_eq!(tag.value("name").unwrap(), Value::from("#rust"));
    }

    #[test]
    fn new_documents_save_their_modified_fields() {
        let container = container();
        let article = article(&container);
        article.set("title", "A").unwrap();

        assert_eq!(article.query_for_save().unwrap(), doc! { "title": "A" });

        let fresh = container.create("Article").unwrap();
        fresh.set("content", "c").unwrap();
        assert_eq!(
            fresh.query_for_save().unwrap(),
            doc! { "content": "c", "is_active": true }
        );
    }

    #[test]
    fn saved_documents_produce_operators() {
        let container = container();
        let article = article(&container);
        article.set("title", "A").unwrap();
        article.set("content", "body").unwrap();
        article.set_id(ObjectId::new());
        article.clear_modified();

        assert!(article.query_for_save().unwrap().is_empty());

        article.set("title", Value::Null).unwrap();
        assert_eq!(
            article.query_for_save().unwrap(),
            doc! { "$unset": { "title": 1 } }
        );

        article.set("title", "B").unwrap();
        article.set("content", Value::Null).unwrap();
        assert_eq!(
            article.query_for_save().unwrap(),
            doc! { "$set": { "title": "B" }, "$unset": { "content": 1 } }
        );
    }

    #[test]
    fn embeds_are_written_whole() {
        let container = container();
        let article = article(&container);
        article.set("title", "A").unwrap();

        let source = article.embedded("source").unwrap().into_document().unwrap();
        source.set("name", "wiki").unwrap();
        let info = source.embedded("info").unwrap().into_document().unwrap();
        info.set("note", "n").unwrap();

        let comments = article.embedded("comments").unwrap().into_group().unwrap();
        let comment = container.create("Comment").unwrap();
        comment.set("text", "first").unwrap();
        comments.add(comment).unwrap();
        comments.add(container.create("Comment").unwrap()).unwrap();

        assert_eq!(
            article.query_for_save().unwrap(),
            doc! {
                "title": "A",
                "source": { "name": "wiki", "info": { "note": "n" } },
                "comments": [{ "text": "first" }, {}],
            }
        );

        article.set_id(ObjectId::new());
        article.clear_modified();
        source.set("url", "http://example.com").unwrap();

        assert_eq!(
            article.query_for_save().unwrap(),
            doc! {
                "$set": {
                    "source": { "name": "wiki", "url": "http://example.com", "info": { "note": "n" } },
                    "comments": [{ "text": "first" }, {}],
                }
            }
        );
    }

    #[test]
    fn hydration_resets_tracking() {
        let container = container();
        let article = container.create("Article").unwrap();
        let id = ObjectId::new();
        let author_id = ObjectId::new();

        article
            .set_data(doc! {
                "_id": id,
                "title": "Stored",
                "author_id": author_id,
                "source": { "name": "wiki" },
                "comments": [{ "text": "a" }, { "text": "b" }],
                "legacy": true,
            })
            .unwrap();

        assert_eq!(article.id(), Some(id));
        assert!(!article.is_modified());
        assert_eq!(article.value("title").unwrap(), Value::from("Stored"));
        assert_eq!(article.value("author_id").unwrap(), Value::from(author_id));
        assert_eq!(article.value("is_active").unwrap(), Value::Bool(true));

        let source = article.embedded("source").unwrap().into_document().unwrap();
        assert_eq!(source.value("name").unwrap(), Value::from("wiki"));
        let comments = article.embedded("comments").unwrap().into_group().unwrap();
        assert_eq!(comments.len(), 2);
        assert_eq!(
            comments.get(1).unwrap().value("text").unwrap(),
            Value::from("b")
        );
    }

    #[test]
    fn arrays_round_trip_fields_and_embeds() {
        let container = container();
        let article = article(&container);

        let data = IndexMap::from([
            ("title".to_string(), Value::from("T")),
            (
                "source".to_string(),
                Value::Map(IndexMap::from([("name".to_string(), Value::from("s"))])),
            ),
            (
                "comments".to_string(),
                Value::Array(vec![Value::Map(IndexMap::from([(
                    "text".to_string(),
                    Value::from("c"),
                )]))]),
            ),
        ]);
        article.from_array(data.clone()).unwrap();

        let mut expected = data;
        expected.insert("is_active".to_string(), Value::Bool(true));
        let mut exported = article.to_array();
        exported.sort_keys();
        expected.sort_keys();
        assert_eq!(exported, expected);

        assert!(matches!(
            article.from_array([("author", Value::Null)]),
            Err(DocumentStoreError::NotFound("field", _))
        ));
        assert_eq!(article.to_json()["title"], serde_json::json!("T"));
    }

    #[test]
    fn weak_handles_do_not_keep_documents_alive() {
        let container = container();
        let article = article(&container);
        let weak = article.downgrade();

        assert!(weak.upgrade().unwrap().ptr_eq(&article));
        drop(article);
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn documents_need_closed_definitions() {
        let definition = Arc::new(Definition::document("Open"));

        assert!(matches!(
            Document::new(definition, Container::new(TypeRegistry::new())),
            Err(DocumentStoreError::State(_))
        ));
    }
}

//! Native values held by documents.
//!
//! A [`Value`] is the in-memory representation of a field. Type converters registered in the
//! [`TypeRegistry`](crate::types::TypeRegistry) translate it to and from the storage
//! representation ([`Bson`]). Identifiers are kept in their portable form, a 24-character
//! hexadecimal string, so they can be compared and printed without touching the storage layer.

use std::{fmt, sync::Arc};

use bson::{Binary, Bson, oid::ObjectId, ser::serialize_to_bson, spec::BinarySubtype};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::Serialize;

use crate::{
    backend::StoreBackend,
    error::{DocumentStoreError, DocumentStoreResult},
};

/// A dynamically typed native value.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    DateTime(DateTime<Utc>),
    Bytes(Vec<u8>),
    Array(Vec<Value>),
    Map(IndexMap<String, Value>),
    /// A handle onto a stored binary large object.
    File(FileHandle),
    /// A storage value with no native counterpart, kept as-is.
    Raw(Bson),
}

impl Value {
    /// Returns `true` if this is [`Value::Null`].
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Returns a short name of the variant, used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Int(_) => "integer",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::DateTime(_) => "date",
            Value::Bytes(_) => "bytes",
            Value::Array(_) => "array",
            Value::Map(_) => "map",
            Value::File(_) => "file",
            Value::Raw(_) => "raw",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(value) => Some(*value),
            Value::Int(value) => Some(*value as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_datetime(&self) -> Option<&DateTime<Utc>> {
        match self {
            Value::DateTime(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(values) => Some(values),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&IndexMap<String, Value>> {
        match self {
            Value::Map(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_file(&self) -> Option<&FileHandle> {
        match self {
            Value::File(handle) => Some(handle),
            _ => None,
        }
    }

    /// Reads this value as a storage identifier.
    ///
    /// Accepts the portable hexadecimal form as well as a raw storage identifier.
    ///
    /// # Errors
    ///
    /// Returns [`DocumentStoreError::InvalidArgument`] for any other value or a malformed string.
    pub fn to_object_id(&self) -> DocumentStoreResult<ObjectId> {
        match self {
            Value::String(hex) => parse_object_id(hex),
            Value::Raw(Bson::ObjectId(id)) => Ok(*id),
            Value::File(handle) => Ok(handle.id()),
            other => Err(DocumentStoreError::InvalidArgument(format!(
                "expected an identifier, got {}",
                other.kind()
            ))),
        }
    }

    /// Converts the value into BSON without any type-specific transformation.
    pub fn to_bson(&self) -> Bson {
        match self {
            Value::Null => Bson::Null,
            Value::Bool(value) => Bson::Boolean(*value),
            Value::Int(value) => Bson::Int64(*value),
            Value::Float(value) => Bson::Double(*value),
            Value::String(value) => Bson::String(value.clone()),
            Value::DateTime(value) => Bson::DateTime(bson::DateTime::from_chrono(*value)),
            Value::Bytes(bytes) => Bson::Binary(Binary {
                subtype: BinarySubtype::Generic,
                bytes: bytes.clone(),
            }),
            Value::Array(values) => Bson::Array(values.iter().map(Value::to_bson).collect()),
            Value::Map(map) => Bson::Document(
                map.iter()
                    .map(|(key, value)| (key.clone(), value.to_bson()))
                    .collect(),
            ),
            Value::File(handle) => Bson::ObjectId(handle.id()),
            Value::Raw(bson) => bson.clone(),
        }
    }

    /// Builds a native value from BSON without any type-specific transformation.
    ///
    /// Storage types without a native counterpart (identifiers, timestamps, regexes...) are
    /// kept as [`Value::Raw`] so that writing them back is lossless.
    pub fn from_bson(bson: &Bson) -> Value {
        match bson {
            Bson::Null | Bson::Undefined => Value::Null,
            Bson::Boolean(value) => Value::Bool(*value),
            Bson::Int32(value) => Value::Int(*value as i64),
            Bson::Int64(value) => Value::Int(*value),
            Bson::Double(value) => Value::Float(*value),
            Bson::String(value) => Value::String(value.clone()),
            Bson::DateTime(value) => Value::DateTime(value.to_chrono()),
            Bson::Binary(binary) if binary.subtype == BinarySubtype::Generic => {
                Value::Bytes(binary.bytes.clone())
            }
            Bson::Array(values) => Value::Array(values.iter().map(Value::from_bson).collect()),
            Bson::Document(document) => Value::Map(
                document
                    .iter()
                    .map(|(key, value)| (key.clone(), Value::from_bson(value)))
                    .collect(),
            ),
            other => Value::Raw(other.clone()),
        }
    }

    /// Exports the value as relaxed extended JSON.
    pub fn to_json(&self) -> serde_json::Value {
        self.to_bson().into_relaxed_extjson()
    }

    /// Builds a value from JSON.
    ///
    /// # Errors
    ///
    /// Returns [`DocumentStoreError::Serialization`] if the JSON uses an invalid extended JSON form.
    pub fn from_json(json: serde_json::Value) -> DocumentStoreResult<Value> {
        let bson = Bson::try_from(json)
            .map_err(|e| DocumentStoreError::Serialization(e.to_string()))?;

        Ok(Value::from_bson(&bson))
    }

    /// Builds a value from any serializable type.
    ///
    /// # Example
    ///
    /// ```ignore
    /// #[derive(Serialize)]
    /// struct Options { pages: i64 }
    ///
    /// let value = Value::from_serialize(&Options { pages: 3 })?;
    /// ```
    pub fn from_serialize<T: Serialize + ?Sized>(value: &T) -> DocumentStoreResult<Value> {
        Ok(Value::from_bson(&serialize_to_bson(value)?))
    }

    /// Renders the value as a map key, used when re-keying result sets.
    pub fn to_key(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::String(value) => value.clone(),
            Value::Bool(value) => value.to_string(),
            Value::Int(value) => value.to_string(),
            Value::Float(value) => value.to_string(),
            Value::DateTime(value) => value.to_rfc3339(),
            Value::File(handle) => handle.id().to_hex(),
            Value::Raw(Bson::ObjectId(id)) => id.to_hex(),
            other => other.to_json().to_string(),
        }
    }
}

pub(crate) fn parse_object_id(hex: &str) -> DocumentStoreResult<ObjectId> {
    ObjectId::parse_str(hex).map_err(|e| {
        DocumentStoreError::InvalidArgument(format!("\"{hex}\" is not a valid identifier: {e}"))
    })
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Int(value as i64)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(value: DateTime<Utc>) -> Self {
        Value::DateTime(value)
    }
}

impl From<ObjectId> for Value {
    fn from(value: ObjectId) -> Self {
        Value::String(value.to_hex())
    }
}

impl From<Vec<Value>> for Value {
    fn from(values: Vec<Value>) -> Self {
        Value::Array(values)
    }
}

impl From<IndexMap<String, Value>> for Value {
    fn from(map: IndexMap<String, Value>) -> Self {
        Value::Map(map)
    }
}

impl From<FileHandle> for Value {
    fn from(handle: FileHandle) -> Self {
        Value::File(handle)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Value::Null)
    }
}

/// A lazy handle onto a file kept in a backend's binary large-object store.
///
/// The bytes are only read when [`FileHandle::bytes`] is awaited.
#[derive(Clone)]
pub struct FileHandle {
    id: ObjectId,
    length: u64,
    collection: String,
    backend: Arc<dyn StoreBackend>,
}

impl FileHandle {
    pub fn new(
        id: ObjectId,
        length: u64,
        collection: impl Into<String>,
        backend: Arc<dyn StoreBackend>,
    ) -> Self {
        Self {
            id,
            length,
            collection: collection.into(),
            backend,
        }
    }

    /// The identifier of the stored file, shared with the owning document.
    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// Size of the stored file in bytes.
    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Reads the whole file from the backend.
    ///
    /// # Errors
    ///
    /// Returns the backend error if the file no longer exists or cannot be read.
    pub async fn bytes(&self) -> DocumentStoreResult<Vec<u8>> {
        self.backend.read_file(&self.collection, self.id).await
    }
}

impl fmt::Debug for FileHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileHandle")
            .field("id", &self.id)
            .field("length", &self.length)
            .field("collection", &self.collection)
            .finish()
    }
}

impl PartialEq for FileHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.collection == other.collection
    }
}

//! Type converters and the registry that names them.
//!
//! Every declared field has a type name. At close time a [`Definition`](crate::definition::Definition)
//! resolves each name through a [`TypeRegistry`] into a [`Type`] converter, which transforms the
//! field's value between its native form ([`Value`]) and its storage form ([`Bson`]).
//!
//! # Built-in types
//!
//! | Name      | Native                          | Storage                 |
//! |-----------|---------------------------------|-------------------------|
//! | `string`  | `String`                        | string                  |
//! | `integer` | `Int`                           | 64-bit integer          |
//! | `float`   | `Float`                         | double                  |
//! | `boolean` | `Bool`                          | boolean                 |
//! | `raw`     | anything                        | passthrough             |
//! | `array`   | `Array` / `Map`                 | opaque binary blob      |
//! | `id`      | hexadecimal `String`            | object id               |
//! | `date`    | `DateTime`                      | date time               |
//! | `binary`  | `Bytes`                         | generic binary          |
//! | `file`    | path `String`, `Bytes` / `File` | binary large object     |

use std::{
    collections::HashMap,
    fmt::Debug,
    sync::{Arc, LazyLock},
};

use bson::{
    Binary, Bson, de::deserialize_from_slice, doc, ser::serialize_to_vec, spec::BinarySubtype,
};
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use parking_lot::RwLock;

use crate::{
    error::{DocumentStoreError, DocumentStoreResult},
    value::{Value, parse_object_id},
};

/// A converter between the native and the storage representation of a field.
///
/// Converters never see nulls: a null field is stored as null (or unset) without
/// consulting its type.
pub trait Type: Send + Sync + Debug {
    /// Transforms a native value into its storage form.
    fn to_storage(&self, value: &Value) -> DocumentStoreResult<Bson>;

    /// Transforms a storage value into its native form.
    fn to_native(&self, value: &Bson) -> DocumentStoreResult<Value>;

    /// Whether fields of this type live in the binary large-object store.
    fn is_file(&self) -> bool {
        false
    }
}

/// A shared reference to a registered converter.
pub type TypeRef = Arc<dyn Type>;

fn unsupported(type_name: &str, value: impl Debug) -> DocumentStoreError {
    DocumentStoreError::InvalidArgument(format!("cannot convert {value:?} with the {type_name} type"))
}

#[derive(Debug)]
pub struct StringType;

impl Type for StringType {
    fn to_storage(&self, value: &Value) -> DocumentStoreResult<Bson> {
        Ok(Bson::String(match value {
            Value::String(value) => value.clone(),
            Value::Int(value) => value.to_string(),
            Value::Float(value) => value.to_string(),
            Value::Bool(value) => value.to_string(),
            other => return Err(unsupported("string", other.kind())),
        }))
    }

    fn to_native(&self, value: &Bson) -> DocumentStoreResult<Value> {
        Ok(Value::String(match value {
            Bson::String(value) => value.clone(),
            Bson::Int32(value) => value.to_string(),
            Bson::Int64(value) => value.to_string(),
            Bson::Double(value) => value.to_string(),
            Bson::Boolean(value) => value.to_string(),
            other => return Err(unsupported("string", other)),
        }))
    }
}

#[derive(Debug)]
pub struct IntegerType;

impl Type for IntegerType {
    fn to_storage(&self, value: &Value) -> DocumentStoreResult<Bson> {
        Ok(Bson::Int64(match value {
            Value::Int(value) => *value,
            Value::Float(value) => value.trunc() as i64,
            Value::Bool(value) => *value as i64,
            Value::String(text) => text
                .trim()
                .parse()
                .map_err(|_| unsupported("integer", text))?,
            other => return Err(unsupported("integer", other.kind())),
        }))
    }

    fn to_native(&self, value: &Bson) -> DocumentStoreResult<Value> {
        Ok(Value::Int(match value {
            Bson::Int32(value) => *value as i64,
            Bson::Int64(value) => *value,
            Bson::Double(value) => value.trunc() as i64,
            Bson::String(text) => text
                .trim()
                .parse()
                .map_err(|_| unsupported("integer", text))?,
            other => return Err(unsupported("integer", other)),
        }))
    }
}

#[derive(Debug)]
pub struct FloatType;

impl Type for FloatType {
    fn to_storage(&self, value: &Value) -> DocumentStoreResult<Bson> {
        Ok(Bson::Double(match value {
            Value::Float(value) => *value,
            Value::Int(value) => *value as f64,
            Value::String(text) => text
                .trim()
                .parse()
                .map_err(|_| unsupported("float", text))?,
            other => return Err(unsupported("float", other.kind())),
        }))
    }

    fn to_native(&self, value: &Bson) -> DocumentStoreResult<Value> {
        Ok(Value::Float(match value {
            Bson::Double(value) => *value,
            Bson::Int32(value) => *value as f64,
            Bson::Int64(value) => *value as f64,
            other => return Err(unsupported("float", other)),
        }))
    }
}

#[derive(Debug)]
pub struct BooleanType;

impl BooleanType {
    fn parse(text: &str) -> Option<bool> {
        match text.trim() {
            "true" | "1" => Some(true),
            "false" | "0" | "" => Some(false),
            _ => None,
        }
    }
}

impl Type for BooleanType {
    fn to_storage(&self, value: &Value) -> DocumentStoreResult<Bson> {
        Ok(Bson::Boolean(match value {
            Value::Bool(value) => *value,
            Value::Int(value) => *value != 0,
            Value::String(text) => Self::parse(text).ok_or_else(|| unsupported("boolean", text))?,
            other => return Err(unsupported("boolean", other.kind())),
        }))
    }

    fn to_native(&self, value: &Bson) -> DocumentStoreResult<Value> {
        Ok(Value::Bool(match value {
            Bson::Boolean(value) => *value,
            Bson::Int32(value) => *value != 0,
            Bson::Int64(value) => *value != 0,
            other => return Err(unsupported("boolean", other)),
        }))
    }
}

/// Stores the value as it is.
#[derive(Debug)]
pub struct RawType;

impl Type for RawType {
    fn to_storage(&self, value: &Value) -> DocumentStoreResult<Bson> {
        Ok(value.to_bson())
    }

    fn to_native(&self, value: &Bson) -> DocumentStoreResult<Value> {
        Ok(Value::from_bson(value))
    }
}

/// Stores arrays and maps as an opaque blob, so their content is not queryable.
#[derive(Debug)]
pub struct ArrayType;

impl Type for ArrayType {
    fn to_storage(&self, value: &Value) -> DocumentStoreResult<Bson> {
        match value {
            Value::Array(_) | Value::Map(_) => Ok(Bson::Binary(Binary {
                subtype: BinarySubtype::Generic,
                bytes: serialize_to_vec(&doc! { "v": value.to_bson() })?,
            })),
            other => Err(unsupported("array", other.kind())),
        }
    }

    fn to_native(&self, value: &Bson) -> DocumentStoreResult<Value> {
        match value {
            Bson::Binary(binary) => {
                let document: bson::Document = deserialize_from_slice(&binary.bytes)?;

                document
                    .get("v")
                    .map(Value::from_bson)
                    .ok_or_else(|| DocumentStoreError::InvalidDocument("malformed array blob".into()))
            }
            other => Err(unsupported("array", other)),
        }
    }
}

/// Converts between the portable hexadecimal identifier and the storage identifier.
#[derive(Debug)]
pub struct IdType;

impl Type for IdType {
    fn to_storage(&self, value: &Value) -> DocumentStoreResult<Bson> {
        Ok(Bson::ObjectId(value.to_object_id()?))
    }

    fn to_native(&self, value: &Bson) -> DocumentStoreResult<Value> {
        match value {
            Bson::ObjectId(id) => Ok(Value::String(id.to_hex())),
            Bson::String(hex) => Ok(Value::String(parse_object_id(hex)?.to_hex())),
            other => Err(unsupported("id", other)),
        }
    }
}

/// Accepts dates, Unix timestamps in seconds, RFC 3339 strings and `YYYY-MM-DD` strings.
///
/// Storage dates have millisecond precision.
#[derive(Debug)]
pub struct DateType;

impl DateType {
    fn parse(text: &str) -> Option<DateTime<Utc>> {
        if let Ok(date) = DateTime::parse_from_rfc3339(text) {
            return Some(date.with_timezone(&Utc));
        }

        NaiveDate::parse_from_str(text, "%Y-%m-%d")
            .ok()
            .and_then(|date| date.and_hms_opt(0, 0, 0))
            .map(|date| date.and_utc())
    }
}

impl Type for DateType {
    fn to_storage(&self, value: &Value) -> DocumentStoreResult<Bson> {
        let date = match value {
            Value::DateTime(date) => *date,
            Value::Int(timestamp) => Utc
                .timestamp_opt(*timestamp, 0)
                .single()
                .ok_or_else(|| unsupported("date", timestamp))?,
            Value::String(text) => Self::parse(text).ok_or_else(|| unsupported("date", text))?,
            other => return Err(unsupported("date", other.kind())),
        };

        Ok(Bson::DateTime(bson::DateTime::from_chrono(date)))
    }

    fn to_native(&self, value: &Bson) -> DocumentStoreResult<Value> {
        match value {
            Bson::DateTime(date) => Ok(Value::DateTime(date.to_chrono())),
            other => Err(unsupported("date", other)),
        }
    }
}

#[derive(Debug)]
pub struct BinaryType;

impl Type for BinaryType {
    fn to_storage(&self, value: &Value) -> DocumentStoreResult<Bson> {
        match value {
            Value::Bytes(bytes) => Ok(Bson::Binary(Binary {
                subtype: BinarySubtype::Generic,
                bytes: bytes.clone(),
            })),
            Value::String(text) => Ok(Bson::Binary(Binary {
                subtype: BinarySubtype::Generic,
                bytes: text.as_bytes().to_vec(),
            })),
            other => Err(unsupported("binary", other.kind())),
        }
    }

    fn to_native(&self, value: &Bson) -> DocumentStoreResult<Value> {
        match value {
            Bson::Binary(binary) => Ok(Value::Bytes(binary.bytes.clone())),
            other => Err(unsupported("binary", other)),
        }
    }
}

/// Content of the binary large-object store.
///
/// On write a string is read as a filesystem path and bytes are taken as they are. On read
/// repositories expose a [`FileHandle`](crate::value::FileHandle) instead of calling
/// [`Type::to_native`].
#[derive(Debug)]
pub struct FileType;

impl Type for FileType {
    fn to_storage(&self, value: &Value) -> DocumentStoreResult<Bson> {
        let bytes = match value {
            Value::Bytes(bytes) => bytes.clone(),
            Value::String(path) => std::fs::read(path).map_err(|e| {
                DocumentStoreError::InvalidArgument(format!("cannot read file \"{path}\": {e}"))
            })?,
            Value::File(_) => {
                return Err(DocumentStoreError::InvalidOperation(
                    "a stored file cannot be written again".into(),
                ));
            }
            other => return Err(unsupported("file", other.kind())),
        };

        Ok(Bson::Binary(Binary {
            subtype: BinarySubtype::Generic,
            bytes,
        }))
    }

    fn to_native(&self, value: &Bson) -> DocumentStoreResult<Value> {
        match value {
            Bson::Binary(binary) => Ok(Value::Bytes(binary.bytes.clone())),
            other => Err(unsupported("file", other)),
        }
    }

    fn is_file(&self) -> bool {
        true
    }
}

static GLOBAL: LazyLock<TypeRegistry> = LazyLock::new(TypeRegistry::new);

/// A mapping from type name to converter.
///
/// Cloning a registry yields a handle onto the same table. Reads take a shared lock, so
/// the registry can be consulted concurrently once set up; [`TypeRegistry::register`] and
/// [`TypeRegistry::unregister`] are meant for setup time.
///
/// # Example
///
/// ```ignore
/// let types = TypeRegistry::new();
/// types.register("slug", SlugType)?;
///
/// let converter = types.get("slug")?;
/// ```
#[derive(Debug, Clone)]
pub struct TypeRegistry {
    types: Arc<RwLock<HashMap<String, TypeRef>>>,
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TypeRegistry {
    /// Creates a registry holding the built-in types.
    pub fn new() -> Self {
        Self {
            types: Arc::new(RwLock::new(Self::builtins())),
        }
    }

    /// The process-wide registry used by [`Container::new`](crate::container::Container::new).
    pub fn global() -> TypeRegistry {
        GLOBAL.clone()
    }

    fn builtins() -> HashMap<String, TypeRef> {
        let builtins: [(&str, TypeRef); 10] = [
            ("string", Arc::new(StringType)),
            ("integer", Arc::new(IntegerType)),
            ("float", Arc::new(FloatType)),
            ("boolean", Arc::new(BooleanType)),
            ("raw", Arc::new(RawType)),
            ("array", Arc::new(ArrayType)),
            ("id", Arc::new(IdType)),
            ("date", Arc::new(DateType)),
            ("binary", Arc::new(BinaryType)),
            ("file", Arc::new(FileType)),
        ];

        builtins
            .into_iter()
            .map(|(name, converter)| (name.to_string(), converter))
            .collect()
    }

    /// Registers a converter under `name`.
    ///
    /// # Errors
    ///
    /// Returns [`DocumentStoreError::InvalidArgument`] if the name is already registered.
    pub fn register(&self, name: impl Into<String>, converter: impl Type + 'static) -> DocumentStoreResult<()> {
        let name = name.into();
        let mut types = self.types.write();

        if types.contains_key(&name) {
            return Err(DocumentStoreError::InvalidArgument(format!(
                "the type \"{name}\" already exists"
            )));
        }

        types.insert(name, Arc::new(converter));

        Ok(())
    }

    /// Looks up the converter registered under `name`.
    ///
    /// # Errors
    ///
    /// Returns [`DocumentStoreError::NotFound`] if the name is not registered.
    pub fn get(&self, name: &str) -> DocumentStoreResult<TypeRef> {
        self.types
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| DocumentStoreError::not_found("type", name))
    }

    pub fn has(&self, name: &str) -> bool {
        self.types.read().contains_key(name)
    }

    /// Removes a converter and returns it, if it was registered.
    pub fn unregister(&self, name: &str) -> Option<TypeRef> {
        self.types.write().remove(name)
    }

    /// Restores the built-in set, dropping every custom converter.
    pub fn reset(&self) {
        *self.types.write() = Self::builtins();
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names = self.types.read().keys().cloned().collect::<Vec<_>>();
        names.sort();
        names
    }
}

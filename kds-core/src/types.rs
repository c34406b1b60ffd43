use crate::{Entity, Error, Key, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a single path element: an integer id or a string name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IdOrName {
    Id(i64),
    Name(String),
}

impl IdOrName {
    pub fn as_id(&self) -> Option<i64> {
        match self {
            IdOrName::Id(id) => Some(*id),
            IdOrName::Name(_) => None,
        }
    }

    pub fn as_name(&self) -> Option<&str> {
        match self {
            IdOrName::Name(name) => Some(name),
            IdOrName::Id(_) => None,
        }
    }

    /// Zero ids and empty names do not identify anything; a path element
    /// carrying one would read as partial.
    pub(crate) fn validated(self) -> Result<Self> {
        match &self {
            IdOrName::Id(0) => Err(Error::construction("id must be a non-zero integer")),
            IdOrName::Name(name) if name.is_empty() => {
                Err(Error::construction("name must be a non-empty string"))
            }
            _ => Ok(self),
        }
    }
}

impl fmt::Display for IdOrName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdOrName::Id(id) => write!(f, "{}", id),
            IdOrName::Name(name) => write!(f, "{:?}", name),
        }
    }
}

impl From<i64> for IdOrName {
    fn from(id: i64) -> Self {
        IdOrName::Id(id)
    }
}

impl From<i32> for IdOrName {
    fn from(id: i32) -> Self {
        IdOrName::Id(id as i64)
    }
}

impl From<&str> for IdOrName {
    fn from(name: &str) -> Self {
        IdOrName::Name(name.to_string())
    }
}

impl From<String> for IdOrName {
    fn from(name: String) -> Self {
        IdOrName::Name(name)
    }
}

/// One flat key argument. Flat arguments alternate kind, identifier, kind,
/// identifier, ...; kinds must be strings, identifiers may be either.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathArg {
    Int(i64),
    Str(String),
}

impl From<&str> for PathArg {
    fn from(s: &str) -> Self {
        PathArg::Str(s.to_string())
    }
}

impl From<String> for PathArg {
    fn from(s: String) -> Self {
        PathArg::Str(s)
    }
}

impl From<i64> for PathArg {
    fn from(n: i64) -> Self {
        PathArg::Int(n)
    }
}

impl From<i32> for PathArg {
    fn from(n: i32) -> Self {
        PathArg::Int(n as i64)
    }
}

impl From<IdOrName> for PathArg {
    fn from(id_or_name: IdOrName) -> Self {
        match id_or_name {
            IdOrName::Id(id) => PathArg::Int(id),
            IdOrName::Name(name) => PathArg::Str(name),
        }
    }
}

impl From<PathArg> for IdOrName {
    fn from(arg: PathArg) -> Self {
        match arg {
            PathArg::Int(id) => IdOrName::Id(id),
            PathArg::Str(name) => IdOrName::Name(name),
        }
    }
}

/// Build a `Vec<PathArg>` from mixed string and integer literals.
///
/// ```
/// use kds_core::{key_path, PathArg};
/// let path = key_path!["Parent", 1, "Child", "bob"];
/// assert_eq!(path[1], PathArg::Int(1));
/// ```
#[macro_export]
macro_rules! key_path {
    ($($arg:expr),* $(,)?) => {
        vec![$($crate::PathArg::from($arg)),*]
    };
}

/// A single `{kind, id}`, `{kind, name}` or partial `{kind}` element.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PathElement {
    pub kind: String,
    pub id_or_name: Option<IdOrName>,
}

impl PathElement {
    pub fn id(&self) -> Option<i64> {
        self.id_or_name.as_ref().and_then(IdOrName::as_id)
    }

    pub fn name(&self) -> Option<&str> {
        self.id_or_name.as_ref().and_then(IdOrName::as_name)
    }

    pub fn is_partial(&self) -> bool {
        self.id_or_name.is_none()
    }
}

impl fmt::Display for PathElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.id_or_name {
            Some(id_or_name) => write!(f, "{}({})", self.kind, id_or_name),
            None => write!(f, "{}", self.kind),
        }
    }
}

/// Latitude/longitude pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoPoint {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }
}

/// Property value stored on an entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Integer(i64),
    Double(f64),
    /// Microseconds since the Unix epoch
    Timestamp(i64),
    String(String),
    Blob(Bytes),
    Key(Key),
    GeoPoint(GeoPoint),
    Array(Vec<Value>),
    Entity(Box<Entity>),
}

impl Value {
    pub fn string(s: impl Into<String>) -> Self {
        Value::String(s.into())
    }

    pub fn integer(n: i64) -> Self {
        Value::Integer(n)
    }

    pub fn blob(b: impl Into<Bytes>) -> Self {
        Value::Blob(b.into())
    }

    pub fn timestamp(micros: i64) -> Self {
        Value::Timestamp(micros)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_key(&self) -> Option<&Key> {
        match self {
            Value::Key(key) => Some(key),
            _ => None,
        }
    }

    pub fn as_entity(&self) -> Option<&Entity> {
        match self {
            Value::Entity(entity) => Some(entity),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Name of the variant, for diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Integer(_) => "integer",
            Value::Double(_) => "double",
            Value::Timestamp(_) => "timestamp",
            Value::String(_) => "string",
            Value::Blob(_) => "blob",
            Value::Key(_) => "key",
            Value::GeoPoint(_) => "geo_point",
            Value::Array(_) => "array",
            Value::Entity(_) => "entity",
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Integer(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Integer(n as i64)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Double(n)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<Bytes> for Value {
    fn from(b: Bytes) -> Self {
        Value::Blob(b)
    }
}

impl From<Key> for Value {
    fn from(key: Key) -> Self {
        Value::Key(key)
    }
}

impl From<GeoPoint> for Value {
    fn from(point: GeoPoint) -> Self {
        Value::GeoPoint(point)
    }
}

impl From<Entity> for Value {
    fn from(entity: Entity) -> Self {
        Value::Entity(Box::new(entity))
    }
}

impl From<Vec<Value>> for Value {
    fn from(values: Vec<Value>) -> Self {
        Value::Array(values)
    }
}

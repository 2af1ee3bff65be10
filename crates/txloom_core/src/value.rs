//! Tagged value model shared by records, parameters and audit payloads.
//!
//! # Responsibility
//! - Represent every in-memory field value as one explicit variant.
//! - Provide the `Record` field map used by every read and write path.
//!
//! # Invariants
//! - `Set` members are unique (enforced by `Value::set`).
//! - `Map` keeps insertion order and allows non-string keys.
//! - `Record` field order is by name, so rendered SQL is deterministic.

use chrono::{DateTime, Utc};
use serde::de::Deserializer;
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::codec::{deescape_from_json, escape_for_json};

/// Stable identifier of one record.
///
/// Kept as a type alias to make semantic intent explicit in signatures.
pub type RecordId = String;

/// One field value.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    /// UTC timestamp, persisted as RFC 3339 text.
    Date(DateTime<Utc>),
    /// Raw bytes, persisted as a blob.
    Binary(Vec<u8>),
    /// Unordered unique members.
    Set(Vec<Value>),
    /// Key/value pairs with arbitrary keys.
    Map(Vec<(Value, Value)>),
    /// Ordered list.
    Sequence(Vec<Value>),
    /// Nested object with string keys.
    Mapping(BTreeMap<String, Value>),
}

impl Value {
    /// Builds a `Set`, dropping duplicate members while keeping first-seen order.
    pub fn set(members: impl IntoIterator<Item = Value>) -> Self {
        let mut unique: Vec<Value> = Vec::new();
        for member in members {
            if !unique.contains(&member) {
                unique.push(member);
            }
        }
        Value::Set(unique)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(value) => Some(value.as_str()),
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

    pub fn as_date(&self) -> Option<DateTime<Utc>> {
        match self {
            Value::Date(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Binary(value) => Some(value.as_slice()),
            _ => None,
        }
    }

    /// Returns the members of a `Sequence` or `Set`.
    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::Sequence(items) | Value::Set(items) => Some(items.as_slice()),
            _ => None,
        }
    }

    pub fn as_mapping(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Mapping(fields) => Some(fields),
            _ => None,
        }
    }

    /// Renders a scalar as an identifier string.
    ///
    /// Returns `None` for composite, binary and null values.
    pub fn to_id(&self) -> Option<RecordId> {
        match self {
            Value::Text(value) => Some(value.clone()),
            Value::Int(value) => Some(value.to_string()),
            _ => None,
        }
    }

    /// Returns true for variants persisted as JSON text.
    pub fn is_composite(&self) -> bool {
        matches!(
            self,
            Value::Set(_) | Value::Map(_) | Value::Sequence(_) | Value::Mapping(_)
        )
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl From<&String> for Value {
    fn from(value: &String) -> Self {
        Value::Text(value.clone())
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Int(i64::from(value))
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
        Value::Date(value)
    }
}

impl From<Vec<u8>> for Value {
    fn from(value: Vec<u8>) -> Self {
        Value::Binary(value)
    }
}

impl From<Vec<Value>> for Value {
    fn from(value: Vec<Value>) -> Self {
        Value::Sequence(value)
    }
}

impl From<Record> for Value {
    fn from(value: Record) -> Self {
        Value::Mapping(value.0)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Value::Null, Into::into)
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        escape_for_json(self).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = serde_json::Value::deserialize(deserializer)?;
        Ok(deescape_from_json(raw))
    }
}

/// Field-name to value mapping for one entity record.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record(BTreeMap<String, Value>);

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(field.into(), value.into());
        self
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn insert(&mut self, field: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(field.into(), value.into())
    }

    pub fn remove(&mut self, field: &str) -> Option<Value> {
        self.0.remove(field)
    }

    pub fn contains(&self, field: &str) -> bool {
        self.0.contains_key(field)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(name, value)| (name.as_str(), value))
    }

    /// Reads the identity of this record from `id_field`.
    pub fn id(&self, id_field: &str) -> Option<RecordId> {
        self.0.get(id_field).and_then(Value::to_id)
    }

    /// Returns true when every field of `subset` is present here with an equal value.
    pub fn matches(&self, subset: &Record) -> bool {
        subset
            .iter()
            .all(|(field, value)| self.0.get(field) == Some(value))
    }

    pub fn into_inner(self) -> BTreeMap<String, Value> {
        self.0
    }
}

impl From<BTreeMap<String, Value>> for Record {
    fn from(value: BTreeMap<String, Value>) -> Self {
        Self(value)
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Record {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(field, value)| (field.into(), value.into()))
                .collect(),
        )
    }
}

impl IntoIterator for Record {
    type Item = (String, Value);
    type IntoIter = std::collections::btree_map::IntoIter<String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

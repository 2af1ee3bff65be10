//! JSON-safe value codec for audit payloads and JSON columns.
//!
//! # Responsibility
//! - Convert tagged values to JSON and back without losing dates, bytes,
//!   sets and maps.
//! - Prepare partial updates and audit payloads before they reach storage.
//!
//! # Invariants
//! - `deescape_from_json(escape_for_json(v)) == v` for every value without
//!   non-finite floats.
//! - Escaped wrappers are plain objects carrying a `__typename` tag, so the
//!   stored JSON stays readable by any JSON consumer.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Map as JsonMap, Number, Value as Json};
use std::collections::BTreeMap;

use crate::value::{Record, Value};

const TYPENAME_KEY: &str = "__typename";
const ESCAPED_DATE: &str = "EscapedDate";
const ESCAPED_BUFFER: &str = "EscapedBuffer";
const ESCAPED_SET: &str = "EscapedSet";
const ESCAPED_MAP: &str = "EscapedMap";

/// Formats a timestamp the way it is persisted everywhere in this crate.
pub fn format_timestamp(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

/// Parses a persisted RFC 3339 timestamp.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|parsed| parsed.with_timezone(&Utc))
}

/// Converts a value to its JSON-safe representation.
pub fn escape_for_json(value: &Value) -> Json {
    match value {
        Value::Null => Json::Null,
        Value::Bool(flag) => Json::Bool(*flag),
        Value::Int(number) => Json::Number(Number::from(*number)),
        Value::Float(number) => Number::from_f64(*number).map_or(Json::Null, Json::Number),
        Value::Text(text) => Json::String(text.clone()),
        Value::Date(date) => json!({
            TYPENAME_KEY: ESCAPED_DATE,
            "isoString": format_timestamp(date),
        }),
        Value::Binary(bytes) => json!({
            TYPENAME_KEY: ESCAPED_BUFFER,
            "base64Str": BASE64.encode(bytes),
        }),
        Value::Set(members) => json!({
            TYPENAME_KEY: ESCAPED_SET,
            "values": members.iter().map(escape_for_json).collect::<Vec<_>>(),
        }),
        Value::Map(entries) => json!({
            TYPENAME_KEY: ESCAPED_MAP,
            "values": entries
                .iter()
                .map(|(key, item)| Json::Array(vec![escape_for_json(key), escape_for_json(item)]))
                .collect::<Vec<_>>(),
        }),
        Value::Sequence(items) => Json::Array(items.iter().map(escape_for_json).collect()),
        Value::Mapping(fields) => Json::Object(
            fields
                .iter()
                .map(|(name, item)| (name.clone(), escape_for_json(item)))
                .collect(),
        ),
    }
}

/// Restores a value from its JSON-safe representation.
///
/// Tagged objects whose payload is malformed (unparseable date, invalid
/// base64, map entries that are not pairs) are kept as plain mappings.
pub fn deescape_from_json(raw: Json) -> Value {
    match raw {
        Json::Null => Value::Null,
        Json::Bool(flag) => Value::Bool(flag),
        Json::Number(number) => match number.as_i64() {
            Some(int) => Value::Int(int),
            None => Value::Float(number.as_f64().unwrap_or(f64::NAN)),
        },
        Json::String(text) => Value::Text(text),
        Json::Array(items) => Value::Sequence(items.into_iter().map(deescape_from_json).collect()),
        Json::Object(fields) => deescape_object(fields),
    }
}

fn deescape_object(fields: JsonMap<String, Json>) -> Value {
    let tag = fields.get(TYPENAME_KEY).and_then(Json::as_str);
    let restored = match tag {
        Some(ESCAPED_DATE) => fields
            .get("isoString")
            .and_then(Json::as_str)
            .and_then(parse_timestamp)
            .map(Value::Date),
        Some(ESCAPED_BUFFER) => fields
            .get("base64Str")
            .and_then(Json::as_str)
            .and_then(|encoded| BASE64.decode(encoded).ok())
            .map(Value::Binary),
        Some(ESCAPED_SET) => fields.get("values").and_then(Json::as_array).map(|members| {
            Value::set(members.iter().cloned().map(deescape_from_json))
        }),
        Some(ESCAPED_MAP) => fields
            .get("values")
            .and_then(Json::as_array)
            .and_then(|entries| deescape_map_entries(entries)),
        _ => None,
    };

    restored.unwrap_or_else(|| {
        Value::Mapping(
            fields
                .into_iter()
                .map(|(name, item)| (name, deescape_from_json(item)))
                .collect::<BTreeMap<_, _>>(),
        )
    })
}

fn deescape_map_entries(entries: &[Json]) -> Option<Value> {
    let mut pairs = Vec::with_capacity(entries.len());
    for entry in entries {
        match entry.as_array().map(Vec::as_slice) {
            Some([key, item]) => pairs.push((
                deescape_from_json(key.clone()),
                deescape_from_json(item.clone()),
            )),
            _ => return None,
        }
    }
    Some(Value::Map(pairs))
}

/// Drops top-level null fields from a partial update.
///
/// Null means "leave unchanged" on the update path, so a field cannot be
/// cleared through a partial update.
pub fn strip_nulls(record: Record) -> Record {
    record
        .into_iter()
        .filter(|(_, value)| !value.is_null())
        .collect()
}

/// Builds the change payload stored in the audit trail for one record.
///
/// Top-level binary fields are stored as plain base64 text.
pub fn audit_payload(record: &Record) -> Value {
    Value::Mapping(
        record
            .iter()
            .map(|(name, value)| {
                let stored = match value {
                    Value::Binary(bytes) => Value::Text(BASE64.encode(bytes)),
                    other => other.clone(),
                };
                (name.to_string(), stored)
            })
            .collect(),
    )
}

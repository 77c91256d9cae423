//! The value universe carried by Karton messages.
//!
//! [`Value`] is wider than JSON: it distinguishes `undefined` from `null`, keeps
//! non-finite numbers, dates, keyed/unkeyed collections and error objects.
//! On the wire it is written as "extended JSON": plain values stay plain, the
//! rest become single-key tag objects.
//!
//! | Value | Encoding |
//! |---|---|
//! | `Undefined` | `{"$undefined": true}` |
//! | `NaN`, `±Infinity`, `-0` | `{"$number": "NaN"}` ... |
//! | `Date` | `{"$date": "2024-01-01T00:00:00.000Z"}` |
//! | `Map` | `{"$map": [[key, value], ...]}` |
//! | `Set` | `{"$set": [item, ...]}` |
//! | `Error` | `{"$error": {"name": ..., "message": ..., ...extra}}` |
//! | object with a `$`-prefixed key | `{"$object": {...}}` |

use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::{self, DeserializeOwned};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map as JsonMap, Value as JsonValue};
use std::collections::BTreeMap;

use super::{ErrorObject, PathSegment};
use crate::{KartonError, KartonResult};

const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_991.0;

/// A dynamically typed value exchanged between peers
#[derive(Debug, Clone, Default)]
pub enum Value {
    #[default]
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Date(DateTime<Utc>),
    Array(Vec<Value>),
    Object(BTreeMap<String, Value>),
    /// Keyed collection; keys may be any value and keep insertion order.
    Map(Vec<(Value, Value)>),
    Set(Vec<Value>),
    Error(Box<ErrorObject>),
}

impl PartialEq for Value {
    /// Structural equality with same-value numbers: `NaN` equals `NaN` and
    /// `0` differs from `-0`.
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Undefined, Value::Undefined) | (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => same_number(*a, *b),
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Date(a), Value::Date(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a == b,
            (Value::Set(a), Value::Set(b)) => a == b,
            (Value::Error(a), Value::Error(b)) => a == b,
            _ => false,
        }
    }
}

impl Value {
    /// An empty object
    pub fn object() -> Self {
        Value::Object(BTreeMap::new())
    }

    /// Short type name used in diagnostics
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Date(_) => "date",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
            Value::Map(_) => "map",
            Value::Set(_) => "set",
            Value::Error(_) => "error",
        }
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// The boolean, if this is one
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// The number as `f64`, if this is one
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// The number as an integer, if it is finite and has no fractional part
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Number(n) if n.is_finite() && n.fract() == 0.0 => Some(*n as i64),
            _ => None,
        }
    }

    /// The string slice, if this is a string
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// The items, if this is an array
    pub fn as_array(&self) -> Option<&Vec<Value>> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_array_mut(&mut self) -> Option<&mut Vec<Value>> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    /// The fields, if this is an object
    pub fn as_object(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Object(fields) => Some(fields),
            _ => None,
        }
    }

    pub fn as_object_mut(&mut self) -> Option<&mut BTreeMap<String, Value>> {
        match self {
            Value::Object(fields) => Some(fields),
            _ => None,
        }
    }

    /// Look up a field of an object
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_object().and_then(|fields| fields.get(key))
    }

    /// Mutable lookup of a field of an object
    pub fn get_mut(&mut self, key: &str) -> Option<&mut Value> {
        self.as_object_mut().and_then(|fields| fields.get_mut(key))
    }

    /// Set a field, turning `self` into an empty object first if it is not one.
    ///
    /// Returns the previous value of the field.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        if !matches!(self, Value::Object(_)) {
            *self = Value::object();
        }
        match self {
            Value::Object(fields) => fields.insert(key.into(), value.into()),
            _ => None,
        }
    }

    /// Walk object keys and array indices
    pub fn pointer(&self, path: &[PathSegment]) -> Option<&Value> {
        path.iter().try_fold(self, |current, segment| match (current, segment) {
            (Value::Object(fields), PathSegment::Key(key)) => fields.get(key),
            (Value::Array(items), PathSegment::Index(index)) => items.get(*index),
            _ => None,
        })
    }

    /// Convert any serializable Rust value through its JSON form
    pub fn from_serialize<T: Serialize + ?Sized>(value: &T) -> KartonResult<Self> {
        Ok(Value::from(serde_json::to_value(value)?))
    }

    /// Deserialize a Rust value from the plain JSON projection of this value
    pub fn deserialize_into<T: DeserializeOwned>(&self) -> KartonResult<T> {
        Ok(serde_json::from_value(self.to_plain_json())?)
    }

    /// Lossy projection onto plain JSON.
    ///
    /// `undefined` and non-finite numbers become `null`, dates become RFC 3339
    /// strings, sets become arrays, maps become `[key, value]` pair arrays.
    pub fn to_plain_json(&self) -> JsonValue {
        match self {
            Value::Undefined | Value::Null => JsonValue::Null,
            Value::Bool(b) => JsonValue::Bool(*b),
            Value::Number(n) => plain_number(*n).unwrap_or(JsonValue::Null),
            Value::String(s) => JsonValue::String(s.clone()),
            Value::Date(date) => JsonValue::String(format_date(date)),
            Value::Array(items) | Value::Set(items) => {
                JsonValue::Array(items.iter().map(Value::to_plain_json).collect())
            }
            Value::Object(fields) => JsonValue::Object(
                fields
                    .iter()
                    .map(|(key, value)| (key.clone(), value.to_plain_json()))
                    .collect(),
            ),
            Value::Map(entries) => JsonValue::Array(
                entries
                    .iter()
                    .map(|(key, value)| {
                        JsonValue::Array(vec![key.to_plain_json(), value.to_plain_json()])
                    })
                    .collect(),
            ),
            Value::Error(error) => {
                let mut fields: JsonMap<String, JsonValue> = error
                    .extra
                    .iter()
                    .map(|(key, value)| (key.clone(), value.to_plain_json()))
                    .collect();
                fields.insert("name".into(), JsonValue::String(error.name.clone()));
                fields.insert("message".into(), JsonValue::String(error.message.clone()));
                JsonValue::Object(fields)
            }
        }
    }

    /// Lossless encoding into extended JSON
    pub fn to_extended_json(&self) -> JsonValue {
        match self {
            Value::Undefined => tagged("$undefined", JsonValue::Bool(true)),
            Value::Null => JsonValue::Null,
            Value::Bool(b) => JsonValue::Bool(*b),
            Value::Number(n) => encode_number(*n),
            Value::String(s) => JsonValue::String(s.clone()),
            Value::Date(date) => tagged("$date", JsonValue::String(format_date(date))),
            Value::Array(items) => {
                JsonValue::Array(items.iter().map(Value::to_extended_json).collect())
            }
            Value::Object(fields) => {
                let encoded = encode_fields(fields);
                if fields.keys().any(|key| key.starts_with('$')) {
                    tagged("$object", encoded)
                } else {
                    encoded
                }
            }
            Value::Map(entries) => tagged(
                "$map",
                JsonValue::Array(
                    entries
                        .iter()
                        .map(|(key, value)| {
                            JsonValue::Array(vec![key.to_extended_json(), value.to_extended_json()])
                        })
                        .collect(),
                ),
            ),
            Value::Set(items) => tagged(
                "$set",
                JsonValue::Array(items.iter().map(Value::to_extended_json).collect()),
            ),
            Value::Error(error) => {
                let mut fields = match encode_fields(&error.extra) {
                    JsonValue::Object(fields) => fields,
                    _ => JsonMap::new(),
                };
                fields.insert("name".into(), JsonValue::String(error.name.clone()));
                fields.insert("message".into(), JsonValue::String(error.message.clone()));
                tagged("$error", JsonValue::Object(fields))
            }
        }
    }

    /// Decode extended JSON produced by [`Value::to_extended_json`]
    pub fn from_extended_json(raw: JsonValue) -> KartonResult<Self> {
        match raw {
            JsonValue::Null => Ok(Value::Null),
            JsonValue::Bool(b) => Ok(Value::Bool(b)),
            JsonValue::Number(n) => n
                .as_f64()
                .map(Value::Number)
                .ok_or_else(|| KartonError::malformed(format!("unrepresentable number {}", n))),
            JsonValue::String(s) => Ok(Value::String(s)),
            JsonValue::Array(items) => decode_items(items).map(Value::Array),
            JsonValue::Object(fields) => {
                let is_tagged = fields.len() == 1 && fields.keys().all(|key| key.starts_with('$'));
                let mut decoded = BTreeMap::new();
                for (key, raw) in fields {
                    if is_tagged {
                        return decode_tagged(&key, raw);
                    }
                    decoded.insert(key, Value::from_extended_json(raw)?);
                }
                Ok(Value::Object(decoded))
            }
        }
    }
}

fn tagged(tag: &str, payload: JsonValue) -> JsonValue {
    let mut fields = JsonMap::with_capacity(1);
    fields.insert(tag.to_string(), payload);
    JsonValue::Object(fields)
}

fn same_number(a: f64, b: f64) -> bool {
    if a.is_nan() || b.is_nan() {
        return a.is_nan() && b.is_nan();
    }
    a == b && a.is_sign_negative() == b.is_sign_negative()
}

// Millisecond precision unless the date carries finer digits
fn format_date(date: &DateTime<Utc>) -> String {
    let format = if date.timestamp_subsec_nanos() % 1_000_000 == 0 {
        SecondsFormat::Millis
    } else {
        SecondsFormat::AutoSi
    };
    date.to_rfc3339_opts(format, true)
}

fn plain_number(n: f64) -> Option<JsonValue> {
    if n.fract() == 0.0 && n.abs() <= MAX_SAFE_INTEGER {
        Some(JsonValue::from(n as i64))
    } else {
        serde_json::Number::from_f64(n).map(JsonValue::Number)
    }
}

fn encode_number(n: f64) -> JsonValue {
    let special = if n.is_nan() {
        "NaN"
    } else if n == f64::INFINITY {
        "Infinity"
    } else if n == f64::NEG_INFINITY {
        "-Infinity"
    } else if n == 0.0 && n.is_sign_negative() {
        "-0"
    } else {
        return plain_number(n).unwrap_or(JsonValue::Null);
    };
    tagged("$number", JsonValue::String(special.to_string()))
}

fn encode_fields(fields: &BTreeMap<String, Value>) -> JsonValue {
    JsonValue::Object(
        fields
            .iter()
            .map(|(key, value)| (key.clone(), value.to_extended_json()))
            .collect(),
    )
}

fn decode_items(items: Vec<JsonValue>) -> KartonResult<Vec<Value>> {
    items.into_iter().map(Value::from_extended_json).collect()
}

fn decode_fields(fields: JsonMap<String, JsonValue>) -> KartonResult<BTreeMap<String, Value>> {
    fields
        .into_iter()
        .map(|(key, raw)| Ok((key, Value::from_extended_json(raw)?)))
        .collect()
}

fn decode_tagged(tag: &str, payload: JsonValue) -> KartonResult<Value> {
    match (tag, payload) {
        ("$undefined", _) => Ok(Value::Undefined),
        ("$number", JsonValue::String(special)) => match special.as_str() {
            "NaN" => Ok(Value::Number(f64::NAN)),
            "Infinity" => Ok(Value::Number(f64::INFINITY)),
            "-Infinity" => Ok(Value::Number(f64::NEG_INFINITY)),
            "-0" => Ok(Value::Number(-0.0)),
            other => Err(KartonError::malformed(format!(
                "unknown special number '{}'",
                other
            ))),
        },
        ("$date", JsonValue::String(text)) => DateTime::parse_from_rfc3339(&text)
            .map(|date| Value::Date(date.with_timezone(&Utc)))
            .map_err(|e| KartonError::malformed(format!("invalid date '{}': {}", text, e))),
        ("$map", JsonValue::Array(entries)) => entries
            .into_iter()
            .map(|entry| match entry {
                JsonValue::Array(pair) if pair.len() == 2 => {
                    let mut pair = pair.into_iter();
                    let key = Value::from_extended_json(pair.next().unwrap_or_default())?;
                    let value = Value::from_extended_json(pair.next().unwrap_or_default())?;
                    Ok((key, value))
                }
                _ => Err(KartonError::malformed("map entry is not a [key, value] pair")),
            })
            .collect::<KartonResult<Vec<_>>>()
            .map(Value::Map),
        ("$set", JsonValue::Array(items)) => decode_items(items).map(Value::Set),
        ("$error", JsonValue::Object(fields)) => {
            let mut extra = decode_fields(fields)?;
            let name = match extra.remove("name") {
                Some(Value::String(name)) => name,
                _ => "Error".to_string(),
            };
            let message = match extra.remove("message") {
                Some(Value::String(message)) => message,
                _ => String::new(),
            };
            Ok(Value::Error(Box::new(ErrorObject {
                name,
                message,
                extra,
            })))
        }
        ("$object", JsonValue::Object(fields)) => decode_fields(fields).map(Value::Object),
        (tag, payload) => Err(KartonError::malformed(format!(
            "unknown value tag '{}' with {} payload",
            tag,
            json_kind(&payload)
        ))),
    }
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "boolean",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_extended_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = JsonValue::deserialize(deserializer)?;
        Value::from_extended_json(raw).map_err(de::Error::custom)
    }
}

/// Plain JSON maps one-to-one; no `$` tags are interpreted.
impl From<JsonValue> for Value {
    fn from(raw: JsonValue) -> Self {
        match raw {
            JsonValue::Null => Value::Null,
            JsonValue::Bool(b) => Value::Bool(b),
            JsonValue::Number(n) => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
            JsonValue::String(s) => Value::String(s),
            JsonValue::Array(items) => Value::Array(items.into_iter().map(Value::from).collect()),
            JsonValue::Object(fields) => Value::Object(
                fields
                    .into_iter()
                    .map(|(key, value)| (key, Value::from(value)))
                    .collect(),
            ),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

macro_rules! from_number {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for Value {
                fn from(n: $ty) -> Self {
                    Value::Number(n as f64)
                }
            }
        )*
    };
}

from_number!(f64, f32, i64, i32, i16, i8, u64, u32, u16, u8, usize);

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

impl From<DateTime<Utc>> for Value {
    fn from(date: DateTime<Utc>) -> Self {
        Value::Date(date)
    }
}

impl From<ErrorObject> for Value {
    fn from(error: ErrorObject) -> Self {
        Value::Error(Box::new(error))
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Array(items)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Value::Undefined, Into::into)
    }
}

impl<K: Into<String>> FromIterator<(K, Value)> for Value {
    fn from_iter<I: IntoIterator<Item = (K, Value)>>(iter: I) -> Self {
        Value::Object(iter.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

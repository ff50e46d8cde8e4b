//! `RpcValue`: a JSON value that additionally recognizes the wire's
//! ISO-8601 timestamp strings, for callers that want the full dynamic
//! round-trip behavior the original gets from `MtrpcJsonEncoder`/
//! `MtrpcJsonDecoder` auto-coercing `datetime` objects. Typed procedures
//! should prefer `datetime::iso8601` on a concrete field instead; this is
//! for the dynamic `params`/`result` path spec.md §8 describes.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::datetime::{format_iso8601, parse_iso8601};

#[derive(Debug, Clone, PartialEq)]
pub enum RpcValue {
    Null,
    Bool(bool),
    Number(serde_json::Number),
    String(String),
    DateTime(chrono::NaiveDateTime),
    Array(Vec<RpcValue>),
    /// `BTreeMap` rather than `serde_json::Map`'s insertion-preserving map:
    /// object key order carries no meaning on this wire, so the ordering
    /// guarantee isn't worth giving up `Ord`-keyed construction here.
    Object(BTreeMap<String, RpcValue>),
}

impl RpcValue {
    /// Decode a `serde_json::Value`, sniffing strings that match the wire's
    /// ISO-8601 format into `RpcValue::DateTime` rather than leaving them as
    /// plain strings.
    pub fn from_json(value: Value) -> Self {
        match value {
            Value::Null => RpcValue::Null,
            Value::Bool(b) => RpcValue::Bool(b),
            Value::Number(n) => RpcValue::Number(n),
            Value::String(s) => match parse_iso8601(&s) {
                Some(dt) => RpcValue::DateTime(dt),
                None => RpcValue::String(s),
            },
            Value::Array(items) => RpcValue::Array(items.into_iter().map(RpcValue::from_json).collect()),
            Value::Object(map) => RpcValue::Object(
                map.into_iter()
                    .map(|(k, v)| (k, RpcValue::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Encode back to plain JSON, always rendering `DateTime` as the
    /// microsecond-precision wire string (spec.md §6).
    pub fn to_json(self) -> Value {
        match self {
            RpcValue::Null => Value::Null,
            RpcValue::Bool(b) => Value::Bool(b),
            RpcValue::Number(n) => Value::Number(n),
            RpcValue::String(s) => Value::String(s),
            RpcValue::DateTime(dt) => Value::String(format_iso8601(&dt)),
            RpcValue::Array(items) => Value::Array(items.into_iter().map(RpcValue::to_json).collect()),
            RpcValue::Object(map) => {
                Value::Object(map.into_iter().map(|(k, v)| (k, v.to_json())).collect())
            }
        }
    }
}

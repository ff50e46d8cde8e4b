//! Wire envelope types (spec.md §6): the JSON-RPC 1.0 request shape
//! extended with `kwparams`, and the response shape carrying either a
//! `result` or an `error`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error_taxonomy::WireError;

/// An incoming request. `id: null` (or omitted, which `serde` treats the
/// same as `null` here) marks a notification (spec.md §6); the dispatcher
/// is the one that decides a notification is unsupported, not this type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    #[serde(default)]
    pub id: Value,
    pub method: String,
    #[serde(default)]
    pub params: Vec<Value>,
    #[serde(default)]
    pub kwparams: serde_json::Map<String, Value>,
}

impl Request {
    /// A request with no `id` field at all, or an explicit JSON `null`, is
    /// a notification under spec.md §6.
    pub fn is_notification(&self) -> bool {
        self.id.is_null()
    }

    /// Two-stage decode matching spec.md §4.6's Worker step 1: bytes that
    /// aren't even JSON are a `NotJson` (→ `DeserializationError`); bytes
    /// that parse but don't match the `{id, method: string, params: array,
    /// kwparams: object?}` shape are `InvalidShape` (→ `InvalidRequest`).
    /// A single `serde`-derived `Deserialize` can't distinguish these two
    /// failure modes, since both show up as the same `serde_json::Error`.
    pub fn decode(body: &[u8]) -> Result<Request, RequestDecodeError> {
        let value: Value = serde_json::from_slice(body).map_err(|e| RequestDecodeError::NotJson(e.to_string()))?;
        let obj = value
            .as_object()
            .ok_or_else(|| RequestDecodeError::InvalidShape("request must be a JSON object".to_string()))?;

        let method = obj
            .get("method")
            .and_then(Value::as_str)
            .ok_or_else(|| RequestDecodeError::InvalidShape("\"method\" must be a string".to_string()))?
            .to_string();

        let params = match obj.get("params") {
            None => Vec::new(),
            Some(Value::Array(arr)) => arr.clone(),
            Some(_) => return Err(RequestDecodeError::InvalidShape("\"params\" must be an array".to_string())),
        };

        let kwparams = match obj.get("kwparams") {
            None => serde_json::Map::new(),
            Some(Value::Object(map)) => map.clone(),
            Some(_) => return Err(RequestDecodeError::InvalidShape("\"kwparams\" must be an object".to_string())),
        };

        let id = obj.get("id").cloned().unwrap_or(Value::Null);
        Ok(Request { id, method, params, kwparams })
    }
}

/// The two ways `Request::decode` can fail, kept distinct so the worker can
/// raise `DeserializationError` vs `InvalidRequest` per spec.md §4.6/§7.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestDecodeError {
    NotJson(String),
    InvalidShape(String),
}

impl std::fmt::Display for RequestDecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotJson(msg) => write!(f, "{msg}"),
            Self::InvalidShape(msg) => write!(f, "{msg}"),
        }
    }
}

/// The outgoing envelope: exactly one of `result`/`error` is populated,
/// mirroring the original's `{'id': ..., 'result': ..., 'error': ...}`
/// always-three-keys shape rather than an internally-tagged Rust enum, so
/// clients that expect both keys present (one of them `null`) keep working.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub id: Value,
    #[serde(default)]
    pub result: Value,
    #[serde(default)]
    pub error: Option<WireError>,
}

impl Response {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            id,
            result,
            error: None,
        }
    }

    pub fn failure(id: Value, error: WireError) -> Self {
        Self {
            id,
            result: Value::Null,
            error: Some(error),
        }
    }
}

//! Fixed wire error taxonomy (spec.md §7), grounded on
//! `mtrpc/common/errors.py`'s exception hierarchy.
//!
//! The Python original raises typed exceptions that the server framework
//! catches and serializes by class name. Rust has no open class hierarchy to
//! catch, so `ProcedureError` is the closed enum a procedure body returns,
//! and `WireError` is what actually goes on the wire — the two carry the
//! same fixed set of names so the wire contract matches byte for byte.

use serde::{Deserialize, Serialize};

/// The error object embedded in a `Response` envelope (spec.md §6).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireError {
    pub name: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl WireError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// The fixed, server-raised half of the taxonomy (spec.md §7). Every variant
/// here names exactly the wire `name` a `RPCServer*Error` subclass produces
/// in the original.
#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum ProcedureError {
    #[error("could not deserialize request: {0}")]
    DeserializationError(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("notifications are not implemented")]
    NotificationsNotImplemented,

    #[error("method not found: {0}")]
    NotFound(String),

    #[error("bad arguments: {0}")]
    BadArguments(String),

    #[error("internal server error: {0}")]
    InternalServerError(String),

    #[error("could not serialize response: {0}")]
    SerializationError(String),

    /// A procedure's own domain error, raised by application code. `name`
    /// is the wire name a client matches on; `original_source`'s
    /// `MethodExcWrapper`/`raise_exc` is the equivalent convenience that
    /// lets a procedure body just `raise` a plain exception and have the
    /// server wrap it under this arm.
    #[error("{name}: {message}")]
    Domain {
        name: String,
        message: String,
        data: Option<serde_json::Value>,
    },
}

impl ProcedureError {
    /// The fixed wire `name` for this error's variant.
    pub fn wire_name(&self) -> &str {
        match self {
            Self::DeserializationError(_) => "DeserializationError",
            Self::InvalidRequest(_) => "InvalidRequest",
            Self::NotificationsNotImplemented => "NotificationsNotImplemented",
            Self::NotFound(_) => "NotFound",
            Self::BadArguments(_) => "BadArguments",
            Self::InternalServerError(_) => "InternalServerError",
            Self::SerializationError(_) => "SerializationError",
            Self::Domain { name, .. } => name,
        }
    }

    /// `raise_exc()`-equivalent: wrap an arbitrary application error as a
    /// domain error carrying its `Display` message and the Rust type name,
    /// so a procedure body can use `?` against `anyhow`-style errors
    /// without hand-rolling a `ProcedureError` match.
    pub fn from_domain(name: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::Domain {
            name: name.into(),
            message: err.to_string(),
            data: None,
        }
    }

    /// An authorization hook's refusal (spec.md §4.2). Not one of the fixed
    /// wire names in §7 — the original has no dedicated exception class for
    /// it either, so it travels as a plain domain error named `AccessDenied`.
    pub fn access_denied(message: impl Into<String>) -> Self {
        Self::Domain {
            name: "AccessDenied".to_string(),
            message: message.into(),
            data: None,
        }
    }

    pub fn into_wire(self) -> WireError {
        let name = self.wire_name().to_string();
        match self {
            Self::Domain { message, data, .. } => {
                let mut wire = WireError::new(name, message);
                wire.data = data;
                wire
            }
            other => WireError::new(name, other.to_string()),
        }
    }
}

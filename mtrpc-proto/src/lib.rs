//! The mtrpc wire protocol: JSON-RPC 1.0 request/response envelopes with a
//! `kwparams` extension, a fixed server-side error taxonomy, and the
//! ISO-8601 date/time codec, per spec.md §6-§8.

pub mod datetime;
pub mod envelope;
pub mod error_taxonomy;
pub mod value;

pub use envelope::{Request, RequestDecodeError, Response};
pub use error_taxonomy::{ProcedureError, WireError};
pub use value::RpcValue;

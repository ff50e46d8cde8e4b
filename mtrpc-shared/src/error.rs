//! Server-side fault taxonomy.
//!
//! Distinct from the wire error taxonomy in `mtrpc-proto`: these variants
//! never reach a client directly. A transport or configuration fault is
//! reported to the caller (if any) as the opaque `InternalServerError` wire
//! error; the detail below is only for logs and the process exit path.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    /// A configuration section was missing or malformed at load time.
    #[error("configuration error in section `{section}`: {problem}")]
    Config { section: String, problem: String },

    /// A broker I/O action failed after the retry wrapper exhausted its
    /// configured attempt count.
    #[error("AMQP error after {attempts} attempt(s): {detail}")]
    Amqp { attempts: u32, detail: String },

    /// An access-key or access-keyhole template referenced a field the
    /// access context does not provide.
    #[error("bad access pattern: {0}")]
    BadAccessPattern(String),

    /// The method tree could not be built from its declarative sources.
    #[error("method tree build error: {0}")]
    TreeBuild(String),

    /// Any other server-side fault whose detail must not leak to clients.
    #[error("internal server error: {0}")]
    Internal(String),
}

pub type ServerResult<T> = Result<T, ServerError>;

impl ServerError {
    pub fn config(section: impl Into<String>, problem: impl Into<String>) -> Self {
        Self::Config {
            section: section.into(),
            problem: problem.into(),
        }
    }
}

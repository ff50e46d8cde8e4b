//! Configuration, error taxonomy and resilience helpers shared by the mtrpc
//! core crates.

pub mod config;
pub mod error;
pub mod logging;
pub mod resilience;

pub use error::{ServerError, ServerResult};

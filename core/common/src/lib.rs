//! Common utilities and types shared across the Lifetrack sync crates.
//!
//! This module provides the error taxonomy every layer reports through, and
//! the small value types (domains, operation kinds, HTTP methods) that the
//! storage, sync and CLI crates exchange.

pub mod error;
pub mod types;

pub use error::{Error, ErrorKind, Result};
pub use types::{Domain, HttpMethod, OperationKind};

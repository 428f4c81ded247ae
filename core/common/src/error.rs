//! Common error types for Lifetrack.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::types::HttpMethod;

/// Top-level error type for Lifetrack operations.
#[derive(Debug, Error)]
pub enum Error {
    /// A single network attempt failed before any response arrived.
    ///
    /// The retrying transport never lets this escape; once retries are
    /// exhausted it is reported as [`Error::ServerUnavailable`].
    #[error("transport error: {0}")]
    Transport(String),

    /// The backend could not be reached after every retry was spent.
    #[error("server-unavailable")]
    ServerUnavailable,

    /// The circuit breaker is open; no network call was attempted.
    #[error("service-unavailable")]
    ServiceUnavailable,

    /// The client-side rate limiter rejected the request.
    #[error("rate-limited: {method} {endpoint}")]
    RateLimited { endpoint: String, method: HttpMethod },

    /// The backend answered with a 5xx status on the final attempt.
    #[error("server-error({0})")]
    ServerError(u16),

    /// The backend rejected the request (4xx other than 409).
    #[error("client-error({status}): {message}")]
    ClientError { status: u16, message: String },

    /// The backend reported an optimistic-concurrency conflict (409).
    #[error("conflict: {0}")]
    Conflict(String),

    /// A response body did not match the expected shape.
    #[error("decoding error: {0}")]
    Decoding(String),

    /// Invalid input provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Durable storage failed.
    #[error("storage error: {0}")]
    Storage(String),

    /// Serialization or deserialization of local state failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Resource not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A background component was stopped or is not running.
    #[error("shut down: {0}")]
    Shutdown(String),
}

/// Stable classification of an [`Error`], independent of its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    Transport,
    ServerUnavailable,
    ServiceUnavailable,
    RateLimited,
    ServerError,
    ClientError,
    Conflict,
    Decoding,
    Validation,
    Storage,
    Serialization,
    NotFound,
    Io,
    Shutdown,
}

impl ErrorKind {
    /// Short slug used in logs and persisted state.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Transport => "transport",
            ErrorKind::ServerUnavailable => "server-unavailable",
            ErrorKind::ServiceUnavailable => "service-unavailable",
            ErrorKind::RateLimited => "rate-limited",
            ErrorKind::ServerError => "server-error",
            ErrorKind::ClientError => "client-error",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Decoding => "decoding",
            ErrorKind::Validation => "validation",
            ErrorKind::Storage => "storage",
            ErrorKind::Serialization => "serialization",
            ErrorKind::NotFound => "not-found",
            ErrorKind::Io => "io",
            ErrorKind::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Error {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Transport(_) => ErrorKind::Transport,
            Error::ServerUnavailable => ErrorKind::ServerUnavailable,
            Error::ServiceUnavailable => ErrorKind::ServiceUnavailable,
            Error::RateLimited { .. } => ErrorKind::RateLimited,
            Error::ServerError(_) => ErrorKind::ServerError,
            Error::ClientError { .. } => ErrorKind::ClientError,
            Error::Conflict(_) => ErrorKind::Conflict,
            Error::Decoding(_) => ErrorKind::Decoding,
            Error::InvalidInput(_) => ErrorKind::Validation,
            Error::Storage(_) => ErrorKind::Storage,
            Error::Serialization(_) => ErrorKind::Serialization,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::Io(_) => ErrorKind::Io,
            Error::Shutdown(_) => ErrorKind::Shutdown,
        }
    }

    /// Whether the transport retries this failure locally.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transport(_) | Error::ServerError(_))
    }

    /// Whether the backend was unavailable, so a write may be deferred
    /// to the offline queue instead of being reported as a failure.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            Error::Transport(_)
                | Error::ServerUnavailable
                | Error::ServiceUnavailable
                | Error::ServerError(_)
        )
    }

    /// Whether retrying the same request can never succeed.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Error::ClientError { .. } | Error::Decoding(_) | Error::InvalidInput(_)
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;

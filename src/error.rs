//! Error and outcome types for the engine's public surface.
//!
//! `UpdateOutcome` is a tagged result, not an exception channel: success and
//! "nothing to do" are distinguishable variants rather than an overloaded
//! zero, per the design notes this client follows. Genuinely unexpected
//! failures (a broken local storage handle) are a separate `EngineError`
//! used by `Lookup` and by the handful of helpers that have no sensible
//! tagged variant to fall back to.

use std::fmt;
use thiserror::Error;

/// Failures raised by a `Storage` implementation.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Failures in the chunk codec (binary body decode, range parsing).
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("truncated chunk body")]
    Truncated,
    #[error("invalid hash length {0}")]
    InvalidHashLen(usize),
    #[error("invalid chunk header: {0}")]
    InvalidHeader(String),
    #[error("invalid range token: {0}")]
    InvalidRange(String),
}

/// Failures in the MAC subsystem.
#[derive(Debug, Error)]
pub enum MacError {
    #[error("request to key-acquisition endpoint failed: {0}")]
    KeyRequest(String),
    #[error("malformed newkey response: {0}")]
    MalformedKeyResponse(String),
    #[error("HMAC digest mismatch")]
    DigestMismatch,
}

/// The flat result of one `Engine::update()` invocation.
///
/// Mirrors the service's own small set of outcome codes: a tagged variant
/// rather than magic integers, with "nothing happened" and "something
/// failed" kept as distinct values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Every configured list was still inside its backoff/poll window.
    NoUpdate,
    /// The update HTTP exchange completed but the server had nothing new.
    NoData,
    /// At least one chunk or delete directive was applied.
    Successful,
    /// Non-2xx HTTP response from the service.
    ServerError(String),
    /// Response parsed but its contents were invalid (bad chunk header,
    /// unparseable range, truncated body).
    InternalError(String),
    /// HMAC validation failed on a MACed response; the whole cycle aborted
    /// without advancing any list's cursor.
    MacError,
    /// MAC was requested but keys could not be obtained.
    MacKeyError,
}

impl fmt::Display for UpdateOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdateOutcome::NoUpdate => write!(f, "NoUpdate"),
            UpdateOutcome::NoData => write!(f, "NoData"),
            UpdateOutcome::Successful => write!(f, "Successful"),
            UpdateOutcome::ServerError(detail) => write!(f, "ServerError: {detail}"),
            UpdateOutcome::InternalError(detail) => write!(f, "InternalError: {detail}"),
            UpdateOutcome::MacError => write!(f, "MacError"),
            UpdateOutcome::MacKeyError => write!(f, "MacKeyError"),
        }
    }
}

/// Unexpected failures that have no tagged `UpdateOutcome` home -- used by
/// `Lookup` (which has no server-driven error taxonomy of its own) and by
/// internal plumbing.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Mac(#[from] MacError),
    #[error("HTTP request failed: {0}")]
    Http(String),
}

impl From<reqwest::Error> for EngineError {
    fn from(e: reqwest::Error) -> Self {
        EngineError::Http(e.to_string())
    }
}

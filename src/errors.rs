// src/errors.rs

//! Defines the primary error type for the distributed-I/O core.

use std::sync::Arc;
use thiserror::Error;

/// The five error kinds carried by the core (spec §7).
///
/// `Backend` errors are non-terminal and are usually reduced into a boolean
/// batch result rather than propagated; everything else is terminal for the
/// connection (or, for `Config`, fatal at startup).
#[derive(Error, Debug, Clone)]
pub enum JuleaError {
    /// Missing mandatory key, unparseable host, zero server count.
    #[error("configuration error: {0}")]
    Config(String),

    /// Connect refused, event-queue error completion, send/recv failure,
    /// unexpected shutdown. Always terminal for the affected connection.
    #[error("transport error: {0}")]
    Transport(String),

    /// `io::Error` wrapped for transport failures; kept separate so callers
    /// can still match on the underlying `std::io::ErrorKind`.
    #[error("io error: {0}")]
    Io(Arc<std::io::Error>),

    /// Reply with mismatched `id`, truncated body, unknown `op_type` in a
    /// reply. Terminal for the connection.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Backend-reported failure for a sub-op (e.g. "not found" on delete).
    /// Non-terminal: surfaces as `false` in a boolean return and/or a
    /// `status` field in the reply.
    #[error("backend error: {0}")]
    Backend(String),

    /// Fatal domain-limit misconfiguration at init (pool exhaustion itself
    /// is not an error — callers block on `pop`, see `ConnectionPool`).
    #[error("resource error: {0}")]
    Resource(String),
}

impl From<std::io::Error> for JuleaError {
    fn from(e: std::io::Error) -> Self {
        JuleaError::Io(Arc::new(e))
    }
}

impl From<toml::de::Error> for JuleaError {
    fn from(e: toml::de::Error) -> Self {
        JuleaError::Config(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, JuleaError>;

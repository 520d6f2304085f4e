//! Error types for probing and pooled connections.

use thiserror::Error;

use crate::register::DecodeError;
use crate::transport::TransportError;

/// Result type alias using [`ProbeError`].
pub type Result<T> = std::result::Result<T, ProbeError>;

/// Errors surfaced by the pool, the probe engine and device handles.
///
/// None of these are fatal to a scan: each one degrades to "this target,
/// handler or unit did not work".
#[derive(Debug, Error)]
pub enum ProbeError {
    /// The transport could not be opened.
    #[error("Connection to {target} failed: {reason}")]
    ConnectFailed { target: String, reason: String },

    /// A serial line is already open at a different baud rate.
    #[error("Rate mismatch on {path}: open at {open} bps, requested {requested} bps")]
    RateMismatch {
        path: String,
        open: u32,
        requested: u32,
    },

    /// A read or write failed mid-exchange.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// A raw payload did not decode.
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Attempt to write a register that is not writable.
    #[error("Register {0} is read-only")]
    ReadOnly(String),

    /// A discovery datagram could not be parsed.
    #[error("Discovery parse error: {0}")]
    DiscoveryParse(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProbeError {
    /// Create a connection failure.
    pub fn connect_failed(target: impl ToString, reason: impl ToString) -> Self {
        Self::ConnectFailed {
            target: target.to_string(),
            reason: reason.to_string(),
        }
    }
}

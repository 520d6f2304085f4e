//! Register transport capability.
//!
//! The wire protocol (framing, checksums, request/response matching) lives
//! behind [`RegisterTransport`]. The pool and probe engine only ever see
//! raw 16-bit words.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::target::ConnectionTarget;

/// Default exchange timeout for a freshly opened transport.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);

/// Which register bank a read targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Access {
    /// Holding registers (read/write).
    Holding,
    /// Input registers (read-only).
    Input,
}

impl Access {
    /// Return the string name for this bank.
    pub fn as_str(&self) -> &'static str {
        match self {
            Access::Holding => "holding",
            Access::Input => "input",
        }
    }
}

/// Errors reported by a register transport.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    Connection(String),
    #[error("Timed out after {0:?}")]
    Timeout(Duration),
    #[error("Device exception: {0}")]
    Exception(String),
    #[error("I/O error: {0}")]
    Io(String),
    #[error("Transport is closed")]
    Closed,
    #[error("Operation not supported: {0}")]
    Unsupported(&'static str),
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// One open transport handle.
#[async_trait]
pub trait RegisterTransport: Send {
    /// Establish (or check) the underlying link.
    async fn connect(&mut self) -> Result<(), TransportError>;

    /// Read `count` words starting at `base` from `unit`.
    async fn read_registers(
        &mut self,
        unit: u8,
        access: Access,
        base: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError>;

    /// Write `words` to holding registers starting at `base`.
    async fn write_registers(
        &mut self,
        unit: u8,
        base: u16,
        words: &[u16],
    ) -> Result<(), TransportError>;

    /// Put a pre-built frame on the wire without waiting for a reply.
    async fn send_raw(&mut self, frame: &[u8]) -> Result<(), TransportError>;

    /// Current exchange timeout.
    fn timeout(&self) -> Duration;

    /// Replace the exchange timeout.
    fn set_timeout(&mut self, timeout: Duration);

    /// Release the underlying link.
    fn close(&mut self);
}

/// Opens transports for connection targets.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a transport for `target`.
    async fn open(
        &self,
        target: &ConnectionTarget,
    ) -> Result<Box<dyn RegisterTransport>, TransportError>;
}

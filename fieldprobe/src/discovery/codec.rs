//! Discovery codec capability and the record model it produces.

use std::net::IpAddr;
use thiserror::Error;

/// One resource record of interest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    /// Service type -> instance name.
    Pointer { name: String, instance: String },
    /// Instance name -> host and port.
    Service {
        name: String,
        target: String,
        port: u16,
    },
    /// Host name -> address.
    Address { name: String, ip: IpAddr },
}

/// All records of one datagram, sections flattened.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordSet {
    pub records: Vec<Record>,
}

/// Codec failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// The datagram is not a valid discovery message.
    #[error("malformed packet: {0}")]
    Malformed(String),
    #[error("{0}")]
    Other(String),
}

/// Packs queries and parses responses of the discovery protocol.
pub trait DiscoveryCodec: Send + Sync {
    /// Build one query datagram asking for every service in `services`.
    fn pack_query(&self, services: &[String]) -> Result<Vec<u8>, CodecError>;

    /// Parse an inbound datagram.
    fn parse(&self, packet: &[u8]) -> Result<RecordSet, CodecError>;
}

/// Canonical form of a domain name: lower case with a trailing dot.
pub fn fqdn(name: &str) -> String {
    let mut name = name.to_ascii_lowercase();
    if !name.ends_with('.') {
        name.push('.');
    }
    name
}

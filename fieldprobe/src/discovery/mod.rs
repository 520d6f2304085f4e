//! Local-network discovery of Modbus services.
//!
//! A query for every registered service type is multicast on demand
//! ([`Discovery::announce`]); a background listener ([`Discovery::listen`])
//! collects responses. An instance is reported once both its pointer record
//! and its service record arrived in the same datagram. Consumers poll
//! [`Discovery::drain_found`] at their own pace.

pub mod codec;
pub mod dns;

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::target::{ConnectionTarget, Method};
pub use codec::{CodecError, DiscoveryCodec, Record, RecordSet, fqdn};
pub use dns::DnsSdCodec;

/// Well-known mDNS multicast group.
pub const MDNS_ADDR: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 251);

/// Well-known mDNS port.
pub const MDNS_PORT: u16 = 5353;

const MAX_PACKET: usize = 65536;

/// Discovery endpoint: one socket, the registered services and the results.
pub struct Discovery {
    socket: UdpSocket,
    dest: SocketAddr,
    group: Option<Ipv4Addr>,
    joined: AtomicBool,
    codec: Box<dyn DiscoveryCodec>,
    services: Vec<String>,
    found: Mutex<HashSet<ConnectionTarget>>,
}

impl Discovery {
    /// Bind the mDNS port on all interfaces (address reuse enabled).
    pub fn bind(codec: impl DiscoveryCodec + 'static) -> std::io::Result<Self> {
        use socket2::{Domain, Protocol, Socket, Type};

        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, MDNS_PORT)).into())?;

        let socket = UdpSocket::from_std(socket.into())?;
        let dest = SocketAddr::from((MDNS_ADDR, MDNS_PORT));

        Ok(Self::with_socket(socket, dest, Some(MDNS_ADDR), codec))
    }

    /// Use an already bound socket, sending queries to `dest`.
    ///
    /// With `group` set, the group is joined lazily on the first announce.
    pub fn with_socket(
        socket: UdpSocket,
        dest: SocketAddr,
        group: Option<Ipv4Addr>,
        codec: impl DiscoveryCodec + 'static,
    ) -> Self {
        Self {
            socket,
            dest,
            group,
            joined: AtomicBool::new(false),
            codec: Box::new(codec),
            services: Vec::new(),
            found: Mutex::new(HashSet::new()),
        }
    }

    /// Register a service type, e.g. `_modbus._tcp`.
    pub fn add_service(&mut self, service: &str) {
        let name = fqdn(&format!("{}.local", service.trim_end_matches('.')));
        if !self.services.contains(&name) {
            self.services.push(name);
        }
    }

    pub fn services(&self) -> &[String] {
        &self.services
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Multicast one query covering every registered service.
    ///
    /// Never fails; problems are logged.
    pub async fn announce(&self) {
        if self.services.is_empty() {
            return;
        }

        if let Some(group) = self.group {
            if !self.joined.load(Ordering::Acquire) {
                if let Err(e) = self.socket.join_multicast_v4(group, Ipv4Addr::UNSPECIFIED) {
                    error!(%group, error = %e, "Failed to join mDNS group");
                    return;
                }
                self.joined.store(true, Ordering::Release);
                debug!(%group, "Joined mDNS group");
            }
        }

        let query = match self.codec.pack_query(&self.services) {
            Ok(query) => query,
            Err(e) => {
                error!(error = %e, "Error building mDNS request");
                return;
            }
        };

        if let Err(e) = self.socket.send_to(&query, self.dest).await {
            error!(error = %e, "Error sending mDNS request");
        }
    }

    /// Receive and process datagrams until `shutdown` turns true.
    pub async fn listen(&self, mut shutdown: watch::Receiver<bool>) {
        let mut buf = vec![0u8; MAX_PACKET];

        info!(services = ?self.services, "mDNS listener started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok((len, _)) => self.handle_packet(&buf[..len]),
                    Err(e) => error!(error = %e, "mDNS receive error"),
                },
            }
        }

        info!("mDNS listener stopped");
    }

    /// Decode one datagram and record any complete results.
    pub fn handle_packet(&self, packet: &[u8]) {
        match self.codec.parse(packet) {
            Ok(records) => {
                debug!(?records, "mDNS record");
                self.parse_records(&records);
            }
            Err(CodecError::Malformed(e)) => debug!(error = %e, "Ignoring malformed mDNS packet"),
            Err(e) => error!(error = %e, "Exception parsing mDNS record"),
        }
    }

    /// Turn one record set into connection targets.
    pub fn parse_records(&self, records: &RecordSet) {
        let mut pointers = HashSet::new();
        let mut services = HashMap::new();
        let mut addresses: HashMap<String, Ipv4Addr> = HashMap::new();

        for record in &records.records {
            match record {
                Record::Pointer { name, instance } => {
                    if self.services.contains(&fqdn(name)) {
                        pointers.insert(fqdn(instance));
                    }
                }
                Record::Service { name, target, port } => {
                    let Some(method) = service_method(name) else {
                        continue;
                    };
                    services.insert(fqdn(name), (method, fqdn(target), *port));
                }
                // IPv6 answers are often link-local without a scope.
                Record::Address {
                    name,
                    ip: IpAddr::V4(ip),
                } => {
                    addresses.insert(fqdn(name), *ip);
                }
                Record::Address { .. } => {}
            }
        }

        let mut found = self.found.lock();
        for instance in pointers {
            let Some((method, host, port)) = services.get(&instance) else {
                continue;
            };
            let address = match addresses.get(host) {
                Some(ip) => ip.to_string(),
                None => host.trim_end_matches('.').to_string(),
            };
            let target = match method {
                Method::Udp => ConnectionTarget::udp(address, *port),
                _ => ConnectionTarget::tcp(address, *port),
            };
            debug!(%instance, %target, "Discovered service");
            found.insert(target);
        }
    }

    /// Return everything found since the last call and start over.
    pub fn drain_found(&self) -> HashSet<ConnectionTarget> {
        std::mem::take(&mut *self.found.lock())
    }

    /// Leave the multicast group if it was joined.
    pub fn leave(&self) {
        if let Some(group) = self.group {
            if self.joined.swap(false, Ordering::AcqRel) {
                if let Err(e) = self.socket.leave_multicast_v4(group, Ipv4Addr::UNSPECIFIED) {
                    debug!(%group, error = %e, "Failed to leave mDNS group");
                }
            }
        }
    }
}

/// Transport from a service instance name such as `meter._modbus._tcp.local.`.
fn service_method(name: &str) -> Option<Method> {
    let labels: Vec<&str> = name.trim_end_matches('.').split('.').collect();
    if labels.len() < 3 {
        return None;
    }
    match labels[labels.len() - 2].trim_start_matches('_') {
        "tcp" => Some(Method::Tcp),
        "udp" => Some(Method::Udp),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_method() {
        assert_eq!(service_method("meter._modbus._tcp.local."), Some(Method::Tcp));
        assert_eq!(service_method("meter._modbus._udp.local"), Some(Method::Udp));
        assert_eq!(service_method("meter._modbus._sctp.local."), None);
        assert_eq!(service_method("_tcp.local."), None);
    }
}

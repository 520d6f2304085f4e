//! mDNS/DNS-SD codec backed by `simple-dns`.

use simple_dns::rdata::RData;
use simple_dns::{CLASS, Name, Packet, Question, TYPE};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use super::codec::{CodecError, DiscoveryCodec, Record, RecordSet, fqdn};

/// DNS wire format codec for multicast service discovery.
#[derive(Debug, Clone, Copy, Default)]
pub struct DnsSdCodec;

impl DiscoveryCodec for DnsSdCodec {
    fn pack_query(&self, services: &[String]) -> Result<Vec<u8>, CodecError> {
        let mut packet = Packet::new_query(0);
        for service in services {
            let name = Name::new(service.trim_end_matches('.'))
                .map_err(|e| {
                    CodecError::Other(format!("invalid service name '{}': {}", service, e))
                })?;
            packet
                .questions
                .push(Question::new(name, TYPE::PTR.into(), CLASS::IN.into(), false));
        }

        packet
            .build_bytes_vec()
            .map_err(|e| CodecError::Other(e.to_string()))
    }

    fn parse(&self, packet: &[u8]) -> Result<RecordSet, CodecError> {
        let packet = Packet::parse(packet).map_err(|e| CodecError::Malformed(e.to_string()))?;

        let records = packet
            .name_servers
            .iter()
            .chain(packet.answers.iter())
            .chain(packet.additional_records.iter())
            .filter_map(|rr| {
                let name = fqdn(&rr.name.to_string());
                match &rr.rdata {
                    RData::PTR(ptr) => Some(Record::Pointer {
                        name,
                        instance: fqdn(&ptr.0.to_string()),
                    }),
                    RData::SRV(srv) => Some(Record::Service {
                        name,
                        target: fqdn(&srv.target.to_string()),
                        port: srv.port,
                    }),
                    RData::A(a) => Some(Record::Address {
                        name,
                        ip: IpAddr::V4(Ipv4Addr::from(a.address)),
                    }),
                    RData::AAAA(aaaa) => Some(Record::Address {
                        name,
                        ip: IpAddr::V6(Ipv6Addr::from(aaaa.address)),
                    }),
                    _ => None,
                }
            })
            .collect();

        Ok(RecordSet { records })
    }
}

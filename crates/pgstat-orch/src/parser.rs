//! Packet field parsing used to tag streams and classify received frames.
//!
//! Only what flow statistics needs is decoded: the L3/L4 protocol pair, the
//! identification field (IPv4 identification, IPv6 flow label) and where the
//! L4 payload starts.

use byteorder::{BigEndian, ByteOrder};
use pgstat_common::{FlowProtocols, L3Proto, L4Proto};
use thiserror::Error;

const ETH_HEADER_LEN: usize = 14;
const VLAN_TAG_LEN: usize = 4;
const MAX_VLAN_TAGS: usize = 2;
const IPV4_MIN_HEADER_LEN: usize = 20;
const IPV6_HEADER_LEN: usize = 40;

const ETHERTYPE_VLAN: u16 = 0x8100;
const ETHERTYPE_QINQ: u16 = 0x88a8;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PacketParseError {
    #[error("packet truncated in {layer} header: need {needed} bytes, have {len}")]
    Truncated {
        layer: &'static str,
        needed: usize,
        len: usize,
    },

    #[error("unsupported ether type {0:#06x}")]
    UnsupportedEtherType(u16),

    #[error("bad IPv4 header length {0}")]
    BadIpv4HeaderLength(usize),

    #[error("IP version {found} in {expected} packet")]
    BadIpVersion { found: u8, expected: L3Proto },
}

/// Offsets and protocols of a parsed packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedPacket {
    pub l3: L3Proto,
    pub l4: L4Proto,
    pub l3_offset: usize,
    pub l4_offset: usize,
    pub payload_offset: usize,
}

impl ParsedPacket {
    pub fn protocols(&self) -> FlowProtocols {
        FlowProtocols::new(self.l3, self.l4)
    }

    /// Reads the identification value: the IPv4 identification field, or
    /// the 20-bit IPv6 flow label.
    pub fn ip_id(&self, packet: &[u8]) -> Option<u32> {
        match self.l3 {
            L3Proto::Ipv4 => packet
                .get(self.l3_offset + 4..self.l3_offset + 6)
                .map(|b| u32::from(BigEndian::read_u16(b))),
            L3Proto::Ipv6 => packet.get(self.l3_offset + 1..self.l3_offset + 4).map(|b| {
                (u32::from(b[0] & 0x0f) << 16) | (u32::from(b[1]) << 8) | u32::from(b[2])
            }),
        }
    }

    /// Rewrites the identification value. For IPv4 the header checksum is
    /// recomputed; for IPv6 the upper four flow-label bits are cleared.
    pub fn set_ip_id(&self, packet: &mut [u8], value: u16) -> Result<(), PacketParseError> {
        let len = packet.len();
        match self.l3 {
            L3Proto::Ipv4 => {
                let ihl = usize::from(packet.get(self.l3_offset).copied().unwrap_or(0) & 0x0f) * 4;
                let header = packet
                    .get_mut(self.l3_offset..self.l3_offset + ihl)
                    .filter(|h| h.len() >= IPV4_MIN_HEADER_LEN)
                    .ok_or(PacketParseError::Truncated {
                        layer: "ipv4",
                        needed: self.l3_offset + IPV4_MIN_HEADER_LEN,
                        len,
                    })?;
                BigEndian::write_u16(&mut header[4..6], value);
                header[10] = 0;
                header[11] = 0;
                let csum = ipv4_checksum(header);
                BigEndian::write_u16(&mut header[10..12], csum);
            }
            L3Proto::Ipv6 => {
                let label = packet
                    .get_mut(self.l3_offset + 1..self.l3_offset + 4)
                    .ok_or(PacketParseError::Truncated {
                        layer: "ipv6",
                        needed: self.l3_offset + 4,
                        len,
                    })?;
                label[0] &= 0xf0;
                BigEndian::write_u16(&mut label[1..3], value);
            }
        }
        Ok(())
    }
}

/// Parser of stream and received packets.
pub trait PacketParser: Send {
    fn parse(&self, packet: &[u8]) -> Result<ParsedPacket, PacketParseError>;
}

/// Ethernet II with up to two VLAN tags, carrying IPv4 or IPv6.
#[derive(Debug, Clone, Copy, Default)]
pub struct EthernetParser;

impl PacketParser for EthernetParser {
    fn parse(&self, packet: &[u8]) -> Result<ParsedPacket, PacketParseError> {
        let len = packet.len();
        let truncated = |layer, needed| PacketParseError::Truncated { layer, needed, len };

        if len < ETH_HEADER_LEN {
            return Err(truncated("ethernet", ETH_HEADER_LEN));
        }
        let mut offset = 12;
        let mut ether_type = BigEndian::read_u16(&packet[offset..offset + 2]);
        let mut tags = 0;
        while (ether_type == ETHERTYPE_VLAN || ether_type == ETHERTYPE_QINQ) && tags < MAX_VLAN_TAGS {
            offset += VLAN_TAG_LEN;
            let b = packet
                .get(offset..offset + 2)
                .ok_or_else(|| truncated("vlan", offset + 2))?;
            ether_type = BigEndian::read_u16(b);
            tags += 1;
        }
        let l3_offset = offset + 2;

        let (l3, l4, l4_offset) = match ether_type {
            0x0800 => {
                let ver_ihl = *packet
                    .get(l3_offset)
                    .ok_or_else(|| truncated("ipv4", l3_offset + 1))?;
                if ver_ihl >> 4 != 4 {
                    return Err(PacketParseError::BadIpVersion {
                        found: ver_ihl >> 4,
                        expected: L3Proto::Ipv4,
                    });
                }
                let ihl = usize::from(ver_ihl & 0x0f) * 4;
                if ihl < IPV4_MIN_HEADER_LEN {
                    return Err(PacketParseError::BadIpv4HeaderLength(ihl));
                }
                if len < l3_offset + ihl {
                    return Err(truncated("ipv4", l3_offset + ihl));
                }
                (L3Proto::Ipv4, L4Proto(packet[l3_offset + 9]), l3_offset + ihl)
            }
            0x86dd => {
                if len < l3_offset + IPV6_HEADER_LEN {
                    return Err(truncated("ipv6", l3_offset + IPV6_HEADER_LEN));
                }
                if packet[l3_offset] >> 4 != 6 {
                    return Err(PacketParseError::BadIpVersion {
                        found: packet[l3_offset] >> 4,
                        expected: L3Proto::Ipv6,
                    });
                }
                (L3Proto::Ipv6, L4Proto(packet[l3_offset + 6]), l3_offset + IPV6_HEADER_LEN)
            }
            other => return Err(PacketParseError::UnsupportedEtherType(other)),
        };

        let l4_len = match l4 {
            L4Proto::TCP => {
                let data_off = packet
                    .get(l4_offset + 12)
                    .map(|b| usize::from(b >> 4) * 4)
                    .ok_or_else(|| truncated("tcp", l4_offset + 13))?;
                data_off.max(20)
            }
            L4Proto::UDP | L4Proto::ICMP | L4Proto::ICMPV6 => 8,
            _ => 0,
        };
        if len < l4_offset + l4_len {
            return Err(truncated("l4", l4_offset + l4_len));
        }

        Ok(ParsedPacket {
            l3,
            l4,
            l3_offset,
            l4_offset,
            payload_offset: l4_offset + l4_len,
        })
    }
}

fn ipv4_checksum(header: &[u8]) -> u16 {
    let mut sum: u32 = header
        .chunks(2)
        .map(|w| {
            let hi = u32::from(w[0]) << 8;
            hi | w.get(1).copied().map_or(0, u32::from)
        })
        .sum();
    while sum > 0xffff {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// Test and demo packet builder.
pub mod build {
    use super::*;

    /// Builds an Ethernet/IPv4/UDP (or TCP) frame of `total_len` bytes.
    pub fn ipv4_packet(l4: L4Proto, ip_id: u16, total_len: usize) -> Vec<u8> {
        let mut pkt = vec![0u8; total_len.max(ETH_HEADER_LEN + IPV4_MIN_HEADER_LEN + 20)];
        pkt[0..6].copy_from_slice(&[0x02, 0, 0, 0, 0, 0x01]);
        pkt[6..12].copy_from_slice(&[0x02, 0, 0, 0, 0, 0x02]);
        BigEndian::write_u16(&mut pkt[12..14], 0x0800);
        let ip_len = pkt.len() - ETH_HEADER_LEN;
        let ip = &mut pkt[ETH_HEADER_LEN..ETH_HEADER_LEN + IPV4_MIN_HEADER_LEN];
        ip[0] = 0x45;
        BigEndian::write_u16(&mut ip[2..4], u16::try_from(ip_len).unwrap_or(u16::MAX));
        BigEndian::write_u16(&mut ip[4..6], ip_id);
        ip[8] = 64;
        ip[9] = l4.number();
        ip[12..16].copy_from_slice(&[16, 0, 0, 1]);
        ip[16..20].copy_from_slice(&[48, 0, 0, 1]);
        let csum = ipv4_checksum(ip);
        BigEndian::write_u16(&mut ip[10..12], csum);
        if l4 == L4Proto::TCP {
            pkt[ETH_HEADER_LEN + IPV4_MIN_HEADER_LEN + 12] = 5 << 4;
        }
        pkt
    }

    /// Builds an Ethernet/IPv6 frame of `total_len` bytes.
    pub fn ipv6_packet(l4: L4Proto, flow_label: u32, total_len: usize) -> Vec<u8> {
        let mut pkt = vec![0u8; total_len.max(ETH_HEADER_LEN + IPV6_HEADER_LEN + 20)];
        BigEndian::write_u16(&mut pkt[12..14], 0x86dd);
        let ip = &mut pkt[ETH_HEADER_LEN..ETH_HEADER_LEN + IPV6_HEADER_LEN];
        BigEndian::write_u32(&mut ip[0..4], (6 << 28) | (flow_label & 0x000f_ffff));
        ip[6] = l4.number();
        ip[7] = 64;
        if l4 == L4Proto::TCP {
            pkt[ETH_HEADER_LEN + IPV6_HEADER_LEN + 12] = 5 << 4;
        }
        pkt
    }
}

#[cfg(test)]
mod tests {
    use super::build::*;
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_ipv4_udp() {
        let pkt = ipv4_packet(L4Proto::UDP, 0x1234, 128);
        let parsed = EthernetParser.parse(&pkt).unwrap();
        assert_eq!(parsed.l3, L3Proto::Ipv4);
        assert_eq!(parsed.l4, L4Proto::UDP);
        assert_eq!(parsed.l3_offset, 14);
        assert_eq!(parsed.payload_offset, 14 + 20 + 8);
        assert_eq!(parsed.ip_id(&pkt), Some(0x1234));
    }

    #[test]
    fn test_parse_ipv4_tcp_header_length() {
        let pkt = ipv4_packet(L4Proto::TCP, 1, 128);
        let parsed = EthernetParser.parse(&pkt).unwrap();
        assert_eq!(parsed.payload_offset, 14 + 20 + 20);
    }

    #[test]
    fn test_parse_vlan_tagged() {
        let inner = ipv4_packet(L4Proto::UDP, 7, 100);
        let mut pkt = inner[..12].to_vec();
        pkt.extend_from_slice(&[0x81, 0x00, 0x00, 0x64]);
        pkt.extend_from_slice(&inner[12..]);
        let parsed = EthernetParser.parse(&pkt).unwrap();
        assert_eq!(parsed.l3_offset, 18);
        assert_eq!(parsed.ip_id(&pkt), Some(7));
    }

    #[test]
    fn test_set_ip_id_keeps_checksum_valid() {
        let mut pkt = ipv4_packet(L4Proto::UDP, 0, 80);
        let parsed = EthernetParser.parse(&pkt).unwrap();
        parsed.set_ip_id(&mut pkt, 0xff85).unwrap();
        assert_eq!(parsed.ip_id(&pkt), Some(0xff85));
        assert_eq!(ipv4_checksum(&pkt[14..34]), 0);
    }

    #[test]
    fn test_ipv6_flow_label() {
        let mut pkt = ipv6_packet(L4Proto::UDP, 0xf_0001, 100);
        let parsed = EthernetParser.parse(&pkt).unwrap();
        assert_eq!(parsed.l3, L3Proto::Ipv6);
        assert_eq!(parsed.ip_id(&pkt), Some(0xf_0001));
        parsed.set_ip_id(&mut pkt, 0xff90).unwrap();
        assert_eq!(parsed.ip_id(&pkt), Some(0xff90));
        assert_eq!(pkt[14] >> 4, 6);
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            EthernetParser.parse(&[0u8; 10]),
            Err(PacketParseError::Truncated { layer: "ethernet", .. })
        ));

        let mut arp = ipv4_packet(L4Proto::UDP, 0, 64);
        arp[12] = 0x08;
        arp[13] = 0x06;
        assert_eq!(
            EthernetParser.parse(&arp),
            Err(PacketParseError::UnsupportedEtherType(0x0806))
        );

        let pkt = ipv4_packet(L4Proto::UDP, 0, 64);
        assert!(matches!(
            EthernetParser.parse(&pkt[..30]),
            Err(PacketParseError::Truncated { layer: "ipv4", .. })
        ));
    }
}

//! Match-rule descriptors: rule kinds, protocols and platform capabilities.

use crate::ParseError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// How a packet group is identified on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    /// Slot encoded in the IP identification field (IPv6: flow label).
    HeaderId,
    /// Slot, epoch, sequence and timestamp carried in a payload trailer.
    Payload,
}

impl RuleKind {
    pub const ALL: [RuleKind; 2] = [RuleKind::HeaderId, RuleKind::Payload];

    pub const fn as_str(&self) -> &'static str {
        match self {
            RuleKind::HeaderId => "header_id",
            RuleKind::Payload => "payload",
        }
    }

    /// Capability bit advertised by platforms supporting this kind.
    pub const fn capability(&self) -> Capabilities {
        match self {
            RuleKind::HeaderId => Capabilities::HEADER_ID,
            RuleKind::Payload => Capabilities::PAYLOAD,
        }
    }
}

impl fmt::Display for RuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for RuleKind {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "header_id" | "ip_id" => Ok(RuleKind::HeaderId),
            "payload" | "latency" => Ok(RuleKind::Payload),
            _ => Err(ParseError::InvalidRuleKind(s.to_string())),
        }
    }
}

/// Network-layer protocol of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum L3Proto {
    Ipv4,
    Ipv6,
}

impl L3Proto {
    pub const fn ether_type(&self) -> u16 {
        match self {
            L3Proto::Ipv4 => 0x0800,
            L3Proto::Ipv6 => 0x86dd,
        }
    }
}

impl fmt::Display for L3Proto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            L3Proto::Ipv4 => write!(f, "ipv4"),
            L3Proto::Ipv6 => write!(f, "ipv6"),
        }
    }
}

/// Transport protocol, as the IP protocol / next-header number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct L4Proto(pub u8);

impl L4Proto {
    pub const ICMP: L4Proto = L4Proto(1);
    pub const TCP: L4Proto = L4Proto(6);
    pub const UDP: L4Proto = L4Proto(17);
    pub const ICMPV6: L4Proto = L4Proto(58);

    pub const fn number(&self) -> u8 {
        self.0
    }
}

impl fmt::Display for L4Proto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            L4Proto::ICMP => write!(f, "icmp"),
            L4Proto::TCP => write!(f, "tcp"),
            L4Proto::UDP => write!(f, "udp"),
            L4Proto::ICMPV6 => write!(f, "icmpv6"),
            L4Proto(n) => write!(f, "proto-{}", n),
        }
    }
}

impl FromStr for L4Proto {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "icmp" => Ok(L4Proto::ICMP),
            "tcp" => Ok(L4Proto::TCP),
            "udp" => Ok(L4Proto::UDP),
            "icmpv6" => Ok(L4Proto::ICMPV6),
            other => other
                .parse::<u8>()
                .map(L4Proto)
                .map_err(|_| ParseError::InvalidL4Proto(s.to_string())),
        }
    }
}

/// L3/L4 pair a match rule is programmed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlowProtocols {
    pub l3: L3Proto,
    pub l4: L4Proto,
}

impl FlowProtocols {
    pub const fn new(l3: L3Proto, l4: L4Proto) -> Self {
        Self { l3, l4 }
    }
}

impl fmt::Display for FlowProtocols {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.l3, self.l4)
    }
}

/// Rule kinds a platform can classify on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Capabilities(u16);

impl Capabilities {
    pub const NONE: Capabilities = Capabilities(0);
    pub const HEADER_ID: Capabilities = Capabilities(0x1);
    pub const PAYLOAD: Capabilities = Capabilities(0x2);
    pub const RX_BYTES: Capabilities = Capabilities(0x8);

    pub const fn from_bits(bits: u16) -> Self {
        Capabilities(bits)
    }

    pub const fn bits(&self) -> u16 {
        self.0
    }

    pub const fn contains(&self, other: Capabilities) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn union(self, other: Capabilities) -> Self {
        Capabilities(self.0 | other.0)
    }

    pub const fn supports(&self, kind: RuleKind) -> bool {
        self.contains(kind.capability())
    }
}

impl FromIterator<RuleKind> for Capabilities {
    fn from_iter<I: IntoIterator<Item = RuleKind>>(iter: I) -> Self {
        iter.into_iter()
            .fold(Capabilities::NONE, |caps, kind| caps.union(kind.capability()))
    }
}

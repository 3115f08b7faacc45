//! Identifier newtypes.

use serde::{Deserialize, Serialize};
use std::fmt;

/// User-chosen packet-group identifier.
///
/// Not necessarily dense. Several streams may share one id unless the group
/// carries payload-kind statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PacketGroupId(pub u32);

impl PacketGroupId {
    pub const fn as_u32(&self) -> u32 {
        self.0
    }
}

impl From<u32> for PacketGroupId {
    fn from(v: u32) -> Self {
        PacketGroupId(v)
    }
}

impl fmt::Display for PacketGroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Index into one of the slot pools.
///
/// A slot id alone does not say which pool it belongs to; callers always
/// carry the [`crate::RuleKind`] next to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SlotId(pub u16);

impl SlotId {
    pub const fn as_u16(&self) -> u16 {
        self.0
    }

    /// Returns the slot as an array index.
    pub const fn index(&self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Traffic port index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PortId(pub u8);

impl PortId {
    pub const fn index(&self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

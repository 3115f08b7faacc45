//! Encoding of slots in the identification field.

use crate::{ParseError, RuleKind, SlotId};
use serde::{Deserialize, Serialize};

/// Largest pool a platform may advertise.
pub const MAX_POOL_CAPACITY: u16 = 256;

/// Describes the reserved identification range and pool sizes.
///
/// Header-id slot `s` is sent as `reserved_base + s`. Payload streams all carry
/// the single sentinel `reserved_base + header_slots` and put their slot in the
/// payload trailer instead. Values below `reserved_base` are untagged traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdLayout {
    pub reserved_base: u16,
    pub header_slots: u16,
    pub payload_slots: u16,
}

/// Result of classifying an identification value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdClass {
    Untagged,
    HeaderId(SlotId),
    PayloadSentinel,
}

impl IdLayout {
    /// Builds a layout, checking that every header slot and the payload
    /// sentinel fit in 16 bits.
    pub fn new(reserved_base: u16, header_slots: u16, payload_slots: u16) -> Result<Self, ParseError> {
        if header_slots == 0 || payload_slots == 0 {
            return Err(ParseError::InvalidLayout("pool capacity must be non-zero".into()));
        }
        if header_slots > MAX_POOL_CAPACITY || payload_slots > MAX_POOL_CAPACITY {
            return Err(ParseError::InvalidLayout(format!(
                "pool capacity above {}",
                MAX_POOL_CAPACITY
            )));
        }
        if u32::from(reserved_base) + u32::from(header_slots) > 0xffff {
            return Err(ParseError::InvalidLayout(format!(
                "reserved base {:#06x} leaves no room for {} header slots and the payload sentinel",
                reserved_base, header_slots
            )));
        }
        Ok(Self {
            reserved_base,
            header_slots,
            payload_slots,
        })
    }

    /// Layout with the reserved range pushed to the top of the 16-bit space.
    pub fn with_capacities(header_slots: u16, payload_slots: u16) -> Result<Self, ParseError> {
        Self::new(0xffff_u16.saturating_sub(header_slots), header_slots, payload_slots)
    }

    pub const fn capacity(&self, kind: RuleKind) -> u16 {
        match kind {
            RuleKind::HeaderId => self.header_slots,
            RuleKind::Payload => self.payload_slots,
        }
    }

    /// Identification value carried by payload-kind streams.
    pub const fn payload_sentinel(&self) -> u16 {
        self.reserved_base.wrapping_add(self.header_slots)
    }

    /// Identification value for a header-id slot.
    pub const fn header_value(&self, slot: SlotId) -> u16 {
        self.reserved_base.wrapping_add(slot.0)
    }

    pub const fn is_reserved(&self, value: u32) -> bool {
        value >= self.reserved_base as u32 && value <= 0xffff
    }

    pub fn classify(&self, value: u32) -> IdClass {
        if !self.is_reserved(value) {
            return IdClass::Untagged;
        }
        let offset = value - u32::from(self.reserved_base);
        if offset < u32::from(self.header_slots) {
            // offset < header_slots <= 256
            IdClass::HeaderId(SlotId(offset as u16))
        } else if offset == u32::from(self.header_slots) {
            IdClass::PayloadSentinel
        } else {
            IdClass::Untagged
        }
    }
}

impl Default for IdLayout {
    fn default() -> Self {
        Self {
            reserved_base: 0xffff - 127,
            header_slots: 127,
            payload_slots: 128,
        }
    }
}

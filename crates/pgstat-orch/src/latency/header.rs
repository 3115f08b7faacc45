//! Payload trailer carried in the last bytes of latency-measured frames.
//!
//! Layout (little endian, 16 bytes):
//!
//! | offset | size | field        |
//! |--------|------|--------------|
//! | 0      | 1    | magic (0xAB) |
//! | 1      | 1    | flow epoch   |
//! | 2      | 2    | slot         |
//! | 4      | 4    | sequence     |
//! | 8      | 8    | send time ns |

use byteorder::{ByteOrder, LittleEndian};
use pgstat_common::SlotId;

pub const PAYLOAD_MAGIC: u8 = 0xAB;
pub const PAYLOAD_HEADER_LEN: usize = 16;

/// First sequence number of every payload flow. Close to the top of the
/// range so wraparound happens within the first packets.
pub const INITIAL_SEQ: u32 = u32::MAX - 1;

/// Frame check sequence bytes not present in captured frames.
pub const ETHERNET_FCS_LEN: u64 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadHeader {
    pub magic: u8,
    pub flow_epoch: u8,
    pub slot: u16,
    pub seq: u32,
    pub timestamp_ns: u64,
}

impl PayloadHeader {
    pub fn new(flow_epoch: u8, slot: SlotId, seq: u32, timestamp_ns: u64) -> Self {
        Self {
            magic: PAYLOAD_MAGIC,
            flow_epoch,
            slot: slot.as_u16(),
            seq,
            timestamp_ns,
        }
    }

    pub fn has_valid_magic(&self) -> bool {
        self.magic == PAYLOAD_MAGIC
    }

    /// Decodes the trailer from the end of `packet`.
    pub fn read_trailer(packet: &[u8]) -> Option<Self> {
        let start = packet.len().checked_sub(PAYLOAD_HEADER_LEN)?;
        let b = &packet[start..];
        Some(Self {
            magic: b[0],
            flow_epoch: b[1],
            slot: LittleEndian::read_u16(&b[2..4]),
            seq: LittleEndian::read_u32(&b[4..8]),
            timestamp_ns: LittleEndian::read_u64(&b[8..16]),
        })
    }

    /// Encodes the trailer over the last bytes of `packet`. Returns false if
    /// the packet cannot hold it.
    pub fn write_trailer(&self, packet: &mut [u8]) -> bool {
        let Some(start) = packet.len().checked_sub(PAYLOAD_HEADER_LEN) else {
            return false;
        };
        let b = &mut packet[start..];
        b[0] = self.magic;
        b[1] = self.flow_epoch;
        LittleEndian::write_u16(&mut b[2..4], self.slot);
        LittleEndian::write_u32(&mut b[4..8], self.seq);
        LittleEndian::write_u64(&mut b[8..16], self.timestamp_ns);
        true
    }
}

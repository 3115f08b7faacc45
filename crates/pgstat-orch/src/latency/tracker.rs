//! Per-packet classification on the receive path.

use super::header::{PayloadHeader, ETHERNET_FCS_LEN};
use super::rfc2544::{EpochVerdict, Rfc2544State, SeqVerdict};
use super::table::RxStatsTable;
use crate::clock;
use crate::counters::FlowCounter;
use crate::debug_log;
use crate::parser::PacketParser;
use pgstat_common::{IdClass, PortId, RuleKind, SlotId};
use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// What a received frame was counted as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketClass {
    Untagged,
    HeaderId(SlotId),
    Payload { slot: SlotId, verdict: SeqVerdict },
    BadHeader,
    StaleFlow,
}

/// Receive-side classifier and sequence validator.
///
/// Owns one [`Rfc2544State`] per payload slot and publishes counters into
/// the shared [`RxStatsTable`]. Never fails: malformed frames are counted
/// or ignored.
pub struct LatencyTracker {
    table: Arc<RxStatsTable>,
    parser: Box<dyn PacketParser>,
    slots: Vec<Rfc2544State>,
    pass_all: bool,
}

impl LatencyTracker {
    pub fn new(table: Arc<RxStatsTable>, parser: Box<dyn PacketParser>) -> Self {
        let slots = vec![Rfc2544State::default(); usize::from(table.layout().payload_slots)];
        Self {
            table,
            parser,
            slots,
            pass_all: false,
        }
    }

    pub fn table(&self) -> &Arc<RxStatsTable> {
        &self.table
    }

    pub fn set_pass_all(&mut self, enabled: bool) {
        self.pass_all = enabled;
    }

    pub fn pass_all(&self) -> bool {
        self.pass_all
    }

    pub fn slot_state(&self, slot: SlotId) -> Option<&Rfc2544State> {
        self.slots.get(slot.index())
    }

    /// Clears the payload slot for a new owner.
    pub fn arm_slot(&mut self, slot: SlotId) {
        if let Some(state) = self.slots.get_mut(slot.index()) {
            state.arm();
            if let Some(cell) = self.table.rfc2544_cell(slot) {
                cell.reset();
            }
            debug_log!("LatencyTracker", slot = slot.as_u16(), "armed payload slot");
        }
    }

    /// Marks the flow on `slot` as finished; its late packets become stale.
    pub fn retire_flow(&mut self, slot: SlotId) {
        if let Some(state) = self.slots.get_mut(slot.index()) {
            state.retire();
            debug_log!(
                "LatencyTracker",
                slot = slot.as_u16(),
                previous_epoch = ?state.previous_epoch,
                "retired payload flow"
            );
        }
    }

    pub fn handle_pkt(&mut self, packet: &[u8], port: PortId) -> PacketClass {
        self.handle_pkt_at(packet, port, clock::now_nanos())
    }

    /// Classifies one frame received on `port` at `now_ns`.
    pub fn handle_pkt_at(&mut self, packet: &[u8], port: PortId, now_ns: u64) -> PacketClass {
        let rx_bytes = packet.len() as u64 + ETHERNET_FCS_LEN;
        // pass-all: a recognizable trailer wins over the identification field
        if self.pass_all && self.recognized_trailer(packet).is_some() {
            return self.handle_payload(packet, port, rx_bytes, now_ns, false);
        }
        let ident = self
            .parser
            .parse(packet)
            .ok()
            .and_then(|p| p.ip_id(packet));

        match ident.map(|v| self.table.layout().classify(v)) {
            Some(IdClass::HeaderId(slot)) => {
                if let Some(cell) = self.table.counters.cell(port, RuleKind::HeaderId, slot) {
                    cell.add(rx_bytes);
                }
                PacketClass::HeaderId(slot)
            }
            Some(IdClass::PayloadSentinel) => self.handle_payload(packet, port, rx_bytes, now_ns, true),
            _ => PacketClass::Untagged,
        }
    }

    /// Trailer with valid magic naming an existing payload slot.
    fn recognized_trailer(&self, packet: &[u8]) -> Option<PayloadHeader> {
        PayloadHeader::read_trailer(packet)
            .filter(PayloadHeader::has_valid_magic)
            .filter(|h| usize::from(h.slot) < self.slots.len())
    }

    fn handle_payload(
        &mut self,
        packet: &[u8],
        port: PortId,
        rx_bytes: u64,
        now_ns: u64,
        tagged: bool,
    ) -> PacketClass {
        let Some(header) = PayloadHeader::read_trailer(packet).filter(PayloadHeader::has_valid_magic)
        else {
            return self.bad_header(tagged);
        };
        let slot = SlotId(header.slot);
        if slot.index() >= self.slots.len() {
            return self.bad_header(tagged);
        }
        let state = &mut self.slots[slot.index()];

        match state.check_epoch(header.flow_epoch) {
            EpochVerdict::Current => {}
            EpochVerdict::Adopted => {
                debug_log!(
                    "LatencyTracker",
                    slot = slot.as_u16(),
                    epoch = header.flow_epoch,
                    "adopted new flow epoch"
                );
            }
            EpochVerdict::Stale => {
                self.table.errors.stale_flow.fetch_add(1, Ordering::Relaxed);
                return PacketClass::StaleFlow;
            }
            EpochVerdict::Unknown => return self.bad_header(tagged),
        }

        let verdict = state.check_seq(header.seq);
        let latency_ns = now_ns.saturating_sub(header.timestamp_ns);
        state.record_latency(latency_ns as f64 / 1_000.0);

        if let Some(cell) = self.table.rfc2544_cell(slot) {
            cell.histogram.record(latency_ns / 1_000);
            cell.publish(state);
        }
        if let Some(cell) = self.table.counters.cell(port, RuleKind::Payload, slot) {
            cell.add(rx_bytes);
        }
        PacketClass::Payload { slot, verdict }
    }

    fn bad_header(&self, tagged: bool) -> PacketClass {
        if !tagged {
            return PacketClass::Untagged;
        }
        self.table.errors.bad_header.fetch_add(1, Ordering::Relaxed);
        PacketClass::BadHeader
    }

    /// Copies (optionally zeroing) the counters of slots `first..=last`.
    pub fn get_stats(
        &self,
        port: PortId,
        kind: RuleKind,
        first: SlotId,
        last: SlotId,
        reset: bool,
    ) -> Vec<FlowCounter> {
        self.table.counters.read(port, kind, first, last, reset)
    }
}

impl fmt::Debug for LatencyTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LatencyTracker")
            .field("layout", self.table.layout())
            .field("payload_slots", &self.slots.len())
            .field("pass_all", &self.pass_all)
            .finish()
    }
}

//! Counter storage shared between the receive core and the control plane.
//!
//! Every cell is an `AtomicU64` accessed with `Ordering::Relaxed`. The
//! receive core adds with `fetch_add`; the control plane reads with `load`
//! or zeroes with `swap(0)`. A snapshot may miss or include a packet that
//! lands concurrently, but never observes a torn value, and a zeroing read
//! loses no increments. Nothing here orders one cell against another: a
//! packet counter and its byte counter may disagree by one packet in a
//! snapshot taken mid-update. That is accepted for statistics display.

use super::histogram::LatencyHistogram;
use super::rfc2544::{Rfc2544Snapshot, Rfc2544State, SeqCounters};
use crate::counters::FlowCounter;
use pgstat_common::{IdLayout, PortId, RuleKind, SlotId};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct AtomicFlowCounter {
    pkts: AtomicU64,
    bytes: AtomicU64,
}

impl AtomicFlowCounter {
    pub fn add(&self, bytes: u64) {
        self.pkts.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn read(&self, reset: bool) -> FlowCounter {
        if reset {
            FlowCounter::new(
                self.pkts.swap(0, Ordering::Relaxed),
                self.bytes.swap(0, Ordering::Relaxed),
            )
        } else {
            FlowCounter::new(
                self.pkts.load(Ordering::Relaxed),
                self.bytes.load(Ordering::Relaxed),
            )
        }
    }
}

/// Per-port, per-kind, per-slot packet counters.
#[derive(Debug)]
pub struct SlotCounterTable {
    ports: Vec<[Vec<AtomicFlowCounter>; 2]>,
}

fn kind_index(kind: RuleKind) -> usize {
    match kind {
        RuleKind::HeaderId => 0,
        RuleKind::Payload => 1,
    }
}

fn counters(n: u16) -> Vec<AtomicFlowCounter> {
    (0..n).map(|_| AtomicFlowCounter::default()).collect()
}

impl SlotCounterTable {
    pub fn new(layout: &IdLayout, num_ports: usize) -> Self {
        Self {
            ports: (0..num_ports)
                .map(|_| [counters(layout.header_slots), counters(layout.payload_slots)])
                .collect(),
        }
    }

    pub fn num_ports(&self) -> usize {
        self.ports.len()
    }

    pub fn cell(&self, port: PortId, kind: RuleKind, slot: SlotId) -> Option<&AtomicFlowCounter> {
        self.ports
            .get(port.index())
            .and_then(|p| p[kind_index(kind)].get(slot.index()))
    }

    /// Counters of slots `first..=last`; slots outside the pool read as zero.
    pub fn read(
        &self,
        port: PortId,
        kind: RuleKind,
        first: SlotId,
        last: SlotId,
        reset: bool,
    ) -> Vec<FlowCounter> {
        (first.as_u16()..=last.as_u16())
            .map(|s| {
                self.cell(port, kind, SlotId(s))
                    .map(|c| c.read(reset))
                    .unwrap_or_default()
            })
            .collect()
    }
}

/// Published RFC 2544 counters and latency of one payload slot.
#[derive(Debug, Default)]
pub struct Rfc2544Cell {
    loss: AtomicU64,
    duplicate: AtomicU64,
    reorder: AtomicU64,
    event_high: AtomicU64,
    event_low: AtomicU64,
    jitter_bits: AtomicU64,
    pub histogram: LatencyHistogram,
}

impl Rfc2544Cell {
    /// Copies the receive-owned state into the shared cell.
    pub fn publish(&self, state: &Rfc2544State) {
        let c = &state.counters;
        self.loss.store(c.loss, Ordering::Relaxed);
        self.duplicate.store(c.duplicate, Ordering::Relaxed);
        self.reorder.store(c.reorder, Ordering::Relaxed);
        self.event_high.store(c.event_high, Ordering::Relaxed);
        self.event_low.store(c.event_low, Ordering::Relaxed);
        self.jitter_bits.store(state.jitter_usec.to_bits(), Ordering::Relaxed);
    }

    pub fn reset(&self) {
        self.publish(&Rfc2544State::default());
        self.histogram.reset();
    }

    pub fn snapshot(&self, take_window: bool) -> Rfc2544Snapshot {
        Rfc2544Snapshot {
            seq: SeqCounters {
                loss: self.loss.load(Ordering::Relaxed),
                duplicate: self.duplicate.load(Ordering::Relaxed),
                reorder: self.reorder.load(Ordering::Relaxed),
                event_high: self.event_high.load(Ordering::Relaxed),
                event_low: self.event_low.load(Ordering::Relaxed),
            },
            jitter_usec: f64::from_bits(self.jitter_bits.load(Ordering::Relaxed)),
            histogram: self.histogram.snapshot(take_window),
        }
    }
}

/// Receive-path error counters.
#[derive(Debug, Default)]
pub struct RxErrorCounters {
    pub bad_header: AtomicU64,
    pub stale_flow: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RxErrorSnapshot {
    pub bad_header: u64,
    pub stale_flow: u64,
}

/// Everything the receive core writes and the control plane reads.
#[derive(Debug)]
pub struct RxStatsTable {
    layout: IdLayout,
    pub counters: SlotCounterTable,
    rfc2544: Vec<Rfc2544Cell>,
    pub errors: RxErrorCounters,
}

impl RxStatsTable {
    pub fn new(layout: IdLayout, num_ports: usize) -> Self {
        Self {
            counters: SlotCounterTable::new(&layout, num_ports),
            rfc2544: (0..layout.payload_slots).map(|_| Rfc2544Cell::default()).collect(),
            errors: RxErrorCounters::default(),
            layout,
        }
    }

    pub fn layout(&self) -> &IdLayout {
        &self.layout
    }

    pub fn rfc2544_cell(&self, slot: SlotId) -> Option<&Rfc2544Cell> {
        self.rfc2544.get(slot.index())
    }

    pub fn read_rfc2544(&self, first: SlotId, last: SlotId, take_window: bool) -> Vec<Rfc2544Snapshot> {
        (first.as_u16()..=last.as_u16())
            .map(|s| {
                self.rfc2544_cell(SlotId(s))
                    .map(|c| c.snapshot(take_window))
                    .unwrap_or_default()
            })
            .collect()
    }

    pub fn read_errors(&self) -> RxErrorSnapshot {
        RxErrorSnapshot {
            bad_header: self.errors.bad_header.load(Ordering::Relaxed),
            stale_flow: self.errors.stale_flow.load(Ordering::Relaxed),
        }
    }
}

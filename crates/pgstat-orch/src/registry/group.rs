//! Per-group state held by the registry.

use crate::counters::CounterSet;
use crate::latency::Rfc2544Snapshot;
use pgstat_common::{FlowProtocols, HasRefCount, RuleKind, SlotId};
use serde::{Deserialize, Serialize};

/// Where a group is in its slot lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupLifecycle {
    /// Registered, no slot.
    Free,
    /// At least one stream transmitting on the slot.
    Running(SlotId),
    /// Slot still reserved, nothing transmitting.
    Stopped(SlotId),
}

/// Latency results of a payload group across slot bindings.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LatencySummary {
    /// Readings of the currently bound slot.
    pub current: Rfc2544Snapshot,
    /// Folded in from earlier bindings.
    pub carried: Rfc2544Snapshot,
}

impl LatencySummary {
    pub fn total(&self) -> Rfc2544Snapshot {
        let mut total = self.carried.clone();
        total.accumulate(&self.current);
        total
    }

    pub fn release_slot(&mut self) {
        let current = std::mem::take(&mut self.current);
        self.carried.accumulate(&current);
    }
}

#[derive(Debug, Clone)]
pub struct GroupState {
    pub rule_kind: RuleKind,
    pub protocols: FlowProtocols,
    pub(super) slot: Option<SlotId>,
    pub(super) ref_count: u32,
    pub(super) active_count: u32,
    pub counters: CounterSet,
    /// Present for payload groups only.
    pub latency: Option<LatencySummary>,
    /// Bumped for every newly created group.
    pub version: u32,
}

impl GroupState {
    pub(super) fn new(rule_kind: RuleKind, protocols: FlowProtocols, num_ports: usize, version: u32) -> Self {
        Self {
            rule_kind,
            protocols,
            slot: None,
            ref_count: 1,
            active_count: 0,
            counters: CounterSet::new(num_ports),
            latency: (rule_kind == RuleKind::Payload).then(LatencySummary::default),
            version,
        }
    }

    pub fn slot(&self) -> Option<SlotId> {
        self.slot
    }

    pub fn active_count(&self) -> u32 {
        self.active_count
    }

    pub fn lifecycle(&self) -> GroupLifecycle {
        match self.slot {
            None => GroupLifecycle::Free,
            Some(slot) if self.active_count > 0 => GroupLifecycle::Running(slot),
            Some(slot) => GroupLifecycle::Stopped(slot),
        }
    }
}

impl HasRefCount for GroupState {
    fn increment_ref(&mut self) -> u32 {
        self.ref_count += 1;
        self.ref_count
    }

    fn decrement_ref(&mut self) -> Option<u32> {
        self.ref_count = self.ref_count.checked_sub(1)?;
        Some(self.ref_count)
    }

    fn ref_count(&self) -> u32 {
        self.ref_count
    }
}

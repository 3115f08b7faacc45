//! Packet-group registry.
//!
//! Maps group ids to [`GroupState`] and enforces sharing rules: header-id
//! groups may be shared by several streams with the same L4 protocol,
//! payload groups belong to exactly one stream.

use super::group::GroupState;
use crate::error::{FlowStatError, Result};
use pgstat_common::{
    CountedMap, CountedMapError, FlowProtocols, HasRefCount, PacketGroupId, Release, RuleKind, SlotId,
};
use std::fmt;

pub struct GroupRegistry {
    groups: CountedMap<PacketGroupId, GroupState>,
    num_ports: usize,
    next_version: u32,
}

fn map_err(id: PacketGroupId, e: CountedMapError) -> FlowStatError {
    match e {
        CountedMapError::KeyNotFound => FlowStatError::NonExistentGroup(id),
        other => FlowStatError::Internal(format!("group {}: {}", id, other)),
    }
}

impl GroupRegistry {
    pub fn new(num_ports: usize) -> Self {
        Self {
            groups: CountedMap::new(),
            num_ports,
            next_version: 1,
        }
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn contains(&self, id: PacketGroupId) -> bool {
        self.groups.contains_key(&id)
    }

    pub fn get(&self, id: PacketGroupId) -> Option<&GroupState> {
        self.groups.get(&id)
    }

    pub fn get_mut(&mut self, id: PacketGroupId) -> Option<&mut GroupState> {
        self.groups.get_mut(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (PacketGroupId, &GroupState)> {
        self.groups.iter().map(|(id, g)| (*id, g))
    }

    pub fn ids_of_kind(&self, kind: RuleKind) -> Vec<PacketGroupId> {
        self.iter()
            .filter(|(_, g)| g.rule_kind == kind)
            .map(|(id, _)| id)
            .collect()
    }

    /// Checks whether a stream could join `id` without changing anything.
    pub fn check_add(&self, id: PacketGroupId, protocols: FlowProtocols, kind: RuleKind) -> Result<()> {
        let Some(existing) = self.groups.get(&id) else {
            return Ok(());
        };
        if kind == RuleKind::Payload || existing.rule_kind == RuleKind::Payload {
            return Err(FlowStatError::DuplicatePayloadGroupId(id));
        }
        if existing.protocols.l4 != protocols.l4 {
            return Err(FlowStatError::DifferentL4Kind {
                id,
                existing: existing.protocols.l4,
                requested: protocols.l4,
            });
        }
        Ok(())
    }

    /// Registers one more stream for `id`; returns the new reference count.
    pub fn add_stream(&mut self, id: PacketGroupId, protocols: FlowProtocols, kind: RuleKind) -> Result<u32> {
        self.check_add(id, protocols, kind)?;
        if self.groups.contains_key(&id) {
            return self.groups.acquire(&id).map_err(|e| map_err(id, e));
        }
        let group = GroupState::new(kind, protocols, self.num_ports, self.next_version);
        self.next_version = self.next_version.wrapping_add(1);
        self.groups.insert_new(id, group).map_err(|e| map_err(id, e))?;
        Ok(1)
    }

    /// Drops one stream of `id`; the entry is removed when none remain.
    /// The group must not own a slot when its last stream goes.
    pub fn del_stream(&mut self, id: PacketGroupId) -> Result<u32> {
        let group = self.groups.get(&id).ok_or(FlowStatError::NonExistentGroup(id))?;
        if group.ref_count() == 1 {
            if let Some(slot) = group.slot {
                return Err(FlowStatError::Internal(format!(
                    "group {} removed while owning slot {}",
                    id, slot
                )));
            }
        }
        match self.groups.release(&id).map_err(|e| map_err(id, e))? {
            Release::Remaining(n) => Ok(n),
            Release::Removed(_) => Ok(0),
        }
    }

    /// Binds a freshly allocated slot and counts the first active stream.
    pub fn start_stream_with_slot(&mut self, id: PacketGroupId, slot: SlotId) -> Result<u32> {
        let group = self.groups.get_mut(&id).ok_or(FlowStatError::NonExistentGroup(id))?;
        if let Some(bound) = group.slot {
            return Err(FlowStatError::AlreadyBound { id, slot: bound });
        }
        group.slot = Some(slot);
        group.active_count += 1;
        Ok(group.active_count)
    }

    /// Counts another active stream on a group that already owns a slot.
    pub fn start_stream(&mut self, id: PacketGroupId) -> Result<u32> {
        let group = self.groups.get_mut(&id).ok_or(FlowStatError::NonExistentGroup(id))?;
        if group.slot.is_none() {
            return Err(FlowStatError::SlotNotBound(id));
        }
        group.active_count += 1;
        Ok(group.active_count)
    }

    /// Returns the number of streams still active afterwards.
    pub fn stop_stream(&mut self, id: PacketGroupId) -> Result<u32> {
        let group = self.groups.get_mut(&id).ok_or(FlowStatError::NonExistentGroup(id))?;
        group.active_count = group.active_count.checked_sub(1).ok_or_else(|| {
            FlowStatError::Internal(format!("group {} stopped with no active streams", id))
        })?;
        Ok(group.active_count)
    }

    pub fn is_started(&self, id: PacketGroupId) -> bool {
        self.groups.get(&id).is_some_and(|g| g.active_count > 0)
    }

    /// Detaches the group from its slot, folding the slot's readings into
    /// the carried totals and clearing rate baselines.
    pub fn unmap(&mut self, id: PacketGroupId) -> Option<SlotId> {
        let group = self.groups.get_mut(&id)?;
        let slot = group.slot.take()?;
        group.counters.release_slot();
        if let Some(latency) = group.latency.as_mut() {
            latency.release_slot();
        }
        Some(slot)
    }
}

impl fmt::Debug for GroupRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GroupRegistry")
            .field("groups", &self.groups.len())
            .field("num_ports", &self.num_ports)
            .field("next_version", &self.next_version)
            .finish()
    }
}

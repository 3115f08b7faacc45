//! Fixed-capacity slot pools.
//!
//! Each pool maps a small slot index to the packet group currently using it.
//! The orchestrator owns one pool per [`RuleKind`] and is the only writer;
//! there is no internal locking.

use crate::error::{FlowStatError, Result};
use pgstat_common::{PacketGroupId, RuleKind, SlotId};
use std::fmt;

/// Occupancy of a single slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Free,
    Owner(PacketGroupId),
}

/// One pool of slots for a single rule kind.
pub struct SlotAllocator {
    kind: RuleKind,
    slots: Vec<SlotState>,
    free: usize,
    /// Highest slot index ever mapped; bounds counter reads.
    max_allocated: Option<SlotId>,
}

impl SlotAllocator {
    pub fn new(kind: RuleKind, capacity: u16) -> Self {
        Self {
            kind,
            slots: vec![SlotState::Free; usize::from(capacity)],
            free: usize::from(capacity),
            max_allocated: None,
        }
    }

    pub fn kind(&self) -> RuleKind {
        self.kind
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn free_count(&self) -> usize {
        self.free
    }

    pub fn max_allocated(&self) -> Option<SlotId> {
        self.max_allocated
    }

    /// Lowest free slot, if any.
    pub fn find_free(&self) -> Option<SlotId> {
        if self.free == 0 {
            return None;
        }
        self.slots
            .iter()
            .position(|s| *s == SlotState::Free)
            .and_then(|i| u16::try_from(i).ok())
            .map(SlotId)
    }

    /// Assigns `slot` to `id`. The slot must be free.
    pub fn map(&mut self, slot: SlotId, id: PacketGroupId) -> Result<()> {
        let kind = self.kind;
        let entry = self.slots.get_mut(slot.index()).ok_or_else(|| {
            FlowStatError::Internal(format!("{} slot {} out of range", kind, slot))
        })?;
        match *entry {
            SlotState::Free => {
                *entry = SlotState::Owner(id);
                self.free -= 1;
                if self.max_allocated.map_or(true, |m| slot > m) {
                    self.max_allocated = Some(slot);
                }
                Ok(())
            }
            SlotState::Owner(owner) => Err(FlowStatError::Internal(format!(
                "{} slot {} already owned by group {}",
                kind, slot, owner
            ))),
        }
    }

    /// Returns `slot` to the pool and hands back its previous owner.
    pub fn unmap(&mut self, slot: SlotId) -> Result<PacketGroupId> {
        let kind = self.kind;
        let entry = self.slots.get_mut(slot.index()).ok_or_else(|| {
            FlowStatError::Internal(format!("{} slot {} out of range", kind, slot))
        })?;
        match *entry {
            SlotState::Owner(owner) => {
                *entry = SlotState::Free;
                self.free += 1;
                Ok(owner)
            }
            SlotState::Free => Err(FlowStatError::Internal(format!(
                "{} slot {} released while free",
                kind, slot
            ))),
        }
    }

    pub fn owner(&self, slot: SlotId) -> Option<PacketGroupId> {
        match self.slots.get(slot.index()) {
            Some(SlotState::Owner(id)) => Some(*id),
            _ => None,
        }
    }

    /// Slots `0..=max_allocated` with their owners.
    pub fn allocated_range(&self) -> impl Iterator<Item = (SlotId, SlotState)> + '_ {
        let end = self.max_allocated.map_or(0, |m| m.index() + 1);
        self.slots[..end]
            .iter()
            .enumerate()
            .filter_map(|(i, s)| u16::try_from(i).ok().map(|i| (SlotId(i), *s)))
    }
}

impl fmt::Debug for SlotAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotAllocator")
            .field("kind", &self.kind)
            .field("capacity", &self.slots.len())
            .field("free", &self.free)
            .field("max_allocated", &self.max_allocated)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_new_pool_is_free() {
        let pool = SlotAllocator::new(RuleKind::HeaderId, 4);
        assert_eq!(pool.capacity(), 4);
        assert_eq!(pool.free_count(), 4);
        assert_eq!(pool.find_free(), Some(SlotId(0)));
        assert_eq!(pool.max_allocated(), None);
        assert_eq!(pool.allocated_range().count(), 0);
    }

    #[test]
    fn test_map_unmap_round_trip() {
        let mut pool = SlotAllocator::new(RuleKind::Payload, 3);
        pool.map(SlotId(0), PacketGroupId(10)).unwrap();
        pool.map(SlotId(1), PacketGroupId(11)).unwrap();
        assert_eq!(pool.free_count(), 1);
        assert_eq!(pool.find_free(), Some(SlotId(2)));
        assert_eq!(pool.owner(SlotId(1)), Some(PacketGroupId(11)));

        assert_eq!(pool.unmap(SlotId(0)).unwrap(), PacketGroupId(10));
        assert_eq!(pool.owner(SlotId(0)), None);
        assert_eq!(pool.find_free(), Some(SlotId(0)));
        assert_eq!(pool.free_count(), 2);
        assert_eq!(pool.max_allocated(), Some(SlotId(1)));
    }

    #[test]
    fn test_exhaustion() {
        let mut pool = SlotAllocator::new(RuleKind::HeaderId, 2);
        for i in 0..2 {
            let slot = pool.find_free().unwrap();
            pool.map(slot, PacketGroupId(i)).unwrap();
        }
        assert_eq!(pool.find_free(), None);
        assert_eq!(pool.free_count(), 0);
    }

    #[test]
    fn test_precondition_violations_are_errors() {
        let mut pool = SlotAllocator::new(RuleKind::HeaderId, 2);
        pool.map(SlotId(1), PacketGroupId(1)).unwrap();
        assert!(matches!(
            pool.map(SlotId(1), PacketGroupId(2)),
            Err(FlowStatError::Internal(_))
        ));
        assert!(matches!(pool.unmap(SlotId(0)), Err(FlowStatError::Internal(_))));
        assert!(matches!(
            pool.map(SlotId(9), PacketGroupId(3)),
            Err(FlowStatError::Internal(_))
        ));
        assert_eq!(pool.free_count(), 1);
    }

    #[test]
    fn test_allocated_range_covers_up_to_max() {
        let mut pool = SlotAllocator::new(RuleKind::HeaderId, 8);
        pool.map(SlotId(2), PacketGroupId(7)).unwrap();
        let range: Vec<_> = pool.allocated_range().collect();
        assert_eq!(range.len(), 3);
        assert_eq!(range[2], (SlotId(2), SlotState::Owner(PacketGroupId(7))));
        assert_eq!(range[0], (SlotId(0), SlotState::Free));
    }
}

//! Error types for flow statistics.

use pgstat_common::{L4Proto, PacketGroupId, RuleKind, SlotId};
use thiserror::Error;

/// Errors surfaced synchronously by the flow statistics control plane.
///
/// Receive-path problems are never reported through this type; they are
/// counted in the receive core's error table instead.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FlowStatError {
    #[error("Interface does not support {0} rules")]
    UnsupportedRuleKindForInterface(RuleKind),

    #[error("Group {id} already uses {existing}, stream requested {requested}")]
    DifferentL4Kind {
        id: PacketGroupId,
        existing: L4Proto,
        requested: L4Proto,
    },

    #[error("Payload group {0} is already used by another stream")]
    DuplicatePayloadGroupId(PacketGroupId),

    #[error("Group {0} does not exist")]
    NonExistentGroup(PacketGroupId),

    #[error("Group {id} is already bound to slot {slot}")]
    AlreadyBound { id: PacketGroupId, slot: SlotId },

    #[error("No free {0} slot")]
    NoFreeSlot(RuleKind),

    #[error("Packet of {len} bytes is too short for a payload trailer (needs {min})")]
    PayloadTooShort { len: usize, min: usize },

    #[error("Unparseable packet: {0}")]
    UnparseablePacket(String),

    #[error("Report requested for {requested} groups, maximum is {max}")]
    TooManyGroupsRequested { requested: usize, max: usize },

    #[error("RX core failed to start within {0} ms")]
    ReceiveCoreStartTimeout(u64),

    #[error("Stream {0} is not running")]
    NotRunning(u32),

    #[error("Group {0} does not own a slot")]
    SlotNotBound(PacketGroupId),

    #[error("Platform error: {0}")]
    Platform(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal state corrupted: {0}")]
    Internal(String),
}

impl FlowStatError {
    /// True for conditions that abort traffic start rather than reject input.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            FlowStatError::ReceiveCoreStartTimeout(_) | FlowStatError::Internal(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, FlowStatError>;

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_error_messages() {
        let err = FlowStatError::DifferentL4Kind {
            id: PacketGroupId(5),
            existing: L4Proto::UDP,
            requested: L4Proto::TCP,
        };
        assert_eq!(err.to_string(), "Group 5 already uses udp, stream requested tcp");
        assert_eq!(
            FlowStatError::NoFreeSlot(RuleKind::Payload).to_string(),
            "No free payload slot"
        );
    }

    #[test]
    fn test_fatal_classification() {
        assert!(FlowStatError::ReceiveCoreStartTimeout(500).is_fatal());
        assert!(!FlowStatError::NonExistentGroup(PacketGroupId(1)).is_fatal());
    }
}

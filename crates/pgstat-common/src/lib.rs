//! Common types for per-flow packet-group statistics.
//!
//! This crate provides the identifiers and protocol descriptors shared by the
//! control plane (group registry, slot pools) and the receive path:
//!
//! - [`PacketGroupId`]: user-chosen statistics bucket identifier
//! - [`SlotId`]: index into one of the fixed-capacity slot pools
//! - [`PortId`]: traffic port index
//! - [`RuleKind`], [`L3Proto`], [`L4Proto`], [`FlowProtocols`]: match-rule descriptors
//! - [`Capabilities`]: platform rule-kind capability bitmask
//! - [`IdLayout`]: how slots are encoded in the identification field
//! - [`CountedMap`]: reference-counted table that never auto-creates entries

mod counted_map;
mod ids;
mod layout;
mod proto;

pub use counted_map::{CountedMap, CountedMapError, HasRefCount, Release};
pub use ids::{PacketGroupId, PortId, SlotId};
pub use layout::{IdClass, IdLayout, MAX_POOL_CAPACITY};
pub use proto::{Capabilities, FlowProtocols, L3Proto, L4Proto, RuleKind};

/// Common error type for parsing failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("invalid rule kind: {0}")]
    InvalidRuleKind(String),

    #[error("invalid L4 protocol: {0}")]
    InvalidL4Proto(String),

    #[error("invalid id layout: {0}")]
    InvalidLayout(String),
}

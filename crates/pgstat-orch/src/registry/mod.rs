//! Packet-group registry: reference-counted group table.

mod group;
mod groups;

pub use group::{GroupLifecycle, GroupState, LatencySummary};
pub use groups::GroupRegistry;

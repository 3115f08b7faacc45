//! FlowStatOrch - per-flow statistics control plane.
//!
//! Streams register under a packet-group id. Starting the first stream of a
//! group binds the group to a slot of the header-id or payload pool,
//! installs a match rule per port and tags the stream packet with the slot.
//! Counters read back from the platform are folded into the group and
//! reported as JSON.

mod orch;
mod report;
mod types;

pub use orch::{
    FlowStatOrch, FlowStatOrchCallbacks, FlowStatOrchConfig, FlowStatOrchStats, PlatformInfo, SlotCounters,
    MAX_ALLOWED_PGID_LIST_LEN,
};
pub use report::{FlowStatReport, GlobalReport, GroupReport, LatencyReport, PortReport};
pub use types::{ActivePgids, FlowStatMode, PayloadStamp, RxStatsConfig, Stream, StreamState};

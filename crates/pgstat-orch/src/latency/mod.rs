//! Receive-path latency and sequence tracking for payload flows.
//!
//! - [`header`]: the 16-byte payload trailer
//! - [`rfc2544`]: per-slot sequence validator and jitter
//! - [`histogram`]: latency histogram
//! - [`table`]: counters shared with the control plane
//! - [`tracker`]: per-packet classification

pub mod header;
pub mod histogram;
pub mod rfc2544;
pub mod table;
pub mod tracker;

pub use header::{PayloadHeader, INITIAL_SEQ, PAYLOAD_HEADER_LEN, PAYLOAD_MAGIC};
pub use histogram::{HistogramSnapshot, LatencyHistogram};
pub use rfc2544::{EpochVerdict, Rfc2544Snapshot, Rfc2544State, SeqCounters, SeqVerdict, WRAP_THRESHOLD};
pub use table::{RxErrorSnapshot, RxStatsTable, SlotCounterTable};
pub use tracker::{LatencyTracker, PacketClass};

//! Per-flow packet-group statistics and latency measurement.
//!
//! - [`flow_stat`]: control plane; stream lifecycle, slot binding, reports
//! - [`registry`]: reference-counted packet-group table
//! - [`slots`]: fixed-capacity slot pools
//! - [`counters`]: per-group counters and rate estimation
//! - [`latency`]: receive-path classification, sequence and latency tracking
//! - [`rx_core`]: receive core task and its command channel
//! - [`platform`]: software platform over the receive core
//! - [`daemon`]: loopback scenario run by `pgstatd`

pub mod audit;
pub mod clock;
pub mod config;
pub mod counters;
pub mod daemon;
pub mod error;
pub mod flow_stat;
pub mod latency;
pub mod parser;
pub mod platform;
pub mod registry;
pub mod rx_core;
pub mod slots;

pub use config::{ConfigError, FlowStatConfig, StreamConfig};
pub use error::{FlowStatError, Result};
pub use flow_stat::{
    FlowStatMode, FlowStatOrch, FlowStatOrchCallbacks, FlowStatOrchConfig, FlowStatOrchStats, FlowStatReport,
    PlatformInfo, RxStatsConfig, SlotCounters, Stream, StreamState,
};
pub use latency::LatencyTracker;
pub use platform::SoftwarePlatform;
pub use rx_core::{rx_core_channel, RxCommand, RxCore, RxCoreHandle, RxFrame};
pub use slots::SlotAllocator;

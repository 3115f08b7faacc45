//! Stream-side types seen by the flow statistics orchestrator.

use pgstat_common::{PacketGroupId, RuleKind, SlotId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Per-stream flow statistics state.
///
/// Kept on the stream, not the group: several streams of one header-id
/// group can be in different states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamState {
    /// Never registered.
    #[default]
    Init,
    /// Registered, not transmitting.
    Free,
    /// Transmitting on the slot.
    Running(SlotId),
    /// Was transmitting; the group may still hold a slot.
    Stopped,
}

impl StreamState {
    pub fn is_running(&self) -> bool {
        matches!(self, StreamState::Running(_))
    }
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamState::Init => write!(f, "init"),
            StreamState::Free => write!(f, "free"),
            StreamState::Running(slot) => write!(f, "running({})", slot),
            StreamState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Statistics request attached to a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RxStatsConfig {
    pub enabled: bool,
    pub pg_id: PacketGroupId,
    pub rule_kind: RuleKind,
}

impl RxStatsConfig {
    pub fn new(pg_id: PacketGroupId, rule_kind: RuleKind) -> Self {
        Self {
            enabled: true,
            pg_id,
            rule_kind,
        }
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            pg_id: PacketGroupId(0),
            rule_kind: RuleKind::HeaderId,
        }
    }
}

/// Trailer parameters a payload stream stamps on every packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadStamp {
    pub slot: SlotId,
    pub flow_epoch: u8,
}

/// A traffic stream as far as flow statistics is concerned.
#[derive(Debug, Clone)]
pub struct Stream {
    pub id: u32,
    pub rx_stats: RxStatsConfig,
    /// Frame bytes without FCS; rewritten in place on start.
    pub packet: Vec<u8>,
    /// Smallest frame the stream sends; frame size may vary per packet.
    pub min_packet_len: usize,
    pub max_packet_len: usize,
    pub state: StreamState,
    /// Set while a payload stream is bound to a slot.
    pub payload: Option<PayloadStamp>,
}

impl Stream {
    pub fn new(id: u32, rx_stats: RxStatsConfig, packet: Vec<u8>) -> Self {
        let len = packet.len();
        Self {
            id,
            rx_stats,
            packet,
            min_packet_len: len,
            max_packet_len: len,
            state: StreamState::Init,
            payload: None,
        }
    }

    pub fn with_len_range(mut self, min: usize, max: usize) -> Self {
        self.min_packet_len = min;
        self.max_packet_len = max;
        self
    }

    pub fn pg_id(&self) -> PacketGroupId {
        self.rx_stats.pg_id
    }

    pub fn rule_kind(&self) -> RuleKind {
        self.rx_stats.rule_kind
    }
}

/// Receive-side classification mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowStatMode {
    #[default]
    Normal,
    /// Look for payload trailers on every frame.
    PassAll,
}

/// Registered group ids split by rule kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivePgids {
    pub header_id: Vec<PacketGroupId>,
    pub payload: Vec<PacketGroupId>,
}

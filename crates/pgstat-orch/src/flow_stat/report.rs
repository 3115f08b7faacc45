//! Serializable statistics report.

use crate::counters::{FlowCounter, PortCounters};
use crate::latency::{Rfc2544Snapshot, RxErrorSnapshot};
use crate::registry::{GroupLifecycle, GroupState};
use pgstat_common::{PacketGroupId, PortId, RuleKind};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortReport {
    pub rx_pkts: u64,
    pub rx_bytes: u64,
    pub tx_pkts: u64,
    pub tx_bytes: u64,
    pub rx_pps: f64,
    pub rx_bps: f64,
    pub tx_pps: f64,
    pub tx_bps: f64,
}

impl From<&PortCounters> for PortReport {
    fn from(c: &PortCounters) -> Self {
        let (rx, tx) = (c.rx_total(), c.tx_total());
        Self {
            rx_pkts: rx.pkts,
            rx_bytes: rx.bytes,
            tx_pkts: tx.pkts,
            tx_bytes: tx.bytes,
            rx_pps: c.rx_rate.pps(),
            rx_bps: c.rx_rate.bps(),
            tx_pps: c.tx_rate.pps(),
            tx_bps: c.tx_rate.bps(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatencyReport {
    #[serde(flatten)]
    pub rfc2544: Rfc2544Snapshot,
    pub average_usec: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupReport {
    pub version: u32,
    pub rule_kind: RuleKind,
    pub state: GroupLifecycle,
    pub ports: BTreeMap<PortId, PortReport>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub latency: Option<LatencyReport>,
}

impl From<&GroupState> for GroupReport {
    fn from(group: &GroupState) -> Self {
        Self {
            version: group.version,
            rule_kind: group.rule_kind,
            state: group.lifecycle(),
            ports: group
                .counters
                .iter()
                .map(|(port, c)| (port, PortReport::from(c)))
                .collect(),
            latency: group.latency.as_ref().map(|l| {
                let rfc2544 = l.total();
                LatencyReport {
                    average_usec: rfc2544.histogram.average_usec(),
                    rfc2544,
                }
            }),
        }
    }
}

/// Counters not attributable to any group.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GlobalReport {
    pub rx_orphan: BTreeMap<PortId, FlowCounter>,
    pub tx_orphan: BTreeMap<PortId, FlowCounter>,
    #[serde(flatten)]
    pub rx_errors: RxErrorSnapshot,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowStatReport {
    /// RFC 3339, UTC.
    pub timestamp: String,
    pub groups: BTreeMap<PacketGroupId, GroupReport>,
    pub global: GlobalReport,
}

impl FlowStatReport {
    pub fn new(groups: BTreeMap<PacketGroupId, GroupReport>, global: GlobalReport) -> Self {
        Self {
            timestamp: chrono::Utc::now().to_rfc3339(),
            groups,
            global,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn to_json_pretty(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

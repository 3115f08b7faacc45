//! Software implementation of the flow statistics platform.
//!
//! Match rules are only recorded; classification happens in the receive
//! core, whose shared tables back every counter read. Transmit counters live
//! in a table of their own, fed by [`SoftwarePlatform::transmit`].

use crate::clock;
use crate::flow_stat::{FlowStatOrchCallbacks, PlatformInfo, SlotCounters, Stream, StreamState};
use crate::latency::header::ETHERNET_FCS_LEN;
use crate::latency::{PayloadHeader, Rfc2544Snapshot, RxErrorSnapshot, SlotCounterTable};
use crate::rx_core::{RxCommand, RxCoreHandle, RxFrame};
use crate::warn_log;
use parking_lot::Mutex;
use pgstat_common::{Capabilities, FlowProtocols, PortId, RuleKind, SlotId};
use std::collections::HashSet;
use std::fmt;
use tokio::sync::oneshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstalledRule {
    pub port: PortId,
    pub kind: RuleKind,
    pub protocols: FlowProtocols,
    pub slot: SlotId,
}

pub struct SoftwarePlatform {
    info: PlatformInfo,
    rx: RxCoreHandle,
    tx: SlotCounterTable,
    rules: Mutex<HashSet<InstalledRule>>,
}

impl SoftwarePlatform {
    pub fn new(capabilities: Capabilities, rx: RxCoreHandle) -> Self {
        let layout = *rx.table().layout();
        let num_ports = rx.table().counters.num_ports();
        let ports = (0..num_ports)
            .filter_map(|p| u8::try_from(p).ok().map(PortId))
            .collect();
        Self {
            info: PlatformInfo {
                capabilities,
                layout,
                ports,
            },
            tx: SlotCounterTable::new(&layout, num_ports),
            rx,
            rules: Mutex::new(HashSet::new()),
        }
    }

    pub fn rx_handle(&self) -> &RxCoreHandle {
        &self.rx
    }

    pub fn has_rule(&self, rule: &InstalledRule) -> bool {
        self.rules.lock().contains(rule)
    }

    pub fn rule_count(&self) -> usize {
        self.rules.lock().len()
    }

    fn check_port(&self, port: PortId) -> Result<(), String> {
        if self.info.ports.contains(&port) {
            Ok(())
        } else {
            Err(format!("unknown port {}", port))
        }
    }

    /// Sends one copy of the stream's packet out of `port` and returns the
    /// frame as looped back to the receive side.
    ///
    /// Payload streams get their trailer stamped with `seq` and the current
    /// time. Transmit counters are only kept for running streams with
    /// statistics enabled.
    pub fn transmit(&self, stream: &Stream, port: PortId, seq: u32) -> Option<RxFrame> {
        let mut data = stream.packet.clone();
        if let Some(stamp) = stream.payload {
            let header = PayloadHeader::new(stamp.flow_epoch, stamp.slot, seq, clock::now_nanos());
            if !header.write_trailer(&mut data) {
                warn_log!("SoftwarePlatform", stream = stream.id, "packet too short for payload trailer");
                return None;
            }
        }
        if let (true, StreamState::Running(slot)) = (stream.rx_stats.enabled, stream.state) {
            if let Some(cell) = self.tx.cell(port, stream.rule_kind(), slot) {
                cell.add(data.len() as u64 + ETHERNET_FCS_LEN);
            }
        }
        Some(RxFrame { port, data })
    }
}

impl FlowStatOrchCallbacks for SoftwarePlatform {
    fn platform_info(&self) -> PlatformInfo {
        self.info.clone()
    }

    fn install_match_rule(
        &self,
        port: PortId,
        kind: RuleKind,
        protocols: FlowProtocols,
        slot: SlotId,
    ) -> Result<(), String> {
        self.check_port(port)?;
        self.rules.lock().insert(InstalledRule {
            port,
            kind,
            protocols,
            slot,
        });
        Ok(())
    }

    fn remove_match_rule(
        &self,
        port: PortId,
        kind: RuleKind,
        protocols: FlowProtocols,
        slot: SlotId,
    ) -> Result<(), String> {
        self.rules.lock().remove(&InstalledRule {
            port,
            kind,
            protocols,
            slot,
        });
        Ok(())
    }

    fn read_counters(
        &self,
        port: PortId,
        kind: RuleKind,
        first: SlotId,
        last: SlotId,
        reset: bool,
    ) -> Result<Vec<SlotCounters>, String> {
        self.check_port(port)?;
        let rx = self.rx.table().counters.read(port, kind, first, last, reset);
        let tx = self.tx.read(port, kind, first, last, reset);
        Ok(rx
            .into_iter()
            .zip(tx)
            .map(|(rx, tx)| SlotCounters { rx, tx })
            .collect())
    }

    fn read_rfc2544(&self, first: SlotId, last: SlotId, take_window: bool) -> Result<Vec<Rfc2544Snapshot>, String> {
        Ok(self.rx.table().read_rfc2544(first, last, take_window))
    }

    fn read_rx_errors(&self) -> RxErrorSnapshot {
        self.rx.table().read_errors()
    }

    fn send_enable_latency(&self) -> Result<oneshot::Receiver<()>, String> {
        self.rx.enable_latency().map_err(|e| e.to_string())
    }

    fn send_disable_latency(&self) -> Result<(), String> {
        self.rx.send(RxCommand::DisableLatency).map_err(|e| e.to_string())
    }

    fn arm_payload_slot(&self, slot: SlotId) -> Result<(), String> {
        self.rx.send(RxCommand::ArmPayloadSlot(slot)).map_err(|e| e.to_string())
    }

    fn retire_payload_flow(&self, slot: SlotId) -> Result<(), String> {
        self.rx.send(RxCommand::RetirePayloadFlow(slot)).map_err(|e| e.to_string())
    }

    fn set_pass_all(&self, enabled: bool) -> Result<(), String> {
        self.rx.send(RxCommand::SetPassAll(enabled)).map_err(|e| e.to_string())
    }
}

impl fmt::Debug for SoftwarePlatform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SoftwarePlatform")
            .field("info", &self.info)
            .field("rules", &self.rule_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow_stat::{PayloadStamp, RxStatsConfig};
    use crate::parser::build::ipv4_packet;
    use crate::parser::EthernetParser;
    use crate::rx_core::{rx_core_channel, RxCore};
    use pgstat_common::{IdLayout, L3Proto, L4Proto, PacketGroupId};
    use pretty_assertions::assert_eq;

    fn platform() -> (SoftwarePlatform, RxCore) {
        let (core, handle) = rx_core_channel(IdLayout::default(), 2, Box::new(EthernetParser));
        let caps = RuleKind::ALL.into_iter().collect();
        (SoftwarePlatform::new(caps, handle), core)
    }

    #[test]
    fn test_platform_info_from_rx_table() {
        let (platform, _core) = platform();
        let info = platform.platform_info();
        assert_eq!(info.ports, vec![PortId(0), PortId(1)]);
        assert_eq!(info.layout, IdLayout::default());
        assert!(info.capabilities.supports(RuleKind::Payload));
    }

    #[test]
    fn test_rules_are_recorded() {
        let (platform, _core) = platform();
        let udp4 = FlowProtocols::new(L3Proto::Ipv4, L4Proto::UDP);
        platform
            .install_match_rule(PortId(1), RuleKind::HeaderId, udp4, SlotId(2))
            .unwrap();
        assert!(platform.has_rule(&InstalledRule {
            port: PortId(1),
            kind: RuleKind::HeaderId,
            protocols: udp4,
            slot: SlotId(2),
        }));
        assert!(platform
            .install_match_rule(PortId(9), RuleKind::HeaderId, udp4, SlotId(2))
            .is_err());

        platform
            .remove_match_rule(PortId(1), RuleKind::HeaderId, udp4, SlotId(2))
            .unwrap();
        platform
            .remove_match_rule(PortId(1), RuleKind::HeaderId, udp4, SlotId(2))
            .unwrap();
        assert_eq!(platform.rule_count(), 0);
    }

    #[test]
    fn test_transmit_counts_and_loops_back() {
        let (platform, mut core) = platform();
        let layout = IdLayout::default();
        let mut stream = Stream::new(
            1,
            RxStatsConfig::new(PacketGroupId(5), RuleKind::Payload),
            ipv4_packet(L4Proto::UDP, layout.payload_sentinel(), 100),
        );
        stream.state = StreamState::Running(SlotId(4));
        stream.payload = Some(PayloadStamp {
            slot: SlotId(4),
            flow_epoch: 7,
        });

        platform.send_enable_latency().unwrap();
        platform.arm_payload_slot(SlotId(4)).unwrap();
        let frame = platform.transmit(&stream, PortId(0), 0).unwrap();
        assert_eq!(PayloadHeader::read_trailer(&frame.data).map(|h| h.flow_epoch), Some(7));
        core.handle_frame(&frame);

        let read = platform
            .read_counters(PortId(0), RuleKind::Payload, SlotId(4), SlotId(4), false)
            .unwrap();
        assert_eq!(read[0].tx.pkts, 1);
        assert_eq!(read[0].tx.bytes, 104);
        assert_eq!(read[0].rx.pkts, 1);
        assert_eq!(platform.read_rx_errors(), RxErrorSnapshot::default());
    }

    #[test]
    fn test_transmit_rejects_short_payload_packet() {
        let (platform, _core) = platform();
        let mut stream = Stream::new(
            1,
            RxStatsConfig::new(PacketGroupId(5), RuleKind::Payload),
            vec![0; 10],
        );
        stream.payload = Some(PayloadStamp {
            slot: SlotId(0),
            flow_epoch: 1,
        });
        assert!(platform.transmit(&stream, PortId(0), 0).is_none());
    }
}

//! Flow statistics orchestration logic.

use super::report::{FlowStatReport, GlobalReport, GroupReport};
use super::types::{ActivePgids, FlowStatMode, PayloadStamp, Stream, StreamState};
use crate::audit::{AuditCategory, AuditOutcome, AuditRecord};
use crate::clock;
use crate::counters::FlowCounter;
use crate::error::{FlowStatError, Result};
use crate::latency::{Rfc2544Snapshot, RxErrorSnapshot, PAYLOAD_HEADER_LEN};
use crate::parser::{EthernetParser, PacketParser, ParsedPacket};
use crate::registry::GroupRegistry;
use crate::slots::{SlotAllocator, SlotState};
use crate::{audit_log, debug_log, error_log, info_log, warn_log};
use pgstat_common::{
    Capabilities, FlowProtocols, HasRefCount, IdLayout, PacketGroupId, PortId, RuleKind, SlotId,
};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

/// Default cap on the number of groups a single report may cover.
pub const MAX_ALLOWED_PGID_LIST_LEN: usize = 1024;

/// Applied to reserved identification values of streams without statistics.
const RESERVED_ID_SCRUB_MASK: u32 = 0xefff;

/// What the platform can do, queried once when callbacks are installed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformInfo {
    pub capabilities: Capabilities,
    pub layout: IdLayout,
    pub ports: Vec<PortId>,
}

/// Receive and transmit readings of one slot on one port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SlotCounters {
    pub rx: FlowCounter,
    pub tx: FlowCounter,
}

/// Platform operations driven by [`FlowStatOrch`].
pub trait FlowStatOrchCallbacks: Send + Sync {
    fn platform_info(&self) -> PlatformInfo;
    fn install_match_rule(
        &self,
        port: PortId,
        kind: RuleKind,
        protocols: FlowProtocols,
        slot: SlotId,
    ) -> std::result::Result<(), String>;
    /// Removing a rule that is not installed must succeed.
    fn remove_match_rule(
        &self,
        port: PortId,
        kind: RuleKind,
        protocols: FlowProtocols,
        slot: SlotId,
    ) -> std::result::Result<(), String>;
    /// Readings of slots `first..=last`, zeroed afterwards when `reset` is set.
    fn read_counters(
        &self,
        port: PortId,
        kind: RuleKind,
        first: SlotId,
        last: SlotId,
        reset: bool,
    ) -> std::result::Result<Vec<SlotCounters>, String>;
    fn read_rfc2544(
        &self,
        first: SlotId,
        last: SlotId,
        take_window: bool,
    ) -> std::result::Result<Vec<Rfc2544Snapshot>, String>;
    fn read_rx_errors(&self) -> RxErrorSnapshot;
    /// The receiver resolves once the receive core classifies frames.
    fn send_enable_latency(&self) -> std::result::Result<oneshot::Receiver<()>, String>;
    fn send_disable_latency(&self) -> std::result::Result<(), String>;
    fn arm_payload_slot(&self, slot: SlotId) -> std::result::Result<(), String>;
    fn retire_payload_flow(&self, slot: SlotId) -> std::result::Result<(), String>;
    fn set_pass_all(&self, enabled: bool) -> std::result::Result<(), String>;
}

#[derive(Debug, Clone)]
pub struct FlowStatOrchConfig {
    /// How long the first start waits for the receive core.
    pub rx_start_timeout: Duration,
    pub rx_start_poll: Duration,
    pub max_pgid_list_len: usize,
}

impl Default for FlowStatOrchConfig {
    fn default() -> Self {
        Self {
            rx_start_timeout: Duration::from_millis(500),
            rx_start_poll: Duration::from_millis(1),
            max_pgid_list_len: MAX_ALLOWED_PGID_LIST_LEN,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlowStatOrchStats {
    pub streams_added: u64,
    pub streams_started: u64,
    pub streams_stopped: u64,
    pub streams_deleted: u64,
    pub streams_reset: u64,
    pub slots_allocated: u64,
    pub slots_released: u64,
    pub rule_failures: u64,
    pub rx_core_enables: u64,
    pub rx_core_disables: u64,
    pub periodic_updates: u64,
}

/// Control plane of per-flow statistics.
///
/// Owns both slot pools and the group registry and keeps them consistent:
/// a group holds `Some(slot)` exactly when the pool records it as the
/// slot's owner. All operations run on the control thread and complete
/// synchronously; the only wait is the bounded receive-core enable.
pub struct FlowStatOrch {
    config: FlowStatOrchConfig,
    stats: FlowStatOrchStats,
    callbacks: Option<Arc<dyn FlowStatOrchCallbacks>>,
    capabilities: Capabilities,
    layout: IdLayout,
    ports: Vec<PortId>,
    header_pool: SlotAllocator,
    payload_pool: SlotAllocator,
    registry: GroupRegistry,
    parser: Box<dyn PacketParser>,
    num_started_streams: u32,
    payload_epochs: Vec<u8>,
    rx_orphan: Vec<FlowCounter>,
    tx_orphan: Vec<FlowCounter>,
    mode: FlowStatMode,
}

impl FlowStatOrch {
    pub fn new(config: FlowStatOrchConfig) -> Self {
        Self::with_parser(config, Box::new(EthernetParser))
    }

    pub fn with_parser(config: FlowStatOrchConfig, parser: Box<dyn PacketParser>) -> Self {
        Self {
            config,
            stats: FlowStatOrchStats::default(),
            callbacks: None,
            capabilities: Capabilities::NONE,
            layout: IdLayout::default(),
            ports: Vec::new(),
            header_pool: SlotAllocator::new(RuleKind::HeaderId, 0),
            payload_pool: SlotAllocator::new(RuleKind::Payload, 0),
            registry: GroupRegistry::new(0),
            parser,
            num_started_streams: 0,
            payload_epochs: Vec::new(),
            rx_orphan: Vec::new(),
            tx_orphan: Vec::new(),
            mode: FlowStatMode::Normal,
        }
    }

    /// Installs the platform and sizes the pools from what it reports.
    pub fn set_callbacks(&mut self, callbacks: Arc<dyn FlowStatOrchCallbacks>) {
        let info = callbacks.platform_info();
        if self.registry.is_empty() {
            let num_ports = info.ports.iter().map(|p| p.index() + 1).max().unwrap_or(0);
            self.header_pool = SlotAllocator::new(RuleKind::HeaderId, info.layout.header_slots);
            self.payload_pool = SlotAllocator::new(RuleKind::Payload, info.layout.payload_slots);
            self.registry = GroupRegistry::new(num_ports);
            self.payload_epochs = vec![0; usize::from(info.layout.payload_slots)];
            self.rx_orphan = vec![FlowCounter::default(); num_ports];
            self.tx_orphan = vec![FlowCounter::default(); num_ports];
            self.capabilities = info.capabilities;
            self.layout = info.layout;
            self.ports = info.ports;
            info_log!(
                "FlowStatOrch",
                header_slots = self.layout.header_slots,
                payload_slots = self.layout.payload_slots,
                ports = self.ports.len(),
                "platform attached"
            );
        } else {
            warn_log!(
                "FlowStatOrch",
                groups = self.registry.len(),
                "callbacks replaced with groups registered; keeping slot pools"
            );
        }
        self.callbacks = Some(callbacks);
    }

    pub fn config(&self) -> &FlowStatOrchConfig {
        &self.config
    }

    pub fn stats(&self) -> &FlowStatOrchStats {
        &self.stats
    }

    pub fn layout(&self) -> &IdLayout {
        &self.layout
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    pub fn ports(&self) -> &[PortId] {
        &self.ports
    }

    pub fn registry(&self) -> &GroupRegistry {
        &self.registry
    }

    pub fn pool(&self, kind: RuleKind) -> &SlotAllocator {
        match kind {
            RuleKind::HeaderId => &self.header_pool,
            RuleKind::Payload => &self.payload_pool,
        }
    }

    fn pool_mut(&mut self, kind: RuleKind) -> &mut SlotAllocator {
        match kind {
            RuleKind::HeaderId => &mut self.header_pool,
            RuleKind::Payload => &mut self.payload_pool,
        }
    }

    pub fn num_started_streams(&self) -> u32 {
        self.num_started_streams
    }

    pub fn mode(&self) -> FlowStatMode {
        self.mode
    }

    fn callbacks(&self) -> Result<Arc<dyn FlowStatOrchCallbacks>> {
        self.callbacks
            .as_ref()
            .map(Arc::clone)
            .ok_or_else(|| FlowStatError::Platform("No callbacks set".to_string()))
    }

    fn parse(&self, stream: &Stream) -> Result<ParsedPacket> {
        self.parser
            .parse(&stream.packet)
            .map_err(|e| FlowStatError::UnparseablePacket(e.to_string()))
    }

    fn validate(&self, stream: &Stream) -> Result<ParsedPacket> {
        let kind = stream.rule_kind();
        if !self.capabilities.supports(kind) {
            return Err(FlowStatError::UnsupportedRuleKindForInterface(kind));
        }
        let parsed = self.parse(stream)?;
        if kind == RuleKind::Payload {
            let min = parsed.payload_offset + PAYLOAD_HEADER_LEN;
            let len = stream.min_packet_len.min(stream.packet.len());
            if len < min {
                return Err(FlowStatError::PayloadTooShort { len, min });
            }
        }
        self.registry
            .check_add(stream.pg_id(), parsed.protocols(), kind)?;
        Ok(parsed)
    }

    /// Resets the stream to its never-registered state.
    pub fn init_stream(stream: &mut Stream) {
        stream.state = StreamState::Init;
        stream.payload = None;
    }

    /// Runs every check of [`add_stream`](Self::add_stream) without
    /// registering anything.
    pub fn verify_stream(&self, stream: &Stream) -> Result<()> {
        if !stream.rx_stats.enabled {
            return Ok(());
        }
        self.validate(stream).map(|_| ())
    }

    pub fn add_stream(&mut self, stream: &mut Stream) -> Result<()> {
        if !stream.rx_stats.enabled {
            return Ok(());
        }
        if stream.state != StreamState::Init {
            debug_log!("FlowStatOrch", stream = stream.id, "stream already registered");
            return Ok(());
        }
        let parsed = self.validate(stream)?;
        let id = stream.pg_id();
        let kind = stream.rule_kind();
        let refs = self.registry.add_stream(id, parsed.protocols(), kind)?;
        if refs == 1 {
            audit_log!(AuditRecord::new(
                AuditCategory::ResourceCreate,
                "FlowStatOrch",
                "create_group"
            )
            .with_outcome(AuditOutcome::Success)
            .with_object_id(id.to_string())
            .with_object_type(kind.as_str())
            .with_details(serde_json::json!({
                "protocols": parsed.protocols().to_string(),
            })));
        }
        stream.state = StreamState::Free;
        self.stats.streams_added += 1;
        Ok(())
    }

    /// Binds the stream's group to a slot, if it has none yet, and tags the
    /// stream packet so received copies can be attributed.
    pub fn start_stream(&mut self, stream: &mut Stream) -> Result<()> {
        if !stream.rx_stats.enabled {
            self.scrub_reserved_id(stream);
            return Ok(());
        }
        if stream.state.is_running() {
            debug_log!("FlowStatOrch", stream = stream.id, "stream already running");
            return Ok(());
        }
        if stream.state == StreamState::Init {
            self.add_stream(stream)?;
        }
        let callbacks = self.callbacks()?;
        let id = stream.pg_id();
        let kind = stream.rule_kind();
        let parsed = self.parse(stream)?;

        let group = self
            .registry
            .get(id)
            .ok_or(FlowStatError::NonExistentGroup(id))?;
        let bound = group.slot();
        let protocols = group.protocols;
        let slot = match bound {
            Some(slot) => slot,
            None => self
                .pool(kind)
                .find_free()
                .ok_or(FlowStatError::NoFreeSlot(kind))?,
        };

        let tag = match kind {
            RuleKind::HeaderId => self.layout.header_value(slot),
            RuleKind::Payload => self.layout.payload_sentinel(),
        };
        let mut packet = stream.packet.clone();
        parsed
            .set_ip_id(&mut packet, tag)
            .map_err(|e| FlowStatError::UnparseablePacket(e.to_string()))?;

        let first_start = self.num_started_streams == 0;
        if first_start {
            self.enable_rx_core(&callbacks)?;
        }
        let attached = match bound {
            Some(_) => self.registry.start_stream(id).map(|_| ()),
            None => self.bind_slot(&callbacks, id, kind, protocols, slot),
        };
        if let Err(e) = attached {
            if first_start {
                self.disable_rx_core(&callbacks);
            }
            return Err(e);
        }

        if kind == RuleKind::Payload {
            stream.payload = Some(PayloadStamp {
                slot,
                flow_epoch: self.next_flow_epoch(slot),
            });
        }
        stream.packet = packet;
        stream.state = StreamState::Running(slot);
        self.num_started_streams += 1;
        self.stats.streams_started += 1;
        debug_log!(
            "FlowStatOrch",
            stream = stream.id,
            group = id.as_u32(),
            slot = slot.as_u16(),
            "stream started"
        );
        Ok(())
    }

    fn next_flow_epoch(&mut self, slot: SlotId) -> u8 {
        match self.payload_epochs.get_mut(slot.index()) {
            Some(epoch) => {
                *epoch = epoch.wrapping_add(1);
                *epoch
            }
            None => 0,
        }
    }

    fn bind_slot(
        &mut self,
        callbacks: &Arc<dyn FlowStatOrchCallbacks>,
        id: PacketGroupId,
        kind: RuleKind,
        protocols: FlowProtocols,
        slot: SlotId,
    ) -> Result<()> {
        self.pool_mut(kind).map(slot, id)?;
        if let Err(e) = self.registry.start_stream_with_slot(id, slot) {
            if let Err(unmap) = self.pool_mut(kind).unmap(slot) {
                error_log!("FlowStatOrch", error = %unmap, "slot pool rollback failed");
            }
            return Err(e);
        }

        let mut installed = Vec::with_capacity(self.ports.len());
        let mut programmed = self.ports.iter().try_for_each(|&port| {
            callbacks.install_match_rule(port, kind, protocols, slot)?;
            installed.push(port);
            callbacks
                .read_counters(port, kind, slot, slot, true)
                .map(|_| ())
        });
        if kind == RuleKind::Payload {
            programmed = programmed.and_then(|()| callbacks.arm_payload_slot(slot));
        }

        if let Err(reason) = programmed {
            self.stats.rule_failures += 1;
            for port in installed {
                if let Err(e) = callbacks.remove_match_rule(port, kind, protocols, slot) {
                    warn_log!("FlowStatOrch", port = port.index(), error = %e, "rule rollback failed");
                }
            }
            self.registry.stop_stream(id)?;
            self.registry.unmap(id);
            self.pool_mut(kind).unmap(slot)?;
            audit_log!(AuditRecord::new(
                AuditCategory::ResourceCreate,
                "FlowStatOrch",
                "allocate_slot"
            )
            .with_outcome(AuditOutcome::Failure)
            .with_object_id(slot.to_string())
            .with_object_type(kind.as_str())
            .with_error(reason.clone()));
            return Err(FlowStatError::Platform(reason));
        }

        self.stats.slots_allocated += 1;
        audit_log!(AuditRecord::new(
            AuditCategory::ResourceCreate,
            "FlowStatOrch",
            "allocate_slot"
        )
        .with_outcome(AuditOutcome::Success)
        .with_object_id(slot.to_string())
        .with_object_type(kind.as_str())
        .with_details(serde_json::json!({ "group": id.as_u32() })));
        Ok(())
    }

    /// Blocks until the receive core acknowledges, at most
    /// `rx_start_timeout`.
    fn enable_rx_core(&mut self, callbacks: &Arc<dyn FlowStatOrchCallbacks>) -> Result<()> {
        let mut ack = callbacks
            .send_enable_latency()
            .map_err(FlowStatError::Platform)?;
        audit_log!(AuditRecord::new(
            AuditCategory::SystemLifecycle,
            "FlowStatOrch",
            "enable_rx_core"
        )
        .with_details(serde_json::json!({
            "timeout_ms": u64::try_from(self.config.rx_start_timeout.as_millis()).unwrap_or(u64::MAX),
        })));
        let deadline = Instant::now() + self.config.rx_start_timeout;
        loop {
            match ack.try_recv() {
                Ok(()) => break,
                Err(oneshot::error::TryRecvError::Closed) => {
                    return Err(FlowStatError::Platform(
                        "receive core dropped the enable request".to_string(),
                    ));
                }
                Err(oneshot::error::TryRecvError::Empty) if Instant::now() >= deadline => {
                    let ms = u64::try_from(self.config.rx_start_timeout.as_millis()).unwrap_or(u64::MAX);
                    error_log!("FlowStatOrch", timeout_ms = ms, "receive core did not start");
                    audit_log!(AuditRecord::new(
                        AuditCategory::SystemLifecycle,
                        "FlowStatOrch",
                        "enable_rx_core"
                    )
                    .with_outcome(AuditOutcome::Failure)
                    .with_error(format!("no acknowledgement within {} ms", ms)));
                    self.disable_rx_core(callbacks);
                    return Err(FlowStatError::ReceiveCoreStartTimeout(ms));
                }
                Err(oneshot::error::TryRecvError::Empty) => std::thread::sleep(self.config.rx_start_poll),
            }
        }
        self.stats.rx_core_enables += 1;
        Ok(())
    }

    fn disable_rx_core(&mut self, callbacks: &Arc<dyn FlowStatOrchCallbacks>) {
        if let Err(e) = callbacks.send_disable_latency() {
            warn_log!("FlowStatOrch", error = %e, "failed to disable receive core");
        }
        self.stats.rx_core_disables += 1;
    }

    pub fn stop_stream(&mut self, stream: &mut Stream) -> Result<()> {
        if !stream.rx_stats.enabled {
            return Ok(());
        }
        let StreamState::Running(slot) = stream.state else {
            return Err(FlowStatError::NotRunning(stream.id));
        };
        let callbacks = self.callbacks()?;
        let id = stream.pg_id();
        let active = self.registry.stop_stream(id)?;
        stream.state = StreamState::Stopped;

        if stream.rule_kind() == RuleKind::Payload {
            if let Err(e) = callbacks.retire_payload_flow(slot) {
                warn_log!("FlowStatOrch", slot = slot.as_u16(), error = %e, "failed to retire payload flow");
            }
            stream.payload = None;
        }
        if active == 0 {
            if let Err(e) = self.collect_group(&callbacks, id, false) {
                warn_log!("FlowStatOrch", group = id.as_u32(), error = %e, "final counter read failed");
            }
            if let Some(group) = self.registry.get_mut(id) {
                group.counters.stop_rates();
            }
            audit_log!(AuditRecord::new(
                AuditCategory::ResourceModify,
                "FlowStatOrch",
                "stop_group"
            )
            .with_outcome(AuditOutcome::Success)
            .with_object_id(id.to_string())
            .with_object_type(stream.rule_kind().as_str())
            .with_details(serde_json::json!({ "slot": slot.as_u16() })));
        }

        self.num_started_streams = self.num_started_streams.saturating_sub(1);
        if self.num_started_streams == 0 {
            self.disable_rx_core(&callbacks);
        }
        self.stats.streams_stopped += 1;
        Ok(())
    }

    /// Reads the group's slot one more time without feeding the rates.
    /// With `reset` the slot counters are zeroed by the read.
    fn collect_group(
        &mut self,
        callbacks: &Arc<dyn FlowStatOrchCallbacks>,
        id: PacketGroupId,
        reset: bool,
    ) -> Result<()> {
        let Some(group) = self.registry.get(id) else {
            return Ok(());
        };
        let Some(slot) = group.slot() else {
            return Ok(());
        };
        let kind = group.rule_kind;

        let mut readings = Vec::with_capacity(self.ports.len());
        for &port in &self.ports {
            let counters = callbacks
                .read_counters(port, kind, slot, slot, reset)
                .map_err(FlowStatError::Platform)?;
            readings.push((port, counters.first().copied().unwrap_or_default()));
        }
        let latency = match kind {
            RuleKind::Payload => callbacks
                .read_rfc2544(slot, slot, false)
                .map_err(FlowStatError::Platform)?
                .into_iter()
                .next(),
            RuleKind::HeaderId => None,
        };

        if let Some(group) = self.registry.get_mut(id) {
            for (port, c) in readings {
                group.counters.update(port, c.rx, c.tx, None);
            }
            if let (Some(summary), Some(snapshot)) = (group.latency.as_mut(), latency) {
                summary.current = snapshot;
            }
        }
        Ok(())
    }

    /// Gives the group's slot back to its pool. No stream of the group may
    /// be active.
    fn release_slot(&mut self, callbacks: &Arc<dyn FlowStatOrchCallbacks>, id: PacketGroupId) -> Result<()> {
        let Some(group) = self.registry.get(id) else {
            return Ok(());
        };
        let Some(slot) = group.slot() else {
            return Ok(());
        };
        if group.active_count() > 0 {
            return Err(FlowStatError::Internal(format!(
                "group {} releasing slot {} with {} active streams",
                id,
                slot,
                group.active_count()
            )));
        }
        let (kind, protocols) = (group.rule_kind, group.protocols);

        // leaves the slot zeroed for its next owner
        if let Err(e) = self.collect_group(callbacks, id, true) {
            warn_log!("FlowStatOrch", group = id.as_u32(), error = %e, "final counter read failed");
        }
        for &port in &self.ports {
            if let Err(e) = callbacks.remove_match_rule(port, kind, protocols, slot) {
                warn_log!("FlowStatOrch", port = port.index(), error = %e, "failed to remove match rule");
            }
        }
        self.registry.unmap(id);
        let owner = self.pool_mut(kind).unmap(slot)?;
        if owner != id {
            error_log!(
                "FlowStatOrch",
                slot = slot.as_u16(),
                owner = owner.as_u32(),
                group = id.as_u32(),
                "slot owned by another group"
            );
            return Err(FlowStatError::Internal(format!(
                "{} slot {} owned by group {}, released by group {}",
                kind, slot, owner, id
            )));
        }

        self.stats.slots_released += 1;
        audit_log!(AuditRecord::new(
            AuditCategory::ResourceDelete,
            "FlowStatOrch",
            "release_slot"
        )
        .with_outcome(AuditOutcome::Success)
        .with_object_id(slot.to_string())
        .with_object_type(kind.as_str())
        .with_details(serde_json::json!({ "group": id.as_u32() })));
        Ok(())
    }

    /// Drops the stream's reference on its group. Deleting a stream that is
    /// not registered succeeds without doing anything.
    pub fn del_stream(&mut self, stream: &mut Stream) -> Result<()> {
        if !stream.rx_stats.enabled || stream.state == StreamState::Init {
            return Ok(());
        }
        if stream.state.is_running() {
            self.stop_stream(stream)?;
        }
        let id = stream.pg_id();
        let Some(group) = self.registry.get(id) else {
            Self::init_stream(stream);
            return Ok(());
        };
        if group.ref_count() == 1 && group.slot().is_some() {
            let callbacks = self.callbacks()?;
            self.release_slot(&callbacks, id)?;
        }
        if self.registry.del_stream(id)? == 0 {
            audit_log!(AuditRecord::new(
                AuditCategory::ResourceDelete,
                "FlowStatOrch",
                "delete_group"
            )
            .with_outcome(AuditOutcome::Success)
            .with_object_id(id.to_string())
            .with_object_type(stream.rule_kind().as_str()));
        }
        Self::init_stream(stream);
        self.stats.streams_deleted += 1;
        Ok(())
    }

    /// Releases the group's slot when no stream of it transmits, keeping the
    /// group itself registered.
    pub fn reset_stream(&mut self, stream: &mut Stream) -> Result<()> {
        if !stream.rx_stats.enabled || stream.state == StreamState::Init {
            return Ok(());
        }
        if stream.state.is_running() {
            self.stop_stream(stream)?;
        }
        let id = stream.pg_id();
        let Some(group) = self.registry.get(id) else {
            Self::init_stream(stream);
            return Ok(());
        };
        if group.active_count() == 0 && group.slot().is_some() {
            let callbacks = self.callbacks()?;
            self.release_slot(&callbacks, id)?;
        }
        stream.state = StreamState::Free;
        stream.payload = None;
        self.stats.streams_reset += 1;
        Ok(())
    }

    /// Carries statistics state over to a copy of a compiled stream.
    pub fn copy_state(from: &Stream, to: &mut Stream) {
        to.state = from.state;
        to.payload = from.payload;
    }

    fn scrub_reserved_id(&self, stream: &mut Stream) {
        let Ok(parsed) = self.parser.parse(&stream.packet) else {
            return;
        };
        let Some(value) = parsed.ip_id(&stream.packet) else {
            return;
        };
        if !self.layout.is_reserved(value) {
            return;
        }
        let Some(scrubbed) = Self::scrubbed_id(&self.layout, value) else {
            warn_log!("FlowStatOrch", stream = stream.id, value, "no unreserved identification available");
            return;
        };
        match parsed.set_ip_id(&mut stream.packet, scrubbed) {
            Ok(()) => debug_log!(
                "FlowStatOrch",
                stream = stream.id,
                from = value,
                to = scrubbed,
                "reserved identification rewritten"
            ),
            Err(e) => warn_log!("FlowStatOrch", stream = stream.id, error = %e, "failed to rewrite identification"),
        }
    }

    /// Unreserved replacement for a reserved identification value. The
    /// fixed mask is used while it clears the reserved range; lower bases
    /// fold the value below `reserved_base`.
    fn scrubbed_id(layout: &IdLayout, value: u32) -> Option<u16> {
        let masked = value & RESERVED_ID_SCRUB_MASK;
        let scrubbed = if !layout.is_reserved(masked) {
            masked
        } else if layout.reserved_base > 0 {
            value % u32::from(layout.reserved_base)
        } else {
            return None;
        };
        u16::try_from(scrubbed).ok()
    }

    pub fn get_active_pgids(&self) -> ActivePgids {
        ActivePgids {
            header_id: self.registry.ids_of_kind(RuleKind::HeaderId),
            payload: self.registry.ids_of_kind(RuleKind::Payload),
        }
    }

    pub fn set_mode(&mut self, mode: FlowStatMode) -> Result<()> {
        let callbacks = self.callbacks()?;
        callbacks
            .set_pass_all(mode == FlowStatMode::PassAll)
            .map_err(FlowStatError::Platform)?;
        let previous = std::mem::replace(&mut self.mode, mode);
        audit_log!(AuditRecord::new(
            AuditCategory::ConfigurationChange,
            "FlowStatOrch",
            "set_mode"
        )
        .with_outcome(AuditOutcome::Success)
        .with_details(serde_json::json!({
            "from": format!("{:?}", previous),
            "to": format!("{:?}", mode),
        })));
        Ok(())
    }

    /// Folds slot readings of both pools into group counters and feeds the
    /// rate estimators of started groups.
    pub fn periodic_update(&mut self) -> Result<()> {
        let callbacks = self.callbacks()?;
        let now = clock::now_nanos();
        for kind in RuleKind::ALL {
            self.update_pool(&callbacks, kind, now)?;
        }
        self.stats.periodic_updates += 1;
        Ok(())
    }

    fn update_pool(
        &mut self,
        callbacks: &Arc<dyn FlowStatOrchCallbacks>,
        kind: RuleKind,
        now: u64,
    ) -> Result<()> {
        let pool = self.pool(kind);
        let Some(last) = pool.max_allocated() else {
            return Ok(());
        };
        let owners: Vec<(SlotId, SlotState)> = pool.allocated_range().collect();
        let first = SlotId(0);

        for port in self.ports.clone() {
            let readings = callbacks
                .read_counters(port, kind, first, last, false)
                .map_err(FlowStatError::Platform)?;
            for (reading, &(slot, owner)) in readings.iter().zip(&owners) {
                match owner {
                    SlotState::Owner(id) => {
                        let rate_at = self.registry.is_started(id).then_some(now);
                        if let Some(group) = self.registry.get_mut(id) {
                            group.counters.update(port, reading.rx, reading.tx, rate_at);
                        }
                    }
                    SlotState::Free if reading.rx.is_zero() && reading.tx.is_zero() => {}
                    SlotState::Free => {
                        let drained = callbacks
                            .read_counters(port, kind, slot, slot, true)
                            .map_err(FlowStatError::Platform)?;
                        for c in drained {
                            self.add_orphan(port, c);
                        }
                    }
                }
            }
        }

        if kind == RuleKind::Payload {
            let snapshots = callbacks
                .read_rfc2544(first, last, true)
                .map_err(FlowStatError::Platform)?;
            for (snapshot, &(_, owner)) in snapshots.into_iter().zip(&owners) {
                let SlotState::Owner(id) = owner else {
                    continue;
                };
                if let Some(summary) = self.registry.get_mut(id).and_then(|g| g.latency.as_mut()) {
                    summary.current = snapshot;
                }
            }
        }
        Ok(())
    }

    fn add_orphan(&mut self, port: PortId, c: SlotCounters) {
        if let Some(rx) = self.rx_orphan.get_mut(port.index()) {
            *rx += c.rx;
        }
        if let Some(tx) = self.tx_orphan.get_mut(port.index()) {
            *tx += c.tx;
        }
    }

    fn orphan_map(counters: &[FlowCounter]) -> BTreeMap<PortId, FlowCounter> {
        counters
            .iter()
            .enumerate()
            .filter_map(|(i, c)| u8::try_from(i).ok().map(|i| (PortId(i), *c)))
            .collect()
    }

    /// Updates counters and builds a report of `ids`, or of every group.
    ///
    /// Requests covering more than `max_pgid_list_len` groups fail before
    /// anything is read.
    pub fn report(&mut self, ids: Option<&[PacketGroupId]>) -> Result<FlowStatReport> {
        let requested = ids.map_or(self.registry.len(), <[PacketGroupId]>::len);
        let max = self.config.max_pgid_list_len;
        if requested > max {
            return Err(FlowStatError::TooManyGroupsRequested { requested, max });
        }
        let callbacks = self.callbacks()?;
        self.periodic_update()?;

        let groups = match ids {
            Some(ids) => ids
                .iter()
                .filter_map(|&id| self.registry.get(id).map(|g| (id, GroupReport::from(g))))
                .collect(),
            None => self
                .registry
                .iter()
                .map(|(id, g)| (id, GroupReport::from(g)))
                .collect(),
        };
        let global = GlobalReport {
            rx_orphan: Self::orphan_map(&self.rx_orphan),
            tx_orphan: Self::orphan_map(&self.tx_orphan),
            rx_errors: callbacks.read_rx_errors(),
        };
        Ok(FlowStatReport::new(groups, global))
    }

    pub fn dump_json(&mut self, ids: Option<&[PacketGroupId]>) -> Result<String> {
        self.report(ids)?
            .to_json()
            .map_err(|e| FlowStatError::Internal(e.to_string()))
    }
}

impl fmt::Debug for FlowStatOrch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowStatOrch")
            .field("config", &self.config)
            .field("stats", &self.stats)
            .field("has_callbacks", &self.callbacks.is_some())
            .field("layout", &self.layout)
            .field("header_pool", &self.header_pool)
            .field("payload_pool", &self.payload_pool)
            .field("registry", &self.registry)
            .field("num_started_streams", &self.num_started_streams)
            .field("mode", &self.mode)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::super::types::RxStatsConfig;
    use super::*;
    use crate::parser::build::{ipv4_packet, ipv6_packet};
    use pgstat_common::L4Proto;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;
    use std::sync::Mutex;

    type Rule = (PortId, RuleKind, SlotId);

    struct MockCallbacks {
        info: PlatformInfo,
        ack_enable: bool,
        fail_install: Mutex<bool>,
        installed: Mutex<Vec<Rule>>,
        removed: Mutex<Vec<Rule>>,
        counters: Mutex<HashMap<Rule, SlotCounters>>,
        rfc2544: Mutex<HashMap<SlotId, Rfc2544Snapshot>>,
        messages: Mutex<Vec<String>>,
        pending_acks: Mutex<Vec<oneshot::Sender<()>>>,
    }

    impl MockCallbacks {
        fn new(layout: IdLayout) -> Self {
            Self {
                info: PlatformInfo {
                    capabilities: RuleKind::ALL.into_iter().collect(),
                    layout,
                    ports: vec![PortId(0), PortId(1)],
                },
                ack_enable: true,
                fail_install: Mutex::new(false),
                installed: Mutex::new(Vec::new()),
                removed: Mutex::new(Vec::new()),
                counters: Mutex::new(HashMap::new()),
                rfc2544: Mutex::new(HashMap::new()),
                messages: Mutex::new(Vec::new()),
                pending_acks: Mutex::new(Vec::new()),
            }
        }

        fn set_counter(&self, port: PortId, kind: RuleKind, slot: SlotId, rx: u64, tx: u64) {
            self.counters.lock().unwrap().insert(
                (port, kind, slot),
                SlotCounters {
                    rx: FlowCounter::new(rx, rx * 64),
                    tx: FlowCounter::new(tx, tx * 60),
                },
            );
        }

        fn messages(&self) -> Vec<String> {
            self.messages.lock().unwrap().clone()
        }
    }

    impl FlowStatOrchCallbacks for MockCallbacks {
        fn platform_info(&self) -> PlatformInfo {
            self.info.clone()
        }

        fn install_match_rule(
            &self,
            port: PortId,
            kind: RuleKind,
            _protocols: FlowProtocols,
            slot: SlotId,
        ) -> std::result::Result<(), String> {
            if *self.fail_install.lock().unwrap() && port == PortId(1) {
                return Err("TCAM full".to_string());
            }
            self.installed.lock().unwrap().push((port, kind, slot));
            Ok(())
        }

        fn remove_match_rule(
            &self,
            port: PortId,
            kind: RuleKind,
            _protocols: FlowProtocols,
            slot: SlotId,
        ) -> std::result::Result<(), String> {
            self.removed.lock().unwrap().push((port, kind, slot));
            Ok(())
        }

        fn read_counters(
            &self,
            port: PortId,
            kind: RuleKind,
            first: SlotId,
            last: SlotId,
            reset: bool,
        ) -> std::result::Result<Vec<SlotCounters>, String> {
            let mut counters = self.counters.lock().unwrap();
            Ok((first.as_u16()..=last.as_u16())
                .map(|s| {
                    let key = (port, kind, SlotId(s));
                    if reset {
                        counters.remove(&key).unwrap_or_default()
                    } else {
                        counters.get(&key).copied().unwrap_or_default()
                    }
                })
                .collect())
        }

        fn read_rfc2544(
            &self,
            first: SlotId,
            last: SlotId,
            _take_window: bool,
        ) -> std::result::Result<Vec<Rfc2544Snapshot>, String> {
            let snaps = self.rfc2544.lock().unwrap();
            Ok((first.as_u16()..=last.as_u16())
                .map(|s| snaps.get(&SlotId(s)).cloned().unwrap_or_default())
                .collect())
        }

        fn read_rx_errors(&self) -> RxErrorSnapshot {
            RxErrorSnapshot {
                bad_header: 1,
                stale_flow: 2,
            }
        }

        fn send_enable_latency(&self) -> std::result::Result<oneshot::Receiver<()>, String> {
            self.messages.lock().unwrap().push("enable".to_string());
            let (tx, rx) = oneshot::channel();
            if self.ack_enable {
                let _ = tx.send(());
            } else {
                self.pending_acks.lock().unwrap().push(tx);
            }
            Ok(rx)
        }

        fn send_disable_latency(&self) -> std::result::Result<(), String> {
            self.messages.lock().unwrap().push("disable".to_string());
            Ok(())
        }

        fn arm_payload_slot(&self, slot: SlotId) -> std::result::Result<(), String> {
            self.messages.lock().unwrap().push(format!("arm {}", slot));
            Ok(())
        }

        fn retire_payload_flow(&self, slot: SlotId) -> std::result::Result<(), String> {
            self.messages.lock().unwrap().push(format!("retire {}", slot));
            Ok(())
        }

        fn set_pass_all(&self, enabled: bool) -> std::result::Result<(), String> {
            self.messages.lock().unwrap().push(format!("pass_all {}", enabled));
            Ok(())
        }
    }

    #[derive(Clone)]
    struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn small_layout() -> IdLayout {
        IdLayout::new(0xff00, 3, 2).unwrap()
    }

    fn orch_with(mock: MockCallbacks, config: FlowStatOrchConfig) -> (FlowStatOrch, Arc<MockCallbacks>) {
        let mock = Arc::new(mock);
        let mut orch = FlowStatOrch::new(config);
        orch.set_callbacks(mock.clone());
        (orch, mock)
    }

    fn orch() -> (FlowStatOrch, Arc<MockCallbacks>) {
        orch_with(MockCallbacks::new(small_layout()), FlowStatOrchConfig::default())
    }

    fn header_stream(stream_id: u32, pg: u32) -> Stream {
        Stream::new(
            stream_id,
            RxStatsConfig::new(PacketGroupId(pg), RuleKind::HeaderId),
            ipv4_packet(L4Proto::UDP, 0x1234, 64),
        )
    }

    fn payload_stream(stream_id: u32, pg: u32) -> Stream {
        Stream::new(
            stream_id,
            RxStatsConfig::new(PacketGroupId(pg), RuleKind::Payload),
            ipv4_packet(L4Proto::UDP, 0x1234, 128),
        )
    }

    fn ip_id(stream: &Stream) -> Option<u32> {
        EthernetParser
            .parse(&stream.packet)
            .ok()
            .and_then(|p| p.ip_id(&stream.packet))
    }

    #[test]
    fn test_set_callbacks_sizes_pools() {
        let (orch, _) = orch();
        assert_eq!(orch.pool(RuleKind::HeaderId).capacity(), 3);
        assert_eq!(orch.pool(RuleKind::Payload).capacity(), 2);
        assert_eq!(orch.ports(), &[PortId(0), PortId(1)]);
    }

    #[test]
    fn test_operations_without_callbacks_fail() {
        let mut orch = FlowStatOrch::new(FlowStatOrchConfig::default());
        assert!(matches!(orch.periodic_update(), Err(FlowStatError::Platform(_))));
        assert!(matches!(orch.set_mode(FlowStatMode::PassAll), Err(FlowStatError::Platform(_))));
    }

    #[test]
    fn test_unsupported_rule_kind() {
        let mut mock = MockCallbacks::new(small_layout());
        mock.info.capabilities = Capabilities::HEADER_ID;
        let (mut orch, _) = orch_with(mock, FlowStatOrchConfig::default());
        let mut s = payload_stream(1, 1);
        assert_eq!(
            orch.add_stream(&mut s),
            Err(FlowStatError::UnsupportedRuleKindForInterface(RuleKind::Payload))
        );
        assert_eq!(s.state, StreamState::Init);
        assert!(orch.registry().is_empty());
    }

    #[test]
    fn test_unparseable_and_short_packets() {
        let (mut orch, _) = orch();
        let mut garbage = header_stream(1, 1);
        garbage.packet = vec![0xff; 20];
        assert!(matches!(
            orch.add_stream(&mut garbage),
            Err(FlowStatError::UnparseablePacket(_))
        ));

        let mut short = payload_stream(2, 2);
        short.packet = ipv4_packet(L4Proto::UDP, 0, 54);
        short.min_packet_len = 54;
        assert_eq!(
            orch.add_stream(&mut short),
            Err(FlowStatError::PayloadTooShort { len: 54, min: 58 })
        );

        let varying = payload_stream(3, 3).with_len_range(50, 128);
        assert_eq!(
            orch.verify_stream(&varying),
            Err(FlowStatError::PayloadTooShort { len: 50, min: 58 })
        );
        assert!(orch.registry().is_empty());
    }

    #[test]
    fn test_verify_does_not_register() {
        let (mut orch, _) = orch();
        let s = header_stream(1, 5);
        orch.verify_stream(&s).unwrap();
        assert!(!orch.registry().contains(PacketGroupId(5)));

        let mut first = payload_stream(2, 6);
        orch.add_stream(&mut first).unwrap();
        assert_eq!(
            orch.verify_stream(&payload_stream(3, 6)),
            Err(FlowStatError::DuplicatePayloadGroupId(PacketGroupId(6)))
        );
        assert_eq!(orch.registry().get(PacketGroupId(6)).unwrap().ref_count(), 1);
    }

    #[test]
    fn test_shared_header_group_uses_one_slot() {
        let (mut orch, mock) = orch();
        let mut a = header_stream(1, 10);
        let mut b = header_stream(2, 10);
        let free_before = orch.pool(RuleKind::HeaderId).free_count();

        orch.start_stream(&mut a).unwrap();
        assert_eq!(a.state, StreamState::Running(SlotId(0)));
        assert_eq!(orch.pool(RuleKind::HeaderId).free_count(), free_before - 1);
        assert_eq!(ip_id(&a), Some(0xff00));

        orch.start_stream(&mut b).unwrap();
        assert_eq!(b.state, StreamState::Running(SlotId(0)));
        assert_eq!(orch.pool(RuleKind::HeaderId).free_count(), free_before - 1);
        assert_eq!(mock.installed.lock().unwrap().len(), 2);
        assert_eq!(orch.registry().get(PacketGroupId(10)).unwrap().active_count(), 2);
        assert_eq!(mock.messages(), vec!["enable"]);
    }

    #[test]
    fn test_slot_round_trip() {
        let (mut orch, mock) = orch();
        let free_before = orch.pool(RuleKind::HeaderId).free_count();
        let mut a = header_stream(1, 10);
        let mut b = header_stream(2, 10);
        orch.start_stream(&mut a).unwrap();
        orch.start_stream(&mut b).unwrap();

        orch.stop_stream(&mut a).unwrap();
        orch.stop_stream(&mut b).unwrap();
        assert_eq!(a.state, StreamState::Stopped);
        assert_eq!(orch.pool(RuleKind::HeaderId).free_count(), free_before - 1);

        orch.del_stream(&mut a).unwrap();
        assert_eq!(orch.pool(RuleKind::HeaderId).free_count(), free_before - 1);
        orch.del_stream(&mut b).unwrap();
        assert_eq!(orch.pool(RuleKind::HeaderId).free_count(), free_before);
        assert!(orch.registry().is_empty());
        assert_eq!(mock.removed.lock().unwrap().len(), 2);
        assert_eq!(mock.messages(), vec!["enable", "disable"]);
        assert_eq!(orch.stats().slots_allocated, 1);
        assert_eq!(orch.stats().slots_released, 1);
    }

    #[test]
    fn test_pool_exhaustion_and_retry() {
        let (mut orch, _) = orch();
        let mut streams: Vec<Stream> = (0..4).map(|i| header_stream(i, 100 + i)).collect();
        for s in streams.iter_mut().take(3) {
            orch.start_stream(s).unwrap();
        }
        assert_eq!(
            orch.start_stream(&mut streams[3]),
            Err(FlowStatError::NoFreeSlot(RuleKind::HeaderId))
        );
        assert_eq!(streams[3].state, StreamState::Free);

        orch.stop_stream(&mut streams[1]).unwrap();
        orch.del_stream(&mut streams[1]).unwrap();
        orch.start_stream(&mut streams[3]).unwrap();
        assert_eq!(streams[3].state, StreamState::Running(SlotId(1)));
        assert_eq!(orch.pool(RuleKind::HeaderId).free_count(), 0);
    }

    #[test]
    fn test_different_l4_rejected() {
        let (mut orch, _) = orch();
        let mut a = header_stream(1, 4);
        orch.add_stream(&mut a).unwrap();
        let mut b = header_stream(2, 4);
        b.packet = ipv4_packet(L4Proto::TCP, 1, 64);
        assert!(matches!(
            orch.add_stream(&mut b),
            Err(FlowStatError::DifferentL4Kind { .. })
        ));
        assert_eq!(b.state, StreamState::Init);
    }

    #[test]
    fn test_payload_stream_lifecycle() {
        let (mut orch, mock) = orch();
        let mut s = payload_stream(1, 20);
        orch.start_stream(&mut s).unwrap();
        assert_eq!(
            s.payload,
            Some(PayloadStamp {
                slot: SlotId(0),
                flow_epoch: 1
            })
        );
        assert_eq!(ip_id(&s), Some(u32::from(orch.layout().payload_sentinel())));

        orch.stop_stream(&mut s).unwrap();
        assert_eq!(s.payload, None);
        orch.start_stream(&mut s).unwrap();
        assert_eq!(s.payload.map(|p| p.flow_epoch), Some(2));

        assert_eq!(
            mock.messages(),
            vec!["enable", "arm 0", "retire 0", "disable", "enable"]
        );
        assert_eq!(orch.stats().slots_allocated, 1);
    }

    #[test]
    fn test_stop_requires_running() {
        let (mut orch, _) = orch();
        let mut s = header_stream(7, 1);
        assert_eq!(orch.stop_stream(&mut s), Err(FlowStatError::NotRunning(7)));
        orch.add_stream(&mut s).unwrap();
        assert_eq!(orch.stop_stream(&mut s), Err(FlowStatError::NotRunning(7)));

        let mut plain = Stream::new(8, RxStatsConfig::disabled(), ipv4_packet(L4Proto::UDP, 1, 64));
        assert_eq!(orch.stop_stream(&mut plain), Ok(()));
    }

    #[test]
    fn test_delete_is_idempotent() {
        let (mut orch, _) = orch();
        let mut never_added = header_stream(1, 1);
        assert_eq!(orch.del_stream(&mut never_added), Ok(()));

        let mut a = header_stream(2, 2);
        let mut b = header_stream(3, 2);
        orch.add_stream(&mut a).unwrap();
        orch.add_stream(&mut b).unwrap();
        orch.del_stream(&mut a).unwrap();
        assert_eq!(orch.registry().get(PacketGroupId(2)).unwrap().ref_count(), 1);
        orch.del_stream(&mut a).unwrap();
        assert_eq!(orch.registry().get(PacketGroupId(2)).unwrap().ref_count(), 1);
        assert_eq!(orch.stats().streams_deleted, 1);
    }

    #[test]
    fn test_delete_running_stream_stops_first() {
        let (mut orch, mock) = orch();
        let mut s = header_stream(1, 3);
        orch.start_stream(&mut s).unwrap();
        orch.del_stream(&mut s).unwrap();
        assert_eq!(s.state, StreamState::Init);
        assert_eq!(orch.num_started_streams(), 0);
        assert_eq!(orch.pool(RuleKind::HeaderId).free_count(), 3);
        assert_eq!(mock.messages(), vec!["enable", "disable"]);
    }

    #[test]
    fn test_reset_keeps_group() {
        let (mut orch, _) = orch();
        let mut s = header_stream(1, 30);
        orch.start_stream(&mut s).unwrap();
        orch.reset_stream(&mut s).unwrap();
        assert_eq!(s.state, StreamState::Free);
        let group = orch.registry().get(PacketGroupId(30)).unwrap();
        assert_eq!(group.slot(), None);
        assert_eq!(group.ref_count(), 1);
        assert_eq!(orch.pool(RuleKind::HeaderId).free_count(), 3);

        orch.reset_stream(&mut s).unwrap();
        orch.start_stream(&mut s).unwrap();
        assert_eq!(s.state, StreamState::Running(SlotId(0)));
    }

    #[test]
    fn test_rx_core_start_timeout() {
        let mut mock = MockCallbacks::new(small_layout());
        mock.ack_enable = false;
        let config = FlowStatOrchConfig {
            rx_start_timeout: Duration::from_millis(20),
            ..FlowStatOrchConfig::default()
        };
        let (mut orch, mock) = orch_with(mock, config);
        let mut s = header_stream(1, 1);
        let err = orch.start_stream(&mut s).unwrap_err();
        assert_eq!(err, FlowStatError::ReceiveCoreStartTimeout(20));
        assert!(err.is_fatal());
        assert_eq!(s.state, StreamState::Free);
        assert_eq!(orch.pool(RuleKind::HeaderId).free_count(), 3);
        assert_eq!(orch.registry().get(PacketGroupId(1)).unwrap().slot(), None);
        assert!(mock.installed.lock().unwrap().is_empty());
        assert_eq!(mock.messages(), vec!["enable", "disable"]);
    }

    #[test]
    fn test_install_failure_rolls_back() {
        let (mut orch, mock) = orch();
        *mock.fail_install.lock().unwrap() = true;
        let mut s = header_stream(1, 1);
        assert_eq!(
            orch.start_stream(&mut s),
            Err(FlowStatError::Platform("TCAM full".to_string()))
        );
        assert_eq!(orch.pool(RuleKind::HeaderId).free_count(), 3);
        assert_eq!(orch.registry().get(PacketGroupId(1)).unwrap().slot(), None);
        assert_eq!(
            *mock.removed.lock().unwrap(),
            vec![(PortId(0), RuleKind::HeaderId, SlotId(0))]
        );
        assert_eq!(orch.num_started_streams(), 0);
        assert_eq!(orch.stats().rule_failures, 1);

        *mock.fail_install.lock().unwrap() = false;
        orch.start_stream(&mut s).unwrap();
    }

    #[test]
    fn test_disabled_stream_reserved_id_scrubbed() {
        let (mut orch, _) = orch();
        let mut s = Stream::new(1, RxStatsConfig::disabled(), ipv4_packet(L4Proto::UDP, 0xff02, 64));
        orch.start_stream(&mut s).unwrap();
        assert_eq!(ip_id(&s), Some(0xef02));
        assert_eq!(s.state, StreamState::Init);

        let mut v6 = Stream::new(2, RxStatsConfig::disabled(), ipv6_packet(L4Proto::UDP, 0x1234, 80));
        orch.start_stream(&mut v6).unwrap();
        assert_eq!(ip_id(&v6), Some(0x1234));
    }

    #[test]
    fn test_scrub_stays_below_low_reserved_base() {
        let layout = IdLayout::new(0x1000, 127, 128).unwrap();
        let (mut orch, _) = orch_with(MockCallbacks::new(layout), FlowStatOrchConfig::default());
        let mut s = Stream::new(1, RxStatsConfig::disabled(), ipv4_packet(L4Proto::UDP, 0x2005, 64));
        orch.start_stream(&mut s).unwrap();
        assert_eq!(ip_id(&s), Some(0x0005));

        assert_eq!(FlowStatOrch::scrubbed_id(&layout, 0xff02), Some(0x0f02));
        assert_eq!(FlowStatOrch::scrubbed_id(&small_layout(), 0xff02), Some(0xef02));
        let everything = IdLayout::new(0, 16, 16).unwrap();
        assert_eq!(FlowStatOrch::scrubbed_id(&everything, 0x0003), None);
    }

    #[test]
    fn test_mode_change_is_audited() {
        let (mut orch, _) = orch();
        let logs = Arc::new(Mutex::new(Vec::new()));
        let writer = CapturedLogs(Arc::clone(&logs));
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();
        tracing::subscriber::with_default(subscriber, || {
            orch.set_mode(FlowStatMode::PassAll).unwrap();
        });

        let out = String::from_utf8(logs.lock().unwrap().clone()).unwrap();
        assert!(out.contains("CONFIGURATION_CHANGE - set_mode - success"), "{}", out);
        assert!(out.contains("PassAll"), "{}", out);
    }

    #[test]
    fn test_report_limits_and_counters() {
        let config = FlowStatOrchConfig {
            max_pgid_list_len: 2,
            ..FlowStatOrchConfig::default()
        };
        let (mut orch, mock) = orch_with(MockCallbacks::new(small_layout()), config);
        let mut s = header_stream(1, 50);
        orch.start_stream(&mut s).unwrap();
        mock.set_counter(PortId(1), RuleKind::HeaderId, SlotId(0), 10, 12);

        let ids = [PacketGroupId(1), PacketGroupId(2), PacketGroupId(50)];
        assert_eq!(
            orch.report(Some(&ids)),
            Err(FlowStatError::TooManyGroupsRequested {
                requested: 3,
                max: 2
            })
        );
        assert_eq!(orch.stats().periodic_updates, 0);

        let report = orch.report(Some(&[PacketGroupId(50), PacketGroupId(51)])).unwrap();
        assert_eq!(report.groups.len(), 1);
        let port = &report.groups[&PacketGroupId(50)].ports[&PortId(1)];
        assert_eq!((port.rx_pkts, port.tx_pkts), (10, 12));
        assert_eq!(report.global.rx_errors.stale_flow, 2);
    }

    #[test]
    fn test_counters_survive_slot_release() {
        let (mut orch, mock) = orch();
        let mut s = header_stream(1, 60);
        orch.start_stream(&mut s).unwrap();
        mock.set_counter(PortId(0), RuleKind::HeaderId, SlotId(0), 5, 5);
        orch.reset_stream(&mut s).unwrap();

        orch.start_stream(&mut s).unwrap();
        mock.set_counter(PortId(0), RuleKind::HeaderId, SlotId(0), 3, 3);
        orch.periodic_update().unwrap();

        let group = orch.registry().get(PacketGroupId(60)).unwrap();
        let port = group.counters.port(PortId(0)).unwrap();
        assert_eq!(port.rx.pkts, 3);
        assert_eq!(port.rx_carried.pkts, 5);
        assert_eq!(port.rx_total().pkts, 8);
    }

    #[test]
    fn test_released_slot_leaves_no_orphans() {
        let (mut orch, mock) = orch();
        let mut reset = header_stream(1, 60);
        let mut deleted = header_stream(2, 61);
        orch.start_stream(&mut reset).unwrap();
        orch.start_stream(&mut deleted).unwrap();
        mock.set_counter(PortId(0), RuleKind::HeaderId, SlotId(0), 5, 5);
        mock.set_counter(PortId(1), RuleKind::HeaderId, SlotId(1), 2, 2);

        orch.stop_stream(&mut reset).unwrap();
        orch.reset_stream(&mut reset).unwrap();
        orch.del_stream(&mut deleted).unwrap();
        assert!(mock.counters.lock().unwrap().is_empty());

        let report = orch.report(None).unwrap();
        assert_eq!(report.groups[&PacketGroupId(60)].ports[&PortId(0)].rx_pkts, 5);
        for port in [PortId(0), PortId(1)] {
            assert_eq!(report.global.rx_orphan[&port], FlowCounter::default());
            assert_eq!(report.global.tx_orphan[&port], FlowCounter::default());
        }
    }

    #[test]
    fn test_orphan_counters() {
        let (mut orch, mock) = orch();
        let mut a = header_stream(1, 1);
        let mut b = header_stream(2, 2);
        orch.start_stream(&mut a).unwrap();
        orch.start_stream(&mut b).unwrap();
        orch.del_stream(&mut a).unwrap();

        mock.set_counter(PortId(0), RuleKind::HeaderId, SlotId(0), 4, 0);
        let report = orch.report(None).unwrap();
        assert_eq!(report.global.rx_orphan[&PortId(0)], FlowCounter::new(4, 256));
        assert!(mock.counters.lock().unwrap().is_empty());

        let report = orch.report(None).unwrap();
        assert_eq!(report.global.rx_orphan[&PortId(0)], FlowCounter::new(4, 256));
    }

    #[test]
    fn test_payload_latency_folded_into_group() {
        let (mut orch, mock) = orch();
        let mut s = payload_stream(1, 70);
        orch.start_stream(&mut s).unwrap();
        let mut snap = Rfc2544Snapshot::default();
        snap.seq.loss = 2;
        mock.rfc2544.lock().unwrap().insert(SlotId(0), snap);

        let report = orch.report(None).unwrap();
        let latency = report.groups[&PacketGroupId(70)].latency.as_ref().unwrap();
        assert_eq!(latency.rfc2544.seq.loss, 2);
    }

    #[test]
    fn test_active_pgids_mode_and_copy_state() {
        let (mut orch, mock) = orch();
        let mut h = header_stream(1, 3);
        let mut p = payload_stream(2, 9);
        orch.add_stream(&mut h).unwrap();
        orch.start_stream(&mut p).unwrap();
        assert_eq!(
            orch.get_active_pgids(),
            ActivePgids {
                header_id: vec![PacketGroupId(3)],
                payload: vec![PacketGroupId(9)],
            }
        );

        orch.set_mode(FlowStatMode::PassAll).unwrap();
        assert_eq!(orch.mode(), FlowStatMode::PassAll);
        assert!(mock.messages().contains(&"pass_all true".to_string()));

        let mut copy = payload_stream(3, 9);
        FlowStatOrch::copy_state(&p, &mut copy);
        assert_eq!(copy.state, p.state);
        assert_eq!(copy.payload, p.payload);
    }
}

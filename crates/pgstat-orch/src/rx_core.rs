//! Receive core: owns the [`LatencyTracker`] and takes orders from the
//! control plane only through messages.
//!
//! The control plane never touches tracker state directly. It sends
//! [`RxCommand`]s over an unbounded channel and reads counters from the
//! shared [`RxStatsTable`]. Commands are drained before each frame so a
//! frame sent after an acknowledged enable is always classified.

use crate::audit::{AuditCategory, AuditOutcome, AuditRecord};
use crate::error::{FlowStatError, Result};
use crate::latency::{LatencyTracker, PacketClass, RxStatsTable};
use crate::parser::PacketParser;
use crate::{audit_log, debug_log, info_log};
use pgstat_common::{IdLayout, PortId, SlotId};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// Control-plane to receive-core messages.
#[derive(Debug)]
pub enum RxCommand {
    /// Start classifying tagged frames; acknowledged once applied.
    EnableLatency { reply: oneshot::Sender<()> },
    DisableLatency,
    SetPassAll(bool),
    /// Payload slot freshly bound to a group.
    ArmPayloadSlot(SlotId),
    /// Payload flow on the slot stopped transmitting.
    RetirePayloadFlow(SlotId),
    /// Acknowledged once every frame the core already received is counted.
    Flush { reply: oneshot::Sender<()> },
}

/// A received frame.
#[derive(Debug, Clone)]
pub struct RxFrame {
    pub port: PortId,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RxCoreStats {
    pub frames: u64,
    pub classified: u64,
    pub skipped_disabled: u64,
    pub commands: u64,
}

pub struct RxCore {
    tracker: LatencyTracker,
    commands: mpsc::UnboundedReceiver<RxCommand>,
    latency_enabled: bool,
    stats: RxCoreStats,
}

/// Control-plane side of the receive core.
#[derive(Clone)]
pub struct RxCoreHandle {
    commands: mpsc::UnboundedSender<RxCommand>,
    table: Arc<RxStatsTable>,
}

/// Creates a receive core and the handle used to drive it.
pub fn rx_core_channel(
    layout: IdLayout,
    num_ports: usize,
    parser: Box<dyn PacketParser>,
) -> (RxCore, RxCoreHandle) {
    let table = Arc::new(RxStatsTable::new(layout, num_ports));
    let (tx, rx) = mpsc::unbounded_channel();
    let core = RxCore {
        tracker: LatencyTracker::new(Arc::clone(&table), parser),
        commands: rx,
        latency_enabled: false,
        stats: RxCoreStats::default(),
    };
    (core, RxCoreHandle { commands: tx, table })
}

impl RxCore {
    pub fn latency_enabled(&self) -> bool {
        self.latency_enabled
    }

    pub fn stats(&self) -> &RxCoreStats {
        &self.stats
    }

    pub fn tracker(&self) -> &LatencyTracker {
        &self.tracker
    }

    pub fn apply(&mut self, cmd: RxCommand) {
        self.stats.commands += 1;
        match cmd {
            RxCommand::EnableLatency { reply } => {
                self.latency_enabled = true;
                audit_log!(AuditRecord::new(
                    AuditCategory::SystemLifecycle,
                    "RxCore",
                    "enable_latency"
                )
                .with_outcome(AuditOutcome::Success));
                // the requester may have timed out and dropped its end
                if reply.send(()).is_err() {
                    debug_log!("RxCore", "enable acknowledgement dropped by requester");
                }
            }
            RxCommand::DisableLatency => {
                self.latency_enabled = false;
                audit_log!(AuditRecord::new(
                    AuditCategory::SystemLifecycle,
                    "RxCore",
                    "disable_latency"
                )
                .with_outcome(AuditOutcome::Success));
            }
            RxCommand::SetPassAll(enabled) => {
                info_log!("RxCore", pass_all = enabled, "receive mode changed");
                self.tracker.set_pass_all(enabled);
            }
            RxCommand::ArmPayloadSlot(slot) => self.tracker.arm_slot(slot),
            RxCommand::RetirePayloadFlow(slot) => self.tracker.retire_flow(slot),
            RxCommand::Flush { reply } => {
                if reply.send(()).is_err() {
                    debug_log!("RxCore", "flush acknowledgement dropped by requester");
                }
            }
        }
    }

    /// Applies every queued command; returns how many there were.
    pub fn process_pending_commands(&mut self) -> usize {
        let mut n = 0;
        while let Ok(cmd) = self.commands.try_recv() {
            self.apply(cmd);
            n += 1;
        }
        n
    }

    /// Classifies one frame. Returns `None` while latency scanning is off.
    pub fn handle_frame(&mut self, frame: &RxFrame) -> Option<PacketClass> {
        self.process_pending_commands();
        self.stats.frames += 1;
        if !self.latency_enabled {
            self.stats.skipped_disabled += 1;
            return None;
        }
        self.stats.classified += 1;
        Some(self.tracker.handle_pkt(&frame.data, frame.port))
    }

    /// Runs until both the command and frame channels are closed.
    pub async fn run(mut self, mut frames: mpsc::Receiver<RxFrame>) -> RxCoreStats {
        info_log!("RxCore", "receive core started");
        let mut commands_open = true;
        let mut frames_open = true;
        while commands_open || frames_open {
            tokio::select! {
                biased;
                cmd = self.commands.recv(), if commands_open => match cmd {
                    Some(cmd) => self.apply(cmd),
                    None => commands_open = false,
                },
                frame = frames.recv(), if frames_open => match frame {
                    Some(frame) => {
                        self.handle_frame(&frame);
                    }
                    None => frames_open = false,
                },
            }
        }
        info_log!(
            "RxCore",
            frames = self.stats.frames,
            classified = self.stats.classified,
            "receive core stopped"
        );
        self.stats
    }
}

impl fmt::Debug for RxCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RxCore")
            .field("latency_enabled", &self.latency_enabled)
            .field("tracker", &self.tracker)
            .field("stats", &self.stats)
            .finish()
    }
}

impl RxCoreHandle {
    pub fn table(&self) -> &Arc<RxStatsTable> {
        &self.table
    }

    pub fn send(&self, cmd: RxCommand) -> Result<()> {
        self.commands
            .send(cmd)
            .map_err(|_| FlowStatError::Platform("receive core is not running".to_string()))
    }

    /// Asks the core to start classifying; the receiver resolves once it has.
    pub fn enable_latency(&self) -> Result<oneshot::Receiver<()>> {
        let (reply, ack) = oneshot::channel();
        self.send(RxCommand::EnableLatency { reply })?;
        Ok(ack)
    }

    pub fn flush(&self) -> Result<oneshot::Receiver<()>> {
        let (reply, ack) = oneshot::channel();
        self.send(RxCommand::Flush { reply })?;
        Ok(ack)
    }
}

impl fmt::Debug for RxCoreHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RxCoreHandle")
            .field("closed", &self.commands.is_closed())
            .finish()
    }
}

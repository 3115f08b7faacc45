//! Software loopback scenario run by pgstatd.
//!
//! The receive core runs as a tokio task. The control plane, which blocks
//! while waiting for the receive core, runs on the blocking pool and feeds
//! generated frames back to the core through a bounded channel.

use crate::config::{ConfigError, FlowStatConfig, StreamConfig};
use crate::error::{FlowStatError, Result};
use crate::flow_stat::{FlowStatMode, FlowStatOrch, FlowStatReport, Stream};
use crate::info_log;
use crate::latency::INITIAL_SEQ;
use crate::parser::EthernetParser;
use crate::platform::SoftwarePlatform;
use crate::rx_core::{rx_core_channel, RxCoreStats, RxFrame};
use pgstat_common::PortId;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

const FRAME_QUEUE_DEPTH: usize = 1024;
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Reports taken while the streams ran and after they stopped.
#[derive(Debug, Clone)]
pub struct ScenarioReport {
    pub running: FlowStatReport,
    pub stopped: FlowStatReport,
    pub rx_core: RxCoreStats,
}

fn config_error(e: ConfigError) -> FlowStatError {
    FlowStatError::Config(e.to_string())
}

/// Starts every configured stream, sends its packets through the loopback,
/// stops and deletes it again.
pub async fn run_scenario(config: FlowStatConfig) -> Result<ScenarioReport> {
    config.validate().map_err(config_error)?;
    let layout = config.layout().map_err(config_error)?;
    let (core, handle) = rx_core_channel(layout, usize::from(config.ports), Box::new(EthernetParser));
    let (frames_tx, frames_rx) = mpsc::channel(FRAME_QUEUE_DEPTH);
    let core_task = tokio::spawn(core.run(frames_rx));

    let platform = Arc::new(SoftwarePlatform::new(config.capability_mask(), handle));
    let control = {
        let platform = Arc::clone(&platform);
        tokio::task::spawn_blocking(move || drive_streams(&config, platform, frames_tx))
    };
    let outcome = control
        .await
        .map_err(|e| FlowStatError::Internal(format!("control task failed: {}", e)))?;

    // closes the command channel so the core can finish
    drop(platform);
    let rx_core = core_task
        .await
        .map_err(|e| FlowStatError::Internal(format!("receive core task failed: {}", e)))?;
    let (running, stopped) = outcome?;
    Ok(ScenarioReport {
        running,
        stopped,
        rx_core,
    })
}

fn drive_streams(
    config: &FlowStatConfig,
    platform: Arc<SoftwarePlatform>,
    frames: mpsc::Sender<RxFrame>,
) -> Result<(FlowStatReport, FlowStatReport)> {
    let mut orch = FlowStatOrch::new(config.orch_config());
    orch.set_callbacks(platform.clone());
    if config.mode != FlowStatMode::Normal {
        orch.set_mode(config.mode)?;
    }

    let mut streams: Vec<(&StreamConfig, Stream)> = config
        .streams
        .iter()
        .map(|c| c.build().map(|s| (c, s)))
        .collect::<std::result::Result<_, _>>()
        .map_err(config_error)?;
    for (_, stream) in &mut streams {
        orch.start_stream(stream)?;
    }

    let rounds = streams.iter().map(|(c, _)| c.packets).max().unwrap_or(0);
    for i in 0..rounds {
        for (c, stream) in streams.iter().filter(|(c, _)| i < c.packets) {
            let seq = INITIAL_SEQ.wrapping_add(i);
            if let Some(frame) = platform.transmit(stream, PortId(c.port), seq) {
                frames
                    .blocking_send(frame)
                    .map_err(|_| FlowStatError::Platform("receive core stopped".to_string()))?;
            }
        }
    }
    wait_drained(&frames, &platform)?;
    info_log!("pgstatd", streams = streams.len(), rounds, "traffic sent");

    let running = orch.report(None)?;
    for (_, stream) in &mut streams {
        orch.stop_stream(stream)?;
    }
    let stopped = orch.report(None)?;
    for (_, stream) in &mut streams {
        orch.del_stream(stream)?;
    }
    Ok((running, stopped))
}

/// Waits until the core has taken every queued frame, then until it has
/// counted them.
fn wait_drained(frames: &mpsc::Sender<RxFrame>, platform: &SoftwarePlatform) -> Result<()> {
    let deadline = Instant::now() + DRAIN_TIMEOUT;
    while frames.capacity() < frames.max_capacity() {
        if Instant::now() >= deadline {
            return Err(FlowStatError::Platform("receive core did not drain frames".to_string()));
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    platform
        .rx_handle()
        .flush()?
        .blocking_recv()
        .map_err(|_| FlowStatError::Platform("receive core stopped".to_string()))
}

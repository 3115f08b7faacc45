//! Per-group, per-port packet and byte counters with rate estimation.

use pgstat_common::PortId;
use serde::{Deserialize, Serialize};
use std::ops::{Add, AddAssign};

/// Weight of the newest sample in the rate EWMA.
pub const RATE_EWMA_FACTOR: f64 = 0.5;

const NANOS_PER_SEC: f64 = 1_000_000_000.0;

/// Packet and byte pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FlowCounter {
    pub pkts: u64,
    pub bytes: u64,
}

impl FlowCounter {
    pub const fn new(pkts: u64, bytes: u64) -> Self {
        Self { pkts, bytes }
    }

    pub const fn is_zero(&self) -> bool {
        self.pkts == 0 && self.bytes == 0
    }
}

impl Add for FlowCounter {
    type Output = FlowCounter;

    fn add(self, rhs: FlowCounter) -> FlowCounter {
        FlowCounter {
            pkts: self.pkts.wrapping_add(rhs.pkts),
            bytes: self.bytes.wrapping_add(rhs.bytes),
        }
    }
}

impl AddAssign for FlowCounter {
    fn add_assign(&mut self, rhs: FlowCounter) {
        *self = *self + rhs;
    }
}

#[derive(Debug, Clone, Copy)]
struct RateBase {
    at_ns: u64,
    total: FlowCounter,
}

/// Exponentially weighted packets/sec and bits/sec estimate.
#[derive(Debug, Clone, Default)]
pub struct RateEstimator {
    pps: f64,
    bps: f64,
    primed: bool,
    base: Option<RateBase>,
}

impl RateEstimator {
    pub fn pps(&self) -> f64 {
        self.pps
    }

    pub fn bps(&self) -> f64 {
        self.bps
    }

    /// Feeds a cumulative total observed at `now_ns`.
    pub fn update(&mut self, total: FlowCounter, now_ns: u64) {
        if let Some(base) = self.base {
            let dt = now_ns.saturating_sub(base.at_ns);
            if dt == 0 {
                return;
            }
            let secs = dt as f64 / NANOS_PER_SEC;
            let pps = total.pkts.saturating_sub(base.total.pkts) as f64 / secs;
            let bps = total.bytes.saturating_sub(base.total.bytes) as f64 * 8.0 / secs;
            if self.primed {
                self.pps = RATE_EWMA_FACTOR * pps + (1.0 - RATE_EWMA_FACTOR) * self.pps;
                self.bps = RATE_EWMA_FACTOR * bps + (1.0 - RATE_EWMA_FACTOR) * self.bps;
            } else {
                self.pps = pps;
                self.bps = bps;
                self.primed = true;
            }
        }
        self.base = Some(RateBase { at_ns: now_ns, total });
    }

    /// Forces the estimate to zero; the next sample restarts the average.
    pub fn stop(&mut self) {
        self.pps = 0.0;
        self.bps = 0.0;
        self.primed = false;
    }

    /// Drops the baseline as well as the estimate.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Counters of one group on one port.
///
/// `rx`/`tx` hold readings of the currently bound slot; `*_carried` hold what
/// earlier slot bindings accumulated.
#[derive(Debug, Clone, Default)]
pub struct PortCounters {
    pub rx: FlowCounter,
    pub tx: FlowCounter,
    pub rx_carried: FlowCounter,
    pub tx_carried: FlowCounter,
    pub rx_rate: RateEstimator,
    pub tx_rate: RateEstimator,
}

impl PortCounters {
    pub fn rx_total(&self) -> FlowCounter {
        self.rx_carried + self.rx
    }

    pub fn tx_total(&self) -> FlowCounter {
        self.tx_carried + self.tx
    }
}

/// All per-port counters of a packet group.
#[derive(Debug, Clone, Default)]
pub struct CounterSet {
    ports: Vec<PortCounters>,
}

impl CounterSet {
    pub fn new(num_ports: usize) -> Self {
        Self {
            ports: vec![PortCounters::default(); num_ports],
        }
    }

    pub fn port(&self, port: PortId) -> Option<&PortCounters> {
        self.ports.get(port.index())
    }

    pub fn iter(&self) -> impl Iterator<Item = (PortId, &PortCounters)> {
        self.ports
            .iter()
            .enumerate()
            .filter_map(|(i, c)| u8::try_from(i).ok().map(|i| (PortId(i), c)))
    }

    /// Stores the latest slot readings for `port`; with `rate_at` set the
    /// rate estimators are fed as well.
    pub fn update(&mut self, port: PortId, rx: FlowCounter, tx: FlowCounter, rate_at: Option<u64>) {
        let Some(c) = self.ports.get_mut(port.index()) else {
            return;
        };
        c.rx = rx;
        c.tx = tx;
        if let Some(now) = rate_at {
            let (rx_total, tx_total) = (c.rx_total(), c.tx_total());
            c.rx_rate.update(rx_total, now);
            c.tx_rate.update(tx_total, now);
        }
    }

    /// Called when the last active stream stops.
    pub fn stop_rates(&mut self) {
        for c in &mut self.ports {
            c.rx_rate.stop();
            c.tx_rate.stop();
        }
    }

    /// Folds the current slot readings into the carried totals and clears
    /// rate baselines. Used when the group gives up its slot.
    pub fn release_slot(&mut self) {
        for c in &mut self.ports {
            c.rx_carried += c.rx;
            c.tx_carried += c.tx;
            c.rx = FlowCounter::default();
            c.tx = FlowCounter::default();
            c.rx_rate.reset();
            c.tx_rate.reset();
        }
    }

    pub fn rx_total(&self) -> FlowCounter {
        self.ports
            .iter()
            .fold(FlowCounter::default(), |acc, c| acc + c.rx_total())
    }

    pub fn tx_total(&self) -> FlowCounter {
        self.ports
            .iter()
            .fold(FlowCounter::default(), |acc, c| acc + c.tx_total())
    }
}

//! Per-slot sequence validation and jitter for payload flows.

use super::header::INITIAL_SEQ;
use super::histogram::HistogramSnapshot;
use serde::{Deserialize, Serialize};

/// Sequence distance beyond which a difference is taken to be 32-bit
/// wraparound rather than real loss or reordering. Compared with `>`.
pub const WRAP_THRESHOLD: u32 = 100_000;

/// Jitter smoothing divisor (RFC 3550 §6.4.1).
const JITTER_GAIN: f64 = 16.0;

/// Classification of one received sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeqVerdict {
    InOrder,
    /// Forward gap of this many packets.
    Loss(u64),
    Duplicate,
    Reorder,
}

/// Classification of a trailer's flow epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpochVerdict {
    Current,
    /// First packet of a new flow on this slot.
    Adopted,
    /// Late packet of the flow that previously used this slot.
    Stale,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SeqCounters {
    pub loss: u64,
    pub duplicate: u64,
    pub reorder: u64,
    /// Forward jumps (sequence higher than expected).
    pub event_high: u64,
    /// Backward steps (duplicates and reorders).
    pub event_low: u64,
}

impl SeqCounters {
    pub fn accumulate(&mut self, other: &SeqCounters) {
        self.loss += other.loss;
        self.duplicate += other.duplicate;
        self.reorder += other.reorder;
        self.event_high += other.event_high;
        self.event_low += other.event_low;
    }
}

/// Receive-owned validator state of one payload slot.
#[derive(Debug, Clone, PartialEq)]
pub struct Rfc2544State {
    pub expected_seq: u32,
    pub expected_epoch: Option<u8>,
    pub previous_epoch: Option<u8>,
    pub counters: SeqCounters,
    pub last_latency_usec: Option<f64>,
    pub jitter_usec: f64,
}

impl Default for Rfc2544State {
    fn default() -> Self {
        Self {
            expected_seq: INITIAL_SEQ,
            expected_epoch: None,
            previous_epoch: None,
            counters: SeqCounters::default(),
            last_latency_usec: None,
            jitter_usec: 0.0,
        }
    }
}

impl Rfc2544State {
    /// Prepares the slot for a new owner. The previous epoch survives so
    /// late packets of the old owner are still recognized.
    pub fn arm(&mut self) {
        let previous_epoch = self.expected_epoch.or(self.previous_epoch);
        *self = Self {
            previous_epoch,
            ..Self::default()
        };
    }

    /// Ends the current flow: its epoch becomes the previous one.
    pub fn retire(&mut self) {
        if let Some(epoch) = self.expected_epoch.take() {
            self.previous_epoch = Some(epoch);
        }
    }

    pub fn check_epoch(&mut self, epoch: u8) -> EpochVerdict {
        if self.expected_epoch == Some(epoch) {
            return EpochVerdict::Current;
        }
        if self.previous_epoch == Some(epoch) {
            return EpochVerdict::Stale;
        }
        if self.expected_epoch.is_none() {
            self.expected_epoch = Some(epoch);
            self.expected_seq = INITIAL_SEQ;
            self.last_latency_usec = None;
            return EpochVerdict::Adopted;
        }
        EpochVerdict::Unknown
    }

    pub fn check_seq(&mut self, observed: u32) -> SeqVerdict {
        let expected = self.expected_seq;
        if observed == expected {
            self.expected_seq = observed.wrapping_add(1);
            return SeqVerdict::InOrder;
        }

        let ahead = if observed < expected {
            // wrapped forward jump, e.g. expected near u32::MAX and observed near 0
            expected - observed > WRAP_THRESHOLD
        } else {
            observed - expected <= WRAP_THRESHOLD
        };

        if ahead {
            let gap = u64::from(observed.wrapping_sub(expected));
            self.counters.loss += gap;
            self.counters.event_high += 1;
            self.expected_seq = observed.wrapping_add(1);
            SeqVerdict::Loss(gap)
        } else {
            self.counters.event_low += 1;
            if observed == expected.wrapping_sub(1) {
                self.counters.duplicate += 1;
                SeqVerdict::Duplicate
            } else {
                self.counters.reorder += 1;
                self.counters.loss = self.counters.loss.saturating_sub(1);
                SeqVerdict::Reorder
            }
        }
    }

    /// Feeds one latency sample into the RFC 3550 jitter estimate.
    pub fn record_latency(&mut self, usec: f64) {
        if let Some(last) = self.last_latency_usec {
            let d = (usec - last).abs();
            self.jitter_usec += (d - self.jitter_usec) / JITTER_GAIN;
        }
        self.last_latency_usec = Some(usec);
    }
}

/// What the control plane sees of a payload slot.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Rfc2544Snapshot {
    #[serde(flatten)]
    pub seq: SeqCounters,
    pub jitter_usec: f64,
    pub histogram: HistogramSnapshot,
}

impl Rfc2544Snapshot {
    /// Folds a later snapshot into this one. Jitter is not additive; the
    /// newer value wins.
    pub fn accumulate(&mut self, other: &Rfc2544Snapshot) {
        self.seq.accumulate(&other.seq);
        self.histogram.merge(&other.histogram);
        if other.histogram.count > 0 {
            self.jitter_usec = other.jitter_usec;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn state_expecting(seq: u32) -> Rfc2544State {
        Rfc2544State {
            expected_seq: seq,
            expected_epoch: Some(1),
            ..Rfc2544State::default()
        }
    }

    #[test]
    fn test_duplicate_does_not_advance() {
        let mut s = state_expecting(10);
        assert_eq!(s.check_seq(9), SeqVerdict::Duplicate);
        assert_eq!(s.expected_seq, 10);
        assert_eq!(s.counters.duplicate, 1);
        assert_eq!(s.counters.event_low, 1);
    }

    #[test]
    fn test_in_order_advances() {
        let mut s = state_expecting(10);
        assert_eq!(s.check_seq(10), SeqVerdict::InOrder);
        assert_eq!(s.expected_seq, 11);
        assert_eq!(s.counters, SeqCounters::default());
    }

    #[test]
    fn test_forward_gap_is_loss() {
        let mut s = state_expecting(10);
        assert_eq!(s.check_seq(15), SeqVerdict::Loss(5));
        assert_eq!(s.expected_seq, 16);
        assert_eq!(s.counters.loss, 5);
        assert_eq!(s.counters.event_high, 1);
    }

    #[test]
    fn test_reorder_returns_one_lost_packet() {
        let mut s = state_expecting(10);
        s.check_seq(15);
        assert_eq!(s.check_seq(12), SeqVerdict::Reorder);
        assert_eq!(s.counters.loss, 4);
        assert_eq!(s.counters.reorder, 1);
        assert_eq!(s.expected_seq, 16);
    }

    #[test]
    fn test_reorder_never_drives_loss_negative() {
        let mut s = state_expecting(100);
        assert_eq!(s.check_seq(50), SeqVerdict::Reorder);
        assert_eq!(s.counters.loss, 0);
    }

    #[test]
    fn test_backward_distance_at_threshold_is_small_delta() {
        // 100005 - 5 = 100000, not above the threshold
        let mut s = state_expecting(100_005);
        assert_eq!(s.check_seq(5), SeqVerdict::Reorder);
        assert_eq!(s.expected_seq, 100_005);
    }

    #[test]
    fn test_backward_distance_below_threshold_is_small_delta() {
        let mut s = state_expecting(100_005);
        assert_eq!(s.check_seq(6), SeqVerdict::Reorder);
        assert_eq!(s.counters.reorder, 1);
    }

    #[test]
    fn test_backward_distance_above_threshold_is_wrap() {
        let mut s = state_expecting(100_005);
        let verdict = s.check_seq(4);
        let gap = u64::from(4u32.wrapping_sub(100_005));
        assert_eq!(verdict, SeqVerdict::Loss(gap));
        assert_eq!(s.counters.loss, gap);
        assert_eq!(s.expected_seq, 5);
    }

    #[test]
    fn test_wraparound_forward() {
        let mut s = state_expecting(u32::MAX - 1);
        assert_eq!(s.check_seq(u32::MAX - 1), SeqVerdict::InOrder);
        assert_eq!(s.check_seq(u32::MAX), SeqVerdict::InOrder);
        assert_eq!(s.expected_seq, 0);
        assert_eq!(s.check_seq(0), SeqVerdict::InOrder);
        assert_eq!(s.check_seq(3), SeqVerdict::Loss(2));
        assert_eq!(s.counters.event_high, 1);
    }

    #[test]
    fn test_gap_across_wrap_is_loss() {
        let mut s = state_expecting(u32::MAX - 1);
        assert_eq!(s.check_seq(2), SeqVerdict::Loss(4));
        assert_eq!(s.expected_seq, 3);
    }

    #[test]
    fn test_late_packets_across_wrap() {
        let mut s = state_expecting(1);
        assert_eq!(s.check_seq(0), SeqVerdict::Duplicate);
        let mut s = state_expecting(1);
        assert_eq!(s.check_seq(u32::MAX), SeqVerdict::Reorder);
        assert_eq!(s.expected_seq, 1);
    }

    #[test]
    fn test_forward_distance_above_threshold_is_backward_after_wrap() {
        let mut s = state_expecting(10);
        assert_eq!(s.check_seq(10 + WRAP_THRESHOLD + 1), SeqVerdict::Reorder);
        let mut s = state_expecting(10);
        assert_eq!(s.check_seq(10 + WRAP_THRESHOLD), SeqVerdict::Loss(u64::from(WRAP_THRESHOLD)));
    }

    #[test]
    fn test_epoch_lifecycle() {
        let mut s = Rfc2544State::default();
        assert_eq!(s.check_epoch(4), EpochVerdict::Adopted);
        assert_eq!(s.expected_seq, INITIAL_SEQ);
        assert_eq!(s.check_epoch(4), EpochVerdict::Current);
        assert_eq!(s.check_epoch(9), EpochVerdict::Unknown);

        s.retire();
        assert_eq!(s.check_epoch(4), EpochVerdict::Stale);
        assert_eq!(s.check_epoch(5), EpochVerdict::Adopted);
        assert_eq!(s.check_epoch(4), EpochVerdict::Stale);
    }

    #[test]
    fn test_arm_keeps_previous_epoch() {
        let mut s = Rfc2544State::default();
        s.check_epoch(7);
        s.check_seq(INITIAL_SEQ.wrapping_add(3));
        s.arm();
        assert_eq!(s.counters, SeqCounters::default());
        assert_eq!(s.expected_epoch, None);
        assert_eq!(s.previous_epoch, Some(7));
        assert_eq!(s.check_epoch(7), EpochVerdict::Stale);
    }

    #[test]
    fn test_jitter() {
        let mut s = Rfc2544State::default();
        s.record_latency(100.0);
        assert_eq!(s.jitter_usec, 0.0);
        s.record_latency(116.0);
        assert_eq!(s.jitter_usec, 1.0);
        s.record_latency(116.0);
        assert_eq!(s.jitter_usec, 1.0 - 1.0 / 16.0);
    }
}

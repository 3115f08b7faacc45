//! Latency histogram shared between the receive core and the control plane.
//!
//! Buckets are keyed by decade and leading digit: 10, 20 .. 90 µs, 100, 200
//! .. 900 µs and so on up to 9 s. Samples below 10 µs are only counted.
//! The receive core is the only writer of samples; the control plane reads
//! with relaxed loads and collects the windowed max with `swap`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

pub const HISTOGRAM_MIN_USEC: u64 = 10;
const DECADES: usize = 6;
const BUCKETS: usize = DECADES * 9;

/// Receive-side latency aggregator for one payload slot.
#[derive(Debug)]
pub struct LatencyHistogram {
    buckets: [AtomicU64; BUCKETS],
    below_min: AtomicU64,
    count: AtomicU64,
    sum_usec: AtomicU64,
    total_max_usec: AtomicU64,
    window_max_usec: AtomicU64,
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self {
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            below_min: AtomicU64::new(0),
            count: AtomicU64::new(0),
            sum_usec: AtomicU64::new(0),
            total_max_usec: AtomicU64::new(0),
            window_max_usec: AtomicU64::new(0),
        }
    }
}

fn bucket_index(usec: u64) -> usize {
    let mut decade = 0;
    let mut floor = HISTOGRAM_MIN_USEC;
    while decade < DECADES - 1 && usec >= floor * 10 {
        floor *= 10;
        decade += 1;
    }
    let digit = (usec / floor).clamp(1, 9);
    // digit is 1..=9
    decade * 9 + (digit as usize - 1)
}

fn bucket_floor(index: usize) -> u64 {
    let decade = index / 9;
    let digit = (index % 9 + 1) as u64;
    digit * HISTOGRAM_MIN_USEC * 10u64.pow(decade as u32)
}

impl LatencyHistogram {
    pub fn record(&self, usec: u64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_usec.fetch_add(usec, Ordering::Relaxed);
        self.total_max_usec.fetch_max(usec, Ordering::Relaxed);
        self.window_max_usec.fetch_max(usec, Ordering::Relaxed);
        if usec < HISTOGRAM_MIN_USEC {
            self.below_min.fetch_add(1, Ordering::Relaxed);
        } else {
            self.buckets[bucket_index(usec)].fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn reset(&self) {
        for b in &self.buckets {
            b.store(0, Ordering::Relaxed);
        }
        self.below_min.store(0, Ordering::Relaxed);
        self.count.store(0, Ordering::Relaxed);
        self.sum_usec.store(0, Ordering::Relaxed);
        self.total_max_usec.store(0, Ordering::Relaxed);
        self.window_max_usec.store(0, Ordering::Relaxed);
    }

    /// Copies the histogram. With `take_window` the windowed max is reset so
    /// the next snapshot covers a fresh period.
    pub fn snapshot(&self, take_window: bool) -> HistogramSnapshot {
        let buckets = self
            .buckets
            .iter()
            .enumerate()
            .filter_map(|(i, b)| {
                let n = b.load(Ordering::Relaxed);
                (n != 0).then(|| (bucket_floor(i), n))
            })
            .collect();
        let window_max_usec = if take_window {
            self.window_max_usec.swap(0, Ordering::Relaxed)
        } else {
            self.window_max_usec.load(Ordering::Relaxed)
        };
        HistogramSnapshot {
            buckets,
            below_min: self.below_min.load(Ordering::Relaxed),
            count: self.count.load(Ordering::Relaxed),
            sum_usec: self.sum_usec.load(Ordering::Relaxed),
            total_max_usec: self.total_max_usec.load(Ordering::Relaxed),
            window_max_usec,
        }
    }
}

/// Point-in-time copy of a [`LatencyHistogram`].
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct HistogramSnapshot {
    /// Bucket floor in µs to sample count; empty buckets omitted.
    pub buckets: BTreeMap<u64, u64>,
    pub below_min: u64,
    pub count: u64,
    pub sum_usec: u64,
    pub total_max_usec: u64,
    pub window_max_usec: u64,
}

impl HistogramSnapshot {
    pub fn average_usec(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum_usec as f64 / self.count as f64
        }
    }

    pub fn merge(&mut self, other: &HistogramSnapshot) {
        for (floor, n) in &other.buckets {
            *self.buckets.entry(*floor).or_insert(0) += n;
        }
        self.below_min += other.below_min;
        self.count += other.count;
        self.sum_usec += other.sum_usec;
        self.total_max_usec = self.total_max_usec.max(other.total_max_usec);
        self.window_max_usec = self.window_max_usec.max(other.window_max_usec);
    }
}

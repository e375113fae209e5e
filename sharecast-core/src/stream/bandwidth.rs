//! Per-viewer send meter.
//!
//! Every completed transport write is recorded with its size and how
//! long the write took. The meter derives throughput over a rolling
//! window and a smoothed send latency; both are reported in viewer
//! snapshots so the host can spot slow viewers.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct SendMeter {
    /// `(completed_at, bytes)` inside the window.
    samples: VecDeque<(Instant, u64)>,
    window: Duration,
    window_bytes: u64,
    total_bytes: u64,
    total_writes: u64,
    /// EWMA of write latency in microseconds; 0 until the first sample.
    smoothed_latency_us: u64,
}

impl SendMeter {
    /// Meter with a 1-second rolling window.
    pub fn new() -> Self {
        Self::with_window(Duration::from_secs(1))
    }

    pub fn with_window(window: Duration) -> Self {
        Self {
            samples: VecDeque::with_capacity(64),
            window,
            window_bytes: 0,
            total_bytes: 0,
            total_writes: 0,
            smoothed_latency_us: 0,
        }
    }

    /// Record a write that just completed.
    pub fn record(&mut self, bytes: u64, latency: Duration) {
        self.record_at(Instant::now(), bytes, latency);
    }

    /// Record with an explicit completion time.
    pub fn record_at(&mut self, when: Instant, bytes: u64, latency: Duration) {
        self.samples.push_back((when, bytes));
        self.window_bytes += bytes;
        self.total_bytes += bytes;
        self.total_writes += 1;

        // srtt-style smoothing: 7/8 old + 1/8 new.
        let sample = latency.as_micros().min(u64::MAX as u128) as u64;
        self.smoothed_latency_us = if self.total_writes == 1 {
            sample
        } else {
            self.smoothed_latency_us - self.smoothed_latency_us / 8 + sample / 8
        };

        while let Some(&(ts, b)) = self.samples.front() {
            if when.duration_since(ts) > self.window {
                self.samples.pop_front();
                self.window_bytes = self.window_bytes.saturating_sub(b);
            } else {
                break;
            }
        }
    }

    /// Throughput over the rolling window in bytes/second.
    pub fn bytes_per_sec(&self) -> u64 {
        let (first, last) = match (self.samples.front(), self.samples.back()) {
            (Some((first, _)), Some((last, _))) => (*first, *last),
            _ => return 0,
        };
        let span = last.duration_since(first).max(Duration::from_millis(1));
        (self.window_bytes as f64 / span.as_secs_f64()) as u64
    }

    /// Smoothed write latency, `Duration::ZERO` before any write.
    pub fn latency(&self) -> Duration {
        Duration::from_micros(self.smoothed_latency_us)
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn total_writes(&self) -> u64 {
        self.total_writes
    }
}

impl Default for SendMeter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_meter() {
        let m = SendMeter::new();
        assert_eq!(m.bytes_per_sec(), 0);
        assert_eq!(m.latency(), Duration::ZERO);
    }

    #[test]
    fn throughput_over_window() {
        let mut m = SendMeter::with_window(Duration::from_secs(5));
        let t0 = Instant::now();
        m.record_at(t0, 1_000_000, Duration::from_millis(1));
        m.record_at(t0 + Duration::from_secs(1), 1_000_000, Duration::from_millis(1));
        let bps = m.bytes_per_sec();
        assert!((1_900_000..=2_100_000).contains(&bps), "bps = {bps}");
        assert_eq!(m.total_writes(), 2);
    }

    #[test]
    fn old_samples_leave_the_window() {
        let mut m = SendMeter::with_window(Duration::from_millis(500));
        let t0 = Instant::now();
        m.record_at(t0, 1000, Duration::ZERO);
        m.record_at(t0 + Duration::from_secs(1), 500, Duration::ZERO);
        assert_eq!(m.samples.len(), 1);
        assert_eq!(m.total_bytes(), 1500);
    }

    #[test]
    fn latency_is_smoothed() {
        let mut m = SendMeter::new();
        m.record(10, Duration::from_millis(10));
        assert_eq!(m.latency(), Duration::from_millis(10));
        m.record(10, Duration::from_millis(2));
        // 10000 - 1250 + 250 = 9000 µs
        assert_eq!(m.latency(), Duration::from_micros(9000));
    }
}

//! Link measurements for a session.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::adapter::Diagnostics;

/// Weight of the newest latency sample.
pub const LATENCY_ALPHA: f64 = 0.3;

/// Window over which throughput is measured.
pub const THROUGHPUT_WINDOW: Duration = Duration::from_secs(10);

/// Reconnects at which stability bottoms out.
const STABILITY_RECONNECT_SPAN: f64 = 10.0;

#[derive(Debug, Default)]
pub struct DiagnosticsTracker {
    latency_ms: Option<f64>,
    window: VecDeque<(Instant, usize)>,
    writes: u64,
    failed_writes: u64,
    operations: u64,
    errors: u64,
    reconnects: u32,
}

impl DiagnosticsTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn record_latency(&mut self, rtt: Duration) {
        let sample = rtt.as_secs_f64() * 1000.0;
        self.latency_ms = Some(match self.latency_ms {
            Some(avg) => LATENCY_ALPHA * sample + (1.0 - LATENCY_ALPHA) * avg,
            None => sample,
        });
    }

    fn prune(&mut self, now: Instant) {
        while let Some((at, _)) = self.window.front() {
            if now.duration_since(*at) > THROUGHPUT_WINDOW {
                self.window.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn record_write(&mut self, rtt: Duration, bytes: usize) {
        let now = Instant::now();
        self.record_latency(rtt);
        self.window.push_back((now, bytes));
        self.prune(now);
        self.writes += 1;
        self.operations += 1;
    }

    pub fn record_write_failure(&mut self) {
        self.writes += 1;
        self.failed_writes += 1;
        self.operations += 1;
        self.errors += 1;
    }

    pub fn record_probe(&mut self, rtt: Duration) {
        self.record_latency(rtt);
        self.operations += 1;
    }

    pub fn record_error(&mut self) {
        self.operations += 1;
        self.errors += 1;
    }

    pub fn record_reconnect(&mut self) {
        self.reconnects = self.reconnects.saturating_add(1);
    }

    pub fn snapshot(&self) -> Diagnostics {
        let now = Instant::now();
        let bytes: usize = self
            .window
            .iter()
            .filter(|(at, _)| now.duration_since(*at) <= THROUGHPUT_WINDOW)
            .map(|(_, bytes)| *bytes)
            .sum();
        let packet_loss = ratio(self.failed_writes, self.writes);
        let reconnect_penalty = (self.reconnects as f64 / STABILITY_RECONNECT_SPAN).min(1.0);

        Diagnostics {
            latency_ms: self.latency_ms.unwrap_or(0.0),
            throughput_bps: bytes as f64 / THROUGHPUT_WINDOW.as_secs_f64(),
            packet_loss,
            error_rate: ratio(self.errors, self.operations),
            stability: (1.0 - reconnect_penalty) * (1.0 - packet_loss),
            reconnects: self.reconnects,
            operations: self.operations,
        }
    }
}

fn ratio(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 / total as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latency_ewma() {
        let mut tracker = DiagnosticsTracker::new();
        tracker.record_write(Duration::from_millis(100), 10);
        assert!((tracker.snapshot().latency_ms - 100.0).abs() < 1e-6);

        tracker.record_write(Duration::from_millis(200), 10);
        assert!((tracker.snapshot().latency_ms - 130.0).abs() < 1e-6);
    }

    #[test]
    fn test_loss_and_error_rate() {
        let mut tracker = DiagnosticsTracker::new();
        tracker.record_write(Duration::from_millis(5), 100);
        tracker.record_write_failure();
        tracker.record_error();

        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.packet_loss, 0.5);
        assert!((snapshot.error_rate - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(snapshot.throughput_bps, 10.0);
        assert_eq!(snapshot.stability, 0.5);
    }

    #[test]
    fn test_reconnects_erode_stability() {
        let mut tracker = DiagnosticsTracker::new();
        assert_eq!(tracker.snapshot().stability, 1.0);
        for _ in 0..5 {
            tracker.record_reconnect();
        }
        assert_eq!(tracker.snapshot().stability, 0.5);
        for _ in 0..20 {
            tracker.record_reconnect();
        }
        assert_eq!(tracker.snapshot().stability, 0.0);
    }
}

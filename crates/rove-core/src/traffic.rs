//! Ingestion-rate tracking for rendering backpressure.
//!
//! Every delivered batch adds a `(time, lines, chars)` sample. Samples older
//! than [`TRAFFIC_WINDOW`] fall out. The rate is the window's character sum
//! divided by the fixed window length, and rendering is suppressed once at
//! least [`MIN_SAMPLES`] samples are present and the rate exceeds the limit.

use std::collections::VecDeque;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Length of the trailing window.
pub const TRAFFIC_WINDOW: Duration = Duration::from_secs(3);

/// Samples required before the limit is enforced.
pub const MIN_SAMPLES: usize = 3;

#[derive(Debug, Clone, Copy)]
struct TrafficSample {
    at: Instant,
    lines: usize,
    chars: usize,
}

/// Outcome of recording one batch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrafficVerdict {
    /// Average characters per second over the window.
    pub rate: f64,
    pub lines_in_window: usize,
    pub suppressed: bool,
}

/// Sliding window of traffic samples for one slot.
#[derive(Debug)]
pub struct TrafficWindow {
    /// Characters per second. Zero disables suppression.
    limit: u64,
    samples: VecDeque<TrafficSample>,
}

impl TrafficWindow {
    #[must_use]
    pub fn new(limit: u64) -> Self {
        Self {
            limit,
            samples: VecDeque::new(),
        }
    }

    #[must_use]
    pub const fn limit(&self) -> u64 {
        self.limit
    }

    /// Record a batch at the current time.
    pub fn record(&mut self, lines: usize, chars: usize) -> TrafficVerdict {
        self.record_at(Instant::now(), lines, chars)
    }

    /// Record a batch observed at `now`.
    pub fn record_at(&mut self, now: Instant, lines: usize, chars: usize) -> TrafficVerdict {
        self.samples.push_back(TrafficSample { at: now, lines, chars });
        while self
            .samples
            .front()
            .is_some_and(|s| now.saturating_duration_since(s.at) > TRAFFIC_WINDOW)
        {
            self.samples.pop_front();
        }

        let rate = self.rate();
        let suppressed = self.limit > 0
            && self.samples.len() >= MIN_SAMPLES
            && rate > self.limit as f64;
        TrafficVerdict {
            rate,
            lines_in_window: self.samples.iter().map(|s| s.lines).sum(),
            suppressed,
        }
    }

    /// Window character sum over the fixed window length.
    #[must_use]
    pub fn rate(&self) -> f64 {
        let chars: usize = self.samples.iter().map(|s| s.chars).sum();
        chars as f64 / TRAFFIC_WINDOW.as_secs_f64()
    }

    #[must_use]
    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(base: Instant, secs: u64) -> Instant {
        base + Duration::from_secs(secs)
    }

    #[test]
    fn rate_divides_by_fixed_window() {
        let base = Instant::now();
        let mut window = TrafficWindow::new(0);
        window.record_at(base, 1, 300);
        assert!((window.rate() - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn fewer_than_three_samples_never_suppress() {
        let base = Instant::now();
        let mut window = TrafficWindow::new(10);
        assert!(!window.record_at(base, 1, 10_000).suppressed);
        assert!(!window.record_at(at(base, 1), 1, 10_000).suppressed);
        assert!(window.record_at(at(base, 2), 1, 10_000).suppressed);
    }

    #[test]
    fn burst_is_suppressed_then_recovers() {
        let base = Instant::now();
        let mut window = TrafficWindow::new(100);
        let mut verdicts = Vec::new();
        for t in 0..4 {
            verdicts.push(window.record_at(at(base, t), 2, 200));
        }
        assert!(verdicts[3].suppressed);

        let mut recovered = Vec::new();
        for t in 4..8 {
            recovered.push(window.record_at(at(base, t), 1, 10));
        }
        assert!(!recovered[3].suppressed);
        assert!(recovered[3].rate < 100.0);
    }

    #[test]
    fn old_samples_leave_the_window() {
        let base = Instant::now();
        let mut window = TrafficWindow::new(100);
        window.record_at(base, 1, 1_000);
        let verdict = window.record_at(at(base, 10), 1, 1);
        assert_eq!(window.sample_count(), 1);
        assert_eq!(verdict.lines_in_window, 1);
    }

    #[test]
    fn zero_limit_disables_suppression() {
        let base = Instant::now();
        let mut window = TrafficWindow::new(0);
        for t in 0..5 {
            assert!(!window.record_at(at(base, t), 1, 1_000_000).suppressed);
        }
    }
}

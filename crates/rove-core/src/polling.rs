//! Time gates for periodic work.
//!
//! [`LinearPollingInterval`] fires once a fixed duration has passed since the
//! last reset; the tail session uses it as its idle clock.
//! [`BoundedExponentialPollingInterval`] backs off log-file discovery so a
//! slow-starting service is not hammered with discovery scripts.
//!
//! Both use `tokio::time::Instant` so tests can pause and advance the clock.

use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

/// Waits between discovery attempts: five immediate retries, then 10s, 20s,
/// 30s, 60s and finally 120s forever.
pub const BACKOFF_TABLE: [Duration; 10] = [
    Duration::ZERO,
    Duration::ZERO,
    Duration::ZERO,
    Duration::ZERO,
    Duration::ZERO,
    Duration::from_secs(10),
    Duration::from_secs(20),
    Duration::from_secs(30),
    Duration::from_secs(60),
    Duration::from_secs(120),
];

/// Fires when `duration` has elapsed since the last [`reset`](Self::reset).
#[derive(Debug)]
pub struct LinearPollingInterval {
    last_reset: Mutex<Instant>,
}

impl LinearPollingInterval {
    #[must_use]
    pub fn new() -> Self {
        Self {
            last_reset: Mutex::new(Instant::now()),
        }
    }

    pub fn reset(&self) {
        *self.last_reset.lock().expect("polling lock poisoned") = Instant::now();
    }

    /// A zero `duration` never fires. A true result does not reset the gate.
    #[must_use]
    pub fn is_time_for_polling(&self, duration: Duration) -> bool {
        if duration.is_zero() {
            return false;
        }
        let last = *self.last_reset.lock().expect("polling lock poisoned");
        last.elapsed() >= duration
    }

    /// Time since the last reset.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.last_reset.lock().expect("polling lock poisoned").elapsed()
    }
}

impl Default for LinearPollingInterval {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
struct BackoffState {
    last_poll: Instant,
    pointer: usize,
}

/// Walks [`BACKOFF_TABLE`] one entry per call, saturating at the last one.
#[derive(Debug)]
pub struct BoundedExponentialPollingInterval {
    table: &'static [Duration],
    state: Mutex<BackoffState>,
}

impl BoundedExponentialPollingInterval {
    #[must_use]
    pub fn new() -> Self {
        Self::with_table(&BACKOFF_TABLE)
    }

    /// Use a custom ascending table. An empty table always fires.
    #[must_use]
    pub fn with_table(table: &'static [Duration]) -> Self {
        Self {
            table,
            state: Mutex::new(BackoffState {
                last_poll: Instant::now(),
                pointer: 0,
            }),
        }
    }

    pub fn reset(&self) {
        let mut state = self.state.lock().expect("polling lock poisoned");
        state.last_poll = Instant::now();
        state.pointer = 0;
    }

    /// Advances the table pointer on every call; only a true result moves
    /// the last-poll timestamp.
    #[must_use]
    pub fn is_time_for_polling(&self) -> bool {
        let mut state = self.state.lock().expect("polling lock poisoned");
        let wait = match self.table.get(state.pointer) {
            Some(wait) => {
                state.pointer += 1;
                *wait
            }
            None => self.table.last().copied().unwrap_or(Duration::ZERO),
        };

        let now = Instant::now();
        let fire = now.duration_since(state.last_poll) >= wait;
        if fire {
            state.last_poll = now;
        }
        fire
    }

    /// Current table position, for diagnostics.
    #[must_use]
    pub fn pointer(&self) -> usize {
        self.state.lock().expect("polling lock poisoned").pointer
    }
}

impl Default for BoundedExponentialPollingInterval {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn linear_zero_duration_never_fires() {
        let gate = LinearPollingInterval::new();
        tokio::time::advance(Duration::from_secs(3600)).await;
        assert!(!gate.is_time_for_polling(Duration::ZERO));
    }

    #[tokio::test(start_paused = true)]
    async fn linear_fires_after_duration_until_reset() {
        let gate = LinearPollingInterval::new();
        let wait = Duration::from_secs(5);
        assert!(!gate.is_time_for_polling(wait));

        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(!gate.is_time_for_polling(wait));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(gate.is_time_for_polling(wait));
        // No auto-reset.
        assert!(gate.is_time_for_polling(wait));

        gate.reset();
        assert!(!gate.is_time_for_polling(wait));
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_fires_once_per_zero_entry() {
        let gate = BoundedExponentialPollingInterval::new();
        let zeros = BACKOFF_TABLE.iter().filter(|d| d.is_zero()).count();
        for call in 0..zeros {
            assert!(gate.is_time_for_polling(), "call {call} should fire");
        }
        assert!(!gate.is_time_for_polling());
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_waits_for_table_entry() {
        let gate = BoundedExponentialPollingInterval::new();
        for _ in 0..5 {
            assert!(gate.is_time_for_polling());
        }
        // Entry 5 is 10s.
        tokio::time::advance(Duration::from_secs(9)).await;
        assert!(!gate.is_time_for_polling());
        // Entry 6 is 20s, measured from the last successful poll.
        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(gate.is_time_for_polling());
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_saturates_at_last_entry() {
        let gate = BoundedExponentialPollingInterval::new();
        for _ in 0..50 {
            let _ = gate.is_time_for_polling();
        }
        assert_eq!(gate.pointer(), BACKOFF_TABLE.len());

        tokio::time::advance(Duration::from_secs(119)).await;
        assert!(!gate.is_time_for_polling());
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(gate.is_time_for_polling());
        assert!(!gate.is_time_for_polling());
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_reset_rewinds_table() {
        let gate = BoundedExponentialPollingInterval::new();
        for _ in 0..12 {
            let _ = gate.is_time_for_polling();
        }
        gate.reset();
        assert_eq!(gate.pointer(), 0);
        assert!(gate.is_time_for_polling());
    }

    #[test]
    fn empty_table_always_fires() {
        let gate = BoundedExponentialPollingInterval::with_table(&[]);
        assert!(gate.is_time_for_polling());
        assert!(gate.is_time_for_polling());
    }
}

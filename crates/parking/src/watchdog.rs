//! Starvation watchdog for MJPEG streams.
//!
//! A stream polls its camera for a new frame every `poll_interval`. Each poll
//! that finds nothing spends one unit of budget and each delivered frame
//! refills it. An exhausted budget ends the stream instead of letting it hang.

use std::time::Duration;

/// Sleep between polls that found no new frame.
pub const STREAM_POLL_INTERVAL_MS: u64 = 10;
/// Empty polls tolerated before a stream gives up, roughly 40 seconds.
pub const STREAM_MAX_EMPTY_POLLS: u32 = 4_000;

#[derive(Debug, Clone)]
pub struct FrameWatchdog {
    budget: u32,
    remaining: u32,
    poll_interval: Duration,
}

impl Default for FrameWatchdog {
    fn default() -> Self {
        Self::new(
            STREAM_MAX_EMPTY_POLLS,
            Duration::from_millis(STREAM_POLL_INTERVAL_MS),
        )
    }
}

impl FrameWatchdog {
    pub fn new(budget: u32, poll_interval: Duration) -> Self {
        Self {
            budget,
            remaining: budget,
            poll_interval,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Spend one empty poll. Returns false once the budget is exhausted.
    pub fn starve(&mut self) -> bool {
        if self.remaining == 0 {
            return false;
        }
        self.remaining -= 1;
        true
    }

    /// A frame arrived; refill the budget.
    pub fn feed(&mut self) {
        self.remaining = self.budget;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhausts_after_budget() {
        let mut watchdog = FrameWatchdog::new(3, Duration::from_millis(1));
        assert!(watchdog.starve());
        assert!(watchdog.starve());
        assert!(watchdog.starve());
        assert!(!watchdog.starve());
        assert!(!watchdog.starve());
    }

    #[test]
    fn frames_refill_budget() {
        let mut watchdog = FrameWatchdog::new(2, Duration::from_millis(1));
        watchdog.starve();
        watchdog.starve();
        watchdog.feed();
        assert!(watchdog.starve());
        assert!(watchdog.starve());
        assert!(!watchdog.starve());
    }

    #[test]
    fn default_budget() {
        let mut watchdog = FrameWatchdog::default();
        assert!((0..STREAM_MAX_EMPTY_POLLS).all(|_| watchdog.starve()));
        assert!(!watchdog.starve());
        assert_eq!(watchdog.poll_interval(), Duration::from_millis(10));
    }
}

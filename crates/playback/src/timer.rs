//! One-shot re-arming timer driving the playback scheduler.
//!
//! The timer is a deadline, not a thread: the owner polls it (via
//! `RecordDemuxer::advance` or `run`) and the scheduler re-arms it at the
//! end of every tick. Delays are whole milliseconds; the scheduler never
//! arms 0.

use std::time::Duration;

use crate::clock::Clock;

/// A single one-shot deadline in the clock's microsecond domain.
#[derive(Debug, Default)]
pub struct OneShotTimer {
    deadline_us: Option<u64>,
}

impl OneShotTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm (or re-arm) the timer `delay_ms` from now.
    pub fn set(&mut self, clock: &dyn Clock, delay_ms: u32) {
        self.deadline_us = Some(clock.now_us() + delay_ms as u64 * 1_000);
    }

    /// Disarm the timer.
    pub fn clear(&mut self) {
        self.deadline_us = None;
    }

    pub fn is_armed(&self) -> bool {
        self.deadline_us.is_some()
    }

    /// Whether the deadline has been reached.
    pub fn due(&self, clock: &dyn Clock) -> bool {
        self.deadline_us
            .map(|d| clock.now_us() >= d)
            .unwrap_or(false)
    }

    /// Time until the deadline (zero if already due, `None` if disarmed).
    pub fn remaining(&self, clock: &dyn Clock) -> Option<Duration> {
        self.deadline_us
            .map(|d| Duration::from_micros(d.saturating_sub(clock.now_us())))
    }
}

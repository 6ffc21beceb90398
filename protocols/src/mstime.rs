// SPDX-License-Identifier: LGPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

//! Millisecond time base for the service scheduler.
//!
//! The scheduler reads the clock once per loop turn and hands the obtained
//! stamp to every timer operation, so that all timers armed and checked
//! within one turn observe the same instant.

use std::time::Instant;

/// Monotonic millisecond clock.
pub struct MsClock {
    origin: Instant,
}

impl MsClock {
    pub fn new() -> Self {
        MsClock {
            origin: Instant::now(),
        }
    }

    /// Milliseconds elapsed since the clock was created. The absolute value
    /// has no meaning of itself; it is only used to measure intervals.
    pub fn now(&self) -> i64 {
        self.origin.elapsed().as_millis() as i64
    }
}

impl Default for MsClock {
    fn default() -> Self {
        Self::new()
    }
}

/// One-shot timer with millisecond resolution.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OneShot {
    deadline: Option<i64>,
}

impl OneShot {
    /// Arm the timer to expire `ms` milliseconds after `now`. Arming an
    /// already armed timer overwrites the previous deadline.
    pub fn arm(&mut self, now: i64, ms: i64) {
        self.deadline = Some(now + ms);
    }

    pub fn disable(&mut self) {
        self.deadline = None;
    }

    pub fn enabled(&self) -> bool {
        self.deadline.is_some()
    }

    /// Milliseconds until expiry: -1 when disabled, 0 when already expired,
    /// otherwise the remaining interval.
    pub fn left(&self, now: i64) -> i64 {
        match self.deadline {
            None => -1,
            Some(deadline) => (deadline - now).max(0),
        }
    }

    /// Check for expiry. An expired timer is disabled by the check, so the
    /// caller observes each expiration exactly once.
    pub fn expired(&mut self, now: i64) -> bool {
        match self.deadline {
            Some(deadline) if deadline <= now => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }

    /// Shift the deadline of an armed timer, used to compensate clock jumps
    /// over suspend/resume.
    pub fn adjust(&mut self, delta: i64) {
        if let Some(deadline) = self.deadline.as_mut() {
            *deadline += delta;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn one_shot_lifecycle() {
        let mut timer = OneShot::default();
        assert!(!timer.enabled());
        assert_eq!(timer.left(0), -1);
        assert!(!timer.expired(0));

        timer.arm(100, 250);
        assert!(timer.enabled());
        assert_eq!(timer.left(100), 250);
        assert_eq!(timer.left(200), 150);
        assert!(!timer.expired(349));
        assert_eq!(timer.left(350), 0);
        assert!(timer.expired(350));

        // disabled by the expiry check
        assert!(!timer.enabled());
        assert!(!timer.expired(400));
        assert_eq!(timer.left(400), -1);
    }

    #[test]
    fn rearm_overwrites() {
        let mut timer = OneShot::default();
        timer.arm(0, 100);
        timer.arm(50, 100);
        assert!(!timer.expired(120));
        assert!(timer.expired(150));
    }

    #[test]
    fn adjust_shifts_armed_only() {
        let mut timer = OneShot::default();
        timer.adjust(5000);
        assert!(!timer.enabled());

        timer.arm(0, 100);
        timer.adjust(5000);
        assert!(!timer.expired(100));
        assert_eq!(timer.left(5000), 100);
        assert!(timer.expired(5100));
    }

    #[test]
    fn disable_cancels() {
        let mut timer = OneShot::default();
        timer.arm(0, 10);
        timer.disable();
        assert!(!timer.expired(1000));
    }
}

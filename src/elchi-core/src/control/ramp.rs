// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

use std::time::Duration;

/// Moves a working setpoint toward a target at a bounded rate.
#[derive(Debug, Clone, PartialEq)]
pub struct SetpointTracker {
    working: f64,
    target: f64,
    /// Units per minute.
    rate: f64,
}

impl SetpointTracker {
    pub fn new(initial: f64, rate: f64) -> Self {
        Self {
            working: initial,
            target: initial,
            rate: rate.abs(),
        }
    }

    pub fn working(&self) -> f64 {
        self.working
    }

    pub fn target(&self) -> f64 {
        self.target
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn set_target(&mut self, target: f64) {
        self.target = target;
    }

    pub fn set_rate(&mut self, rate: f64) {
        self.rate = rate.abs();
    }

    /// Jump the working setpoint, e.g. to the current PV on entering
    /// automatic mode.
    pub fn reset_working(&mut self, working: f64) {
        self.working = working;
    }

    pub fn increment(&self, loop_period: Duration) -> f64 {
        self.rate * loop_period.as_secs_f64() / 60.0
    }

    /// Advance by one control-loop period and return the new working
    /// setpoint. Never overshoots the target.
    pub fn advance(&mut self, loop_period: Duration) -> f64 {
        let increment = self.increment(loop_period);
        if self.working < self.target {
            self.working = (self.working + increment).min(self.target);
        } else if self.working > self.target {
            self.working = (self.working - increment).max(self.target);
        }
        self.working
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOOP: Duration = Duration::from_millis(250);

    #[test]
    fn test_increment_per_tick() {
        let tracker = SetpointTracker::new(0.0, 15.0);
        assert!((tracker.increment(LOOP) - 0.0625).abs() < 1e-12);
    }

    #[test]
    fn test_ramps_up_monotonically_without_overshoot() {
        let mut tracker = SetpointTracker::new(20.0, 60.0);
        tracker.set_target(21.0);
        let mut last = tracker.working();
        let mut ticks = 0;
        while tracker.working() != tracker.target() {
            let w = tracker.advance(LOOP);
            assert!(w >= last);
            assert!(w <= 21.0);
            last = w;
            ticks += 1;
            assert!(ticks < 100);
        }
        // 1 unit/s * 0.25 s per tick
        assert_eq!(ticks, 4);
    }

    #[test]
    fn test_ramps_down_and_lands_exactly() {
        let mut tracker = SetpointTracker::new(100.0, 30.0);
        tracker.set_target(99.9);
        // increment is 0.125 > 0.1 remaining, so one tick lands exactly
        assert_eq!(tracker.advance(LOOP), 99.9);
        assert_eq!(tracker.advance(LOOP), 99.9);
    }

    #[test]
    fn test_zero_rate_holds_working_setpoint() {
        let mut tracker = SetpointTracker::new(50.0, 0.0);
        tracker.set_target(80.0);
        assert_eq!(tracker.advance(LOOP), 50.0);
    }

    #[test]
    fn test_reset_working_keeps_target() {
        let mut tracker = SetpointTracker::new(25.0, 10.0);
        tracker.set_target(300.0);
        tracker.reset_working(120.0);
        assert_eq!(tracker.working(), 120.0);
        assert_eq!(tracker.target(), 300.0);
    }
}

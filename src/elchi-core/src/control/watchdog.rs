// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Deadline watchdog for externally supplied process variables.

use std::time::{Duration, Instant};

pub const DEFAULT_EXTERNAL_PV_TIMEOUT: Duration = Duration::from_secs(2);

/// Single-shot, rearmable deadline.
///
/// Armed when external-PV mode is switched on, rearmed by every delivered
/// value, and trips at most once per arming.
#[derive(Debug, Clone)]
pub struct Watchdog {
    timeout: Duration,
    deadline: Option<Instant>,
    last_value: Option<f64>,
}

impl Watchdog {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            deadline: None,
            last_value: None,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn last_value(&self) -> Option<f64> {
        self.last_value
    }

    /// Arm from scratch.
    pub fn arm(&mut self, now: Instant) {
        self.last_value = None;
        self.deadline = Some(now + self.timeout);
    }

    /// Record a delivered value. Rearms only while armed.
    pub fn feed(&mut self, value: f64, now: Instant) {
        if self.deadline.is_some() {
            self.last_value = Some(value);
            self.deadline = Some(now + self.timeout);
        }
    }

    pub fn disarm(&mut self) {
        self.deadline = None;
        self.last_value = None;
    }

    /// Returns `true` exactly once when the deadline has passed, then stays
    /// disarmed until armed again.
    pub fn check(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if now >= deadline => {
                self.disarm();
                true
            }
            _ => false,
        }
    }
}

impl Default for Watchdog {
    fn default() -> Self {
        Self::new(DEFAULT_EXTERNAL_PV_TIMEOUT)
    }
}

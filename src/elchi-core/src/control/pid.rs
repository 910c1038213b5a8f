// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Time-gated software PID.
//!
//! Parameters follow the usual industrial controller convention:
//! proportional band in percent of span, integral and derivative time in
//! seconds. The controller only computes a new output once `loop_interval`
//! has passed since the last accepted tick; earlier calls are dropped, not
//! scaled by the shorter delta.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_LOOP_INTERVAL: Duration = Duration::from_millis(250);

const OUTPUT_MIN: f64 = 0.0;
const OUTPUT_MAX: f64 = 100.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PidTuning {
    pub proportional_band: f64,
    pub integral_time: f64,
    pub derivative_time: f64,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PidError {
    #[error("proportional band must be > 0 (got {0})")]
    ProportionalBand(f64),
    #[error("integral time must be > 0 (got {0})")]
    IntegralTime(f64),
    #[error("derivative time must be >= 0 (got {0})")]
    DerivativeTime(f64),
    #[error("loop interval must be > 0")]
    LoopInterval,
}

impl PidTuning {
    pub fn validate(&self) -> Result<(), PidError> {
        if self.proportional_band.is_nan() || self.proportional_band <= 0.0 {
            return Err(PidError::ProportionalBand(self.proportional_band));
        }
        if self.integral_time.is_nan() || self.integral_time <= 0.0 {
            return Err(PidError::IntegralTime(self.integral_time));
        }
        if self.derivative_time.is_nan() || self.derivative_time < 0.0 {
            return Err(PidError::DerivativeTime(self.derivative_time));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct SoftwarePid {
    tuning: PidTuning,
    loop_interval: Duration,
    output_sum: f64,
    last_process_variable: f64,
    last_update: Instant,
}

impl SoftwarePid {
    pub fn new(tuning: PidTuning, loop_interval: Duration) -> Result<Self, PidError> {
        Self::starting_at(tuning, loop_interval, Instant::now())
    }

    /// Build a controller whose first tick is gated relative to `started`.
    pub fn starting_at(
        tuning: PidTuning,
        loop_interval: Duration,
        started: Instant,
    ) -> Result<Self, PidError> {
        tuning.validate()?;
        if loop_interval.is_zero() {
            return Err(PidError::LoopInterval);
        }
        Ok(Self {
            tuning,
            loop_interval,
            output_sum: 0.0,
            last_process_variable: 0.0,
            last_update: started,
        })
    }

    pub fn tuning(&self) -> PidTuning {
        self.tuning
    }

    pub fn set_tuning(&mut self, tuning: PidTuning) -> Result<(), PidError> {
        tuning.validate()?;
        self.tuning = tuning;
        Ok(())
    }

    pub fn loop_interval(&self) -> Duration {
        self.loop_interval
    }

    pub fn output_sum(&self) -> f64 {
        self.output_sum
    }

    pub fn last_process_variable(&self) -> f64 {
        self.last_process_variable
    }

    /// Drop the accumulated integral term.
    pub fn reset_integral(&mut self) {
        self.output_sum = 0.0;
    }

    /// Gains `(kp, ki, kd)` derived from the tuning and loop interval.
    pub fn gains(&self) -> (f64, f64, f64) {
        let interval = self.loop_interval.as_secs_f64();
        let kp = 100.0 / self.tuning.proportional_band;
        let ki = kp / self.tuning.integral_time * interval;
        let kd = kp * self.tuning.derivative_time / interval;
        (kp, ki, kd)
    }

    /// Compute a new output in percent, or `None` if called again before
    /// the loop interval has elapsed.
    pub fn calculate_output(
        &mut self,
        process_variable: f64,
        setpoint: f64,
        now: Instant,
    ) -> Option<f64> {
        if now.saturating_duration_since(self.last_update) <= self.loop_interval {
            return None;
        }

        let (kp, ki, kd) = self.gains();
        let error = setpoint - process_variable;
        let d_pv = process_variable - self.last_process_variable;

        self.output_sum = (self.output_sum + ki * error).clamp(OUTPUT_MIN, OUTPUT_MAX);
        let output = (error * kp + self.output_sum - d_pv * kd).clamp(OUTPUT_MIN, OUTPUT_MAX);

        self.last_process_variable = process_variable;
        self.last_update = now;
        Some(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f64 = 1e-9;

    fn tuning(pb: f64, ti: f64, td: f64) -> PidTuning {
        PidTuning {
            proportional_band: pb,
            integral_time: ti,
            derivative_time: td,
        }
    }

    fn step(t0: Instant, n: u32) -> Instant {
        t0 + Duration::from_millis(260) * n
    }

    #[test]
    fn test_gains_from_tuning() {
        let pid = SoftwarePid::new(tuning(50.0, 10.0, 2.0), Duration::from_millis(250)).unwrap();
        let (kp, ki, kd) = pid.gains();
        assert!((kp - 2.0).abs() < EPS);
        assert!((ki - 0.05).abs() < EPS);
        assert!((kd - 16.0).abs() < EPS);
    }

    #[test]
    fn test_output_matches_formula() {
        let t0 = Instant::now();
        let mut pid =
            SoftwarePid::starting_at(tuning(200.0, 10.0, 1.0), Duration::from_millis(250), t0)
                .unwrap();
        // kp = 0.5, ki = 0.0125, kd = 2.0
        let out = pid.calculate_output(10.0, 40.0, step(t0, 1)).unwrap();
        // error = 30, d_pv = 10, sum = 0.375
        let expected = 30.0 * 0.5 + 0.375 - 10.0 * 2.0;
        assert!(expected < 0.0);
        assert!((out - 0.0).abs() < EPS);
        assert!((pid.output_sum() - 0.375).abs() < EPS);

        let out = pid.calculate_output(12.0, 40.0, step(t0, 2)).unwrap();
        // error = 28, d_pv = 2, sum = 0.375 + 0.35
        let sum = 0.375 + 0.35;
        let expected = 28.0 * 0.5 + sum - 2.0 * 2.0;
        assert!((pid.output_sum() - sum).abs() < EPS);
        assert!((out - expected).abs() < EPS);
    }

    #[test]
    fn test_output_and_sum_are_clamped() {
        let t0 = Instant::now();
        let mut pid =
            SoftwarePid::starting_at(tuning(1.0, 0.01, 0.0), Duration::from_millis(250), t0)
                .unwrap();
        let out = pid.calculate_output(0.0, 500.0, step(t0, 1)).unwrap();
        assert_eq!(out, 100.0);
        assert_eq!(pid.output_sum(), 100.0);

        let out = pid.calculate_output(900.0, 0.0, step(t0, 2)).unwrap();
        assert_eq!(out, 0.0);
        assert_eq!(pid.output_sum(), 0.0);
    }

    #[test]
    fn test_time_gating_drops_early_ticks() {
        let t0 = Instant::now();
        let mut pid =
            SoftwarePid::starting_at(tuning(100.0, 10.0, 0.0), Duration::from_millis(250), t0)
                .unwrap();

        assert!(pid.calculate_output(20.0, 30.0, t0 + Duration::from_millis(100)).is_none());
        assert_eq!(pid.last_process_variable(), 0.0);

        let t1 = t0 + Duration::from_millis(300);
        assert!(pid.calculate_output(20.0, 30.0, t1).is_some());
        assert_eq!(pid.last_process_variable(), 20.0);

        assert!(pid.calculate_output(25.0, 30.0, t1 + Duration::from_millis(200)).is_none());
        assert_eq!(pid.last_process_variable(), 20.0);

        assert!(pid.calculate_output(25.0, 30.0, t1 + Duration::from_millis(251)).is_some());
        assert_eq!(pid.last_process_variable(), 25.0);
    }

    #[test]
    fn test_reset_integral() {
        let t0 = Instant::now();
        let mut pid =
            SoftwarePid::starting_at(tuning(100.0, 1.0, 0.0), Duration::from_millis(250), t0)
                .unwrap();
        pid.calculate_output(0.0, 10.0, step(t0, 1));
        assert!(pid.output_sum() > 0.0);
        pid.reset_integral();
        assert_eq!(pid.output_sum(), 0.0);
    }

    #[test]
    fn test_rejects_degenerate_tuning() {
        let interval = Duration::from_millis(250);
        assert_eq!(
            SoftwarePid::new(tuning(0.0, 1.0, 0.0), interval).unwrap_err(),
            PidError::ProportionalBand(0.0)
        );
        assert_eq!(
            SoftwarePid::new(tuning(10.0, 0.0, 0.0), interval).unwrap_err(),
            PidError::IntegralTime(0.0)
        );
        assert_eq!(
            SoftwarePid::new(tuning(10.0, 1.0, 0.0), Duration::ZERO).unwrap_err(),
            PidError::LoopInterval
        );
        assert!(SoftwarePid::new(tuning(f64::NAN, 1.0, 0.0), interval).is_err());

        let mut pid = SoftwarePid::new(tuning(10.0, 1.0, 0.0), interval).unwrap();
        assert!(pid.set_tuning(tuning(-5.0, 1.0, 0.0)).is_err());
        assert_eq!(pid.tuning().proportional_band, 10.0);
    }
}

// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Power supply driving a simulated heater coil.
//!
//! The coil heats toward `AMBIENT + THERMAL_GAIN * watts` with a first-order
//! lag and its resistance follows the same empirical curve the heater uses
//! to read temperature back, so the loop closes without hardware.

use std::time::Instant;

use elchi_core::device::response::{DeviceError, DeviceResult};
use elchi_core::device::supply::PowerSupply;

const AMBIENT: f64 = 25.0;
/// °C per watt at equilibrium.
const THERMAL_GAIN: f64 = 12.0;
/// Seconds.
const TIME_CONSTANT: f64 = 20.0;

pub struct SimulatedSupply {
    cold_resistance: f64,
    voltage_limit: f64,
    current_limit: f64,
    output: bool,
    open: bool,
    temperature: f64,
    last_update: Instant,
}

impl SimulatedSupply {
    pub fn new(cold_resistance: f64) -> Self {
        Self {
            cold_resistance,
            voltage_limit: 0.0,
            current_limit: 0.0,
            output: true,
            open: true,
            temperature: AMBIENT,
            last_update: Instant::now(),
        }
    }

    /// Coil resistance at `temperature`; inverse of
    /// [`temperature_from_resistance`](crate::heater::temperature_from_resistance).
    fn resistance_at(&self, temperature: f64) -> f64 {
        (temperature * 0.0003 + 0.2) * self.cold_resistance / 0.2075
    }

    fn ensure_open(&self) -> DeviceResult<()> {
        if self.open {
            Ok(())
        } else {
            Err(DeviceError::transport("simulated supply is closed"))
        }
    }

    fn operating_point(&self) -> (f64, f64) {
        if !self.output {
            return (0.0, 0.0);
        }
        let resistance = self.resistance_at(self.temperature);
        let current = self
            .current_limit
            .min(self.voltage_limit / resistance)
            .max(0.0);
        (current * resistance, current)
    }

    fn settle(&mut self, now: Instant) {
        let dt = now.saturating_duration_since(self.last_update).as_secs_f64();
        self.last_update = now;
        let (volts, amps) = self.operating_point();
        let equilibrium = AMBIENT + THERMAL_GAIN * volts * amps;
        self.temperature += (equilibrium - self.temperature) * (1.0 - (-dt / TIME_CONSTANT).exp());
    }
}

impl PowerSupply for SimulatedSupply {
    fn set_voltage_limit(&mut self, volts: f64) -> DeviceResult<()> {
        self.ensure_open()?;
        self.settle(Instant::now());
        self.voltage_limit = volts.max(0.0);
        Ok(())
    }

    fn set_current_limit(&mut self, amps: f64) -> DeviceResult<()> {
        self.ensure_open()?;
        self.settle(Instant::now());
        self.current_limit = amps.max(0.0);
        Ok(())
    }

    fn voltage(&mut self) -> DeviceResult<f64> {
        self.ensure_open()?;
        self.settle(Instant::now());
        Ok(self.operating_point().0)
    }

    fn current(&mut self) -> DeviceResult<f64> {
        self.ensure_open()?;
        self.settle(Instant::now());
        Ok(self.operating_point().1)
    }

    fn set_output_enabled(&mut self, enabled: bool) -> DeviceResult<()> {
        self.ensure_open()?;
        self.settle(Instant::now());
        self.output = enabled;
        Ok(())
    }

    fn close(&mut self) -> DeviceResult<()> {
        self.open = false;
        Ok(())
    }

    fn reopen(&mut self) -> DeviceResult<()> {
        self.open = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heater::temperature_from_resistance;
    use std::time::Duration;

    #[test]
    fn test_resistance_reads_back_as_temperature() {
        let mut psu = SimulatedSupply::new(0.528);
        psu.set_voltage_limit(10.0).unwrap();
        psu.set_current_limit(2.0).unwrap();
        let r = psu.resistance().unwrap().unwrap();
        let t = temperature_from_resistance(r, 0.528);
        assert!((t - psu.temperature).abs() < 1e-6);
    }

    #[test]
    fn test_coil_heats_under_power() {
        let mut psu = SimulatedSupply::new(0.528);
        psu.set_voltage_limit(10.0).unwrap();
        psu.set_current_limit(5.0).unwrap();
        let later = psu.last_update + Duration::from_secs(60);
        psu.settle(later);
        assert!(psu.temperature > 100.0);
    }

    #[test]
    fn test_disabled_output_draws_nothing() {
        let mut psu = SimulatedSupply::new(0.528);
        psu.set_voltage_limit(10.0).unwrap();
        psu.set_current_limit(5.0).unwrap();
        psu.set_output_enabled(false).unwrap();
        assert_eq!(psu.resistance().unwrap(), None);
    }

    #[test]
    fn test_closed_supply_fails_until_reopened() {
        let mut psu = SimulatedSupply::new(0.528);
        psu.close().unwrap();
        assert!(psu.current().is_err());
        psu.reopen().unwrap();
        assert!(psu.current().is_ok());
    }
}

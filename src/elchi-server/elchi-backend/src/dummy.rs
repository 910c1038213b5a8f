// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Simulated devices for development and testing.
//!
//! No hardware or serial port required. Each call takes a few milliseconds
//! under its transport guard, like a slow instrument would.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::info;

use elchi_core::device::guard::TransportGuard;
use elchi_core::device::response::{DeviceError, DeviceResult};
use elchi_core::device::{DeviceAccess, DeviceCapabilities, DeviceInfo, Quantity};
use elchi_core::{ControlMode, Controller, Device, Sensor};

const LATENCY: Duration = Duration::from_millis(10);

fn clock() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

fn simulated_info(model: &str, quantity: Quantity, capabilities: DeviceCapabilities) -> DeviceInfo {
    DeviceInfo {
        manufacturer: "Test".to_string(),
        model: model.to_string(),
        quantity,
        capabilities,
        access: DeviceAccess::Simulated,
    }
}

/// Sensor reading a sawtooth of the wall clock.
pub struct TestSensor {
    info: DeviceInfo,
    link: TransportGuard<()>,
}

impl TestSensor {
    pub fn new(quantity: Quantity) -> Self {
        let model = match quantity {
            Quantity::Temperature => "Test Sensor",
            Quantity::Voltage => "Test Sensor Voltage",
        };
        info!("{} connected", model);
        Self {
            info: simulated_info(model, quantity, DeviceCapabilities::default()),
            link: TransportGuard::new(model, ()),
        }
    }
}

impl Device for TestSensor {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn close(&self) -> DeviceResult<()> {
        info!("{} disconnected", self.info.model);
        Ok(())
    }

    fn reopen(&self) -> DeviceResult<()> {
        Ok(())
    }
}

impl Sensor for TestSensor {
    fn sensor_value(&self) -> DeviceResult<f64> {
        self.link.with(|_| {
            std::thread::sleep(LATENCY);
            Ok(clock() % 60.0)
        })
    }
}

/// Controller whose readings are unrelated sawtooth signals. Writes are
/// accepted and only logged.
pub struct TestController {
    info: DeviceInfo,
    link: TransportGuard<()>,
}

impl TestController {
    pub fn new() -> Self {
        Self {
            info: simulated_info(
                "Test Controller",
                Quantity::Temperature,
                DeviceCapabilities {
                    manual_output: true,
                    reconnect: true,
                    ..DeviceCapabilities::default()
                },
            ),
            link: TransportGuard::new("Test Controller", ()),
        }
    }

    fn read(&self, value: impl FnOnce(f64) -> f64) -> DeviceResult<f64> {
        self.link.with(|_| {
            std::thread::sleep(LATENCY);
            Ok(value(clock()))
        })
    }

    fn write(&self, what: String) -> DeviceResult<()> {
        self.link.with(|_| {
            info!("Test Controller: {}", what);
            Ok(())
        })
    }
}

impl Default for TestController {
    fn default() -> Self {
        Self::new()
    }
}

impl Device for TestController {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn close(&self) -> DeviceResult<()> {
        info!("Test Controller disconnected");
        Ok(())
    }

    fn reopen(&self) -> DeviceResult<()> {
        Ok(())
    }
}

impl Controller for TestController {
    fn process_variable(&self) -> DeviceResult<f64> {
        self.read(|t| t % 60.0 + 1.0)
    }

    fn target_setpoint(&self) -> DeviceResult<f64> {
        self.read(|t| t % 60.0 + 2.0)
    }

    fn set_target_setpoint(&self, setpoint: f64) -> DeviceResult<()> {
        self.write(format!("set target setpoint {:.1}", setpoint))
    }

    fn working_setpoint(&self) -> DeviceResult<f64> {
        self.read(|t| t % 60.0 + 4.0)
    }

    fn working_output(&self) -> DeviceResult<f64> {
        self.read(|t| 100.0 - t % 100.0)
    }

    fn rate(&self) -> DeviceResult<f64> {
        self.read(|t| t % 15.0)
    }

    fn set_rate(&self, rate: f64) -> DeviceResult<()> {
        self.write(format!("set rate {:.1}", rate))
    }

    fn control_mode(&self) -> DeviceResult<ControlMode> {
        let phase = self.read(|t| t % 60.0)?;
        Ok(if phase > 30.0 {
            ControlMode::Automatic
        } else {
            ControlMode::Manual
        })
    }

    fn set_control_mode(&self, mode: ControlMode) -> DeviceResult<()> {
        self.write(format!("set {} mode", mode))
    }

    fn set_manual_output_power(&self, power: f64) -> DeviceResult<()> {
        self.write(format!("set output power {:.1}", power))
    }
}

#[derive(Debug, Clone, Copy)]
struct Plant {
    target: f64,
    working: f64,
    pv: f64,
    rate: f64,
    mode: ControlMode,
}

/// Controller with a first-order plant behind it: the working setpoint
/// climbs by `rate / 60` per read toward the target and the PV lags it.
pub struct NiceTestController {
    info: DeviceInfo,
    plant: TransportGuard<Plant>,
}

impl NiceTestController {
    pub fn new() -> Self {
        Self {
            info: simulated_info(
                "Nice Test Controller",
                Quantity::Temperature,
                DeviceCapabilities {
                    reconnect: true,
                    ..DeviceCapabilities::default()
                },
            ),
            plant: TransportGuard::new(
                "Nice Test Controller",
                Plant {
                    target: 0.0,
                    working: 0.0,
                    pv: 0.0,
                    rate: 5.0,
                    mode: ControlMode::Automatic,
                },
            ),
        }
    }
}

impl Default for NiceTestController {
    fn default() -> Self {
        Self::new()
    }
}

impl Device for NiceTestController {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn close(&self) -> DeviceResult<()> {
        Ok(())
    }

    fn reopen(&self) -> DeviceResult<()> {
        Ok(())
    }
}

impl Controller for NiceTestController {
    fn process_variable(&self) -> DeviceResult<f64> {
        self.plant.with(|p| {
            p.pv = 0.9 * p.pv + 0.1 * p.working;
            Ok(p.pv)
        })
    }

    fn target_setpoint(&self) -> DeviceResult<f64> {
        self.plant.with(|p| Ok(p.target))
    }

    fn set_target_setpoint(&self, setpoint: f64) -> DeviceResult<()> {
        self.plant.with(|p| {
            p.target = setpoint;
            Ok(())
        })
    }

    fn working_setpoint(&self) -> DeviceResult<f64> {
        self.plant.with(|p| {
            let step = p.rate / 60.0;
            if p.working < p.target {
                p.working = (p.working + step).min(p.target);
            } else {
                p.working = (p.working - step).max(p.target);
            }
            Ok(p.working)
        })
    }

    fn working_output(&self) -> DeviceResult<f64> {
        self.plant
            .with(|p| Ok(((p.working - p.pv) * 10.0).clamp(0.0, 100.0)))
    }

    fn rate(&self) -> DeviceResult<f64> {
        self.plant.with(|p| Ok(p.rate))
    }

    fn set_rate(&self, rate: f64) -> DeviceResult<()> {
        self.plant.with(|p| {
            p.rate = rate.abs();
            Ok(())
        })
    }

    fn control_mode(&self) -> DeviceResult<ControlMode> {
        self.plant.with(|p| Ok(p.mode))
    }

    fn set_control_mode(&self, mode: ControlMode) -> DeviceResult<()> {
        self.plant.with(|p| {
            p.mode = mode;
            Ok(())
        })
    }
}

/// Controller whose link is always down.
pub struct FaultyTestController {
    info: DeviceInfo,
}

impl FaultyTestController {
    pub fn new() -> Self {
        Self {
            info: simulated_info(
                "Faulty Test Controller",
                Quantity::Temperature,
                DeviceCapabilities::default(),
            ),
        }
    }

    fn fail<T>(&self) -> DeviceResult<T> {
        Err(DeviceError::transport("Faulty Test Controller does not answer"))
    }
}

impl Default for FaultyTestController {
    fn default() -> Self {
        Self::new()
    }
}

impl Device for FaultyTestController {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn close(&self) -> DeviceResult<()> {
        self.fail()
    }
}

impl Controller for FaultyTestController {
    fn process_variable(&self) -> DeviceResult<f64> {
        self.fail()
    }

    fn target_setpoint(&self) -> DeviceResult<f64> {
        self.fail()
    }

    fn set_target_setpoint(&self, _setpoint: f64) -> DeviceResult<()> {
        self.fail()
    }

    fn working_setpoint(&self) -> DeviceResult<f64> {
        self.fail()
    }

    fn working_output(&self) -> DeviceResult<f64> {
        self.fail()
    }

    fn rate(&self) -> DeviceResult<f64> {
        self.fail()
    }

    fn set_rate(&self, _rate: f64) -> DeviceResult<()> {
        self.fail()
    }

    fn control_mode(&self) -> DeviceResult<ControlMode> {
        self.fail()
    }

    fn set_control_mode(&self, _mode: ControlMode) -> DeviceResult<()> {
        self.fail()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use elchi_core::DeviceErrorKind;

    #[test]
    fn test_sensor_sawtooth_range() {
        let sensor = TestSensor::new(Quantity::Temperature);
        let v = sensor.sensor_value().unwrap();
        assert!((0.0..60.0).contains(&v));
        assert_eq!(TestSensor::new(Quantity::Voltage).info().quantity, Quantity::Voltage);
    }

    #[test]
    fn test_controller_readings_are_offset() {
        let ctl = TestController::new();
        let pv = ctl.process_variable().unwrap();
        assert!((1.0..61.0).contains(&pv));
        let out = ctl.working_output().unwrap();
        assert!(out > 0.0 && out <= 100.0);
        assert!(ctl.set_target_setpoint(100.0).is_ok());
        assert_eq!(
            ctl.set_aiming_beam(true).unwrap_err().kind,
            DeviceErrorKind::Unsupported
        );
    }

    #[test]
    fn test_nice_controller_ramps_and_lags() {
        let ctl = NiceTestController::new();
        ctl.set_target_setpoint(1.0).unwrap();
        ctl.set_rate(30.0).unwrap();
        assert_eq!(ctl.working_setpoint().unwrap(), 0.5);
        assert_eq!(ctl.working_setpoint().unwrap(), 1.0);
        assert_eq!(ctl.working_setpoint().unwrap(), 1.0);
        let pv = ctl.process_variable().unwrap();
        assert!((pv - 0.1).abs() < 1e-12);
    }

    #[test]
    fn test_faulty_controller_always_fails() {
        let ctl = FaultyTestController::new();
        assert_eq!(
            ctl.process_variable().unwrap_err().kind,
            DeviceErrorKind::Transport
        );
        assert!(ctl.close().is_err());
    }
}

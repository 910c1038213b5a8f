// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Programmable bench power supply driven by software controllers.

use super::response::{DeviceError, DeviceResult};

/// Current below which a resistance reading is meaningless.
pub const MIN_MEASURABLE_CURRENT: f64 = 0.1;

/// Blocking interface of a single-channel power supply.
///
/// Implementations own their transport; callers wrap them in a
/// [`TransportGuard`](super::guard::TransportGuard) when shared.
pub trait PowerSupply: Send {
    fn set_voltage_limit(&mut self, volts: f64) -> DeviceResult<()>;

    fn set_current_limit(&mut self, amps: f64) -> DeviceResult<()>;

    fn voltage(&mut self) -> DeviceResult<f64>;

    fn current(&mut self) -> DeviceResult<f64>;

    /// Load resistance in ohms, `None` while too little current flows.
    fn resistance(&mut self) -> DeviceResult<Option<f64>> {
        let current = self.current()?;
        let voltage = self.voltage()?;
        if current < MIN_MEASURABLE_CURRENT {
            Ok(None)
        } else {
            Ok(Some(voltage / current))
        }
    }

    fn set_output_enabled(&mut self, _enabled: bool) -> DeviceResult<()> {
        Err(DeviceError::unsupported("set_output_enabled"))
    }

    fn close(&mut self) -> DeviceResult<()>;

    fn reopen(&mut self) -> DeviceResult<()> {
        Err(DeviceError::unsupported("reopen"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed {
        volts: f64,
        amps: f64,
    }

    impl PowerSupply for Fixed {
        fn set_voltage_limit(&mut self, _volts: f64) -> DeviceResult<()> {
            Ok(())
        }
        fn set_current_limit(&mut self, _amps: f64) -> DeviceResult<()> {
            Ok(())
        }
        fn voltage(&mut self) -> DeviceResult<f64> {
            Ok(self.volts)
        }
        fn current(&mut self) -> DeviceResult<f64> {
            Ok(self.amps)
        }
        fn close(&mut self) -> DeviceResult<()> {
            Ok(())
        }
    }

    #[test]
    fn test_resistance_from_readings() {
        let mut psu = Fixed {
            volts: 2.0,
            amps: 4.0,
        };
        assert_eq!(psu.resistance().unwrap(), Some(0.5));
    }

    #[test]
    fn test_resistance_needs_current() {
        let mut psu = Fixed {
            volts: 2.0,
            amps: 0.05,
        };
        assert_eq!(psu.resistance().unwrap(), None);
    }

    #[test]
    fn test_output_toggle_is_optional() {
        let mut psu = Fixed {
            volts: 0.0,
            amps: 0.0,
        };
        assert!(psu.set_output_enabled(true).is_err());
    }
}

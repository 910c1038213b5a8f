// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub mod guard;
pub mod response;
pub mod supply;

use response::{DeviceError, DeviceResult};

/// Physical quantity a device measures or regulates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Quantity {
    Temperature,
    Voltage,
}

impl Quantity {
    pub fn unit(&self) -> &'static str {
        match self {
            Quantity::Temperature => "°C",
            Quantity::Voltage => "mV",
        }
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Quantity::Temperature => write!(f, "Temperature"),
            Quantity::Voltage => write!(f, "Voltage"),
        }
    }
}

/// Which of the two engine slots a device occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    Controller,
    Sensor,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceKind::Controller => write!(f, "controller"),
            DeviceKind::Sensor => write!(f, "sensor"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlMode {
    Automatic,
    Manual,
}

impl fmt::Display for ControlMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlMode::Automatic => write!(f, "Automatic"),
            ControlMode::Manual => write!(f, "Manual"),
        }
    }
}

/// Named PID parameter of a controller with up to three gain sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PidParameter {
    P1,
    P2,
    P3,
    I1,
    I2,
    I3,
    D1,
    D2,
    D3,
    /// Boundary between gain set 1 and 2.
    B12,
    /// Boundary between gain set 2 and 3.
    B23,
    #[serde(rename = "GS")]
    GainScheduling,
    #[serde(rename = "AS")]
    ActiveSet,
}

impl PidParameter {
    pub const ALL: [PidParameter; 13] = [
        PidParameter::P1,
        PidParameter::P2,
        PidParameter::P3,
        PidParameter::I1,
        PidParameter::I2,
        PidParameter::I3,
        PidParameter::D1,
        PidParameter::D2,
        PidParameter::D3,
        PidParameter::B12,
        PidParameter::B23,
        PidParameter::GainScheduling,
        PidParameter::ActiveSet,
    ];

    /// The single gain set P1/I1/D1.
    pub const FIRST_SET: [PidParameter; 3] = [PidParameter::P1, PidParameter::I1, PidParameter::D1];

    pub fn name(&self) -> &'static str {
        match self {
            PidParameter::P1 => "P1",
            PidParameter::P2 => "P2",
            PidParameter::P3 => "P3",
            PidParameter::I1 => "I1",
            PidParameter::I2 => "I2",
            PidParameter::I3 => "I3",
            PidParameter::D1 => "D1",
            PidParameter::D2 => "D2",
            PidParameter::D3 => "D3",
            PidParameter::B12 => "B12",
            PidParameter::B23 => "B23",
            PidParameter::GainScheduling => "GS",
            PidParameter::ActiveSet => "AS",
        }
    }
}

impl fmt::Display for PidParameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for PidParameter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PidParameter::ALL
            .iter()
            .copied()
            .find(|p| p.name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("Unknown PID parameter: {}", s))
    }
}

/// How a device is reached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceAccess {
    Serial { path: String, baud: u32 },
    Simulated,
}

/// Optional members a device actually implements.
///
/// Callers check these before offering a control; calling an optional
/// member that is not listed yields `DeviceErrorKind::Unsupported`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceCapabilities {
    pub manual_output: bool,
    /// PID parameters readable and writable on this device.
    pub pid_parameters: Vec<PidParameter>,
    pub output_enable: bool,
    pub aiming_beam: bool,
    /// Device accepts a process variable fed from an external sensor.
    pub external_pv: bool,
    /// Device can close and reopen its transport in place.
    pub reconnect: bool,
}

/// Coil and supply limits of a software-regulated heater.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HeaterConfig {
    /// Coil resistance at room temperature, ohms.
    pub cold_resistance: f64,
    pub max_voltage: f64,
    pub max_current: f64,
    /// Output floor in automatic mode, percent.
    pub min_output: f64,
}

/// Voltage/current sweep of a heater coil and the line fitted through it.
///
/// `resistance` is the slope of voltage over current, the coil's cold
/// resistance when the sweep stays cool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Calibration {
    pub voltages: Vec<f64>,
    pub currents: Vec<f64>,
    pub resistance: f64,
    pub offset: f64,
    pub r_squared: f64,
}

/// Static info describing a device backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub manufacturer: String,
    pub model: String,
    pub quantity: Quantity,
    pub capabilities: DeviceCapabilities,
    pub access: DeviceAccess,
}

/// Common interface for device backends.
///
/// All methods block on the device transport and are meant to be called
/// from the dispatcher's worker pool, never from the engine task itself.
pub trait Device: Send + Sync {
    fn info(&self) -> &DeviceInfo;

    /// Release the transport so the same port can be opened again.
    fn close(&self) -> DeviceResult<()>;

    /// Close and open the transport again after a run of link failures.
    fn reopen(&self) -> DeviceResult<()> {
        Err(DeviceError::unsupported("reopen"))
    }
}

/// Read-only measuring device.
pub trait Sensor: Device {
    fn sensor_value(&self) -> DeviceResult<f64>;
}

/// Regulating device: a PID controller or something driven like one.
pub trait Controller: Device {
    fn process_variable(&self) -> DeviceResult<f64>;

    fn target_setpoint(&self) -> DeviceResult<f64>;

    fn set_target_setpoint(&self, setpoint: f64) -> DeviceResult<()>;

    /// Rate-limited setpoint the device currently regulates to.
    fn working_setpoint(&self) -> DeviceResult<f64>;

    /// Output power in percent.
    fn working_output(&self) -> DeviceResult<f64>;

    /// Setpoint rate in units per minute.
    fn rate(&self) -> DeviceResult<f64>;

    fn set_rate(&self, rate: f64) -> DeviceResult<()>;

    fn control_mode(&self) -> DeviceResult<ControlMode>;

    fn set_control_mode(&self, mode: ControlMode) -> DeviceResult<()>;

    fn set_manual_output_power(&self, _power: f64) -> DeviceResult<()> {
        Err(DeviceError::unsupported("set_manual_output_power"))
    }

    fn pid_parameter(&self, parameter: PidParameter) -> DeviceResult<f64> {
        Err(DeviceError::unsupported(&format!("reading {}", parameter)))
    }

    fn set_pid_parameter(&self, parameter: PidParameter, _value: f64) -> DeviceResult<()> {
        Err(DeviceError::unsupported(&format!("writing {}", parameter)))
    }

    fn set_output_enabled(&self, _enabled: bool) -> DeviceResult<()> {
        Err(DeviceError::unsupported("set_output_enabled"))
    }

    fn set_aiming_beam(&self, _enabled: bool) -> DeviceResult<()> {
        Err(DeviceError::unsupported("set_aiming_beam"))
    }

    /// Deliver a process variable measured by an external sensor.
    fn write_external_pv(&self, _value: f64) -> DeviceResult<()> {
        Err(DeviceError::unsupported("write_external_pv"))
    }

    fn set_external_pv_mode(&self, _enabled: bool) -> DeviceResult<()> {
        Err(DeviceError::unsupported("set_external_pv_mode"))
    }

    fn heater_config(&self) -> DeviceResult<HeaterConfig> {
        Err(DeviceError::unsupported("heater_config"))
    }

    fn set_heater_config(&self, _config: HeaterConfig) -> DeviceResult<()> {
        Err(DeviceError::unsupported("set_heater_config"))
    }

    /// Sweep the output and fit the coil resistance. Blocks for the whole
    /// sweep.
    fn calibrate(&self) -> DeviceResult<Calibration> {
        Err(DeviceError::unsupported("calibrate"))
    }
}

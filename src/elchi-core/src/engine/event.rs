// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

use std::fmt;

use serde::Serialize;

use crate::device::{Calibration, ControlMode, DeviceKind, HeaterConfig, PidParameter};

/// Periodically polled controller reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusParameter {
    ProcessVariable,
    WorkingSetpoint,
    Power,
}

impl fmt::Display for StatusParameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatusParameter::ProcessVariable => write!(f, "Controller PV"),
            StatusParameter::WorkingSetpoint => write!(f, "Setpoint"),
            StatusParameter::Power => write!(f, "Power"),
        }
    }
}

/// Controller setting read back on request.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "parameter", content = "value", rename_all = "snake_case")]
pub enum ControllerSetting {
    TargetSetpoint(f64),
    Power(f64),
    Rate(f64),
    Mode(ControlMode),
}

/// Notification broadcast by the engine task.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    SensorStatus {
        value: f64,
        /// Seconds since logging started, 0 when not logging.
        elapsed: f64,
    },
    ControllerStatus {
        parameter: StatusParameter,
        value: f64,
        elapsed: f64,
    },
    ControllerParameter {
        setting: ControllerSetting,
    },
    PidParameter {
        parameter: PidParameter,
        value: f64,
    },
    HeaterConfig {
        config: HeaterConfig,
    },
    CalibrationFinished {
        calibration: Calibration,
    },
    Connected {
        kind: DeviceKind,
        model: String,
    },
    Disconnected {
        kind: DeviceKind,
    },
    ConnectionFailed {
        kind: DeviceKind,
        model: String,
        error: String,
    },
    CommunicationFailed {
        kind: DeviceKind,
        error: String,
    },
    NotSupported {
        kind: DeviceKind,
        error: String,
    },
    Error {
        message: String,
    },
    Message {
        message: String,
    },
    RampStarted {
        segment: usize,
    },
    HoldStarted {
        segment: usize,
    },
    ProgramFinished,
    ProgramStopped,
    LogExported {
        path: String,
        rows: usize,
    },
    AvailableDevices {
        kind: DeviceKind,
        models: Vec<String>,
    },
    AvailablePorts {
        ports: Vec<String>,
    },
}

impl EngineEvent {
    pub fn error(message: impl Into<String>) -> Self {
        EngineEvent::Error {
            message: message.into(),
        }
    }

    pub fn message(message: impl Into<String>) -> Self {
        EngineEvent::Message {
            message: message.into(),
        }
    }
}

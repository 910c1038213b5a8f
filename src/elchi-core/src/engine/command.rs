// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

use serde::{Deserialize, Serialize};

use crate::control::programmer::ProgramSegment;
use crate::device::{ControlMode, DeviceKind, HeaterConfig, PidParameter, Quantity};

/// Request handled by the engine task.
///
/// Also the wire format of the JSON line listener, one command per line:
/// `{"cmd":"set_target_setpoint","value":120.0}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum EngineCommand {
    Connect {
        kind: DeviceKind,
        model: String,
        #[serde(default)]
        port: Option<String>,
        #[serde(default)]
        baud: Option<u32>,
    },
    Disconnect {
        kind: DeviceKind,
    },
    SetTargetSetpoint {
        value: f64,
    },
    SetRate {
        value: f64,
    },
    SetManualOutputPower {
        value: f64,
    },
    SetControlMode {
        mode: ControlMode,
    },
    SetPidParameter {
        parameter: PidParameter,
        value: f64,
    },
    RefreshParameters,
    RefreshPid,
    RefreshHeaterConfig,
    SetHeaterConfig {
        config: HeaterConfig,
    },
    /// Sweep the heater output and report the fitted coil resistance.
    Calibrate,
    SetOutputEnabled {
        enabled: bool,
    },
    SetAimingBeam {
        enabled: bool,
    },
    StartProgram {
        segments: Vec<ProgramSegment>,
    },
    StopProgram,
    SkipSegment,
    SetExternalPvMode {
        enabled: bool,
    },
    /// Sensor value to hand to the controller outside the periodic transfer.
    FeedExternalPv {
        value: f64,
    },
    StartLog,
    StopLog,
    ClearLog,
    /// Relative paths land in the configured log directory; without a path
    /// the configured file name template is used.
    ExportLog {
        #[serde(default)]
        path: Option<String>,
    },
    ListDevices {
        kind: DeviceKind,
        #[serde(default)]
        quantity: Option<Quantity>,
    },
    ListPorts,
}

impl EngineCommand {
    /// Device slot the command needs bound, if any.
    pub fn required_device(&self) -> Option<DeviceKind> {
        match self {
            EngineCommand::SetTargetSetpoint { .. }
            | EngineCommand::SetRate { .. }
            | EngineCommand::SetManualOutputPower { .. }
            | EngineCommand::SetControlMode { .. }
            | EngineCommand::SetPidParameter { .. }
            | EngineCommand::RefreshParameters
            | EngineCommand::RefreshPid
            | EngineCommand::RefreshHeaterConfig
            | EngineCommand::SetHeaterConfig { .. }
            | EngineCommand::Calibrate
            | EngineCommand::SetOutputEnabled { .. }
            | EngineCommand::SetAimingBeam { .. }
            | EngineCommand::StartProgram { .. }
            | EngineCommand::SkipSegment
            | EngineCommand::FeedExternalPv { .. } => Some(DeviceKind::Controller),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tagged_commands() {
        let cmd: EngineCommand =
            serde_json::from_str(r#"{"cmd":"set_target_setpoint","value":120.5}"#).unwrap();
        assert_eq!(cmd, EngineCommand::SetTargetSetpoint { value: 120.5 });

        let cmd: EngineCommand = serde_json::from_str(
            r#"{"cmd":"connect","kind":"controller","model":"Test Controller"}"#,
        )
        .unwrap();
        assert_eq!(
            cmd,
            EngineCommand::Connect {
                kind: DeviceKind::Controller,
                model: "Test Controller".to_string(),
                port: None,
                baud: None
            }
        );

        let cmd: EngineCommand =
            serde_json::from_str(r#"{"cmd":"set_pid_parameter","parameter":"GS","value":1}"#)
                .unwrap();
        assert_eq!(
            cmd,
            EngineCommand::SetPidParameter {
                parameter: PidParameter::GainScheduling,
                value: 1.0
            }
        );
    }

    #[test]
    fn test_parse_program() {
        let cmd: EngineCommand = serde_json::from_str(
            r#"{"cmd":"start_program","segments":[{"rate":5,"setpoint":100,"hold":-1}]}"#,
        )
        .unwrap();
        match cmd {
            EngineCommand::StartProgram { segments } => {
                assert_eq!(segments.len(), 1);
                assert!(segments[0].is_indefinite());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_required_device() {
        assert_eq!(
            EngineCommand::SetRate { value: 1.0 }.required_device(),
            Some(DeviceKind::Controller)
        );
        assert_eq!(EngineCommand::StartLog.required_device(), None);
        assert_eq!(EngineCommand::StopProgram.required_device(), None);
        assert_eq!(
            EngineCommand::Calibrate.required_device(),
            Some(DeviceKind::Controller)
        );
    }

    #[test]
    fn test_parse_heater_config() {
        let cmd: EngineCommand = serde_json::from_str(
            r#"{"cmd":"set_heater_config","config":{"cold_resistance":0.55,"max_voltage":12,"max_current":8,"min_output":5}}"#,
        )
        .unwrap();
        assert_eq!(
            cmd,
            EngineCommand::SetHeaterConfig {
                config: HeaterConfig {
                    cold_resistance: 0.55,
                    max_voltage: 12.0,
                    max_current: 8.0,
                    min_output: 5.0,
                }
            }
        );
    }
}

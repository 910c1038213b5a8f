// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Configuration file support for elchi-server.
//!
//! Config is loaded from the `[elchi-server]` section of `elchi.toml`.
//! Default search order:
//! 1. Path specified via `--config` CLI argument
//! 2. `./elchi.toml`
//! 3. `~/.config/elchi/elchi.toml`
//! 4. `/etc/elchi/elchi.toml`

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use elchi_app::ConfigFile;
use elchi_backend::HeaterSettings;
use elchi_core::control::{Program, ProgramSegment};
use elchi_core::Quantity;

use crate::session_log::DEFAULT_MAX_SAMPLES;

fn default_log_dir() -> String {
    if let Some(data_dir) = dirs::data_dir() {
        return data_dir
            .join("elchi")
            .join("logs")
            .to_string_lossy()
            .to_string();
    }
    "logs".to_string()
}

/// Top-level server configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// General settings
    pub general: GeneralConfig,
    /// Controller to connect on startup
    pub controller: DeviceConfig,
    /// Sensor to connect on startup
    pub sensor: DeviceConfig,
    /// Timers, worker pool and link recovery
    pub behavior: BehaviorConfig,
    /// Resistive heater parameters
    pub heater: HeaterSettings,
    /// TCP listener configuration
    pub listen: ListenConfig,
    /// Setpoint program started on launch
    pub program: ProgramConfig,
    /// Session log
    pub log: LogConfig,
}

/// General application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log level (trace, debug, info, warn, error)
    pub log_level: Option<String>,
    /// Measured quantity used when no controller is bound (Temperature, Voltage)
    pub units: Quantity,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: None,
            units: Quantity::Temperature,
        }
    }
}

/// A device bound at startup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Registered model name (e.g. "Resistive Heater Tenma", "Thermolino")
    pub model: Option<String>,
    /// Serial port path
    pub port: Option<String>,
    /// Baud rate; the model's default when omitted
    pub baud: Option<u32>,
}

/// Engine timing and recovery behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BehaviorConfig {
    /// Status refresh interval in milliseconds
    pub status_interval_ms: u64,
    /// Program tick interval in milliseconds
    pub program_interval_ms: u64,
    /// Sensor to controller transfer interval in external PV mode
    pub external_pv_interval_ms: u64,
    /// Maximum number of device calls running at once
    pub pool_size: usize,
    /// Consecutive transport failures before a reconnect (0 disables)
    pub reconnect_threshold: u32,
    /// Pause after closing a failing link in milliseconds
    pub close_wait_ms: u64,
    /// Pause after reopening a link in milliseconds
    pub reopen_wait_ms: u64,
    /// External PV watchdog timeout in milliseconds
    pub watchdog_timeout_ms: u64,
}

impl Default for BehaviorConfig {
    fn default() -> Self {
        Self {
            status_interval_ms: 1000,
            program_interval_ms: 1000,
            external_pv_interval_ms: 1000,
            pool_size: 4,
            reconnect_threshold: 5,
            close_wait_ms: 3000,
            reopen_wait_ms: 3000,
            watchdog_timeout_ms: 2000,
        }
    }
}

impl BehaviorConfig {
    pub fn status_interval(&self) -> Duration {
        Duration::from_millis(self.status_interval_ms)
    }

    pub fn program_interval(&self) -> Duration {
        Duration::from_millis(self.program_interval_ms)
    }

    pub fn external_pv_interval(&self) -> Duration {
        Duration::from_millis(self.external_pv_interval_ms)
    }

    pub fn watchdog_timeout(&self) -> Duration {
        Duration::from_millis(self.watchdog_timeout_ms)
    }
}

/// JSON-lines TCP listener.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenConfig {
    /// Whether the listener is enabled
    pub enabled: bool,
    /// IP address to listen on
    pub listen: IpAddr,
    /// TCP port to listen on
    pub port: u16,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen: IpAddr::V4(std::net::Ipv4Addr::LOCALHOST),
            port: 4540,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgramConfig {
    /// Start the program once the controller is connected
    pub autostart: bool,
    /// Ramp/hold segments, `hold = -1` holds indefinitely
    pub segments: Vec<ProgramSegment>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Start logging on launch
    pub autostart: bool,
    /// Directory for exported CSV files
    pub dir: String,
    /// File name used when an export names no file.
    /// `%YYYY%`, `%MM%`, `%DD%`, `%hh%`, `%mm%` and `%ss%` expand to UTC time.
    pub file: String,
    /// Samples kept per series; beyond this the oldest are dropped.
    pub max_samples: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            autostart: false,
            dir: default_log_dir(),
            file: "elchi-%YYYY%-%MM%-%DD%-%hh%%mm%%ss%.csv".to_string(),
            max_samples: DEFAULT_MAX_SAMPLES,
        }
    }
}

impl LogConfig {
    /// Resolve an export target. Absolute paths are used as given.
    pub fn export_path(&self, requested: Option<&str>, now: chrono::DateTime<chrono::Utc>) -> PathBuf {
        let name = match requested.map(str::trim).filter(|p| !p.is_empty()) {
            Some(path) => path.to_string(),
            None => expand_file_template(&self.file, now),
        };
        let path = PathBuf::from(name);
        if path.is_absolute() {
            path
        } else {
            PathBuf::from(&self.dir).join(path)
        }
    }
}

fn expand_file_template(template: &str, now: chrono::DateTime<chrono::Utc>) -> String {
    template
        .replace("%YYYY%", &now.format("%Y").to_string())
        .replace("%MM%", &now.format("%m").to_string())
        .replace("%DD%", &now.format("%d").to_string())
        .replace("%hh%", &now.format("%H").to_string())
        .replace("%mm%", &now.format("%M").to_string())
        .replace("%ss%", &now.format("%S").to_string())
}

impl ServerConfig {
    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), String> {
        validate_log_level(self.general.log_level.as_deref())?;
        validate_device("[controller]", &self.controller)?;
        validate_device("[sensor]", &self.sensor)?;

        let behavior = &self.behavior;
        if behavior.status_interval_ms == 0 {
            return Err("[behavior].status_interval_ms must be > 0".to_string());
        }
        if behavior.program_interval_ms == 0 {
            return Err("[behavior].program_interval_ms must be > 0".to_string());
        }
        if behavior.external_pv_interval_ms == 0 {
            return Err("[behavior].external_pv_interval_ms must be > 0".to_string());
        }
        if behavior.pool_size == 0 {
            return Err("[behavior].pool_size must be > 0".to_string());
        }
        if behavior.watchdog_timeout_ms == 0 {
            return Err("[behavior].watchdog_timeout_ms must be > 0".to_string());
        }
        if behavior.watchdog_timeout_ms <= behavior.external_pv_interval_ms {
            return Err(
                "[behavior].watchdog_timeout_ms must exceed external_pv_interval_ms".to_string(),
            );
        }

        self.heater.validate()?;

        if self.listen.enabled && self.listen.port == 0 {
            return Err("[listen].port must be > 0 when listener is enabled".to_string());
        }

        if self.program.autostart {
            if self.controller.model.is_none() {
                return Err("[program].autostart requires [controller].model".to_string());
            }
            Program::new(self.program.segments.clone())
                .map_err(|e| format!("[program]: {}", e))?;
        }

        if self.log.file.trim().is_empty() {
            return Err("[log].file must not be empty".to_string());
        }
        if self.log.max_samples == 0 {
            return Err("[log].max_samples must be > 0".to_string());
        }
        Ok(())
    }

    /// Generate an example configuration wrapped under the `[elchi-server]`
    /// section header, suitable for use in a combined `elchi.toml` file.
    pub fn example_combined_toml() -> String {
        #[derive(serde::Serialize)]
        struct Wrapper {
            #[serde(rename = "elchi-server")]
            inner: ServerConfig,
        }
        let example = ServerConfig {
            general: GeneralConfig {
                log_level: Some("info".to_string()),
                units: Quantity::Temperature,
            },
            controller: DeviceConfig {
                model: Some("Resistive Heater Tenma".to_string()),
                port: Some("/dev/ttyUSB0".to_string()),
                baud: Some(9600),
            },
            sensor: DeviceConfig {
                model: Some("Thermolino".to_string()),
                port: Some("/dev/ttyACM0".to_string()),
                baud: None,
            },
            behavior: BehaviorConfig::default(),
            heater: HeaterSettings::default(),
            listen: ListenConfig::default(),
            program: ProgramConfig {
                autostart: false,
                segments: vec![
                    ProgramSegment::new(10.0, 300.0, 30.0),
                    ProgramSegment::new(5.0, 25.0, -1.0),
                ],
            },
            log: LogConfig::default(),
        };
        toml::to_string_pretty(&Wrapper { inner: example }).unwrap_or_default()
    }
}

fn validate_log_level(level: Option<&str>) -> Result<(), String> {
    if let Some(level) = level {
        match level {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => {
                return Err(format!(
                    "[general].log_level '{}' is invalid (expected one of: trace, debug, info, warn, error)",
                    level
                ))
            }
        }
    }
    Ok(())
}

fn validate_device(section: &str, device: &DeviceConfig) -> Result<(), String> {
    if device.model.as_deref().is_some_and(|m| m.trim().is_empty()) {
        return Err(format!("{}.model must not be empty", section));
    }
    if device.port.as_deref().is_some_and(|p| p.trim().is_empty()) {
        return Err(format!("{}.port must not be empty", section));
    }
    if device.baud == Some(0) {
        return Err(format!("{}.baud must be > 0", section));
    }
    if device.model.is_none() && (device.port.is_some() || device.baud.is_some()) {
        return Err(format!("{}.port and .baud need {}.model", section, section));
    }
    Ok(())
}

impl ConfigFile for ServerConfig {
    fn section_key() -> &'static str {
        "elchi-server"
    }
}

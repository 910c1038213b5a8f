// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

pub mod control;
pub mod device;
pub mod dispatch;
pub mod engine;

pub type DynResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

pub use device::response::{DeviceError, DeviceErrorKind, DeviceResult};
pub use device::{
    Calibration, ControlMode, Controller, Device, DeviceCapabilities, DeviceInfo, DeviceKind,
    HeaterConfig, PidParameter, Quantity, Sensor,
};
pub use engine::command::EngineCommand;
pub use engine::event::EngineEvent;

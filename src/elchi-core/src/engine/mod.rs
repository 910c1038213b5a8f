// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Messages exchanged with the engine task.

pub mod command;
pub mod event;

pub use command::EngineCommand;
pub use event::{ControllerSetting, EngineEvent, StatusParameter};

// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Instruments reached over a serial line with ASCII commands.

mod line;
mod tenma;
mod thermometer;

pub use line::{available_ports, open_port, LineLink, Port, DEFAULT_TIMEOUT};
pub use tenma::Tenma;
pub use thermometer::ScpiThermometer;

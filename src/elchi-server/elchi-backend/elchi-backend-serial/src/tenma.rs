// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

use std::time::Duration;

use tracing::debug;

use elchi_core::device::response::{DeviceError, DeviceResult};
use elchi_core::device::supply::PowerSupply;

use crate::line::{open_port, LineLink, DEFAULT_TIMEOUT};

const TERMINATOR: &[u8] = b"\r";

/// Tenma 72-series programmable supply, channel 5 addressing.
pub struct Tenma {
    link: Option<LineLink>,
    endpoint: Option<(String, u32)>,
    timeout: Duration,
}

impl Tenma {
    pub const DEFAULT_BAUD: u32 = 9600;

    pub fn open(path: &str, baud: u32) -> DeviceResult<Self> {
        let port = open_port(path, baud, DEFAULT_TIMEOUT)?;
        Ok(Self {
            link: Some(LineLink::new(format!("Tenma on {}", path), port)),
            endpoint: Some((path.to_string(), baud)),
            timeout: DEFAULT_TIMEOUT,
        })
    }

    /// Supply over an already open link. Cannot be reopened.
    pub fn with_link(link: LineLink) -> Self {
        Self {
            link: Some(link),
            endpoint: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    fn link(&mut self) -> DeviceResult<&mut LineLink> {
        self.link
            .as_mut()
            .ok_or_else(|| DeviceError::transport("Tenma port is closed"))
    }

    fn command(&mut self, command: &str) -> DeviceResult<()> {
        self.link()?.send(command, TERMINATOR)
    }

    fn query(&mut self, command: &str) -> DeviceResult<f64> {
        self.link()?.query_f64(command, TERMINATOR)
    }
}

impl PowerSupply for Tenma {
    fn set_voltage_limit(&mut self, volts: f64) -> DeviceResult<()> {
        self.command(&format!("VSET05:{:.3}", volts))
    }

    fn set_current_limit(&mut self, amps: f64) -> DeviceResult<()> {
        self.command(&format!("ISET05:{:.3}", amps))
    }

    fn voltage(&mut self) -> DeviceResult<f64> {
        self.query("VOUT05?")
    }

    fn current(&mut self) -> DeviceResult<f64> {
        self.query("IOUT05?")
    }

    fn set_output_enabled(&mut self, enabled: bool) -> DeviceResult<()> {
        self.command(if enabled { "OUT05:1" } else { "OUT05:0" })
    }

    fn close(&mut self) -> DeviceResult<()> {
        if self.link.take().is_some() {
            debug!("Tenma port closed");
        }
        Ok(())
    }

    fn reopen(&mut self) -> DeviceResult<()> {
        let (path, baud) = self
            .endpoint
            .clone()
            .ok_or_else(|| DeviceError::unsupported("reopen"))?;
        self.link = None;
        let port = open_port(&path, baud, self.timeout)?;
        self.link = Some(LineLink::new(format!("Tenma on {}", path), port));
        Ok(())
    }
}

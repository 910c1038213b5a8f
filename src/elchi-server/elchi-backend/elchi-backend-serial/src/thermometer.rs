// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

use std::time::Duration;

use tracing::info;

use elchi_core::device::guard::TransportGuard;
use elchi_core::device::response::{DeviceError, DeviceResult};
use elchi_core::device::{DeviceAccess, DeviceCapabilities, DeviceInfo, Quantity};
use elchi_core::{Device, Sensor};

use crate::line::{open_port, LineLink, DEFAULT_TIMEOUT};

const TERMINATOR: &[u8] = b"\n";
const SETTLE: Duration = Duration::from_secs(1);

/// Temperature readout answering `:read?` (Thermolino, Thermoplatino).
pub struct ScpiThermometer {
    info: DeviceInfo,
    link: TransportGuard<Option<LineLink>>,
    settle: Duration,
}

impl ScpiThermometer {
    pub const THERMOLINO_BAUD: u32 = 9600;
    pub const THERMOPLATINO_BAUD: u32 = 115_200;

    pub fn thermolino(path: &str, baud: Option<u32>) -> DeviceResult<Self> {
        Self::open("Thermolino", path, baud.unwrap_or(Self::THERMOLINO_BAUD))
    }

    pub fn thermoplatino(path: &str, baud: Option<u32>) -> DeviceResult<Self> {
        Self::open("Thermoplatino", path, baud.unwrap_or(Self::THERMOPLATINO_BAUD))
    }

    fn open(model: &str, path: &str, baud: u32) -> DeviceResult<Self> {
        let info = info(
            model,
            DeviceAccess::Serial {
                path: path.to_string(),
                baud,
            },
        );
        let link = connect(model, path, baud, SETTLE)?;
        Ok(Self {
            info,
            link: TransportGuard::new(model, Some(link)),
            settle: SETTLE,
        })
    }

    /// Thermometer over an already open link, skipping the settle delay.
    pub fn with_link(model: &str, mut link: LineLink) -> DeviceResult<Self> {
        select_temperature(&mut link)?;
        Ok(Self {
            info: info(model, DeviceAccess::Simulated),
            link: TransportGuard::new(model, Some(link)),
            settle: Duration::ZERO,
        })
    }
}

fn info(model: &str, access: DeviceAccess) -> DeviceInfo {
    DeviceInfo {
        manufacturer: "ElchWorks".to_string(),
        model: model.to_string(),
        quantity: Quantity::Temperature,
        capabilities: DeviceCapabilities {
            reconnect: matches!(access, DeviceAccess::Serial { .. }),
            ..DeviceCapabilities::default()
        },
        access,
    }
}

fn connect(model: &str, path: &str, baud: u32, settle: Duration) -> DeviceResult<LineLink> {
    let port = open_port(path, baud, DEFAULT_TIMEOUT)?;
    let mut link = LineLink::new(format!("{} on {}", model, path), port);
    std::thread::sleep(settle);
    select_temperature(&mut link)?;
    info!("{} opened on {} at {} baud", model, path, baud);
    Ok(link)
}

fn select_temperature(link: &mut LineLink) -> DeviceResult<()> {
    link.send(":FUNC 'TEMP'", TERMINATOR)
}

impl Device for ScpiThermometer {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn close(&self) -> DeviceResult<()> {
        self.link.with(|link| {
            link.take();
            Ok(())
        })
    }

    fn reopen(&self) -> DeviceResult<()> {
        let DeviceAccess::Serial { path, baud } = &self.info.access else {
            return Err(DeviceError::unsupported("reopen"));
        };
        self.link.with(|link| {
            link.take();
            *link = Some(connect(&self.info.model, path, *baud, self.settle)?);
            Ok(())
        })
    }
}

impl Sensor for ScpiThermometer {
    fn sensor_value(&self) -> DeviceResult<f64> {
        self.link.with(|link| match link.as_mut() {
            Some(link) => link.query_f64(":read?", TERMINATOR),
            None => Err(DeviceError::transport(format!(
                "{} port is closed",
                self.info.model
            ))),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::line::testing::ScriptedPort;
    use elchi_core::DeviceErrorKind;

    #[test]
    fn test_reads_temperature() {
        let port = ScriptedPort::default();
        // the mode selection line consumes the first queued answer slot
        port.answer("");
        port.answer("23.4\n");
        let link = LineLink::new("Thermolino", Box::new(port.clone()));
        let sensor = ScpiThermometer::with_link("Thermolino", link).unwrap();

        assert_eq!(sensor.sensor_value().unwrap(), 23.4);
        assert_eq!(port.written(), ":FUNC 'TEMP'\n:read?\n");
    }

    #[test]
    fn test_closed_sensor_fails() {
        let port = ScriptedPort::default();
        let link = LineLink::new("Thermolino", Box::new(port));
        let sensor = ScpiThermometer::with_link("Thermolino", link).unwrap();
        sensor.close().unwrap();
        sensor.close().unwrap();
        assert_eq!(
            sensor.sensor_value().unwrap_err().kind,
            DeviceErrorKind::Transport
        );
        assert_eq!(sensor.reopen().unwrap_err().kind, DeviceErrorKind::Unsupported);
    }
}

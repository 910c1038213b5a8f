// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

use std::io::{ErrorKind, Read, Write};
use std::time::Duration;

use tracing::debug;

use elchi_core::device::response::{DeviceError, DeviceResult};

/// Read timeout of every supported instrument.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(1500);

/// Byte stream an instrument talks over.
pub trait Port: Read + Write + Send {}

impl<T: Read + Write + Send> Port for T {}

/// Open a serial port for blocking line-oriented I/O.
pub fn open_port(path: &str, baud: u32, timeout: Duration) -> DeviceResult<Box<dyn Port>> {
    let port = tokio_serial::new(path, baud)
        .timeout(timeout)
        .open()
        .map_err(|e| DeviceError::transport(format!("{}: {}", path, e)))?;
    Ok(Box::new(port))
}

/// Names of the serial ports present on this machine.
pub fn available_ports() -> Vec<String> {
    match tokio_serial::available_ports() {
        Ok(ports) => {
            let mut names: Vec<String> = ports.into_iter().map(|p| p.port_name).collect();
            names.sort();
            names
        }
        Err(e) => {
            debug!("Serial port enumeration failed: {}", e);
            Vec::new()
        }
    }
}

/// Command/answer exchange over a byte stream.
pub struct LineLink {
    port: Box<dyn Port>,
    label: String,
}

impl LineLink {
    pub fn new(label: impl Into<String>, port: Box<dyn Port>) -> Self {
        Self {
            port,
            label: label.into(),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn send(&mut self, command: &str, terminator: &[u8]) -> DeviceResult<()> {
        self.port.write_all(command.as_bytes())?;
        self.port.write_all(terminator)?;
        self.port.flush()?;
        Ok(())
    }

    /// Read up to a newline. A timeout after some bytes arrived ends the
    /// line; a timeout with nothing read is a transport failure.
    pub fn read_line(&mut self) -> DeviceResult<String> {
        let mut buf = Vec::new();
        loop {
            let mut byte = [0u8; 1];
            match self.port.read(&mut byte) {
                Ok(0) => break,
                Ok(_) => {
                    if byte[0] == b'\n' {
                        break;
                    }
                    buf.push(byte[0]);
                }
                Err(e) if e.kind() == ErrorKind::TimedOut || e.kind() == ErrorKind::WouldBlock => {
                    break
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        if buf.is_empty() {
            return Err(DeviceError::transport(format!(
                "{}: no answer before timeout",
                self.label
            )));
        }
        Ok(String::from_utf8_lossy(&buf).trim_end().to_string())
    }

    pub fn query(&mut self, command: &str, terminator: &[u8]) -> DeviceResult<String> {
        self.send(command, terminator)?;
        self.read_line()
    }

    pub fn query_f64(&mut self, command: &str, terminator: &[u8]) -> DeviceResult<f64> {
        let answer = self.query(command, terminator)?;
        parse_reading(&self.label, command, &answer)
    }
}

fn parse_reading(label: &str, command: &str, answer: &str) -> DeviceResult<f64> {
    answer.trim().parse::<f64>().map_err(|_| {
        DeviceError::transport(format!(
            "{}: malformed answer {:?} to {}",
            label, answer, command
        ))
    })
}

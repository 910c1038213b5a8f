// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure class of a device operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceErrorKind {
    /// The link to the instrument failed: timeout, garbled reply, port gone.
    Transport,
    /// The device does not implement the requested optional operation.
    Unsupported,
    /// Anything else.
    Unexpected,
}

/// Error type returned by device operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
#[error("{message}")]
pub struct DeviceError {
    pub kind: DeviceErrorKind,
    pub message: String,
}

pub type DeviceResult<T> = Result<T, DeviceError>;

impl DeviceError {
    pub fn transport(message: impl Into<String>) -> Self {
        Self {
            kind: DeviceErrorKind::Transport,
            message: message.into(),
        }
    }

    pub fn unsupported(operation: &str) -> Self {
        Self {
            kind: DeviceErrorKind::Unsupported,
            message: format!("{} is not supported by this device", operation),
        }
    }

    pub fn unexpected(message: impl Into<String>) -> Self {
        Self {
            kind: DeviceErrorKind::Unexpected,
            message: message.into(),
        }
    }

    /// Transport failures may succeed on retry; the other kinds will not.
    pub fn is_transient(&self) -> bool {
        self.kind == DeviceErrorKind::Transport
    }
}

impl From<std::io::Error> for DeviceError {
    fn from(value: std::io::Error) -> Self {
        DeviceError::transport(value.to_string())
    }
}

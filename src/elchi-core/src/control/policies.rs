// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Recovery policies for unreliable device links.
//!
//! A policy decides when a run of transport failures on one command stream
//! warrants a forced reconnect. The dispatcher knows nothing about this;
//! whoever submits a recurring command keeps a [`FailureCounter`] per stream
//! and applies the policy to its outcomes.

use std::time::Duration;

use tracing::{info, warn};

use crate::device::response::{DeviceError, DeviceResult};
use crate::device::Device;

/// Policy for escalating link failures to a reconnect.
pub trait RecoveryPolicy: Send + Sync {
    /// Determine whether `consecutive` transport failures call for a
    /// reconnect.
    fn should_reconnect(&self, consecutive: u32, error: &DeviceError) -> bool;

    /// Pause after closing the transport.
    fn close_wait(&self) -> Duration;

    /// Pause after reopening, before traffic resumes.
    fn reopen_wait(&self) -> Duration;
}

/// Reconnect once a fixed number of consecutive transport failures is
/// reached.
#[derive(Debug, Clone)]
pub struct ReconnectAfter {
    threshold: u32,
    close_wait: Duration,
    reopen_wait: Duration,
}

impl ReconnectAfter {
    pub fn new(threshold: u32, close_wait: Duration, reopen_wait: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            close_wait,
            reopen_wait,
        }
    }

    /// Five failures, three seconds either side of the reopen.
    pub fn default_serial() -> Self {
        Self::new(5, Duration::from_secs(3), Duration::from_secs(3))
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }
}

impl Default for ReconnectAfter {
    fn default() -> Self {
        Self::default_serial()
    }
}

impl RecoveryPolicy for ReconnectAfter {
    fn should_reconnect(&self, consecutive: u32, error: &DeviceError) -> bool {
        error.is_transient() && consecutive >= self.threshold
    }

    fn close_wait(&self) -> Duration {
        self.close_wait
    }

    fn reopen_wait(&self) -> Duration {
        self.reopen_wait
    }
}

/// Never reconnect; failures are only reported.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverReconnect;

impl RecoveryPolicy for NeverReconnect {
    fn should_reconnect(&self, _consecutive: u32, _error: &DeviceError) -> bool {
        false
    }

    fn close_wait(&self) -> Duration {
        Duration::ZERO
    }

    fn reopen_wait(&self) -> Duration {
        Duration::ZERO
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryDecision {
    Continue,
    Reconnect,
}

/// Consecutive-failure tracker for one command stream.
#[derive(Debug, Clone, Default)]
pub struct FailureCounter {
    consecutive: u32,
    reconnects: u32,
}

impl FailureCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }

    pub fn reconnects(&self) -> u32 {
        self.reconnects
    }

    pub fn record_success(&mut self) {
        self.consecutive = 0;
    }

    /// Count a failure. When the policy asks for a reconnect the counter
    /// resets so one run of failures triggers exactly one cycle.
    pub fn record_failure(
        &mut self,
        policy: &dyn RecoveryPolicy,
        error: &DeviceError,
    ) -> RecoveryDecision {
        if !error.is_transient() {
            self.consecutive = 0;
            return RecoveryDecision::Continue;
        }
        self.consecutive += 1;
        if policy.should_reconnect(self.consecutive, error) {
            self.consecutive = 0;
            self.reconnects += 1;
            RecoveryDecision::Reconnect
        } else {
            RecoveryDecision::Continue
        }
    }
}

/// Close, wait, reopen, wait. Blocks; run it on a worker.
pub fn run_reconnect_cycle<D>(device: &D, policy: &dyn RecoveryPolicy) -> DeviceResult<()>
where
    D: Device + ?Sized,
{
    let model = device.info().model.clone();
    warn!("{}: reconnecting after repeated link failures", model);
    if let Err(e) = device.close() {
        warn!("{}: close before reconnect failed: {}", model, e);
    }
    std::thread::sleep(policy.close_wait());
    device.reopen()?;
    std::thread::sleep(policy.reopen_wait());
    info!("{}: link reopened", model);
    Ok(())
}

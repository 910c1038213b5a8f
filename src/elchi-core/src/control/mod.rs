// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Control components.
//!
//! Pure, non-blocking building blocks driven by the engine and by software
//! controllers: the time-gated PID, the rate-limited setpoint tracker, the
//! ramp/hold programmer, the external-PV watchdog, link recovery
//! policies and the line fit used for heater calibration.

pub mod fit;
pub mod pid;
pub mod policies;
pub mod programmer;
pub mod ramp;
pub mod watchdog;

pub use fit::{linear_fit, LinearFit};
pub use pid::{PidError, PidTuning, SoftwarePid};
pub use policies::{
    run_reconnect_cycle, FailureCounter, NeverReconnect, ReconnectAfter, RecoveryDecision,
    RecoveryPolicy,
};
pub use programmer::{
    Program, ProgramAction, ProgramError, ProgramPhase, ProgramSegment, SetpointProgrammer,
};
pub use ramp::SetpointTracker;
pub use watchdog::Watchdog;

// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Ramp/hold setpoint programmer.
//!
//! The programmer never talks to a device. It is fed working-setpoint
//! readings that the engine already polls for status, is ticked by a timer,
//! and answers every event with the list of [`ProgramAction`]s the engine
//! has to carry out.

use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::device::ControlMode;

/// Distance below which a ramp counts as having reached its setpoint.
pub const SETPOINT_TOLERANCE: f64 = 0.1;

/// Hold duration meaning "hold until skipped or stopped".
pub const INDEFINITE_HOLD: f64 = -1.0;

/// Longest finite hold, about ten years.
pub const MAX_HOLD_MINUTES: f64 = 5_256_000.0;

/// One ramp-then-hold step.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProgramSegment {
    /// Units per minute.
    pub rate: f64,
    pub setpoint: f64,
    /// Minutes; `-1` holds indefinitely.
    #[serde(alias = "hold")]
    pub hold_minutes: f64,
}

impl ProgramSegment {
    pub fn new(rate: f64, setpoint: f64, hold_minutes: f64) -> Self {
        Self {
            rate,
            setpoint,
            hold_minutes,
        }
    }

    pub fn is_indefinite(&self) -> bool {
        self.hold_minutes == INDEFINITE_HOLD
    }

    fn hold_duration(&self) -> Option<Duration> {
        if self.is_indefinite() {
            None
        } else {
            Duration::try_from_secs_f64(self.hold_minutes * 60.0).ok()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProgramError {
    #[error("program has no segments")]
    Empty,
    #[error("segment {0}: rate must be a finite, non-negative number")]
    Rate(usize),
    #[error("segment {0}: setpoint must be finite")]
    Setpoint(usize),
    #[error("segment {0}: hold must be >= 0 minutes or -1 for indefinite")]
    Hold(usize),
    #[error("segment {0}: hold must not exceed 5256000 minutes")]
    HoldTooLong(usize),
}

/// Ordered, 1-indexed sequence of segments. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Program {
    segments: Vec<ProgramSegment>,
}

impl Program {
    pub fn new(segments: Vec<ProgramSegment>) -> Result<Self, ProgramError> {
        if segments.is_empty() {
            return Err(ProgramError::Empty);
        }
        for (idx, seg) in segments.iter().enumerate() {
            let number = idx + 1;
            if !seg.rate.is_finite() || seg.rate < 0.0 {
                return Err(ProgramError::Rate(number));
            }
            if !seg.setpoint.is_finite() {
                return Err(ProgramError::Setpoint(number));
            }
            if !seg.is_indefinite() && !(seg.hold_minutes.is_finite() && seg.hold_minutes >= 0.0)
            {
                return Err(ProgramError::Hold(number));
            }
            if seg.hold_minutes > MAX_HOLD_MINUTES {
                return Err(ProgramError::HoldTooLong(number));
            }
        }
        Ok(Self { segments })
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Segment by 1-based number.
    pub fn segment(&self, number: usize) -> Option<&ProgramSegment> {
        number.checked_sub(1).and_then(|idx| self.segments.get(idx))
    }

    pub fn segments(&self) -> &[ProgramSegment] {
        &self.segments
    }
}

/// Programmer phase. Segment numbers are 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum ProgramPhase {
    #[default]
    Idle,
    Ramping {
        segment: usize,
    },
    Holding {
        segment: usize,
        /// `None` for an indefinite hold.
        deadline: Option<Instant>,
    },
    /// Last segment's hold ran out or was skipped.
    Finished,
    Stopped,
}

impl ProgramPhase {
    pub fn is_running(&self) -> bool {
        matches!(
            self,
            ProgramPhase::Ramping { .. } | ProgramPhase::Holding { .. }
        )
    }

    pub fn segment(&self) -> Option<usize> {
        match self {
            ProgramPhase::Ramping { segment } | ProgramPhase::Holding { segment, .. } => {
                Some(*segment)
            }
            _ => None,
        }
    }
}

impl fmt::Display for ProgramPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProgramPhase::Idle => write!(f, "Idle"),
            ProgramPhase::Ramping { segment } => write!(f, "Ramping({})", segment),
            ProgramPhase::Holding { segment, .. } => write!(f, "Holding({})", segment),
            ProgramPhase::Finished => write!(f, "Finished"),
            ProgramPhase::Stopped => write!(f, "Stopped"),
        }
    }
}

/// Inputs to the programmer.
#[derive(Debug, Clone, Copy)]
pub enum ProgramEvent {
    Start,
    /// Latest working setpoint reported by the controller.
    WorkingSetpoint(f64),
    Tick(Instant),
    Skip,
    Stop,
}

/// Work the engine must carry out in response to an event.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProgramAction {
    SetControlMode(ControlMode),
    SetRate(f64),
    SetTargetSetpoint(f64),
    RampStarted(usize),
    HoldStarted(usize),
    Finished,
}

#[derive(Debug, Clone)]
pub struct SetpointProgrammer {
    program: Program,
    phase: ProgramPhase,
    working_setpoint: Option<f64>,
    transition_count: u64,
}

impl SetpointProgrammer {
    pub fn new(program: Program) -> Self {
        Self {
            program,
            phase: ProgramPhase::Idle,
            working_setpoint: None,
            transition_count: 0,
        }
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    pub fn phase(&self) -> ProgramPhase {
        self.phase
    }

    pub fn transition_count(&self) -> u64 {
        self.transition_count
    }

    pub fn start(&mut self) -> Vec<ProgramAction> {
        self.process_event(ProgramEvent::Start)
    }

    pub fn tick(&mut self, now: Instant) -> Vec<ProgramAction> {
        self.process_event(ProgramEvent::Tick(now))
    }

    pub fn observe_working_setpoint(&mut self, value: f64) {
        self.process_event(ProgramEvent::WorkingSetpoint(value));
    }

    pub fn skip(&mut self) -> Vec<ProgramAction> {
        self.process_event(ProgramEvent::Skip)
    }

    pub fn stop(&mut self) {
        self.process_event(ProgramEvent::Stop);
    }

    /// Process an event and return the resulting actions.
    pub fn process_event(&mut self, event: ProgramEvent) -> Vec<ProgramAction> {
        let mut actions = Vec::new();
        let next = match (self.phase, event) {
            (_, ProgramEvent::WorkingSetpoint(value)) => {
                self.working_setpoint = Some(value);
                None
            }

            (ProgramPhase::Idle, ProgramEvent::Start) => {
                actions.push(ProgramAction::SetControlMode(ControlMode::Automatic));
                Some(self.enter_ramp(1, &mut actions))
            }

            (ProgramPhase::Ramping { segment }, ProgramEvent::Tick(now)) => {
                let reached = match (self.working_setpoint, self.program.segment(segment)) {
                    (Some(wsp), Some(seg)) => (wsp - seg.setpoint).abs() < SETPOINT_TOLERANCE,
                    _ => false,
                };
                reached.then(|| self.enter_hold(segment, now, &mut actions))
            }

            (ProgramPhase::Holding { segment, deadline }, ProgramEvent::Tick(now)) => {
                match deadline {
                    Some(deadline) if now > deadline => Some(self.advance(segment, &mut actions)),
                    _ => None,
                }
            }

            (phase, ProgramEvent::Skip) if phase.is_running() => {
                let segment = phase.segment().unwrap_or(0);
                Some(self.advance(segment, &mut actions))
            }

            (ProgramPhase::Stopped, ProgramEvent::Stop) => None,
            (_, ProgramEvent::Stop) => Some(ProgramPhase::Stopped),

            _ => None,
        };

        if let Some(phase) = next {
            self.phase = phase;
            self.transition_count += 1;
        }
        actions
    }

    fn enter_ramp(&self, segment: usize, actions: &mut Vec<ProgramAction>) -> ProgramPhase {
        match self.program.segment(segment) {
            Some(seg) => {
                actions.push(ProgramAction::SetRate(seg.rate));
                actions.push(ProgramAction::SetTargetSetpoint(seg.setpoint));
                actions.push(ProgramAction::RampStarted(segment));
                ProgramPhase::Ramping { segment }
            }
            None => {
                actions.push(ProgramAction::Finished);
                ProgramPhase::Finished
            }
        }
    }

    fn enter_hold(
        &self,
        segment: usize,
        now: Instant,
        actions: &mut Vec<ProgramAction>,
    ) -> ProgramPhase {
        let deadline = self
            .program
            .segment(segment)
            .and_then(|seg| seg.hold_duration())
            .and_then(|hold| now.checked_add(hold));
        actions.push(ProgramAction::HoldStarted(segment));
        ProgramPhase::Holding { segment, deadline }
    }

    fn advance(&self, segment: usize, actions: &mut Vec<ProgramAction>) -> ProgramPhase {
        self.enter_ramp(segment + 1, actions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn program(segments: &[(f64, f64, f64)]) -> Program {
        Program::new(
            segments
                .iter()
                .map(|&(rate, sp, hold)| ProgramSegment::new(rate, sp, hold))
                .collect(),
        )
        .unwrap()
    }

    fn minutes(n: u64) -> Duration {
        Duration::from_secs(60 * n)
    }

    #[test]
    fn test_start_enters_first_ramp() {
        let mut prog = SetpointProgrammer::new(program(&[(5.0, 100.0, -1.0)]));
        let actions = prog.start();
        assert_eq!(
            actions,
            vec![
                ProgramAction::SetControlMode(ControlMode::Automatic),
                ProgramAction::SetRate(5.0),
                ProgramAction::SetTargetSetpoint(100.0),
                ProgramAction::RampStarted(1),
            ]
        );
        assert_eq!(prog.phase(), ProgramPhase::Ramping { segment: 1 });
    }

    #[test]
    fn test_indefinite_hold_never_advances() {
        let t0 = Instant::now();
        let mut prog = SetpointProgrammer::new(program(&[(5.0, 100.0, -1.0)]));
        prog.start();

        prog.observe_working_setpoint(60.0);
        assert!(prog.tick(t0).is_empty());
        assert_eq!(prog.phase(), ProgramPhase::Ramping { segment: 1 });

        prog.observe_working_setpoint(99.95);
        assert_eq!(prog.tick(t0), vec![ProgramAction::HoldStarted(1)]);
        assert_eq!(
            prog.phase(),
            ProgramPhase::Holding {
                segment: 1,
                deadline: None
            }
        );

        for h in 1..48u64 {
            assert!(prog.tick(t0 + minutes(60 * h)).is_empty());
        }
        assert!(matches!(prog.phase(), ProgramPhase::Holding { segment: 1, .. }));
    }

    #[test]
    fn test_timed_hold_advances_to_next_segment() {
        let t0 = Instant::now();
        let mut prog = SetpointProgrammer::new(program(&[(5.0, 100.0, 2.0), (10.0, 200.0, 0.0)]));
        prog.start();
        prog.observe_working_setpoint(100.0);
        prog.tick(t0);
        assert!(matches!(prog.phase(), ProgramPhase::Holding { segment: 1, deadline: Some(_) }));

        assert!(prog.tick(t0 + minutes(1)).is_empty());
        assert!(prog.tick(t0 + minutes(2)).is_empty());

        let actions = prog.tick(t0 + minutes(2) + Duration::from_secs(1));
        assert_eq!(
            actions,
            vec![
                ProgramAction::SetRate(10.0),
                ProgramAction::SetTargetSetpoint(200.0),
                ProgramAction::RampStarted(2),
            ]
        );
        assert_eq!(prog.phase(), ProgramPhase::Ramping { segment: 2 });
    }

    #[test]
    fn test_last_segment_finishes() {
        let t0 = Instant::now();
        let mut prog = SetpointProgrammer::new(program(&[(5.0, 100.0, 2.0)]));
        prog.start();
        prog.observe_working_setpoint(100.0);
        prog.tick(t0);

        let actions = prog.tick(t0 + minutes(3));
        assert_eq!(actions, vec![ProgramAction::Finished]);
        assert_eq!(prog.phase(), ProgramPhase::Finished);

        assert!(prog.tick(t0 + minutes(10)).is_empty());
        assert!(prog.skip().is_empty());
    }

    #[test]
    fn test_skip_during_hold_ramps_next_segment() {
        let t0 = Instant::now();
        let mut prog = SetpointProgrammer::new(program(&[
            (5.0, 100.0, 0.0),
            (5.0, 150.0, -1.0),
            (20.0, 25.0, 0.0),
        ]));
        prog.start();
        prog.observe_working_setpoint(100.0);
        prog.tick(t0);
        prog.tick(t0 + Duration::from_secs(1));
        assert_eq!(prog.phase(), ProgramPhase::Ramping { segment: 2 });
        prog.observe_working_setpoint(150.0);
        prog.tick(t0 + Duration::from_secs(2));
        assert!(matches!(prog.phase(), ProgramPhase::Holding { segment: 2, .. }));

        let actions = prog.skip();
        assert_eq!(
            actions,
            vec![
                ProgramAction::SetRate(20.0),
                ProgramAction::SetTargetSetpoint(25.0),
                ProgramAction::RampStarted(3),
            ]
        );
        assert_eq!(prog.phase(), ProgramPhase::Ramping { segment: 3 });
    }

    #[test]
    fn test_skip_while_ramping() {
        let mut prog = SetpointProgrammer::new(program(&[(5.0, 100.0, 1.0), (5.0, 50.0, 1.0)]));
        prog.start();
        let actions = prog.skip();
        assert!(actions.contains(&ProgramAction::RampStarted(2)));
        assert_eq!(prog.phase(), ProgramPhase::Ramping { segment: 2 });
    }

    #[test]
    fn test_stop_ends_processing() {
        let t0 = Instant::now();
        let mut prog = SetpointProgrammer::new(program(&[(5.0, 100.0, 1.0)]));
        prog.start();
        prog.stop();
        assert_eq!(prog.phase(), ProgramPhase::Stopped);

        prog.observe_working_setpoint(100.0);
        assert!(prog.tick(t0).is_empty());
        assert!(prog.skip().is_empty());
        assert!(prog.start().is_empty());
        assert_eq!(prog.phase(), ProgramPhase::Stopped);
    }

    #[test]
    fn test_tick_before_start_does_nothing() {
        let mut prog = SetpointProgrammer::new(program(&[(5.0, 100.0, 1.0)]));
        prog.observe_working_setpoint(100.0);
        assert!(prog.tick(Instant::now()).is_empty());
        assert_eq!(prog.phase(), ProgramPhase::Idle);
        assert_eq!(prog.transition_count(), 0);
    }

    #[test]
    fn test_program_validation() {
        assert_eq!(Program::new(vec![]).unwrap_err(), ProgramError::Empty);
        assert_eq!(
            Program::new(vec![
                ProgramSegment::new(5.0, 100.0, 1.0),
                ProgramSegment::new(5.0, 100.0, -3.0)
            ])
            .unwrap_err(),
            ProgramError::Hold(2)
        );
        assert_eq!(
            Program::new(vec![ProgramSegment::new(f64::NAN, 100.0, 1.0)]).unwrap_err(),
            ProgramError::Rate(1)
        );
    }

    #[test]
    fn test_huge_hold_is_rejected() {
        assert_eq!(
            Program::new(vec![ProgramSegment::new(5.0, 25.0, 1e18)]).unwrap_err(),
            ProgramError::HoldTooLong(1)
        );
    }

    #[test]
    fn test_longest_hold_starts_without_overflow() {
        let t0 = Instant::now();
        let mut prog = SetpointProgrammer::new(program(&[(5.0, 25.0, MAX_HOLD_MINUTES)]));
        prog.start();
        prog.observe_working_setpoint(25.0);
        assert_eq!(prog.tick(t0), vec![ProgramAction::HoldStarted(1)]);
        assert!(matches!(prog.phase(), ProgramPhase::Holding { segment: 1, .. }));
        assert!(prog.tick(t0 + minutes(60)).is_empty());
    }

    #[test]
    fn test_segment_parses_hold_alias() {
        let seg: ProgramSegment =
            serde_json::from_str(r#"{"rate": 5, "setpoint": 100, "hold": -1}"#).unwrap();
        assert!(seg.is_indefinite());
    }
}

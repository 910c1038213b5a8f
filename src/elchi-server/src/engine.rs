// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Engine task.
//!
//! A single task owns the bound devices, the setpoint programmer, the
//! external-PV watchdog and the session log. It reacts to client commands,
//! its own timers and the results of device calls, which all run through
//! one [`Dispatcher`]. Everything it has to say goes out as [`EngineEvent`]s.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use elchi_backend::{Connection, RegistrationContext};
use elchi_core::control::{
    run_reconnect_cycle, FailureCounter, NeverReconnect, Program, ProgramAction, ProgramSegment,
    ReconnectAfter, RecoveryDecision, RecoveryPolicy, SetpointProgrammer, Watchdog,
};
use elchi_core::dispatch::{DeviceId, Dispatched, Dispatcher, Task, TaskHandle, TaskOutcome};
use elchi_core::engine::{ControllerSetting, StatusParameter};
use elchi_core::{
    Calibration, ControlMode, Controller, Device, DeviceError, DeviceErrorKind, DeviceInfo,
    DeviceKind, DeviceResult, DynResult, EngineCommand, EngineEvent, HeaterConfig, PidParameter,
    Quantity, Sensor,
};

use crate::config::{BehaviorConfig, LogConfig};
use crate::session_log::{self, Series, SessionLog};

pub const EXTERNAL_PV_ACTIVATED: &str = "External PV mode activated!";
pub const EXTERNAL_PV_DEACTIVATED: &str = "External PV mode deactivated!";
pub const EXTERNAL_PV_NEEDS_DEVICES: &str =
    "Cannot set external PV mode without a controller and a sensor connected.";
pub const EXTERNAL_PV_TIMED_OUT: &str =
    "Did not receive PV value from sensor in time. Reverting to normal control mode!";
pub const CALIBRATING: &str = "Calibrating heater. Please wait...";

/// Everything the engine task needs to run.
pub struct EngineConfig {
    pub registry: Arc<RegistrationContext>,
    pub behavior: BehaviorConfig,
    /// Unit labels when no controller is bound.
    pub units: Quantity,
    pub log: LogConfig,
    /// Started once, as soon as the first controller is bound.
    pub startup_program: Option<Vec<ProgramSegment>>,
}

impl EngineConfig {
    fn recovery_policy(&self) -> Arc<dyn RecoveryPolicy> {
        let behavior = &self.behavior;
        if behavior.reconnect_threshold == 0 {
            Arc::new(NeverReconnect)
        } else {
            Arc::new(ReconnectAfter::new(
                behavior.reconnect_threshold,
                Duration::from_millis(behavior.close_wait_ms),
                Duration::from_millis(behavior.reopen_wait_ms),
            ))
        }
    }
}

/// Recurring device call whose failures are counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Stream {
    SensorValue,
    ProcessVariable,
    WorkingSetpoint,
    Power,
    ExternalRead,
    ExternalWrite,
}

impl Stream {
    fn label(self) -> &'static str {
        match self {
            Stream::SensorValue => "read sensor value",
            Stream::ProcessVariable => "read process variable",
            Stream::WorkingSetpoint => "read working setpoint",
            Stream::Power => "read output power",
            Stream::ExternalRead => "read external PV",
            Stream::ExternalWrite => "write external PV",
        }
    }
}

/// Single controller write. Several run back to back in one task when their
/// order matters.
#[derive(Debug, Clone, Copy, PartialEq)]
enum ControllerWrite {
    TargetSetpoint(f64),
    Rate(f64),
    ManualOutputPower(f64),
    ControlMode(ControlMode),
    Pid(PidParameter, f64),
    OutputEnabled(bool),
    AimingBeam(bool),
    ExternalPvMode(bool),
    ExternalPv(f64),
}

impl ControllerWrite {
    fn label(self) -> &'static str {
        match self {
            ControllerWrite::TargetSetpoint(_) => "set target setpoint",
            ControllerWrite::Rate(_) => "set rate",
            ControllerWrite::ManualOutputPower(_) => "set manual output power",
            ControllerWrite::ControlMode(_) => "set control mode",
            ControllerWrite::Pid(..) => "set PID parameter",
            ControllerWrite::OutputEnabled(_) => "set output enabled",
            ControllerWrite::AimingBeam(_) => "set aiming beam",
            ControllerWrite::ExternalPvMode(_) => "set external PV mode",
            ControllerWrite::ExternalPv(_) => "write external PV",
        }
    }

    fn apply(self, controller: &dyn Controller) -> DeviceResult<()> {
        match self {
            ControllerWrite::TargetSetpoint(v) => controller.set_target_setpoint(v),
            ControllerWrite::Rate(v) => controller.set_rate(v),
            ControllerWrite::ManualOutputPower(v) => controller.set_manual_output_power(v),
            ControllerWrite::ControlMode(mode) => controller.set_control_mode(mode),
            ControllerWrite::Pid(parameter, v) => controller.set_pid_parameter(parameter, v),
            ControllerWrite::OutputEnabled(on) => controller.set_output_enabled(on),
            ControllerWrite::AimingBeam(on) => controller.set_aiming_beam(on),
            ControllerWrite::ExternalPvMode(on) => controller.set_external_pv_mode(on),
            ControllerWrite::ExternalPv(v) => controller.write_external_pv(v),
        }
    }
}

#[derive(Clone)]
enum BoundDevice {
    Controller(Arc<dyn Controller>),
    Sensor(Arc<dyn Sensor>),
}

impl BoundDevice {
    fn info(&self) -> &DeviceInfo {
        match self {
            BoundDevice::Controller(c) => c.info(),
            BoundDevice::Sensor(s) => s.info(),
        }
    }

    fn close(&self) -> DeviceResult<()> {
        match self {
            BoundDevice::Controller(c) => c.close(),
            BoundDevice::Sensor(s) => s.close(),
        }
    }
}

/// Results of device calls, delivered back to the engine task.
enum Completion {
    Connected {
        model: String,
        outcome: TaskOutcome<BoundDevice>,
    },
    Closed {
        outcome: TaskOutcome<()>,
    },
    Reading {
        stream: Stream,
        outcome: TaskOutcome<f64>,
    },
    Setting {
        outcome: TaskOutcome<ControllerSetting>,
    },
    Pid {
        parameter: PidParameter,
        outcome: TaskOutcome<f64>,
    },
    HeaterConfig {
        outcome: TaskOutcome<HeaterConfig>,
    },
    Calibrated {
        outcome: TaskOutcome<Calibration>,
    },
    Written {
        writes: Vec<ControllerWrite>,
        stream: Option<Stream>,
        outcome: TaskOutcome<()>,
    },
    Reconnected {
        outcome: TaskOutcome<()>,
    },
}

struct Slot<D: ?Sized> {
    id: DeviceId,
    device: Arc<D>,
    reconnecting: bool,
    failures: HashMap<Stream, FailureCounter>,
}

impl<D: Device + ?Sized + 'static> Slot<D> {
    fn new(id: DeviceId, device: Arc<D>) -> Self {
        Self {
            id,
            device,
            reconnecting: false,
            failures: HashMap::new(),
        }
    }

    /// Usable for new traffic.
    fn ready(&self) -> Option<(DeviceId, Arc<D>)> {
        (!self.reconnecting).then(|| (self.id, Arc::clone(&self.device)))
    }

    fn begin_reconnect(&mut self, policy: Arc<dyn RecoveryPolicy>) -> Option<Task<()>> {
        if self.reconnecting {
            return None;
        }
        let info = self.device.info();
        if !info.capabilities.reconnect {
            warn!(
                "{}: link keeps failing and the device cannot reconnect",
                info.model
            );
            return None;
        }
        self.reconnecting = true;
        let device = Arc::clone(&self.device);
        Some(Task::new(self.id, "reconnect", move || {
            run_reconnect_cycle(device.as_ref(), policy.as_ref())
        }))
    }
}

struct Engine {
    registry: Arc<RegistrationContext>,
    units: Quantity,
    log_config: LogConfig,
    policy: Arc<dyn RecoveryPolicy>,
    dispatcher: Dispatcher<Completion>,
    events: broadcast::Sender<EngineEvent>,
    next_generation: u64,
    connecting: HashMap<DeviceKind, u64>,
    controller: Option<Slot<dyn Controller>>,
    sensor: Option<Slot<dyn Sensor>>,
    in_flight: HashSet<(Stream, u64)>,
    programmer: Option<SetpointProgrammer>,
    startup_program: Option<Vec<ProgramSegment>>,
    external_pv_mode: bool,
    watchdog: Watchdog,
    log: SessionLog,
}

impl Engine {
    fn new(
        config: EngineConfig,
        events: broadcast::Sender<EngineEvent>,
    ) -> (Self, mpsc::UnboundedReceiver<Dispatched<Completion>>) {
        let (dispatcher, completions) = Dispatcher::new(config.behavior.pool_size);
        let mut log = SessionLog::with_limit(config.log.max_samples);
        if config.log.autostart {
            log.start(Utc::now());
        }
        let engine = Self {
            policy: config.recovery_policy(),
            registry: config.registry,
            units: config.units,
            log_config: config.log,
            dispatcher,
            events,
            next_generation: 0,
            connecting: HashMap::new(),
            controller: None,
            sensor: None,
            in_flight: HashSet::new(),
            programmer: None,
            startup_program: config.startup_program,
            external_pv_mode: false,
            watchdog: Watchdog::new(config.behavior.watchdog_timeout()),
            log,
        };
        (engine, completions)
    }

    fn emit(&self, event: EngineEvent) {
        let _ = self.events.send(event);
    }

    fn is_bound(&self, kind: DeviceKind) -> bool {
        match kind {
            DeviceKind::Controller => self.controller.is_some(),
            DeviceKind::Sensor => self.sensor.is_some(),
        }
    }

    fn is_current(&self, id: DeviceId) -> bool {
        match id.kind {
            DeviceKind::Controller => self.controller.as_ref().is_some_and(|s| s.id == id),
            DeviceKind::Sensor => self.sensor.as_ref().is_some_and(|s| s.id == id),
        }
    }

    fn ready_controller(&self) -> Option<(DeviceId, Arc<dyn Controller>)> {
        self.controller.as_ref().and_then(Slot::ready)
    }

    fn ready_sensor(&self) -> Option<(DeviceId, Arc<dyn Sensor>)> {
        self.sensor.as_ref().and_then(Slot::ready)
    }

    fn handle_command(&mut self, cmd: EngineCommand) {
        if let Some(kind) = cmd.required_device() {
            if !self.is_bound(kind) {
                self.emit(EngineEvent::error(format!("No {} connected.", kind)));
                return;
            }
        }

        match cmd {
            EngineCommand::Connect {
                kind,
                model,
                port,
                baud,
            } => self.connect(kind, model, Connection { port, baud }),
            EngineCommand::Disconnect { kind } => self.disconnect(kind),
            EngineCommand::SetTargetSetpoint { value } => {
                self.submit_writes(vec![ControllerWrite::TargetSetpoint(value)], None)
            }
            EngineCommand::SetRate { value } => {
                self.submit_writes(vec![ControllerWrite::Rate(value)], None)
            }
            EngineCommand::SetManualOutputPower { value } => {
                self.submit_writes(vec![ControllerWrite::ManualOutputPower(value)], None)
            }
            EngineCommand::SetControlMode { mode } => {
                self.submit_writes(vec![ControllerWrite::ControlMode(mode)], None)
            }
            EngineCommand::SetPidParameter { parameter, value } => {
                self.submit_writes(vec![ControllerWrite::Pid(parameter, value)], None)
            }
            EngineCommand::RefreshParameters => self.refresh_parameters(),
            EngineCommand::RefreshPid => self.refresh_pid(),
            EngineCommand::RefreshHeaterConfig => self.refresh_heater_config(),
            EngineCommand::SetHeaterConfig { config } => self.set_heater_config(config),
            EngineCommand::Calibrate => self.calibrate(),
            EngineCommand::SetOutputEnabled { enabled } => {
                self.submit_writes(vec![ControllerWrite::OutputEnabled(enabled)], None)
            }
            EngineCommand::SetAimingBeam { enabled } => {
                self.submit_writes(vec![ControllerWrite::AimingBeam(enabled)], None)
            }
            EngineCommand::StartProgram { segments } => self.start_program(segments),
            EngineCommand::StopProgram => {
                if !self.stop_program() {
                    self.emit(EngineEvent::error("No program is running."));
                }
            }
            EngineCommand::SkipSegment => self.skip_segment(),
            EngineCommand::SetExternalPvMode { enabled } => self.set_external_pv_mode(enabled),
            EngineCommand::FeedExternalPv { value } => {
                if self.external_pv_mode {
                    self.submit_writes(vec![ControllerWrite::ExternalPv(value)], None);
                } else {
                    self.emit(EngineEvent::error("External PV mode is not active."));
                }
            }
            EngineCommand::StartLog => {
                info!("Logging started");
                self.log.start(Utc::now());
            }
            EngineCommand::StopLog => {
                info!("Logging stopped");
                self.log.stop();
            }
            EngineCommand::ClearLog => {
                info!("Log cleared");
                self.log.clear();
            }
            EngineCommand::ExportLog { path } => self.export_log(path.as_deref()),
            EngineCommand::ListDevices { kind, quantity } => {
                self.emit(EngineEvent::AvailableDevices {
                    kind,
                    models: self.registry.registered(kind, quantity),
                });
            }
            EngineCommand::ListPorts => self.list_ports(),
        }
    }

    fn handle_completion(&mut self, msg: Dispatched<Completion>) {
        let (device, message) = match msg {
            Dispatched::Outcome {
                device, message, ..
            } => (device, message),
            Dispatched::Finished { .. } => return,
        };

        match message {
            Completion::Connected { model, outcome } => self.on_connected(device, model, outcome),
            Completion::Closed { outcome } => {
                if let Err(e) = outcome.into_result() {
                    self.report(device.kind, &e);
                }
            }
            Completion::Reading { stream, outcome } => self.on_reading(device, stream, outcome),
            Completion::Setting { outcome } => {
                if !self.is_current(device) {
                    return;
                }
                match outcome.into_result() {
                    Ok(setting) => self.emit(EngineEvent::ControllerParameter { setting }),
                    Err(e) => self.on_failure(device, None, e),
                }
            }
            Completion::Pid { parameter, outcome } => {
                if !self.is_current(device) {
                    return;
                }
                match outcome.into_result() {
                    Ok(value) => self.emit(EngineEvent::PidParameter { parameter, value }),
                    Err(e) => self.on_failure(device, None, e),
                }
            }
            Completion::HeaterConfig { outcome } => {
                if !self.is_current(device) {
                    return;
                }
                match outcome.into_result() {
                    Ok(config) => self.emit(EngineEvent::HeaterConfig { config }),
                    Err(e) => self.on_failure(device, None, e),
                }
            }
            Completion::Calibrated { outcome } => {
                if !self.is_current(device) {
                    return;
                }
                match outcome.into_result() {
                    Ok(calibration) => {
                        info!("Calibration finished: {:.4} ohm", calibration.resistance);
                        self.emit(EngineEvent::CalibrationFinished { calibration })
                    }
                    Err(e) => self.on_failure(device, None, e),
                }
            }
            Completion::Written {
                writes,
                stream,
                outcome,
            } => self.on_written(device, writes, stream, outcome),
            Completion::Reconnected { outcome } => self.on_reconnected(device, outcome),
        }
    }

    fn connect(&mut self, kind: DeviceKind, model: String, connection: Connection) {
        if !self.registry.is_registered(kind, &model) {
            self.emit(EngineEvent::ConnectionFailed {
                kind,
                error: format!("Unknown {}: {}", kind, model),
                model,
            });
            return;
        }
        self.unbind(kind);

        self.next_generation += 1;
        let id = DeviceId {
            kind,
            generation: self.next_generation,
        };
        self.connecting.insert(kind, id.generation);
        info!("Connecting {} {}", kind, model);

        let registry = Arc::clone(&self.registry);
        let name = model.clone();
        let task = Task::new(id, "connect", move || {
            let built = match kind {
                DeviceKind::Controller => registry
                    .build_controller(&name, &connection)
                    .map(BoundDevice::Controller),
                DeviceKind::Sensor => registry
                    .build_sensor(&name, &connection)
                    .map(BoundDevice::Sensor),
            };
            built.map_err(|e| DeviceError::unexpected(e.to_string()))
        });
        self.dispatcher
            .submit(task, move |outcome| Completion::Connected { model, outcome });
    }

    fn on_connected(&mut self, id: DeviceId, model: String, outcome: TaskOutcome<BoundDevice>) {
        if self.connecting.get(&id.kind) != Some(&id.generation) {
            if let TaskOutcome::Success(device) = outcome {
                debug!("{} {} connected after it was cancelled", id.kind, model);
                self.close_detached(id, device);
            }
            return;
        }
        self.connecting.remove(&id.kind);

        match outcome.into_result() {
            Ok(BoundDevice::Controller(controller)) => {
                info!("Controller {} connected", model);
                let has_pid = !controller.info().capabilities.pid_parameters.is_empty();
                self.controller = Some(Slot::new(id, controller));
                self.emit(EngineEvent::Connected {
                    kind: DeviceKind::Controller,
                    model,
                });
                self.refresh_parameters();
                if has_pid {
                    self.refresh_pid();
                }
                if let Some(segments) = self.startup_program.take() {
                    self.start_program(segments);
                }
            }
            Ok(BoundDevice::Sensor(sensor)) => {
                info!("Sensor {} connected", model);
                self.sensor = Some(Slot::new(id, sensor));
                self.emit(EngineEvent::Connected {
                    kind: DeviceKind::Sensor,
                    model,
                });
            }
            Err(e) => {
                warn!("Connecting {} {} failed: {}", id.kind, model, e);
                self.emit(EngineEvent::ConnectionFailed {
                    kind: id.kind,
                    model,
                    error: e.message,
                });
            }
        }
    }

    fn disconnect(&mut self, kind: DeviceKind) {
        let cancelled = self.connecting.remove(&kind).is_some();
        if self.unbind(kind).is_none() {
            if cancelled {
                self.emit(EngineEvent::Disconnected { kind });
            } else {
                self.emit(EngineEvent::error(format!("No {} connected.", kind)));
            }
        }
    }

    /// Remove the bound device of `kind` and close it in the background.
    /// The slot is freed whether or not the close succeeds.
    fn unbind(&mut self, kind: DeviceKind) -> Option<TaskHandle> {
        let (id, device) = match kind {
            DeviceKind::Controller => self
                .controller
                .take()
                .map(|s| (s.id, BoundDevice::Controller(s.device)))?,
            DeviceKind::Sensor => self
                .sensor
                .take()
                .map(|s| (s.id, BoundDevice::Sensor(s.device)))?,
        };
        self.in_flight.retain(|(_, generation)| *generation != id.generation);

        if self.external_pv_mode {
            self.external_pv_mode = false;
            self.watchdog.disarm();
            if self.controller.is_some() {
                self.submit_writes(vec![ControllerWrite::ExternalPvMode(false)], None);
            } else {
                self.emit(EngineEvent::message(EXTERNAL_PV_DEACTIVATED));
            }
        }
        if kind == DeviceKind::Controller {
            self.stop_program();
        }

        info!("{} {} disconnected", kind, device.info().model);
        self.emit(EngineEvent::Disconnected { kind });
        Some(self.close_detached(id, device))
    }

    fn close_detached(&self, id: DeviceId, device: BoundDevice) -> TaskHandle {
        self.dispatcher.submit(Task::new(id, "close", move || device.close()), |outcome| {
            Completion::Closed { outcome }
        })
    }

    fn poll(
        &mut self,
        id: DeviceId,
        stream: Stream,
        op: impl FnOnce() -> DeviceResult<f64> + Send + 'static,
    ) {
        if !self.in_flight.insert((stream, id.generation)) {
            debug!("{} still in flight, skipping", stream.label());
            return;
        }
        self.dispatcher.submit(Task::new(id, stream.label(), op), move |outcome| {
            Completion::Reading { stream, outcome }
        });
    }

    fn poll_status(&mut self) {
        if let Some((id, sensor)) = self.ready_sensor() {
            self.poll(id, Stream::SensorValue, move || sensor.sensor_value());
        }
        if let Some((id, controller)) = self.ready_controller() {
            let c = Arc::clone(&controller);
            self.poll(id, Stream::ProcessVariable, move || c.process_variable());
            let c = Arc::clone(&controller);
            self.poll(id, Stream::WorkingSetpoint, move || c.working_setpoint());
            self.poll(id, Stream::Power, move || controller.working_output());
        }
    }

    fn on_reading(&mut self, id: DeviceId, stream: Stream, outcome: TaskOutcome<f64>) {
        self.in_flight.remove(&(stream, id.generation));
        if !self.is_current(id) {
            debug!("Ignoring {} from a replaced {}", stream.label(), id.kind);
            return;
        }
        match outcome.into_result() {
            Ok(value) => {
                self.record_success(id.kind, stream);
                self.on_value(stream, value);
            }
            Err(e) => self.on_failure(id, Some(stream), e),
        }
    }

    fn on_value(&mut self, stream: Stream, value: f64) {
        let now = Utc::now();
        let elapsed = self.log.elapsed(now);
        let parameter = match stream {
            Stream::SensorValue => {
                self.log.record(Series::SensorValue, value, now);
                self.emit(EngineEvent::SensorStatus { value, elapsed });
                return;
            }
            Stream::ExternalRead => {
                if self.external_pv_mode && self.controller.is_some() {
                    self.submit_writes(
                        vec![ControllerWrite::ExternalPv(value)],
                        Some(Stream::ExternalWrite),
                    );
                }
                return;
            }
            Stream::ExternalWrite => return,
            Stream::ProcessVariable => {
                self.log.record(Series::ControllerPv, value, now);
                StatusParameter::ProcessVariable
            }
            Stream::WorkingSetpoint => {
                self.log.record(Series::WorkingSetpoint, value, now);
                if let Some(programmer) = self.programmer.as_mut() {
                    programmer.observe_working_setpoint(value);
                }
                StatusParameter::WorkingSetpoint
            }
            Stream::Power => {
                self.log.record(Series::Power, value, now);
                StatusParameter::Power
            }
        };
        self.emit(EngineEvent::ControllerStatus {
            parameter,
            value,
            elapsed,
        });
    }

    fn failure_counter(&mut self, kind: DeviceKind, stream: Stream) -> Option<&mut FailureCounter> {
        match kind {
            DeviceKind::Controller => self
                .controller
                .as_mut()
                .map(|s| s.failures.entry(stream).or_default()),
            DeviceKind::Sensor => self
                .sensor
                .as_mut()
                .map(|s| s.failures.entry(stream).or_default()),
        }
    }

    fn record_success(&mut self, kind: DeviceKind, stream: Stream) {
        if let Some(counter) = self.failure_counter(kind, stream) {
            counter.record_success();
        }
    }

    fn report(&self, kind: DeviceKind, error: &DeviceError) {
        let event = match error.kind {
            DeviceErrorKind::Transport => {
                warn!("{} communication failed: {}", kind, error);
                EngineEvent::CommunicationFailed {
                    kind,
                    error: error.message.clone(),
                }
            }
            DeviceErrorKind::Unsupported => {
                debug!("{}: {}", kind, error);
                EngineEvent::NotSupported {
                    kind,
                    error: error.message.clone(),
                }
            }
            DeviceErrorKind::Unexpected => {
                error!("{} error: {}", kind, error);
                EngineEvent::error(error.message.clone())
            }
        };
        self.emit(event);
    }

    /// Report a failed call on a current device and, for counted streams,
    /// apply the recovery policy.
    fn on_failure(&mut self, id: DeviceId, stream: Option<Stream>, error: DeviceError) {
        self.report(id.kind, &error);
        let Some(stream) = stream else {
            return;
        };
        let policy = Arc::clone(&self.policy);
        let decision = match self.failure_counter(id.kind, stream) {
            Some(counter) => counter.record_failure(policy.as_ref(), &error),
            None => return,
        };
        if decision == RecoveryDecision::Reconnect {
            self.reconnect(id.kind);
        }
    }

    fn reconnect(&mut self, kind: DeviceKind) {
        let policy = Arc::clone(&self.policy);
        let task = match kind {
            DeviceKind::Controller => self
                .controller
                .as_mut()
                .and_then(|s| s.begin_reconnect(policy)),
            DeviceKind::Sensor => self.sensor.as_mut().and_then(|s| s.begin_reconnect(policy)),
        };
        if let Some(task) = task {
            self.dispatcher
                .submit(task, |outcome| Completion::Reconnected { outcome });
        }
    }

    fn on_reconnected(&mut self, id: DeviceId, outcome: TaskOutcome<()>) {
        if !self.is_current(id) {
            return;
        }
        let model = match id.kind {
            DeviceKind::Controller => self.controller.as_mut().map(|s| {
                s.reconnecting = false;
                s.failures.clear();
                s.device.info().model.clone()
            }),
            DeviceKind::Sensor => self.sensor.as_mut().map(|s| {
                s.reconnecting = false;
                s.failures.clear();
                s.device.info().model.clone()
            }),
        }
        .unwrap_or_default();

        match outcome.into_result() {
            Ok(()) => self.emit(EngineEvent::message(format!("{} reconnected", model))),
            Err(e) => {
                warn!("{}: reconnect failed: {}", model, e);
                self.report(id.kind, &e);
            }
        }
    }

    /// Run `writes` in order in one task on the bound controller.
    fn submit_writes(&mut self, writes: Vec<ControllerWrite>, stream: Option<Stream>) {
        let Some((id, controller)) = self.controller.as_ref().map(|s| (s.id, Arc::clone(&s.device)))
        else {
            self.emit(EngineEvent::error("No controller connected."));
            return;
        };
        let label = match writes.as_slice() {
            [single] => single.label(),
            _ => "program step",
        };
        let ops = writes.clone();
        let task = Task::new(id, label, move || {
            for write in ops {
                write.apply(controller.as_ref())?;
            }
            Ok(())
        });
        self.dispatcher.submit(task, move |outcome| Completion::Written {
            writes,
            stream,
            outcome,
        });
    }

    fn on_written(
        &mut self,
        id: DeviceId,
        writes: Vec<ControllerWrite>,
        stream: Option<Stream>,
        outcome: TaskOutcome<()>,
    ) {
        if !self.is_current(id) {
            return;
        }
        match outcome.into_result() {
            Ok(()) => {
                if let Some(stream) = stream {
                    self.record_success(id.kind, stream);
                }
                for write in writes {
                    self.on_write_applied(write);
                }
            }
            Err(e) => {
                if self.external_pv_mode && writes.contains(&ControllerWrite::ExternalPvMode(true))
                {
                    self.external_pv_mode = false;
                    self.watchdog.disarm();
                }
                self.on_failure(id, stream, e);
            }
        }
    }

    fn on_write_applied(&mut self, write: ControllerWrite) {
        match write {
            ControllerWrite::ExternalPvMode(true) => {
                if self.external_pv_mode {
                    info!("External PV mode on");
                    self.watchdog.arm(Instant::now());
                    self.emit(EngineEvent::message(EXTERNAL_PV_ACTIVATED));
                }
            }
            ControllerWrite::ExternalPvMode(false) => {
                info!("External PV mode off");
                self.emit(EngineEvent::message(EXTERNAL_PV_DEACTIVATED));
            }
            ControllerWrite::ExternalPv(value) => self.watchdog.feed(value, Instant::now()),
            ControllerWrite::Pid(parameter, value) => {
                self.emit(EngineEvent::PidParameter { parameter, value })
            }
            _ => {}
        }
    }

    fn refresh_parameters(&mut self) {
        let Some((id, controller)) = self.ready_controller() else {
            return;
        };
        let reads: [(&'static str, fn(&dyn Controller) -> DeviceResult<ControllerSetting>); 4] = [
            ("read target setpoint", |c| {
                c.target_setpoint().map(ControllerSetting::TargetSetpoint)
            }),
            ("read output power", |c| {
                c.working_output().map(ControllerSetting::Power)
            }),
            ("read rate", |c| c.rate().map(ControllerSetting::Rate)),
            ("read control mode", |c| {
                c.control_mode().map(ControllerSetting::Mode)
            }),
        ];
        for (label, read) in reads {
            let controller = Arc::clone(&controller);
            self.dispatcher.submit(
                Task::new(id, label, move || read(controller.as_ref())),
                |outcome| Completion::Setting { outcome },
            );
        }
    }

    fn refresh_pid(&mut self) {
        let Some((id, controller)) = self.ready_controller() else {
            return;
        };
        let info = controller.info();
        if info.capabilities.pid_parameters.is_empty() {
            self.emit(EngineEvent::NotSupported {
                kind: DeviceKind::Controller,
                error: format!("{} has no PID parameters", info.model),
            });
            return;
        }
        for parameter in info.capabilities.pid_parameters.clone() {
            let controller = Arc::clone(&controller);
            self.dispatcher.submit(
                Task::new(id, "read PID parameter", move || {
                    controller.pid_parameter(parameter)
                }),
                move |outcome| Completion::Pid { parameter, outcome },
            );
        }
    }

    fn refresh_heater_config(&mut self) {
        let Some((id, controller)) = self.ready_controller() else {
            return;
        };
        self.dispatcher.submit(
            Task::new(id, "read heater config", move || controller.heater_config()),
            |outcome| Completion::HeaterConfig { outcome },
        );
    }

    /// Write the config and read it back, so clients see what the device
    /// actually holds.
    fn set_heater_config(&mut self, config: HeaterConfig) {
        let Some((id, controller)) = self.ready_controller() else {
            return;
        };
        self.dispatcher.submit(
            Task::new(id, "write heater config", move || {
                controller.set_heater_config(config)?;
                controller.heater_config()
            }),
            |outcome| Completion::HeaterConfig { outcome },
        );
    }

    fn calibrate(&mut self) {
        let Some((id, controller)) = self.ready_controller() else {
            return;
        };
        info!("Calibration started");
        self.emit(EngineEvent::message(CALIBRATING));
        self.dispatcher.submit(
            Task::new(id, "calibrate", move || controller.calibrate()),
            |outcome| Completion::Calibrated { outcome },
        );
    }

    fn start_program(&mut self, segments: Vec<ProgramSegment>) {
        let program = match Program::new(segments) {
            Ok(program) => program,
            Err(e) => {
                self.emit(EngineEvent::error(format!("Invalid program: {}", e)));
                return;
            }
        };
        if self.programmer.as_ref().is_some_and(|p| p.phase().is_running()) {
            info!("Replacing the running program");
        }
        info!("Program started ({} segments)", program.len());
        let mut programmer = SetpointProgrammer::new(program);
        let actions = programmer.start();
        self.programmer = Some(programmer);
        self.apply_program_actions(actions);
    }

    /// Returns `false` when nothing was running.
    fn stop_program(&mut self) -> bool {
        match self.programmer.take() {
            Some(mut programmer) if programmer.phase().is_running() => {
                programmer.stop();
                info!("Program stopped");
                self.emit(EngineEvent::ProgramStopped);
                true
            }
            _ => false,
        }
    }

    fn skip_segment(&mut self) {
        match self.programmer.as_mut() {
            Some(programmer) if programmer.phase().is_running() => {
                let actions = programmer.skip();
                self.apply_program_actions(actions);
            }
            _ => self.emit(EngineEvent::error("No program is running.")),
        }
    }

    fn program_tick(&mut self) {
        let actions = match self.programmer.as_mut() {
            Some(programmer) if programmer.phase().is_running() => {
                programmer.tick(Instant::now())
            }
            _ => return,
        };
        self.apply_program_actions(actions);
    }

    fn apply_program_actions(&mut self, actions: Vec<ProgramAction>) {
        let mut writes = Vec::new();
        for action in actions {
            match action {
                ProgramAction::SetControlMode(mode) => writes.push(ControllerWrite::ControlMode(mode)),
                ProgramAction::SetRate(rate) => writes.push(ControllerWrite::Rate(rate)),
                ProgramAction::SetTargetSetpoint(sp) => {
                    writes.push(ControllerWrite::TargetSetpoint(sp))
                }
                ProgramAction::RampStarted(segment) => {
                    info!("Ramp {} started", segment);
                    self.emit(EngineEvent::RampStarted { segment });
                }
                ProgramAction::HoldStarted(segment) => {
                    info!("Hold {} started", segment);
                    self.emit(EngineEvent::HoldStarted { segment });
                }
                ProgramAction::Finished => {
                    info!("Program finished");
                    self.programmer = None;
                    self.emit(EngineEvent::ProgramFinished);
                }
            }
        }
        if !writes.is_empty() {
            self.submit_writes(writes, None);
        }
    }

    fn set_external_pv_mode(&mut self, enabled: bool) {
        if enabled && (self.controller.is_none() || self.sensor.is_none()) {
            self.emit(EngineEvent::error(EXTERNAL_PV_NEEDS_DEVICES));
            return;
        }
        self.external_pv_mode = enabled;
        self.watchdog.disarm();
        self.submit_writes(vec![ControllerWrite::ExternalPvMode(enabled)], None);
    }

    fn transfer_external_pv(&mut self) {
        if !self.external_pv_mode || self.ready_controller().is_none() {
            return;
        }
        if let Some((id, sensor)) = self.ready_sensor() {
            self.poll(id, Stream::ExternalRead, move || sensor.sensor_value());
        }
    }

    fn check_watchdog(&mut self) {
        if !self.watchdog.check(Instant::now()) {
            return;
        }
        warn!("No external PV within {:?}", self.watchdog.timeout());
        self.emit(EngineEvent::error(EXTERNAL_PV_TIMED_OUT));
        self.external_pv_mode = false;
        if self.controller.is_some() {
            self.submit_writes(vec![ControllerWrite::ExternalPvMode(false)], None);
        }
    }

    fn export_log(&self, path: Option<&str>) {
        let rows = self.log.rows();
        let quantity = self
            .controller
            .as_ref()
            .map_or(self.units, |s| s.device.info().quantity);
        let unit = quantity.unit();
        let path = self.log_config.export_path(path, Utc::now());
        let events = self.events.clone();
        tokio::spawn(async move {
            let target = path.clone();
            let written =
                tokio::task::spawn_blocking(move || session_log::export_csv(&target, &rows, unit))
                    .await;
            let shown = path.display().to_string();
            let event = match written {
                Ok(Ok(rows)) => {
                    info!("Exported {} log rows to {}", rows, shown);
                    EngineEvent::LogExported { path: shown, rows }
                }
                Ok(Err(e)) => {
                    error!("Log export failed: {}", e);
                    EngineEvent::error(format!("Log export failed: {}", e))
                }
                Err(e) => EngineEvent::error(format!("Log export aborted: {}", e)),
            };
            let _ = events.send(event);
        });
    }

    fn list_ports(&self) {
        let events = self.events.clone();
        tokio::spawn(async move {
            match tokio::task::spawn_blocking(elchi_backend::available_ports).await {
                Ok(ports) => {
                    let _ = events.send(EngineEvent::AvailablePorts { ports });
                }
                Err(e) => warn!("Port enumeration aborted: {}", e),
            }
        });
    }

    /// Stop the program and close every bound device.
    async fn shutdown(mut self) {
        self.stop_program();
        self.connecting.clear();
        let handles: Vec<TaskHandle> = [DeviceKind::Controller, DeviceKind::Sensor]
            .into_iter()
            .filter_map(|kind| self.unbind(kind))
            .collect();
        for handle in handles {
            handle.wait().await;
        }
    }
}

fn ticker(period: Duration) -> time::Interval {
    let mut interval = time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(time::Instant::from_std(deadline)).await,
        None => std::future::pending().await,
    }
}

/// Run the engine until shutdown is signalled or the command channel closes.
pub async fn run_engine(
    config: EngineConfig,
    mut rx: mpsc::Receiver<EngineCommand>,
    events: broadcast::Sender<EngineEvent>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> DynResult<()> {
    let behavior = config.behavior.clone();
    let (mut engine, mut completions) = Engine::new(config, events);
    let mut status = ticker(behavior.status_interval());
    let mut program = ticker(behavior.program_interval());
    let mut external = ticker(behavior.external_pv_interval());
    info!("Engine ready");

    loop {
        let watchdog_deadline = engine.watchdog.deadline();
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
            maybe_cmd = rx.recv() => {
                let Some(cmd) = maybe_cmd else { break; };
                debug!("Engine command {:?}", cmd);
                engine.handle_command(cmd);
            }
            Some(done) = completions.recv() => engine.handle_completion(done),
            _ = status.tick() => engine.poll_status(),
            _ = program.tick() => engine.program_tick(),
            _ = external.tick() => engine.transfer_external_pv(),
            _ = sleep_until_deadline(watchdog_deadline), if watchdog_deadline.is_some() => {
                engine.check_watchdog();
            }
        }
    }

    info!("Engine shutting down");
    engine.shutdown().await;
    Ok(())
}

/// Spawn [`run_engine`] and log its failure.
pub fn spawn_engine(
    config: EngineConfig,
    rx: mpsc::Receiver<EngineCommand>,
    events: broadcast::Sender<EngineEvent>,
    shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = run_engine(config, rx, events, shutdown_rx).await {
            error!("Engine error: {:?}", e);
        }
    })
}

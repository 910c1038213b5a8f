// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Resistive heater regulated in software over a bench power supply.
//!
//! The heater coil doubles as the temperature sensor: its resistance is
//! measured every loop tick and converted to a temperature. A background
//! thread runs the loop; the [`Controller`] methods only touch the shared
//! state, so status polls never wait on the supply.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use elchi_core::control::fit::linear_fit;
use elchi_core::control::pid::{PidTuning, SoftwarePid};
use elchi_core::control::ramp::SetpointTracker;
use elchi_core::device::guard::TransportGuard;
use elchi_core::device::response::{DeviceError, DeviceResult};
use elchi_core::device::supply::PowerSupply;
use elchi_core::device::{DeviceAccess, DeviceCapabilities, DeviceInfo, Quantity};
use elchi_core::{Calibration, ControlMode, Controller, Device, HeaterConfig, PidParameter};

const SMOOTHING: f64 = 0.8;
const INITIAL_TEMPERATURE: f64 = 25.0;
/// Manual output steps of a calibration sweep, 1% each.
const CALIBRATION_STEPS: u32 = 10;

/// Coil temperature in °C from its resistance.
///
/// Empirical fit for the ceramic sputter heater.
pub fn temperature_from_resistance(resistance: f64, cold_resistance: f64) -> f64 {
    (resistance * 0.2075 / cold_resistance - 0.2) / 0.0003
}

/// Heater and loop parameters, `[heater]` in the config file.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeaterSettings {
    /// Coil resistance at room temperature, ohms.
    pub cold_resistance: f64,
    pub max_voltage: f64,
    pub max_current: f64,
    /// Output floor in automatic mode, percent.
    pub min_output: f64,
    pub proportional_band: f64,
    pub integral_time: f64,
    pub derivative_time: f64,
    /// °C per minute.
    pub rate: f64,
    pub loop_interval_ms: u64,
    /// Wait after each calibration step before reading the supply.
    pub calibration_settle_ms: u64,
}

impl Default for HeaterSettings {
    fn default() -> Self {
        Self {
            cold_resistance: 0.528,
            max_voltage: 10.0,
            max_current: 10.0,
            min_output: 10.0,
            proportional_band: 750.0,
            integral_time: 12.0,
            derivative_time: 20.0,
            rate: 15.0,
            loop_interval_ms: 250,
            calibration_settle_ms: 1000,
        }
    }
}

impl HeaterSettings {
    pub fn tuning(&self) -> PidTuning {
        PidTuning {
            proportional_band: self.proportional_band,
            integral_time: self.integral_time,
            derivative_time: self.derivative_time,
        }
    }

    pub fn loop_interval(&self) -> Duration {
        Duration::from_millis(self.loop_interval_ms)
    }

    pub fn calibration_settle(&self) -> Duration {
        Duration::from_millis(self.calibration_settle_ms)
    }

    pub fn config(&self) -> HeaterConfig {
        HeaterConfig {
            cold_resistance: self.cold_resistance,
            max_voltage: self.max_voltage,
            max_current: self.max_current,
            min_output: self.min_output,
        }
    }

    /// Replace the coil and supply limits, keeping tuning and timing.
    pub fn with_config(mut self, config: HeaterConfig) -> Self {
        self.cold_resistance = config.cold_resistance;
        self.max_voltage = config.max_voltage;
        self.max_current = config.max_current;
        self.min_output = config.min_output;
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if !(self.cold_resistance.is_finite() && self.cold_resistance > 0.0) {
            return Err("[heater].cold_resistance must be > 0".to_string());
        }
        if !(self.max_voltage.is_finite() && self.max_voltage > 0.0) {
            return Err("[heater].max_voltage must be > 0".to_string());
        }
        if !(self.max_current.is_finite() && self.max_current > 0.0) {
            return Err("[heater].max_current must be > 0".to_string());
        }
        if !(0.0..=100.0).contains(&self.min_output) {
            return Err("[heater].min_output must be within 0..=100".to_string());
        }
        if self.loop_interval_ms == 0 {
            return Err("[heater].loop_interval_ms must be > 0".to_string());
        }
        if self.calibration_settle_ms == 0 {
            return Err("[heater].calibration_settle_ms must be > 0".to_string());
        }
        self.tuning()
            .validate()
            .map_err(|e| format!("[heater]: {}", e))
    }
}

/// Everything the control loop and the controller methods share.
#[derive(Debug)]
struct HeaterState {
    settings: HeaterSettings,
    tracker: SetpointTracker,
    pid: SoftwarePid,
    mode: ControlMode,
    manual_power: f64,
    working_power: f64,
    temperature: f64,
    external_pv_mode: bool,
    external_pv: f64,
    /// Failure of the most recent loop tick, cleared by the next good one.
    link_error: Option<DeviceError>,
}

impl HeaterState {
    fn new(settings: HeaterSettings, started: Instant) -> DeviceResult<Self> {
        settings.validate().map_err(DeviceError::unexpected)?;
        let pid = SoftwarePid::starting_at(settings.tuning(), settings.loop_interval(), started)
            .map_err(|e| DeviceError::unexpected(e.to_string()))?;
        Ok(Self {
            settings,
            tracker: SetpointTracker::new(INITIAL_TEMPERATURE, settings.rate),
            pid,
            mode: ControlMode::Manual,
            manual_power: 0.0,
            working_power: 0.0,
            temperature: INITIAL_TEMPERATURE,
            external_pv_mode: false,
            external_pv: 0.0,
            link_error: None,
        })
    }

    /// Fold a resistance reading into the smoothed temperature. `None`
    /// (no current flowing) reads as the cold coil.
    fn observe_resistance(&mut self, resistance: Option<f64>) -> f64 {
        let resistance = resistance.unwrap_or(self.settings.cold_resistance);
        let measured = temperature_from_resistance(resistance, self.settings.cold_resistance);
        self.temperature = self.temperature * SMOOTHING + measured * (1.0 - SMOOTHING);
        self.temperature
    }

    /// One loop tick. Returns the output power in percent.
    fn step(&mut self, now: Instant) -> f64 {
        match self.mode {
            ControlMode::Manual => self.working_power = self.manual_power,
            ControlMode::Automatic => {
                let setpoint = self.tracker.advance(self.settings.loop_interval());
                let pv = if self.external_pv_mode {
                    self.external_pv
                } else {
                    self.temperature
                };
                let output = self
                    .pid
                    .calculate_output(pv, setpoint, now)
                    .unwrap_or(self.working_power);
                self.working_power = output.max(self.settings.min_output);
            }
        }
        self.working_power
    }

    /// Loop tick on a fresh supply reading. A failed read drops the
    /// output to zero rather than regulating on a stale temperature.
    fn apply_reading(&mut self, reading: DeviceResult<Option<f64>>, now: Instant) -> f64 {
        match reading {
            Ok(resistance) => {
                self.observe_resistance(resistance);
                self.link_error = None;
                self.step(now)
            }
            Err(e) => {
                debug!("Heater resistance read failed: {}", e);
                self.link_error = Some(e);
                self.working_power = 0.0;
                self.working_power
            }
        }
    }

    fn current_limit(&self) -> f64 {
        self.working_power / 100.0 * self.settings.max_current
    }

    fn set_mode(&mut self, mode: ControlMode) {
        match mode {
            ControlMode::Automatic => {
                self.tracker.reset_working(self.temperature);
                self.pid.reset_integral();
            }
            ControlMode::Manual => self.manual_power = self.working_power,
        }
        self.mode = mode;
    }

    fn set_external_pv_mode(&mut self, enabled: bool) {
        self.external_pv_mode = enabled;
        let seed = if enabled {
            self.external_pv
        } else {
            self.temperature
        };
        self.tracker.reset_working(seed);
        self.pid.reset_integral();
    }
}

type SharedSupply = Arc<TransportGuard<Box<dyn PowerSupply>>>;

fn lock_state(state: &Mutex<HeaterState>) -> DeviceResult<MutexGuard<'_, HeaterState>> {
    state
        .lock()
        .map_err(|_| DeviceError::unexpected("heater state is poisoned"))
}

fn control_step(state: &Mutex<HeaterState>, supply: &TransportGuard<Box<dyn PowerSupply>>) {
    let reading = supply.with(|psu| psu.resistance());
    let current = {
        let Ok(mut st) = lock_state(state) else {
            return;
        };
        st.apply_reading(reading, Instant::now());
        st.current_limit()
    };
    if let Err(e) = supply.with(|psu| psu.set_current_limit(current)) {
        debug!("Heater current limit write failed: {}", e);
        if let Ok(mut st) = lock_state(state) {
            st.link_error = Some(e);
        }
    }
}

/// Software-regulated heater. See the module docs.
pub struct ResistiveHeater {
    info: DeviceInfo,
    state: Arc<Mutex<HeaterState>>,
    supply: SharedSupply,
    running: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ResistiveHeater {
    /// Take ownership of `supply`, set its voltage limit and start the
    /// control loop.
    pub fn start(
        model: &str,
        mut supply: Box<dyn PowerSupply>,
        settings: HeaterSettings,
        access: DeviceAccess,
    ) -> DeviceResult<Self> {
        let state = HeaterState::new(settings, Instant::now())?;
        supply.set_voltage_limit(settings.max_voltage)?;

        let heater = Self {
            info: DeviceInfo {
                manufacturer: "ElchWorks".to_string(),
                model: model.to_string(),
                quantity: Quantity::Temperature,
                capabilities: DeviceCapabilities {
                    manual_output: true,
                    pid_parameters: PidParameter::FIRST_SET.to_vec(),
                    output_enable: true,
                    aiming_beam: false,
                    external_pv: true,
                    reconnect: matches!(access, DeviceAccess::Serial { .. }),
                },
                access,
            },
            state: Arc::new(Mutex::new(state)),
            supply: Arc::new(TransportGuard::new(model, supply)),
            running: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
        };
        heater.spawn_loop()?;
        info!("{} control loop started", model);
        Ok(heater)
    }

    fn spawn_loop(&self) -> DeviceResult<()> {
        let mut worker = self
            .worker
            .lock()
            .map_err(|_| DeviceError::unexpected("heater worker slot is poisoned"))?;
        if worker.is_some() {
            return Ok(());
        }
        let interval = lock_state(&self.state)?.settings.loop_interval();
        let state = Arc::clone(&self.state);
        let supply = Arc::clone(&self.supply);
        let running = Arc::clone(&self.running);
        running.store(true, Ordering::SeqCst);

        let handle = std::thread::Builder::new()
            .name("heater-loop".to_string())
            .spawn(move || {
                while running.load(Ordering::SeqCst) {
                    let started = Instant::now();
                    control_step(&state, &supply);
                    std::thread::sleep(interval.saturating_sub(started.elapsed()));
                }
            })
            .map_err(|e| {
                self.running.store(false, Ordering::SeqCst);
                DeviceError::unexpected(format!("cannot start heater loop: {}", e))
            })?;
        *worker = Some(handle);
        Ok(())
    }

    fn stop_loop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let handle = match self.worker.lock() {
            Ok(mut worker) => worker.take(),
            Err(_) => None,
        };
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("{} control loop panicked", self.info.model);
            }
        }
    }

    fn state(&self) -> DeviceResult<MutexGuard<'_, HeaterState>> {
        lock_state(&self.state)
    }

    /// Step the manual output through the calibration sweep and collect
    /// `(voltages, currents)`. The control loop applies each step.
    fn sweep(&self, settle: Duration) -> DeviceResult<(Vec<f64>, Vec<f64>)> {
        let mut voltages = Vec::with_capacity(CALIBRATION_STEPS as usize);
        let mut currents = Vec::with_capacity(CALIBRATION_STEPS as usize);
        for step in 1..=CALIBRATION_STEPS {
            self.state()?.manual_power = f64::from(step);
            std::thread::sleep(settle);
            let (volts, amps) = self.supply.with(|psu| Ok((psu.voltage()?, psu.current()?)))?;
            debug!("Calibration step {}: {} V, {} A", step, volts, amps);
            voltages.push(volts);
            currents.push(amps);
        }
        Ok((voltages, currents))
    }
}

impl Drop for ResistiveHeater {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

impl Device for ResistiveHeater {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn close(&self) -> DeviceResult<()> {
        self.stop_loop();
        self.supply.with(|psu| psu.close())
    }

    fn reopen(&self) -> DeviceResult<()> {
        self.stop_loop();
        let max_voltage = self.state()?.settings.max_voltage;
        self.supply.with(|psu| {
            psu.reopen()?;
            psu.set_voltage_limit(max_voltage)
        })?;
        self.state()?.link_error = None;
        self.spawn_loop()
    }
}

impl Controller for ResistiveHeater {
    fn process_variable(&self) -> DeviceResult<f64> {
        let st = self.state()?;
        match &st.link_error {
            Some(e) => Err(e.clone()),
            None => Ok(st.temperature),
        }
    }

    fn target_setpoint(&self) -> DeviceResult<f64> {
        Ok(self.state()?.tracker.target())
    }

    fn set_target_setpoint(&self, setpoint: f64) -> DeviceResult<()> {
        self.state()?.tracker.set_target(setpoint);
        Ok(())
    }

    fn working_setpoint(&self) -> DeviceResult<f64> {
        Ok(self.state()?.tracker.working())
    }

    fn working_output(&self) -> DeviceResult<f64> {
        Ok(self.state()?.working_power)
    }

    fn rate(&self) -> DeviceResult<f64> {
        Ok(self.state()?.tracker.rate())
    }

    fn set_rate(&self, rate: f64) -> DeviceResult<()> {
        let mut st = self.state()?;
        st.tracker.set_rate(rate);
        st.settings.rate = st.tracker.rate();
        Ok(())
    }

    fn control_mode(&self) -> DeviceResult<ControlMode> {
        Ok(self.state()?.mode)
    }

    fn set_control_mode(&self, mode: ControlMode) -> DeviceResult<()> {
        self.state()?.set_mode(mode);
        Ok(())
    }

    fn set_manual_output_power(&self, power: f64) -> DeviceResult<()> {
        self.state()?.manual_power = power.clamp(0.0, 100.0);
        Ok(())
    }

    fn pid_parameter(&self, parameter: PidParameter) -> DeviceResult<f64> {
        let tuning = self.state()?.pid.tuning();
        match parameter {
            PidParameter::P1 => Ok(tuning.proportional_band),
            PidParameter::I1 => Ok(tuning.integral_time),
            PidParameter::D1 => Ok(tuning.derivative_time),
            other => Err(DeviceError::unsupported(&format!("reading {}", other))),
        }
    }

    fn set_pid_parameter(&self, parameter: PidParameter, value: f64) -> DeviceResult<()> {
        let mut st = self.state()?;
        let mut tuning = st.pid.tuning();
        match parameter {
            PidParameter::P1 => tuning.proportional_band = value,
            PidParameter::I1 => tuning.integral_time = value,
            PidParameter::D1 => tuning.derivative_time = value,
            other => return Err(DeviceError::unsupported(&format!("writing {}", other))),
        }
        st.pid
            .set_tuning(tuning)
            .map_err(|e| DeviceError::unexpected(e.to_string()))?;
        st.settings.proportional_band = tuning.proportional_band;
        st.settings.integral_time = tuning.integral_time;
        st.settings.derivative_time = tuning.derivative_time;
        Ok(())
    }

    fn set_output_enabled(&self, enabled: bool) -> DeviceResult<()> {
        self.supply.with(|psu| psu.set_output_enabled(enabled))
    }

    fn write_external_pv(&self, value: f64) -> DeviceResult<()> {
        self.state()?.external_pv = value;
        Ok(())
    }

    fn set_external_pv_mode(&self, enabled: bool) -> DeviceResult<()> {
        self.state()?.set_external_pv_mode(enabled);
        Ok(())
    }

    fn heater_config(&self) -> DeviceResult<HeaterConfig> {
        Ok(self.state()?.settings.config())
    }

    fn set_heater_config(&self, config: HeaterConfig) -> DeviceResult<()> {
        let candidate = self.state()?.settings.with_config(config);
        candidate.validate().map_err(DeviceError::unexpected)?;
        self.supply
            .with(|psu| psu.set_voltage_limit(config.max_voltage))?;
        let mut st = self.state()?;
        st.settings = st.settings.with_config(config);
        info!("{} heater config updated: {:?}", self.info.model, config);
        Ok(())
    }

    fn calibrate(&self) -> DeviceResult<Calibration> {
        let (mode, manual_power, settle) = {
            let mut st = self.state()?;
            let saved = (st.mode, st.manual_power, st.settings.calibration_settle());
            st.mode = ControlMode::Manual;
            saved
        };
        info!("{} calibrating over {} steps", self.info.model, CALIBRATION_STEPS);
        let sweep = self.sweep(settle);

        {
            let mut st = self.state()?;
            st.manual_power = manual_power;
            if matches!(mode, ControlMode::Automatic) {
                st.set_mode(mode);
            }
        }

        let (voltages, currents) = sweep?;
        let fit = linear_fit(&currents, &voltages).ok_or_else(|| {
            DeviceError::unexpected(
                "calibration failed: current did not change, check the circuit and the output",
            )
        })?;
        info!(
            "{} calibrated: {:.4} ohm, R² {:.4}",
            self.info.model, fit.slope, fit.r_squared
        );
        Ok(Calibration {
            voltages,
            currents,
            resistance: fit.slope,
            offset: fit.intercept,
            r_squared: fit.r_squared,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use elchi_core::DeviceErrorKind;

    const EPS: f64 = 1e-9;

    fn state() -> (HeaterState, Instant) {
        let t0 = Instant::now();
        (HeaterState::new(HeaterSettings::default(), t0).unwrap(), t0)
    }

    #[test]
    fn test_cold_coil_reads_room_temperature() {
        assert!((temperature_from_resistance(0.528, 0.528) - 25.0).abs() < EPS);
        let (mut st, _) = state();
        st.observe_resistance(None);
        assert!((st.temperature - 25.0).abs() < EPS);
    }

    #[test]
    fn test_temperature_is_smoothed() {
        let (mut st, _) = state();
        let hot = temperature_from_resistance(1.0, 0.528);
        let t = st.observe_resistance(Some(1.0));
        assert!((t - (25.0 * 0.8 + hot * 0.2)).abs() < EPS);
    }

    #[test]
    fn test_manual_mode_follows_manual_power() {
        let (mut st, t0) = state();
        st.manual_power = 40.0;
        assert_eq!(st.step(t0), 40.0);
        assert!((st.current_limit() - 4.0).abs() < EPS);
    }

    #[test]
    fn test_automatic_mode_keeps_output_floor() {
        let (mut st, t0) = state();
        st.set_mode(ControlMode::Automatic);
        // working setpoint seeded at the PV, target far below
        st.tracker.set_target(0.0);
        let power = st.step(t0 + Duration::from_secs(1));
        assert_eq!(power, 10.0);
    }

    #[test]
    fn test_automatic_mode_drives_toward_setpoint() {
        let (mut st, t0) = state();
        st.set_mode(ControlMode::Automatic);
        st.pid
            .set_tuning(PidTuning {
                proportional_band: 10.0,
                integral_time: 12.0,
                derivative_time: 20.0,
            })
            .unwrap();
        st.tracker.set_rate(6000.0);
        st.tracker.set_target(500.0);
        // first tick sees a derivative kick from the zero initial PV
        st.step(t0 + Duration::from_secs(1));
        let power = st.step(t0 + Duration::from_secs(2));
        assert!(power > 10.0);
        // a tick inside the gate keeps the previous power
        assert_eq!(st.step(t0 + Duration::from_millis(2100)), power);
    }

    #[test]
    fn test_entering_automatic_resets_integral_and_seeds_setpoint() {
        let (mut st, t0) = state();
        st.set_mode(ControlMode::Automatic);
        st.tracker.set_rate(6000.0);
        st.tracker.set_target(500.0);
        st.step(t0 + Duration::from_secs(1));
        assert!(st.pid.output_sum() > 0.0);

        st.set_mode(ControlMode::Manual);
        assert_eq!(st.manual_power, st.working_power);
        st.temperature = 80.0;
        st.set_mode(ControlMode::Automatic);
        assert_eq!(st.pid.output_sum(), 0.0);
        assert_eq!(st.tracker.working(), 80.0);
    }

    #[test]
    fn test_external_pv_mode_seeds_from_external_value() {
        let (mut st, _) = state();
        st.external_pv = 312.0;
        st.set_external_pv_mode(true);
        assert_eq!(st.tracker.working(), 312.0);
        st.set_external_pv_mode(false);
        assert_eq!(st.tracker.working(), 25.0);
    }

    #[test]
    fn test_failed_reading_drops_output_without_pid_step() {
        let (mut st, t0) = state();
        st.set_mode(ControlMode::Automatic);
        st.tracker.set_rate(6000.0);
        st.tracker.set_target(500.0);
        let power = st.apply_reading(Ok(Some(0.528)), t0 + Duration::from_secs(1));
        assert!(power >= 10.0);
        assert!(st.pid.output_sum() > 0.0);
        let integral = st.pid.output_sum();
        let temperature = st.temperature;

        let err = DeviceError::transport("cable pulled");
        let power = st.apply_reading(Err(err.clone()), t0 + Duration::from_secs(2));
        assert_eq!(power, 0.0);
        assert_eq!(st.current_limit(), 0.0);
        assert_eq!(st.pid.output_sum(), integral);
        assert_eq!(st.temperature, temperature);
        assert_eq!(st.link_error, Some(err));

        // back to regulating on the next good reading
        let power = st.apply_reading(Ok(Some(0.528)), t0 + Duration::from_secs(3));
        assert!(power >= 10.0);
        assert!(st.link_error.is_none());
    }

    #[test]
    fn test_settings_validation() {
        assert!(HeaterSettings::default().validate().is_ok());
        let bad = HeaterSettings {
            cold_resistance: 0.0,
            ..HeaterSettings::default()
        };
        assert!(bad.validate().is_err());
        let bad = HeaterSettings {
            proportional_band: -1.0,
            ..HeaterSettings::default()
        };
        assert!(bad.validate().is_err());
        let bad = HeaterSettings {
            calibration_settle_ms: 0,
            ..HeaterSettings::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_config_replaces_limits_only() {
        let settings = HeaterSettings::default().with_config(HeaterConfig {
            cold_resistance: 0.61,
            max_voltage: 12.0,
            max_current: 8.0,
            min_output: 5.0,
        });
        assert_eq!(settings.config().cold_resistance, 0.61);
        assert_eq!(settings.max_current, 8.0);
        assert_eq!(settings.proportional_band, 750.0);
        assert_eq!(settings.loop_interval_ms, 250);
    }

    /// Supply log plus an optional ohmic load: with `load` set the output
    /// current follows the current limit and the voltage is
    /// `amps * load + LEAD_DROP`.
    #[derive(Clone, Default)]
    struct FakeSupply {
        log: Arc<Mutex<Vec<String>>>,
        failing: Arc<AtomicBool>,
        amps: Arc<Mutex<f64>>,
        load: Option<f64>,
    }

    const LEAD_DROP: f64 = 0.05;

    impl FakeSupply {
        fn entries(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }

        fn link(&self) -> DeviceResult<()> {
            if self.failing.load(Ordering::SeqCst) {
                Err(DeviceError::transport("cable pulled"))
            } else {
                Ok(())
            }
        }
    }

    impl PowerSupply for FakeSupply {
        fn set_voltage_limit(&mut self, volts: f64) -> DeviceResult<()> {
            self.log.lock().unwrap().push(format!("V {:.1}", volts));
            Ok(())
        }
        fn set_current_limit(&mut self, amps: f64) -> DeviceResult<()> {
            self.link()?;
            self.log.lock().unwrap().push(format!("I {:.1}", amps));
            *self.amps.lock().unwrap() = amps;
            Ok(())
        }
        fn voltage(&mut self) -> DeviceResult<f64> {
            self.link()?;
            let amps = *self.amps.lock().unwrap();
            Ok(self.load.map_or(0.0, |ohms| amps * ohms + LEAD_DROP))
        }
        fn current(&mut self) -> DeviceResult<f64> {
            self.link()?;
            let amps = *self.amps.lock().unwrap();
            Ok(if self.load.is_some() { amps } else { 0.0 })
        }
        fn close(&mut self) -> DeviceResult<()> {
            self.log.lock().unwrap().push("close".to_string());
            Ok(())
        }
        fn reopen(&mut self) -> DeviceResult<()> {
            self.log.lock().unwrap().push("reopen".to_string());
            Ok(())
        }
    }

    fn fast_settings() -> HeaterSettings {
        HeaterSettings {
            loop_interval_ms: 10,
            calibration_settle_ms: 40,
            ..HeaterSettings::default()
        }
    }

    fn start(supply: &FakeSupply) -> ResistiveHeater {
        ResistiveHeater::start(
            "Resistive Heater Test",
            Box::new(supply.clone()),
            fast_settings(),
            DeviceAccess::Simulated,
        )
        .unwrap()
    }

    #[test]
    fn test_loop_writes_current_limit() {
        let supply = FakeSupply::default();
        let heater = ResistiveHeater::start(
            "Resistive Heater Test",
            Box::new(supply.clone()),
            fast_settings(),
            DeviceAccess::Simulated,
        )
        .unwrap();
        heater.set_manual_output_power(50.0).unwrap();
        std::thread::sleep(Duration::from_millis(100));
        heater.close().unwrap();

        let log = supply.entries();
        assert_eq!(log[0], "V 10.0");
        assert!(log.contains(&"I 5.0".to_string()));
        assert_eq!(log.last().unwrap(), "close");
        assert_eq!(heater.working_output().unwrap(), 50.0);
    }

    #[test]
    fn test_link_failure_surfaces_on_process_variable() {
        let supply = FakeSupply::default();
        let heater = ResistiveHeater::start(
            "Resistive Heater Test",
            Box::new(supply.clone()),
            fast_settings(),
            DeviceAccess::Simulated,
        )
        .unwrap();
        supply.failing.store(true, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(60));
        let err = heater.process_variable().unwrap_err();
        assert_eq!(err.kind, DeviceErrorKind::Transport);

        supply.failing.store(false, Ordering::SeqCst);
        heater.reopen().unwrap();
        assert!(heater.process_variable().is_ok());
        heater.close().unwrap();
        assert!(supply.entries().contains(&"reopen".to_string()));
    }

    #[test]
    fn test_pid_parameters_round_trip_through_tuning() {
        let heater = ResistiveHeater::start(
            "Resistive Heater Test",
            Box::new(FakeSupply::default()),
            fast_settings(),
            DeviceAccess::Simulated,
        )
        .unwrap();
        heater.set_pid_parameter(PidParameter::P1, 500.0).unwrap();
        assert_eq!(heater.pid_parameter(PidParameter::P1).unwrap(), 500.0);
        assert_eq!(heater.pid_parameter(PidParameter::I1).unwrap(), 12.0);

        let err = heater.set_pid_parameter(PidParameter::I1, 0.0).unwrap_err();
        assert_eq!(err.kind, DeviceErrorKind::Unexpected);
        let err = heater.pid_parameter(PidParameter::B12).unwrap_err();
        assert_eq!(err.kind, DeviceErrorKind::Unsupported);
        heater.close().unwrap();
    }

    #[test]
    fn test_failing_supply_read_does_not_ramp_output() {
        let supply = FakeSupply::default();
        let heater = start(&supply);
        heater.set_manual_output_power(50.0).unwrap();
        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(heater.working_output().unwrap(), 50.0);

        supply.failing.store(true, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(heater.working_output().unwrap(), 0.0);
        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(heater.working_output().unwrap(), 0.0);

        supply.failing.store(false, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(heater.working_output().unwrap(), 50.0);
        heater.close().unwrap();
    }

    #[test]
    fn test_calibration_fits_coil_resistance() {
        let supply = FakeSupply {
            load: Some(0.6),
            ..FakeSupply::default()
        };
        let heater = start(&supply);
        heater.set_manual_output_power(30.0).unwrap();

        let cal = heater.calibrate().unwrap();
        assert_eq!(cal.currents.len(), 10);
        assert!((cal.currents[0] - 0.1).abs() < 1e-9);
        assert!((cal.currents[9] - 1.0).abs() < 1e-9);
        assert!((cal.resistance - 0.6).abs() < 1e-9);
        assert!((cal.offset - LEAD_DROP).abs() < 1e-9);
        assert!((cal.r_squared - 1.0).abs() < 1e-9);

        // the sweep hands the output back
        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(heater.working_output().unwrap(), 30.0);
        heater.close().unwrap();
    }

    #[test]
    fn test_calibration_without_current_fails_and_restores_mode() {
        let supply = FakeSupply::default();
        let heater = start(&supply);
        heater.set_control_mode(ControlMode::Automatic).unwrap();

        let err = heater.calibrate().unwrap_err();
        assert_eq!(err.kind, DeviceErrorKind::Unexpected);
        assert!(err.message.starts_with("calibration failed"));
        assert_eq!(heater.control_mode().unwrap(), ControlMode::Automatic);
        heater.close().unwrap();
    }

    #[test]
    fn test_heater_config_update_sets_voltage_limit() {
        let supply = FakeSupply::default();
        let heater = start(&supply);
        let config = HeaterConfig {
            cold_resistance: 0.61,
            max_voltage: 12.0,
            max_current: 8.0,
            min_output: 5.0,
        };
        heater.set_heater_config(config).unwrap();
        assert_eq!(heater.heater_config().unwrap(), config);
        assert!(supply.entries().contains(&"V 12.0".to_string()));

        let bad = HeaterConfig {
            cold_resistance: 0.0,
            ..config
        };
        let err = heater.set_heater_config(bad).unwrap_err();
        assert_eq!(err.kind, DeviceErrorKind::Unexpected);
        assert_eq!(heater.heater_config().unwrap(), config);
        heater.close().unwrap();
    }
}

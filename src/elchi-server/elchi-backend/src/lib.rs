// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

use std::collections::HashMap;
use std::sync::Arc;

use elchi_app::normalize_name;
use elchi_core::{Controller, DeviceKind, DynResult, Quantity, Sensor};

mod dummy;
mod heater;
mod simulated;

pub use dummy::{FaultyTestController, NiceTestController, TestController, TestSensor};
pub use heater::{temperature_from_resistance, HeaterSettings, ResistiveHeater};
pub use simulated::SimulatedSupply;

#[cfg(feature = "serial")]
use elchi_backend_serial::{ScpiThermometer, Tenma};

/// Where a device is plugged in, as chosen by the user.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Connection {
    pub port: Option<String>,
    /// Overrides the model's default baud rate.
    pub baud: Option<u32>,
}

impl Connection {
    #[cfg(feature = "serial")]
    fn require_port(&self, model: &str) -> DynResult<&str> {
        self.port
            .as_deref()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| format!("{} needs a serial port", model).into())
    }
}

pub type ControllerFactory =
    Arc<dyn Fn(&Connection) -> DynResult<Arc<dyn Controller>> + Send + Sync>;
pub type SensorFactory = Arc<dyn Fn(&Connection) -> DynResult<Arc<dyn Sensor>> + Send + Sync>;

/// Wrap a closure as a [`ControllerFactory`].
pub fn controller_factory<F>(f: F) -> ControllerFactory
where
    F: Fn(&Connection) -> DynResult<Arc<dyn Controller>> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Wrap a closure as a [`SensorFactory`].
pub fn sensor_factory<F>(f: F) -> SensorFactory
where
    F: Fn(&Connection) -> DynResult<Arc<dyn Sensor>> + Send + Sync + 'static,
{
    Arc::new(f)
}

#[derive(Clone)]
struct Entry<F> {
    name: String,
    quantity: Quantity,
    factory: F,
}

/// Context for registering and instantiating device backends.
#[derive(Clone, Default)]
pub struct RegistrationContext {
    controllers: HashMap<String, Entry<ControllerFactory>>,
    sensors: HashMap<String, Entry<SensorFactory>>,
}

impl RegistrationContext {
    /// Create a new empty registration context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a controller under its display name (e.g. "Test Controller").
    pub fn register_controller(&mut self, name: &str, quantity: Quantity, factory: ControllerFactory) {
        self.controllers.insert(
            normalize_name(name),
            Entry {
                name: name.to_string(),
                quantity,
                factory,
            },
        );
    }

    pub fn register_sensor(&mut self, name: &str, quantity: Quantity, factory: SensorFactory) {
        self.sensors.insert(
            normalize_name(name),
            Entry {
                name: name.to_string(),
                quantity,
                factory,
            },
        );
    }

    /// Check whether a model name is registered for a slot.
    pub fn is_registered(&self, kind: DeviceKind, name: &str) -> bool {
        let key = normalize_name(name);
        match kind {
            DeviceKind::Controller => self.controllers.contains_key(&key),
            DeviceKind::Sensor => self.sensors.contains_key(&key),
        }
    }

    /// Display names of registered models, optionally limited to one
    /// quantity, sorted.
    pub fn registered(&self, kind: DeviceKind, quantity: Option<Quantity>) -> Vec<String> {
        let keep = |q: Quantity| quantity.map_or(true, |wanted| wanted == q);
        let mut names: Vec<String> = match kind {
            DeviceKind::Controller => self
                .controllers
                .values()
                .filter(|e| keep(e.quantity))
                .map(|e| e.name.clone())
                .collect(),
            DeviceKind::Sensor => self
                .sensors
                .values()
                .filter(|e| keep(e.quantity))
                .map(|e| e.name.clone())
                .collect(),
        };
        names.sort();
        names
    }

    /// Instantiate a controller backend by model name.
    pub fn build_controller(
        &self,
        name: &str,
        connection: &Connection,
    ) -> DynResult<Arc<dyn Controller>> {
        let entry = self
            .controllers
            .get(&normalize_name(name))
            .ok_or_else(|| format!("Unknown controller: {}", name))?;
        (entry.factory)(connection)
    }

    /// Instantiate a sensor backend by model name.
    pub fn build_sensor(&self, name: &str, connection: &Connection) -> DynResult<Arc<dyn Sensor>> {
        let entry = self
            .sensors
            .get(&normalize_name(name))
            .ok_or_else(|| format!("Unknown sensor: {}", name))?;
        (entry.factory)(connection)
    }
}

/// Register all built-in backends enabled by features on a context.
pub fn register_builtin_backends_on(context: &mut RegistrationContext, heater: HeaterSettings) {
    context.register_controller(
        "Test Controller",
        Quantity::Temperature,
        controller_factory(|_| Ok(Arc::new(TestController::new()) as Arc<dyn Controller>)),
    );
    context.register_controller(
        "Nice Test Controller",
        Quantity::Temperature,
        controller_factory(|_| Ok(Arc::new(NiceTestController::new()) as Arc<dyn Controller>)),
    );
    context.register_controller(
        "Faulty Test Controller",
        Quantity::Temperature,
        controller_factory(|_| Ok(Arc::new(FaultyTestController::new()) as Arc<dyn Controller>)),
    );
    context.register_controller(
        "Resistive Heater Simulated",
        Quantity::Temperature,
        controller_factory(move |_| {
            let supply = Box::new(SimulatedSupply::new(heater.cold_resistance));
            let device = ResistiveHeater::start(
                "Resistive Heater Simulated",
                supply,
                heater,
                elchi_core::device::DeviceAccess::Simulated,
            )?;
            Ok(Arc::new(device) as Arc<dyn Controller>)
        }),
    );
    context.register_sensor(
        "Test Sensor",
        Quantity::Temperature,
        sensor_factory(|_| Ok(Arc::new(TestSensor::new(Quantity::Temperature)) as Arc<dyn Sensor>)),
    );
    context.register_sensor(
        "Test Sensor Voltage",
        Quantity::Voltage,
        sensor_factory(|_| Ok(Arc::new(TestSensor::new(Quantity::Voltage)) as Arc<dyn Sensor>)),
    );
    #[cfg(feature = "serial")]
    register_serial_backends_on(context, heater);
}

#[cfg(feature = "serial")]
fn register_serial_backends_on(context: &mut RegistrationContext, heater: HeaterSettings) {
    context.register_controller(
        "Resistive Heater Tenma",
        Quantity::Temperature,
        controller_factory(move |conn| {
            let path = conn.require_port("Resistive Heater Tenma")?;
            let baud = conn.baud.unwrap_or(Tenma::DEFAULT_BAUD);
            let supply = Box::new(Tenma::open(path, baud)?);
            let device = ResistiveHeater::start(
                "Resistive Heater Tenma",
                supply,
                heater,
                elchi_core::device::DeviceAccess::Serial {
                    path: path.to_string(),
                    baud,
                },
            )?;
            Ok(Arc::new(device) as Arc<dyn Controller>)
        }),
    );
    context.register_sensor(
        "Thermolino",
        Quantity::Temperature,
        sensor_factory(|conn| {
            let path = conn.require_port("Thermolino")?;
            Ok(Arc::new(ScpiThermometer::thermolino(path, conn.baud)?) as Arc<dyn Sensor>)
        }),
    );
    context.register_sensor(
        "Thermoplatino",
        Quantity::Temperature,
        sensor_factory(|conn| {
            let path = conn.require_port("Thermoplatino")?;
            Ok(Arc::new(ScpiThermometer::thermoplatino(path, conn.baud)?) as Arc<dyn Sensor>)
        }),
    );
}

/// Serial ports available for device connections.
pub fn available_ports() -> Vec<String> {
    #[cfg(feature = "serial")]
    {
        elchi_backend_serial::available_ports()
    }
    #[cfg(not(feature = "serial"))]
    {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builtin() -> RegistrationContext {
        let mut ctx = RegistrationContext::new();
        register_builtin_backends_on(&mut ctx, HeaterSettings::default());
        ctx
    }

    #[test]
    fn test_lookup_ignores_case_and_punctuation() {
        let ctx = builtin();
        assert!(ctx.is_registered(DeviceKind::Controller, "test-controller"));
        assert!(ctx.is_registered(DeviceKind::Sensor, "TEST SENSOR"));
        assert!(!ctx.is_registered(DeviceKind::Sensor, "Test Controller"));
    }

    #[test]
    fn test_listing_by_quantity() {
        let ctx = builtin();
        let voltage = ctx.registered(DeviceKind::Sensor, Some(Quantity::Voltage));
        assert_eq!(voltage, vec!["Test Sensor Voltage".to_string()]);
        let controllers = ctx.registered(DeviceKind::Controller, None);
        assert!(controllers.contains(&"Nice Test Controller".to_string()));
        assert!(controllers.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_build_simulated_devices() {
        let ctx = builtin();
        let ctl = ctx
            .build_controller("Test Controller", &Connection::default())
            .unwrap();
        assert_eq!(ctl.info().model, "Test Controller");
        let sensor = ctx.build_sensor("Test Sensor", &Connection::default()).unwrap();
        assert!(sensor.sensor_value().is_ok());
    }

    #[test]
    fn test_unknown_model() {
        let ctx = builtin();
        let err = ctx
            .build_controller("Eurotherm 3216", &Connection::default())
            .err()
            .unwrap();
        assert!(err.to_string().contains("Unknown controller"));
    }

    #[cfg(feature = "serial")]
    #[test]
    fn test_serial_models_need_a_port() {
        let ctx = builtin();
        let err = ctx
            .build_sensor("Thermolino", &Connection::default())
            .err()
            .unwrap();
        assert!(err.to_string().contains("needs a serial port"));
    }
}

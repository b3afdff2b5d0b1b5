//! In-process simulated devices for CI/CD testing without physical hardware.
//!
//! [`SimDriver`] implements [`DeviceDriver`] with plausible device state and
//! records every command it receives.  Each driver comes with a
//! [`SimProbe`] that tests use to inspect the command log, inject faults and
//! feed sensor readings.  [`SimRegistry`] builds a fully connected
//! [`DeviceRegistry`] out of simulated devices.
//!
//! # Example
//!
//! ```rust
//! use photon_hal::sim::SimRegistry;
//! use photon_types::DeviceCommand;
//!
//! let devices = SimRegistry::new()
//!     .with_laser()
//!     .with_actuator()
//!     .build()
//!     .expect("sim devices must connect");
//!
//! let laser = devices.registry.laser().expect("laser registered");
//! laser.enable_output().unwrap();
//! laser.disable_output().unwrap();
//!
//! let probe = devices.probe("laser").unwrap();
//! assert_eq!(probe.count(|c| *c == DeviceCommand::DisableOutput), 1);
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use photon_types::{DeviceCommand, DeviceKind, DeviceResponse, DeviceStatus, PhotonError};

use crate::channel::{ChannelConfig, DeviceChannel, ValueRange};
use crate::driver::DeviceDriver;
use crate::registry::DeviceRegistry;

// ────────────────────────────────────────────────────────────────────────────
// Fault injection
// ────────────────────────────────────────────────────────────────────────────

/// Failure a [`SimDriver`] can be told to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimFault {
    /// The command is not delivered; [`PhotonError::Connection`].
    Disconnected,
    /// The command is applied but never acknowledged;
    /// [`PhotonError::CommandTimeout`] after the full timeout.
    Timeout,
}

#[derive(Default)]
struct SimState {
    log: Vec<DeviceCommand>,
    connected: bool,
    output_enabled: bool,
    value: f64,
    latency: Duration,
    one_shot: VecDeque<SimFault>,
    persistent: Option<SimFault>,
}

// ────────────────────────────────────────────────────────────────────────────
// SimDriver
// ────────────────────────────────────────────────────────────────────────────

/// A simulated device that records every delivered command.
pub struct SimDriver {
    id: String,
    kind: DeviceKind,
    state: Arc<Mutex<SimState>>,
}

impl SimDriver {
    /// Create a disconnected simulated device and the probe observing it.
    pub fn new(id: impl Into<String>, kind: DeviceKind) -> (Box<Self>, SimProbe) {
        let state = Arc::new(Mutex::new(SimState::default()));
        let probe = SimProbe {
            state: Arc::clone(&state),
        };
        (
            Box::new(Self {
                id: id.into(),
                kind,
                state,
            }),
            probe,
        )
    }

    fn timeout_error(&self, timeout: Duration) -> PhotonError {
        PhotonError::CommandTimeout {
            device: self.id.clone(),
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        }
    }
}

impl DeviceDriver for SimDriver {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> DeviceKind {
        self.kind
    }

    fn execute(
        &mut self,
        command: DeviceCommand,
        timeout: Duration,
    ) -> Result<DeviceResponse, PhotonError> {
        let (fault, latency) = {
            let mut state = self.state.lock();
            let fault = state.one_shot.pop_front().or(state.persistent);
            (fault, state.latency)
        };

        if fault == Some(SimFault::Disconnected) {
            return Err(PhotonError::Connection {
                device: self.id.clone(),
                details: "link down".to_string(),
            });
        }

        let response = {
            let mut state = self.state.lock();
            if !state.connected && command != DeviceCommand::Connect {
                return Err(PhotonError::Connection {
                    device: self.id.clone(),
                    details: "not connected".to_string(),
                });
            }
            state.log.push(command.clone());
            match command {
                DeviceCommand::Connect => {
                    state.connected = true;
                    DeviceResponse::Ack
                }
                DeviceCommand::Disconnect => {
                    state.connected = false;
                    DeviceResponse::Ack
                }
                DeviceCommand::SetValue(v) => {
                    state.value = v;
                    DeviceResponse::Ack
                }
                DeviceCommand::ReadValue => DeviceResponse::Value(state.value),
                DeviceCommand::EnableOutput => {
                    state.output_enabled = true;
                    DeviceResponse::Ack
                }
                DeviceCommand::DisableOutput => {
                    state.output_enabled = false;
                    DeviceResponse::Ack
                }
                DeviceCommand::GetStatus => DeviceResponse::Status(DeviceStatus {
                    connected: state.connected,
                    output_enabled: state.output_enabled,
                    value: state.value,
                    fault: None,
                }),
                DeviceCommand::Heartbeat { .. } => DeviceResponse::Ack,
            }
        };

        // The command has been applied; now model the round-trip.
        if fault == Some(SimFault::Timeout) || latency > timeout {
            thread::sleep(timeout);
            return Err(self.timeout_error(timeout));
        }
        if !latency.is_zero() {
            thread::sleep(latency);
        }
        Ok(response)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// SimProbe
// ────────────────────────────────────────────────────────────────────────────

/// Test-side handle onto a [`SimDriver`]'s state.
#[derive(Clone)]
pub struct SimProbe {
    state: Arc<Mutex<SimState>>,
}

impl SimProbe {
    /// Every command delivered to the device, oldest first.
    pub fn commands(&self) -> Vec<DeviceCommand> {
        self.state.lock().log.clone()
    }

    /// Number of delivered commands matching `predicate`.
    pub fn count<F>(&self, predicate: F) -> usize
    where
        F: Fn(&DeviceCommand) -> bool,
    {
        self.state.lock().log.iter().filter(|c| predicate(c)).count()
    }

    pub fn clear_log(&self) {
        self.state.lock().log.clear();
    }

    pub fn connected(&self) -> bool {
        self.state.lock().connected
    }

    pub fn output_enabled(&self) -> bool {
        self.state.lock().output_enabled
    }

    pub fn value(&self) -> f64 {
        self.state.lock().value
    }

    /// Set the value the device will report on the next `ReadValue`.
    pub fn set_reading(&self, value: f64) {
        self.state.lock().value = value;
    }

    /// Fail the next command with `fault`.  Calls queue up.
    pub fn fail_next(&self, fault: SimFault) {
        self.state.lock().one_shot.push_back(fault);
    }

    /// Fail every command with `fault` until cleared with `None`.
    pub fn set_fault(&self, fault: Option<SimFault>) {
        self.state.lock().persistent = fault;
    }

    /// Delay every response by `latency`; responses slower than the
    /// caller's timeout become [`PhotonError::CommandTimeout`].
    pub fn set_latency(&self, latency: Duration) {
        self.state.lock().latency = latency;
    }
}

// ────────────────────────────────────────────────────────────────────────────
// SimRegistry builder
// ────────────────────────────────────────────────────────────────────────────

/// A connected registry of simulated devices plus their probes.
pub struct SimDevices {
    pub registry: DeviceRegistry,
    probes: HashMap<String, SimProbe>,
}

impl SimDevices {
    /// Probe for the simulated device `id`.
    pub fn probe(&self, id: &str) -> Option<SimProbe> {
        self.probes.get(id).cloned()
    }
}

/// Builder that constructs a [`DeviceRegistry`] pre-populated with
/// simulated devices for headless CI/CD testing.
#[derive(Default)]
pub struct SimRegistry {
    devices: Vec<(Box<SimDriver>, ChannelConfig)>,
    probes: HashMap<String, SimProbe>,
}

impl SimRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Treatment laser `"laser"`, output level 0–10.
    pub fn with_laser(self) -> Self {
        self.with_device("laser", DeviceKind::Laser, ValueRange::new(0.0, 10.0))
    }

    /// Positioning stage `"actuator"`, travel ±50.
    pub fn with_actuator(self) -> Self {
        self.with_device("actuator", DeviceKind::Actuator, ValueRange::new(-50.0, 50.0))
    }

    /// Motor / interlock controller `"controller"` carrying the watchdog link.
    pub fn with_controller(self) -> Self {
        self.with_device("controller", DeviceKind::Controller, ValueRange::new(0.0, 1.0))
    }

    /// Aiming / room illumination `"illumination"`, 0–100 %.
    pub fn with_illumination(self) -> Self {
        self.with_device(
            "illumination",
            DeviceKind::Illumination,
            ValueRange::new(0.0, 100.0),
        )
    }

    /// Monitoring sensor with the given identifier.
    pub fn with_sensor(self, id: impl Into<String>) -> Self {
        self.with_device(id, DeviceKind::Sensor, ValueRange::unbounded())
    }

    /// Register a simulated device with a custom range.
    pub fn with_device(mut self, id: impl Into<String>, kind: DeviceKind, range: ValueRange) -> Self {
        let id = id.into();
        let (driver, probe) = SimDriver::new(id.clone(), kind);
        self.probes.insert(id, probe);
        self.devices.push((
            driver,
            ChannelConfig {
                range,
                ..ChannelConfig::default()
            },
        ));
        self
    }

    /// Override the command timeout of every device added so far.
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        for (_, config) in &mut self.devices {
            config.command_timeout = timeout;
        }
        self
    }

    /// Consume the builder, connect every device and return the registry.
    ///
    /// # Errors
    ///
    /// Propagates the first connection failure.
    pub fn build(self) -> Result<SimDevices, PhotonError> {
        let mut registry = DeviceRegistry::new();
        for (driver, config) in self.devices {
            registry.register(DeviceChannel::new(driver, config));
        }
        registry.connect_all()?;
        Ok(SimDevices {
            registry,
            probes: self.probes,
        })
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sim_driver_rejects_commands_until_connected() {
        let (mut driver, probe) = SimDriver::new("stage", DeviceKind::Actuator);
        let t = Duration::from_millis(10);
        assert!(matches!(
            driver.execute(DeviceCommand::SetValue(1.0), t),
            Err(PhotonError::Connection { .. })
        ));
        driver.execute(DeviceCommand::Connect, t).unwrap();
        driver.execute(DeviceCommand::SetValue(1.0), t).unwrap();
        assert_eq!(probe.value(), 1.0);
        assert_eq!(
            probe.commands(),
            vec![DeviceCommand::Connect, DeviceCommand::SetValue(1.0)]
        );
    }

    #[test]
    fn one_shot_faults_are_consumed_in_order() {
        let (mut driver, probe) = SimDriver::new("stage", DeviceKind::Actuator);
        let t = Duration::from_millis(5);
        driver.execute(DeviceCommand::Connect, t).unwrap();
        probe.fail_next(SimFault::Disconnected);
        probe.fail_next(SimFault::Timeout);

        assert!(matches!(
            driver.execute(DeviceCommand::ReadValue, t),
            Err(PhotonError::Connection { .. })
        ));
        assert!(matches!(
            driver.execute(DeviceCommand::ReadValue, t),
            Err(PhotonError::CommandTimeout { .. })
        ));
        assert!(driver.execute(DeviceCommand::ReadValue, t).is_ok());
    }

    #[test]
    fn timed_out_command_is_still_applied() {
        let (mut driver, probe) = SimDriver::new("laser", DeviceKind::Laser);
        let t = Duration::from_millis(5);
        driver.execute(DeviceCommand::Connect, t).unwrap();
        probe.fail_next(SimFault::Timeout);
        assert!(driver.execute(DeviceCommand::EnableOutput, t).is_err());
        assert!(probe.output_enabled());
    }

    #[test]
    fn persistent_fault_until_cleared() {
        let (mut driver, probe) = SimDriver::new("controller", DeviceKind::Controller);
        let t = Duration::from_millis(5);
        driver.execute(DeviceCommand::Connect, t).unwrap();
        probe.set_fault(Some(SimFault::Disconnected));
        for seq in 0..3 {
            assert!(driver.execute(DeviceCommand::Heartbeat { sequence: seq }, t).is_err());
        }
        probe.set_fault(None);
        assert!(driver.execute(DeviceCommand::Heartbeat { sequence: 3 }, t).is_ok());
    }

    #[test]
    fn sim_registry_full_stack_no_hardware_required() {
        let devices = SimRegistry::new()
            .with_laser()
            .with_actuator()
            .with_controller()
            .with_illumination()
            .with_sensor("skin_contact")
            .build()
            .expect("sim devices must connect");

        for id in ["laser", "actuator", "controller", "illumination", "skin_contact"] {
            let probe = devices.probe(id).expect("probe exists");
            assert!(probe.connected(), "{id} must be connected");
        }

        let stage = devices.registry.by_kind(DeviceKind::Actuator).unwrap();
        assert_eq!(stage.set_value(12.5).unwrap(), 12.5);
        assert!(stage.set_value(80.0).is_err());
    }

    #[test]
    fn sensor_reading_is_reported() {
        let devices = SimRegistry::new().with_sensor("vibration").build().unwrap();
        let probe = devices.probe("vibration").unwrap();
        probe.set_reading(0.42);
        let sensor = devices.registry.get("vibration").unwrap();
        assert_eq!(sensor.read_value().unwrap(), 0.42);
    }
}

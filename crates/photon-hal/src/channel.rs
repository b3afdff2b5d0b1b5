//! [`DeviceChannel`] – the locked command channel in front of one device.
//!
//! A channel owns its [`DeviceDriver`] exclusively and guards every call with
//! a per-device [`ReentrantMutex`].  The lock is reentrant so composite
//! operations (set a value, then read it back) can hold it across several
//! driver calls while still reusing the single-command helpers.
//!
//! Unrelated devices never share a lock: the sensor monitor polling the
//! contact probe does not wait for the engine moving the stage.
//!
//! # Notifications
//!
//! [`DeviceEvent`]s are delivered to listeners only **after** the lock has
//! been released, so a listener that reacts by calling back into the same
//! channel (e.g. reading the new value) cannot deadlock against it.
//!
//! # Example
//!
//! ```
//! use photon_hal::channel::{ChannelConfig, DeviceChannel, ValueRange};
//! use photon_hal::sim::SimDriver;
//! use photon_types::DeviceKind;
//!
//! let (driver, _probe) = SimDriver::new("laser", DeviceKind::Laser);
//! let laser = DeviceChannel::new(driver, ChannelConfig {
//!     range: ValueRange::new(0.0, 10.0),
//!     ..ChannelConfig::default()
//! });
//!
//! laser.connect().unwrap();
//! assert_eq!(laser.set_value(2.5).unwrap(), 2.5);
//! assert!(laser.set_value(12.0).is_err()); // outside the device range
//! laser.disable_output().unwrap();
//! ```

use std::cell::RefCell;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{ReentrantMutex, RwLock};
use photon_types::{
    DeviceCommand, DeviceEvent, DeviceKind, DeviceResponse, DeviceStatus, PhotonError,
};
use tracing::{debug, warn};

use crate::driver::DeviceDriver;

/// Default bound on a single driver round-trip.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_millis(500);

// ────────────────────────────────────────────────────────────────────────────
// Configuration
// ────────────────────────────────────────────────────────────────────────────

/// Inclusive range of values a device accepts for `set_value`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValueRange {
    pub min: f64,
    pub max: f64,
}

impl ValueRange {
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    /// Accepts every finite value.
    pub fn unbounded() -> Self {
        Self {
            min: f64::MIN,
            max: f64::MAX,
        }
    }

    pub fn contains(&self, value: f64) -> bool {
        value.is_finite() && value >= self.min && value <= self.max
    }

    /// Return [`PhotonError::Validation`] when `value` is outside the range.
    pub fn check(&self, device: &str, value: f64) -> Result<(), PhotonError> {
        if self.contains(value) {
            Ok(())
        } else {
            Err(PhotonError::Validation(format!(
                "{device}: value {value} out of [{}, {}]",
                self.min, self.max
            )))
        }
    }
}

impl Default for ValueRange {
    fn default() -> Self {
        Self::unbounded()
    }
}

/// Per-channel settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChannelConfig {
    /// Values accepted by `set_value`.
    pub range: ValueRange,
    /// Bound on every driver round-trip.
    pub command_timeout: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            range: ValueRange::unbounded(),
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }
}

/// Callback invoked with `(device_id, event)` after the channel lock has
/// been released.
pub type DeviceListener = Arc<dyn Fn(&str, &DeviceEvent) + Send + Sync>;

// ────────────────────────────────────────────────────────────────────────────
// DeviceChannel
// ────────────────────────────────────────────────────────────────────────────

/// Serialised, typed access to one physical device.
///
/// Shared as `Arc<DeviceChannel>`; the arbiter, engine and monitors hold
/// references, never the driver itself.
pub struct DeviceChannel {
    id: String,
    kind: DeviceKind,
    config: ChannelConfig,
    driver: ReentrantMutex<RefCell<Box<dyn DeviceDriver>>>,
    listeners: RwLock<Vec<DeviceListener>>,
}

impl DeviceChannel {
    /// Wrap `driver`.  The channel takes over the driver's id and kind.
    pub fn new(driver: Box<dyn DeviceDriver>, config: ChannelConfig) -> Self {
        Self {
            id: driver.id().to_string(),
            kind: driver.kind(),
            config,
            driver: ReentrantMutex::new(RefCell::new(driver)),
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> DeviceKind {
        self.kind
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    /// Register a listener for [`DeviceEvent`]s.
    pub fn subscribe<F>(&self, listener: F)
    where
        F: Fn(&str, &DeviceEvent) + Send + Sync + 'static,
    {
        self.listeners.write().push(Arc::new(listener));
    }

    // -----------------------------------------------------------------------
    // Device surface
    // -----------------------------------------------------------------------

    /// Open the underlying connection.
    pub fn connect(&self) -> Result<(), PhotonError> {
        let result = self.command(DeviceCommand::Connect).map(drop);
        self.finish(result, DeviceEvent::Connected)
    }

    /// Close the underlying connection.  Does not touch output state.
    pub fn disconnect(&self) -> Result<(), PhotonError> {
        let result = self.command(DeviceCommand::Disconnect).map(drop);
        self.finish(result, DeviceEvent::Disconnected)
    }

    /// Apply `value` and return the device's read-back.
    ///
    /// The set and the read-back happen under one lock acquisition, so no
    /// other caller can interleave a command between them.
    ///
    /// # Errors
    ///
    /// [`PhotonError::Validation`] (nothing sent) when `value` is outside
    /// the channel range; driver errors otherwise.
    pub fn set_value(&self, value: f64) -> Result<f64, PhotonError> {
        self.config.range.check(&self.id, value)?;
        let result = {
            let _guard = self.driver.lock();
            self.command(DeviceCommand::SetValue(value))
                .and_then(|_| self.read_back())
        };
        match result {
            Ok(readback) => {
                self.emit(DeviceEvent::ValueChanged(readback));
                Ok(readback)
            }
            Err(e) => {
                self.emit(DeviceEvent::Fault(e.to_string()));
                Err(e)
            }
        }
    }

    /// Read the device's current value (position, level, sensor reading).
    pub fn read_value(&self) -> Result<f64, PhotonError> {
        self.read_back()
    }

    /// Switch hazardous output on.
    pub fn enable_output(&self) -> Result<(), PhotonError> {
        let result = self.command(DeviceCommand::EnableOutput).map(drop);
        self.finish(result, DeviceEvent::OutputEnabled)
    }

    /// Switch output off.  Independent of `disconnect`: the connection stays
    /// open so the device can still be diagnosed.
    pub fn disable_output(&self) -> Result<(), PhotonError> {
        let result = self.command(DeviceCommand::DisableOutput).map(drop);
        if let Err(e) = &result {
            warn!(device = %self.id, error = %e, "disable_output failed");
        }
        self.finish(result, DeviceEvent::OutputDisabled)
    }

    /// Query the device status block.
    pub fn get_status(&self) -> Result<DeviceStatus, PhotonError> {
        match self.command(DeviceCommand::GetStatus)? {
            DeviceResponse::Status(status) => Ok(status),
            other => Err(self.unexpected(&other)),
        }
    }

    /// Send one watchdog liveness message, waiting at most `ack_timeout`
    /// for the acknowledgement.
    pub fn heartbeat(&self, sequence: u32, ack_timeout: Duration) -> Result<(), PhotonError> {
        self.command_within(DeviceCommand::Heartbeat { sequence }, ack_timeout)
            .map(drop)
    }

    // -----------------------------------------------------------------------
    // Internal helpers
    // -----------------------------------------------------------------------

    fn command(&self, command: DeviceCommand) -> Result<DeviceResponse, PhotonError> {
        self.command_within(command, self.config.command_timeout)
    }

    // Every driver call funnels through here; the guard nests when a
    // composite operation already holds the lock.
    fn command_within(
        &self,
        command: DeviceCommand,
        timeout: Duration,
    ) -> Result<DeviceResponse, PhotonError> {
        let guard = self.driver.lock();
        debug!(device = %self.id, ?command, "device command");
        guard.borrow_mut().execute(command, timeout)
    }

    fn read_back(&self) -> Result<f64, PhotonError> {
        match self.command(DeviceCommand::ReadValue)? {
            DeviceResponse::Value(v) => Ok(v),
            other => Err(self.unexpected(&other)),
        }
    }

    fn unexpected(&self, response: &DeviceResponse) -> PhotonError {
        PhotonError::Connection {
            device: self.id.clone(),
            details: format!("unexpected response {response:?}"),
        }
    }

    fn finish(&self, result: Result<(), PhotonError>, on_ok: DeviceEvent) -> Result<(), PhotonError> {
        match &result {
            Ok(()) => self.emit(on_ok),
            Err(e) => self.emit(DeviceEvent::Fault(e.to_string())),
        }
        result
    }

    // Listeners are cloned out so none of our locks is held while they run.
    fn emit(&self, event: DeviceEvent) {
        let listeners: Vec<DeviceListener> = self.listeners.read().clone();
        for listener in listeners {
            listener(&self.id, &event);
        }
    }
}

impl std::fmt::Debug for DeviceChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceChannel")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("config", &self.config)
            .finish()
    }
}

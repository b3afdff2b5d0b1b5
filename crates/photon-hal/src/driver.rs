//! Generic `DeviceDriver` trait: the seam between the safety core and the
//! vendor-specific wire protocol of each physical device.
//!
//! Drivers translate logical [`DeviceCommand`]s into bytes on a serial port,
//! USB endpoint or fieldbus and translate the reply back into a
//! [`DeviceResponse`].  The rest of the system never talks to a driver
//! directly; it goes through a [`DeviceChannel`][crate::channel::DeviceChannel]
//! which owns the driver exclusively and serialises every call.

use std::time::Duration;

use photon_types::{DeviceCommand, DeviceKind, DeviceResponse, PhotonError};

/// A physical device reachable over its own exclusive connection.
///
/// `Send` but deliberately not `Sync`: a driver is only ever touched by one
/// thread at a time, under the owning channel's lock.
pub trait DeviceDriver: Send {
    /// Stable identifier for this device, e.g. `"laser"` or `"stage_x"`.
    fn id(&self) -> &str;

    /// Role of the device on the platform.
    fn kind(&self) -> DeviceKind;

    /// Send `command` and wait at most `timeout` for the response.
    ///
    /// # Errors
    ///
    /// - [`PhotonError::Connection`] when the link is down and the command
    ///   was not delivered.
    /// - [`PhotonError::CommandTimeout`] when no response arrived in time;
    ///   the device may or may not have applied the command.
    fn execute(
        &mut self,
        command: DeviceCommand,
        timeout: Duration,
    ) -> Result<DeviceResponse, PhotonError>;
}

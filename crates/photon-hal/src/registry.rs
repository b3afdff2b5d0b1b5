//! [`DeviceRegistry`] – central device channel registry.
//!
//! The registry stores one [`DeviceChannel`] per physical device, keyed by
//! the device identifier, and remembers which channel serves each
//! [`DeviceKind`] role.  The protocol engine resolves action handlers
//! through [`DeviceRegistry::by_kind`]; the watchdog bridge and the laser
//! cutoff fetch the laser through [`DeviceRegistry::laser`].
//!
//! The first channel registered for a role serves that role unless
//! [`DeviceRegistry::assign_role`] says otherwise.

use std::collections::HashMap;
use std::sync::Arc;

use photon_types::{DeviceKind, PhotonError};
use tracing::{info, warn};

use crate::channel::DeviceChannel;

/// Central device channel registry.
#[derive(Default)]
pub struct DeviceRegistry {
    channels: HashMap<String, Arc<DeviceChannel>>,
    roles: HashMap<DeviceKind, String>,
}

impl DeviceRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a channel.  Any previously registered channel with the same
    /// id is replaced.  Returns the shared handle.
    pub fn register(&mut self, channel: DeviceChannel) -> Arc<DeviceChannel> {
        let channel = Arc::new(channel);
        let id = channel.id().to_string();
        self.roles.entry(channel.kind()).or_insert_with(|| id.clone());
        self.channels.insert(id, Arc::clone(&channel));
        channel
    }

    /// Make the channel `id` serve `kind`.
    ///
    /// # Errors
    ///
    /// [`PhotonError::Validation`] when `id` is not registered.
    pub fn assign_role(&mut self, kind: DeviceKind, id: &str) -> Result<(), PhotonError> {
        if !self.channels.contains_key(id) {
            return Err(PhotonError::Validation(format!(
                "device '{id}' is not registered"
            )));
        }
        self.roles.insert(kind, id.to_string());
        Ok(())
    }

    /// Channel registered under `id`.
    pub fn get(&self, id: &str) -> Option<Arc<DeviceChannel>> {
        self.channels.get(id).cloned()
    }

    /// Channel serving `kind`.
    pub fn by_kind(&self, kind: DeviceKind) -> Option<Arc<DeviceChannel>> {
        self.roles.get(&kind).and_then(|id| self.get(id))
    }

    /// The treatment laser channel.
    pub fn laser(&self) -> Option<Arc<DeviceChannel>> {
        self.by_kind(DeviceKind::Laser)
    }

    /// All registered channels, in no particular order.
    pub fn channels(&self) -> impl Iterator<Item = &Arc<DeviceChannel>> {
        self.channels.values()
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Connect every registered channel.
    ///
    /// # Errors
    ///
    /// Returns the first failure after attempting every channel.
    pub fn connect_all(&self) -> Result<(), PhotonError> {
        let mut first_err = None;
        for channel in self.channels.values() {
            match channel.connect() {
                Ok(()) => info!(device = %channel.id(), kind = %channel.kind(), "device connected"),
                Err(e) => {
                    warn!(device = %channel.id(), error = %e, "device failed to connect");
                    first_err.get_or_insert(e);
                }
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Disable the laser output, then disconnect every channel.
    ///
    /// # Errors
    ///
    /// Returns the first failure after attempting every channel.
    pub fn shutdown(&self) -> Result<(), PhotonError> {
        let mut first_err = None;
        if let Some(laser) = self.laser()
            && let Err(e) = laser.disable_output()
        {
            first_err = Some(e);
        }
        for channel in self.channels.values() {
            if let Err(e) = channel.disconnect() {
                warn!(device = %channel.id(), error = %e, "device failed to disconnect");
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelConfig;
    use crate::sim::{SimDriver, SimRegistry};
    use photon_types::DeviceCommand;

    fn channel(id: &str, kind: DeviceKind) -> DeviceChannel {
        let (driver, _probe) = SimDriver::new(id, kind);
        DeviceChannel::new(driver, ChannelConfig::default())
    }

    #[test]
    fn first_channel_of_a_kind_serves_the_role() {
        let mut registry = DeviceRegistry::new();
        registry.register(channel("laser_a", DeviceKind::Laser));
        registry.register(channel("laser_b", DeviceKind::Laser));
        assert_eq!(registry.laser().unwrap().id(), "laser_a");
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn assign_role_switches_the_serving_channel() {
        let mut registry = DeviceRegistry::new();
        registry.register(channel("laser_a", DeviceKind::Laser));
        registry.register(channel("laser_b", DeviceKind::Laser));
        registry.assign_role(DeviceKind::Laser, "laser_b").unwrap();
        assert_eq!(registry.laser().unwrap().id(), "laser_b");
    }

    #[test]
    fn assign_role_to_unknown_device_is_rejected() {
        let mut registry = DeviceRegistry::new();
        assert!(matches!(
            registry.assign_role(DeviceKind::Laser, "ghost"),
            Err(PhotonError::Validation(_))
        ));
    }

    #[test]
    fn missing_role_returns_none() {
        let registry = DeviceRegistry::new();
        assert!(registry.laser().is_none());
        assert!(registry.by_kind(DeviceKind::Actuator).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn connect_all_reports_failures() {
        let mut registry = DeviceRegistry::new();
        let (driver, probe) = SimDriver::new("stage", DeviceKind::Actuator);
        probe.set_fault(Some(crate::sim::SimFault::Disconnected));
        registry.register(DeviceChannel::new(driver, ChannelConfig::default()));
        registry.register(channel("laser", DeviceKind::Laser));

        assert!(registry.connect_all().is_err());
        // The healthy device was still connected.
        assert!(registry.laser().unwrap().get_status().unwrap().connected);
    }

    #[test]
    fn shutdown_disables_laser_before_disconnecting() {
        let devices = SimRegistry::new().with_laser().with_actuator().build().unwrap();
        let probe = devices.probe("laser").unwrap();
        probe.clear_log();

        devices.registry.shutdown().unwrap();

        assert_eq!(
            probe.commands(),
            vec![DeviceCommand::DisableOutput, DeviceCommand::Disconnect]
        );
        assert!(!devices.probe("actuator").unwrap().connected());
    }
}

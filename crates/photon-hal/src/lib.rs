//! `photon-hal` – Device Command Channels
//!
//! Everything between the safety core and the wire.
//!
//! # Modules
//!
//! - [`driver`] – [`DeviceDriver`][driver::DeviceDriver]: the vendor seam.
//!   One implementation per hardware family translates logical commands into
//!   its own wire protocol.
//! - [`channel`] – [`DeviceChannel`][channel::DeviceChannel]: owns one driver
//!   behind a per-device reentrant lock, validates values against the device
//!   range and emits [`DeviceEvent`][photon_types::DeviceEvent]s after the
//!   lock is released.  `disable_output` is always callable on its own.
//! - [`registry`] – [`DeviceRegistry`][registry::DeviceRegistry]: channels by
//!   id and by [`DeviceKind`][photon_types::DeviceKind] role.
//! - [`sim`] – simulated drivers, probes and a registry builder for tests
//!   and headless runs.

pub mod channel;
pub mod driver;
pub mod registry;
pub mod sim;

pub use channel::{ChannelConfig, DeviceChannel, DeviceListener, ValueRange};
pub use driver::DeviceDriver;
pub use registry::DeviceRegistry;
pub use sim::{SimDevices, SimDriver, SimFault, SimProbe, SimRegistry};

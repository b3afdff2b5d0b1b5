//! `photon-kernel` – Safety Core
//!
//! Decides whether the laser may emit, and keeps deciding while it does.
//!
//! # Modules
//!
//! - [`arbiter`] – [`SafetyArbiter`][arbiter::SafetyArbiter]: fuses named
//!   interlock conditions and a latched emergency flag into one
//!   [`SafetyState`][photon_types::SafetyState].  The single source of truth
//!   every other component queries.
//! - [`cutoff`] – [`LaserCutoff`][cutoff::LaserCutoff]: arbiter subscriber
//!   that disables the laser channel on emergency stop.
//! - [`watchdog`] – [`WatchdogBridge`][watchdog::WatchdogBridge]: periodic
//!   heartbeat to the hardware watchdog; consecutive misses trip the
//!   emergency path.
//! - [`sensor_monitor`] – [`SensorMonitor`][sensor_monitor::SensorMonitor]:
//!   debounced sensor sampling feeding one arbiter condition.
//! - [`action_verifier`] – [`ActionVerifier`][action_verifier::ActionVerifier]:
//!   load-time rules every protocol action must satisfy.
//! - [`task`] – [`TaskHandle`][task::TaskHandle] for the periodic tasks.

pub mod action_verifier;
pub mod arbiter;
pub mod cutoff;
pub mod sensor_monitor;
pub mod task;
pub mod watchdog;

pub use action_verifier::{ActionVerifier, DwellLimitRule, OutputCapRule, Rule, TravelLimitRule};
pub use arbiter::{SafetyArbiter, SafetyListener, SubscriptionId};
pub use cutoff::LaserCutoff;
pub use sensor_monitor::{Debouncer, MonitorConfig, SensorMode, SensorMonitor};
pub use task::TaskHandle;
pub use watchdog::{HeartbeatOutcome, HeartbeatState, WatchdogBridge, WatchdogConfig};

//! [`LaserCutoff`] – disables the laser the moment the arbiter latches an
//! emergency stop.
//!
//! Only the laser channel is touched.  Actuator, sensors and illumination
//! stay connected so the operator can diagnose the fault.  Transitions to
//! `Unsafe` are left to whoever owns the laser at that moment (the protocol
//! engine disables it itself when its permission is revoked).

use std::sync::Arc;

use photon_hal::DeviceChannel;
use photon_types::SafetyState;
use tracing::error;

use crate::arbiter::{SafetyArbiter, SubscriptionId};

pub struct LaserCutoff;

impl LaserCutoff {
    /// Subscribe a cutoff for `laser` to `arbiter`.
    ///
    /// The disable call runs synchronously on the thread that latched the
    /// emergency, bounded by the laser channel's command timeout.
    pub fn install(arbiter: &SafetyArbiter, laser: Arc<DeviceChannel>) -> SubscriptionId {
        arbiter.subscribe(move |transition| {
            if transition.to == SafetyState::EmergencyStop
                && let Err(e) = laser.disable_output()
            {
                error!(device = %laser.id(), error = %e, "laser cutoff failed");
            }
        })
    }
}

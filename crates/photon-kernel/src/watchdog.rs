//! [`WatchdogBridge`] – heartbeat link to the hardware watchdog.
//!
//! The controller board runs a hardware watchdog that cuts laser power when
//! it stops hearing from the host.  The bridge feeds it a
//! [`DeviceCommand::Heartbeat`][photon_types::DeviceCommand::Heartbeat] every
//! [`WatchdogConfig::interval`] and, independently of the hardware, treats
//! missing acknowledgements as a fault of its own:
//!
//! | Event                              | Reaction                                    |
//! |------------------------------------|---------------------------------------------|
//! | ack received                       | failure count reset, `WatchdogAlive = true` |
//! | ack missing / link error           | failure count + 1, `WatchdogAlive = false`  |
//! | `max_failures` consecutive misses  | emergency stop, laser `disable_output`      |
//!
//! `max_failures` equals the hardware timeout multiple, so the host trips no
//! later than the hardware would.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use photon_hal::DeviceChannel;
use photon_types::{
    AuditEvent, AuditKind, EventSink, NullSink, PhotonError, SafetyCondition, Severity,
};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::arbiter::SafetyArbiter;
use crate::task::{TaskHandle, stopped};

// ────────────────────────────────────────────────────────────────────────────
// Configuration
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct WatchdogConfig {
    /// Heartbeat cadence.
    pub interval: Duration,
    /// Hardware timeout expressed in heartbeat intervals.
    pub timeout_multiple: u32,
    /// How long one heartbeat waits for its acknowledgement.
    pub ack_timeout: Duration,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self::with_interval(Duration::from_millis(500))
    }
}

impl WatchdogConfig {
    /// Config with a 2x hardware margin and an ack timeout of half the
    /// interval.
    pub fn with_interval(interval: Duration) -> Self {
        Self {
            interval,
            timeout_multiple: 2,
            ack_timeout: interval / 2,
        }
    }

    /// Window after which the hardware watchdog cuts power on its own.
    pub fn hardware_timeout(&self) -> Duration {
        self.interval * self.timeout_multiple
    }

    /// Consecutive misses that trip the bridge.
    pub fn max_failures(&self) -> u32 {
        self.timeout_multiple.max(1)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// State
// ────────────────────────────────────────────────────────────────────────────

/// Snapshot of the heartbeat bookkeeping.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HeartbeatState {
    pub last_success: Option<Instant>,
    pub consecutive_failures: u32,
    pub sequence: u32,
    /// `true` from the trip until the next acknowledged heartbeat.
    pub tripped: bool,
}

/// Result of one [`WatchdogBridge::tick`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    Acknowledged,
    Missed { consecutive: u32 },
    /// This miss reached `max_failures`; the emergency path has run.
    Tripped,
}

// ────────────────────────────────────────────────────────────────────────────
// WatchdogBridge
// ────────────────────────────────────────────────────────────────────────────

pub struct WatchdogBridge {
    link: Arc<DeviceChannel>,
    laser: Option<Arc<DeviceChannel>>,
    arbiter: Arc<SafetyArbiter>,
    config: WatchdogConfig,
    state: Mutex<HeartbeatState>,
    sink: Arc<dyn EventSink>,
}

impl WatchdogBridge {
    /// Heartbeat over `link` and report to `arbiter`.
    pub fn new(link: Arc<DeviceChannel>, arbiter: Arc<SafetyArbiter>, config: WatchdogConfig) -> Self {
        Self {
            link,
            laser: None,
            arbiter,
            config,
            state: Mutex::new(HeartbeatState::default()),
            sink: Arc::new(NullSink),
        }
    }

    /// Laser channel forced off when the bridge trips.
    pub fn with_laser(mut self, laser: Arc<DeviceChannel>) -> Self {
        self.laser = Some(laser);
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn config(&self) -> &WatchdogConfig {
        &self.config
    }

    pub fn state(&self) -> HeartbeatState {
        self.state.lock().clone()
    }

    /// Send one heartbeat and react to its outcome.
    pub async fn tick(&self) -> HeartbeatOutcome {
        let sequence = {
            let mut state = self.state.lock();
            state.sequence = state.sequence.wrapping_add(1);
            state.sequence
        };
        match self.send(sequence).await {
            Ok(()) => self.acknowledged(sequence),
            Err(e) => self.missed(sequence, e).await,
        }
    }

    /// Run [`tick`](Self::tick) every interval until shut down.  The first
    /// heartbeat goes out immediately.
    pub fn spawn(self: Arc<Self>) -> TaskHandle {
        TaskHandle::spawn("watchdog", move |mut shutdown| async move {
            let mut interval = tokio::time::interval(self.config.interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(
                interval_ms = self.config.interval.as_millis() as u64,
                hardware_timeout_ms = self.config.hardware_timeout().as_millis() as u64,
                "watchdog bridge started"
            );
            loop {
                tokio::select! {
                    _ = stopped(&mut shutdown) => break,
                    _ = interval.tick() => { self.tick().await; }
                }
            }
            info!("watchdog bridge stopped");
        })
    }

    // -----------------------------------------------------------------------
    // Internal helpers
    // -----------------------------------------------------------------------

    async fn send(&self, sequence: u32) -> Result<(), PhotonError> {
        let link = Arc::clone(&self.link);
        let ack = self.config.ack_timeout;
        let call = tokio::task::spawn_blocking(move || link.heartbeat(sequence, ack));
        match tokio::time::timeout(ack, call).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => Err(PhotonError::Connection {
                device: self.link.id().to_string(),
                details: format!("heartbeat task failed: {join}"),
            }),
            Err(_) => Err(PhotonError::CommandTimeout {
                device: self.link.id().to_string(),
                timeout_ms: ack.as_millis() as u64,
            }),
        }
    }

    fn acknowledged(&self, sequence: u32) -> HeartbeatOutcome {
        let restored = {
            let mut state = self.state.lock();
            let restored = state.consecutive_failures > 0;
            state.consecutive_failures = 0;
            state.tripped = false;
            state.last_success = Some(Instant::now());
            restored
        };
        debug!(sequence, "heartbeat acknowledged");
        self.set_alive(true);
        if restored {
            info!(sequence, "heartbeat restored");
            self.sink.record(AuditEvent::new(
                AuditKind::HeartbeatRestored,
                Severity::Info,
                format!("heartbeat {sequence} acknowledged on {}", self.link.id()),
            ));
        }
        HeartbeatOutcome::Acknowledged
    }

    async fn missed(&self, sequence: u32, cause: PhotonError) -> HeartbeatOutcome {
        let (consecutive, trip) = {
            let mut state = self.state.lock();
            state.consecutive_failures = state.consecutive_failures.saturating_add(1);
            let trip = !state.tripped && state.consecutive_failures >= self.config.max_failures();
            if trip {
                state.tripped = true;
            }
            (state.consecutive_failures, trip)
        };
        warn!(sequence, consecutive, error = %cause, "heartbeat missed");
        // Any miss revokes permission; `max_failures` only gates the latch.
        self.set_alive(false);

        if !trip {
            return HeartbeatOutcome::Missed { consecutive };
        }

        let reason = format!("watchdog heartbeat lost after {consecutive} consecutive misses");
        error!(%reason, "watchdog tripped");
        self.sink.record(AuditEvent::new(
            AuditKind::HeartbeatLost,
            Severity::Critical,
            format!("{reason}: {cause}"),
        ));

        // Both calls may block on device I/O through arbiter subscribers.
        let arbiter = Arc::clone(&self.arbiter);
        let laser = self.laser.clone();
        let shutdown = tokio::task::spawn_blocking(move || {
            arbiter.trigger_emergency_stop(&reason);
            laser.map(|l| l.disable_output())
        });
        match shutdown.await {
            Ok(Some(Err(e))) => error!(error = %e, "laser disable after watchdog trip failed"),
            Err(e) => error!(error = %e, "watchdog shutdown task failed"),
            Ok(_) => {}
        }
        HeartbeatOutcome::Tripped
    }

    fn set_alive(&self, alive: bool) {
        if !self.arbiter.tracks(&SafetyCondition::WatchdogAlive) {
            return;
        }
        if let Err(e) = self
            .arbiter
            .set_condition(SafetyCondition::WatchdogAlive, alive)
        {
            warn!(error = %e, "could not update watchdog condition");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use photon_hal::{SimDevices, SimFault, SimRegistry};
    use photon_types::{DeviceCommand, SafetyState};

    fn devices() -> SimDevices {
        SimRegistry::new()
            .with_laser()
            .with_actuator()
            .with_controller()
            .build()
            .unwrap()
    }

    fn safe_arbiter() -> Arc<SafetyArbiter> {
        let arbiter = SafetyArbiter::standard();
        arbiter.register_condition(SafetyCondition::WatchdogAlive);
        for c in SafetyCondition::standard() {
            arbiter.set_condition(c, true).unwrap();
        }
        Arc::new(arbiter)
    }

    fn bridge(devices: &SimDevices, arbiter: &Arc<SafetyArbiter>, interval_ms: u64) -> WatchdogBridge {
        let controller = devices.registry.get("controller").unwrap();
        WatchdogBridge::new(
            controller,
            Arc::clone(arbiter),
            WatchdogConfig::with_interval(Duration::from_millis(interval_ms)),
        )
        .with_laser(devices.registry.laser().unwrap())
    }

    #[test]
    fn default_config_matches_hardware_margin() {
        let config = WatchdogConfig::default();
        assert_eq!(config.interval, Duration::from_millis(500));
        assert_eq!(config.hardware_timeout(), Duration::from_millis(1000));
        assert_eq!(config.max_failures(), 2);
        assert!(config.ack_timeout < config.interval);
    }

    #[tokio::test]
    async fn acknowledged_heartbeat_marks_watchdog_alive() {
        let devices = devices();
        let arbiter = safe_arbiter();
        let bridge = bridge(&devices, &arbiter, 500);
        assert_eq!(arbiter.state(), SafetyState::Unsafe);

        assert_eq!(bridge.tick().await, HeartbeatOutcome::Acknowledged);
        assert_eq!(arbiter.state(), SafetyState::Safe);
        let state = bridge.state();
        assert_eq!(state.sequence, 1);
        assert!(state.last_success.is_some());
        let beats = devices
            .probe("controller")
            .unwrap()
            .count(|c| matches!(c, DeviceCommand::Heartbeat { sequence: 1 }));
        assert_eq!(beats, 1);
    }

    #[tokio::test]
    async fn single_miss_revokes_permission_without_tripping() {
        let devices = devices();
        let arbiter = safe_arbiter();
        let bridge = bridge(&devices, &arbiter, 500);
        bridge.tick().await;

        devices.probe("controller").unwrap().fail_next(SimFault::Disconnected);
        assert_eq!(bridge.tick().await, HeartbeatOutcome::Missed { consecutive: 1 });
        assert_eq!(arbiter.state(), SafetyState::Unsafe);
        assert!(!bridge.state().tripped);

        assert_eq!(bridge.tick().await, HeartbeatOutcome::Acknowledged);
        assert_eq!(arbiter.state(), SafetyState::Safe);
        assert_eq!(bridge.state().consecutive_failures, 0);
    }

    #[tokio::test]
    async fn consecutive_misses_trip_and_disable_only_the_laser() {
        let devices = devices();
        let arbiter = safe_arbiter();
        let bridge = bridge(&devices, &arbiter, 500);
        let laser = devices.probe("laser").unwrap();
        let actuator = devices.probe("actuator").unwrap();
        laser.clear_log();
        actuator.clear_log();

        devices.probe("controller").unwrap().set_fault(Some(SimFault::Disconnected));
        assert_eq!(bridge.tick().await, HeartbeatOutcome::Missed { consecutive: 1 });
        assert_eq!(bridge.tick().await, HeartbeatOutcome::Tripped);
        assert_eq!(arbiter.state(), SafetyState::EmergencyStop);
        assert_eq!(laser.commands(), vec![DeviceCommand::DisableOutput]);
        assert!(laser.connected());
        assert!(actuator.commands().is_empty());

        // Further misses do not re-run the emergency path.
        assert_eq!(bridge.tick().await, HeartbeatOutcome::Missed { consecutive: 3 });
        assert_eq!(laser.commands().len(), 1);
    }

    #[tokio::test]
    async fn slow_acknowledgement_counts_as_a_miss() {
        let devices = devices();
        let arbiter = safe_arbiter();
        let bridge = bridge(&devices, &arbiter, 100);
        devices
            .probe("controller")
            .unwrap()
            .set_latency(Duration::from_millis(200));
        assert_eq!(bridge.tick().await, HeartbeatOutcome::Missed { consecutive: 1 });
    }

    #[tokio::test]
    async fn lost_link_trips_before_the_hardware_window() {
        let devices = devices();
        let arbiter = safe_arbiter();
        devices.probe("controller").unwrap().set_fault(Some(SimFault::Disconnected));
        let bridge = Arc::new(bridge(&devices, &arbiter, 500));

        let started = Instant::now();
        let mut states = arbiter.watch();
        let handle = Arc::clone(&bridge).spawn();
        tokio::time::timeout(
            Duration::from_millis(1000),
            states.wait_for(|s| *s == SafetyState::EmergencyStop),
        )
        .await
        .expect("emergency stop within the hardware window")
        .unwrap();
        assert!(started.elapsed() < Duration::from_millis(1000));
        assert!(bridge.state().tripped);
        handle.shutdown().await;
    }
}

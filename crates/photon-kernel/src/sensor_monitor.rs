//! Debounced sensor sampling.
//!
//! A [`SensorMonitor`] polls one sensor channel on a fixed cadence, turns
//! each reading into a positive/negative sample, and feeds a [`Debouncer`].
//! The debounced value is pushed into the [`SafetyArbiter`] as one named
//! condition.
//!
//! Assertion and clearing are asymmetric: the condition becomes `true` only
//! after `threshold` consecutive positive samples and drops back to `false`
//! on the first negative one.  A read error is a negative sample.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use photon_hal::DeviceChannel;
use photon_types::{PhotonError, SafetyCondition};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::arbiter::SafetyArbiter;
use crate::task::{TaskHandle, stopped};

// ────────────────────────────────────────────────────────────────────────────
// Debouncer
// ────────────────────────────────────────────────────────────────────────────

/// Consecutive-sample filter.
///
/// ```
/// use photon_kernel::Debouncer;
///
/// let mut d = Debouncer::new(3);
/// assert!(!d.push(true));
/// assert!(!d.push(true));
/// assert!(d.push(true));
/// assert!(!d.push(false));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Debouncer {
    threshold: u32,
    consecutive: u32,
    asserted: bool,
}

impl Debouncer {
    /// A threshold of zero behaves like one.
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            consecutive: 0,
            asserted: false,
        }
    }

    /// Feed one sample and return the debounced value.
    pub fn push(&mut self, positive: bool) -> bool {
        if positive {
            self.consecutive = self.consecutive.saturating_add(1);
            if self.consecutive >= self.threshold {
                self.asserted = true;
            }
        } else {
            self.consecutive = 0;
            self.asserted = false;
        }
        self.asserted
    }

    pub fn is_asserted(&self) -> bool {
        self.asserted
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    pub fn reset(&mut self) {
        self.consecutive = 0;
        self.asserted = false;
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Sample conversion
// ────────────────────────────────────────────────────────────────────────────

/// How a raw reading becomes a sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SensorMode {
    /// Any non-zero reading is positive.
    Digital,
    /// `raw * calibration` in physical units, positive at or above
    /// `threshold`.
    Analog { calibration: f64, threshold: f64 },
}

impl SensorMode {
    pub fn is_positive(&self, raw: f64) -> bool {
        match *self {
            SensorMode::Digital => raw != 0.0,
            SensorMode::Analog {
                calibration,
                threshold,
            } => raw * calibration >= threshold,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MonitorConfig {
    pub interval: Duration,
    pub threshold: u32,
    pub mode: SensorMode,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(100),
            threshold: 3,
            mode: SensorMode::Digital,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// SensorMonitor
// ────────────────────────────────────────────────────────────────────────────

struct Filter {
    debouncer: Debouncer,
    pushed: Option<bool>,
}

/// Samples one sensor channel into one arbiter condition.
pub struct SensorMonitor {
    sensor: Arc<DeviceChannel>,
    condition: SafetyCondition,
    arbiter: Arc<SafetyArbiter>,
    config: MonitorConfig,
    filter: Mutex<Filter>,
}

impl SensorMonitor {
    /// Build a monitor and register `condition` with the arbiter (initially
    /// `false`).
    pub fn new(
        sensor: Arc<DeviceChannel>,
        condition: SafetyCondition,
        arbiter: Arc<SafetyArbiter>,
        config: MonitorConfig,
    ) -> Self {
        arbiter.register_condition(condition.clone());
        Self {
            sensor,
            condition,
            arbiter,
            filter: Mutex::new(Filter {
                debouncer: Debouncer::new(config.threshold),
                pushed: None,
            }),
            config,
        }
    }

    pub fn condition(&self) -> &SafetyCondition {
        &self.condition
    }

    /// Current debounced value.
    pub fn is_asserted(&self) -> bool {
        self.filter.lock().debouncer.is_asserted()
    }

    /// Feed one sample and push the debounced value to the arbiter when it
    /// changed.  Returns the debounced value.
    pub fn feed(&self, positive: bool) -> bool {
        let (value, changed) = {
            let mut filter = self.filter.lock();
            let value = filter.debouncer.push(positive);
            let changed = filter.pushed != Some(value);
            filter.pushed = Some(value);
            (value, changed)
        };
        if changed {
            debug!(condition = %self.condition, value, "debounced sensor changed");
            if let Err(e) = self.arbiter.set_condition(self.condition.clone(), value) {
                warn!(condition = %self.condition, error = %e, "sensor condition rejected");
            }
        }
        value
    }

    /// Read the sensor once and feed the result.
    pub async fn sample_once(&self) -> bool {
        let positive = match self.read().await {
            Ok(raw) => self.config.mode.is_positive(raw),
            Err(e) => {
                warn!(sensor = %self.sensor.id(), error = %e, "sensor read failed");
                false
            }
        };
        self.feed(positive)
    }

    /// Sample every interval until shut down.  The first sample is taken one
    /// interval after spawning.
    pub fn spawn(self: Arc<Self>) -> TaskHandle {
        let name = format!("sensor:{}", self.sensor.id());
        TaskHandle::spawn(name, move |mut shutdown| async move {
            let period = self.config.interval;
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(
                sensor = %self.sensor.id(),
                condition = %self.condition,
                threshold = self.config.threshold,
                "sensor monitor started"
            );
            loop {
                tokio::select! {
                    _ = stopped(&mut shutdown) => break,
                    _ = interval.tick() => { self.sample_once().await; }
                }
            }
        })
    }

    async fn read(&self) -> Result<f64, PhotonError> {
        let sensor = Arc::clone(&self.sensor);
        tokio::task::spawn_blocking(move || sensor.read_value())
            .await
            .map_err(|e| PhotonError::Connection {
                device: self.sensor.id().to_string(),
                details: format!("sensor read task failed: {e}"),
            })?
    }
}

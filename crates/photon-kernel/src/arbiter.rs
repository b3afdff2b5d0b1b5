//! [`SafetyArbiter`] – interlock fusion and the authoritative permission
//! state.
//!
//! Collaborators own individual [`SafetyCondition`]s (the interlock loop, the
//! session manager, the power limiter, sensor monitors, the watchdog bridge)
//! and push them in through [`SafetyArbiter::set_condition`].  The arbiter
//! recomputes the [`SafetyState`] from scratch on every mutation:
//!
//! 1. emergency flag set → [`SafetyState::EmergencyStop`]
//! 2. any condition false → [`SafetyState::Unsafe`]
//! 3. otherwise → [`SafetyState::Safe`] (or `Armed` / `Treating` when the
//!    operating mode says so)
//!
//! The order is fixed: an emergency raised while every condition is true is
//! still an emergency.
//!
//! # Notifications
//!
//! When the state changes the new value is stored first, then published on
//! a [`watch`] channel, then handed to every subscriber synchronously on the
//! calling thread with the internal lock released.  A subscriber observing
//! the callback therefore sees the new state through
//! [`SafetyArbiter::state`].  Transitions are delivered in the order they
//! occurred; a subscriber may call back into the arbiter.
//!
//! # Example
//!
//! ```
//! use photon_kernel::SafetyArbiter;
//! use photon_types::{SafetyCondition, SafetyState};
//!
//! let arbiter = SafetyArbiter::standard();
//! assert_eq!(arbiter.state(), SafetyState::Unsafe);
//!
//! for condition in SafetyCondition::standard() {
//!     arbiter.set_condition(condition, true).unwrap();
//! }
//! assert_eq!(arbiter.state(), SafetyState::Safe);
//! assert!(arbiter.is_action_permitted());
//!
//! arbiter.trigger_emergency_stop("operator pressed e-stop");
//! assert!(!arbiter.is_action_permitted());
//! assert_eq!(arbiter.reset_emergency_stop().unwrap(), SafetyState::Safe);
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use parking_lot::{Mutex, ReentrantMutex, RwLock};
use photon_types::{
    AuditEvent, AuditKind, EventSink, NullSink, PhotonError, SafetyCondition, SafetyState,
    SafetyTransition, Severity,
};
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Callback invoked with every [`SafetyTransition`].
pub type SafetyListener = Arc<dyn Fn(&SafetyTransition) + Send + Sync>;

/// Handle returned by [`SafetyArbiter::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

// ────────────────────────────────────────────────────────────────────────────
// Internal state
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum Mode {
    #[default]
    Idle,
    Armed,
    Treating,
}

struct Flags {
    conditions: BTreeMap<SafetyCondition, bool>,
    emergency: bool,
    mode: Mode,
    state: SafetyState,
}

impl Flags {
    // An arbiter with nothing to check never grants permission.
    fn derive(&self) -> SafetyState {
        if self.emergency {
            return SafetyState::EmergencyStop;
        }
        if self.conditions.is_empty() || self.conditions.values().any(|ok| !ok) {
            return SafetyState::Unsafe;
        }
        match self.mode {
            Mode::Idle => SafetyState::Safe,
            Mode::Armed => SafetyState::Armed,
            Mode::Treating => SafetyState::Treating,
        }
    }

    fn failing(&self) -> Vec<&str> {
        self.conditions
            .iter()
            .filter(|(_, ok)| !**ok)
            .map(|(c, _)| c.name())
            .collect()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// SafetyArbiter
// ────────────────────────────────────────────────────────────────────────────

/// Fuses named interlock conditions and the emergency flag into one
/// [`SafetyState`].  Shared as `Arc<SafetyArbiter>`.
pub struct SafetyArbiter {
    flags: Mutex<Flags>,
    // Serialises notification so subscribers see transitions in order.
    // Reentrant so a subscriber may mutate the arbiter itself.
    notify: ReentrantMutex<()>,
    listeners: RwLock<Vec<(SubscriptionId, SafetyListener)>>,
    next_id: AtomicU64,
    state_tx: watch::Sender<SafetyState>,
    sink: Arc<dyn EventSink>,
}

impl SafetyArbiter {
    /// Create an arbiter tracking `conditions`, all initially `false`.
    pub fn new(conditions: impl IntoIterator<Item = SafetyCondition>) -> Self {
        let conditions: BTreeMap<SafetyCondition, bool> =
            conditions.into_iter().map(|c| (c, false)).collect();
        let (state_tx, _) = watch::channel(SafetyState::Unsafe);
        Self {
            flags: Mutex::new(Flags {
                conditions,
                emergency: false,
                mode: Mode::Idle,
                state: SafetyState::Unsafe,
            }),
            notify: ReentrantMutex::new(()),
            listeners: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(0),
            state_tx,
            sink: Arc::new(NullSink),
        }
    }

    /// Arbiter tracking [`SafetyCondition::standard`].
    pub fn standard() -> Self {
        Self::new(SafetyCondition::standard())
    }

    /// Report transitions and emergency triggers to `sink`.
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn state(&self) -> SafetyState {
        self.flags.lock().state
    }

    /// `true` only in `Safe`, `Armed` or `Treating`.
    pub fn is_action_permitted(&self) -> bool {
        self.state().permits_action()
    }

    pub fn is_emergency(&self) -> bool {
        self.flags.lock().emergency
    }

    /// Snapshot of every tracked condition.
    pub fn conditions(&self) -> BTreeMap<SafetyCondition, bool> {
        self.flags.lock().conditions.clone()
    }

    /// `true` if `condition` is one of the tracked flags.
    pub fn tracks(&self, condition: &SafetyCondition) -> bool {
        self.flags.lock().conditions.contains_key(condition)
    }

    /// Receiver that always holds the latest state.
    pub fn watch(&self) -> watch::Receiver<SafetyState> {
        self.state_tx.subscribe()
    }

    // -----------------------------------------------------------------------
    // Subscribers
    // -----------------------------------------------------------------------

    /// Register a synchronous transition callback.
    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&SafetyTransition) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push((id, Arc::new(listener)));
        id
    }

    /// Remove a callback.  Returns `false` when `id` was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    // -----------------------------------------------------------------------
    // Mutations
    // -----------------------------------------------------------------------

    /// Start tracking `condition` (initially `false`).  Re-registering an
    /// existing condition leaves its value untouched.
    pub fn register_condition(&self, condition: SafetyCondition) -> SafetyState {
        let cause = format!("{condition} registered");
        self.mutate(cause, |flags| {
            flags.conditions.entry(condition).or_insert(false);
        })
    }

    /// Update one condition and recompute the state.
    ///
    /// # Errors
    ///
    /// [`PhotonError::UnknownCondition`] when `condition` is not tracked.
    pub fn set_condition(
        &self,
        condition: SafetyCondition,
        value: bool,
    ) -> Result<SafetyState, PhotonError> {
        let cause = format!("{condition}={value}");
        let mut unknown = false;
        let state = self.mutate(cause, |flags| match flags.conditions.get_mut(&condition) {
            Some(slot) => *slot = value,
            None => unknown = true,
        });
        if unknown {
            return Err(PhotonError::UnknownCondition(condition.name().to_string()));
        }
        Ok(state)
    }

    /// Latch the emergency stop.  Idempotent: once latched, further calls
    /// change nothing and report nothing.
    pub fn trigger_emergency_stop(&self, reason: &str) -> SafetyState {
        let _order = self.notify.lock();
        let newly_latched = {
            let flags = self.flags.lock();
            !flags.emergency
        };
        if !newly_latched {
            return SafetyState::EmergencyStop;
        }
        error!(reason, "emergency stop triggered");
        self.sink.record(AuditEvent::new(
            AuditKind::EmergencyStop,
            Severity::Critical,
            reason,
        ));
        self.mutate(format!("emergency stop: {reason}"), |flags| {
            flags.emergency = true;
        })
    }

    /// Clear a latched emergency stop.
    ///
    /// Calling this while no emergency is latched returns the current state.
    ///
    /// # Errors
    ///
    /// [`PhotonError::PreconditionNotMet`] naming the failing conditions
    /// unless every condition is `true` right now.  The emergency stays
    /// latched; correct the conditions and retry.
    pub fn reset_emergency_stop(&self) -> Result<SafetyState, PhotonError> {
        let _order = self.notify.lock();
        {
            let flags = self.flags.lock();
            if !flags.emergency {
                return Ok(flags.state);
            }
            let failing = flags.failing();
            if !failing.is_empty() || flags.conditions.is_empty() {
                let details = if failing.is_empty() {
                    "no safety conditions registered".to_string()
                } else {
                    format!("conditions not satisfied: {}", failing.join(", "))
                };
                warn!(%details, "emergency reset refused");
                return Err(PhotonError::PreconditionNotMet(details));
            }
        }
        info!("emergency stop reset");
        self.sink.record(AuditEvent::new(
            AuditKind::EmergencyReset,
            Severity::Warning,
            "emergency stop cleared",
        ));
        Ok(self.mutate("emergency reset".to_string(), |flags| {
            flags.emergency = false;
            flags.mode = Mode::Idle;
        }))
    }

    /// `Safe → Armed`.
    ///
    /// # Errors
    ///
    /// [`PhotonError::InterlockViolation`] unless the state is `Safe` or
    /// already `Armed`.
    pub fn arm(&self) -> Result<SafetyState, PhotonError> {
        self.enter_mode(Mode::Armed, |s| {
            matches!(s, SafetyState::Safe | SafetyState::Armed)
        })
    }

    /// `Armed | Treating → Safe`.  Always allowed.
    pub fn disarm(&self) -> SafetyState {
        self.mutate("disarm".to_string(), |flags| flags.mode = Mode::Idle)
    }

    /// `Safe | Armed → Treating`.
    ///
    /// # Errors
    ///
    /// [`PhotonError::InterlockViolation`] when action is not permitted.
    pub fn begin_treatment(&self) -> Result<SafetyState, PhotonError> {
        self.enter_mode(Mode::Treating, SafetyState::permits_action)
    }

    /// `Treating → Safe`.  No-op in any other mode.
    pub fn end_treatment(&self) -> SafetyState {
        self.mutate("treatment ended".to_string(), |flags| {
            if flags.mode == Mode::Treating {
                flags.mode = Mode::Idle;
            }
        })
    }

    // -----------------------------------------------------------------------
    // Internal helpers
    // -----------------------------------------------------------------------

    fn enter_mode(
        &self,
        mode: Mode,
        allowed: impl Fn(SafetyState) -> bool,
    ) -> Result<SafetyState, PhotonError> {
        let _order = self.notify.lock();
        let current = self.state();
        if !allowed(current) {
            return Err(PhotonError::InterlockViolation(format!(
                "cannot enter {mode:?} from {current}"
            )));
        }
        Ok(self.mutate(format!("{mode:?}").to_lowercase(), |flags| flags.mode = mode))
    }

    // Apply `change`, recompute, publish.  Listeners run after the flags
    // lock is released but while the notification order lock is held.
    fn mutate(&self, cause: String, change: impl FnOnce(&mut Flags)) -> SafetyState {
        let _order = self.notify.lock();
        let transition = {
            let mut flags = self.flags.lock();
            change(&mut flags);
            let next = flags.derive();
            if !next.permits_action() {
                flags.mode = Mode::Idle;
            }
            let previous = flags.state;
            flags.state = next;
            if previous == next {
                None
            } else {
                self.state_tx.send_replace(next);
                Some(SafetyTransition {
                    from: previous,
                    to: next,
                    timestamp: Utc::now(),
                    cause,
                })
            }
        };

        match transition {
            Some(t) => {
                self.announce(&t);
                t.to
            }
            None => self.state(),
        }
    }

    fn announce(&self, transition: &SafetyTransition) {
        let severity = match transition.to {
            SafetyState::EmergencyStop => Severity::Critical,
            SafetyState::Unsafe => Severity::Warning,
            _ => Severity::Info,
        };
        info!(
            from = %transition.from,
            to = %transition.to,
            cause = %transition.cause,
            "safety state changed"
        );
        self.sink.record(AuditEvent::new(
            AuditKind::SafetyTransition,
            severity,
            format!(
                "{} -> {} ({})",
                transition.from, transition.to, transition.cause
            ),
        ));
        let listeners: Vec<SafetyListener> = self
            .listeners
            .read()
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in listeners {
            listener(transition);
        }
    }
}

impl Default for SafetyArbiter {
    fn default() -> Self {
        Self::standard()
    }
}

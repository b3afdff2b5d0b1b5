//! [`ProtocolEngine`] – cooperative executor for treatment protocols.
//!
//! A [`Protocol`] is an ordered list of typed [`ProtocolAction`]s.  The
//! engine runs them one by one against the device channels in a
//! [`DeviceRegistry`], asking the [`SafetyArbiter`] for permission before
//! the protocol starts, at every action boundary, between retries and
//! continuously while it waits.
//!
//! # Lifecycle
//!
//! ```text
//! Idle ─► Running ◄──► Paused
//!            │
//!            ├─► Completed
//!            ├─► Failed              (permission revoked, action failed)
//!            └─► Stopping ─► Failed  (stop requested)
//! ```
//!
//! Every exit path other than load-time rejection ends with the laser
//! output disabled.
//!
//! # Control
//!
//! [`EngineControl`] is a cloneable handle that can pause, resume or stop a
//! running protocol from any task or thread.  Requests are honoured at
//! action boundaries and inside waits and ramp dwells, which the engine
//! sleeps in slices of [`EngineConfig::wait_slice`] while also watching the
//! arbiter.  [`EngineControl::stop`] disables the laser from the caller
//! before the engine even sees the request.
//!
//! # Retries
//!
//! Device calls are bounded by a per-action timeout and retried according to
//! [`RetryPolicy`].  A timeout does not prove the command never reached the
//! device, so only absolute set points are re-sent after one; motion and
//! ramps are re-sent only when the failure happened before delivery.
//! A timed-out call is marked abandoned and drained before the engine moves
//! on; an abandoned laser call never enables emission.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use photon_hal::SimRegistry;
//! use photon_kernel::SafetyArbiter;
//! use photon_runtime::engine::{EngineConfig, ProtocolEngine};
//! use photon_types::{Protocol, ProtocolAction, SafetyCondition};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let devices = SimRegistry::new().with_laser().build()?;
//! let arbiter = Arc::new(SafetyArbiter::standard());
//! for condition in SafetyCondition::standard() {
//!     arbiter.set_condition(condition, true)?;
//! }
//!
//! let mut engine = ProtocolEngine::new(
//!     Arc::new(devices.registry),
//!     Arc::clone(&arbiter),
//!     EngineConfig::default(),
//! );
//! let protocol = Protocol::new(
//!     "spot",
//!     [
//!         ProtocolAction::SetOutputLevel { level: 2.0 },
//!         ProtocolAction::Wait { duration_ms: 500 },
//!         ProtocolAction::SetOutputLevel { level: 0.0 },
//!     ],
//! );
//! let report = engine.execute(&protocol).await?;
//! println!("{} actions in {:?}", report.actions_completed, report.elapsed);
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use photon_hal::{DeviceChannel, DeviceRegistry};
use photon_kernel::{ActionVerifier, SafetyArbiter};
use photon_middleware::EventBus;
use photon_types::{
    AuditEvent, AuditKind, DeviceKind, EventSink, NullSink, PhotonError, Protocol, ProtocolAction,
    ProtocolProgress, ProtocolStep, SafetyState, Severity,
};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Bounded retry with a non-idempotent-aware policy.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Re-sends after the first attempt.  Overridable per step.
    pub max_retries: u32,
    /// Pause between attempts.  Interruptible like any wait.
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            delay: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    /// Whether `error` from `action` may be re-sent.
    ///
    /// | Error | Set points | Motion / ramp |
    /// |---|---|---|
    /// | `Connection` (never delivered) | retry | retry |
    /// | `CommandTimeout` | retry | fail |
    /// | `Validation`, anything else | fail | fail |
    pub fn allows(&self, action: &ProtocolAction, error: &PhotonError) -> bool {
        match error {
            PhotonError::Validation(_) => false,
            e if e.is_pre_effect() => true,
            PhotonError::CommandTimeout { .. } => matches!(
                action,
                ProtocolAction::SetOutputLevel { .. } | ProtocolAction::SetIllumination { .. }
            ),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Bound on each device call.  `Wait` is exempt.
    pub action_timeout: Duration,
    pub retry: RetryPolicy,
    /// Longest single sleep inside a wait before permission and control
    /// requests are looked at again.
    pub wait_slice: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            action_timeout: Duration::from_secs(2),
            retry: RetryPolicy::default(),
            wait_slice: Duration::from_millis(50),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Public types
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunState {
    Idle,
    Running,
    Paused,
    Stopping,
    Completed,
    Failed,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunState::Idle => "IDLE",
            RunState::Running => "RUNNING",
            RunState::Paused => "PAUSED",
            RunState::Stopping => "STOPPING",
            RunState::Completed => "COMPLETED",
            RunState::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// Bookkeeping for the protocol in flight, kept after the run ends.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionContext {
    pub protocol: String,
    /// Current (or last) action index.
    pub index: usize,
    pub state: RunState,
    /// Attempts made so far for the current action.
    pub attempts: u32,
    pub started: Instant,
}

/// Summary of a completed run.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionReport {
    pub protocol: String,
    pub actions_completed: usize,
    /// Re-sends across all actions.
    pub retries: u32,
    pub elapsed: Duration,
}

/// Why a run did not complete.  The engine is in [`RunState::Failed`] after
/// any of these.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExecutionError {
    #[error("Protocol refused: action not permitted in state {0}")]
    NotPermitted(SafetyState),

    #[error("Permission revoked ({state}) at action {action_index}")]
    PermissionRevoked {
        action_index: usize,
        state: SafetyState,
    },

    #[error("Stopped at action {action_index}")]
    Stopped { action_index: usize },

    #[error("Action {action_index} failed: {source}")]
    ActionFailed {
        action_index: usize,
        source: PhotonError,
    },

    #[error("Invalid protocol: {0}")]
    InvalidProtocol(PhotonError),
}

impl ExecutionError {
    /// Index of the action that was current when the run halted.
    pub fn action_index(&self) -> Option<usize> {
        match self {
            ExecutionError::PermissionRevoked { action_index, .. }
            | ExecutionError::Stopped { action_index }
            | ExecutionError::ActionFailed { action_index, .. } => Some(*action_index),
            ExecutionError::NotPermitted(_) | ExecutionError::InvalidProtocol(_) => None,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// EngineControl
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ControlRequest {
    Pause,
    Resume,
    Stop,
}

/// Cloneable remote control for a [`ProtocolEngine`].
///
/// Requests sent while the engine is idle are discarded when the next run
/// starts.
#[derive(Clone)]
pub struct EngineControl {
    requests: mpsc::UnboundedSender<ControlRequest>,
    state: watch::Receiver<RunState>,
    laser: Option<Arc<DeviceChannel>>,
}

impl EngineControl {
    pub fn pause(&self) {
        self.send(ControlRequest::Pause);
    }

    pub fn resume(&self) {
        self.send(ControlRequest::Resume);
    }

    /// Disable the laser now, then ask the engine to stop.
    ///
    /// Waits for the laser channel lock first.  A composite laser command in
    /// flight (set, readback, enable) can hold it for up to three command
    /// timeouts.
    pub fn stop(&self) {
        if let Some(laser) = &self.laser
            && let Err(e) = laser.disable_output()
        {
            error!(device = %laser.id(), error = %e, "laser disable on stop failed");
        }
        self.send(ControlRequest::Stop);
    }

    pub fn state(&self) -> RunState {
        *self.state.borrow()
    }

    /// Wait until the engine reaches a state matching `predicate`.
    pub async fn wait_until(&self, predicate: impl FnMut(&RunState) -> bool) -> RunState {
        let mut rx = self.state.clone();
        let reached = rx.wait_for(predicate).await.map(|s| *s).ok();
        reached.unwrap_or_else(|| *rx.borrow())
    }

    fn send(&self, request: ControlRequest) {
        if self.requests.send(request).is_err() {
            debug!(?request, "engine gone, control request dropped");
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// ProtocolEngine
// ─────────────────────────────────────────────────────────────────────────────

// Internal reason a run halts before completing.
enum Halt {
    Revoked(SafetyState),
    Stopped,
    Failed(PhotonError),
}

// Limits for the device calls of one action.
struct Attempts<'a> {
    action: &'a ProtocolAction,
    timeout: Duration,
    max_retries: u32,
}

pub struct ProtocolEngine {
    registry: Arc<DeviceRegistry>,
    arbiter: Arc<SafetyArbiter>,
    verifier: ActionVerifier,
    config: EngineConfig,
    sink: Arc<dyn EventSink>,
    bus: Option<EventBus>,
    safety: watch::Receiver<SafetyState>,
    state_tx: watch::Sender<RunState>,
    control_tx: mpsc::UnboundedSender<ControlRequest>,
    control_rx: mpsc::UnboundedReceiver<ControlRequest>,
    context: Option<ExecutionContext>,
    laser_emitting: bool,
    retries_used: u32,
}

impl ProtocolEngine {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        arbiter: Arc<SafetyArbiter>,
        config: EngineConfig,
    ) -> Self {
        let (state_tx, _) = watch::channel(RunState::Idle);
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        Self {
            safety: arbiter.watch(),
            registry,
            arbiter,
            verifier: ActionVerifier::new(),
            config,
            sink: Arc::new(NullSink),
            bus: None,
            state_tx,
            control_tx,
            control_rx,
            context: None,
            laser_emitting: false,
            retries_used: 0,
        }
    }

    /// Load-time rules applied to every protocol.
    pub fn with_verifier(mut self, verifier: ActionVerifier) -> Self {
        self.verifier = verifier;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Publish progress on [`Topic::Protocol`][photon_middleware::Topic::Protocol].
    pub fn with_bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn state(&self) -> RunState {
        *self.state_tx.borrow()
    }

    /// The current run, or the last one once it has ended.
    pub fn context(&self) -> Option<&ExecutionContext> {
        self.context.as_ref()
    }

    pub fn control(&self) -> EngineControl {
        EngineControl {
            requests: self.control_tx.clone(),
            state: self.state_tx.subscribe(),
            laser: self.registry.laser(),
        }
    }

    /// Check `protocol` without touching hardware: structural checks,
    /// verifier rules and a registered channel for every action.
    pub fn validate(&self, protocol: &Protocol) -> Result<(), PhotonError> {
        self.verifier.verify_protocol(protocol)?;
        if self.registry.laser().is_none() {
            return Err(PhotonError::Validation(
                "no laser channel registered".to_string(),
            ));
        }
        for (index, step) in protocol.steps.iter().enumerate() {
            if let Some(kind) = step.action.device()
                && self.registry.by_kind(kind).is_none()
            {
                return Err(PhotonError::Validation(format!(
                    "step {index} ({}): no {kind} channel registered",
                    step.action.label()
                )));
            }
        }
        Ok(())
    }

    /// Run `protocol` to completion, failure or stop.
    pub async fn execute(&mut self, protocol: &Protocol) -> Result<ExecutionReport, ExecutionError> {
        while self.control_rx.try_recv().is_ok() {}
        self.context = None;
        self.laser_emitting = false;
        self.retries_used = 0;

        if let Err(e) = self.validate(protocol) {
            warn!(protocol = %protocol.name, error = %e, "protocol rejected");
            self.set_state(RunState::Failed);
            self.audit(
                AuditKind::ProtocolFailed,
                Severity::Warning,
                format!("{}: {e}", protocol.name),
            );
            return Err(ExecutionError::InvalidProtocol(e));
        }

        self.safety.borrow_and_update();
        if let Err(e) = self.arbiter.begin_treatment() {
            let state = self.arbiter.state();
            warn!(protocol = %protocol.name, %state, error = %e, "protocol refused");
            self.set_state(RunState::Failed);
            self.audit(
                AuditKind::ProtocolFailed,
                Severity::Warning,
                format!("{}: not permitted in {state}", protocol.name),
            );
            return Err(ExecutionError::NotPermitted(state));
        }

        let started = Instant::now();
        self.context = Some(ExecutionContext {
            protocol: protocol.name.clone(),
            index: 0,
            state: RunState::Idle,
            attempts: 0,
            started,
        });
        self.set_state(RunState::Running);
        info!(protocol = %protocol.name, actions = protocol.len(), "protocol started");
        self.audit(
            AuditKind::ProtocolStarted,
            Severity::Info,
            format!("{} ({} actions)", protocol.name, protocol.len()),
        );

        for (index, step) in protocol.steps.iter().enumerate() {
            if let Err(halt) = self.boundary(protocol, index, step).await {
                return Err(self.halt(protocol, index, halt).await);
            }
            if let Err(halt) = self.run_action(step).await {
                return Err(self.halt(protocol, index, halt).await);
            }
        }

        self.laser_off("protocol complete").await;
        self.arbiter.end_treatment();
        self.set_state(RunState::Completed);
        let report = ExecutionReport {
            protocol: protocol.name.clone(),
            actions_completed: protocol.len(),
            retries: self.retries_used,
            elapsed: started.elapsed(),
        };
        info!(
            protocol = %protocol.name,
            elapsed_ms = report.elapsed.as_millis() as u64,
            retries = report.retries,
            "protocol completed"
        );
        self.audit(
            AuditKind::ProtocolCompleted,
            Severity::Info,
            format!("{} in {:?}", protocol.name, report.elapsed),
        );
        Ok(report)
    }

    // -----------------------------------------------------------------------
    // Action handlers
    // -----------------------------------------------------------------------

    async fn run_action(&mut self, step: &ProtocolStep) -> Result<(), Halt> {
        let attempts = Attempts {
            action: &step.action,
            timeout: step
                .timeout_ms
                .map_or(self.config.action_timeout, Duration::from_millis),
            max_retries: step.retries.unwrap_or(self.config.retry.max_retries),
        };
        match &step.action {
            ProtocolAction::SetOutputLevel { level } => {
                self.apply_laser_level(*level, &attempts).await
            }
            ProtocolAction::RampOutputLevel {
                from,
                to,
                duration_ms,
                steps,
            } => {
                let steps = (*steps).max(1);
                let dwell = Duration::from_millis(*duration_ms) / steps;
                for k in 0..=steps {
                    if k > 0 {
                        self.dwell(dwell).await?;
                    }
                    let level = from + (to - from) * f64::from(k) / f64::from(steps);
                    self.apply_laser_level(level, &attempts).await?;
                }
                Ok(())
            }
            ProtocolAction::MoveActuator { position } => {
                self.set_point(DeviceKind::Actuator, *position, &attempts).await
            }
            ProtocolAction::SetIllumination { level } => {
                self.set_point(DeviceKind::Illumination, *level, &attempts).await
            }
            ProtocolAction::Wait { duration_ms } => {
                self.dwell(Duration::from_millis(*duration_ms)).await
            }
        }
    }

    // Set the laser level; a positive level enables emission, zero
    // disables it.  Permission is re-checked on the blocking thread right
    // before anything reaches the laser.
    async fn apply_laser_level(&mut self, level: f64, attempts: &Attempts<'_>) -> Result<(), Halt> {
        let laser = self.channel(DeviceKind::Laser)?;
        let arbiter = Arc::clone(&self.arbiter);
        self.device_call(attempts, laser.id().to_string(), move |abandoned| {
            gate(&arbiter)?;
            laser.set_value(level)?;
            if level > 0.0 {
                abandoned.check()?;
                gate(&arbiter)?;
                laser.enable_output()
            } else {
                laser.disable_output()
            }
        })
        .await?;
        self.laser_emitting = level > 0.0;
        Ok(())
    }

    async fn set_point(
        &mut self,
        kind: DeviceKind,
        value: f64,
        attempts: &Attempts<'_>,
    ) -> Result<(), Halt> {
        let channel = self.channel(kind)?;
        self.device_call(attempts, channel.id().to_string(), move |_| {
            channel.set_value(value).map(drop)
        })
        .await
    }

    // -----------------------------------------------------------------------
    // Device calls, waits and control
    // -----------------------------------------------------------------------

    async fn device_call<F>(&mut self, attempts: &Attempts<'_>, device: String, op: F) -> Result<(), Halt>
    where
        F: Fn(&Abandoned) -> Result<(), PhotonError> + Send + Sync + 'static,
    {
        let op = Arc::new(op);
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            if let Some(context) = self.context.as_mut() {
                context.attempts += 1;
            }
            let call = Arc::clone(&op);
            let error = match bounded(&device, attempts.timeout, move |abandoned| call(abandoned)).await {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };
            if let PhotonError::InterlockViolation(_) = error {
                return Err(Halt::Revoked(self.arbiter.state()));
            }
            if !self.config.retry.allows(attempts.action, &error) {
                return Err(Halt::Failed(error));
            }
            if attempt > attempts.max_retries {
                let error = if attempt == 1 {
                    error
                } else {
                    PhotonError::RetryExhausted {
                        attempts: attempt,
                        last_error: Box::new(error),
                    }
                };
                return Err(Halt::Failed(error));
            }
            warn!(
                %device,
                action = attempts.action.label(),
                attempt,
                error = %error,
                "device call failed, retrying"
            );
            self.retries_used += 1;
            self.dwell(self.config.retry.delay).await?;
            self.check_permission()?;
        }
    }

    // Sleep `duration` in slices, reacting to control requests and safety
    // changes as they arrive.  Pausing keeps the unslept remainder.
    async fn dwell(&mut self, duration: Duration) -> Result<(), Halt> {
        let mut remaining = duration;
        while !remaining.is_zero() {
            let slice = remaining.min(self.config.wait_slice);
            let started = Instant::now();
            tokio::select! {
                request = self.control_rx.recv() => {
                    remaining = remaining.saturating_sub(started.elapsed());
                    self.handle_request(request).await?;
                }
                _ = self.safety.changed() => {
                    remaining = remaining.saturating_sub(started.elapsed());
                    self.check_permission()?;
                }
                _ = tokio::time::sleep(slice) => {
                    remaining = remaining.saturating_sub(slice);
                    self.check_permission()?;
                }
            }
        }
        Ok(())
    }

    async fn boundary(&mut self, protocol: &Protocol, index: usize, step: &ProtocolStep) -> Result<(), Halt> {
        while let Ok(request) = self.control_rx.try_recv() {
            self.handle_request(Some(request)).await?;
        }
        self.check_permission()?;
        if let Some(context) = self.context.as_mut() {
            context.index = index;
            context.attempts = 0;
        }

        let progress = ProtocolProgress {
            protocol: protocol.name.clone(),
            index,
            total: protocol.len(),
            description: step.action.describe(),
        };
        info!(index, total = progress.total, action = %progress.description, "action boundary");
        self.audit(
            AuditKind::ActionBoundary,
            Severity::Info,
            format!("{} {}/{}: {}", protocol.name, index + 1, progress.total, progress.description),
        );
        if let Some(bus) = &self.bus {
            bus.publish_progress(&progress);
        }
        Ok(())
    }

    async fn handle_request(&mut self, request: Option<ControlRequest>) -> Result<(), Halt> {
        match request {
            Some(ControlRequest::Pause) => self.hold().await,
            Some(ControlRequest::Stop) => Err(Halt::Stopped),
            Some(ControlRequest::Resume) | None => Ok(()),
        }
    }

    // Paused: emission held off until resumed, stopped or revoked.
    async fn hold(&mut self) -> Result<(), Halt> {
        self.set_state(RunState::Paused);
        info!("protocol paused");
        if self.laser_emitting {
            self.laser_off("paused").await;
        }
        loop {
            tokio::select! {
                request = self.control_rx.recv() => match request {
                    Some(ControlRequest::Resume) => break,
                    Some(ControlRequest::Stop) => return Err(Halt::Stopped),
                    Some(ControlRequest::Pause) | None => {}
                },
                _ = self.safety.changed() => self.check_permission()?,
            }
        }
        self.check_permission()?;
        if self.laser_emitting {
            let laser = self.channel(DeviceKind::Laser)?;
            let arbiter = Arc::clone(&self.arbiter);
            let device = laser.id().to_string();
            let resumed = bounded(&device, self.config.action_timeout, move |abandoned| {
                abandoned.check()?;
                gate(&arbiter)?;
                laser.enable_output()
            })
            .await;
            match resumed {
                Ok(()) => {}
                Err(PhotonError::InterlockViolation(_)) => {
                    return Err(Halt::Revoked(self.arbiter.state()));
                }
                Err(e) => return Err(Halt::Failed(e)),
            }
        }
        self.set_state(RunState::Running);
        info!("protocol resumed");
        Ok(())
    }

    async fn halt(&mut self, protocol: &Protocol, action_index: usize, halt: Halt) -> ExecutionError {
        let (error, severity) = match halt {
            Halt::Revoked(state) => {
                error!(protocol = %protocol.name, action_index, %state, "permission revoked");
                (
                    ExecutionError::PermissionRevoked {
                        action_index,
                        state,
                    },
                    Severity::Critical,
                )
            }
            Halt::Stopped => {
                self.set_state(RunState::Stopping);
                warn!(protocol = %protocol.name, action_index, "protocol stopped");
                (ExecutionError::Stopped { action_index }, Severity::Warning)
            }
            Halt::Failed(source) => {
                error!(protocol = %protocol.name, action_index, error = %source, "action failed");
                (
                    ExecutionError::ActionFailed {
                        action_index,
                        source,
                    },
                    Severity::Critical,
                )
            }
        };
        self.laser_off("protocol halted").await;
        self.arbiter.end_treatment();
        self.set_state(RunState::Failed);
        self.audit(
            AuditKind::ProtocolFailed,
            severity,
            format!("{}: {error}", protocol.name),
        );
        error
    }

    // -----------------------------------------------------------------------
    // Internal helpers
    // -----------------------------------------------------------------------

    fn check_permission(&self) -> Result<(), Halt> {
        let state = self.arbiter.state();
        if state.permits_action() {
            Ok(())
        } else {
            Err(Halt::Revoked(state))
        }
    }

    fn channel(&self, kind: DeviceKind) -> Result<Arc<DeviceChannel>, Halt> {
        self.registry.by_kind(kind).ok_or_else(|| {
            Halt::Failed(PhotonError::Validation(format!(
                "no {kind} channel registered"
            )))
        })
    }

    async fn laser_off(&mut self, reason: &str) {
        self.laser_emitting = false;
        let Some(laser) = self.registry.laser() else {
            return;
        };
        let device = laser.id().to_string();
        match bounded(&device, self.config.action_timeout, move |_| laser.disable_output()).await {
            Ok(()) => debug!(reason, "laser output disabled"),
            Err(e) => error!(reason, error = %e, "laser disable failed"),
        }
    }

    fn set_state(&mut self, state: RunState) {
        if let Some(context) = self.context.as_mut() {
            context.state = state;
        }
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!(from = %previous, to = %state, "engine state");
        }
    }

    fn audit(&self, kind: AuditKind, severity: Severity, details: String) {
        self.sink.record(AuditEvent::new(kind, severity, details));
    }
}

fn gate(arbiter: &SafetyArbiter) -> Result<(), PhotonError> {
    let state = arbiter.state();
    if state.permits_action() {
        Ok(())
    } else {
        Err(PhotonError::InterlockViolation(format!(
            "laser command refused in {state}"
        )))
    }
}

/// Set once the engine has given up on a device call.
///
/// A blocking call cannot be cancelled from outside, so calls that end in
/// an effect (enabling emission) check the flag before committing it.
#[derive(Clone, Default)]
struct Abandoned(Arc<AtomicBool>);

impl Abandoned {
    fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), PhotonError> {
        if self.0.load(Ordering::SeqCst) {
            Err(PhotonError::PreconditionNotMet(
                "device call abandoned after timeout".to_string(),
            ))
        } else {
            Ok(())
        }
    }
}

// Run a blocking device call on the blocking pool, bounded by `timeout`.
// On timeout the call is marked abandoned and drained before returning, so
// nothing it does can land after the caller has moved on.
async fn bounded<F>(device: &str, timeout: Duration, op: F) -> Result<(), PhotonError>
where
    F: FnOnce(&Abandoned) -> Result<(), PhotonError> + Send + 'static,
{
    let abandoned = Abandoned::default();
    let flag = abandoned.clone();
    let mut call = tokio::task::spawn_blocking(move || op(&flag));
    let joined = match tokio::time::timeout(timeout, &mut call).await {
        Ok(joined) => joined,
        Err(_) => {
            abandoned.set();
            match call.await {
                Ok(Ok(())) => debug!(device, "abandoned device call completed late"),
                Ok(Err(e)) => debug!(device, error = %e, "abandoned device call ended"),
                Err(join) => warn!(device, error = %join, "abandoned device task failed"),
            }
            return Err(PhotonError::CommandTimeout {
                device: device.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            });
        }
    };
    joined.unwrap_or_else(|join| {
        Err(PhotonError::Connection {
            device: device.to_string(),
            details: format!("device task failed: {join}"),
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use photon_hal::{SimFault, SimProbe, SimRegistry};
    use photon_kernel::OutputCapRule;
    use photon_middleware::{MemorySink, Topic};
    use photon_types::{DeviceCommand, SafetyCondition};

    struct Rig {
        engine: ProtocolEngine,
        arbiter: Arc<SafetyArbiter>,
        laser: SimProbe,
        actuator: SimProbe,
        sink: Arc<MemorySink>,
    }

    fn rig() -> Rig {
        rig_with(SimRegistry::new().with_laser().with_actuator().with_illumination())
    }

    fn rig_with(builder: SimRegistry) -> Rig {
        let devices = builder
            .with_command_timeout(Duration::from_millis(100))
            .build()
            .unwrap();
        let laser = devices.probe("laser").unwrap();
        let actuator = devices.probe("actuator").unwrap_or_else(|| laser.clone());
        laser.clear_log();
        actuator.clear_log();

        let arbiter = Arc::new(SafetyArbiter::standard());
        for c in SafetyCondition::standard() {
            arbiter.set_condition(c, true).unwrap();
        }
        let sink = Arc::new(MemorySink::new());
        let engine = ProtocolEngine::new(
            Arc::new(devices.registry),
            Arc::clone(&arbiter),
            EngineConfig {
                action_timeout: Duration::from_millis(300),
                retry: RetryPolicy {
                    max_retries: 2,
                    delay: Duration::from_millis(10),
                },
                wait_slice: Duration::from_millis(20),
            },
        )
        .with_sink(sink.clone());
        Rig {
            engine,
            arbiter,
            laser,
            actuator,
            sink,
        }
    }

    fn set_value(probe: &SimProbe, value: f64) -> usize {
        probe.count(|c| matches!(c, DeviceCommand::SetValue(v) if *v == value))
    }

    fn disables(probe: &SimProbe) -> usize {
        probe.count(|c| *c == DeviceCommand::DisableOutput)
    }

    // ------------------------------------------------------------------ retry policy

    #[test]
    fn retry_policy_distinguishes_pre_effect_failures() {
        let policy = RetryPolicy::default();
        let set = ProtocolAction::SetOutputLevel { level: 1.0 };
        let light = ProtocolAction::SetIllumination { level: 1.0 };
        let motion = ProtocolAction::MoveActuator { position: 1.0 };
        let ramp = ProtocolAction::RampOutputLevel {
            from: 0.0,
            to: 1.0,
            duration_ms: 10,
            steps: 2,
        };
        let link = PhotonError::Connection {
            device: "d".into(),
            details: "down".into(),
        };
        let timeout = PhotonError::CommandTimeout {
            device: "d".into(),
            timeout_ms: 10,
        };
        let invalid = PhotonError::Validation("out of range".into());

        for action in [&set, &light, &motion, &ramp] {
            assert!(policy.allows(action, &link));
            assert!(!policy.allows(action, &invalid));
        }
        assert!(policy.allows(&set, &timeout));
        assert!(policy.allows(&light, &timeout));
        assert!(!policy.allows(&motion, &timeout));
        assert!(!policy.allows(&ramp, &timeout));
    }

    // ------------------------------------------------------------------ happy path

    #[tokio::test]
    async fn runs_every_action_in_order() {
        let mut rig = rig();
        let protocol = Protocol::new(
            "spot",
            [
                ProtocolAction::MoveActuator { position: 5.0 },
                ProtocolAction::SetOutputLevel { level: 2.0 },
                ProtocolAction::Wait { duration_ms: 30 },
                ProtocolAction::SetIllumination { level: 40.0 },
                ProtocolAction::SetOutputLevel { level: 0.0 },
            ],
        );

        let report = rig.engine.execute(&protocol).await.unwrap();

        assert_eq!(report.actions_completed, 5);
        assert_eq!(report.retries, 0);
        assert!(report.elapsed >= Duration::from_millis(30));
        assert_eq!(rig.engine.state(), RunState::Completed);
        assert_eq!(rig.actuator.value(), 5.0);
        assert!(!rig.laser.output_enabled());
        assert_eq!(
            rig.laser.commands()[..3],
            [
                DeviceCommand::SetValue(2.0),
                DeviceCommand::ReadValue,
                DeviceCommand::EnableOutput
            ]
        );
        assert_eq!(rig.arbiter.state(), SafetyState::Safe);
        assert_eq!(rig.sink.of_kind(AuditKind::ActionBoundary).len(), 5);
        assert_eq!(rig.sink.of_kind(AuditKind::ProtocolCompleted).len(), 1);
    }

    #[tokio::test]
    async fn ramp_steps_linearly() {
        let mut rig = rig();
        let protocol = Protocol::new(
            "ramp",
            [ProtocolAction::RampOutputLevel {
                from: 0.0,
                to: 4.0,
                duration_ms: 40,
                steps: 4,
            }],
        );
        rig.engine.execute(&protocol).await.unwrap();
        let levels: Vec<f64> = rig
            .laser
            .commands()
            .into_iter()
            .filter_map(|c| match c {
                DeviceCommand::SetValue(v) => Some(v),
                _ => None,
            })
            .collect();
        assert_eq!(levels, vec![0.0, 1.0, 2.0, 3.0, 4.0]);
    }

    #[tokio::test]
    async fn treatment_mode_is_held_while_running() {
        let mut rig = rig();
        let arbiter = Arc::clone(&rig.arbiter);
        let protocol = Protocol::new("hold", [ProtocolAction::Wait { duration_ms: 200 }]);
        let control = rig.engine.control();
        let run = tokio::spawn(async move { rig.engine.execute(&protocol).await });
        control.wait_until(|s| *s == RunState::Running).await;
        assert_eq!(arbiter.state(), SafetyState::Treating);
        run.await.unwrap().unwrap();
        assert_eq!(arbiter.state(), SafetyState::Safe);
    }

    #[tokio::test]
    async fn progress_is_published_on_the_bus() {
        let bus = EventBus::default();
        let mut progress = bus.subscribe_to(Topic::Protocol);
        let mut rig = rig();
        rig.engine = rig.engine.with_bus(bus.clone());
        let protocol = Protocol::new(
            "p",
            [
                ProtocolAction::Wait { duration_ms: 1 },
                ProtocolAction::Wait { duration_ms: 1 },
            ],
        );
        rig.engine.execute(&protocol).await.unwrap();
        for expected in 0..2 {
            let event = progress.next().await.unwrap();
            assert!(matches!(
                event.payload,
                photon_types::EventPayload::Progress(ref p) if p.index == expected && p.total == 2
            ));
        }
    }

    // ------------------------------------------------------------------ permission

    #[tokio::test]
    async fn refuses_to_start_without_permission() {
        let mut rig = rig();
        rig.arbiter
            .set_condition(SafetyCondition::SessionValid, false)
            .unwrap();
        let protocol = Protocol::new("p", [ProtocolAction::SetOutputLevel { level: 1.0 }]);

        let err = rig.engine.execute(&protocol).await.unwrap_err();

        assert_eq!(err, ExecutionError::NotPermitted(SafetyState::Unsafe));
        assert_eq!(rig.engine.state(), RunState::Failed);
        assert!(rig.laser.commands().is_empty());
    }

    #[tokio::test]
    async fn refuses_to_start_in_emergency() {
        let mut rig = rig();
        rig.arbiter.trigger_emergency_stop("test");
        let protocol = Protocol::new("p", [ProtocolAction::SetOutputLevel { level: 1.0 }]);
        assert_eq!(
            rig.engine.execute(&protocol).await.unwrap_err(),
            ExecutionError::NotPermitted(SafetyState::EmergencyStop)
        );
        assert_eq!(rig.laser.count(DeviceCommand::is_enabling), 0);
    }

    #[tokio::test]
    async fn revocation_mid_wait_disables_laser_exactly_once() {
        let mut rig = rig();
        let arbiter = Arc::clone(&rig.arbiter);
        let laser = rig.laser.clone();
        let protocol = Protocol::new(
            "revoke",
            [
                ProtocolAction::SetOutputLevel { level: 1.0 },
                ProtocolAction::Wait { duration_ms: 2000 },
                ProtocolAction::SetOutputLevel { level: 2.0 },
            ],
        );
        let started = Instant::now();
        let run = tokio::spawn(async move { rig.engine.execute(&protocol).await });

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(laser.output_enabled());
        arbiter
            .set_condition(SafetyCondition::PhysicalInterlock, false)
            .unwrap();

        let err = run.await.unwrap().unwrap_err();
        assert_eq!(
            err,
            ExecutionError::PermissionRevoked {
                action_index: 1,
                state: SafetyState::Unsafe
            }
        );
        assert!(started.elapsed() < Duration::from_millis(1500));
        assert_eq!(disables(&laser), 1);
        assert_eq!(set_value(&laser, 2.0), 0);
        assert_eq!(laser.commands().last(), Some(&DeviceCommand::DisableOutput));
        assert!(!laser.output_enabled());
    }

    #[tokio::test]
    async fn no_enable_is_sent_after_revocation() {
        let mut rig = rig();
        let arbiter = Arc::clone(&rig.arbiter);
        let laser = rig.laser.clone();
        let protocol = Protocol::new(
            "ramp",
            [ProtocolAction::RampOutputLevel {
                from: 1.0,
                to: 5.0,
                duration_ms: 2000,
                steps: 4,
            }],
        );
        let run = tokio::spawn(async move { rig.engine.execute(&protocol).await });
        tokio::time::sleep(Duration::from_millis(100)).await;
        arbiter.trigger_emergency_stop("test");
        let enables_at_trip = laser.count(DeviceCommand::is_enabling);

        assert!(matches!(
            run.await.unwrap(),
            Err(ExecutionError::PermissionRevoked { state: SafetyState::EmergencyStop, .. })
        ));
        assert_eq!(laser.count(DeviceCommand::is_enabling), enables_at_trip);
        assert_eq!(set_value(&laser, 2.0), 0);
    }

    // ------------------------------------------------------------------ validation

    #[tokio::test]
    async fn missing_handler_is_a_load_time_error() {
        let mut rig = rig_with(SimRegistry::new().with_laser());
        let protocol = Protocol::new(
            "p",
            [
                ProtocolAction::SetOutputLevel { level: 1.0 },
                ProtocolAction::MoveActuator { position: 1.0 },
            ],
        );
        let err = rig.engine.execute(&protocol).await.unwrap_err();
        assert!(matches!(err, ExecutionError::InvalidProtocol(PhotonError::Validation(ref m)) if m.contains("actuator")));
        assert!(rig.laser.commands().is_empty());
    }

    #[tokio::test]
    async fn verifier_rules_reject_before_hardware() {
        let mut rig = rig();
        let mut verifier = ActionVerifier::new();
        verifier.add_rule(Box::new(OutputCapRule { max_level: 5.0 }));
        rig.engine = rig.engine.with_verifier(verifier);
        let protocol = Protocol::new(
            "p",
            [
                ProtocolAction::SetOutputLevel { level: 1.0 },
                ProtocolAction::SetOutputLevel { level: 8.0 },
            ],
        );
        assert!(matches!(
            rig.engine.execute(&protocol).await,
            Err(ExecutionError::InvalidProtocol(_))
        ));
        assert!(rig.laser.commands().is_empty());
        assert!(rig.engine.validate(&Protocol::new("empty", [])).is_err());
    }

    #[tokio::test]
    async fn device_validation_error_is_not_retried() {
        let mut rig = rig();
        let protocol = Protocol::new("p", [ProtocolAction::MoveActuator { position: 80.0 }]);
        let err = rig.engine.execute(&protocol).await.unwrap_err();
        assert!(matches!(
            err,
            ExecutionError::ActionFailed { action_index: 0, source: PhotonError::Validation(_) }
        ));
        assert!(rig.actuator.commands().is_empty());
        assert_eq!(disables(&rig.laser), 1);
    }

    // ------------------------------------------------------------------ retries and timeouts

    #[tokio::test]
    async fn connection_failures_are_retried() {
        let mut rig = rig();
        rig.actuator.fail_next(SimFault::Disconnected);
        rig.actuator.fail_next(SimFault::Disconnected);
        let protocol = Protocol::new("p", [ProtocolAction::MoveActuator { position: 3.0 }]);

        let report = rig.engine.execute(&protocol).await.unwrap();

        assert_eq!(report.retries, 2);
        assert_eq!(rig.actuator.value(), 3.0);
        let context = rig.engine.context().unwrap();
        assert_eq!(context.attempts, 3);
        assert_eq!(context.state, RunState::Completed);
    }

    #[tokio::test]
    async fn exhausted_retries_fail_the_run() {
        let mut rig = rig();
        rig.actuator.set_fault(Some(SimFault::Disconnected));
        let protocol = Protocol::new("p", [ProtocolAction::MoveActuator { position: 3.0 }]);

        let err = rig.engine.execute(&protocol).await.unwrap_err();

        assert!(matches!(
            err,
            ExecutionError::ActionFailed {
                source: PhotonError::RetryExhausted { attempts: 3, .. },
                ..
            }
        ));
        assert_eq!(rig.engine.state(), RunState::Failed);
        assert_eq!(disables(&rig.laser), 1);
    }

    #[tokio::test]
    async fn step_retry_override_applies() {
        let mut rig = rig();
        rig.actuator.fail_next(SimFault::Disconnected);
        let protocol = Protocol {
            name: "p".into(),
            steps: vec![ProtocolStep {
                action: ProtocolAction::MoveActuator { position: 3.0 },
                retries: Some(0),
                timeout_ms: None,
            }],
        };
        assert!(matches!(
            rig.engine.execute(&protocol).await,
            Err(ExecutionError::ActionFailed { source: PhotonError::Connection { .. }, .. })
        ));
    }

    #[tokio::test]
    async fn motion_is_not_resent_after_timeout() {
        let mut rig = rig();
        rig.actuator.fail_next(SimFault::Timeout);
        let protocol = Protocol::new("p", [ProtocolAction::MoveActuator { position: 3.0 }]);

        let err = rig.engine.execute(&protocol).await.unwrap_err();

        assert!(matches!(
            err,
            ExecutionError::ActionFailed { source: PhotonError::CommandTimeout { .. }, .. }
        ));
        assert_eq!(set_value(&rig.actuator, 3.0), 1);
    }

    #[tokio::test]
    async fn set_point_is_resent_after_timeout() {
        let mut rig = rig();
        rig.laser.fail_next(SimFault::Timeout);
        let protocol = Protocol::new("p", [ProtocolAction::SetOutputLevel { level: 1.0 }]);

        let report = rig.engine.execute(&protocol).await.unwrap();

        assert_eq!(report.retries, 1);
        assert_eq!(set_value(&rig.laser, 1.0), 2);
    }

    #[tokio::test]
    async fn step_timeout_bounds_a_slow_device() {
        let mut rig = rig();
        rig.actuator.set_latency(Duration::from_millis(80));
        let protocol = Protocol {
            name: "p".into(),
            steps: vec![ProtocolStep {
                action: ProtocolAction::MoveActuator { position: 3.0 },
                retries: None,
                timeout_ms: Some(30),
            }],
        };
        let err = rig.engine.execute(&protocol).await.unwrap_err();
        assert!(matches!(
            err,
            ExecutionError::ActionFailed {
                source: PhotonError::CommandTimeout { timeout_ms: 30, .. },
                ..
            }
        ));
    }

    #[tokio::test]
    async fn timed_out_laser_call_never_enables_after_failure() {
        let mut rig = rig();
        rig.laser.set_latency(Duration::from_millis(80));
        let protocol = Protocol {
            name: "slow laser".into(),
            steps: vec![ProtocolStep {
                action: ProtocolAction::SetOutputLevel { level: 1.0 },
                retries: Some(0),
                timeout_ms: Some(30),
            }],
        };
        let err = rig.engine.execute(&protocol).await.unwrap_err();
        assert!(matches!(
            err,
            ExecutionError::ActionFailed {
                source: PhotonError::CommandTimeout { timeout_ms: 30, .. },
                ..
            }
        ));
        assert_eq!(rig.arbiter.state(), SafetyState::Safe);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!rig.laser.output_enabled());
        assert_eq!(
            rig.laser.commands(),
            vec![
                DeviceCommand::SetValue(1.0),
                DeviceCommand::ReadValue,
                DeviceCommand::DisableOutput,
            ]
        );
    }

    #[tokio::test]
    async fn retried_laser_timeouts_do_not_overlap_or_enable() {
        let mut rig = rig();
        rig.laser.set_latency(Duration::from_millis(80));
        let protocol = Protocol {
            name: "slow laser".into(),
            steps: vec![ProtocolStep {
                action: ProtocolAction::SetOutputLevel { level: 1.0 },
                retries: Some(1),
                timeout_ms: Some(30),
            }],
        };
        let err = rig.engine.execute(&protocol).await.unwrap_err();
        assert!(matches!(
            err,
            ExecutionError::ActionFailed {
                source: PhotonError::RetryExhausted { attempts: 2, .. },
                ..
            }
        ));

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!rig.laser.output_enabled());
        assert_eq!(rig.laser.count(|c| *c == DeviceCommand::EnableOutput), 0);
        assert_eq!(
            rig.laser.commands(),
            vec![
                DeviceCommand::SetValue(1.0),
                DeviceCommand::ReadValue,
                DeviceCommand::SetValue(1.0),
                DeviceCommand::ReadValue,
                DeviceCommand::DisableOutput,
            ]
        );
    }

    // ------------------------------------------------------------------ pause / resume / stop

    #[tokio::test]
    async fn pause_holds_emission_and_remaining_wait() {
        let mut rig = rig();
        let laser = rig.laser.clone();
        let control = rig.engine.control();
        let protocol = Protocol::new(
            "pause",
            [
                ProtocolAction::SetOutputLevel { level: 1.0 },
                ProtocolAction::Wait { duration_ms: 300 },
                ProtocolAction::SetOutputLevel { level: 2.0 },
            ],
        );
        let started = Instant::now();
        let run = tokio::spawn(async move { rig.engine.execute(&protocol).await });

        tokio::time::sleep(Duration::from_millis(100)).await;
        control.pause();
        assert_eq!(control.wait_until(|s| *s == RunState::Paused).await, RunState::Paused);
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(!laser.output_enabled());
        assert_eq!(set_value(&laser, 2.0), 0);

        control.resume();
        let report = run.await.unwrap().unwrap();
        assert!(started.elapsed() >= Duration::from_millis(700));
        assert_eq!(report.actions_completed, 3);
        assert_eq!(set_value(&laser, 2.0), 1);
    }

    #[tokio::test]
    async fn revocation_while_paused_fails_the_run() {
        let mut rig = rig();
        let arbiter = Arc::clone(&rig.arbiter);
        let control = rig.engine.control();
        let protocol = Protocol::new("p", [ProtocolAction::Wait { duration_ms: 1000 }]);
        let run = tokio::spawn(async move { rig.engine.execute(&protocol).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        control.pause();
        control.wait_until(|s| *s == RunState::Paused).await;
        arbiter
            .set_condition(SafetyCondition::PowerLimit, false)
            .unwrap();

        assert!(matches!(
            run.await.unwrap(),
            Err(ExecutionError::PermissionRevoked { action_index: 0, .. })
        ));
    }

    #[tokio::test]
    async fn stop_disables_laser_and_fails() {
        let mut rig = rig();
        let laser = rig.laser.clone();
        let control = rig.engine.control();
        let protocol = Protocol::new(
            "stop",
            [
                ProtocolAction::SetOutputLevel { level: 1.0 },
                ProtocolAction::Wait { duration_ms: 5000 },
            ],
        );
        let started = Instant::now();
        let run = tokio::spawn(async move { rig.engine.execute(&protocol).await });

        tokio::time::sleep(Duration::from_millis(100)).await;
        control.stop();
        assert!(!laser.output_enabled());

        let err = run.await.unwrap().unwrap_err();
        assert_eq!(err, ExecutionError::Stopped { action_index: 1 });
        assert_eq!(err.action_index(), Some(1));
        assert_eq!(control.state(), RunState::Failed);
        assert!(started.elapsed() < Duration::from_millis(1000));
        assert!(disables(&laser) >= 1);
    }

    #[tokio::test]
    async fn stale_requests_are_discarded_between_runs() {
        let mut rig = rig();
        rig.engine.control().stop();
        let protocol = Protocol::new("p", [ProtocolAction::Wait { duration_ms: 1 }]);
        assert!(rig.engine.execute(&protocol).await.is_ok());
    }
}

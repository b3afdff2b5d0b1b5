use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

// ────────────────────────────────────────────────────────────────────────────
// Safety vocabulary
// ────────────────────────────────────────────────────────────────────────────

/// A named interlock flag fused by the safety arbiter.
///
/// Every condition starts `false` when registered; laser output is only
/// permitted once all of them have been explicitly confirmed by their owners.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SafetyCondition {
    /// Door / key-switch / fibre interlock loop is closed.
    PhysicalInterlock,
    /// An authorised operator session is active.
    SessionValid,
    /// Requested output stays within the configured power budget.
    PowerLimit,
    /// The hardware watchdog link is acknowledging heartbeats.
    WatchdogAlive,
    /// Sensor-derived or site-specific condition (e.g. `"skin_contact"`).
    Custom(String),
}

impl SafetyCondition {
    /// The three conditions every treatment device requires.
    pub fn standard() -> [SafetyCondition; 3] {
        [
            SafetyCondition::PhysicalInterlock,
            SafetyCondition::SessionValid,
            SafetyCondition::PowerLimit,
        ]
    }

    /// Stable flag name, e.g. `"physical_interlock_ok"`.
    pub fn name(&self) -> &str {
        match self {
            SafetyCondition::PhysicalInterlock => "physical_interlock_ok",
            SafetyCondition::SessionValid => "session_valid",
            SafetyCondition::PowerLimit => "power_limit_ok",
            SafetyCondition::WatchdogAlive => "watchdog_alive",
            SafetyCondition::Custom(name) => name,
        }
    }
}

impl fmt::Display for SafetyCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Fused permission state derived by the safety arbiter.
///
/// `Armed` and `Treating` are operating modes layered on top of `Safe`;
/// they collapse back to `Unsafe` or `EmergencyStop` as soon as a condition
/// drops or the emergency flag is raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SafetyState {
    Unsafe,
    Safe,
    Armed,
    Treating,
    EmergencyStop,
}

impl SafetyState {
    /// `true` for the states in which hazardous output may be commanded.
    pub fn permits_action(self) -> bool {
        matches!(
            self,
            SafetyState::Safe | SafetyState::Armed | SafetyState::Treating
        )
    }
}

impl fmt::Display for SafetyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SafetyState::Unsafe => "UNSAFE",
            SafetyState::Safe => "SAFE",
            SafetyState::Armed => "ARMED",
            SafetyState::Treating => "TREATING",
            SafetyState::EmergencyStop => "EMERGENCY_STOP",
        };
        f.write_str(s)
    }
}

/// A change of [`SafetyState`], delivered to arbiter subscribers after the
/// new state is already observable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyTransition {
    pub from: SafetyState,
    pub to: SafetyState,
    pub timestamp: DateTime<Utc>,
    /// What caused the change, e.g. `"physical_interlock_ok=false"`.
    pub cause: String,
}

// ────────────────────────────────────────────────────────────────────────────
// Device vocabulary
// ────────────────────────────────────────────────────────────────────────────

/// Role of a physical device on the treatment platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    /// Treatment laser source. The only channel forced off on emergency.
    Laser,
    /// Positioning stage / scanner head.
    Actuator,
    /// Motor and interlock controller; also carries the watchdog link.
    Controller,
    /// Aiming beam or room illumination (non-treatment light).
    Illumination,
    /// Monitoring sensor (contact, vibration, photodiode, ...).
    Sensor,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeviceKind::Laser => "laser",
            DeviceKind::Actuator => "actuator",
            DeviceKind::Controller => "controller",
            DeviceKind::Illumination => "illumination",
            DeviceKind::Sensor => "sensor",
        };
        f.write_str(s)
    }
}

/// Logical command understood by every device driver.  Vendor layers map
/// these onto their own wire protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DeviceCommand {
    Connect,
    Disconnect,
    SetValue(f64),
    ReadValue,
    EnableOutput,
    DisableOutput,
    GetStatus,
    /// Liveness message for the hardware watchdog circuit.
    Heartbeat { sequence: u32 },
}

impl DeviceCommand {
    /// `true` for commands that switch hazardous output on.
    pub fn is_enabling(&self) -> bool {
        matches!(self, DeviceCommand::EnableOutput)
    }
}

/// Logical response to a [`DeviceCommand`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DeviceResponse {
    Ack,
    Value(f64),
    Status(DeviceStatus),
}

/// Snapshot returned by `get_status`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DeviceStatus {
    pub connected: bool,
    pub output_enabled: bool,
    pub value: f64,
    pub fault: Option<String>,
}

/// Notification emitted by a device channel after its lock is released.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DeviceEvent {
    Connected,
    Disconnected,
    ValueChanged(f64),
    OutputEnabled,
    OutputDisabled,
    Fault(String),
}

// ────────────────────────────────────────────────────────────────────────────
// Protocol vocabulary
// ────────────────────────────────────────────────────────────────────────────

/// One typed step of a treatment sequence.
///
/// The set of variants is closed; the execution engine matches on it
/// exhaustively so a new variant cannot be added without a handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action")]
pub enum ProtocolAction {
    /// Drive the laser to an absolute output level and enable emission
    /// (a level of zero disables emission).
    SetOutputLevel { level: f64 },
    /// Ramp the laser output linearly from `from` to `to` in `steps` steps.
    RampOutputLevel {
        from: f64,
        to: f64,
        duration_ms: u64,
        steps: u32,
    },
    /// Move the positioning actuator to an absolute position.
    MoveActuator { position: f64 },
    /// Set the non-treatment illumination level.
    SetIllumination { level: f64 },
    /// Dwell for the given time.
    Wait { duration_ms: u64 },
}

impl ProtocolAction {
    /// Device role whose channel handles this action (`None` for `Wait`).
    pub fn device(&self) -> Option<DeviceKind> {
        match self {
            ProtocolAction::SetOutputLevel { .. } | ProtocolAction::RampOutputLevel { .. } => {
                Some(DeviceKind::Laser)
            }
            ProtocolAction::MoveActuator { .. } => Some(DeviceKind::Actuator),
            ProtocolAction::SetIllumination { .. } => Some(DeviceKind::Illumination),
            ProtocolAction::Wait { .. } => None,
        }
    }

    /// Short variant label used in logs and audit records.
    pub fn label(&self) -> &'static str {
        match self {
            ProtocolAction::SetOutputLevel { .. } => "set_output_level",
            ProtocolAction::RampOutputLevel { .. } => "ramp_output_level",
            ProtocolAction::MoveActuator { .. } => "move_actuator",
            ProtocolAction::SetIllumination { .. } => "set_illumination",
            ProtocolAction::Wait { .. } => "wait",
        }
    }

    /// Human-readable description for progress reporting.
    pub fn describe(&self) -> String {
        match self {
            ProtocolAction::SetOutputLevel { level } => format!("set laser output to {level}"),
            ProtocolAction::RampOutputLevel {
                from,
                to,
                duration_ms,
                steps,
            } => format!("ramp laser output {from} -> {to} over {duration_ms} ms in {steps} steps"),
            ProtocolAction::MoveActuator { position } => format!("move actuator to {position}"),
            ProtocolAction::SetIllumination { level } => format!("set illumination to {level}"),
            ProtocolAction::Wait { duration_ms } => format!("wait {duration_ms} ms"),
        }
    }
}

/// A [`ProtocolAction`] with optional per-step overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolStep {
    #[serde(flatten)]
    pub action: ProtocolAction,
    /// Overrides the engine's default retry count.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
    /// Overrides the engine's default per-action timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl From<ProtocolAction> for ProtocolStep {
    fn from(action: ProtocolAction) -> Self {
        Self {
            action,
            retries: None,
            timeout_ms: None,
        }
    }
}

/// An ordered treatment sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Protocol {
    pub name: String,
    pub steps: Vec<ProtocolStep>,
}

impl Protocol {
    /// Build a protocol from bare actions without overrides.
    pub fn new(name: impl Into<String>, actions: impl IntoIterator<Item = ProtocolAction>) -> Self {
        Self {
            name: name.into(),
            steps: actions.into_iter().map(ProtocolStep::from).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Progress notice emitted at each action boundary.  Observability only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolProgress {
    pub protocol: String,
    pub index: usize,
    pub total: usize,
    pub description: String,
}

// ────────────────────────────────────────────────────────────────────────────
// Audit / event sink
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

/// Category of an [`AuditEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    SafetyTransition,
    EmergencyStop,
    EmergencyReset,
    HeartbeatLost,
    HeartbeatRestored,
    ProtocolStarted,
    ActionBoundary,
    ProtocolCompleted,
    ProtocolFailed,
    DeviceFault,
}

/// Record handed to the external audit/log collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub timestamp: DateTime<Utc>,
    pub kind: AuditKind,
    pub severity: Severity,
    pub details: String,
}

impl AuditEvent {
    pub fn new(kind: AuditKind, severity: Severity, details: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
            severity,
            details: details.into(),
        }
    }
}

/// External audit collaborator.  The core only calls `record`; persistence
/// is the implementor's business.
pub trait EventSink: Send + Sync {
    fn record(&self, event: AuditEvent);
}

/// Sink that discards every record.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn record(&self, _event: AuditEvent) {}
}

/// Unified event wrapper for the event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// e.g., "photon-kernel::arbiter"
    pub source: String,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(source: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source: source.into(),
            payload,
        }
    }
}

/// Variants of data that can be routed over the event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EventPayload {
    Safety(SafetyTransition),
    Device { device: String, event: DeviceEvent },
    Progress(ProtocolProgress),
    Audit(AuditEvent),
}

// ────────────────────────────────────────────────────────────────────────────
// Errors
// ────────────────────────────────────────────────────────────────────────────

/// Error type shared by device channels, the arbiter and the engine.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PhotonError {
    #[error("Connection error on {device}: {details}")]
    Connection { device: String, details: String },

    #[error("Command timeout on {device} after {timeout_ms} ms")]
    CommandTimeout { device: String, timeout_ms: u64 },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Interlock violation: {0}")]
    InterlockViolation(String),

    #[error("Precondition not met: {0}")]
    PreconditionNotMet(String),

    #[error("Retry exhausted after {attempts} attempts: {last_error}")]
    RetryExhausted {
        attempts: u32,
        last_error: Box<PhotonError>,
    },

    #[error("Unknown safety condition: {0}")]
    UnknownCondition(String),

    #[error("Event channel error: {0}")]
    Channel(String),
}

impl PhotonError {
    /// `true` when the failure guarantees the command never reached the
    /// device, so re-sending it cannot duplicate a physical effect.
    pub fn is_pre_effect(&self) -> bool {
        matches!(
            self,
            PhotonError::Connection { .. } | PhotonError::Validation(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_safe_family_permits_action() {
        assert!(SafetyState::Safe.permits_action());
        assert!(SafetyState::Armed.permits_action());
        assert!(SafetyState::Treating.permits_action());
        assert!(!SafetyState::Unsafe.permits_action());
        assert!(!SafetyState::EmergencyStop.permits_action());
    }

    #[test]
    fn condition_names_match_flag_names() {
        assert_eq!(SafetyCondition::PhysicalInterlock.name(), "physical_interlock_ok");
        assert_eq!(SafetyCondition::PowerLimit.to_string(), "power_limit_ok");
        assert_eq!(
            SafetyCondition::Custom("skin_contact".into()).name(),
            "skin_contact"
        );
    }

    #[test]
    fn protocol_json_shape() {
        let raw = r#"{
            "name": "demo",
            "steps": [
                { "action": "SetOutputLevel", "level": 1.0 },
                { "action": "Wait", "duration_ms": 500, "timeout_ms": 900 },
                { "action": "MoveActuator", "position": 2.5, "retries": 0 }
            ]
        }"#;
        let protocol: Protocol = serde_json::from_str(raw).unwrap();
        assert_eq!(protocol.len(), 3);
        assert_eq!(
            protocol.steps[0].action,
            ProtocolAction::SetOutputLevel { level: 1.0 }
        );
        assert_eq!(protocol.steps[1].timeout_ms, Some(900));
        assert_eq!(protocol.steps[2].retries, Some(0));
    }

    #[test]
    fn action_routes_to_device_roles() {
        assert_eq!(
            ProtocolAction::RampOutputLevel {
                from: 0.0,
                to: 1.0,
                duration_ms: 100,
                steps: 4
            }
            .device(),
            Some(DeviceKind::Laser)
        );
        assert_eq!(
            ProtocolAction::MoveActuator { position: 0.0 }.device(),
            Some(DeviceKind::Actuator)
        );
        assert_eq!(ProtocolAction::Wait { duration_ms: 1 }.device(), None);
    }

    #[test]
    fn only_enable_output_is_enabling() {
        assert!(DeviceCommand::EnableOutput.is_enabling());
        assert!(!DeviceCommand::DisableOutput.is_enabling());
        assert!(!DeviceCommand::SetValue(1.0).is_enabling());
    }

    #[test]
    fn connection_errors_are_pre_effect() {
        let conn = PhotonError::Connection {
            device: "laser".into(),
            details: "port closed".into(),
        };
        let timeout = PhotonError::CommandTimeout {
            device: "laser".into(),
            timeout_ms: 100,
        };
        assert!(conn.is_pre_effect());
        assert!(!timeout.is_pre_effect());
    }

    #[test]
    fn photon_error_display() {
        let err = PhotonError::PreconditionNotMet("physical_interlock_ok is false".into());
        assert!(err.to_string().contains("Precondition not met"));

        let err2 = PhotonError::RetryExhausted {
            attempts: 3,
            last_error: Box::new(PhotonError::CommandTimeout {
                device: "actuator".into(),
                timeout_ms: 250,
            }),
        };
        assert!(err2.to_string().contains("3 attempts"));
        assert!(err2.to_string().contains("actuator"));
    }
}

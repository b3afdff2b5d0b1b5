//! [`ActionVerifier`] – load-time rule engine for protocol actions.
//!
//! Before a [`Protocol`] is executed, pass it through
//! [`ActionVerifier::verify_protocol`].  Structural checks run first (a
//! protocol needs at least one step, a ramp needs at least one step, every
//! numeric parameter must be finite), then every registered [`Rule`] in
//! insertion order.  The first violation is returned as
//! [`PhotonError::Validation`] and nothing is executed.
//!
//! Built-in rules:
//! - [`OutputCapRule`] – caps every laser output level a protocol requests.
//! - [`TravelLimitRule`] – keeps actuator targets within `[min, max]`.
//! - [`DwellLimitRule`] – bounds wait and ramp durations.

use photon_types::{PhotonError, Protocol, ProtocolAction};

// ────────────────────────────────────────────────────────────────────────────
// Rule trait
// ────────────────────────────────────────────────────────────────────────────

/// One invariant a protocol action must satisfy.
pub trait Rule: Send + Sync {
    /// Name used in violation messages.
    fn name(&self) -> &str;

    /// `Ok(())` when `action` satisfies the invariant.
    fn check(&self, action: &ProtocolAction) -> Result<(), PhotonError>;
}

// ────────────────────────────────────────────────────────────────────────────
// ActionVerifier
// ────────────────────────────────────────────────────────────────────────────

/// # Example
///
/// ```
/// use photon_kernel::action_verifier::{ActionVerifier, OutputCapRule};
/// use photon_types::ProtocolAction;
///
/// let mut verifier = ActionVerifier::new();
/// verifier.add_rule(Box::new(OutputCapRule { max_level: 5.0 }));
///
/// assert!(verifier.verify(&ProtocolAction::SetOutputLevel { level: 2.0 }).is_ok());
/// assert!(verifier.verify(&ProtocolAction::SetOutputLevel { level: 8.0 }).is_err());
/// ```
#[derive(Default)]
pub struct ActionVerifier {
    rules: Vec<Box<dyn Rule>>,
}

impl ActionVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rules are evaluated in insertion order.
    pub fn add_rule(&mut self, rule: Box<dyn Rule>) {
        self.rules.push(rule);
    }

    pub fn rule_names(&self) -> Vec<&str> {
        self.rules.iter().map(|r| r.name()).collect()
    }

    /// Validate one action.
    pub fn verify(&self, action: &ProtocolAction) -> Result<(), PhotonError> {
        check_structure(action)?;
        for rule in &self.rules {
            rule.check(action)?;
        }
        Ok(())
    }

    /// Validate every step of `protocol`, naming the failing step.
    pub fn verify_protocol(&self, protocol: &Protocol) -> Result<(), PhotonError> {
        if protocol.is_empty() {
            return Err(PhotonError::Validation(format!(
                "protocol '{}' has no steps",
                protocol.name
            )));
        }
        for (index, step) in protocol.steps.iter().enumerate() {
            self.verify(&step.action).map_err(|e| match e {
                PhotonError::Validation(msg) => {
                    PhotonError::Validation(format!("step {index} ({}): {msg}", step.action.label()))
                }
                other => other,
            })?;
        }
        Ok(())
    }
}

fn check_structure(action: &ProtocolAction) -> Result<(), PhotonError> {
    let finite = |name: &str, v: f64| {
        if v.is_finite() {
            Ok(())
        } else {
            Err(PhotonError::Validation(format!("{name} must be finite, got {v}")))
        }
    };
    match action {
        ProtocolAction::SetOutputLevel { level } | ProtocolAction::SetIllumination { level } => {
            finite("level", *level)
        }
        ProtocolAction::RampOutputLevel {
            from, to, steps, ..
        } => {
            finite("from", *from)?;
            finite("to", *to)?;
            if *steps == 0 {
                return Err(PhotonError::Validation(
                    "ramp needs at least one step".to_string(),
                ));
            }
            Ok(())
        }
        ProtocolAction::MoveActuator { position } => finite("position", *position),
        ProtocolAction::Wait { .. } => Ok(()),
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Built-in rules
// ────────────────────────────────────────────────────────────────────────────

/// Rejects laser output levels above `max_level`, including ramp end points.
pub struct OutputCapRule {
    pub max_level: f64,
}

impl Rule for OutputCapRule {
    fn name(&self) -> &str {
        "output_cap"
    }

    fn check(&self, action: &ProtocolAction) -> Result<(), PhotonError> {
        let peak = match action {
            ProtocolAction::SetOutputLevel { level } => *level,
            ProtocolAction::RampOutputLevel { from, to, .. } => from.max(*to),
            _ => return Ok(()),
        };
        if peak > self.max_level {
            return Err(PhotonError::Validation(format!(
                "output level {peak} exceeds cap {}",
                self.max_level
            )));
        }
        Ok(())
    }
}

/// Rejects actuator targets outside `[min, max]`.
pub struct TravelLimitRule {
    pub min: f64,
    pub max: f64,
}

impl Rule for TravelLimitRule {
    fn name(&self) -> &str {
        "travel_limit"
    }

    fn check(&self, action: &ProtocolAction) -> Result<(), PhotonError> {
        if let ProtocolAction::MoveActuator { position } = action
            && (*position < self.min || *position > self.max)
        {
            return Err(PhotonError::Validation(format!(
                "actuator position {position} out of [{}, {}]",
                self.min, self.max
            )));
        }
        Ok(())
    }
}

/// Rejects waits and ramps longer than `max_ms`.
pub struct DwellLimitRule {
    pub max_ms: u64,
}

impl Rule for DwellLimitRule {
    fn name(&self) -> &str {
        "dwell_limit"
    }

    fn check(&self, action: &ProtocolAction) -> Result<(), PhotonError> {
        let duration_ms = match action {
            ProtocolAction::Wait { duration_ms }
            | ProtocolAction::RampOutputLevel { duration_ms, .. } => *duration_ms,
            _ => return Ok(()),
        };
        if duration_ms > self.max_ms {
            return Err(PhotonError::Validation(format!(
                "{} of {duration_ms} ms exceeds limit {} ms",
                action.label(),
                self.max_ms
            )));
        }
        Ok(())
    }
}

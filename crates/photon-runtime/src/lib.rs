//! `photon-runtime` – Protocol Execution
//!
//! Runs treatment protocols against the device layer under continuous
//! supervision of the safety arbiter.
//!
//! # Modules
//!
//! - [`engine`] – [`ProtocolEngine`]: sequential executor with
//!   per-action timeouts, a retry policy that never re-sends motion after an
//!   ambiguous timeout, interruptible waits and a cloneable
//!   [`EngineControl`] for pause, resume and stop.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]: console
//!   logging (compact or JSON) plus optional OTLP span export.
//!
//! # Permission
//!
//! The engine never decides for itself whether emission is allowed.  It asks
//! [`SafetyArbiter`][photon_kernel::SafetyArbiter] before the run, at every
//! action boundary, before each laser command and while waiting, and treats
//! any revocation as terminal for the run.

pub mod engine;
pub mod telemetry;

pub use engine::{
    EngineConfig, EngineControl, ExecutionContext, ExecutionError, ExecutionReport, ProtocolEngine,
    RetryPolicy, RunState,
};

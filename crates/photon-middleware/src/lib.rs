//! `photon-middleware` – Event Plumbing
//!
//! Carries safety transitions, device events, protocol progress and audit
//! records to whoever is watching, without the safety core depending on
//! any of them.
//!
//! # Modules
//!
//! - [`bus`] – headless, typed, topic-based publish/subscribe event bus
//!   built on Tokio broadcast channels.
//! - [`sink`] – [`EventSink`][photon_types::EventSink] implementations:
//!   in-memory capture, `tracing` mirror and fan-out.

pub mod bus;
pub mod sink;

pub use bus::{EventBus, Topic, TopicReceiver};
pub use sink::{FanoutSink, MemorySink, TracingSink};

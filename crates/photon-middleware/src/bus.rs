//! Headless, typed, topic-based publish/subscribe event bus.
//!
//! Uses [`tokio::sync::broadcast`] channels so every subscriber receives
//! every message without any single subscriber blocking the others.  The
//! bus is for observers (operator console, recorders, the CLI printer);
//! nothing safety-relevant depends on a message being delivered.
//!
//! # Topics
//!
//! | Topic | Typical traffic |
//! |---|---|
//! | [`Topic::SafetyState`] | Arbiter transitions |
//! | [`Topic::Devices`] | Device channel events (connect, value, output, fault) |
//! | [`Topic::Protocol`] | Engine progress at each action boundary |
//! | [`Topic::Audit`] | Audit records mirrored from the [`EventSink`] path |

use photon_types::{
    AuditEvent, DeviceEvent, Event, EventPayload, EventSink, PhotonError, ProtocolProgress,
    SafetyTransition,
};
use tokio::sync::broadcast;
use tracing::{trace, warn};

/// Number of buffered events before old ones are dropped for slow
/// subscribers.
const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    SafetyState,
    Devices,
    Protocol,
    Audit,
}

impl Topic {
    /// Topic an event belongs on, from its payload.
    pub fn of(payload: &EventPayload) -> Topic {
        match payload {
            EventPayload::Safety(_) => Topic::SafetyState,
            EventPayload::Device { .. } => Topic::Devices,
            EventPayload::Progress(_) => Topic::Protocol,
            EventPayload::Audit(_) => Topic::Audit,
        }
    }
}

/// Shared event bus.  Clone it cheaply; all clones share the same
/// underlying broadcast channels.
#[derive(Clone, Debug)]
pub struct EventBus {
    safety: broadcast::Sender<Event>,
    devices: broadcast::Sender<Event>,
    protocol: broadcast::Sender<Event>,
    audit: broadcast::Sender<Event>,
}

impl EventBus {
    /// The `capacity` is applied to every topic channel independently.
    pub fn new(capacity: usize) -> Self {
        let (safety, _) = broadcast::channel(capacity);
        let (devices, _) = broadcast::channel(capacity);
        let (protocol, _) = broadcast::channel(capacity);
        let (audit, _) = broadcast::channel(capacity);
        Self {
            safety,
            devices,
            protocol,
            audit,
        }
    }

    /// Publish `event` to `topic`.
    ///
    /// Returns the number of receivers handed the event.
    ///
    /// # Errors
    ///
    /// [`PhotonError::Channel`] when nobody is subscribed to the topic.
    pub fn publish_to(&self, topic: Topic, event: Event) -> Result<usize, PhotonError> {
        self.sender(topic)
            .send(event)
            .map_err(|_| PhotonError::Channel(format!("no subscribers for topic {topic:?}")))
    }

    /// Publish to the topic derived from the payload, ignoring a missing
    /// audience.
    pub fn emit(&self, source: &str, payload: EventPayload) {
        let topic = Topic::of(&payload);
        if self.publish_to(topic, Event::new(source, payload)).is_err() {
            trace!(?topic, "event dropped, no subscribers");
        }
    }

    pub fn publish_safety(&self, transition: &SafetyTransition) {
        self.emit("photon-kernel::arbiter", EventPayload::Safety(transition.clone()));
    }

    pub fn publish_device(&self, device: &str, event: &DeviceEvent) {
        self.emit(
            &format!("photon-hal::{device}"),
            EventPayload::Device {
                device: device.to_string(),
                event: event.clone(),
            },
        );
    }

    pub fn publish_progress(&self, progress: &ProtocolProgress) {
        self.emit("photon-runtime::engine", EventPayload::Progress(progress.clone()));
    }

    /// Subscribe to one topic.
    pub fn subscribe_to(&self, topic: Topic) -> TopicReceiver {
        TopicReceiver {
            topic,
            receiver: self.sender(topic).subscribe(),
        }
    }

    fn sender(&self, topic: Topic) -> &broadcast::Sender<Event> {
        match topic {
            Topic::SafetyState => &self.safety,
            Topic::Devices => &self.devices,
            Topic::Protocol => &self.protocol,
            Topic::Audit => &self.audit,
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// Audit records go to [`Topic::Audit`], best effort.
impl EventSink for EventBus {
    fn record(&self, event: AuditEvent) {
        self.emit("photon::audit", EventPayload::Audit(event));
    }
}

// ---------------------------------------------------------------------------
// Topic receiver
// ---------------------------------------------------------------------------

/// An async receiver bound to a single [`Topic`].
pub struct TopicReceiver {
    topic: Topic,
    receiver: broadcast::Receiver<Event>,
}

impl TopicReceiver {
    /// Wait for the next event on this topic.
    ///
    /// `Err(RecvError::Lagged(n))` means `n` events were dropped for this
    /// subscriber; `Err(RecvError::Closed)` means the bus is gone.
    pub async fn recv(&mut self) -> Result<Event, broadcast::error::RecvError> {
        self.receiver.recv().await
    }

    /// Next event, skipping over lag.  `None` once the bus is gone.
    pub async fn next(&mut self) -> Option<Event> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(topic = ?self.topic, lagged_by = n, "topic receiver lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn topic(&self) -> Topic {
        self.topic
    }
}

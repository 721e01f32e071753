//! Broadcast event envelope.
//!
//! Every state change the core wants live clients to see is wrapped in an
//! [`Event`] and fanned out per channel.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Broadcast event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    /// A message was accepted and persisted.
    MessageCreated,
    /// A message was edited.
    MessageUpdated,
    /// A message was soft-deleted.
    MessageDeleted,
    /// An attachment moved through its upload lifecycle.
    AttachmentStatus,
    /// A recipient's delivery record advanced.
    DeliveryStatus,
    /// A moderation rule matched content in the channel.
    ModerationViolation,
    /// A reaction was added to a message.
    ReactionAdded,
    /// A reaction was removed from a message.
    ReactionRemoved,
}

impl EventKind {
    /// Every event kind, in declaration order.
    pub const ALL: [EventKind; 8] = [
        EventKind::MessageCreated,
        EventKind::MessageUpdated,
        EventKind::MessageDeleted,
        EventKind::AttachmentStatus,
        EventKind::DeliveryStatus,
        EventKind::ModerationViolation,
        EventKind::ReactionAdded,
        EventKind::ReactionRemoved,
    ];

    /// Wire name of the event type.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::MessageCreated => "message-created",
            EventKind::MessageUpdated => "message-updated",
            EventKind::MessageDeleted => "message-deleted",
            EventKind::AttachmentStatus => "attachment-status",
            EventKind::DeliveryStatus => "delivery-status",
            EventKind::ModerationViolation => "moderation-violation",
            EventKind::ReactionAdded => "reaction-added",
            EventKind::ReactionRemoved => "reaction-removed",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A broadcast record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Event type.
    #[serde(rename = "type")]
    pub kind: EventKind,
    /// Channel the event is scoped to.
    pub channel_id: Uuid,
    /// Event-specific body.
    pub payload: serde_json::Value,
    /// When the core emitted the event.
    pub timestamp: DateTime<Utc>,
}

impl Event {
    /// Create an event stamped with the current time.
    #[must_use]
    pub fn new(kind: EventKind, channel_id: Uuid, payload: serde_json::Value) -> Self {
        Self {
            kind,
            channel_id,
            payload,
            timestamp: Utc::now(),
        }
    }

    /// Deserialize the payload into a typed body.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload does not match `T`.
    pub fn payload_as<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_kind_wire_names() {
        for kind in EventKind::ALL {
            let encoded = serde_json::to_value(kind).unwrap();
            assert_eq!(encoded, json!(kind.as_str()));
        }
    }

    #[test]
    fn test_event_type_field_name() {
        let event = Event::new(EventKind::DeliveryStatus, Uuid::nil(), json!({}));
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "delivery-status");
        assert!(value.get("kind").is_none());
    }

    #[test]
    fn test_payload_as() {
        #[derive(Deserialize)]
        struct Body {
            progress: u8,
        }

        let event = Event::new(EventKind::AttachmentStatus, Uuid::nil(), json!({"progress": 100}));
        let body: Body = event.payload_as().unwrap();
        assert_eq!(body.progress, 100);
    }
}

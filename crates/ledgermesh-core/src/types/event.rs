//! Events: the ordered notification records fanned out to subscriptions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::SubscriptionRef;

/// Event type discriminant. The filter `events` regex matches against the
/// serialized form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    /// A message in an accepted batch was confirmed.
    #[serde(rename = "message-confirmed")]
    MessageConfirmed,
}

impl EventType {
    /// The wire name of the event type.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::MessageConfirmed => "message-confirmed",
        }
    }
}

impl std::str::FromStr for EventType {
    type Err = UnknownEventType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "message-confirmed" => Ok(Self::MessageConfirmed),
            other => Err(UnknownEventType {
                name: other.to_string(),
            }),
        }
    }
}

/// An event type name with no known discriminant.
#[derive(Debug, thiserror::Error)]
#[error("unknown event type '{name}'")]
pub struct UnknownEventType {
    /// The unrecognized wire name.
    pub name: String,
}

/// A persisted event.
///
/// `sequence` is assigned by the store at insert time and is strictly
/// increasing per process. Events are never mutated after insert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Store-assigned position in the global event order.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sequence: Option<i64>,

    #[serde(rename = "type")]
    pub event_type: EventType,

    /// The entity this event refers to (the message id for
    /// `message-confirmed`).
    pub reference: Uuid,

    pub namespace: String,

    pub created: DateTime<Utc>,
}

impl Event {
    /// Builds an unsequenced event; the store assigns `sequence` on insert.
    #[must_use]
    pub fn new(
        event_type: EventType,
        reference: Uuid,
        namespace: impl Into<String>,
        created: DateTime<Utc>,
    ) -> Self {
        Self {
            sequence: None,
            event_type,
            reference,
            namespace: namespace.into(),
            created,
        }
    }
}

/// One event dispatched to one subscription, awaiting an ack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventDelivery {
    /// Delivery id echoed back in the consumer's ack.
    pub id: Uuid,

    pub event: Event,

    pub subscription: SubscriptionRef,
}

/// The consumer's response to an [`EventDelivery`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventDeliveryResponse {
    /// The delivery id being acknowledged.
    pub id: Uuid,

    /// True when the consumer refused the event.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub rejected: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub info: Option<String>,
}

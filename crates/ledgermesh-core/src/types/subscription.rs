//! Durable subscription definitions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifies a subscription by its unique `(namespace, name)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionRef {
    pub namespace: String,
    pub name: String,
}

/// Regex filters restricting which events a subscription receives.
///
/// An empty pattern matches everything. `events` matches the event type;
/// `topic`, `context`, and `group` match the corresponding fields of the
/// referenced message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionFilter {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub events: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub topic: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub context: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub group: String,
}

impl SubscriptionFilter {
    /// True when no pattern is set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
            && self.topic.is_empty()
            && self.context.is_empty()
            && self.group.is_empty()
    }
}

/// Where a brand-new subscription starts reading the event stream.
///
/// Carried on the wire as `"oldest"`, `"newest"`, or a decimal sequence
/// number rendered as a string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FirstEvent(pub String);

impl FirstEvent {
    /// Starts at sequence zero, replaying the full retained stream.
    #[must_use]
    pub fn oldest() -> Self {
        Self("oldest".to_string())
    }

    /// Starts after the highest sequence at registration time.
    #[must_use]
    pub fn newest() -> Self {
        Self("newest".to_string())
    }

    /// Resolves the starting checkpoint given the current head sequence.
    ///
    /// Unparseable values anchor at the head, the safe default for a
    /// consumer that asked for something the server cannot honour.
    #[must_use]
    pub fn starting_sequence(&self, head: i64) -> i64 {
        match self.0.as_str() {
            "" | "newest" => head,
            "oldest" => 0,
            other => other.parse().unwrap_or(head),
        }
    }
}

/// Delivery tuning options on a subscription.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_event: Option<FirstEvent>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_enabled: Option<bool>,

    /// Maximum time to hold a partially filled batch, e.g. `"500ms"`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_timeout: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<u64>,
}

impl SubscriptionOptions {
    /// True when every option is unset.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.first_event.is_none()
            && self.batch_enabled.is_none()
            && self.batch_timeout.is_none()
            && self.batch_size.is_none()
    }
}

/// A durable subscription definition, unique on `(namespace, name)`.
///
/// `id` is generated on first upsert and immutable afterwards; an upsert
/// carrying a different non-null id fails with `IdMismatch`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,

    pub namespace: String,
    pub name: String,

    /// Name of the transport plugin that delivers this subscription.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub transport: String,

    #[serde(default, skip_serializing_if = "SubscriptionFilter::is_empty")]
    pub filter: SubscriptionFilter,

    #[serde(default, skip_serializing_if = "SubscriptionOptions::is_empty")]
    pub options: SubscriptionOptions,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
}

impl Subscription {
    /// The `(namespace, name)` reference of this subscription.
    #[must_use]
    pub fn subscription_ref(&self) -> SubscriptionRef {
        SubscriptionRef {
            namespace: self.namespace.clone(),
            name: self.name.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_event_resolution() {
        assert_eq!(FirstEvent::oldest().starting_sequence(100), 0);
        assert_eq!(FirstEvent::newest().starting_sequence(100), 100);
        assert_eq!(FirstEvent("42".to_string()).starting_sequence(100), 42);
        assert_eq!(FirstEvent("bogus".to_string()).starting_sequence(100), 100);
    }

    #[test]
    fn empty_filter_and_options_omitted() {
        let sub = Subscription {
            id: None,
            namespace: "ns1".to_string(),
            name: "sub1".to_string(),
            transport: String::new(),
            filter: SubscriptionFilter::default(),
            options: SubscriptionOptions::default(),
            created: None,
        };
        let json = serde_json::to_string(&sub).unwrap();
        assert_eq!(json, r#"{"namespace":"ns1","name":"sub1"}"#);
    }

    #[test]
    fn full_subscription_round_trips_byte_equal() {
        let sub = Subscription {
            id: Some(Uuid::new_v4()),
            namespace: "ns1".to_string(),
            name: "sub1".to_string(),
            transport: "websockets".to_string(),
            filter: SubscriptionFilter {
                events: "message-confirmed".to_string(),
                topic: "topic.*".to_string(),
                context: "context.*".to_string(),
                group: "group.*".to_string(),
            },
            options: SubscriptionOptions {
                first_event: Some(FirstEvent::newest()),
                batch_enabled: Some(true),
                batch_timeout: Some("500ms".to_string()),
                batch_size: Some(50),
            },
            created: Some(Utc::now()),
        };
        let json = serde_json::to_string(&sub).unwrap();
        let back: Subscription = serde_json::from_str(&json).unwrap();
        assert_eq!(serde_json::to_string(&back).unwrap(), json);
    }
}

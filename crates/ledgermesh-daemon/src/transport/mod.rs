//! Transport plugin seam.
//!
//! Transports own consumer sockets; the event core owns subscriptions
//! and delivery ordering. The two meet through a pair of capability
//! traits exchanged at construction - the core hands each transport a
//! [`Callbacks`] handle, and each transport exposes [`Transport`] to the
//! core. Neither side reaches the other through a global registry, so
//! both are independently testable with fakes.

use std::sync::Arc;

use thiserror::Error;

use ledgermesh_core::store::StoreError;
use ledgermesh_core::types::{
    EventDelivery, EventDeliveryResponse, SubscriptionFilter, SubscriptionOptions, SubscriptionRef,
};

pub mod websockets;

/// Decides whether a connection wants deliveries for a durable
/// subscription.
pub type SubscriptionMatcher = Arc<dyn Fn(&SubscriptionRef) -> bool + Send + Sync>;

/// Failures delivering an event to a consumer connection.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TransportError {
    /// The connection id does not resolve to a live socket.
    #[error("connection '{conn_id}' is not active")]
    ConnectionNotActive {
        /// The connection that is gone.
        conn_id: String,
    },

    /// The connection's outbound queue is full; the delivery was not
    /// enqueued and will be re-dispatched later.
    #[error("outbound queue full for connection '{conn_id}'")]
    QueueFull {
        /// The backpressured connection.
        conn_id: String,
    },

    /// The delivery could not be serialized for the wire.
    #[error("delivery could not be encoded: {reason}")]
    Encode {
        /// Serialization failure detail.
        reason: String,
    },
}

/// Failures registering a subscription from a transport.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CallbackError {
    /// A filter pattern failed to compile.
    #[error("invalid subscription filter pattern '{pattern}': {reason}")]
    InvalidFilter {
        /// The offending pattern.
        pattern: String,
        /// Compile failure detail.
        reason: String,
    },

    /// The persistence gateway failed.
    #[error(transparent)]
    Storage(#[from] StoreError),
}

/// A pluggable consumer-facing transport.
pub trait Transport: Send + Sync {
    /// The plugin name, matched against `Subscription::transport`.
    fn name(&self) -> &str;

    /// Enqueues one delivery onto a connection's outbound writer.
    ///
    /// # Errors
    ///
    /// [`TransportError::ConnectionNotActive`] when the connection is
    /// gone, or [`TransportError::QueueFull`] under backpressure. Either
    /// way the event stays undelivered and redelivers later.
    fn delivery_request(
        &self,
        conn_id: &str,
        delivery: EventDelivery,
    ) -> Result<(), TransportError>;
}

/// The event core's surface transports call back into.
pub trait Callbacks: Send + Sync {
    /// Creates a runtime-only subscription bound to this connection,
    /// dropped when the connection closes.
    ///
    /// # Errors
    ///
    /// Returns [`CallbackError::InvalidFilter`] for an uncompilable
    /// pattern or a storage error resolving the first-event anchor.
    fn ephemeral_subscription(
        &self,
        conn_id: &str,
        namespace: &str,
        filter: &SubscriptionFilter,
        options: &SubscriptionOptions,
    ) -> Result<(), CallbackError>;

    /// Associates a durable-subscription matcher with the connection.
    fn register_connection(&self, conn_id: &str, matcher: SubscriptionMatcher);

    /// Ack or nack for an inflight delivery. Unknown delivery ids are
    /// ignored, which makes acks idempotent.
    fn delivery_response(&self, conn_id: &str, response: EventDeliveryResponse);

    /// Cleanup hook invoked after the transport has dropped its own
    /// record of the connection. Idempotent.
    fn connection_closed(&self, conn_id: &str);
}

//! Connection dispatcher: the registry of live consumer connections.
//!
//! The dispatcher owns the `conn_id → connection` map and implements the
//! [`Callbacks`] capability handed to transports. The map mutex is held
//! only across map mutations - never across transport calls or storage
//! I/O - and connection removal happens before the poller is notified,
//! so a close racing a delivery can never deadlock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::debug;

use ledgermesh_core::store::Database;
use ledgermesh_core::types::{
    EventDelivery, EventDeliveryResponse, FirstEvent, Subscription, SubscriptionFilter,
    SubscriptionOptions,
};

use super::subscriptions::RuntimeSubscription;
use crate::transport::{
    CallbackError, Callbacks, SubscriptionMatcher, Transport, TransportError,
};

/// Wakeups and responses routed from transports to the poller.
#[derive(Debug)]
pub(crate) enum ControlEvent {
    /// A consumer acked or nacked an inflight delivery.
    Response {
        conn_id: String,
        response: EventDeliveryResponse,
    },

    /// A connection is gone; its inflight deliveries redeliver later.
    ConnectionClosed { conn_id: String },

    /// A matcher or ephemeral subscription was registered.
    ConnectionsChanged,
}

/// A runtime-only subscription bound to one connection.
pub(crate) struct EphemeralSubscription {
    pub runtime: Arc<RuntimeSubscription>,
    /// First-event anchor resolved at registration time.
    pub start_sequence: i64,
}

struct ConnectionEntry {
    transport: String,
    matcher: Option<SubscriptionMatcher>,
    ephemeral: Option<Arc<EphemeralSubscription>>,
}

/// A point-in-time copy of one connection's routing state, taken under
/// the map mutex and used outside it.
pub(crate) struct ConnectionSnapshot {
    pub conn_id: String,
    pub transport: String,
    pub matcher: Option<SubscriptionMatcher>,
    pub ephemeral: Option<Arc<EphemeralSubscription>>,
}

/// The connection registry and callback surface.
pub struct Dispatcher {
    database: Arc<dyn Database>,
    transports: RwLock<HashMap<String, Arc<dyn Transport>>>,
    connections: Mutex<HashMap<String, ConnectionEntry>>,
    control_tx: mpsc::UnboundedSender<ControlEvent>,
}

impl Dispatcher {
    pub(crate) fn new(
        database: Arc<dyn Database>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ControlEvent>) {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                database,
                transports: RwLock::new(HashMap::new()),
                connections: Mutex::new(HashMap::new()),
                control_tx,
            }),
            control_rx,
        )
    }

    /// Registers a transport plugin and returns the callbacks capability
    /// it calls back through.
    pub(crate) fn register_transport(
        self: &Arc<Self>,
        transport: Arc<dyn Transport>,
    ) -> Arc<dyn Callbacks> {
        let name = transport.name().to_string();
        self.transports
            .write()
            .unwrap()
            .insert(name.clone(), transport);
        Arc::new(TransportCallbacks {
            dispatcher: Arc::clone(self),
            transport: name,
        })
    }

    /// Copies the live connection set out from under the mutex.
    pub(crate) fn snapshot(&self) -> Vec<ConnectionSnapshot> {
        let connections = self.connections.lock().unwrap();
        connections
            .iter()
            .map(|(conn_id, entry)| ConnectionSnapshot {
                conn_id: conn_id.clone(),
                transport: entry.transport.clone(),
                matcher: entry.matcher.clone(),
                ephemeral: entry.ephemeral.clone(),
            })
            .collect()
    }

    /// Hands one delivery to a connection's transport. No locks are held
    /// across the transport call.
    pub(crate) fn deliver(
        &self,
        transport: &str,
        conn_id: &str,
        delivery: EventDelivery,
    ) -> Result<(), TransportError> {
        let plugin = {
            let transports = self.transports.read().unwrap();
            transports.get(transport).cloned()
        };
        match plugin {
            Some(plugin) => plugin.delivery_request(conn_id, delivery),
            None => Err(TransportError::ConnectionNotActive {
                conn_id: conn_id.to_string(),
            }),
        }
    }

    fn with_entry(&self, transport: &str, conn_id: &str, f: impl FnOnce(&mut ConnectionEntry)) {
        let mut connections = self.connections.lock().unwrap();
        let entry = connections
            .entry(conn_id.to_string())
            .or_insert_with(|| ConnectionEntry {
                transport: transport.to_string(),
                matcher: None,
                ephemeral: None,
            });
        f(entry);
    }

    fn wake(&self, event: ControlEvent) {
        // The poller holds the receiver for the life of the process; a
        // send failure just means shutdown already tore it down.
        let _ = self.control_tx.send(event);
    }
}

/// Per-transport [`Callbacks`] capability carrying the plugin name, so
/// the registry knows which transport each connection belongs to.
struct TransportCallbacks {
    dispatcher: Arc<Dispatcher>,
    transport: String,
}

impl Callbacks for TransportCallbacks {
    fn ephemeral_subscription(
        &self,
        conn_id: &str,
        namespace: &str,
        filter: &SubscriptionFilter,
        options: &SubscriptionOptions,
    ) -> Result<(), CallbackError> {
        // The runtime name is the connection id: unique for the life of
        // the connection, never persisted.
        let definition = Subscription {
            id: None,
            namespace: namespace.to_string(),
            name: conn_id.to_string(),
            transport: self.transport.clone(),
            filter: filter.clone(),
            options: options.clone(),
            created: Some(Utc::now()),
        };
        let runtime = RuntimeSubscription::compile(definition)?;

        let head = self.dispatcher.database.highest_event_sequence()?;
        let start_sequence = options
            .first_event
            .clone()
            .unwrap_or_else(FirstEvent::newest)
            .starting_sequence(head);

        debug!(conn_id, namespace, start_sequence, "ephemeral subscription registered");
        self.dispatcher.with_entry(&self.transport, conn_id, |entry| {
            entry.ephemeral = Some(Arc::new(EphemeralSubscription {
                runtime,
                start_sequence,
            }));
        });
        self.dispatcher.wake(ControlEvent::ConnectionsChanged);
        Ok(())
    }

    fn register_connection(&self, conn_id: &str, matcher: SubscriptionMatcher) {
        debug!(conn_id, transport = %self.transport, "connection registered");
        self.dispatcher.with_entry(&self.transport, conn_id, |entry| {
            entry.matcher = Some(matcher);
        });
        self.dispatcher.wake(ControlEvent::ConnectionsChanged);
    }

    fn delivery_response(&self, conn_id: &str, response: EventDeliveryResponse) {
        self.dispatcher.wake(ControlEvent::Response {
            conn_id: conn_id.to_string(),
            response,
        });
    }

    fn connection_closed(&self, conn_id: &str) {
        let removed = {
            let mut connections = self.dispatcher.connections.lock().unwrap();
            connections.remove(conn_id).is_some()
        };
        if removed {
            debug!(conn_id, "connection closed");
            self.dispatcher.wake(ControlEvent::ConnectionClosed {
                conn_id: conn_id.to_string(),
            });
        } else {
            // Idempotent: a connection that never registered, or a
            // duplicate close, is not an error.
            debug!(conn_id, "close for unregistered connection");
        }
    }
}

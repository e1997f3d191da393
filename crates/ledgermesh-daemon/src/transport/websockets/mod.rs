//! WebSocket transport plugin.
//!
//! Upgrades `GET /ws` and runs the client `start`/`ack` protocol over
//! JSON frames:
//!
//! - client → server: `{"type":"start", "namespace", "name",
//!   "ephemeral"?, "filter"?, "options"?}`, `{"type":"listen",
//!   "topic"}`, `{"type":"ack", "id"}`
//! - server → client: the serialized `EventDelivery`
//!
//! Query-string parameters on the upgrade request can carry an
//! auto-start action, so simple consumers never send a `start` frame.
//! Each connection runs one reader and one writer task; one inflight
//! delivery per subscription is the ordering unit, enforced upstream by
//! the poller.

mod connection;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use base64::Engine as _;
use serde::Deserialize;
use thiserror::Error;
use tracing::{error, info};
use uuid::Uuid;

use ledgermesh_core::shutdown::ShutdownSignal;
use ledgermesh_core::types::{EventDelivery, SubscriptionFilter, SubscriptionOptions};

use crate::config::WebSocketConfig;
use crate::transport::{CallbackError, Callbacks, Transport, TransportError};
use connection::WsConnection;

/// Plugin name, matched against `Subscription::transport`.
pub const TRANSPORT_NAME: &str = "websockets";

/// Client protocol frames.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientAction {
    /// Starts delivery on this connection.
    Start {
        namespace: Option<String>,
        name: Option<String>,
        #[serde(default)]
        ephemeral: bool,
        #[serde(default)]
        filter: SubscriptionFilter,
        #[serde(default)]
        options: SubscriptionOptions,
    },

    /// Shorthand for an ephemeral start filtered to one topic pattern.
    Listen {
        namespace: Option<String>,
        topic: String,
    },

    /// Acknowledges a delivery by its id.
    Ack { id: Uuid },
}

/// Auto-start parameters carried on the upgrade query string.
#[derive(Debug, Default, Deserialize)]
pub struct AutoStartQuery {
    pub namespace: Option<String>,
    pub name: Option<String>,
    #[serde(default)]
    pub ephemeral: bool,
    pub topic: Option<String>,
}

impl AutoStartQuery {
    fn is_empty(&self) -> bool {
        self.namespace.is_none() && self.name.is_none() && !self.ephemeral && self.topic.is_none()
    }
}

/// Client protocol violations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WsError {
    /// A start action needs a namespace and name unless it is ephemeral.
    #[error("invalid start action: namespace and name are required unless ephemeral")]
    InvalidStartAction,

    /// The frame was not a valid client action.
    #[error("malformed client frame: {reason}")]
    Protocol {
        /// Parse failure detail.
        reason: String,
    },

    /// The core rejected the subscription registration.
    #[error(transparent)]
    Callback(#[from] CallbackError),
}

/// The WebSocket transport: a registry of live sockets plus the axum
/// upgrade surface.
pub struct WebSockets {
    shutdown: ShutdownSignal,
    config: WebSocketConfig,
    callbacks: OnceLock<Arc<dyn Callbacks>>,
    connections: Mutex<HashMap<String, Arc<WsConnection>>>,
}

impl WebSockets {
    #[must_use]
    pub fn new(shutdown: ShutdownSignal, config: WebSocketConfig) -> Arc<Self> {
        Arc::new(Self {
            shutdown,
            config,
            callbacks: OnceLock::new(),
            connections: Mutex::new(HashMap::new()),
        })
    }

    /// Wires the core's callbacks capability. Must be called once before
    /// the router accepts connections.
    pub fn init(&self, callbacks: Arc<dyn Callbacks>) {
        let _ = self.callbacks.set(callbacks);
    }

    /// The HTTP surface: `GET /ws` upgrades to the consumer protocol.
    #[must_use]
    pub fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .route("/ws", get(upgrade_handler))
            .with_state(Arc::clone(self))
    }

    /// Waits for every open connection to finish closing. The map lock
    /// is released before waiting.
    pub async fn wait_closed(&self) {
        let connections: Vec<Arc<WsConnection>> =
            self.connections.lock().unwrap().values().cloned().collect();
        for conn in connections {
            conn.wait_close().await;
        }
    }

    async fn handle_socket(
        self: Arc<Self>,
        socket: axum::extract::ws::WebSocket,
        auto_start: AutoStartQuery,
        principal: Option<String>,
    ) {
        let Some(callbacks) = self.callbacks.get() else {
            error!("websocket accepted before transport init");
            return;
        };

        let conn_id = Uuid::new_v4().to_string();
        let (conn, outbound_rx) = WsConnection::new(
            conn_id.clone(),
            Arc::clone(callbacks),
            self.config.send_queue_length,
            principal,
        );
        self.connections
            .lock()
            .unwrap()
            .insert(conn_id.clone(), Arc::clone(&conn));
        info!(conn_id, "websocket connected");

        conn.run(socket, outbound_rx, auto_start, self.shutdown.clone())
            .await;

        // Drop our record before the core learns of the close, so the
        // close callback can never re-enter a live connection.
        let removed = self.connections.lock().unwrap().remove(&conn_id).is_some();
        if removed {
            callbacks.connection_closed(&conn_id);
        }
        info!(conn_id, "websocket disconnected");
    }
}

impl Transport for WebSockets {
    fn name(&self) -> &str {
        TRANSPORT_NAME
    }

    fn delivery_request(
        &self,
        conn_id: &str,
        delivery: EventDelivery,
    ) -> Result<(), TransportError> {
        let conn = {
            let connections = self.connections.lock().unwrap();
            connections.get(conn_id).cloned()
        };
        match conn {
            Some(conn) => conn.dispatch(&delivery),
            None => Err(TransportError::ConnectionNotActive {
                conn_id: conn_id.to_string(),
            }),
        }
    }
}

async fn upgrade_handler(
    State(ws): State<Arc<WebSockets>>,
    Query(auto_start): Query<AutoStartQuery>,
    headers: HeaderMap,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    match upgrade {
        Ok(upgrade) => {
            let principal = basic_auth_user(&headers);
            upgrade.on_upgrade(move |socket| ws.handle_socket(socket, auto_start, principal))
        }
        Err(rejection) => {
            error!(%rejection, "websocket upgrade failed");
            rejection.into_response()
        }
    }
}

/// The username from a basic-auth header, if one was presented. The
/// credential itself is left to the fronting proxy; only the identity is
/// recorded against the connection.
fn basic_auth_user(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let encoded = value.strip_prefix("Basic ")?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    Some(decoded.split_once(':')?.0.to_string())
}

//! One consumer connection: reader loop, writer task, protocol state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error};
use uuid::Uuid;

use ledgermesh_core::shutdown::ShutdownSignal;
use ledgermesh_core::types::{
    EventDelivery, EventDeliveryResponse, SubscriptionFilter, SubscriptionOptions, SubscriptionRef,
};

use super::{AutoStartQuery, ClientAction, WsError};
use crate::transport::{Callbacks, TransportError};

/// A live consumer connection. `pending` until the first valid start
/// action, then `started`; terminated by socket close or a fatal
/// protocol error.
pub(super) struct WsConnection {
    pub(super) conn_id: String,
    callbacks: Arc<dyn Callbacks>,
    outbound: mpsc::Sender<Message>,
    closed_tx: watch::Sender<bool>,
    closed_rx: watch::Receiver<bool>,
    started: AtomicBool,
    principal: Option<String>,
}

impl WsConnection {
    pub(super) fn new(
        conn_id: String,
        callbacks: Arc<dyn Callbacks>,
        send_queue_length: usize,
        principal: Option<String>,
    ) -> (Arc<Self>, mpsc::Receiver<Message>) {
        let (outbound, outbound_rx) = mpsc::channel(send_queue_length.max(1));
        let (closed_tx, closed_rx) = watch::channel(false);
        (
            Arc::new(Self {
                conn_id,
                callbacks,
                outbound,
                closed_tx,
                closed_rx,
                started: AtomicBool::new(false),
                principal,
            }),
            outbound_rx,
        )
    }

    /// Enqueues a serialized delivery onto the writer.
    ///
    /// # Errors
    ///
    /// [`TransportError::QueueFull`] when the writer is backpressured,
    /// [`TransportError::ConnectionNotActive`] when the writer is gone.
    pub(super) fn dispatch(&self, delivery: &EventDelivery) -> Result<(), TransportError> {
        let frame = serde_json::to_string(delivery).map_err(|e| TransportError::Encode {
            reason: e.to_string(),
        })?;
        match self.outbound.try_send(Message::Text(frame.into())) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(TransportError::QueueFull {
                conn_id: self.conn_id.clone(),
            }),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(TransportError::ConnectionNotActive {
                conn_id: self.conn_id.clone(),
            }),
        }
    }

    /// Resolves once the connection has fully closed.
    pub(super) async fn wait_close(&self) {
        let mut rx = self.closed_rx.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Runs the connection to completion: spawns the writer task,
    /// applies any auto-start from the upgrade query, then reads frames
    /// until close or a protocol error.
    pub(super) async fn run(
        self: &Arc<Self>,
        socket: WebSocket,
        outbound_rx: mpsc::Receiver<Message>,
        auto_start: AutoStartQuery,
        shutdown: ShutdownSignal,
    ) {
        let (sink, stream) = socket.split();
        let writer = tokio::spawn(write_loop(
            sink,
            outbound_rx,
            self.closed_rx.clone(),
            shutdown,
        ));

        if self.process_auto_start(auto_start) {
            self.read_loop(stream).await;
        }

        // Release the writer, then wait for it to flush its close frame.
        let _ = self.closed_tx.send(true);
        let _ = writer.await;
    }

    /// Applies auto-start parameters. Returns false when the parameters
    /// were invalid and the connection should close without reading.
    fn process_auto_start(&self, auto_start: AutoStartQuery) -> bool {
        if auto_start.is_empty() {
            return true;
        }
        let filter = SubscriptionFilter {
            topic: auto_start.topic.clone().unwrap_or_default(),
            ..SubscriptionFilter::default()
        };
        let result = self.start(
            auto_start.namespace,
            auto_start.name,
            auto_start.ephemeral,
            filter,
            SubscriptionOptions::default(),
        );
        if let Err(e) = result {
            error!(conn_id = %self.conn_id, %e, "invalid auto-start parameters");
            return false;
        }
        true
    }

    async fn read_loop(&self, mut stream: SplitStream<WebSocket>) {
        while let Some(message) = stream.next().await {
            match message {
                Ok(Message::Text(text)) => {
                    if let Err(e) = self.handle_frame(text.as_str()) {
                        error!(conn_id = %self.conn_id, %e, "client protocol error");
                        return;
                    }
                }
                Ok(Message::Binary(_)) => {
                    error!(conn_id = %self.conn_id, "unexpected binary frame");
                    return;
                }
                Ok(Message::Close(_)) => return,
                // Ping/pong are answered by the protocol layer.
                Ok(Message::Ping(_) | Message::Pong(_)) => {}
                Err(e) => {
                    debug!(conn_id = %self.conn_id, %e, "socket read failed");
                    return;
                }
            }
        }
    }

    fn handle_frame(&self, text: &str) -> Result<(), WsError> {
        let action: ClientAction =
            serde_json::from_str(text).map_err(|e| WsError::Protocol {
                reason: e.to_string(),
            })?;
        match action {
            ClientAction::Start {
                namespace,
                name,
                ephemeral,
                filter,
                options,
            } => self.start(namespace, name, ephemeral, filter, options),
            ClientAction::Listen { namespace, topic } => self.start(
                namespace,
                None,
                true,
                SubscriptionFilter {
                    topic,
                    ..SubscriptionFilter::default()
                },
                SubscriptionOptions::default(),
            ),
            ClientAction::Ack { id } => {
                if !self.started.load(Ordering::SeqCst) {
                    // Nothing can be inflight yet; the response is
                    // dropped upstream as unknown.
                    debug!(conn_id = %self.conn_id, "ack before start");
                }
                self.callbacks.delivery_response(
                    &self.conn_id,
                    EventDeliveryResponse {
                        id,
                        rejected: false,
                        info: None,
                    },
                );
                Ok(())
            }
        }
    }

    fn start(
        &self,
        namespace: Option<String>,
        name: Option<String>,
        ephemeral: bool,
        filter: SubscriptionFilter,
        options: SubscriptionOptions,
    ) -> Result<(), WsError> {
        if ephemeral {
            let namespace = namespace.unwrap_or_default();
            self.callbacks
                .ephemeral_subscription(&self.conn_id, &namespace, &filter, &options)?;
        } else {
            let (Some(namespace), Some(name)) = (namespace, name) else {
                return Err(WsError::InvalidStartAction);
            };
            if namespace.is_empty() || name.is_empty() {
                return Err(WsError::InvalidStartAction);
            }
            self.callbacks.register_connection(
                &self.conn_id,
                Arc::new(move |subscription_ref: &SubscriptionRef| {
                    subscription_ref.namespace == namespace && subscription_ref.name == name
                }),
            );
        }
        if let Some(principal) = &self.principal {
            debug!(conn_id = %self.conn_id, principal, "connection started");
        }
        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// The single writer task for one connection. Drains the outbound queue
/// onto the socket and sends a close frame when released.
async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound_rx: mpsc::Receiver<Message>,
    mut closed_rx: watch::Receiver<bool>,
    shutdown: ShutdownSignal,
) {
    loop {
        tokio::select! {
            message = outbound_rx.recv() => {
                match message {
                    Some(message) => {
                        if sink.send(message).await.is_err() {
                            return;
                        }
                    }
                    None => break,
                }
            }
            changed = closed_rx.changed() => {
                if changed.is_err() || *closed_rx.borrow() {
                    break;
                }
            }
            () = shutdown.cancelled() => break,
        }
    }
    let _ = sink.send(Message::Close(None)).await;
}

//! The event manager: ingestion, fan-out, and the transport seam.
//!
//! Construction wires the capability handles once - the shutdown signal,
//! retry policy, gateway and content-store handles are captured here and
//! never mutated. Transports register through
//! [`EventManager::register_transport`] and receive their callbacks
//! capability in return; the ledger adapter drives the
//! [`LedgerEvents`] implementation.

mod aggregator;
mod dispatch;
mod poller;
mod subscriptions;

use std::sync::{Arc, Mutex};

use serde_json::{Map, Value};
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use ledgermesh_core::contentstore::ContentStore;
use ledgermesh_core::ledger::{BroadcastBatch, LedgerEventError, LedgerEvents};
use ledgermesh_core::shutdown::ShutdownSignal;
use ledgermesh_core::store::Database;
use ledgermesh_core::BoxFuture;

use crate::config::DaemonConfig;
use crate::transport::{Callbacks, Transport};
use aggregator::Aggregator;
use dispatch::Dispatcher;
use poller::{EventPoller, PollerSettings};

pub use subscriptions::{CompiledFilter, RuntimeSubscription, SubscriptionRegistry};

/// The event-aggregation and subscription-delivery core.
pub struct EventManager {
    aggregator: Aggregator,
    dispatcher: Arc<Dispatcher>,
    new_events_tx: mpsc::UnboundedSender<Uuid>,
    poller: Mutex<Option<EventPoller>>,
    closed_rx: watch::Receiver<bool>,
}

impl EventManager {
    /// Builds the event core over a persistence gateway and content
    /// store. The poller does not run until [`EventManager::start`].
    #[must_use]
    pub fn new(
        config: &DaemonConfig,
        shutdown: ShutdownSignal,
        database: Arc<dyn Database>,
        content_store: Arc<dyn ContentStore>,
    ) -> Self {
        let (new_events_tx, new_events_rx) = mpsc::unbounded_channel();
        let (dispatcher, control_rx) = Dispatcher::new(Arc::clone(&database));
        let (closed_tx, closed_rx) = watch::channel(false);

        let retry = config.aggregator.retry();
        let aggregator = Aggregator::new(
            Arc::clone(&database),
            content_store,
            retry.clone(),
            shutdown.clone(),
            new_events_tx.clone(),
        );
        let poller = EventPoller::new(
            database,
            Arc::clone(&dispatcher),
            retry,
            shutdown,
            PollerSettings {
                batch_size: config.poller.batch_size,
                tick: config.poller.tick(),
            },
            new_events_rx,
            control_rx,
            closed_tx,
        );

        Self {
            aggregator,
            dispatcher,
            new_events_tx,
            poller: Mutex::new(Some(poller)),
            closed_rx,
        }
    }

    /// Registers a transport plugin, returning the callbacks capability
    /// the plugin calls back through.
    pub fn register_transport(&self, transport: Arc<dyn Transport>) -> Arc<dyn Callbacks> {
        self.dispatcher.register_transport(transport)
    }

    /// A sender that wakes the poller; many sends coalesce to one scan.
    #[must_use]
    pub fn new_events(&self) -> mpsc::UnboundedSender<Uuid> {
        self.new_events_tx.clone()
    }

    /// Spawns the poller loop. Idempotent; later calls are no-ops.
    pub fn start(&self) {
        if let Some(poller) = self.poller.lock().unwrap().take() {
            tokio::spawn(poller.run());
        }
    }

    /// Waits until the poller loop has fully returned after shutdown.
    /// Returns immediately when the poller was never started.
    pub async fn wait_stop(&self) {
        if self.poller.lock().unwrap().is_some() {
            return;
        }
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
}

impl LedgerEvents for EventManager {
    fn sequenced_broadcast_batch<'a>(
        &'a self,
        batch: &'a BroadcastBatch,
        author: &'a str,
        protocol_tx_id: &'a str,
        additional_info: &'a Map<String, Value>,
    ) -> BoxFuture<'a, Result<(), LedgerEventError>> {
        Box::pin(self.aggregator.sequenced_broadcast_batch(
            batch,
            author,
            protocol_tx_id,
            additional_info,
        ))
    }
}

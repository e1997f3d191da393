//! The event poller: fan-out of stored events to live subscriptions.
//!
//! One poller runs per process. It scans the event table in ascending
//! sequence order from the lowest live checkpoint, matches each event
//! against the live subscription set, and dispatches through the owning
//! transport. Per subscription there is exactly one inflight delivery:
//! the next event is not dispatched until the previous one is acked, and
//! only an ack advances the checkpoint. Wakeups (new events, acks,
//! connection changes) coalesce - many signals collapse into one scan.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use ledgermesh_core::filter::Filter;
use ledgermesh_core::retry::Retry;
use ledgermesh_core::shutdown::ShutdownSignal;
use ledgermesh_core::store::{event_filter, Database, Offset, StoreError};
use ledgermesh_core::types::{Event, EventDelivery, FirstEvent, SubscriptionRef};

use super::dispatch::{ControlEvent, Dispatcher};
use super::subscriptions::{RuntimeSubscription, SubscriptionRegistry};

/// Tuning for the poller loop.
#[derive(Debug, Clone)]
pub(crate) struct PollerSettings {
    /// Maximum events read per scan.
    pub batch_size: u64,
    /// Idle rescan interval.
    pub tick: Duration,
}

type SubKey = (String, String);

/// One dispatched, unacked delivery.
struct Inflight {
    delivery_id: Uuid,
    conn_id: String,
    sequence: i64,
    durable: bool,
}

/// A subscription bound to a live connection for this scan.
struct ActiveSub {
    key: SubKey,
    runtime: Arc<RuntimeSubscription>,
    conn_id: String,
    transport: String,
    durable: bool,
    /// Ephemeral first-event anchor, resolved at registration.
    start_sequence: Option<i64>,
}

pub(crate) struct EventPoller {
    database: Arc<dyn Database>,
    dispatcher: Arc<Dispatcher>,
    registry: SubscriptionRegistry,
    retry: Retry,
    shutdown: ShutdownSignal,
    settings: PollerSettings,
    new_events: mpsc::UnboundedReceiver<Uuid>,
    control: mpsc::UnboundedReceiver<ControlEvent>,
    closed: watch::Sender<bool>,
    checkpoints: HashMap<SubKey, i64>,
    inflight: HashMap<SubKey, Inflight>,
}

impl EventPoller {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        database: Arc<dyn Database>,
        dispatcher: Arc<Dispatcher>,
        retry: Retry,
        shutdown: ShutdownSignal,
        settings: PollerSettings,
        new_events: mpsc::UnboundedReceiver<Uuid>,
        control: mpsc::UnboundedReceiver<ControlEvent>,
        closed: watch::Sender<bool>,
    ) -> Self {
        Self {
            registry: SubscriptionRegistry::new(Arc::clone(&database)),
            database,
            dispatcher,
            retry,
            shutdown,
            settings,
            new_events,
            control,
            closed,
            checkpoints: HashMap::new(),
            inflight: HashMap::new(),
        }
    }

    /// The poller loop. Returns only on shutdown, closing the `closed`
    /// signal once fully unwound.
    pub(crate) async fn run(mut self) {
        info!("event poller started");
        let mut failures: u32 = 0;
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            match self.scan_and_dispatch() {
                Ok(()) => failures = 0,
                Err(e) => {
                    failures = failures.saturating_add(1);
                    warn!(%e, failures, "event scan failed, backing off");
                }
            }

            // Scan failures wait out the shared backoff policy instead of
            // the idle tick.
            let wait = if failures == 0 {
                self.settings.tick
            } else {
                self.retry.delay(failures)
            };

            tokio::select! {
                () = self.shutdown.cancelled() => break,
                control = self.control.recv() => {
                    if let Some(event) = control {
                        self.handle_control(event);
                    }
                    self.drain_control();
                }
                reference = self.new_events.recv() => {
                    // Coalesce: any number of signals cause one scan.
                    if reference.is_some() {
                        while self.new_events.try_recv().is_ok() {}
                    }
                }
                () = tokio::time::sleep(wait) => {}
            }
        }
        info!("event poller stopped");
        let _ = self.closed.send(true);
    }

    fn drain_control(&mut self) {
        while let Ok(event) = self.control.try_recv() {
            self.handle_control(event);
        }
    }

    fn handle_control(&mut self, event: ControlEvent) {
        match event {
            ControlEvent::Response { conn_id, response } => {
                let key = self
                    .inflight
                    .iter()
                    .find(|(_, inf)| inf.delivery_id == response.id)
                    .map(|(key, _)| key.clone());
                let Some(key) = key else {
                    // Duplicate or stale ack; acks are idempotent.
                    debug!(delivery = %response.id, "response for unknown delivery");
                    return;
                };
                if self.inflight[&key].conn_id != conn_id {
                    warn!(delivery = %response.id, conn_id, "response from wrong connection");
                    return;
                }
                if let Some(inflight) = self.inflight.remove(&key) {
                    if response.rejected {
                        // The checkpoint stays put, so the event
                        // redelivers on a later scan.
                        warn!(
                            namespace = %key.0,
                            name = %key.1,
                            sequence = inflight.sequence,
                            info = ?response.info,
                            "delivery rejected"
                        );
                    } else {
                        self.advance(&key, inflight.sequence, inflight.durable);
                    }
                }
            }
            ControlEvent::ConnectionClosed { conn_id } => {
                // Unacked deliveries on the closed connection redeliver
                // once the subscription reattaches.
                self.inflight.retain(|_, inf| inf.conn_id != conn_id);
            }
            ControlEvent::ConnectionsChanged => {}
        }
    }

    /// Advances a subscription's checkpoint, durably for persistent
    /// subscriptions.
    fn advance(&mut self, key: &SubKey, sequence: i64, durable: bool) {
        let checkpoint = self.checkpoints.entry(key.clone()).or_insert(0);
        if sequence > *checkpoint {
            *checkpoint = sequence;
        }
        if durable {
            let offset = Offset {
                namespace: key.0.clone(),
                name: key.1.clone(),
                current: sequence,
            };
            if let Err(e) = self.database.upsert_offset(&offset) {
                // Redelivery after restart is the at-least-once fallback.
                warn!(%e, namespace = %key.0, name = %key.1, "failed to persist offset");
            }
        }
    }

    fn scan_and_dispatch(&mut self) -> Result<(), StoreError> {
        let active = self.active_subscriptions()?;

        let active_keys: HashSet<SubKey> = active.iter().map(|sub| sub.key.clone()).collect();
        self.checkpoints.retain(|key, _| active_keys.contains(key));
        self.inflight.retain(|key, _| active_keys.contains(key));

        if active.is_empty() {
            return Ok(());
        }

        for sub in &active {
            if !self.checkpoints.contains_key(&sub.key) {
                let checkpoint = self.initial_checkpoint(sub)?;
                self.checkpoints.insert(sub.key.clone(), checkpoint);
            }
        }

        let min_checkpoint = active
            .iter()
            .filter_map(|sub| self.checkpoints.get(&sub.key).copied())
            .min()
            .unwrap_or(0);

        let fb = event_filter();
        let filter = Filter::new(fb.gt("sequence", min_checkpoint))
            .sort("sequence")
            .limit(self.settings.batch_size);
        let page = self.database.get_events(&filter)?;
        if page.is_empty() {
            return Ok(());
        }

        for sub in &active {
            // Exactly one inflight delivery per subscription.
            if self.inflight.contains_key(&sub.key) {
                continue;
            }
            self.dispatch_next(sub, &page)?;
        }
        Ok(())
    }

    /// Dispatches the next matching event for one subscription, advancing
    /// its checkpoint over non-matching events along the way.
    fn dispatch_next(&mut self, sub: &ActiveSub, page: &[Event]) -> Result<(), StoreError> {
        let mut checkpoint = self.checkpoints.get(&sub.key).copied().unwrap_or(0);
        let starting_checkpoint = checkpoint;

        for event in page {
            let Some(sequence) = event.sequence else {
                continue;
            };
            if sequence <= checkpoint {
                continue;
            }

            if self.matches(sub, event)? {
                let delivery_id = Uuid::new_v4();
                let delivery = EventDelivery {
                    id: delivery_id,
                    event: event.clone(),
                    subscription: SubscriptionRef {
                        namespace: sub.runtime.definition.namespace.clone(),
                        name: sub.runtime.definition.name.clone(),
                    },
                };
                match self.dispatcher.deliver(&sub.transport, &sub.conn_id, delivery) {
                    Ok(()) => {
                        debug!(
                            namespace = %sub.key.0,
                            name = %sub.key.1,
                            sequence,
                            delivery = %delivery_id,
                            "event dispatched"
                        );
                        self.inflight.insert(
                            sub.key.clone(),
                            Inflight {
                                delivery_id,
                                conn_id: sub.conn_id.clone(),
                                sequence,
                                durable: sub.durable,
                            },
                        );
                    }
                    Err(e) => {
                        // The connection is gone or backpressured; leave
                        // the checkpoint so the event redelivers.
                        debug!(%e, sequence, "delivery not enqueued");
                    }
                }
                break;
            }

            // Not for this subscription; step the checkpoint past it.
            checkpoint = sequence;
        }

        if checkpoint > starting_checkpoint {
            let key = sub.key.clone();
            self.advance(&key, checkpoint, sub.durable);
        }
        Ok(())
    }

    fn matches(&self, sub: &ActiveSub, event: &Event) -> Result<bool, StoreError> {
        if event.namespace != sub.runtime.definition.namespace {
            return Ok(false);
        }
        if !sub.runtime.compiled.matches_event(event) {
            return Ok(false);
        }
        if sub.runtime.compiled.message_blind() {
            return Ok(true);
        }
        // Message-field patterns need the referenced message.
        match self.database.get_message(&event.reference)? {
            Some(message) => Ok(sub.runtime.compiled.matches_message(&message.header)),
            None => {
                warn!(
                    reference = %event.reference,
                    "event references a missing message, skipping"
                );
                Ok(false)
            }
        }
    }

    /// Durable subscriptions bound to a connection whose matcher admits
    /// them, plus each connection's ephemeral subscription. Connections
    /// are scanned in a stable order so a subscription does not bounce
    /// between equally matching connections.
    fn active_subscriptions(&self) -> Result<Vec<ActiveSub>, StoreError> {
        let mut connections = self.dispatcher.snapshot();
        connections.sort_by(|a, b| a.conn_id.cmp(&b.conn_id));

        let durable = self.registry.load_all()?;

        let mut active = Vec::new();
        for runtime in durable {
            let subscription_ref = runtime.definition.subscription_ref();
            let conn = connections.iter().find(|conn| {
                conn.transport == runtime.definition.transport
                    && conn
                        .matcher
                        .as_ref()
                        .is_some_and(|matcher| matcher(&subscription_ref))
            });
            if let Some(conn) = conn {
                active.push(ActiveSub {
                    key: (
                        runtime.definition.namespace.clone(),
                        runtime.definition.name.clone(),
                    ),
                    runtime: Arc::clone(&runtime),
                    conn_id: conn.conn_id.clone(),
                    transport: conn.transport.clone(),
                    durable: true,
                    start_sequence: None,
                });
            }
        }

        for conn in &connections {
            if let Some(ephemeral) = &conn.ephemeral {
                active.push(ActiveSub {
                    key: (
                        ephemeral.runtime.definition.namespace.clone(),
                        ephemeral.runtime.definition.name.clone(),
                    ),
                    runtime: Arc::clone(&ephemeral.runtime),
                    conn_id: conn.conn_id.clone(),
                    transport: conn.transport.clone(),
                    durable: false,
                    start_sequence: Some(ephemeral.start_sequence),
                });
            }
        }

        Ok(active)
    }

    /// Resolves where a subscription starts: its persisted offset, or the
    /// first-event anchor for a brand-new one.
    fn initial_checkpoint(&self, sub: &ActiveSub) -> Result<i64, StoreError> {
        if let Some(start) = sub.start_sequence {
            return Ok(start);
        }
        if let Some(offset) = self.database.get_offset(&sub.key.0, &sub.key.1)? {
            return Ok(offset.current);
        }
        let head = self.database.highest_event_sequence()?;
        let start = sub
            .runtime
            .definition
            .options
            .first_event
            .clone()
            .unwrap_or_else(FirstEvent::newest)
            .starting_sequence(head);
        self.database.upsert_offset(&Offset {
            namespace: sub.key.0.clone(),
            name: sub.key.1.clone(),
            current: start,
        })?;
        Ok(start)
    }
}

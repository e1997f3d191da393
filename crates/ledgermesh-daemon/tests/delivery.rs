//! Subscription delivery scenarios: ordering, ack gating, redelivery.

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::Map;
use uuid::Uuid;

use common::{
    assert_no_delivery, broadcast_for, next_delivery, sealed_batch, sealed_message, test_config,
    RecordingTransport, ScriptedContentStore, AUTHOR,
};
use ledgermesh_core::contentstore::ContentStore;
use ledgermesh_core::ledger::LedgerEvents;
use ledgermesh_core::shutdown;
use ledgermesh_core::store::{Database, SqliteStore};
use ledgermesh_core::types::{
    Bytes32, DataRef, EventDeliveryResponse, FirstEvent, Subscription, SubscriptionFilter,
    SubscriptionOptions, SubscriptionRef,
};
use ledgermesh_daemon::events::EventManager;
use ledgermesh_daemon::transport::{Callbacks, SubscriptionMatcher};

struct Fixture {
    database: Arc<dyn Database>,
    manager: Arc<EventManager>,
    callbacks: Arc<dyn Callbacks>,
    transport: Arc<RecordingTransport>,
    deliveries: tokio::sync::mpsc::UnboundedReceiver<(String, ledgermesh_core::types::EventDelivery)>,
    _handle: shutdown::ShutdownHandle,
}

fn fixture(content_store: Arc<dyn ContentStore>) -> Fixture {
    let database: Arc<dyn Database> = Arc::new(SqliteStore::in_memory().unwrap());
    let (handle, signal) = shutdown::channel();
    let manager = Arc::new(EventManager::new(
        &test_config(),
        signal,
        Arc::clone(&database),
        content_store,
    ));
    let (transport, deliveries) = RecordingTransport::new();
    let callbacks = manager.register_transport(Arc::clone(&transport) as _);
    manager.start();
    Fixture {
        database,
        manager,
        callbacks,
        transport,
        deliveries,
        _handle: handle,
    }
}

fn durable_subscription(database: &Arc<dyn Database>, name: &str) -> Subscription {
    let subscription = Subscription {
        id: None,
        namespace: "ns1".to_string(),
        name: name.to_string(),
        transport: "mock".to_string(),
        filter: SubscriptionFilter::default(),
        options: SubscriptionOptions {
            first_event: Some(FirstEvent::oldest()),
            ..SubscriptionOptions::default()
        },
        created: None,
    };
    database.upsert_subscription(&subscription, true).unwrap();
    subscription
}

fn matcher_for(name: &'static str) -> SubscriptionMatcher {
    Arc::new(move |subscription_ref: &SubscriptionRef| {
        subscription_ref.namespace == "ns1" && subscription_ref.name == name
    })
}

/// Builds the payload first so the scripted content store can serve it,
/// then returns both message ids in batch order.
fn two_message_payload() -> (Vec<u8>, Uuid, Uuid, ledgermesh_core::types::Batch) {
    let m1 = sealed_message(
        "ns1",
        "orders",
        DataRef {
            id: Some(Uuid::new_v4()),
            hash: Some(Bytes32::sha256(b"a")),
        },
    );
    let m2 = sealed_message(
        "ns1",
        "orders",
        DataRef {
            id: Some(Uuid::new_v4()),
            hash: Some(Bytes32::sha256(b"b")),
        },
    );
    let (id1, id2) = (m1.header.id.unwrap(), m2.header.id.unwrap());
    let (batch, payload) = sealed_batch("ns1", vec![m1, m2], vec![]);
    (payload, id1, id2, batch)
}

#[tokio::test]
async fn events_deliver_in_order_gated_by_acks() {
    let (payload, id1, id2, batch) = two_message_payload();
    let mut fx = fixture(ScriptedContentStore::always(payload));

    durable_subscription(&fx.database, "sub1");
    fx.transport.open("conn1");
    fx.callbacks.register_connection("conn1", matcher_for("sub1"));

    fx.manager
        .sequenced_broadcast_batch(&broadcast_for(&batch, "ref1"), AUTHOR, "tx-0001", &Map::new())
        .await
        .unwrap();

    // First event arrives; the second is gated until the ack.
    let (conn, first) = next_delivery(&mut fx.deliveries).await;
    assert_eq!(conn, "conn1");
    assert_eq!(first.event.reference, id1);
    assert_no_delivery(&mut fx.deliveries).await;

    fx.callbacks.delivery_response(
        "conn1",
        EventDeliveryResponse {
            id: first.id,
            rejected: false,
            info: None,
        },
    );

    let (_, second) = next_delivery(&mut fx.deliveries).await;
    assert_eq!(second.event.reference, id2);
    assert!(second.event.sequence > first.event.sequence);

    // The durable checkpoint tracked the ack.
    let offset = fx.database.get_offset("ns1", "sub1").unwrap().unwrap();
    assert_eq!(Some(offset.current), first.event.sequence);
}

#[tokio::test]
async fn duplicate_acks_are_idempotent() {
    let (payload, id1, _id2, batch) = two_message_payload();
    let mut fx = fixture(ScriptedContentStore::always(payload));

    durable_subscription(&fx.database, "sub1");
    fx.transport.open("conn1");
    fx.callbacks.register_connection("conn1", matcher_for("sub1"));

    fx.manager
        .sequenced_broadcast_batch(&broadcast_for(&batch, "ref1"), AUTHOR, "tx-0001", &Map::new())
        .await
        .unwrap();

    let (_, first) = next_delivery(&mut fx.deliveries).await;
    assert_eq!(first.event.reference, id1);
    for _ in 0..3 {
        fx.callbacks.delivery_response(
            "conn1",
            EventDeliveryResponse {
                id: first.id,
                rejected: false,
                info: None,
            },
        );
    }

    // Exactly one further delivery despite the duplicate acks.
    let (_, second) = next_delivery(&mut fx.deliveries).await;
    assert_ne!(second.event.sequence, first.event.sequence);
    assert_no_delivery(&mut fx.deliveries).await;
}

#[tokio::test]
async fn close_before_ack_redelivers_on_reconnect() {
    let (payload, id1, _id2, batch) = two_message_payload();
    let mut fx = fixture(ScriptedContentStore::always(payload));

    durable_subscription(&fx.database, "sub1");
    fx.transport.open("conn1");
    fx.callbacks.register_connection("conn1", matcher_for("sub1"));

    fx.manager
        .sequenced_broadcast_batch(&broadcast_for(&batch, "ref1"), AUTHOR, "tx-0001", &Map::new())
        .await
        .unwrap();

    let (conn, first) = next_delivery(&mut fx.deliveries).await;
    assert_eq!(conn, "conn1");
    assert_eq!(first.event.reference, id1);

    // Close without acking; the same event redelivers on the new
    // connection with a fresh delivery id.
    fx.transport.close("conn1");
    fx.callbacks.connection_closed("conn1");
    fx.transport.open("conn2");
    fx.callbacks.register_connection("conn2", matcher_for("sub1"));

    let (conn, redelivered) = next_delivery(&mut fx.deliveries).await;
    assert_eq!(conn, "conn2");
    assert_eq!(redelivered.event.sequence, first.event.sequence);
    assert_ne!(redelivered.id, first.id);
}

#[tokio::test]
async fn ephemeral_subscription_sees_only_new_events() {
    let (payload, id1, _id2, batch) = two_message_payload();
    let mut fx = fixture(ScriptedContentStore::always(payload));

    // Ingest one batch before the consumer attaches.
    let notification = broadcast_for(&batch, "ref1");
    fx.manager
        .sequenced_broadcast_batch(&notification, AUTHOR, "tx-0001", &Map::new())
        .await
        .unwrap();

    fx.transport.open("conn1");
    fx.callbacks
        .ephemeral_subscription(
            "conn1",
            "ns1",
            &SubscriptionFilter::default(),
            &SubscriptionOptions::default(),
        )
        .unwrap();

    // Anchored at newest: nothing from events before the attach.
    assert_no_delivery(&mut fx.deliveries).await;

    // A redelivered batch appends fresh events past the anchor.
    fx.manager
        .sequenced_broadcast_batch(&notification, AUTHOR, "tx-0001", &Map::new())
        .await
        .unwrap();
    let (_, delivery) = next_delivery(&mut fx.deliveries).await;
    assert_eq!(delivery.event.reference, id1);
    assert!(delivery.event.sequence > Some(2));
}

#[tokio::test]
async fn namespace_scoping_excludes_foreign_events() {
    let m_other = sealed_message(
        "ns2",
        "orders",
        DataRef {
            id: Some(Uuid::new_v4()),
            hash: Some(Bytes32::sha256(b"x")),
        },
    );
    let (batch_other, payload_other) = sealed_batch("ns2", vec![m_other], vec![]);
    let mut fx = fixture(ScriptedContentStore::always(payload_other));

    durable_subscription(&fx.database, "sub1");
    fx.transport.open("conn1");
    fx.callbacks.register_connection("conn1", matcher_for("sub1"));

    fx.manager
        .sequenced_broadcast_batch(
            &broadcast_for(&batch_other, "ref1"),
            AUTHOR,
            "tx-0001",
            &Map::new(),
        )
        .await
        .unwrap();

    // ns2 events never reach the ns1 subscription.
    assert_no_delivery(&mut fx.deliveries).await;
}

#[tokio::test]
async fn topic_filter_selects_matching_messages() {
    let m_billing = sealed_message(
        "ns1",
        "billing",
        DataRef {
            id: Some(Uuid::new_v4()),
            hash: Some(Bytes32::sha256(b"a")),
        },
    );
    let m_orders = sealed_message(
        "ns1",
        "orders.eu",
        DataRef {
            id: Some(Uuid::new_v4()),
            hash: Some(Bytes32::sha256(b"b")),
        },
    );
    let orders_id = m_orders.header.id.unwrap();
    let (batch, payload) = sealed_batch("ns1", vec![m_billing, m_orders], vec![]);

    let mut fx = fixture(ScriptedContentStore::always(payload));

    let subscription = Subscription {
        id: None,
        namespace: "ns1".to_string(),
        name: "orders-only".to_string(),
        transport: "mock".to_string(),
        filter: SubscriptionFilter {
            topic: "^orders\\.".to_string(),
            ..SubscriptionFilter::default()
        },
        options: SubscriptionOptions {
            first_event: Some(FirstEvent::oldest()),
            ..SubscriptionOptions::default()
        },
        created: None,
    };
    fx.database.upsert_subscription(&subscription, true).unwrap();

    fx.transport.open("conn1");
    fx.callbacks.register_connection("conn1", matcher_for("orders-only"));

    fx.manager
        .sequenced_broadcast_batch(&broadcast_for(&batch, "ref1"), AUTHOR, "tx-0001", &Map::new())
        .await
        .unwrap();

    // Only the orders message is delivered; the billing event was
    // skipped and the checkpoint advanced past it.
    let (_, delivery) = next_delivery(&mut fx.deliveries).await;
    assert_eq!(delivery.event.reference, orders_id);
    assert_no_delivery(&mut fx.deliveries).await;
}

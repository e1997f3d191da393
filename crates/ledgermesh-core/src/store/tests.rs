//! Persistence gateway tests against the `SQLite` backend.

use chrono::{TimeZone, Utc};
use uuid::Uuid;

use super::*;
use crate::filter::{FilterValue, Update};
use crate::types::{
    Batch, BatchPayload, Bytes32, Event, EventType, FirstEvent, Subscription, SubscriptionFilter,
    SubscriptionOptions, TransactionType, TxRef,
};

fn store() -> SqliteStore {
    SqliteStore::in_memory().unwrap()
}

fn sample_batch(id: Uuid) -> Batch {
    let payload = BatchPayload {
        tx: TxRef {
            tx_type: TransactionType::Pin,
            id: Some(Uuid::new_v4()),
        },
        data: vec![],
        messages: vec![],
    };
    Batch {
        id: Some(id),
        namespace: "ns1".to_string(),
        author: "0xabc".to_string(),
        hash: Some(payload.hash().unwrap()),
        created: None,
        confirmed: Some(Utc.with_ymd_and_hms(2021, 3, 1, 9, 0, 0).unwrap()),
        payload,
    }
}

#[test]
fn subscriptions_end_to_end() {
    let s = store();

    // Create with a generated id.
    let mut subscription = Subscription {
        id: None,
        namespace: "ns1".to_string(),
        name: "subscription1".to_string(),
        transport: String::new(),
        filter: SubscriptionFilter::default(),
        options: SubscriptionOptions::default(),
        created: Some(Utc.with_ymd_and_hms(2021, 3, 1, 9, 0, 0).unwrap()),
    };
    let id = s.upsert_subscription(&subscription, true).unwrap();
    subscription.id = Some(id);

    // Exact same subscription comes back, byte-equal as JSON.
    let read = s.get_subscription("ns1", "subscription1").unwrap().unwrap();
    assert_eq!(
        serde_json::to_string(&read).unwrap(),
        serde_json::to_string(&subscription).unwrap()
    );

    // An upsert carrying a different id is rejected and changes nothing.
    let mut updated = Subscription {
        id: Some(Uuid::new_v4()),
        namespace: "ns1".to_string(),
        name: "subscription1".to_string(),
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
        created: Some(Utc.with_ymd_and_hms(2021, 3, 2, 9, 0, 0).unwrap()),
    };
    assert!(matches!(
        s.upsert_subscription(&updated, true),
        Err(StoreError::IdMismatch)
    ));
    let unchanged = s.get_subscription("ns1", "subscription1").unwrap().unwrap();
    assert_eq!(unchanged.transport, "");

    // Blank out the id and retry; the stored id is preserved.
    updated.id = None;
    let kept = s.upsert_subscription(&updated, true).unwrap();
    assert_eq!(kept, id);
    updated.id = Some(id);

    let read = s.get_subscription("ns1", "subscription1").unwrap().unwrap();
    assert_eq!(
        serde_json::to_string(&read).unwrap(),
        serde_json::to_string(&updated).unwrap()
    );

    // Query back through the filter builder.
    let fb = subscription_filter();
    let filter = Filter::new(fb.and(vec![fb.eq("namespace", "ns1"), fb.eq("name", "subscription1")]));
    let found = s.get_subscriptions(&filter).unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(
        serde_json::to_string(&found[0]).unwrap(),
        serde_json::to_string(&updated).unwrap()
    );

    // Field-wise update through the update builder.
    let update_time = Utc.with_ymd_and_hms(2021, 3, 3, 9, 0, 0).unwrap();
    let update = Update::new().set("created", update_time);
    s.update_subscription("ns1", "subscription1", &update).unwrap();

    let filter = Filter::new(fb.and(vec![
        fb.eq("name", "subscription1"),
        fb.eq("created", update_time),
    ]));
    assert_eq!(s.get_subscriptions(&filter).unwrap().len(), 1);
}

#[test]
fn subscription_filter_rejects_incompatible_value() {
    let s = store();
    let fb = subscription_filter();
    let filter = Filter::new(fb.eq("name", serde_json::json!({"true": false})));
    let err = s.get_subscriptions(&filter).unwrap_err();
    assert!(matches!(
        err,
        StoreError::Filter(crate::filter::FilterError::FieldType { ref field }) if field == "name"
    ));
}

#[test]
fn subscription_update_rejects_incompatible_value() {
    let s = store();
    let update = Update::new().set("name", FilterValue::Json(serde_json::json!([1, 2])));
    let err = s.update_subscription("ns1", "sub1", &update).unwrap_err();
    assert!(matches!(
        err,
        StoreError::Filter(crate::filter::FilterError::FieldType { ref field }) if field == "name"
    ));
}

#[test]
fn subscription_insert_only_conflicts_on_existing() {
    let s = store();
    let subscription = Subscription {
        id: None,
        namespace: "ns1".to_string(),
        name: "sub1".to_string(),
        transport: String::new(),
        filter: SubscriptionFilter::default(),
        options: SubscriptionOptions::default(),
        created: None,
    };
    s.upsert_subscription(&subscription, false).unwrap();
    assert!(matches!(
        s.upsert_subscription(&subscription, false),
        Err(StoreError::Database(_))
    ));
}

#[test]
fn delete_subscription_drops_row_and_offset() {
    let s = store();
    let subscription = Subscription {
        id: None,
        namespace: "ns1".to_string(),
        name: "sub1".to_string(),
        transport: String::new(),
        filter: SubscriptionFilter::default(),
        options: SubscriptionOptions::default(),
        created: None,
    };
    let id = s.upsert_subscription(&subscription, true).unwrap();
    s.upsert_offset(&Offset {
        namespace: "ns1".to_string(),
        name: "sub1".to_string(),
        current: 7,
    })
    .unwrap();

    s.delete_subscription(&id).unwrap();
    assert!(s.get_subscription("ns1", "sub1").unwrap().is_none());
    assert!(s.get_offset("ns1", "sub1").unwrap().is_none());
}

#[test]
fn batch_upsert_enforces_hash() {
    let s = store();
    let id = Uuid::new_v4();
    let batch = sample_batch(id);

    s.run_as_group(&mut |ops| ops.upsert_batch(&batch, false))
        .unwrap();

    // Same content replays cleanly (idempotent at-least-once).
    s.run_as_group(&mut |ops| ops.upsert_batch(&batch, false))
        .unwrap();

    // A conflicting hash is the sentinel outcome and leaves the row alone.
    let mut conflicting = batch.clone();
    conflicting.hash = Some(Bytes32::sha256(b"other"));
    let err = s
        .run_as_group(&mut |ops| ops.upsert_batch(&conflicting, false))
        .unwrap_err();
    assert!(matches!(err, StoreError::HashMismatch));

    let stored = s.get_batch(&id).unwrap().unwrap();
    assert_eq!(stored.hash, batch.hash);
}

#[test]
fn group_rolls_back_on_error() {
    let s = store();
    let event = Event::new(
        EventType::MessageConfirmed,
        Uuid::new_v4(),
        "ns1",
        Utc.with_ymd_and_hms(2021, 3, 1, 9, 0, 0).unwrap(),
    );
    let result = s.run_as_group(&mut |ops| {
        ops.insert_event(&event)?;
        Err(StoreError::HashMismatch)
    });
    assert!(matches!(result, Err(StoreError::HashMismatch)));
    assert_eq!(s.highest_event_sequence().unwrap(), 0);
}

#[test]
fn event_sequences_strictly_increase() {
    let s = store();
    let created = Utc.with_ymd_and_hms(2021, 3, 1, 9, 0, 0).unwrap();
    let mut last = 0;
    for _ in 0..5 {
        let mut assigned = 0;
        s.run_as_group(&mut |ops| {
            assigned = ops.insert_event(&Event::new(
                EventType::MessageConfirmed,
                Uuid::new_v4(),
                "ns1",
                created,
            ))?;
            Ok(())
        })
        .unwrap();
        assert!(assigned > last);
        last = assigned;
    }
    assert_eq!(s.highest_event_sequence().unwrap(), last);

    // Ascending scan through the filter builder.
    let fb = event_filter();
    let filter = Filter::new(fb.gt("sequence", 2i64)).sort("sequence").limit(10);
    let events = s.get_events(&filter).unwrap();
    assert_eq!(events.len(), 3);
    assert!(events.windows(2).all(|w| w[0].sequence < w[1].sequence));
}

#[test]
fn offsets_round_trip() {
    let s = store();
    assert!(s.get_offset("ns1", "sub1").unwrap().is_none());
    let offset = Offset {
        namespace: "ns1".to_string(),
        name: "sub1".to_string(),
        current: 42,
    };
    s.upsert_offset(&offset).unwrap();
    assert_eq!(s.get_offset("ns1", "sub1").unwrap().unwrap(), offset);

    s.upsert_offset(&Offset {
        current: 43,
        ..offset.clone()
    })
    .unwrap();
    assert_eq!(s.get_offset("ns1", "sub1").unwrap().unwrap().current, 43);
}

//! Shared fixtures: scripted content store, recording transport, and
//! sealed batch builders.

#![allow(dead_code)]

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{TimeZone, Utc};
use tokio::sync::mpsc;
use uuid::Uuid;

use ledgermesh_core::contentstore::{ContentStore, ContentStoreError};
use ledgermesh_core::ledger::BroadcastBatch;
use ledgermesh_core::types::{
    Batch, BatchPayload, Bytes32, Data, DataRef, EventDelivery, Message, MessageHeader,
    TransactionType, TxRef,
};
use ledgermesh_core::BoxFuture;
use ledgermesh_daemon::config::DaemonConfig;
use ledgermesh_daemon::transport::{Transport, TransportError};

/// Configuration tuned for fast tests: millisecond retries and ticks.
pub fn test_config() -> DaemonConfig {
    let mut config = DaemonConfig::default();
    config.aggregator.retry_initial_delay_ms = 2;
    config.aggregator.retry_maximum_delay_ms = 10;
    config.poller.tick_ms = 10;
    config
}

pub const AUTHOR: &str = "0x0123456789abcdef";

/// A content store that replays a scripted sequence of outcomes, then a
/// fallback payload forever.
pub struct ScriptedContentStore {
    script: Mutex<VecDeque<Result<Vec<u8>, String>>>,
    fallback: Option<Vec<u8>>,
    calls: AtomicU32,
}

impl ScriptedContentStore {
    /// Always returns this payload.
    pub fn always(payload: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(VecDeque::new()),
            fallback: Some(payload),
            calls: AtomicU32::new(0),
        })
    }

    /// Fails `failures` times, then returns the payload forever.
    pub fn flaky(failures: u32, payload: Vec<u8>) -> Arc<Self> {
        let script = (0..failures)
            .map(|i| Err(format!("transfer reset {i}")))
            .collect();
        Arc::new(Self {
            script: Mutex::new(script),
            fallback: Some(payload),
            calls: AtomicU32::new(0),
        })
    }

    /// Never succeeds.
    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(VecDeque::new()),
            fallback: None,
            calls: AtomicU32::new(0),
        })
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ContentStore for ScriptedContentStore {
    fn name(&self) -> &str {
        "scripted"
    }

    fn retrieve_data<'a>(
        &'a self,
        payload_ref: &'a str,
    ) -> BoxFuture<'a, Result<Vec<u8>, ContentStoreError>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let scripted = self.script.lock().unwrap().pop_front();
            match scripted {
                Some(Ok(bytes)) => Ok(bytes),
                Some(Err(reason)) => Err(ContentStoreError::Unavailable { reason }),
                None => match &self.fallback {
                    Some(bytes) => Ok(bytes.clone()),
                    None => Err(ContentStoreError::NotFound {
                        payload_ref: payload_ref.to_string(),
                    }),
                },
            }
        })
    }
}

/// A transport that records deliveries onto a channel, with explicit
/// open/closed connection bookkeeping.
pub struct RecordingTransport {
    deliveries: mpsc::UnboundedSender<(String, EventDelivery)>,
    open: Mutex<HashSet<String>>,
}

impl RecordingTransport {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<(String, EventDelivery)>) {
        let (deliveries, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                deliveries,
                open: Mutex::new(HashSet::new()),
            }),
            rx,
        )
    }

    pub fn open(&self, conn_id: &str) {
        self.open.lock().unwrap().insert(conn_id.to_string());
    }

    pub fn close(&self, conn_id: &str) {
        self.open.lock().unwrap().remove(conn_id);
    }
}

impl Transport for RecordingTransport {
    fn name(&self) -> &str {
        "mock"
    }

    fn delivery_request(
        &self,
        conn_id: &str,
        delivery: EventDelivery,
    ) -> Result<(), TransportError> {
        if !self.open.lock().unwrap().contains(conn_id) {
            return Err(TransportError::ConnectionNotActive {
                conn_id: conn_id.to_string(),
            });
        }
        self.deliveries
            .send((conn_id.to_string(), delivery))
            .map_err(|_| TransportError::ConnectionNotActive {
                conn_id: conn_id.to_string(),
            })
    }
}

/// Builds a sealed message for `ns1` carrying one data reference.
pub fn sealed_message(namespace: &str, topic: &str, data_ref: DataRef) -> Message {
    let mut message = Message {
        header: MessageHeader {
            id: Some(Uuid::new_v4()),
            cid: None,
            author: AUTHOR.to_string(),
            namespace: namespace.to_string(),
            topic: topic.to_string(),
            context: "ctx-1".to_string(),
            group: None,
            created: Some(Utc.with_ymd_and_hms(2021, 3, 1, 9, 0, 0).unwrap()),
            data_hash: None,
        },
        hash: None,
        batch_id: None,
        confirmed: None,
        data: vec![data_ref],
    };
    message.seal().unwrap();
    message
}

/// Builds a hashed data entry from a JSON value.
pub fn hashed_data(value: serde_json::Value) -> Data {
    let mut data = Data {
        id: Some(Uuid::new_v4()),
        hash: None,
        created: None,
        value,
    };
    data.hash = Some(data.value_hash().unwrap());
    data
}

/// Builds a valid sealed batch plus its serialized payload bytes.
pub fn sealed_batch(namespace: &str, messages: Vec<Message>, data: Vec<Data>) -> (Batch, Vec<u8>) {
    let payload = BatchPayload {
        tx: TxRef {
            tx_type: TransactionType::Pin,
            id: Some(Uuid::new_v4()),
        },
        data: data.into_iter().map(Some).collect(),
        messages: messages.into_iter().map(Some).collect(),
    };
    let mut batch = Batch {
        id: Some(Uuid::new_v4()),
        namespace: namespace.to_string(),
        author: AUTHOR.to_string(),
        hash: None,
        created: Some(Utc.with_ymd_and_hms(2021, 3, 1, 9, 0, 0).unwrap()),
        confirmed: None,
        payload,
    };
    batch.hash = Some(batch.payload.hash().unwrap());
    let bytes = serde_json::to_vec(&batch).unwrap();
    (batch, bytes)
}

/// The ledger-side notification for a sealed batch.
pub fn broadcast_for(batch: &Batch, payload_ref: &str) -> BroadcastBatch {
    BroadcastBatch {
        batch_id: *batch.id.unwrap().as_bytes(),
        batch_payload_ref: payload_ref.to_string(),
    }
}

/// Receives the next delivery within a generous deadline.
pub async fn next_delivery(
    rx: &mut mpsc::UnboundedReceiver<(String, EventDelivery)>,
) -> (String, EventDelivery) {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for delivery")
        .expect("delivery channel closed")
}

/// Asserts no delivery arrives for a little while.
pub async fn assert_no_delivery(rx: &mut mpsc::UnboundedReceiver<(String, EventDelivery)>) {
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(
        rx.try_recv().is_err(),
        "unexpected delivery while one was already inflight"
    );
}

/// A sealed batch's hash, flipped in its first byte.
pub fn corrupt_hash(hash: Bytes32) -> Bytes32 {
    let mut out = hash.0;
    out[0] ^= 1;
    Bytes32(out)
}

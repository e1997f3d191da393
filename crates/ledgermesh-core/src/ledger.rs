//! Inbound contract driven by a ledger adapter.
//!
//! The adapter owns a strictly ordered stream of commit notifications per
//! ledger. It calls [`LedgerEvents::sequenced_broadcast_batch`] in-line
//! with that stream and must hold its cursor open until the call returns
//! `Ok`; an error means "do not advance, retry later".

use serde_json::{Map, Value};
use thiserror::Error;

use crate::BoxFuture;

/// Notification of a batch sealed by the underlying ledger.
///
/// Produced exactly once per ledger commit, but may be redelivered; the
/// ingestion pipeline is idempotent on `batch_id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastBatch {
    /// The batch id, carried on-chain as a fixed 16-byte value.
    pub batch_id: [u8; 16],

    /// Opaque reference resolving the payload in the content store.
    pub batch_payload_ref: String,
}

/// Why an inbound batch could not be accepted.
///
/// Permanently invalid payloads are swallowed (logged, `Ok` returned) so
/// the ledger stream never stalls; the only surfaced failure is shutdown.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LedgerEventError {
    /// The event manager is shutting down; the adapter should hold its
    /// cursor and redeliver after restart.
    #[error("batch ingestion canceled by shutdown")]
    Canceled,
}

/// The event-ingestion surface a ledger adapter drives.
pub trait LedgerEvents: Send + Sync {
    /// Ingests one sealed batch, in ledger order.
    ///
    /// Blocks until the batch payload is fetched, validated, durably
    /// persisted, and its events are queued - or until shutdown.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerEventError::Canceled`] when shutdown interrupts
    /// ingestion before the batch is durable.
    fn sequenced_broadcast_batch<'a>(
        &'a self,
        batch: &'a BroadcastBatch,
        author: &'a str,
        protocol_tx_id: &'a str,
        additional_info: &'a Map<String, Value>,
    ) -> BoxFuture<'a, Result<(), LedgerEventError>>;
}

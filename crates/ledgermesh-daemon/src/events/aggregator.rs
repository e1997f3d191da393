//! Sequenced batch ingestion.
//!
//! The ledger adapter calls [`Aggregator::sequenced_broadcast_batch`]
//! in-line with its ordered stream, so no further events arrive from
//! that ledger while ingestion runs. The call returns `Ok` only once the
//! batch is durably persisted and its events are queued.
//!
//! Failures fall into exactly three classes:
//!
//! 1. **Retryable** - content-store I/O and storage faults. Retried
//!    through the shared retry engine until shutdown; at-least-once
//!    means these are never swallowed.
//! 2. **Swallowable** - permanently invalid data: unparseable payloads,
//!    hash or author mismatches, missing ids, subject disagreement with
//!    an existing record, messages failing verification. Logged at error
//!    level and skipped, because replaying them yields the same result
//!    and the inbound stream must not stall.
//! 3. **Shutdown** - cancellation, propagated out of every waiting site.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::error;
use uuid::Uuid;

use ledgermesh_core::contentstore::ContentStore;
use ledgermesh_core::ledger::{BroadcastBatch, LedgerEventError};
use ledgermesh_core::retry::{Attempt, Retry};
use ledgermesh_core::shutdown::ShutdownSignal;
use ledgermesh_core::store::{Database, GroupOps, StoreError};
use ledgermesh_core::types::{
    Batch, Data, Event, EventType, Message, Transaction, TransactionStatus, TransactionSubject,
    TransactionType,
};

pub(crate) struct Aggregator {
    database: Arc<dyn Database>,
    content_store: Arc<dyn ContentStore>,
    retry: Retry,
    shutdown: ShutdownSignal,
    new_events: mpsc::UnboundedSender<Uuid>,
}

impl Aggregator {
    pub(crate) fn new(
        database: Arc<dyn Database>,
        content_store: Arc<dyn ContentStore>,
        retry: Retry,
        shutdown: ShutdownSignal,
        new_events: mpsc::UnboundedSender<Uuid>,
    ) -> Self {
        Self {
            database,
            content_store,
            retry,
            shutdown,
            new_events,
        }
    }

    /// Ingests one sealed batch in ledger order. See the module docs for
    /// the failure classification this implements.
    pub(crate) async fn sequenced_broadcast_batch(
        &self,
        batch: &BroadcastBatch,
        author: &str,
        protocol_tx_id: &str,
        additional_info: &Map<String, Value>,
    ) -> Result<(), LedgerEventError> {
        let batch_id = Uuid::from_bytes(batch.batch_id);

        // Retrieve the payload, retrying indefinitely until shutdown.
        let body = self
            .retry
            .run(&self.shutdown, |_| {
                let content_store = &*self.content_store;
                let payload_ref = batch.batch_payload_ref.as_str();
                async move {
                    match content_store.retrieve_data(payload_ref).await {
                        Ok(bytes) => Attempt::Done(bytes),
                        Err(e) => Attempt::Again(e),
                    }
                }
            })
            .await
            .map_err(|_| LedgerEventError::Canceled)?;

        let batch_data: Batch = match serde_json::from_slice(&body) {
            Ok(parsed) => parsed,
            Err(e) => {
                error!(
                    batch = %batch_id,
                    protocol_tx_id,
                    %e,
                    "failed to parse payload referred in batch"
                );
                // Unparseable data cannot be made valid by retry.
                return Ok(());
            }
        };

        // Persist the whole batch as one group so it commits or rolls
        // back together; the content fetch above is not repeated.
        let confirmed_refs = self
            .retry
            .run(&self.shutdown, |_| {
                let this = self;
                let batch_data = &batch_data;
                async move {
                    let mut refs = Vec::new();
                    let outcome = this.database.run_as_group(&mut |ops| {
                        refs.clear();
                        this.persist_batch(
                            ops,
                            batch_data,
                            author,
                            protocol_tx_id,
                            additional_info,
                            &mut refs,
                        )
                    });
                    match outcome {
                        Ok(()) => Attempt::Done(refs),
                        Err(e) => Attempt::Again(e),
                    }
                }
            })
            .await
            .map_err(|_| LedgerEventError::Canceled)?;

        // Wake the poller only after the group has committed.
        for reference in confirmed_refs {
            let _ = self.new_events.send(reference);
        }
        Ok(())
    }

    /// Validates and persists one batch inside an open group. Returns
    /// `Ok` for permanently invalid data (skipped, logged) and an error
    /// only for storage failures worth retrying.
    fn persist_batch(
        &self,
        ops: &mut dyn GroupOps,
        batch: &Batch,
        author: &str,
        protocol_tx_id: &str,
        additional_info: &Map<String, Value>,
        confirmed_refs: &mut Vec<Uuid>,
    ) -> Result<(), StoreError> {
        let now = Utc::now();

        let (Some(batch_id), Some(tx_id)) = (batch.id, batch.payload.tx.id) else {
            error!(
                batch = ?batch.id,
                tx = ?batch.payload.tx.id,
                "invalid batch: missing batch or payload transaction id"
            );
            return Ok(());
        };

        // Verify the hash calculation.
        let hash = match batch.payload.hash() {
            Ok(hash) => hash,
            Err(e) => {
                error!(batch = %batch_id, %e, "invalid batch: payload has no canonical form");
                return Ok(());
            }
        };
        if batch.hash != Some(hash) {
            error!(
                batch = %batch_id,
                expected = %hash,
                found = ?batch.hash,
                "invalid batch: hash does not match payload"
            );
            return Ok(());
        }

        // Verify the author matches the ledger-supplied submitter.
        if batch.author != author {
            error!(
                batch = %batch_id,
                batch_author = %batch.author,
                submitter = %author,
                "invalid batch: author does not match transaction submitter"
            );
            return Ok(());
        }

        // Upsert the batch itself, ensuring the hash does not change.
        let mut batch = batch.clone();
        batch.confirmed = Some(now);
        match ops.upsert_batch(&batch, false) {
            Ok(()) => {}
            Err(StoreError::HashMismatch) => {
                error!(batch = %batch_id, "invalid batch: hash mismatch with existing record");
                return Ok(());
            }
            Err(e) => {
                error!(batch = %batch_id, %e, "failed to insert batch");
                return Err(e);
            }
        }

        // First writer constructs the pin transaction; later writers must
        // find an exactly matching subject.
        let mut transaction = match ops.get_transaction(&batch.namespace, &tx_id)? {
            None => {
                let subject = TransactionSubject {
                    tx_type: TransactionType::Pin,
                    author: author.to_string(),
                    namespace: batch.namespace.clone(),
                    batch: Some(batch_id),
                };
                let hash = match subject.hash() {
                    Ok(hash) => hash,
                    Err(e) => {
                        error!(batch = %batch_id, %e, "transaction subject has no canonical form");
                        return Ok(());
                    }
                };
                Transaction {
                    id: Some(tx_id),
                    subject,
                    hash: Some(hash),
                    created: Some(now),
                    confirmed: None,
                    protocol_id: String::new(),
                    info: Map::new(),
                    status: None,
                }
            }
            Some(existing) => {
                if existing.subject.tx_type != TransactionType::Pin
                    || existing.subject.author != author
                    || existing.subject.namespace != batch.namespace
                    || existing.subject.batch != Some(batch_id)
                {
                    error!(
                        batch = %batch_id,
                        transaction = %tx_id,
                        "invalid batch: existing transaction does not match batch subject"
                    );
                    return Ok(());
                }
                existing
            }
        };

        transaction.confirmed = Some(now);
        transaction.protocol_id = protocol_tx_id.to_string();
        transaction.info = additional_info.clone();
        transaction.status = Some(TransactionStatus::Confirmed);

        match ops.upsert_transaction(&transaction, false) {
            Ok(()) => {}
            Err(StoreError::HashMismatch) => {
                error!(
                    batch = %batch_id,
                    transaction = %tx_id,
                    "invalid batch: transaction hash mismatch with existing record"
                );
                return Ok(());
            }
            Err(e) => {
                error!(batch = %batch_id, %e, "failed to insert transaction");
                return Err(e);
            }
        }

        for (index, data) in batch.payload.data.iter().enumerate() {
            self.persist_batch_data(ops, &batch_id, index, data.as_ref())?;
        }

        for (index, message) in batch.payload.messages.iter().enumerate() {
            self.persist_batch_message(
                ops,
                &batch_id,
                &batch.namespace,
                now,
                index,
                message.as_ref(),
                confirmed_refs,
            )?;
        }

        Ok(())
    }

    fn persist_batch_data(
        &self,
        ops: &mut dyn GroupOps,
        batch_id: &Uuid,
        index: usize,
        data: Option<&Data>,
    ) -> Result<(), StoreError> {
        let Some(data) = data else {
            error!(batch = %batch_id, index, "null data entry in batch");
            return Ok(());
        };

        let verified = data
            .value_hash()
            .ok()
            .filter(|hash| data.hash == Some(*hash));
        if verified.is_none() {
            error!(
                batch = %batch_id,
                index,
                data = ?data.id,
                "invalid data entry: hash does not match value"
            );
            return Ok(());
        }

        match ops.upsert_data(data, false) {
            Ok(()) => Ok(()),
            Err(StoreError::HashMismatch) => {
                error!(
                    batch = %batch_id,
                    index,
                    data = ?data.id,
                    "invalid data entry: hash mismatch with existing record"
                );
                Ok(())
            }
            Err(e) => {
                error!(batch = %batch_id, index, %e, "failed to insert data entry");
                Err(e)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn persist_batch_message(
        &self,
        ops: &mut dyn GroupOps,
        batch_id: &Uuid,
        namespace: &str,
        now: DateTime<Utc>,
        index: usize,
        message: Option<&Message>,
        confirmed_refs: &mut Vec<Uuid>,
    ) -> Result<(), StoreError> {
        let Some(message) = message else {
            error!(batch = %batch_id, index, "null message entry in batch");
            return Ok(());
        };

        if let Err(e) = message.verify() {
            error!(batch = %batch_id, index, %e, "invalid message entry");
            return Ok(());
        }

        // Set the confirmation on the message and tie it to this batch.
        let mut message = message.clone();
        message.confirmed = Some(now);
        message.batch_id = Some(*batch_id);

        match ops.upsert_message(&message, false) {
            Ok(()) => {}
            Err(StoreError::HashMismatch) => {
                error!(
                    batch = %batch_id,
                    index,
                    message = ?message.header.id,
                    "invalid message entry: hash mismatch with existing record"
                );
                return Ok(());
            }
            Err(e) => {
                error!(batch = %batch_id, index, %e, "failed to insert message entry");
                return Err(e);
            }
        }

        // One event per accepted message; the store assigns the sequence.
        let Some(message_id) = message.header.id else {
            // verify() guarantees the id, but never panic on a data path.
            return Ok(());
        };
        ops.insert_event(&Event::new(
            EventType::MessageConfirmed,
            message_id,
            namespace,
            now,
        ))?;
        confirmed_refs.push(message_id);
        Ok(())
    }
}

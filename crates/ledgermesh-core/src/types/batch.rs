//! Batches: ledger-sealed collections of messages with off-chain payload.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Bytes32, Data, Message};

/// The transaction pointer carried inside a batch payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxRef {
    /// Transaction type; batch-anchoring transactions are `pin`.
    #[serde(rename = "type")]
    pub tx_type: super::TransactionType,

    /// Transaction id, assigned by the submitting node.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,
}

/// The off-chain payload of a batch.
///
/// Entries may be JSON `null` (deserialized as `None`); the aggregator
/// skips them individually rather than rejecting the whole batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchPayload {
    pub tx: TxRef,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub data: Vec<Option<Data>>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<Option<Message>>,
}

impl BatchPayload {
    /// Computes the content hash the batch's `hash` field must carry.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload has no canonical JSON form.
    pub fn hash(&self) -> Result<Bytes32, serde_json::Error> {
        Bytes32::sha256_json(self)
    }
}

/// A persisted batch. Invariant: `hash == sha256(payload)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Batch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,

    pub namespace: String,
    pub author: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash: Option<Bytes32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,

    /// Set by the aggregator when the batch is accepted off the ledger.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confirmed: Option<DateTime<Utc>>,

    pub payload: BatchPayload,
}

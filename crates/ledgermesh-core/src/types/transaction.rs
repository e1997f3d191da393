//! Transactions: the on-chain anchors of batches.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::Bytes32;

/// Transaction type discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionType {
    /// Anchors a batch on-chain.
    Pin,
}

/// Transaction processing status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Pending,
    Confirmed,
}

/// The hashed, immutable subject of a transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionSubject {
    #[serde(rename = "type")]
    pub tx_type: TransactionType,

    pub author: String,
    pub namespace: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch: Option<Uuid>,
}

impl TransactionSubject {
    /// Computes the content hash the transaction's `hash` field must carry.
    ///
    /// # Errors
    ///
    /// Returns an error if the subject has no canonical JSON form.
    pub fn hash(&self) -> Result<Bytes32, serde_json::Error> {
        Bytes32::sha256_json(self)
    }
}

/// A persisted transaction. Invariant: `hash == sha256(subject)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,

    pub subject: TransactionSubject,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash: Option<Bytes32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub confirmed: Option<DateTime<Utc>>,

    /// Transaction id assigned by the underlying ledger.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub protocol_id: String,

    /// Ledger-specific detail recorded alongside the confirmation.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub info: serde_json::Map<String, serde_json::Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<TransactionStatus>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subject_hash_tracks_fields() {
        let subject = TransactionSubject {
            tx_type: TransactionType::Pin,
            author: "0xabc".to_string(),
            namespace: "ns1".to_string(),
            batch: Some(Uuid::new_v4()),
        };
        let mut other = subject.clone();
        other.namespace = "ns2".to_string();
        assert_ne!(subject.hash().unwrap(), other.hash().unwrap());
    }

    #[test]
    fn type_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&TransactionType::Pin).unwrap(),
            "\"pin\""
        );
        assert_eq!(
            serde_json::to_string(&TransactionStatus::Confirmed).unwrap(),
            "\"confirmed\""
        );
    }
}

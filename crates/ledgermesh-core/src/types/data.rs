//! Data entries: content-addressed JSON values referenced by messages.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::Bytes32;

/// A persisted data entry. Invariant: `hash == sha256(value)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Data {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash: Option<Bytes32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub value: serde_json::Value,
}

impl Data {
    /// Computes the content hash of the value.
    ///
    /// # Errors
    ///
    /// Returns an error if the value has no canonical JSON form.
    pub fn value_hash(&self) -> Result<Bytes32, serde_json::Error> {
        Bytes32::sha256_json(&self.value)
    }
}

/// A message's pointer to a data entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataRef {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash: Option<Bytes32>,
}

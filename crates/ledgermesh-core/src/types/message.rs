//! Messages: the ordered units of a batch, verified by content hash.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use super::{Bytes32, DataRef};

/// Reasons a message fails [`Message::verify`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum VerifyError {
    /// The header carries no id.
    #[error("message header has no id")]
    MissingId,

    /// The header carries no namespace.
    #[error("message header has no namespace")]
    MissingNamespace,

    /// A data reference is missing its id or hash.
    #[error("data reference {index} is incomplete")]
    IncompleteDataRef {
        /// Position of the offending reference.
        index: usize,
    },

    /// `header.data_hash` does not match the data reference array.
    #[error("data hash does not match data references")]
    DataHashMismatch,

    /// `hash` does not match the header content.
    #[error("message hash does not match header")]
    HashMismatch,

    /// The message has no canonical JSON form to hash.
    #[error("message cannot be canonically serialized: {0}")]
    Serialization(String),
}

/// The hashed header of a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageHeader {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,

    /// Correlation id linking replies to an earlier message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cid: Option<Uuid>,

    pub author: String,
    pub namespace: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub topic: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub context: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_hash: Option<Bytes32>,
}

/// A persisted message.
///
/// Invariants: `hash == sha256(header)` and
/// `header.data_hash == sha256(data)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub header: MessageHeader,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash: Option<Bytes32>,

    /// The batch this message was sealed into, set by the aggregator.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<Uuid>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub confirmed: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub data: Vec<DataRef>,
}

impl Message {
    /// Recomputes and stores the data hash and header hash.
    ///
    /// # Errors
    ///
    /// Returns an error if the message has no canonical JSON form.
    pub fn seal(&mut self) -> Result<(), serde_json::Error> {
        self.header.data_hash = Some(Bytes32::sha256_json(&self.data)?);
        self.hash = Some(Bytes32::sha256_json(&self.header)?);
        Ok(())
    }

    /// Checks hash integrity and referential sanity.
    ///
    /// # Errors
    ///
    /// Returns the first violated rule: a missing id or namespace, an
    /// incomplete data reference, or a hash that does not match content.
    pub fn verify(&self) -> Result<(), VerifyError> {
        if self.header.id.is_none() {
            return Err(VerifyError::MissingId);
        }
        if self.header.namespace.is_empty() {
            return Err(VerifyError::MissingNamespace);
        }
        for (index, data_ref) in self.data.iter().enumerate() {
            if data_ref.id.is_none() || data_ref.hash.is_none() {
                return Err(VerifyError::IncompleteDataRef { index });
            }
        }
        let data_hash = Bytes32::sha256_json(&self.data)
            .map_err(|e| VerifyError::Serialization(e.to_string()))?;
        if self.header.data_hash != Some(data_hash) {
            return Err(VerifyError::DataHashMismatch);
        }
        let header_hash = Bytes32::sha256_json(&self.header)
            .map_err(|e| VerifyError::Serialization(e.to_string()))?;
        if self.hash != Some(header_hash) {
            return Err(VerifyError::HashMismatch);
        }
        Ok(())
    }
}

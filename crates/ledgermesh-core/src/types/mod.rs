//! Persisted entity types and their content-hashing rules.
//!
//! Every entity serializes to JSON with camelCase field names and absent
//! optional fields omitted, so that encode → persist → read → encode is
//! byte-equal. Content hashes are SHA-256 over that canonical JSON form.

mod batch;
mod data;
mod event;
mod message;
mod subscription;
mod transaction;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

pub use batch::{Batch, BatchPayload, TxRef};
pub use data::{Data, DataRef};
pub use event::{Event, EventDelivery, EventDeliveryResponse, EventType, UnknownEventType};
pub use message::{Message, MessageHeader, VerifyError};
pub use subscription::{
    FirstEvent, Subscription, SubscriptionFilter, SubscriptionOptions, SubscriptionRef,
};
pub use transaction::{Transaction, TransactionStatus, TransactionSubject, TransactionType};

/// A 32-byte content hash, rendered as lowercase hex in JSON and SQL.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Bytes32(pub [u8; 32]);

impl Bytes32 {
    /// Computes the SHA-256 digest of a byte slice.
    #[must_use]
    pub fn sha256(bytes: &[u8]) -> Self {
        let digest = Sha256::digest(bytes);
        let mut out = [0u8; 32];
        out.copy_from_slice(&digest);
        Self(out)
    }

    /// Computes the digest of a value's canonical JSON serialization.
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be serialized; a value with no
    /// canonical form cannot be hash-verified.
    pub fn sha256_json<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        Ok(Self::sha256(&serde_json::to_vec(value)?))
    }

    /// Parses a 64-character lowercase hex digest.
    ///
    /// # Errors
    ///
    /// Returns an error if the input is not exactly 32 hex-encoded bytes.
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let mut out = [0u8; 32];
        hex::decode_to_slice(s, &mut out)?;
        Ok(Self(out))
    }
}

impl std::fmt::Display for Bytes32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl std::fmt::Debug for Bytes32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Bytes32({self})")
    }
}

impl Serialize for Bytes32 {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for Bytes32 {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(|_| D::Error::custom("expected a 32-byte hex digest"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_hex_round_trip() {
        let h = Bytes32::sha256(b"ledgermesh");
        let parsed = Bytes32::from_hex(&h.to_string()).unwrap();
        assert_eq!(h, parsed);
    }

    #[test]
    fn json_form_is_quoted_hex() {
        let h = Bytes32::sha256(b"x");
        let json = serde_json::to_string(&h).unwrap();
        assert_eq!(json.len(), 66);
        let back: Bytes32 = serde_json::from_str(&json).unwrap();
        assert_eq!(h, back);
    }

    #[test]
    fn rejects_bad_hex() {
        assert!(serde_json::from_str::<Bytes32>("\"zz\"").is_err());
    }
}

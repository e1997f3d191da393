//! Content-address store client contract.
//!
//! Batch payloads live off-chain in a content store and are resolved by
//! the opaque reference carried on the ledger. The aggregator retries
//! retrieval indefinitely, so implementations report failures rather
//! than retrying internally.

use thiserror::Error;

use crate::BoxFuture;

/// Failures retrieving a payload. All variants are treated as transient
/// by the ingestion pipeline.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ContentStoreError {
    /// The store has no content for the reference (yet - propagation may
    /// lag the ledger).
    #[error("payload ref '{payload_ref}' not found in content store")]
    NotFound {
        /// The reference that failed to resolve.
        payload_ref: String,
    },

    /// The store could not be reached or failed mid-transfer.
    #[error("content store unavailable: {reason}")]
    Unavailable {
        /// Underlying failure detail.
        reason: String,
    },
}

/// A pluggable content-address store client.
pub trait ContentStore: Send + Sync {
    /// The plugin name, for logs.
    fn name(&self) -> &str;

    /// Retrieves the full payload bytes for a reference.
    ///
    /// # Errors
    ///
    /// Returns a [`ContentStoreError`] the caller is expected to retry
    /// until shutdown.
    fn retrieve_data<'a>(
        &'a self,
        payload_ref: &'a str,
    ) -> BoxFuture<'a, Result<Vec<u8>, ContentStoreError>>;
}

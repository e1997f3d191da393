//! Persistence gateway: the transactional store behind the event core.
//!
//! The [`Database`] trait is the seam between the event pipeline and
//! durable storage. Writes that must land together run inside
//! [`Database::run_as_group`], which hands the caller a [`GroupOps`]
//! scope backed by one transaction: everything commits or rolls back as
//! a unit.
//!
//! Two sentinel outcomes are part of the contract and surfaced as
//! matchable error variants rather than generic failures:
//!
//! - [`StoreError::HashMismatch`]: an upsert with `allow_hash_update =
//!   false` found an existing row whose content hash differs. Replaying
//!   the same write yields the same mismatch, so callers treat it as
//!   permanent-per-item, never retryable.
//! - [`StoreError::IdMismatch`]: a subscription upsert tried to change
//!   the immutable generated id of an existing `(namespace, name)` row.

mod sqlite;

#[cfg(test)]
mod tests;

use thiserror::Error;
use uuid::Uuid;

use crate::filter::{FieldDef, FieldKind, Filter, FilterBuilder, FilterError, QueryFields, Update};
use crate::types::{Batch, Data, Event, Message, Subscription, Transaction};

pub use sqlite::SqliteStore;

/// Errors from the persistence gateway.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// An existing row's content hash differs and hash updates were not
    /// allowed. Permanent for the offending item; never retried.
    #[error("hash mismatch with existing record")]
    HashMismatch,

    /// A subscription upsert carried a non-null id that differs from the
    /// stored, immutable id.
    #[error("id mismatch with existing record")]
    IdMismatch,

    /// The filter or update could not be compiled for this entity.
    #[error(transparent)]
    Filter(#[from] FilterError),

    /// The entity is missing the id its table is keyed by.
    #[error("entity is missing a required id")]
    MissingId,

    /// Underlying database failure; transient from the pipeline's point
    /// of view and funneled into the retry engine.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A stored row could not be decoded back into its entity.
    #[error("stored row in '{table}' cannot be decoded: {reason}")]
    Corrupt {
        /// The table holding the undecodable row.
        table: &'static str,
        /// Decode failure detail.
        reason: String,
    },
}

impl StoreError {
    /// Tags a row decode/encode failure with its table.
    pub(crate) fn corrupt(table: &'static str, reason: impl std::fmt::Display) -> Self {
        Self::Corrupt {
            table,
            reason: reason.to_string(),
        }
    }
}

/// A durable per-subscription delivery checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Offset {
    pub namespace: String,
    pub name: String,
    /// The last acknowledged event sequence.
    pub current: i64,
}

/// Mutations scoped to one transactional group.
///
/// All upserts take `allow_hash_update`; with `false`, a row whose
/// stored hash differs fails with [`StoreError::HashMismatch`] and the
/// row is left untouched.
pub trait GroupOps {
    /// Inserts or replaces a batch keyed by id.
    ///
    /// # Errors
    ///
    /// [`StoreError::HashMismatch`] on a conflicting existing row, or a
    /// database error.
    fn upsert_batch(&mut self, batch: &Batch, allow_hash_update: bool) -> Result<(), StoreError>;

    /// Reads a transaction inside the group, seeing earlier group writes.
    ///
    /// # Errors
    ///
    /// Returns a database or decode error.
    fn get_transaction(
        &mut self,
        namespace: &str,
        id: &Uuid,
    ) -> Result<Option<Transaction>, StoreError>;

    /// Inserts or replaces a transaction keyed by `(namespace, id)`.
    ///
    /// # Errors
    ///
    /// [`StoreError::HashMismatch`] on a conflicting existing row, or a
    /// database error.
    fn upsert_transaction(
        &mut self,
        transaction: &Transaction,
        allow_hash_update: bool,
    ) -> Result<(), StoreError>;

    /// Inserts or replaces a data entry keyed by id.
    ///
    /// # Errors
    ///
    /// [`StoreError::HashMismatch`] on a conflicting existing row, or a
    /// database error.
    fn upsert_data(&mut self, data: &Data, allow_hash_update: bool) -> Result<(), StoreError>;

    /// Inserts or replaces a message keyed by header id.
    ///
    /// # Errors
    ///
    /// [`StoreError::HashMismatch`] on a conflicting existing row, or a
    /// database error.
    fn upsert_message(
        &mut self,
        message: &Message,
        allow_hash_update: bool,
    ) -> Result<(), StoreError>;

    /// Appends an event and returns its store-assigned sequence, strictly
    /// greater than every previously assigned sequence.
    ///
    /// # Errors
    ///
    /// Returns a database error.
    fn insert_event(&mut self, event: &Event) -> Result<i64, StoreError>;
}

/// The persistence gateway.
///
/// Implementations are internally synchronized; calls are short and
/// non-blocking relative to the async suspension points of the pipeline
/// (retry sleeps, channel waits, socket I/O).
pub trait Database: Send + Sync {
    /// Runs `op` inside one transactional scope. If `op` returns an
    /// error the group rolls back and the error is returned unchanged.
    ///
    /// # Errors
    ///
    /// The operation's own error, or a database error
    /// beginning/committing the transaction.
    fn run_as_group(
        &self,
        op: &mut dyn FnMut(&mut dyn GroupOps) -> Result<(), StoreError>,
    ) -> Result<(), StoreError>;

    /// # Errors
    ///
    /// Returns a database or decode error.
    fn get_batch(&self, id: &Uuid) -> Result<Option<Batch>, StoreError>;

    /// # Errors
    ///
    /// Returns a database or decode error.
    fn get_transaction(
        &self,
        namespace: &str,
        id: &Uuid,
    ) -> Result<Option<Transaction>, StoreError>;

    /// # Errors
    ///
    /// Returns a database or decode error.
    fn get_data(&self, id: &Uuid) -> Result<Option<Data>, StoreError>;

    /// # Errors
    ///
    /// Returns a database or decode error.
    fn get_message(&self, id: &Uuid) -> Result<Option<Message>, StoreError>;

    /// Queries events with a filter built against [`EVENT_FIELDS`].
    ///
    /// # Errors
    ///
    /// Returns a filter compile error or a database error.
    fn get_events(&self, filter: &Filter) -> Result<Vec<Event>, StoreError>;

    /// The highest assigned event sequence, or 0 when no events exist.
    ///
    /// # Errors
    ///
    /// Returns a database error.
    fn highest_event_sequence(&self) -> Result<i64, StoreError>;

    /// Creates or updates a subscription, unique on `(namespace, name)`,
    /// and returns its stored id (generated on first insert).
    ///
    /// With `allow_existing = false` an existing row surfaces as a
    /// database constraint error; with `true` the row is updated in
    /// place, and a non-null `sub.id` differing from the stored id fails
    /// with [`StoreError::IdMismatch`] leaving the row unchanged.
    ///
    /// # Errors
    ///
    /// [`StoreError::IdMismatch`] or a database error.
    fn upsert_subscription(
        &self,
        subscription: &Subscription,
        allow_existing: bool,
    ) -> Result<Uuid, StoreError>;

    /// # Errors
    ///
    /// Returns a database or decode error.
    fn get_subscription(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Subscription>, StoreError>;

    /// Queries subscriptions with a filter built against
    /// [`SUBSCRIPTION_FIELDS`].
    ///
    /// # Errors
    ///
    /// Returns a filter compile error or a database error.
    fn get_subscriptions(&self, filter: &Filter) -> Result<Vec<Subscription>, StoreError>;

    /// Applies a field-wise update to one subscription.
    ///
    /// # Errors
    ///
    /// Returns a filter compile error (offending field named) or a
    /// database error.
    fn update_subscription(
        &self,
        namespace: &str,
        name: &str,
        update: &Update,
    ) -> Result<(), StoreError>;

    /// Deletes a subscription and its delivery offset.
    ///
    /// # Errors
    ///
    /// Returns a database error.
    fn delete_subscription(&self, id: &Uuid) -> Result<(), StoreError>;

    /// # Errors
    ///
    /// Returns a database error.
    fn get_offset(&self, namespace: &str, name: &str) -> Result<Option<Offset>, StoreError>;

    /// # Errors
    ///
    /// Returns a database error.
    fn upsert_offset(&self, offset: &Offset) -> Result<(), StoreError>;
}

/// Queryable fields of a subscription.
pub const SUBSCRIPTION_FIELDS: QueryFields = &[
    FieldDef {
        name: "id",
        kind: FieldKind::Uuid,
    },
    FieldDef {
        name: "namespace",
        kind: FieldKind::String,
    },
    FieldDef {
        name: "name",
        kind: FieldKind::String,
    },
    FieldDef {
        name: "transport",
        kind: FieldKind::String,
    },
    FieldDef {
        name: "events",
        kind: FieldKind::String,
    },
    FieldDef {
        name: "topic",
        kind: FieldKind::String,
    },
    FieldDef {
        name: "context",
        kind: FieldKind::String,
    },
    FieldDef {
        name: "group",
        kind: FieldKind::String,
    },
    FieldDef {
        name: "created",
        kind: FieldKind::Time,
    },
];

/// Queryable fields of an event.
pub const EVENT_FIELDS: QueryFields = &[
    FieldDef {
        name: "sequence",
        kind: FieldKind::Int64,
    },
    FieldDef {
        name: "type",
        kind: FieldKind::String,
    },
    FieldDef {
        name: "reference",
        kind: FieldKind::Uuid,
    },
    FieldDef {
        name: "namespace",
        kind: FieldKind::String,
    },
    FieldDef {
        name: "created",
        kind: FieldKind::Time,
    },
];

/// A filter builder over [`SUBSCRIPTION_FIELDS`].
#[must_use]
pub const fn subscription_filter() -> FilterBuilder {
    FilterBuilder::new(SUBSCRIPTION_FIELDS)
}

/// A filter builder over [`EVENT_FIELDS`].
#[must_use]
pub const fn event_filter() -> FilterBuilder {
    FilterBuilder::new(EVENT_FIELDS)
}

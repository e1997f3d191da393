//! Core domain model and contracts for the ledgermesh event fabric.
//!
//! This crate holds everything the daemon and its plugins agree on:
//!
//! - [`types`]: the persisted entities (batches, transactions, data,
//!   messages, events, subscriptions) and their content hashing rules
//! - [`ledger`]: the inbound contract a ledger adapter drives
//! - [`store`]: the persistence gateway trait and its `SQLite` backend
//! - [`contentstore`]: the content-address store client contract
//! - [`filter`]: the composable, typed filter/update builder used for
//!   store queries
//! - [`retry`]: the exponential-backoff retry engine every blocking loop
//!   funnels through
//! - [`shutdown`]: the cancellation signal observed at every waiting site

use std::future::Future;
use std::pin::Pin;

pub mod contentstore;
pub mod filter;
pub mod ledger;
pub mod retry;
pub mod shutdown;
pub mod store;
pub mod types;

/// A boxed future for object-safe async trait methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

//! Event aggregation and subscription delivery daemon.
//!
//! The daemon sits between a ledger adapter and long-lived consumer
//! connections:
//!
//! ```text
//! ┌──────────────┐    ┌──────────────────┐    ┌──────────────────┐
//! │ ledger       │    │ event core       │    │ transports       │
//! │ adapter      │    │ (this crate)     │    │ (websockets, …)  │
//! ├──────────────┤    ├──────────────────┤    ├──────────────────┤
//! │ ordered      │───▶│ aggregator       │    │ deliver + ack    │
//! │ batch stream │    │ poller/dispatch  │───▶│ per connection   │
//! └──────────────┘    └──────────────────┘    └──────────────────┘
//! ```
//!
//! The aggregator persists each sealed batch exactly as the ledger
//! ordered it and queues one event per accepted message; the poller
//! fans those events out to matching subscriptions with one inflight
//! delivery per subscription, advancing checkpoints only on ack.

pub mod config;
pub mod contentstore;
pub mod events;
pub mod transport;

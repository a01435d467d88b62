//! # hearth-federation
//!
//! Outbound federation: everything between "the core persisted something" and
//! "a remote homeserver acknowledged it".
//!
//! - [`queue`] — per-destination transaction batching, dedup and delivery
//! - [`backoff`] — failure classification and per-destination circuit breaking
//! - [`client`] — signed HTTPS delivery of one transaction
//! - [`keys`] / [`signing`] — the Ed25519 server identity and Matrix
//!   canonical-JSON request signatures
//! - [`types`] — the transaction envelope and EDU wire types
//!
//! Delivery is at-least-once: device rows and stream cursors are only
//! committed after the remote returned 2xx, so a crash mid-send redelivers.

pub mod backoff;
pub mod client;
pub mod error;
pub mod keys;
pub mod queue;
pub mod signing;
pub mod types;

pub use backoff::{Backoff, FailureClass};
pub use client::{DirectResolver, FederationClient, ServerResolver, TransactionSender};
pub use error::{FederationError, SendError};
pub use keys::SigningKeyPair;
pub use queue::TransactionQueue;
pub use types::{Edu, Transaction};

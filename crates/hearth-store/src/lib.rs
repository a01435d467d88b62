//! # hearth-store
//!
//! The federation sender's view of the homeserver database. The sender only
//! ever touches a handful of tables: the event stream (read), the
//! device-message outbox and device-list pokes (read + commit), per-room
//! membership (read, to resolve destination sets) and its own persisted
//! stream positions (read + write).
//!
//! Everything is exposed through the [`FederationStore`] trait so the
//! transaction queue can be exercised against an in-memory double; the real
//! implementation is [`PgStore`] on a `sqlx` Postgres pool.

pub mod pg;
pub mod types;

use async_trait::async_trait;
use thiserror::Error;

pub use pg::PgStore;
pub use types::{DeviceListPokeRow, DeviceMessageRow, EventRow};

/// Errors from the store collaborator.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Room '{0}' is not known to this server")]
    UnknownRoom(String),

    #[error("Malformed row: {0}")]
    MalformedRow(String),
}

/// Read/write operations the federation sender needs from the homeserver
/// database.
///
/// Commit operations (`delete_device_messages`, `mark_device_list_pokes_sent`,
/// `set_federation_position`) must only be called after a verified-successful
/// send; a crash before commit results in redelivery, never loss.
#[async_trait]
pub trait FederationStore: Send + Sync {
    /// The persisted "processed up to" position for a logical sub-stream
    /// (`"events"`, `"receipts"`, …). Zero if never written.
    async fn federation_position(&self, kind: &str) -> Result<i64, StoreError>;

    /// Persist a new "processed up to" position for a sub-stream.
    async fn set_federation_position(&self, kind: &str, position: i64) -> Result<(), StoreError>;

    /// Events with stream ordering in `(from, to]`, oldest first, at most
    /// `limit` rows.
    async fn events_after(
        &self,
        from: i64,
        to: i64,
        limit: u32,
    ) -> Result<Vec<EventRow>, StoreError>;

    /// Server names with at least one joined member in the room. Includes
    /// this server; callers filter themselves out.
    async fn joined_hosts(&self, room_id: &str) -> Result<Vec<String>, StoreError>;

    /// The room's event-format version (`"1"`, `"2"`, `"6"`, …).
    async fn room_version(&self, room_id: &str) -> Result<String, StoreError>;

    /// Undelivered device-to-device messages for a destination with stream id
    /// greater than `after`, oldest first.
    async fn device_messages_for(
        &self,
        destination: &str,
        after: i64,
        limit: u32,
    ) -> Result<Vec<DeviceMessageRow>, StoreError>;

    /// Delete outbox rows for a destination up to and including `up_to`.
    /// Called only after the transaction containing them was acknowledged.
    async fn delete_device_messages(&self, destination: &str, up_to: i64)
    -> Result<(), StoreError>;

    /// Device-list pokes for a destination not yet marked sent, with stream
    /// id greater than `after`, oldest first.
    async fn device_list_pokes_for(
        &self,
        destination: &str,
        after: i64,
        limit: u32,
    ) -> Result<Vec<DeviceListPokeRow>, StoreError>;

    /// Mark device-list pokes for a destination as sent up to and including
    /// `up_to`.
    async fn mark_device_list_pokes_sent(
        &self,
        destination: &str,
        up_to: i64,
    ) -> Result<(), StoreError>;
}

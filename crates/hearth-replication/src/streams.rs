//! Typed projections of the raw replication streams.
//!
//! Each stream name maps to one row type. Rows arrive as JSON values on the
//! wire and are decoded through [`ReplicationRow::decode`]; a row that fails
//! to decode is reported and skipped without affecting its siblings in the
//! same batch.

use serde::Deserialize;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::protocol::StreamPosition;

/// A typed row on a named replication stream.
pub trait ReplicationRow: Clone + Send + Sync + 'static {
    /// The stream this row type is decoded from.
    const STREAM_NAME: &'static str;

    /// Decode one raw row.
    fn decode(raw: &Value) -> Result<Self, serde_json::Error>;
}

/// A completed batch delivered to subscribers: the decoded rows plus the
/// position the stream advanced to.
#[derive(Debug, Clone)]
pub struct StreamUpdate<T> {
    pub rows: Vec<T>,
    pub position: StreamPosition,
}

/// Handle to a bound stream. Cheap to clone; each consumer calls
/// [`StreamHandle::subscribe`] (or `subscribe_positions`) independently and
/// cancels by dropping its receiver.
#[derive(Clone)]
pub struct StreamHandle<T> {
    pub(crate) rows_tx: broadcast::Sender<StreamUpdate<T>>,
    pub(crate) positions_tx: broadcast::Sender<StreamPosition>,
}

impl<T: Clone> StreamHandle<T> {
    /// Subscribe to completed batches of decoded rows.
    pub fn subscribe(&self) -> broadcast::Receiver<StreamUpdate<T>> {
        self.rows_tx.subscribe()
    }

    /// Subscribe to position advances, including ones that carried no rows.
    pub fn subscribe_positions(&self) -> broadcast::Receiver<StreamPosition> {
        self.positions_tx.subscribe()
    }
}

// ─── Row types ───────────────────────────────────────────────────────────────

/// Row on the `events` stream: a new persisted room event. Only a hint; the
/// event body is fetched from the store by stream-ordering range.
#[derive(Debug, Clone, Deserialize)]
pub struct EventStreamRow {
    pub room_id: String,
    pub event_id: String,
    #[serde(rename = "type")]
    pub event_type: String,
}

impl ReplicationRow for EventStreamRow {
    const STREAM_NAME: &'static str = "events";

    fn decode(raw: &Value) -> Result<Self, serde_json::Error> {
        Self::deserialize(raw)
    }
}

/// Row on the `federation` stream: pre-routed ephemeral traffic the core
/// wants sent out. Every bucket may be empty.
#[derive(Debug, Clone, Deserialize)]
pub struct FederationRow {
    /// Presence updates plus the remote servers interested in them.
    #[serde(default)]
    pub presence: Vec<PresenceEntry>,
    /// Keyed EDUs: a later entry with the same `(edu_type, key)` for the same
    /// destination supersedes an earlier one.
    #[serde(default)]
    pub keyed_edus: Vec<KeyedEdu>,
    /// Unkeyed EDUs, delivered in order.
    #[serde(default)]
    pub edus: Vec<PlainEdu>,
    /// Destinations with pending device traffic (hint to drain the outbox).
    #[serde(default)]
    pub devices: Vec<String>,
}

impl ReplicationRow for FederationRow {
    const STREAM_NAME: &'static str = "federation";

    fn decode(raw: &Value) -> Result<Self, serde_json::Error> {
        Self::deserialize(raw)
    }
}

/// One user's presence update and where it should go.
#[derive(Debug, Clone, Deserialize)]
pub struct PresenceEntry {
    pub destinations: Vec<String>,
    pub user_id: String,
    /// `online`, `unavailable` or `offline`.
    pub presence: String,
    #[serde(default)]
    pub status_msg: Option<String>,
}

/// A keyed ephemeral event for one destination (e.g. typing, keyed by room).
#[derive(Debug, Clone, Deserialize)]
pub struct KeyedEdu {
    pub destination: String,
    pub edu_type: String,
    /// Dedup key; only the latest EDU per `(edu_type, key)` survives until
    /// the next send.
    pub key: Vec<String>,
    pub content: Value,
}

/// An unkeyed ephemeral event for one destination.
#[derive(Debug, Clone, Deserialize)]
pub struct PlainEdu {
    pub destination: String,
    pub edu_type: String,
    pub content: Value,
}

/// Row on the `device_lists` stream: a destination that must be told about
/// local device changes.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceListsRow {
    pub destination: String,
}

impl ReplicationRow for DeviceListsRow {
    const STREAM_NAME: &'static str = "device_lists";

    fn decode(raw: &Value) -> Result<Self, serde_json::Error> {
        Self::deserialize(raw)
    }
}

/// Row on the `receipts` stream: a local user's read receipt.
#[derive(Debug, Clone, Deserialize)]
pub struct ReceiptRow {
    pub room_id: String,
    pub receipt_type: String,
    pub user_id: String,
    pub event_id: String,
    #[serde(default)]
    pub data: Value,
}

impl ReplicationRow for ReceiptRow {
    const STREAM_NAME: &'static str = "receipts";

    fn decode(raw: &Value) -> Result<Self, serde_json::Error> {
        Self::deserialize(raw)
    }
}

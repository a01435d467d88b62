//! Row types returned by the store collaborator.

use serde_json::Value;

/// A room event as read from the event stream.
#[derive(Debug, Clone)]
pub struct EventRow {
    /// Position of this event on the event stream. Monotonic per server.
    pub stream_ordering: i64,
    pub event_id: String,
    pub room_id: String,
    /// Event type (e.g. `m.room.message`).
    pub event_type: String,
    /// Full user id of the sender (`@user:server`).
    pub sender: String,
    /// The full persisted event JSON, as originally signed.
    pub json: Value,
}

impl EventRow {
    /// The server-name part of the sender, used to skip events this server
    /// did not originate.
    pub fn sender_server(&self) -> Option<&str> {
        self.sender.split_once(':').map(|(_, server)| server)
    }
}

/// A queued device-to-device message bound for one destination.
#[derive(Debug, Clone)]
pub struct DeviceMessageRow {
    /// Position on the device-message outbox stream.
    pub stream_id: i64,
    /// Full user id of the sending user.
    pub sender: String,
    /// Message type (e.g. `m.room_key_request`).
    pub message_type: String,
    /// Unique id assigned when the message was queued, for dedup downstream.
    pub message_id: String,
    /// Per-recipient message map: `user_id -> device_id -> content`.
    pub messages: Value,
}

/// A pending "this user's device list changed" notification for one
/// destination.
#[derive(Debug, Clone)]
pub struct DeviceListPokeRow {
    /// Position on the device-list stream.
    pub stream_id: i64,
    pub user_id: String,
    pub device_id: String,
}

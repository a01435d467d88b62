//! # hearth-replication
//!
//! Client for the homeserver core's change-replication listener: a plain TCP
//! socket speaking newline-delimited ASCII commands. The core pushes
//! positioned rows for each named stream (`events`, `federation`,
//! `device_lists`, `receipts`); this crate decodes them into typed rows and
//! republishes them on broadcast channels.
//!
//! ## Protocol
//!
//! ```text
//! client → server:  NAME <client>
//!                   REPLICATE <stream> <position|NOW>
//!                   PING <token>
//!                   FEDERATION_ACK <token>
//! server → client:  SERVER <name>
//!                   RDATA <stream> <position|batch> <json-row>
//!                   POSITION <stream> <position>
//!                   PING <token>
//!                   ERROR <message>
//! ```
//!
//! An `RDATA` line whose position is the literal `batch` marker is a
//! continuation: rows accumulate until a line with a real position closes the
//! batch, at which point the whole row list is delivered at that position.
//!
//! ## Failure model
//!
//! The client never reconnects on its own. A socket error ends the read loop
//! and surfaces as [`ReplicationNotice::Disconnected`]; the owning process
//! calls [`ReplicationClient::connect`] again and the client resumes every
//! bound stream from its last seen position.

pub mod client;
pub mod error;
pub mod protocol;
pub mod streams;

pub use client::{ReplicationClient, ReplicationNotice};
pub use error::ReplicationError;
pub use protocol::{ClientCommand, ServerCommand, StreamPosition};
pub use streams::{
    DeviceListsRow, EventStreamRow, FederationRow, KeyedEdu, PlainEdu, PresenceEntry, ReceiptRow,
    ReplicationRow, StreamHandle, StreamUpdate,
};

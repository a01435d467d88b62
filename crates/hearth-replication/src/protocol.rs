//! Wire codec for the newline-delimited replication protocol.
//!
//! Each line is `VERB[ args…]`. Arguments are space-separated except the last
//! one, which runs to end of line (the JSON row for `RDATA`, the message for
//! `ERROR`). Parsing and encoding are pure so they can be tested without a
//! socket.

use std::fmt;
use std::str::FromStr;

use serde_json::Value;

use crate::error::ReplicationError;

/// `RDATA` position field meaning "more rows follow for this batch".
pub const BATCH_MARKER: &str = "batch";

/// Position sentinel meaning "start from whatever the server has now".
pub const LATEST_POSITION: &str = "NOW";

/// An opaque, per-stream, monotonically non-decreasing watermark.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StreamPosition(pub i64);

impl fmt::Display for StreamPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for StreamPosition {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(StreamPosition(s.parse()?))
    }
}

// ─── Server → client ─────────────────────────────────────────────────────────

/// A command received from the replication source.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerCommand {
    /// Upstream identity announcement.
    Server { name: String },
    /// One row for a stream. `position` is `None` while the batch is still
    /// open (the literal `batch` marker on the wire).
    Rdata {
        stream: String,
        position: Option<StreamPosition>,
        row: Value,
    },
    /// The stream's committed position advanced without producing rows.
    Position {
        stream: String,
        position: StreamPosition,
    },
    /// Keepalive from the server.
    Ping { token: String },
    /// The server cannot continue this session (e.g. the requested resume
    /// position has been discarded upstream).
    Error { message: String },
}

impl ServerCommand {
    /// Parse one protocol line (without its trailing newline).
    pub fn parse(line: &str) -> Result<Self, ReplicationError> {
        let malformed = || ReplicationError::MalformedCommand(line.to_owned());

        let (verb, rest) = match line.split_once(' ') {
            Some((verb, rest)) => (verb, rest),
            None => (line, ""),
        };

        match verb {
            "SERVER" => {
                if rest.is_empty() {
                    return Err(malformed());
                }
                Ok(ServerCommand::Server { name: rest.to_owned() })
            }
            "RDATA" => {
                let mut parts = rest.splitn(3, ' ');
                let stream = parts.next().filter(|s| !s.is_empty()).ok_or_else(malformed)?;
                let position = parts.next().ok_or_else(malformed)?;
                let payload = parts.next().ok_or_else(malformed)?;

                let position = if position == BATCH_MARKER {
                    None
                } else {
                    Some(position.parse().map_err(|_| malformed())?)
                };
                let row = serde_json::from_str(payload).map_err(|_| malformed())?;
                Ok(ServerCommand::Rdata { stream: stream.to_owned(), position, row })
            }
            "POSITION" => {
                let (stream, position) = rest.split_once(' ').ok_or_else(malformed)?;
                if stream.is_empty() {
                    return Err(malformed());
                }
                Ok(ServerCommand::Position {
                    stream: stream.to_owned(),
                    position: position.parse().map_err(|_| malformed())?,
                })
            }
            "PING" => Ok(ServerCommand::Ping { token: rest.to_owned() }),
            "ERROR" => Ok(ServerCommand::Error { message: rest.to_owned() }),
            _ => Err(malformed()),
        }
    }
}

// ─── Client → server ─────────────────────────────────────────────────────────

/// A command this client sends to the replication source.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientCommand {
    /// Identify this connection.
    Name { client: String },
    /// Subscribe to a stream, resuming after `position` (or from the latest
    /// if `None`).
    Replicate {
        stream: &'static str,
        position: Option<StreamPosition>,
    },
    /// Keepalive.
    Ping { token: String },
    /// Acknowledge processing of the federation stream up to `token`, so the
    /// upstream can trim its in-memory queue.
    FederationAck { token: StreamPosition },
}

impl ClientCommand {
    /// Encode as one protocol line, without the trailing newline.
    pub fn encode(&self) -> String {
        match self {
            ClientCommand::Name { client } => format!("NAME {client}"),
            ClientCommand::Replicate { stream, position } => match position {
                Some(pos) => format!("REPLICATE {stream} {pos}"),
                None => format!("REPLICATE {stream} {LATEST_POSITION}"),
            },
            ClientCommand::Ping { token } => format!("PING {token}"),
            ClientCommand::FederationAck { token } => format!("FEDERATION_ACK {token}"),
        }
    }
}

//! Connection owner for the replication socket.
//!
//! One [`ReplicationClient`] owns at most one live TCP connection to the
//! homeserver core. `connect` is idempotent: any previous connection is torn
//! down first and every bound stream re-subscribes from its last seen
//! position. The read loop, the write loop and the keepalive ping each run on
//! their own task; subscriber delivery happens synchronously on the read
//! loop, so handlers must not block.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::ReplicationError;
use crate::protocol::{ClientCommand, ServerCommand, StreamPosition};
use crate::streams::{ReplicationRow, StreamHandle, StreamUpdate};

const PING_INTERVAL: Duration = Duration::from_secs(5);
const COMMAND_BUFFER: usize = 64;
const NOTICE_BUFFER: usize = 256;
const STREAM_BUFFER: usize = 1024;

/// Out-of-band events from the replication connection.
#[derive(Debug, Clone)]
pub enum ReplicationNotice {
    /// Upstream announced its identity.
    Server { name: String },
    /// Keepalive from the server.
    Ping { token: String },
    /// The server refused to continue (e.g. resume position no longer held).
    /// The connection is unusable; reconnect from scratch.
    Error { message: String },
    /// A stream's committed position advanced.
    Position { stream: String, position: StreamPosition },
    /// A row on a bound stream could not be decoded and was skipped.
    DecodeError { stream: String, message: String },
    /// The read loop ended. The client does not reconnect itself.
    Disconnected,
}

type DeliverFn = Box<dyn Fn(Vec<Value>, StreamPosition) + Send + Sync>;
type PositionFn = Box<dyn Fn(StreamPosition) + Send + Sync>;

struct RawBinding {
    deliver: DeliverFn,
    notify_position: PositionFn,
}

struct Connection {
    cmd_tx: mpsc::Sender<ClientCommand>,
    read_task: JoinHandle<()>,
    write_task: JoinHandle<()>,
    ping_task: JoinHandle<()>,
}

impl Connection {
    fn abort(&self) {
        self.read_task.abort();
        self.write_task.abort();
        self.ping_task.abort();
    }
}

struct Inner {
    client_name: String,
    notices: broadcast::Sender<ReplicationNotice>,
    /// Last seen committed position per stream, used to resume on reconnect.
    positions: Mutex<HashMap<String, StreamPosition>>,
    bindings: Mutex<HashMap<&'static str, RawBinding>>,
    conn: tokio::sync::Mutex<Option<Connection>>,
}

/// Client for the core's replication listener. Cheap to clone.
#[derive(Clone)]
pub struct ReplicationClient {
    inner: Arc<Inner>,
}

impl ReplicationClient {
    /// Create a disconnected client identifying as `client_name`.
    pub fn new(client_name: impl Into<String>) -> Self {
        let (notices, _) = broadcast::channel(NOTICE_BUFFER);
        Self {
            inner: Arc::new(Inner {
                client_name: client_name.into(),
                notices,
                positions: Mutex::new(HashMap::new()),
                bindings: Mutex::new(HashMap::new()),
                conn: tokio::sync::Mutex::new(None),
            }),
        }
    }

    /// Subscribe to out-of-band notices (server identity, pings, errors,
    /// position advances, disconnects).
    pub fn notices(&self) -> broadcast::Receiver<ReplicationNotice> {
        self.inner.notices.subscribe()
    }

    /// Bind a typed stream. Must be called before `connect` for the
    /// subscription to be requested; binding the same stream type twice is a
    /// caller error.
    pub fn bind_stream<T: ReplicationRow>(&self) -> Result<StreamHandle<T>, ReplicationError> {
        let mut bindings = self.inner.bindings.lock().expect("bindings lock poisoned");
        if bindings.contains_key(T::STREAM_NAME) {
            return Err(ReplicationError::StreamAlreadyBound(T::STREAM_NAME));
        }

        let (rows_tx, _) = broadcast::channel::<StreamUpdate<T>>(STREAM_BUFFER);
        let (positions_tx, _) = broadcast::channel::<StreamPosition>(STREAM_BUFFER);
        let handle = StreamHandle { rows_tx: rows_tx.clone(), positions_tx: positions_tx.clone() };

        let notices = self.inner.notices.clone();
        let deliver: DeliverFn = Box::new(move |raw_rows, position| {
            let mut rows = Vec::with_capacity(raw_rows.len());
            for raw in &raw_rows {
                match T::decode(raw) {
                    Ok(row) => rows.push(row),
                    Err(e) => {
                        // One bad row must not sink its siblings.
                        tracing::error!(
                            stream = T::STREAM_NAME,
                            error = %e,
                            "Skipping undecodable replication row"
                        );
                        let _ = notices.send(ReplicationNotice::DecodeError {
                            stream: T::STREAM_NAME.to_owned(),
                            message: e.to_string(),
                        });
                    }
                }
            }
            if !rows.is_empty() {
                let _ = rows_tx.send(StreamUpdate { rows, position });
            }
        });
        let notify_position: PositionFn = Box::new(move |position| {
            let _ = positions_tx.send(position);
        });

        bindings.insert(T::STREAM_NAME, RawBinding { deliver, notify_position });
        Ok(handle)
    }

    /// Open (or replace) the connection to the replication source, identify,
    /// resume every bound stream, and start the read and keepalive tasks.
    pub async fn connect(&self, host: &str, port: u16) -> Result<(), ReplicationError> {
        let mut conn = self.inner.conn.lock().await;
        if let Some(old) = conn.take() {
            debug!("Tearing down previous replication connection");
            old.abort();
        }

        let stream = TcpStream::connect((host, port)).await?;
        let (read_half, write_half) = stream.into_split();

        let (cmd_tx, cmd_rx) = mpsc::channel::<ClientCommand>(COMMAND_BUFFER);
        let write_task = tokio::spawn(write_loop(write_half, cmd_rx));

        // Identify, then re-subscribe each bound stream from its last seen
        // position (NOW on first connect).
        let mut startup = vec![ClientCommand::Name { client: self.inner.client_name.clone() }];
        {
            let bindings = self.inner.bindings.lock().expect("bindings lock poisoned");
            let positions = self.inner.positions.lock().expect("positions lock poisoned");
            for &stream_name in bindings.keys() {
                startup.push(ClientCommand::Replicate {
                    stream: stream_name,
                    position: positions.get(stream_name).copied(),
                });
            }
        }
        for cmd in startup {
            cmd_tx.send(cmd).await.map_err(|_| ReplicationError::NotConnected)?;
        }

        let read_task = tokio::spawn(read_loop(self.inner.clone(), BufReader::new(read_half)));
        let ping_task = tokio::spawn(ping_loop(cmd_tx.clone()));

        *conn = Some(Connection { cmd_tx, read_task, write_task, ping_task });
        info!(host, port, "Replication connection established");
        Ok(())
    }

    /// Send a command on the live connection. Calling this while disconnected
    /// is a caller error and returns [`ReplicationError::NotConnected`].
    pub async fn send_command(&self, cmd: ClientCommand) -> Result<(), ReplicationError> {
        let conn = self.inner.conn.lock().await;
        let conn = conn.as_ref().ok_or(ReplicationError::NotConnected)?;
        conn.cmd_tx.send(cmd).await.map_err(|_| ReplicationError::NotConnected)
    }

    /// Acknowledge federation-stream processing up to `token` so the core can
    /// trim its queue.
    pub async fn federation_ack(&self, token: StreamPosition) -> Result<(), ReplicationError> {
        self.send_command(ClientCommand::FederationAck { token }).await
    }

    /// Last seen committed position for a stream, if any.
    pub fn position(&self, stream: &str) -> Option<StreamPosition> {
        self.inner.positions.lock().expect("positions lock poisoned").get(stream).copied()
    }
}

impl Inner {
    fn handle_line(&self, line: &str, pending: &mut HashMap<String, Vec<Value>>) {
        let cmd = match ServerCommand::parse(line) {
            Ok(cmd) => cmd,
            Err(e) => {
                // Protocol decode errors skip the line, never the stream.
                warn!(error = %e, "Ignoring malformed replication line");
                return;
            }
        };

        match cmd {
            ServerCommand::Server { name } => {
                info!(upstream = %name, "Replication server announced");
                let _ = self.notices.send(ReplicationNotice::Server { name });
            }
            ServerCommand::Ping { token } => {
                let _ = self.notices.send(ReplicationNotice::Ping { token });
            }
            ServerCommand::Error { message } => {
                warn!(message = %message, "Replication server error");
                let _ = self.notices.send(ReplicationNotice::Error { message });
            }
            ServerCommand::Rdata { stream, position: None, row } => {
                pending.entry(stream).or_default().push(row);
            }
            ServerCommand::Rdata { stream, position: Some(position), row } => {
                let mut rows = pending.remove(&stream).unwrap_or_default();
                rows.push(row);
                self.advance(&stream, position);

                let bindings = self.bindings.lock().expect("bindings lock poisoned");
                if let Some(binding) = bindings.get(stream.as_str()) {
                    (binding.deliver)(rows, position);
                    (binding.notify_position)(position);
                } else {
                    debug!(stream = %stream, "Dropping rows for unbound stream");
                }
                drop(bindings);

                let _ = self.notices.send(ReplicationNotice::Position { stream, position });
            }
            ServerCommand::Position { stream, position } => {
                self.advance(&stream, position);
                let bindings = self.bindings.lock().expect("bindings lock poisoned");
                if let Some(binding) = bindings.get(stream.as_str()) {
                    (binding.notify_position)(position);
                }
                drop(bindings);
                let _ = self.notices.send(ReplicationNotice::Position { stream, position });
            }
        }
    }

    fn advance(&self, stream: &str, position: StreamPosition) {
        let mut positions = self.positions.lock().expect("positions lock poisoned");
        let entry = positions.entry(stream.to_owned()).or_insert(position);
        // Positions never go backwards.
        if position > *entry {
            *entry = position;
        }
    }
}

async fn read_loop(inner: Arc<Inner>, reader: BufReader<OwnedReadHalf>) {
    let mut lines = reader.lines();
    let mut pending: HashMap<String, Vec<Value>> = HashMap::new();

    loop {
        match lines.next_line().await {
            Ok(Some(line)) if line.is_empty() => continue,
            Ok(Some(line)) => inner.handle_line(&line, &mut pending),
            Ok(None) => {
                info!("Replication connection closed by server");
                break;
            }
            Err(e) => {
                warn!(error = %e, "Replication socket read failed");
                break;
            }
        }
    }

    let _ = inner.notices.send(ReplicationNotice::Disconnected);
}

async fn write_loop(mut writer: OwnedWriteHalf, mut cmd_rx: mpsc::Receiver<ClientCommand>) {
    while let Some(cmd) = cmd_rx.recv().await {
        let mut line = cmd.encode();
        line.push('\n');
        if let Err(e) = writer.write_all(line.as_bytes()).await {
            warn!(error = %e, "Replication socket write failed");
            break;
        }
    }
}

async fn ping_loop(cmd_tx: mpsc::Sender<ClientCommand>) {
    let mut interval = tokio::time::interval(PING_INTERVAL);
    loop {
        interval.tick().await;
        let token = chrono::Utc::now().timestamp_millis().to_string();
        if cmd_tx.send(ClientCommand::Ping { token }).await.is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streams::EventStreamRow;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    const RECV_TIMEOUT: Duration = Duration::from_secs(5);

    /// Mock replication server: accepts one connection and writes the given
    /// lines, then keeps the socket open.
    async fn mock_server(lines: &'static [&'static str]) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            for line in lines {
                stream.write_all(line.as_bytes()).await.unwrap();
                stream.write_all(b"\n").await.unwrap();
            }
            // Keep the connection open so the read loop doesn't end.
            tokio::time::sleep(Duration::from_secs(30)).await;
        });
        addr
    }

    #[tokio::test]
    async fn batch_rows_are_delivered_as_one_update() {
        let addr = mock_server(&[
            "SERVER core.example",
            r#"RDATA events batch {"room_id":"!r:hs","event_id":"$1:hs","type":"m.room.message"}"#,
            r#"RDATA events batch {"room_id":"!r:hs","event_id":"$2:hs","type":"m.room.message"}"#,
            r#"RDATA events 42 {"room_id":"!r:hs","event_id":"$3:hs","type":"m.room.message"}"#,
        ])
        .await;

        let client = ReplicationClient::new("test");
        let handle = client.bind_stream::<EventStreamRow>().unwrap();
        let mut rx = handle.subscribe();

        client.connect(&addr.ip().to_string(), addr.port()).await.unwrap();

        let update = timeout(RECV_TIMEOUT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(update.rows.len(), 3);
        assert_eq!(update.position, StreamPosition(42));
        assert_eq!(update.rows[0].event_id, "$1:hs");
        assert_eq!(update.rows[2].event_id, "$3:hs");

        // Exactly one delivery: nothing else is queued.
        assert!(rx.try_recv().is_err());
        assert_eq!(client.position("events"), Some(StreamPosition(42)));
    }

    #[tokio::test]
    async fn bad_row_is_skipped_but_siblings_survive() {
        let addr = mock_server(&[
            r#"RDATA events batch {"room_id":"!r:hs","event_id":"$1:hs","type":"m.text"}"#,
            r#"RDATA events batch {"not_an_event_row":true}"#,
            r#"RDATA events 7 {"room_id":"!r:hs","event_id":"$2:hs","type":"m.text"}"#,
        ])
        .await;

        let client = ReplicationClient::new("test");
        let handle = client.bind_stream::<EventStreamRow>().unwrap();
        let mut rows_rx = handle.subscribe();
        let mut notice_rx = client.notices();

        client.connect(&addr.ip().to_string(), addr.port()).await.unwrap();

        let update = timeout(RECV_TIMEOUT, rows_rx.recv()).await.unwrap().unwrap();
        assert_eq!(update.rows.len(), 2);
        assert_eq!(update.position, StreamPosition(7));

        // The failure was surfaced, not silently dropped.
        let saw_decode_error = async {
            loop {
                match notice_rx.recv().await.unwrap() {
                    ReplicationNotice::DecodeError { stream, .. } => break stream,
                    _ => continue,
                }
            }
        };
        let stream = timeout(RECV_TIMEOUT, saw_decode_error).await.unwrap();
        assert_eq!(stream, "events");
    }

    #[tokio::test]
    async fn position_updates_flow_without_rows() {
        let addr = mock_server(&["POSITION events 50"]).await;

        let client = ReplicationClient::new("test");
        let handle = client.bind_stream::<EventStreamRow>().unwrap();
        let mut pos_rx = handle.subscribe_positions();

        client.connect(&addr.ip().to_string(), addr.port()).await.unwrap();

        let pos = timeout(RECV_TIMEOUT, pos_rx.recv()).await.unwrap().unwrap();
        assert_eq!(pos, StreamPosition(50));
    }

    #[tokio::test]
    async fn server_error_surfaces_as_notice() {
        let addr = mock_server(&["ERROR requested position no longer available"]).await;

        let client = ReplicationClient::new("test");
        let mut notice_rx = client.notices();
        client.connect(&addr.ip().to_string(), addr.port()).await.unwrap();

        let notice = loop {
            match timeout(RECV_TIMEOUT, notice_rx.recv()).await.unwrap().unwrap() {
                ReplicationNotice::Error { message } => break message,
                _ => continue,
            }
        };
        assert!(notice.contains("no longer available"));
    }

    #[tokio::test]
    async fn binding_the_same_stream_twice_is_an_error() {
        let client = ReplicationClient::new("test");
        client.bind_stream::<EventStreamRow>().unwrap();
        assert!(matches!(
            client.bind_stream::<EventStreamRow>(),
            Err(ReplicationError::StreamAlreadyBound("events"))
        ));
    }

    #[tokio::test]
    async fn sending_while_disconnected_is_an_error() {
        let client = ReplicationClient::new("test");
        let result = client.federation_ack(StreamPosition(1)).await;
        assert!(matches!(result, Err(ReplicationError::NotConnected)));
    }

    #[tokio::test]
    async fn identifies_and_subscribes_on_connect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut received = String::new();
            let mut buf = vec![0u8; 256];
            while !(received.contains("NAME") && received.contains("REPLICATE")) {
                let n = stream.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                received.push_str(&String::from_utf8_lossy(&buf[..n]));
            }
            received
        });

        let client = ReplicationClient::new("federation_sender");
        client.bind_stream::<EventStreamRow>().unwrap();
        client.connect(&addr.ip().to_string(), addr.port()).await.unwrap();

        let received = timeout(RECV_TIMEOUT, server).await.unwrap().unwrap();
        assert!(received.contains("NAME federation_sender"));
        assert!(received.contains("REPLICATE events NOW"));
    }
}

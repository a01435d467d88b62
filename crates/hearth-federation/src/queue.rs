//! Per-destination transaction queueing and delivery.
//!
//! The queue owns one pending transaction per destination and at most one
//! send loop per destination. Enqueue paths (replication rows, event-stream
//! positions, device hints) fold traffic into the pending transaction; the
//! send loop takes it, signs and sends it, and only commits device rows and
//! cursors after the remote acknowledged. A destination the circuit breaker
//! considers down parks its traffic until a later enqueue finds the breaker
//! closed again.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

use chrono::Utc;
use serde_json::{Map, Value, json};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use hearth_replication::streams::{FederationRow, PresenceEntry, ReceiptRow};
use hearth_store::{FederationStore, StoreError};

use crate::backoff::{Backoff, FailureClass, classify};
use crate::client::TransactionSender;
use crate::error::FederationError;
use crate::types::{Edu, Transaction, format_pdu};

/// Hard per-transaction limits from the federation transaction format.
const MAX_PDUS_PER_TXN: usize = 50;
const MAX_EDUS_PER_TXN: usize = 100;
/// Rows pulled per destination when draining the device outbox.
const DEVICE_PAGE: u32 = 100;
/// Ceiling for the per-transaction retry sleep.
const MAX_RETRY_SLEEP: Duration = Duration::from_secs(24 * 60 * 60);

/// Dedup key for a keyed EDU: `(edu_type, key parts)`.
type EduKey = (String, Vec<String>);

/// An EDU waiting in the pending transaction. Keyed entries are replaced in
/// place when a newer EDU with the same key arrives, keeping their slot.
struct QueuedEdu {
    key: Option<EduKey>,
    edu: Edu,
}

/// Traffic accumulated for one destination between sends.
#[derive(Default)]
struct PendingTransaction {
    pdus: Vec<Value>,
    edus: Vec<QueuedEdu>,
    keyed: HashMap<EduKey, usize>,
    /// Highest device-message stream id queued here; committed on success.
    device_message_up_to: Option<i64>,
    /// Highest device-list poke stream id queued here; committed on success.
    device_poke_up_to: Option<i64>,
}

impl PendingTransaction {
    fn push_pdu(&mut self, pdu: Value) {
        self.pdus.push(pdu);
    }

    fn push_edu(&mut self, edu: Edu) {
        self.edus.push(QueuedEdu { key: None, edu });
    }

    fn push_keyed_edu(&mut self, key: EduKey, edu: Edu) {
        if let Some(&slot) = self.keyed.get(&key) {
            self.edus[slot].edu = edu;
        } else {
            self.keyed.insert(key.clone(), self.edus.len());
            self.edus.push(QueuedEdu { key: Some(key), edu });
        }
    }

    /// Fold `newer` onto `self` (the older half). Newer keyed entries win;
    /// everything else appends in arrival order.
    fn merge_newer(mut self, newer: PendingTransaction) -> PendingTransaction {
        for pdu in newer.pdus {
            self.push_pdu(pdu);
        }
        for queued in newer.edus {
            match queued.key {
                Some(key) => self.push_keyed_edu(key, queued.edu),
                None => self.push_edu(queued.edu),
            }
        }
        self.device_message_up_to = self.device_message_up_to.max(newer.device_message_up_to);
        self.device_poke_up_to = self.device_poke_up_to.max(newer.device_poke_up_to);
        self
    }

    /// Split off everything beyond the per-transaction limits. The remainder
    /// (if any) is newer than what stays and goes back to the pending slot.
    fn split_excess(&mut self) -> Option<PendingTransaction> {
        if self.pdus.len() <= MAX_PDUS_PER_TXN && self.edus.len() <= MAX_EDUS_PER_TXN {
            return None;
        }
        let rest_pdus = if self.pdus.len() > MAX_PDUS_PER_TXN {
            self.pdus.split_off(MAX_PDUS_PER_TXN)
        } else {
            Vec::new()
        };
        let rest_edus = if self.edus.len() > MAX_EDUS_PER_TXN {
            self.edus.split_off(MAX_EDUS_PER_TXN)
        } else {
            Vec::new()
        };

        let mut rest = PendingTransaction {
            pdus: rest_pdus,
            edus: rest_edus,
            ..Default::default()
        };
        self.rebuild_keyed();
        rest.rebuild_keyed();

        // Device cursors may only be committed once every device EDU they
        // cover has been delivered.
        if !rest.edus.is_empty() {
            rest.device_message_up_to = self.device_message_up_to.take();
            rest.device_poke_up_to = self.device_poke_up_to.take();
        }
        Some(rest)
    }

    fn rebuild_keyed(&mut self) {
        self.keyed = self
            .edus
            .iter()
            .enumerate()
            .filter_map(|(slot, queued)| queued.key.clone().map(|key| (key, slot)))
            .collect();
    }
}

/// Per-destination bookkeeping shared by enqueue paths and the send loop.
#[derive(Default)]
struct DestinationState {
    pending: Option<PendingTransaction>,
    in_flight: bool,
    /// Set once the destination's device outbox has been drained at least
    /// once this process lifetime.
    primed: bool,
    device_msg_committed: i64,
    device_msg_queued: i64,
    poke_committed: i64,
    poke_queued: i64,
}

impl DestinationState {
    fn device_msg_cursor(&self) -> i64 {
        self.device_msg_committed.max(self.device_msg_queued)
    }

    fn poke_cursor(&self) -> i64 {
        self.poke_committed.max(self.poke_queued)
    }
}

struct QueueInner {
    origin: String,
    store: Arc<dyn FederationStore>,
    sender: Arc<dyn TransactionSender>,
    backoff: Backoff,
    destinations: Mutex<HashMap<String, DestinationState>>,
    next_txn_id: AtomicI64,
    event_pass_running: AtomicBool,
    last_event_position: AtomicI64,
    page_size: u32,
}

/// The outbound transaction queue. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct TransactionQueue {
    inner: Arc<QueueInner>,
}

impl TransactionQueue {
    pub fn new(
        origin: impl Into<String>,
        store: Arc<dyn FederationStore>,
        sender: Arc<dyn TransactionSender>,
        page_size: u32,
    ) -> Self {
        // Seeding from the wall clock keeps transaction ids unique across
        // process restarts without persisting a counter.
        let seed = Utc::now().timestamp();
        Self {
            inner: Arc::new(QueueInner {
                origin: origin.into(),
                store,
                sender,
                backoff: Backoff::new(),
                destinations: Mutex::new(HashMap::new()),
                next_txn_id: AtomicI64::new(seed),
                event_pass_running: AtomicBool::new(false),
                last_event_position: AtomicI64::new(0),
                page_size,
            }),
        }
    }

    /// Fold one federation-stream row into the per-destination queues.
    pub async fn on_federation_row(&self, row: FederationRow) -> Result<(), FederationError> {
        let mut touched: HashSet<String> = HashSet::new();
        {
            let mut states = self.inner.destinations.lock().await;
            for entry in &row.presence {
                let edu = Edu { edu_type: "m.presence".to_owned(), content: presence_content(entry) };
                let key = ("m.presence".to_owned(), vec![entry.user_id.clone()]);
                for destination in &entry.destinations {
                    if *destination == self.inner.origin {
                        continue;
                    }
                    let state = states.entry(destination.clone()).or_default();
                    state
                        .pending
                        .get_or_insert_with(Default::default)
                        .push_keyed_edu(key.clone(), edu.clone());
                    touched.insert(destination.clone());
                }
            }
            for keyed in row.keyed_edus {
                if keyed.destination == self.inner.origin {
                    continue;
                }
                let state = states.entry(keyed.destination.clone()).or_default();
                state.pending.get_or_insert_with(Default::default).push_keyed_edu(
                    (keyed.edu_type.clone(), keyed.key),
                    Edu { edu_type: keyed.edu_type, content: keyed.content },
                );
                touched.insert(keyed.destination);
            }
            for plain in row.edus {
                if plain.destination == self.inner.origin {
                    continue;
                }
                let state = states.entry(plain.destination.clone()).or_default();
                state
                    .pending
                    .get_or_insert_with(Default::default)
                    .push_edu(Edu { edu_type: plain.edu_type, content: plain.content });
                touched.insert(plain.destination);
            }
        }

        self.prime_new_destinations(&touched).await?;
        for destination in row.devices {
            if destination != self.inner.origin {
                self.send_device_messages(&destination).await?;
            }
        }
        for destination in &touched {
            self.kick(destination).await;
        }
        Ok(())
    }

    /// The event stream advanced. Runs (or extends) the event pass that pulls
    /// new events from the store and fans them out to joined destinations.
    pub async fn on_event_position_update(&self, position: i64) -> Result<(), FederationError> {
        self.inner.last_event_position.fetch_max(position, Ordering::SeqCst);
        loop {
            if self.inner.event_pass_running.swap(true, Ordering::SeqCst) {
                // Another pass is active; it re-checks the high-water mark
                // before finishing.
                return Ok(());
            }
            let result = self.run_event_pass().await;
            self.inner.event_pass_running.store(false, Ordering::SeqCst);
            result?;

            let processed = self.inner.store.federation_position("events").await?;
            if self.inner.last_event_position.load(Ordering::SeqCst) <= processed {
                return Ok(());
            }
        }
    }

    async fn run_event_pass(&self) -> Result<(), FederationError> {
        let store = &self.inner.store;
        let mut from = store.federation_position("events").await?;
        // (hosts, room version) per room for the duration of the pass.
        let mut room_cache: HashMap<String, Option<(Vec<String>, String)>> = HashMap::new();

        loop {
            let to = self.inner.last_event_position.load(Ordering::SeqCst);
            if to <= from {
                return Ok(());
            }
            let page = store.events_after(from, to, self.inner.page_size).await?;
            let full_page = page.len() as u32 >= self.inner.page_size;

            let mut assignments: Vec<(String, Value)> = Vec::new();
            for event in &page {
                // Only events this server originated are sent out from here.
                if event.sender_server() != Some(self.inner.origin.as_str()) {
                    continue;
                }
                if !room_cache.contains_key(&event.room_id) {
                    let resolved = match store.room_version(&event.room_id).await {
                        Ok(version) => {
                            let hosts = store.joined_hosts(&event.room_id).await?;
                            Some((hosts, version))
                        }
                        Err(StoreError::UnknownRoom(room)) => {
                            warn!(%room, "Skipping events for unknown room");
                            None
                        }
                        Err(err) => return Err(err.into()),
                    };
                    room_cache.insert(event.room_id.clone(), resolved);
                }
                let Some((hosts, version)) = &room_cache[&event.room_id] else {
                    continue;
                };
                let pdu = format_pdu(&event.json, version);
                for host in hosts {
                    if *host != self.inner.origin {
                        assignments.push((host.clone(), pdu.clone()));
                    }
                }
            }

            let mut touched: HashSet<String> = HashSet::new();
            {
                let mut states = self.inner.destinations.lock().await;
                for (destination, pdu) in assignments {
                    let state = states.entry(destination.clone()).or_default();
                    state.pending.get_or_insert_with(Default::default).push_pdu(pdu);
                    touched.insert(destination);
                }
            }

            // Position moves only once the whole page is queued, so a crash
            // here redelivers rather than drops.
            let new_from = if full_page {
                page.last().map(|event| event.stream_ordering).unwrap_or(to)
            } else {
                to
            };
            store.set_federation_position("events", new_from).await?;
            debug!(from, to = new_from, pdus = touched.len(), "Event pass page queued");

            self.prime_new_destinations(&touched).await?;
            for destination in &touched {
                self.kick(destination).await;
            }
            from = new_from;
        }
    }

    /// Drain the device outbox (to-device messages and device-list pokes) for
    /// one destination, above its current cursor. Keeps paging until both
    /// queries come back short, so a backlog larger than one page drains in
    /// a single call.
    pub async fn send_device_messages(&self, destination: &str) -> Result<(), FederationError> {
        loop {
            // Snapshot the cursors, then query with the map unlocked so a
            // slow store round trip for one destination never stalls the
            // others.
            let (msg_after, poke_after) = {
                let mut states = self.inner.destinations.lock().await;
                let state = states.entry(destination.to_owned()).or_default();
                state.primed = true;
                (state.device_msg_cursor(), state.poke_cursor())
            };

            let messages =
                self.inner.store.device_messages_for(destination, msg_after, DEVICE_PAGE).await?;
            let pokes = self
                .inner
                .store
                .device_list_pokes_for(destination, poke_after, DEVICE_PAGE)
                .await?;
            if messages.is_empty() && pokes.is_empty() {
                return Ok(());
            }
            let full_page =
                messages.len() as u32 >= DEVICE_PAGE || pokes.len() as u32 >= DEVICE_PAGE;

            {
                let mut states = self.inner.destinations.lock().await;
                let state = states.entry(destination.to_owned()).or_default();
                // A concurrent drain moved the cursors while we queried; it
                // owns these rows now and queueing them again would send
                // duplicates.
                if state.device_msg_cursor() != msg_after || state.poke_cursor() != poke_after {
                    return Ok(());
                }
                let pending = state.pending.get_or_insert_with(Default::default);
                for message in &messages {
                    pending.push_edu(Edu {
                        edu_type: "m.direct_to_device".to_owned(),
                        content: json!({
                            "sender": message.sender.clone(),
                            "type": message.message_type.clone(),
                            "message_id": message.message_id.clone(),
                            "messages": message.messages.clone(),
                        }),
                    });
                }
                for poke in &pokes {
                    pending.push_edu(Edu {
                        edu_type: "m.device_list_update".to_owned(),
                        content: json!({
                            "user_id": poke.user_id.clone(),
                            "device_id": poke.device_id.clone(),
                            "stream_id": poke.stream_id,
                        }),
                    });
                }
                if let Some(last) = messages.last() {
                    pending.device_message_up_to =
                        pending.device_message_up_to.max(Some(last.stream_id));
                    state.device_msg_queued = state.device_msg_queued.max(last.stream_id);
                }
                if let Some(last) = pokes.last() {
                    pending.device_poke_up_to =
                        pending.device_poke_up_to.max(Some(last.stream_id));
                    state.poke_queued = state.poke_queued.max(last.stream_id);
                }
            }

            self.kick(destination).await;
            if !full_page {
                return Ok(());
            }
        }
    }

    /// Fold a local read receipt into the queues of every joined remote.
    /// Keyed per room, so only the latest receipt per room is in flight.
    pub async fn on_receipt(&self, row: ReceiptRow) -> Result<(), FederationError> {
        let hosts = match self.inner.store.joined_hosts(&row.room_id).await {
            Ok(hosts) => hosts,
            Err(StoreError::UnknownRoom(room)) => {
                warn!(%room, "Dropping receipt for unknown room");
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };

        let edu = Edu { edu_type: "m.receipt".to_owned(), content: receipt_content(&row) };
        let key = ("m.receipt".to_owned(), vec![row.room_id.clone()]);

        let mut touched: HashSet<String> = HashSet::new();
        {
            let mut states = self.inner.destinations.lock().await;
            for host in hosts {
                if host == self.inner.origin {
                    continue;
                }
                let state = states.entry(host.clone()).or_default();
                state
                    .pending
                    .get_or_insert_with(Default::default)
                    .push_keyed_edu(key.clone(), edu.clone());
                touched.insert(host);
            }
        }

        self.prime_new_destinations(&touched).await?;
        for destination in &touched {
            self.kick(destination).await;
        }
        Ok(())
    }

    /// Drain the device outbox once for destinations seen for the first time
    /// this process lifetime, so traffic queued while we were offline flows
    /// without waiting for a fresh stream hint.
    async fn prime_new_destinations(
        &self,
        destinations: &HashSet<String>,
    ) -> Result<(), FederationError> {
        let mut fresh = Vec::new();
        {
            let mut states = self.inner.destinations.lock().await;
            for destination in destinations {
                let state = states.entry(destination.clone()).or_default();
                if !state.primed {
                    state.primed = true;
                    fresh.push(destination.clone());
                }
            }
        }
        for destination in fresh {
            self.send_device_messages(&destination).await?;
        }
        Ok(())
    }

    /// Start a send loop for the destination if it has pending traffic, no
    /// loop running, and an open circuit.
    async fn kick(&self, destination: &str) {
        let mut states = self.inner.destinations.lock().await;
        let Some(state) = states.get_mut(destination) else {
            return;
        };
        if state.in_flight || self.inner.backoff.is_down(destination) {
            return;
        }
        let Some(held) = state.pending.take() else {
            return;
        };
        state.in_flight = true;
        drop(states);

        let queue = self.clone();
        let destination = destination.to_owned();
        // One task owns the destination until its pending slot runs dry;
        // chaining through `take_next` keeps the future non-recursive.
        tokio::spawn(async move {
            let mut held = held;
            loop {
                queue.send_loop(&destination, held).await;
                match queue.take_next(&destination).await {
                    Some(next) => held = next,
                    None => break,
                }
            }
        });
    }

    async fn send_loop(&self, destination: &str, mut held: PendingTransaction) {
        if let Some(rest) = held.split_excess() {
            self.merge_into_pending(destination, rest).await;
        }
        let txn = self.build_transaction(destination, &held);
        let mut sleep_for: Option<Duration> = None;

        loop {
            if self.inner.backoff.is_down(destination) {
                debug!(%destination, "Destination down; parking transaction");
                self.merge_into_pending(destination, held).await;
                break;
            }

            match self.inner.sender.send_transaction(&txn).await {
                Ok(()) => {
                    debug!(
                        %destination,
                        txn_id = %txn.transaction_id,
                        pdus = txn.pdus.len(),
                        edus = txn.edus.len(),
                        "Transaction delivered"
                    );
                    self.commit(destination, &held).await;
                    self.inner.backoff.record_success(destination);
                    break;
                }
                Err(err) => {
                    warn!(%destination, txn_id = %txn.transaction_id, %err, "Transaction failed");
                    if self.inner.backoff.mark_if_down(destination, &err) {
                        self.merge_into_pending(destination, held).await;
                        break;
                    }
                    match classify(&err) {
                        FailureClass::Unresendable => {
                            info!(
                                %destination,
                                txn_id = %txn.transaction_id,
                                "Dropping unresendable transaction"
                            );
                            self.drop_device_markers(destination, &held).await;
                            break;
                        }
                        _ => {
                            let base = self.inner.backoff.backoff_for_error(destination, &err);
                            let delay = match sleep_for {
                                None => base,
                                Some(previous) => (previous * 2).min(MAX_RETRY_SLEEP).max(base),
                            };
                            sleep_for = Some(delay);
                            debug!(%destination, delay_secs = delay.as_secs(), "Retrying after delay");
                            tokio::time::sleep(delay).await;
                        }
                    }
                }
            }
        }
    }

    fn build_transaction(&self, destination: &str, held: &PendingTransaction) -> Transaction {
        let id = self.inner.next_txn_id.fetch_add(1, Ordering::SeqCst);
        Transaction {
            transaction_id: id.to_string(),
            origin: self.inner.origin.clone(),
            destination: destination.to_owned(),
            origin_server_ts: Utc::now().timestamp_millis(),
            pdus: held.pdus.clone(),
            edus: held.edus.iter().map(|queued| queued.edu.clone()).collect(),
        }
    }

    /// Put a held transaction back into the pending slot; anything that
    /// arrived meanwhile is newer and its keyed entries win.
    async fn merge_into_pending(&self, destination: &str, held: PendingTransaction) {
        let mut states = self.inner.destinations.lock().await;
        let state = states.entry(destination.to_owned()).or_default();
        state.pending = Some(match state.pending.take() {
            Some(newer) => held.merge_newer(newer),
            None => held,
        });
    }

    /// Post-acknowledgement commit: clear delivered device rows and advance
    /// the committed cursors.
    async fn commit(&self, destination: &str, held: &PendingTransaction) {
        if let Some(up_to) = held.device_message_up_to {
            if let Err(err) = self.inner.store.delete_device_messages(destination, up_to).await {
                warn!(%destination, %err, "Failed to clear delivered device messages");
            }
        }
        if let Some(up_to) = held.device_poke_up_to {
            if let Err(err) =
                self.inner.store.mark_device_list_pokes_sent(destination, up_to).await
            {
                warn!(%destination, %err, "Failed to mark device-list pokes sent");
            }
        }
        let mut states = self.inner.destinations.lock().await;
        if let Some(state) = states.get_mut(destination) {
            if let Some(up_to) = held.device_message_up_to {
                state.device_msg_committed = state.device_msg_committed.max(up_to);
            }
            if let Some(up_to) = held.device_poke_up_to {
                state.poke_committed = state.poke_committed.max(up_to);
            }
        }
    }

    /// A transaction was dropped without delivery: rewind the queued device
    /// cursors so its rows are pulled again next time.
    async fn drop_device_markers(&self, destination: &str, held: &PendingTransaction) {
        let mut states = self.inner.destinations.lock().await;
        if let Some(state) = states.get_mut(destination) {
            if held.device_message_up_to.is_some() {
                state.device_msg_queued = state.device_msg_committed;
            }
            if held.device_poke_up_to.is_some() {
                state.poke_queued = state.poke_committed;
            }
        }
    }

    /// Send loop exit: hand the owning task its next transaction if traffic
    /// accumulated meanwhile, or clear the in-flight flag and release the
    /// destination.
    async fn take_next(&self, destination: &str) -> Option<PendingTransaction> {
        let mut states = self.inner.destinations.lock().await;
        let state = states.get_mut(destination)?;
        if !self.inner.backoff.is_down(destination) {
            if let Some(next) = state.pending.take() {
                return Some(next);
            }
        }
        state.in_flight = false;
        None
    }
}

fn presence_content(entry: &PresenceEntry) -> Value {
    let mut push = Map::new();
    push.insert("user_id".to_owned(), Value::String(entry.user_id.clone()));
    push.insert("presence".to_owned(), Value::String(entry.presence.clone()));
    if let Some(msg) = &entry.status_msg {
        push.insert("status_msg".to_owned(), Value::String(msg.clone()));
    }
    json!({ "push": [Value::Object(push)] })
}

fn receipt_content(row: &ReceiptRow) -> Value {
    let mut per_user = Map::new();
    per_user.insert(
        row.user_id.clone(),
        json!({ "event_ids": [row.event_id.clone()], "data": row.data.clone() }),
    );
    let mut per_type = Map::new();
    per_type.insert(row.receipt_type.clone(), Value::Object(per_user));
    let mut per_room = Map::new();
    per_room.insert(row.room_id.clone(), Value::Object(per_type));
    Value::Object(per_room)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SendError;
    use hearth_replication::streams::{KeyedEdu, PlainEdu};
    use hearth_store::types::{DeviceListPokeRow, DeviceMessageRow, EventRow};
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct MockStore {
        positions: StdMutex<HashMap<String, i64>>,
        events: StdMutex<Vec<EventRow>>,
        hosts: HashMap<String, Vec<String>>,
        versions: HashMap<String, String>,
        device_messages: StdMutex<Vec<(String, DeviceMessageRow)>>,
        pokes: StdMutex<Vec<(String, DeviceListPokeRow, bool)>>,
        /// Simulated round-trip time for the device outbox queries.
        query_delay: Option<Duration>,
    }

    #[async_trait::async_trait]
    impl FederationStore for MockStore {
        async fn federation_position(&self, kind: &str) -> Result<i64, StoreError> {
            Ok(*self.positions.lock().unwrap().get(kind).unwrap_or(&0))
        }

        async fn set_federation_position(
            &self,
            kind: &str,
            position: i64,
        ) -> Result<(), StoreError> {
            self.positions.lock().unwrap().insert(kind.to_owned(), position);
            Ok(())
        }

        async fn events_after(
            &self,
            from: i64,
            to: i64,
            limit: u32,
        ) -> Result<Vec<EventRow>, StoreError> {
            let mut rows: Vec<EventRow> = self
                .events
                .lock()
                .unwrap()
                .iter()
                .filter(|e| e.stream_ordering > from && e.stream_ordering <= to)
                .cloned()
                .collect();
            rows.sort_by_key(|e| e.stream_ordering);
            rows.truncate(limit as usize);
            Ok(rows)
        }

        async fn joined_hosts(&self, room_id: &str) -> Result<Vec<String>, StoreError> {
            Ok(self.hosts.get(room_id).cloned().unwrap_or_default())
        }

        async fn room_version(&self, room_id: &str) -> Result<String, StoreError> {
            self.versions
                .get(room_id)
                .cloned()
                .ok_or_else(|| StoreError::UnknownRoom(room_id.to_owned()))
        }

        async fn device_messages_for(
            &self,
            destination: &str,
            after: i64,
            limit: u32,
        ) -> Result<Vec<DeviceMessageRow>, StoreError> {
            if let Some(delay) = self.query_delay {
                tokio::time::sleep(delay).await;
            }
            let mut rows: Vec<DeviceMessageRow> = self
                .device_messages
                .lock()
                .unwrap()
                .iter()
                .filter(|(dest, row)| dest == destination && row.stream_id > after)
                .map(|(_, row)| row.clone())
                .collect();
            rows.sort_by_key(|row| row.stream_id);
            rows.truncate(limit as usize);
            Ok(rows)
        }

        async fn delete_device_messages(
            &self,
            destination: &str,
            up_to: i64,
        ) -> Result<(), StoreError> {
            self.device_messages
                .lock()
                .unwrap()
                .retain(|(dest, row)| !(dest == destination && row.stream_id <= up_to));
            Ok(())
        }

        async fn device_list_pokes_for(
            &self,
            destination: &str,
            after: i64,
            limit: u32,
        ) -> Result<Vec<DeviceListPokeRow>, StoreError> {
            if let Some(delay) = self.query_delay {
                tokio::time::sleep(delay).await;
            }
            let mut rows: Vec<DeviceListPokeRow> = self
                .pokes
                .lock()
                .unwrap()
                .iter()
                .filter(|(dest, row, sent)| dest == destination && row.stream_id > after && !sent)
                .map(|(_, row, _)| row.clone())
                .collect();
            rows.sort_by_key(|row| row.stream_id);
            rows.truncate(limit as usize);
            Ok(rows)
        }

        async fn mark_device_list_pokes_sent(
            &self,
            destination: &str,
            up_to: i64,
        ) -> Result<(), StoreError> {
            for (dest, row, sent) in self.pokes.lock().unwrap().iter_mut() {
                if dest == destination && row.stream_id <= up_to {
                    *sent = true;
                }
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct MockSender {
        sent: StdMutex<Vec<Transaction>>,
        failures: StdMutex<VecDeque<SendError>>,
    }

    impl MockSender {
        fn fail_next(&self, err: SendError) {
            self.failures.lock().unwrap().push_back(err);
        }

        fn transactions(&self) -> Vec<Transaction> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl TransactionSender for MockSender {
        async fn send_transaction(&self, txn: &Transaction) -> Result<(), SendError> {
            self.sent.lock().unwrap().push(txn.clone());
            match self.failures.lock().unwrap().pop_front() {
                Some(err) => Err(err),
                None => Ok(()),
            }
        }
    }

    const ORIGIN: &str = "hearth.example";
    const REMOTE: &str = "remote.example";

    fn queue_with(store: Arc<MockStore>, sender: Arc<MockSender>, page_size: u32) -> TransactionQueue {
        TransactionQueue::new(ORIGIN, store, sender, page_size)
    }

    fn presence(user: &str, state: &str) -> PresenceEntry {
        PresenceEntry {
            destinations: vec![REMOTE.to_owned()],
            user_id: user.to_owned(),
            presence: state.to_owned(),
            status_msg: None,
        }
    }

    fn plain_edu_row(content: Value) -> FederationRow {
        FederationRow {
            presence: vec![],
            keyed_edus: vec![],
            edus: vec![PlainEdu {
                destination: REMOTE.to_owned(),
                edu_type: "m.signing_key_update".to_owned(),
                content,
            }],
            devices: vec![],
        }
    }

    fn http_error(status: u16, message: &str) -> SendError {
        SendError::Http {
            status,
            errcode: "M_UNKNOWN".to_owned(),
            message: message.to_owned(),
            retry_after_ms: None,
        }
    }

    fn event(ordering: i64, sender: &str, room: &str) -> EventRow {
        EventRow {
            stream_ordering: ordering,
            event_id: format!("$e{ordering}:{ORIGIN}"),
            room_id: room.to_owned(),
            event_type: "m.room.message".to_owned(),
            sender: sender.to_owned(),
            json: json!({
                "event_id": format!("$e{ordering}:{ORIGIN}"),
                "type": "m.room.message",
                "sender": sender,
                "room_id": room,
                "content": {"body": format!("msg {ordering}")},
            }),
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn presence_updates_collapse_to_latest() {
        let store = Arc::new(MockStore::default());
        let sender = Arc::new(MockSender::default());
        let queue = queue_with(store, sender.clone(), 100);

        let row = FederationRow {
            presence: vec![presence("@alice:hearth.example", "online"),
                           presence("@alice:hearth.example", "offline")],
            keyed_edus: vec![],
            edus: vec![],
            devices: vec![],
        };
        queue.on_federation_row(row).await.unwrap();
        settle().await;

        let sent = sender.transactions();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].destination, REMOTE);
        assert_eq!(sent[0].edus.len(), 1);
        assert_eq!(sent[0].edus[0].edu_type, "m.presence");
        assert_eq!(sent[0].edus[0].content["push"][0]["presence"], "offline");
    }

    #[tokio::test(start_paused = true)]
    async fn retries_same_transaction_before_newer_traffic() {
        let store = Arc::new(MockStore::default());
        let sender = Arc::new(MockSender::default());
        sender.fail_next(http_error(500, "internal"));
        let queue = queue_with(store, sender.clone(), 100);

        queue.on_federation_row(plain_edu_row(json!({"tag": "first"}))).await.unwrap();
        settle().await;
        assert_eq!(sender.transactions().len(), 1, "first attempt should have failed");

        // Arrives while the first transaction is waiting out its retry delay.
        queue.on_federation_row(plain_edu_row(json!({"tag": "second"}))).await.unwrap();
        tokio::time::sleep(Duration::from_secs(120)).await;

        let sent = sender.transactions();
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[0].transaction_id, sent[1].transaction_id);
        assert_eq!(sent[1].edus.len(), 1);
        assert_eq!(sent[1].edus[0].content["tag"], "first");
        assert_ne!(sent[2].transaction_id, sent[0].transaction_id);
        assert_eq!(sent[2].edus[0].content["tag"], "second");
    }

    #[tokio::test(start_paused = true)]
    async fn down_destination_parks_and_merges() {
        let store = Arc::new(MockStore::default());
        let sender = Arc::new(MockSender::default());
        sender.fail_next(SendError::ConnectionRefused(REMOTE.to_owned()));
        let queue = queue_with(store, sender.clone(), 100);

        let typing = |active: bool| FederationRow {
            presence: vec![],
            keyed_edus: vec![KeyedEdu {
                destination: REMOTE.to_owned(),
                edu_type: "m.typing".to_owned(),
                key: vec!["!room:hearth.example".to_owned()],
                content: json!({"room_id": "!room:hearth.example", "typing": active}),
            }],
            edus: vec![],
            devices: vec![],
        };

        queue.on_federation_row(typing(true)).await.unwrap();
        settle().await;
        assert_eq!(sender.transactions().len(), 1, "connection-level failure expected");

        // Circuit is open: nothing moves.
        queue.on_federation_row(typing(false)).await.unwrap();
        settle().await;
        assert_eq!(sender.transactions().len(), 1);

        // Past the first down window a fresh enqueue releases the merged
        // backlog; the newer keyed value won.
        tokio::time::advance(Duration::from_secs(16 * 60)).await;
        queue.on_federation_row(plain_edu_row(json!({"tag": "later"}))).await.unwrap();
        settle().await;

        let sent = sender.transactions();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].edus.len(), 2);
        assert_eq!(sent[1].edus[0].edu_type, "m.typing");
        assert_eq!(sent[1].edus[0].content["typing"], false);
        assert_eq!(sent[1].edus[1].content["tag"], "later");
    }

    #[tokio::test(start_paused = true)]
    async fn event_pass_fans_out_local_events_only() {
        let store = Arc::new(MockStore {
            hosts: HashMap::from([(
                "!room:hearth.example".to_owned(),
                vec![ORIGIN.to_owned(), REMOTE.to_owned(), "other.example".to_owned()],
            )]),
            versions: HashMap::from([("!room:hearth.example".to_owned(), "6".to_owned())]),
            ..Default::default()
        });
        *store.events.lock().unwrap() = vec![
            event(1, "@alice:hearth.example", "!room:hearth.example"),
            event(2, "@bob:remote.example", "!room:hearth.example"),
        ];
        let sender = Arc::new(MockSender::default());
        let queue = queue_with(store.clone(), sender.clone(), 100);

        queue.on_event_position_update(2).await.unwrap();
        settle().await;

        let sent = sender.transactions();
        let destinations: HashSet<String> =
            sent.iter().map(|txn| txn.destination.clone()).collect();
        assert_eq!(
            destinations,
            HashSet::from([REMOTE.to_owned(), "other.example".to_owned()])
        );
        for txn in &sent {
            assert_eq!(txn.pdus.len(), 1, "remote-origin event must be skipped");
            assert!(txn.pdus[0].get("event_id").is_none(), "v6 pdus carry no event_id");
        }
        assert_eq!(*store.positions.lock().unwrap().get("events").unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn event_pass_pages_in_stream_order() {
        let store = Arc::new(MockStore {
            hosts: HashMap::from([(
                "!room:hearth.example".to_owned(),
                vec![ORIGIN.to_owned(), REMOTE.to_owned()],
            )]),
            versions: HashMap::from([("!room:hearth.example".to_owned(), "6".to_owned())]),
            ..Default::default()
        });
        *store.events.lock().unwrap() = vec![
            event(1, "@alice:hearth.example", "!room:hearth.example"),
            event(2, "@alice:hearth.example", "!room:hearth.example"),
        ];
        let sender = Arc::new(MockSender::default());
        let queue = queue_with(store.clone(), sender.clone(), 1);

        queue.on_event_position_update(2).await.unwrap();
        settle().await;

        let sent = sender.transactions();
        let pdus: Vec<&Value> = sent.iter().flat_map(|txn| txn.pdus.iter()).collect();
        assert_eq!(pdus.len(), 2);
        assert_eq!(pdus[0]["content"]["body"], "msg 1");
        assert_eq!(pdus[1]["content"]["body"], "msg 2");
        assert_eq!(*store.positions.lock().unwrap().get("events").unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn device_rows_are_committed_after_acknowledgement() {
        let store = Arc::new(MockStore::default());
        *store.device_messages.lock().unwrap() = vec![
            (
                REMOTE.to_owned(),
                DeviceMessageRow {
                    stream_id: 1,
                    sender: "@alice:hearth.example".to_owned(),
                    message_type: "m.room_key_request".to_owned(),
                    message_id: "m1".to_owned(),
                    messages: json!({"@bob:remote.example": {"DEVICE": {}}}),
                },
            ),
            (
                REMOTE.to_owned(),
                DeviceMessageRow {
                    stream_id: 2,
                    sender: "@alice:hearth.example".to_owned(),
                    message_type: "m.room_key_request".to_owned(),
                    message_id: "m2".to_owned(),
                    messages: json!({"@bob:remote.example": {"DEVICE": {}}}),
                },
            ),
        ];
        *store.pokes.lock().unwrap() = vec![(
            REMOTE.to_owned(),
            DeviceListPokeRow {
                stream_id: 1,
                user_id: "@alice:hearth.example".to_owned(),
                device_id: "DEVICE".to_owned(),
            },
            false,
        )];
        let sender = Arc::new(MockSender::default());
        let queue = queue_with(store.clone(), sender.clone(), 100);

        queue.send_device_messages(REMOTE).await.unwrap();
        settle().await;

        let sent = sender.transactions();
        assert_eq!(sent.len(), 1);
        let types: Vec<&str> = sent[0].edus.iter().map(|e| e.edu_type.as_str()).collect();
        assert_eq!(
            types,
            vec!["m.direct_to_device", "m.direct_to_device", "m.device_list_update"]
        );
        assert!(store.device_messages.lock().unwrap().is_empty(), "outbox rows deleted");
        assert!(store.pokes.lock().unwrap().iter().all(|(_, _, sent)| *sent));

        // Nothing above the cursor: no further transaction.
        queue.send_device_messages(REMOTE).await.unwrap();
        settle().await;
        assert_eq!(sender.transactions().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unresendable_transaction_is_dropped() {
        let store = Arc::new(MockStore::default());
        let sender = Arc::new(MockSender::default());
        sender.fail_next(http_error(401, "unauthorized"));
        let queue = queue_with(store, sender.clone(), 100);

        queue.on_federation_row(plain_edu_row(json!({"tag": "doomed"}))).await.unwrap();
        settle().await;
        assert_eq!(sender.transactions().len(), 1);

        queue.on_federation_row(plain_edu_row(json!({"tag": "fresh"}))).await.unwrap();
        settle().await;

        let sent = sender.transactions();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].edus.len(), 1, "dropped traffic must not reappear");
        assert_eq!(sent[1].edus[0].content["tag"], "fresh");
    }

    #[tokio::test(start_paused = true)]
    async fn first_contact_drains_the_device_outbox() {
        let store = Arc::new(MockStore::default());
        *store.device_messages.lock().unwrap() = vec![(
            REMOTE.to_owned(),
            DeviceMessageRow {
                stream_id: 7,
                sender: "@alice:hearth.example".to_owned(),
                message_type: "m.room_key_request".to_owned(),
                message_id: "m7".to_owned(),
                messages: json!({}),
            },
        )];
        let sender = Arc::new(MockSender::default());
        let queue = queue_with(store, sender.clone(), 100);

        queue.on_federation_row(plain_edu_row(json!({"tag": "hello"}))).await.unwrap();
        settle().await;

        let sent = sender.transactions();
        assert_eq!(sent.len(), 1);
        let types: HashSet<&str> = sent[0].edus.iter().map(|e| e.edu_type.as_str()).collect();
        assert!(types.contains("m.signing_key_update"));
        assert!(types.contains("m.direct_to_device"), "backlog drained on first contact");
    }

    #[tokio::test(start_paused = true)]
    async fn large_device_backlogs_drain_fully() {
        let store = Arc::new(MockStore::default());
        *store.device_messages.lock().unwrap() = (1..=150)
            .map(|i| {
                (
                    REMOTE.to_owned(),
                    DeviceMessageRow {
                        stream_id: i,
                        sender: "@alice:hearth.example".to_owned(),
                        message_type: "m.room_key_request".to_owned(),
                        message_id: format!("m{i}"),
                        messages: json!({}),
                    },
                )
            })
            .collect();
        let sender = Arc::new(MockSender::default());
        let queue = queue_with(store.clone(), sender.clone(), 100);

        queue.send_device_messages(REMOTE).await.unwrap();
        tokio::time::sleep(Duration::from_secs(60)).await;

        let sent = sender.transactions();
        let delivered: usize = sent.iter().map(|txn| txn.edus.len()).sum();
        assert_eq!(delivered, 150, "every outbox row must go out");
        assert!(sent.len() >= 2, "150 rows cannot fit a single transaction");
        assert!(store.device_messages.lock().unwrap().is_empty(), "outbox fully cleared");
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_drains_do_not_duplicate_device_traffic() {
        let store = Arc::new(MockStore {
            query_delay: Some(Duration::from_millis(10)),
            ..Default::default()
        });
        *store.device_messages.lock().unwrap() = (1..=3)
            .map(|i| {
                (
                    REMOTE.to_owned(),
                    DeviceMessageRow {
                        stream_id: i,
                        sender: "@alice:hearth.example".to_owned(),
                        message_type: "m.room_key_request".to_owned(),
                        message_id: format!("m{i}"),
                        messages: json!({}),
                    },
                )
            })
            .collect();
        let sender = Arc::new(MockSender::default());
        let queue = queue_with(store.clone(), sender.clone(), 100);

        // Both drains snapshot the same cursor; whichever re-acquires the
        // state first queues the rows, the other must notice and back off.
        let (a, b) = tokio::join!(
            queue.send_device_messages(REMOTE),
            queue.send_device_messages(REMOTE),
        );
        a.unwrap();
        b.unwrap();
        settle().await;

        let sent = sender.transactions();
        let delivered: usize = sent.iter().map(|txn| txn.edus.len()).sum();
        assert_eq!(delivered, 3, "each outbox row delivered exactly once");
        assert!(store.device_messages.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn receipts_queued_behind_a_busy_destination_collapse_per_room() {
        let store = Arc::new(MockStore {
            hosts: HashMap::from([(
                "!room:hearth.example".to_owned(),
                vec![ORIGIN.to_owned(), REMOTE.to_owned()],
            )]),
            ..Default::default()
        });
        let sender = Arc::new(MockSender::default());
        sender.fail_next(http_error(500, "internal"));
        let queue = queue_with(store, sender.clone(), 100);

        // Occupy the send loop so the receipts pile up in the pending slot.
        queue.on_federation_row(plain_edu_row(json!({"tag": "busy"}))).await.unwrap();
        settle().await;
        assert_eq!(sender.transactions().len(), 1);

        let receipt = |event_id: &str| ReceiptRow {
            room_id: "!room:hearth.example".to_owned(),
            receipt_type: "m.read".to_owned(),
            user_id: "@alice:hearth.example".to_owned(),
            event_id: event_id.to_owned(),
            data: json!({"ts": 1}),
        };
        queue.on_receipt(receipt("$one")).await.unwrap();
        queue.on_receipt(receipt("$two")).await.unwrap();
        tokio::time::sleep(Duration::from_secs(120)).await;

        let sent = sender.transactions();
        assert_eq!(sent.len(), 3, "retry, then one transaction for both receipts");
        assert_eq!(sent[2].edus.len(), 1);
        assert_eq!(sent[2].edus[0].edu_type, "m.receipt");
        let content = &sent[2].edus[0].content;
        assert_eq!(
            content["!room:hearth.example"]["m.read"]["@alice:hearth.example"]["event_ids"][0],
            "$two"
        );
    }

    #[test]
    fn oversized_pending_transactions_split_in_order() {
        let mut pending = PendingTransaction::default();
        for i in 0..60 {
            pending.push_pdu(json!({"n": i}));
        }
        let rest = pending.split_excess().expect("should overflow");
        assert_eq!(pending.pdus.len(), 50);
        assert_eq!(rest.pdus.len(), 10);
        assert_eq!(pending.pdus[49]["n"], 49);
        assert_eq!(rest.pdus[0]["n"], 50);
    }
}

//! Per-destination failure classification and circuit breaking.
//!
//! Two separate delays live here, per destination:
//!
//! - the **circuit delay**: once a destination is marked down, no new send
//!   loop starts for it until the delay elapses (checked lazily on query,
//!   no timers);
//! - the **accumulated retry delay**: how long the current transaction's
//!   send loop sleeps before its next local attempt.
//!
//! The state machine per destination is `Healthy → Strike(n) → Down`, with
//! `Down` timing out back toward `Healthy` once its deadline passes. Any
//! successful delivery clears the record entirely.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use rand::Rng as _;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::SendError;

/// Consecutive soft failures before a destination is marked down.
const SOFT_STRIKE_LIMIT: u32 = 5;
/// Circuit delay on the first down-marking, before jitter.
const DOWN_DELAY_BASE: Duration = Duration::from_secs(14 * 60);
/// Random spread added to the first circuit delay.
const DOWN_DELAY_JITTER: Duration = Duration::from_secs(60);
/// Ceiling for the circuit delay.
const DOWN_DELAY_MAX: Duration = Duration::from_secs(24 * 60 * 60);
/// Base step for the accumulated per-transaction retry delay.
const RETRY_DELAY_BASE: Duration = Duration::from_secs(30);
/// Ceiling for the accumulated retry delay.
const RETRY_DELAY_MAX: Duration = Duration::from_secs(24 * 60 * 60);
/// Fixed margin added on top of a remote's explicit retry hint.
const RATE_LIMIT_MARGIN: Duration = Duration::from_secs(5);

/// What a failed attempt means for the destination and the transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// The destination is unreachable or structurally broken: mark it down
    /// immediately and stop retrying the current transaction locally.
    ConnectionLevel,
    /// A gateway-style failure (502/503): one strike; down after
    /// [`SOFT_STRIKE_LIMIT`] in a row.
    Soft,
    /// The remote asked us to slow down, possibly with an explicit hint.
    RateLimited { retry_after_ms: Option<u64> },
    /// This transaction can never be delivered (401 with an error body):
    /// drop it rather than loop.
    Unresendable,
    /// Anything else: retry the transaction with growing delay.
    Transient,
}

/// Map a send failure to its [`FailureClass`].
///
/// Pure so the whole taxonomy is unit-testable without constructing
/// transport-level failures.
pub fn classify(err: &SendError) -> FailureClass {
    match err {
        SendError::ConnectionRefused(_)
        | SendError::Timeout(_)
        | SendError::InvalidDestination(_)
        | SendError::MalformedResponse { .. }
        | SendError::FederationDenied(_) => FailureClass::ConnectionLevel,

        // A local serialisation failure: the destination is fine, but this
        // transaction can never be encoded, so drop it.
        SendError::Encode { .. } => FailureClass::Unresendable,

        SendError::Http { status: 404 | 405, .. } => FailureClass::ConnectionLevel,
        SendError::Http { status: 502 | 503, .. } => FailureClass::Soft,
        SendError::Http { status: 429, retry_after_ms, .. } => {
            FailureClass::RateLimited { retry_after_ms: *retry_after_ms }
        }
        SendError::Http { status: 401, message, .. } if !message.is_empty() => {
            FailureClass::Unresendable
        }
        SendError::Http { .. } => FailureClass::Transient,
    }
}

#[derive(Debug)]
struct HostBackoff {
    down: bool,
    strikes: u32,
    circuit_delay: Duration,
    retry_delay: Duration,
    last_update: Instant,
}

impl HostBackoff {
    fn new() -> Self {
        Self {
            down: false,
            strikes: 0,
            circuit_delay: Duration::ZERO,
            retry_delay: Duration::ZERO,
            last_update: Instant::now(),
        }
    }

    fn mark_down(&mut self) {
        self.circuit_delay = if self.down && !self.circuit_delay.is_zero() {
            // Repeated down outcome: double, up to the ceiling.
            (self.circuit_delay * 2).min(DOWN_DELAY_MAX)
        } else {
            let jitter = rand::rng().random_range(0..=DOWN_DELAY_JITTER.as_secs());
            DOWN_DELAY_BASE + Duration::from_secs(jitter)
        };
        self.down = true;
        self.strikes = 0;
        self.last_update = Instant::now();
    }
}

/// Per-destination backoff state. Shared across the transaction queue's
/// enqueue paths and send loops.
#[derive(Default)]
pub struct Backoff {
    hosts: Mutex<HashMap<String, HostBackoff>>,
}

impl Backoff {
    pub fn new() -> Self {
        Self::default()
    }

    /// True only if the destination is marked down and its circuit delay has
    /// not yet elapsed. Never mutates state.
    pub fn is_down(&self, destination: &str) -> bool {
        let hosts = self.hosts.lock().expect("backoff lock poisoned");
        match hosts.get(destination) {
            Some(host) => host.down && host.last_update.elapsed() < host.circuit_delay,
            None => false,
        }
    }

    /// Record a failed attempt and decide whether the destination is now
    /// considered down.
    pub fn mark_if_down(&self, destination: &str, err: &SendError) -> bool {
        let mut hosts = self.hosts.lock().expect("backoff lock poisoned");
        let host = hosts.entry(destination.to_owned()).or_insert_with(HostBackoff::new);

        match classify(err) {
            FailureClass::ConnectionLevel => {
                host.mark_down();
                info!(
                    destination,
                    delay_secs = host.circuit_delay.as_secs(),
                    "Destination marked down"
                );
                true
            }
            FailureClass::Soft => {
                host.strikes += 1;
                if host.strikes >= SOFT_STRIKE_LIMIT {
                    host.mark_down();
                    info!(
                        destination,
                        delay_secs = host.circuit_delay.as_secs(),
                        "Destination marked down after repeated soft failures"
                    );
                    true
                } else {
                    debug!(destination, strikes = host.strikes, "Soft failure strike");
                    host.circuit_delay = Duration::ZERO;
                    false
                }
            }
            _ => {
                // Non-down outcome: the circuit delay resets.
                host.circuit_delay = Duration::ZERO;
                false
            }
        }
    }

    /// Delay to wait before the next local attempt at the current
    /// transaction. Zero means "do not retry locally": either the circuit
    /// breaker owns future attempts (connection-level) or the transaction is
    /// unresendable and must be dropped.
    pub fn backoff_for_error(&self, destination: &str, err: &SendError) -> Duration {
        match classify(err) {
            FailureClass::ConnectionLevel | FailureClass::Unresendable => Duration::ZERO,
            FailureClass::RateLimited { retry_after_ms } => {
                let hint = retry_after_ms
                    .map(Duration::from_millis)
                    .unwrap_or(RETRY_DELAY_BASE);
                hint + RATE_LIMIT_MARGIN
            }
            FailureClass::Soft | FailureClass::Transient => {
                let mut hosts = self.hosts.lock().expect("backoff lock poisoned");
                let host = hosts.entry(destination.to_owned()).or_insert_with(HostBackoff::new);
                let step = RETRY_DELAY_BASE.mul_f64(rand::rng().random_range(0.8..1.6));
                host.retry_delay = (host.retry_delay + step).min(RETRY_DELAY_MAX);
                host.retry_delay
            }
        }
    }

    /// Record a successful delivery: all backoff state for the destination
    /// is dropped.
    pub fn record_success(&self, destination: &str) {
        self.clear(destination);
    }

    /// Explicitly remove all backoff state for a destination.
    pub fn clear(&self, destination: &str) {
        let mut hosts = self.hosts.lock().expect("backoff lock poisoned");
        if hosts.remove(destination).is_some() {
            debug!(destination, "Cleared backoff state");
        }
    }
}

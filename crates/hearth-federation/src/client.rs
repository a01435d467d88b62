//! Server-to-server HTTP delivery.
//!
//! The [`FederationClient`] executes one signed `PUT` per transaction. It is
//! deliberately thin: batching, retry and backoff live in the transaction
//! queue; this client only signs, resolves, sends and classifies the
//! response into a [`SendError`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::debug;

use crate::error::SendError;
use crate::keys::SigningKeyPair;
use crate::signing::{canonical_json, sign_request};
use crate::types::Transaction;

/// Maps a destination server name to a base URL for HTTPS delivery.
///
/// Full well-known/SRV discovery is an external collaborator; the default
/// [`DirectResolver`] connects straight to the destination on the standard
/// federation port.
pub trait ServerResolver: Send + Sync {
    fn resolve(&self, destination: &str) -> String;
}

/// Resolves `name` to `https://name` (adding `:8448` when the destination
/// carries no explicit port).
pub struct DirectResolver;

impl ServerResolver for DirectResolver {
    fn resolve(&self, destination: &str) -> String {
        if destination.contains(':') {
            format!("https://{destination}")
        } else {
            format!("https://{destination}:8448")
        }
    }
}

/// The delivery seam the transaction queue drives. Implemented by
/// [`FederationClient`] for real traffic and by test doubles.
#[async_trait]
pub trait TransactionSender: Send + Sync {
    async fn send_transaction(&self, txn: &Transaction) -> Result<(), SendError>;
}

/// Async HTTP client for outbound federation transactions. Every request is
/// signed with this server's key pair before being sent.
pub struct FederationClient {
    origin: String,
    key_pair: Arc<SigningKeyPair>,
    http: Client,
    resolver: Box<dyn ServerResolver>,
}

impl FederationClient {
    /// Create a new federation client sending as `origin`.
    pub fn new(
        origin: impl Into<String>,
        key_pair: Arc<SigningKeyPair>,
        request_timeout: Duration,
        max_connections: u32,
    ) -> Self {
        let http = Client::builder()
            .timeout(request_timeout)
            .pool_max_idle_per_host(max_connections as usize)
            .user_agent(concat!("Hearth-Sender/", env!("CARGO_PKG_VERSION")))
            .build()
            .expect("failed to build reqwest client");

        Self { origin: origin.into(), key_pair, http, resolver: Box::new(DirectResolver) }
    }

    /// Replace the destination resolver (tests, alternate discovery).
    pub fn with_resolver(mut self, resolver: Box<dyn ServerResolver>) -> Self {
        self.resolver = resolver;
        self
    }
}

#[async_trait]
impl TransactionSender for FederationClient {
    /// `PUT /_matrix/federation/v1/send/{txnId}/`
    async fn send_transaction(&self, txn: &Transaction) -> Result<(), SendError> {
        let destination = txn.destination.clone();
        let uri = format!("/_matrix/federation/v1/send/{}/", txn.transaction_id);

        let body = serde_json::to_value(txn).map_err(|e| SendError::Encode {
            destination: destination.clone(),
            message: e.to_string(),
        })?;
        let auth =
            sign_request(&self.key_pair, &self.origin, &destination, "PUT", &uri, Some(&body));

        let base_url = self.resolver.resolve(&destination);
        let url = format!("{base_url}{uri}");
        debug!(
            destination = %destination,
            txn_id = %txn.transaction_id,
            pdus = txn.pdus.len(),
            edus = txn.edus.len(),
            "Federation PUT"
        );

        let response = self
            .http
            .put(&url)
            .header("Authorization", auth.to_header())
            .header("Content-Type", "application/json")
            .body(canonical_json(&body))
            .send()
            .await
            .map_err(|e| map_transport_error(&destination, e))?;

        let status = response.status();
        if status.is_success() {
            // Read and discard the body to confirm the response completed.
            let _ = response.bytes().await;
            return Ok(());
        }

        let raw = response.text().await.unwrap_or_default();
        Err(map_rejection(&destination, status, &raw))
    }
}

/// Structured error body remotes attach to rejections.
#[derive(Debug, Default, Deserialize)]
struct MatrixErrorBody {
    #[serde(default)]
    errcode: String,
    #[serde(default)]
    error: String,
    #[serde(default)]
    retry_after_ms: Option<u64>,
}

fn map_transport_error(destination: &str, e: reqwest::Error) -> SendError {
    if e.is_timeout() {
        SendError::Timeout(destination.to_owned())
    } else if e.is_connect() {
        SendError::ConnectionRefused(destination.to_owned())
    } else if e.is_builder() || e.is_request() {
        SendError::InvalidDestination(destination.to_owned())
    } else {
        SendError::MalformedResponse { destination: destination.to_owned(), message: e.to_string() }
    }
}

fn map_rejection(destination: &str, status: StatusCode, raw_body: &str) -> SendError {
    let body: MatrixErrorBody = serde_json::from_str(raw_body).unwrap_or_default();

    // An explicit refusal to federate is terminal for the destination, not
    // just this transaction.
    if status == StatusCode::FORBIDDEN && body.errcode == "M_FORBIDDEN" {
        return SendError::FederationDenied(destination.to_owned());
    }

    SendError::Http {
        status: status.as_u16(),
        errcode: if body.errcode.is_empty() { "M_UNKNOWN".to_owned() } else { body.errcode },
        message: body.error,
        retry_after_ms: body.retry_after_ms,
    }
}

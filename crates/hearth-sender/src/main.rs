//! # Hearth Federation Sender
//!
//! Worker binary that ships this homeserver's traffic to the rest of the
//! federation. It tails the core's replication streams, batches outbound
//! events and ephemeral data per destination, signs each transaction with the
//! server's Ed25519 key and delivers it over HTTPS.
//!
//! The worker is stateless apart from its stream cursors in Postgres: it can
//! be restarted at any time and resumes where it left off (at-least-once
//! delivery).

use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use tokio::sync::broadcast::error::RecvError;

use hearth_federation::{FederationClient, SigningKeyPair, TransactionQueue};
use hearth_replication::{
    DeviceListsRow, EventStreamRow, FederationRow, ReceiptRow, ReplicationClient,
    ReplicationNotice,
};
use hearth_store::PgStore;

const RECONNECT_PAUSE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = hearth_common::config::init()?;

    // Initialize tracing (structured logging)
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hearth=debug".into()),
        )
        .with_target(true)
        .init();

    tracing::info!("🚀 Starting hearth federation sender v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("   Sending as {}", config.server.name);

    // === Database ===
    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .min_connections(config.database.min_connections)
        .connect(&config.database.url)
        .await?;
    let store = Arc::new(PgStore::new(pool));

    // === Federation signing key ===
    // Load the Ed25519 key from disk, or generate + persist one on first run.
    let key_pair = Arc::new(SigningKeyPair::load_or_generate(&config.signing.key_path)?);
    tracing::info!("🔑 Federation signing key ready: {}", key_pair.key_id);

    // === Outbound pipeline ===
    let client = Arc::new(FederationClient::new(
        &config.server.name,
        key_pair,
        Duration::from_secs(config.federation.request_timeout_secs),
        config.federation.max_connections,
    ));
    let queue = TransactionQueue::new(
        &config.server.name,
        store,
        client,
        config.federation.page_size,
    );

    // === Replication streams ===
    let replication = ReplicationClient::new(&config.replication.client_name);
    let events = replication.bind_stream::<EventStreamRow>()?;
    let federation = replication.bind_stream::<FederationRow>()?;
    let device_lists = replication.bind_stream::<DeviceListsRow>()?;
    let receipts = if config.federation.send_receipts {
        Some(replication.bind_stream::<ReceiptRow>()?)
    } else {
        None
    };

    // Event positions drive the event pass; the bodies come from the store.
    {
        let queue = queue.clone();
        let mut positions = events.subscribe_positions();
        tokio::spawn(async move {
            loop {
                match positions.recv().await {
                    Ok(position) => {
                        if let Err(err) = queue.on_event_position_update(position.0).await {
                            tracing::error!(%err, "Event pass failed");
                        }
                    }
                    Err(RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "Event position subscriber lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
    }

    // Federation rows carry pre-routed EDUs; the core holds them until acked.
    {
        let queue = queue.clone();
        let replication = replication.clone();
        let mut updates = federation.subscribe();
        tokio::spawn(async move {
            loop {
                match updates.recv().await {
                    Ok(update) => {
                        for row in update.rows {
                            if let Err(err) = queue.on_federation_row(row).await {
                                tracing::error!(%err, "Failed to queue federation row");
                            }
                        }
                        if let Err(err) = replication.federation_ack(update.position).await {
                            tracing::warn!(%err, "Could not ack the federation stream");
                        }
                    }
                    Err(RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "Federation subscriber lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
    }

    // Device-list rows are drain hints for one destination each.
    {
        let queue = queue.clone();
        let mut updates = device_lists.subscribe();
        tokio::spawn(async move {
            loop {
                match updates.recv().await {
                    Ok(update) => {
                        for row in update.rows {
                            if let Err(err) = queue.send_device_messages(&row.destination).await {
                                tracing::error!(%err, "Failed to queue device traffic");
                            }
                        }
                    }
                    Err(RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "Device-list subscriber lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
    }

    if let Some(receipts) = receipts {
        let queue = queue.clone();
        let mut updates = receipts.subscribe();
        tokio::spawn(async move {
            loop {
                match updates.recv().await {
                    Ok(update) => {
                        for row in update.rows {
                            if let Err(err) = queue.on_receipt(row).await {
                                tracing::error!(%err, "Failed to queue receipt");
                            }
                        }
                    }
                    Err(RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "Receipt subscriber lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
    }

    // === Supervisor ===
    // The replication client never reconnects itself; this loop does, resuming
    // every stream from its last seen position.
    let mut notices = replication.notices();
    replication.connect(&config.replication.host, config.replication.port).await?;
    tracing::info!(
        "📡 Replication connected to {}:{}",
        config.replication.host,
        config.replication.port
    );

    loop {
        match notices.recv().await {
            Ok(ReplicationNotice::Disconnected) => {
                tracing::warn!(
                    "Replication connection lost; reconnecting in {}s",
                    RECONNECT_PAUSE.as_secs()
                );
                tokio::time::sleep(RECONNECT_PAUSE).await;
                while let Err(err) =
                    replication.connect(&config.replication.host, config.replication.port).await
                {
                    tracing::warn!(%err, "Reconnect failed; retrying");
                    tokio::time::sleep(RECONNECT_PAUSE).await;
                }
                tracing::info!("📡 Replication reconnected");
            }
            Ok(ReplicationNotice::Error { message }) => {
                tracing::warn!(%message, "Replication server error");
            }
            Ok(_) => {}
            Err(RecvError::Lagged(missed)) => {
                tracing::warn!(missed, "Notice subscriber lagged");
            }
            Err(RecvError::Closed) => break,
        }
    }

    Ok(())
}

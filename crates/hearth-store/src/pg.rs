//! PostgreSQL implementation of [`FederationStore`].
//!
//! Handwritten SQL over the homeserver schema. The sender shares the
//! database with the core process; it owns only the
//! `federation_stream_position` rows it writes, everything else is read or
//! commit-on-ack.

use async_trait::async_trait;
use sqlx::{PgPool, Row as _};

use crate::types::{DeviceListPokeRow, DeviceMessageRow, EventRow};
use crate::{FederationStore, StoreError};

/// Store collaborator backed by the homeserver's Postgres database.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Create a new `PgStore` on the given connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl FederationStore for PgStore {
    async fn federation_position(&self, kind: &str) -> Result<i64, StoreError> {
        let row = sqlx::query(
            "SELECT stream_id FROM federation_stream_position WHERE kind = $1",
        )
        .bind(kind)
        .fetch_optional(&self.pool)
        .await?;

        Ok(match row {
            Some(row) => row.try_get("stream_id")?,
            None => 0,
        })
    }

    async fn set_federation_position(&self, kind: &str, position: i64) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO federation_stream_position (kind, stream_id) \
             VALUES ($1, $2) \
             ON CONFLICT (kind) DO UPDATE SET stream_id = $2",
        )
        .bind(kind)
        .bind(position)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn events_after(
        &self,
        from: i64,
        to: i64,
        limit: u32,
    ) -> Result<Vec<EventRow>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT e.stream_ordering, e.event_id, e.room_id, e.type, e.sender, ej.json
            FROM events e
            INNER JOIN event_json ej ON ej.event_id = e.event_id
            WHERE e.stream_ordering > $1 AND e.stream_ordering <= $2
            ORDER BY e.stream_ordering ASC
            LIMIT $3
            "#,
        )
        .bind(from)
        .bind(to)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let raw: String = row.try_get("json")?;
                let json = serde_json::from_str(&raw).map_err(|e| {
                    StoreError::MalformedRow(format!("event_json is not valid JSON: {e}"))
                })?;
                Ok(EventRow {
                    stream_ordering: row.try_get("stream_ordering")?,
                    event_id: row.try_get("event_id")?,
                    room_id: row.try_get("room_id")?,
                    event_type: row.try_get("type")?,
                    sender: row.try_get("sender")?,
                    json,
                })
            })
            .collect()
    }

    async fn joined_hosts(&self, room_id: &str) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT split_part(user_id, ':', 2) AS host
            FROM room_memberships
            WHERE room_id = $1 AND membership = 'join'
            "#,
        )
        .bind(room_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| Ok(row.try_get::<String, _>("host")?))
            .collect()
    }

    async fn room_version(&self, room_id: &str) -> Result<String, StoreError> {
        let row = sqlx::query("SELECT room_version FROM rooms WHERE room_id = $1")
            .bind(room_id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(row.try_get("room_version")?),
            None => Err(StoreError::UnknownRoom(room_id.to_owned())),
        }
    }

    async fn device_messages_for(
        &self,
        destination: &str,
        after: i64,
        limit: u32,
    ) -> Result<Vec<DeviceMessageRow>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT stream_id, sender, message_type, message_id, messages
            FROM device_federation_outbox
            WHERE destination = $1 AND stream_id > $2
            ORDER BY stream_id ASC
            LIMIT $3
            "#,
        )
        .bind(destination)
        .bind(after)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(DeviceMessageRow {
                    stream_id: row.try_get("stream_id")?,
                    sender: row.try_get("sender")?,
                    message_type: row.try_get("message_type")?,
                    message_id: row.try_get("message_id")?,
                    messages: row.try_get("messages")?,
                })
            })
            .collect()
    }

    async fn delete_device_messages(
        &self,
        destination: &str,
        up_to: i64,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "DELETE FROM device_federation_outbox \
             WHERE destination = $1 AND stream_id <= $2",
        )
        .bind(destination)
        .bind(up_to)
        .execute(&self.pool)
        .await?;

        tracing::debug!(
            destination,
            up_to,
            deleted = result.rows_affected(),
            "Committed device-message outbox rows"
        );
        Ok(())
    }

    async fn device_list_pokes_for(
        &self,
        destination: &str,
        after: i64,
        limit: u32,
    ) -> Result<Vec<DeviceListPokeRow>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT stream_id, user_id, device_id
            FROM device_lists_outbound_pokes
            WHERE destination = $1 AND sent = FALSE AND stream_id > $2
            ORDER BY stream_id ASC
            LIMIT $3
            "#,
        )
        .bind(destination)
        .bind(after)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(DeviceListPokeRow {
                    stream_id: row.try_get("stream_id")?,
                    user_id: row.try_get("user_id")?,
                    device_id: row.try_get("device_id")?,
                })
            })
            .collect()
    }

    async fn mark_device_list_pokes_sent(
        &self,
        destination: &str,
        up_to: i64,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE device_lists_outbound_pokes SET sent = TRUE \
             WHERE destination = $1 AND stream_id <= $2",
        )
        .bind(destination)
        .bind(up_to)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

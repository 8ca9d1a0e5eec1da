//! Transactional outbox: `OutboxEvent` model and the dispatcher that drains
//! pending rows to the cache-version bus (or any other pub/sub-shaped sink).
//!
//! Producers insert a row in the same transaction as the domain write that
//! caused it (see [`OutboxEvent::insert`], taking a `&mut PgConnection` so
//! callers can run it inside their own `sqlx::Transaction`). The dispatcher
//! is a separate background task; it never sees the originating transaction.

#[cfg(feature = "database")]
use sqlx::{postgres::PgRow, PgPool, Row};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::time::Duration;
use uuid::Uuid;

/// Lifecycle of a single outbox row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboxStatus {
    Pending,
    Dispatched,
    Failed,
    Dead,
}

impl OutboxStatus {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Dispatched => "dispatched",
            Self::Failed => "failed",
            Self::Dead => "dead",
        }
    }

    fn from_str(s: &str) -> Self {
        match s {
            "dispatched" => Self::Dispatched,
            "failed" => Self::Failed,
            "dead" => Self::Dead,
            _ => Self::Pending,
        }
    }
}

/// A single pending domain event, written in the same transaction as its
/// originating write.
#[derive(Debug, Clone)]
pub struct OutboxEvent {
    pub id: Uuid,
    pub occurred_at: DateTime<Utc>,
    pub event_type: String,
    pub payload: Value,
    pub status: OutboxStatus,
    pub attempts: i32,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub idempotency_key: Option<String>,
}

impl OutboxEvent {
    pub fn new(event_type: impl Into<String>, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            occurred_at: Utc::now(),
            event_type: event_type.into(),
            payload,
            status: OutboxStatus::Pending,
            attempts: 0,
            next_attempt_at: None,
            idempotency_key: None,
        }
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// Extract `payload.tenant` as a string, if present — the shape the
    /// cache-version bus expects downstream.
    pub fn tenant(&self) -> Option<&str> {
        self.payload.get("tenant").and_then(Value::as_str)
    }

    /// Maximum retry count before a row is parked as `Dead` and no longer
    /// retried by the dispatcher's pending-row query.
    pub const MAX_ATTEMPTS: i32 = 10;

    /// Exponential backoff, capped, applied to `next_attempt_at` on failure.
    pub fn backoff_for_attempt(attempts: i32) -> Duration {
        let capped = attempts.min(10).max(0) as u32;
        Duration::from_secs(2u64.saturating_pow(capped).min(3600))
    }
}

#[cfg(feature = "database")]
pub const CREATE_OUTBOX_TABLE_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS outbox_events (
    id UUID PRIMARY KEY,
    occurred_at TIMESTAMPTZ NOT NULL,
    type TEXT NOT NULL,
    payload JSONB NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    attempts INT NOT NULL DEFAULT 0,
    next_attempt_at TIMESTAMPTZ,
    idempotency_key TEXT
);
CREATE UNIQUE INDEX IF NOT EXISTS outbox_events_idempotency_key_uidx
    ON outbox_events (idempotency_key) WHERE idempotency_key IS NOT NULL;
CREATE INDEX IF NOT EXISTS outbox_events_pending_idx
    ON outbox_events (next_attempt_at NULLS FIRST, occurred_at)
    WHERE status = 'pending';
"#;

#[cfg(feature = "database")]
impl OutboxEvent {
    /// Insert this event inside `conn` (pass a `&mut *txn` so it shares the
    /// caller's transaction). A duplicate `idempotency_key` is silently
    /// ignored — at-most-once insert across racing producers.
    pub async fn insert(&self, conn: &mut sqlx::PgConnection) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO outbox_events (id, occurred_at, type, payload, status, attempts, next_attempt_at, idempotency_key)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             ON CONFLICT (idempotency_key) WHERE idempotency_key IS NOT NULL DO NOTHING",
        )
        .bind(self.id)
        .bind(self.occurred_at)
        .bind(&self.event_type)
        .bind(&self.payload)
        .bind(self.status.as_str())
        .bind(self.attempts)
        .bind(self.next_attempt_at)
        .bind(&self.idempotency_key)
        .execute(conn)
        .await?;
        Ok(())
    }

    fn from_row(row: &PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            occurred_at: row.try_get("occurred_at")?,
            event_type: row.try_get("type")?,
            payload: row.try_get("payload")?,
            status: OutboxStatus::from_str(row.try_get::<String, _>("status")?.as_str()),
            attempts: row.try_get("attempts")?,
            next_attempt_at: row.try_get("next_attempt_at")?,
            idempotency_key: row.try_get("idempotency_key")?,
        })
    }
}

/// Publishes a dispatched event's payload. Implemented by the cache-version
/// bus producer and by tests; kept generic so the dispatcher doesn't hard
/// depend on Redis.
#[async_trait::async_trait]
pub trait OutboxPublisher: Send + Sync {
    async fn publish(&self, event: &OutboxEvent) -> Result<(), anyhow::Error>;
}

#[cfg(feature = "cache")]
pub struct RedisOutboxPublisher {
    pool: deadpool_redis::Pool,
    channel: String,
}

#[cfg(feature = "cache")]
impl RedisOutboxPublisher {
    pub fn new(pool: deadpool_redis::Pool, channel: impl Into<String>) -> Self {
        Self { pool, channel: channel.into() }
    }
}

#[cfg(feature = "cache")]
#[async_trait::async_trait]
impl OutboxPublisher for RedisOutboxPublisher {
    async fn publish(&self, event: &OutboxEvent) -> Result<(), anyhow::Error> {
        use deadpool_redis::redis::AsyncCommands;
        let mut conn = self.pool.get().await?;
        let payload = serde_json::to_string(&event.payload)?;
        let _: () = conn.publish(&self.channel, payload).await?;
        Ok(())
    }
}

/// Drains pending rows ordered by `next_attempt_at NULLS FIRST, occurred_at`,
/// publishes each, and updates its status. Runs one pass; callers loop it
/// from a [`crate::agents::BackgroundWorker`] task on an interval.
#[cfg(feature = "database")]
pub async fn dispatch_once(
    pool: &PgPool,
    publisher: &dyn OutboxPublisher,
    batch_size: i64,
) -> Result<usize, sqlx::Error> {
    let rows = sqlx::query(
        "SELECT id, occurred_at, type, payload, status, attempts, next_attempt_at, idempotency_key
         FROM outbox_events
         WHERE status = 'pending' AND (next_attempt_at IS NULL OR next_attempt_at <= now())
         ORDER BY next_attempt_at NULLS FIRST, occurred_at
         LIMIT $1",
    )
    .bind(batch_size)
    .fetch_all(pool)
    .await?;

    let mut dispatched = 0usize;
    for row in rows {
        let event = OutboxEvent::from_row(&row)?;
        match publisher.publish(&event).await {
            Ok(()) => {
                sqlx::query("UPDATE outbox_events SET status = 'dispatched' WHERE id = $1")
                    .bind(event.id)
                    .execute(pool)
                    .await?;
                dispatched += 1;
            }
            Err(e) => {
                let attempts = event.attempts + 1;
                let next_status = if attempts >= OutboxEvent::MAX_ATTEMPTS {
                    OutboxStatus::Dead
                } else {
                    OutboxStatus::Pending
                };
                let next_attempt_at = Utc::now()
                    + chrono::Duration::from_std(OutboxEvent::backoff_for_attempt(attempts))
                        .unwrap_or(chrono::Duration::seconds(60));
                tracing::warn!(
                    error = %e, event_id = %event.id, attempts,
                    "outbox dispatch failed, backing off"
                );
                sqlx::query(
                    "UPDATE outbox_events SET status = $2, attempts = $3, next_attempt_at = $4 WHERE id = $1",
                )
                .bind(event.id)
                .bind(next_status.as_str())
                .bind(attempts)
                .bind(next_attempt_at)
                .execute(pool)
                .await?;
            }
        }
    }
    Ok(dispatched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn tenant_extracted_from_payload() {
        let evt = OutboxEvent::new("collection.created", json!({"tenant": "acme"}));
        assert_eq!(evt.tenant(), Some("acme"));
    }

    #[test]
    fn missing_tenant_field_is_none() {
        let evt = OutboxEvent::new("collection.created", json!({}));
        assert_eq!(evt.tenant(), None);
    }

    #[test]
    fn backoff_grows_and_caps() {
        let d0 = OutboxEvent::backoff_for_attempt(0);
        let d1 = OutboxEvent::backoff_for_attempt(1);
        let d20 = OutboxEvent::backoff_for_attempt(20);
        assert!(d1 > d0);
        assert_eq!(d20, Duration::from_secs(3600));
    }

    #[test]
    fn new_event_starts_pending_with_zero_attempts() {
        let evt = OutboxEvent::new("x", json!({}));
        assert_eq!(evt.status, OutboxStatus::Pending);
        assert_eq!(evt.attempts, 0);
        assert!(evt.idempotency_key.is_none());
    }
}

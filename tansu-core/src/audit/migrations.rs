//! Audit table migration, serialized across racing instances via a
//! Postgres session-scoped advisory lock.

#[cfg(feature = "database")]
use sqlx::PgPool;

#[cfg(feature = "database")]
pub const CREATE_AUDIT_TABLE_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS audit_events (
    id UUID PRIMARY KEY,
    when_utc TIMESTAMPTZ NOT NULL,
    service TEXT NOT NULL,
    environment TEXT NOT NULL,
    version TEXT NOT NULL,
    tenant_id TEXT,
    subject TEXT NOT NULL DEFAULT 'system',
    action TEXT NOT NULL,
    category TEXT NOT NULL,
    route_template TEXT,
    correlation_id TEXT,
    trace_id TEXT,
    span_id TEXT,
    client_ip_hash TEXT,
    user_agent TEXT,
    outcome TEXT,
    reason_code TEXT,
    details JSONB,
    impersonated_by TEXT,
    source_host TEXT,
    unique_key TEXT,
    idempotency_key TEXT NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS audit_events_idempotency_key_uidx ON audit_events (idempotency_key);
CREATE INDEX IF NOT EXISTS audit_events_keyset_idx ON audit_events (when_utc DESC, id DESC);
CREATE INDEX IF NOT EXISTS audit_events_tenant_idx ON audit_events (tenant_id, when_utc DESC);
"#;

/// Run migrations (table + indexes, plus the outbox table the same
/// instance typically provisions) under a fixed Postgres advisory lock so
/// multiple services racing on startup serialize safely. The writer never
/// runs DDL outside this path.
#[cfg(feature = "database")]
pub async fn run_migrations(pool: &PgPool, advisory_lock_id: i64) -> Result<(), sqlx::Error> {
    let mut conn = pool.acquire().await?;
    sqlx::query("SELECT pg_advisory_lock($1)")
        .bind(advisory_lock_id)
        .execute(&mut *conn)
        .await?;

    let result = run_migrations_locked(&mut conn).await;

    // Always release, even if the migration itself failed.
    let _ = sqlx::query("SELECT pg_advisory_unlock($1)")
        .bind(advisory_lock_id)
        .execute(&mut *conn)
        .await;

    result
}

#[cfg(feature = "database")]
async fn run_migrations_locked(conn: &mut sqlx::PgConnection) -> Result<(), sqlx::Error> {
    for statement in CREATE_AUDIT_TABLE_SQL.split(';').map(str::trim).filter(|s| !s.is_empty()) {
        sqlx::query(statement).execute(&mut *conn).await?;
    }
    for statement in crate::outbox::CREATE_OUTBOX_TABLE_SQL.split(';').map(str::trim).filter(|s| !s.is_empty()) {
        sqlx::query(statement).execute(&mut *conn).await?;
    }
    Ok(())
}

//! Egress: single-reader background task that batches events from the
//! bounded channel and writes them to Postgres.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use super::event::AuditEvent;
use super::ingress::AuditCounters;

#[cfg(feature = "database")]
use sqlx::PgPool;

/// Drain the channel in batches of up to `batch_size`, writing each batch in
/// one transaction with `ON CONFLICT (idempotency_key) DO NOTHING`. On
/// failure the whole batch is dropped (already logged once), counters are
/// bumped, and the loop backs off 2s before resuming. Returns when the
/// channel closes (producers dropped) or `shutdown` fires.
#[cfg(feature = "database")]
pub async fn run_writer(
    pool: PgPool,
    mut rx: mpsc::Receiver<AuditEvent>,
    batch_size: usize,
    counters: Arc<AuditCounters>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let mut batch: Vec<AuditEvent> = Vec::with_capacity(batch_size);
    loop {
        tokio::select! {
            n = rx.recv_many(&mut batch, batch_size) => {
                if n == 0 {
                    // Channel closed; flush whatever remains and exit.
                    if !batch.is_empty() {
                        flush(&pool, &batch, &counters).await;
                    }
                    return;
                }
                flush(&pool, &batch, &counters).await;
                batch.clear();
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    if !batch.is_empty() {
                        flush(&pool, &batch, &counters).await;
                    }
                    return;
                }
            }
        }
    }
}

#[cfg(feature = "database")]
async fn flush(pool: &PgPool, batch: &[AuditEvent], counters: &AuditCounters) {
    if let Err(e) = write_batch(pool, batch).await {
        tracing::error!(error = %e, batch_len = batch.len(), "audit writer: batch failed, dropping");
        counters.write_failures.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        counters.dropped_on_failure.fetch_add(batch.len() as u64, std::sync::atomic::Ordering::Relaxed);
        tokio::time::sleep(Duration::from_secs(2)).await;
    }
}

#[cfg(feature = "database")]
async fn write_batch(pool: &PgPool, batch: &[AuditEvent]) -> Result<(), sqlx::Error> {
    let mut txn = pool.begin().await?;
    for evt in batch {
        sqlx::query(
            "INSERT INTO audit_events (
                id, when_utc, service, environment, version, tenant_id, subject, action,
                category, route_template, correlation_id, trace_id, span_id, client_ip_hash,
                user_agent, outcome, reason_code, details, impersonated_by, source_host,
                unique_key, idempotency_key
            ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17,$18,$19,$20,$21,$22)
            ON CONFLICT (idempotency_key) DO NOTHING",
        )
        .bind(evt.id)
        .bind(evt.when_utc)
        .bind(&evt.service)
        .bind(&evt.environment)
        .bind(&evt.version)
        .bind(&evt.tenant_id)
        .bind(&evt.subject)
        .bind(&evt.action)
        .bind(&evt.category)
        .bind(&evt.route_template)
        .bind(&evt.correlation_id)
        .bind(&evt.trace_id)
        .bind(&evt.span_id)
        .bind(&evt.client_ip_hash)
        .bind(&evt.user_agent)
        .bind(&evt.outcome)
        .bind(&evt.reason_code)
        .bind(&evt.details)
        .bind(&evt.impersonated_by)
        .bind(&evt.source_host)
        .bind(&evt.unique_key)
        .bind(&evt.idempotency_key)
        .execute(&mut *txn)
        .await?;
    }
    txn.commit().await
}

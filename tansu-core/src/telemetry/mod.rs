//! C5 — telemetry ingestion & admin (spec §4.5): a bounded ingestion queue
//! fed by fleet members, a persistence worker, and a filterable paged admin
//! listing with acknowledge/archive actions.

pub mod auth;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

#[cfg(feature = "database")]
use sqlx::PgPool;

pub use auth::{LoginFailureReason, SessionStore};

/// Envelope submitted by a fleet member (spec §3, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryEnvelope {
    pub id: Uuid,
    pub host: String,
    pub environment: String,
    pub service: String,
    pub severity_threshold: String,
    pub window_minutes: u32,
    pub received_at: DateTime<Utc>,
    pub items: Vec<Value>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl TelemetryEnvelope {
    pub fn new(host: String, environment: String, service: String, severity_threshold: String, window_minutes: u32, items: Vec<Value>) -> Self {
        Self {
            id: Uuid::new_v4(),
            host,
            environment,
            service,
            severity_threshold,
            window_minutes,
            received_at: Utc::now(),
            items,
            acknowledged_at: None,
            deleted_at: None,
        }
    }
}

/// Outcome of trying to enqueue an envelope against a full queue. The
/// platform distinguishes the two full-queue policies with separate
/// counters even though this implementation always rejects (spec §4.5:
/// "reject with 429 or overwrite oldest, implementation-defined").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Accepted,
    RejectedQueueFull,
}

/// Bounded ingestion queue with an explicit depth counter — `mpsc::Sender`
/// alone doesn't expose how many messages are currently buffered.
#[derive(Clone)]
pub struct IngestionQueue {
    tx: mpsc::Sender<TelemetryEnvelope>,
    depth: Arc<AtomicUsize>,
    rejected: Arc<AtomicUsize>,
}

pub struct IngestionReceiver {
    rx: mpsc::Receiver<TelemetryEnvelope>,
    depth: Arc<AtomicUsize>,
}

impl IngestionQueue {
    pub fn new(capacity: usize) -> (Self, IngestionReceiver) {
        let (tx, rx) = mpsc::channel(capacity);
        let depth = Arc::new(AtomicUsize::new(0));
        (
            Self { tx, depth: depth.clone(), rejected: Arc::new(AtomicUsize::new(0)) },
            IngestionReceiver { rx, depth },
        )
    }

    /// Current number of envelopes buffered awaiting persistence.
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    pub fn rejected_count(&self) -> usize {
        self.rejected.load(Ordering::SeqCst)
    }

    pub fn try_enqueue(&self, envelope: TelemetryEnvelope) -> EnqueueOutcome {
        match self.tx.try_send(envelope) {
            Ok(()) => {
                self.depth.fetch_add(1, Ordering::SeqCst);
                EnqueueOutcome::Accepted
            }
            Err(_) => {
                self.rejected.fetch_add(1, Ordering::SeqCst);
                EnqueueOutcome::RejectedQueueFull
            }
        }
    }
}

impl IngestionReceiver {
    pub async fn recv(&mut self) -> Option<TelemetryEnvelope> {
        let envelope = self.rx.recv().await;
        if envelope.is_some() {
            self.depth.fetch_sub(1, Ordering::SeqCst);
        }
        envelope
    }
}

/// Background worker: drains the ingestion queue and persists each envelope.
/// Never fatal — a single envelope's persistence failure is logged and the
/// loop continues with the next one.
#[cfg(feature = "database")]
pub async fn run_worker(pool: PgPool, mut rx: IngestionReceiver, mut shutdown: tokio::sync::watch::Receiver<bool>) {
    loop {
        tokio::select! {
            envelope = rx.recv() => {
                match envelope {
                    Some(envelope) => {
                        if let Err(e) = persist(&pool, &envelope).await {
                            tracing::error!(error = %e, envelope_id = %envelope.id, "telemetry: failed to persist envelope");
                        }
                    }
                    None => return,
                }
            }
            _ = shutdown.changed() => { if *shutdown.borrow() { return; } }
        }
    }
}

#[cfg(feature = "database")]
async fn persist(pool: &PgPool, envelope: &TelemetryEnvelope) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO telemetry_envelopes
            (id, host, environment, service, severity_threshold, window_minutes, received_at, items)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
         ON CONFLICT (id) DO NOTHING",
    )
    .bind(envelope.id)
    .bind(&envelope.host)
    .bind(&envelope.environment)
    .bind(&envelope.service)
    .bind(&envelope.severity_threshold)
    .bind(envelope.window_minutes as i32)
    .bind(envelope.received_at)
    .bind(serde_json::to_value(&envelope.items).unwrap_or(Value::Null))
    .execute(pool)
    .await?;
    Ok(())
}

/// Admin listing filters (spec §4.5, §6).
#[derive(Debug, Clone, Default)]
pub struct EnvelopeFilters {
    pub service: Option<String>,
    pub host: Option<String>,
    pub environment: Option<String>,
    pub severity_threshold: Option<String>,
    pub from_utc: Option<DateTime<Utc>>,
    pub to_utc: Option<DateTime<Utc>>,
    pub search: Option<String>,
    pub include_acknowledged: bool,
    pub include_deleted: bool,
    pub acknowledged: Option<bool>,
    pub deleted: Option<bool>,
    pub page: u32,
    pub page_size: u32,
}

pub const MAX_PAGE_SIZE: u32 = 200;

#[derive(Debug, Clone)]
pub struct FieldError {
    pub field: &'static str,
    pub message: String,
}

impl EnvelopeFilters {
    /// Field-scoped validation. `page` must be `>= 1`; `page_size` in
    /// `[1, MaxPageSize]`; `from_utc` must precede `to_utc` when both given.
    pub fn validate(&self) -> Result<(), Vec<FieldError>> {
        let mut errors = Vec::new();
        if self.page < 1 {
            errors.push(FieldError { field: "page", message: "must be >= 1".to_string() });
        }
        if self.page_size < 1 || self.page_size > MAX_PAGE_SIZE {
            errors.push(FieldError { field: "page_size", message: format!("must be in [1, {MAX_PAGE_SIZE}]") });
        }
        if let (Some(from), Some(to)) = (self.from_utc, self.to_utc) {
            if from > to {
                errors.push(FieldError { field: "from_utc", message: "must not be after to_utc".to_string() });
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// A page of envelopes plus whether the requested page exceeded the result
/// set (in which case the caller should redirect to page 1 with the same
/// filters, per spec §4.5).
#[derive(Debug, Clone)]
pub struct EnvelopePage {
    pub items: Vec<TelemetryEnvelope>,
    pub total_count: u64,
    pub page_exceeded_result_set: bool,
}

/// Apply `filters` to an in-memory slice of envelopes and paginate. The
/// database-backed listing (when the `database` feature is enabled) mirrors
/// this same filter/page semantics in SQL; this pure function is what the
/// admin handlers and its tests exercise directly.
pub fn paginate(all: &[TelemetryEnvelope], filters: &EnvelopeFilters) -> EnvelopePage {
    let matches: Vec<&TelemetryEnvelope> = all
        .iter()
        .filter(|e| filters.service.as_deref().map(|v| e.service == v).unwrap_or(true))
        .filter(|e| filters.host.as_deref().map(|v| e.host == v).unwrap_or(true))
        .filter(|e| filters.environment.as_deref().map(|v| e.environment == v).unwrap_or(true))
        .filter(|e| filters.severity_threshold.as_deref().map(|v| e.severity_threshold == v).unwrap_or(true))
        .filter(|e| filters.from_utc.map(|v| e.received_at >= v).unwrap_or(true))
        .filter(|e| filters.to_utc.map(|v| e.received_at <= v).unwrap_or(true))
        .filter(|e| filters.include_acknowledged || e.acknowledged_at.is_none())
        .filter(|e| filters.include_deleted || e.deleted_at.is_none())
        .filter(|e| filters.acknowledged.map(|want| e.acknowledged_at.is_some() == want).unwrap_or(true))
        .filter(|e| filters.deleted.map(|want| e.deleted_at.is_some() == want).unwrap_or(true))
        .filter(|e| {
            filters.search.as_deref().map(|q| {
                e.service.contains(q) || e.host.contains(q) || e.environment.contains(q)
            }).unwrap_or(true)
        })
        .collect();

    let total_count = matches.len() as u64;
    let page_size = filters.page_size.clamp(1, MAX_PAGE_SIZE) as usize;
    let requested_page = filters.page.max(1) as usize;
    let start = (requested_page - 1) * page_size;

    let page_exceeded_result_set = start > 0 && start >= matches.len();
    let items = if page_exceeded_result_set {
        matches.iter().take(page_size).map(|e| (*e).clone()).collect()
    } else {
        matches.iter().skip(start).take(page_size).map(|e| (*e).clone()).collect()
    };

    EnvelopePage { items, total_count, page_exceeded_result_set }
}

/// `Acknowledge(id)`: sets `acknowledged_at` if not already acknowledged and
/// not deleted. Returns whether the state actually changed.
pub fn acknowledge(envelope: &mut TelemetryEnvelope) -> bool {
    if envelope.deleted_at.is_some() || envelope.acknowledged_at.is_some() {
        return false;
    }
    envelope.acknowledged_at = Some(Utc::now());
    true
}

/// `SoftDelete(id)`: sets `deleted_at`. Returns whether the state changed.
pub fn soft_delete(envelope: &mut TelemetryEnvelope) -> bool {
    if envelope.deleted_at.is_some() {
        return false;
    }
    envelope.deleted_at = Some(Utc::now());
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(service: &str) -> TelemetryEnvelope {
        TelemetryEnvelope::new("host-1".into(), "production".into(), service.into(), "Warning".into(), 60, vec![])
    }

    #[tokio::test]
    async fn enqueue_and_drain_round_trips() {
        let (queue, mut rx) = IngestionQueue::new(4);
        assert_eq!(queue.try_enqueue(envelope("db")), EnqueueOutcome::Accepted);
        assert_eq!(queue.depth(), 1);
        let received = rx.recv().await.unwrap();
        assert_eq!(received.service, "db");
        assert_eq!(queue.depth(), 0);
    }

    #[test]
    fn full_queue_rejects_and_counts() {
        let (queue, _rx) = IngestionQueue::new(1);
        assert_eq!(queue.try_enqueue(envelope("a")), EnqueueOutcome::Accepted);
        assert_eq!(queue.try_enqueue(envelope("b")), EnqueueOutcome::RejectedQueueFull);
        assert_eq!(queue.rejected_count(), 1);
    }

    #[test]
    fn filters_reject_page_size_out_of_bounds() {
        let filters = EnvelopeFilters { page: 1, page_size: 0, ..Default::default() };
        assert!(filters.validate().is_err());
        let filters = EnvelopeFilters { page: 1, page_size: 999, ..Default::default() };
        assert!(filters.validate().is_err());
    }

    #[test]
    fn filters_reject_page_below_one() {
        let filters = EnvelopeFilters { page: 0, page_size: 20, ..Default::default() };
        assert!(filters.validate().is_err());
    }

    #[test]
    fn pagination_redirects_when_page_exceeds_results() {
        let all = vec![envelope("a"), envelope("b")];
        let filters = EnvelopeFilters { page: 5, page_size: 20, ..Default::default() };
        let page = paginate(&all, &filters);
        assert!(page.page_exceeded_result_set);
    }

    #[test]
    fn acknowledge_is_idempotent() {
        let mut e = envelope("a");
        assert!(acknowledge(&mut e));
        assert!(!acknowledge(&mut e));
    }

    #[test]
    fn acknowledge_refuses_deleted_envelopes() {
        let mut e = envelope("a");
        assert!(soft_delete(&mut e));
        assert!(!acknowledge(&mut e));
    }

    #[test]
    fn default_listing_excludes_acknowledged_and_deleted() {
        let mut acked = envelope("a");
        acknowledge(&mut acked);
        let mut deleted = envelope("b");
        soft_delete(&mut deleted);
        let visible = envelope("c");

        let all = vec![acked, deleted, visible];
        let filters = EnvelopeFilters { page: 1, page_size: 20, ..Default::default() };
        let page = paginate(&all, &filters);
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].service, "c");
    }
}

//! C4 — audit pipeline: enrichment + bounded queue ingress, batched
//! write-behind egress, advisory-locked migrations, retention, and keyset
//! query + export. See spec §4.4.
//!
//! Lifecycle: [`init`] spins up the writer task and returns an
//! [`AuditHandle`]; [`AuditHandle::shutdown`] signals the writer to flush
//! and stop. No ambient global state — the handle is threaded through
//! `AppState` the way the rest of this crate's background workers are.

pub mod event;
pub mod ingress;
pub mod migrations;
pub mod query;
pub mod retention;
pub mod writer;

use std::sync::Arc;

use tokio::sync::{mpsc, watch};

use crate::config::AuditConfig;

pub use event::AuditEvent;
pub use ingress::{AuditCounters, AuditCountersSnapshot, AuditSink, HttpContext, enrich_from_request};
pub use query::{AuditPage, AuditQuery, AuditQueryFilters, QueryValidationError};
pub use retention::{RetentionMode, RetentionOutcome};

/// Owns the writer task's cancellation handle and exposes the [`AuditSink`]
/// request handlers enqueue into.
pub struct AuditHandle {
    pub sink: AuditSink,
    shutdown_tx: watch::Sender<bool>,
    writer_task: Option<tokio::task::JoinHandle<()>>,
}

impl AuditHandle {
    /// Signal the writer to flush its current batch and stop, then await it.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(task) = self.writer_task.take() {
            let _ = task.await;
        }
    }
}

/// Start the bounded channel and writer task described in spec §4.4.1/§4.4.2.
/// Callers that also want migrations run should call
/// [`migrations::run_migrations`] themselves before or after `init` — the
/// two are independent so embedding services can choose ordering relative
/// to their own startup sequence.
#[cfg(feature = "database")]
pub fn init(config: &AuditConfig, pool: sqlx::PgPool) -> AuditHandle {
    let (tx, rx) = mpsc::channel(config.channel_capacity);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let counters = Arc::new(AuditCounters::default());

    let sink = AuditSink::new(tx, config.backpressure, counters.clone());

    let batch_size = config.batch_size;
    let writer_task = tokio::spawn(writer::run_writer(pool, rx, batch_size, counters, shutdown_rx));

    AuditHandle { sink, shutdown_tx, writer_task: Some(writer_task) }
}

#[cfg(all(test, feature = "database"))]
mod tests {
    use super::*;
    use crate::config::AuditBackpressure;

    fn test_config() -> AuditConfig {
        AuditConfig {
            channel_capacity: 10_000,
            batch_size: 256,
            backpressure: AuditBackpressure::DropOnFull,
            retention_days: 90,
            advisory_lock_id: 1,
        }
    }

    #[test]
    fn config_defaults_are_sane() {
        let cfg = test_config();
        assert_eq!(cfg.channel_capacity, 10_000);
        assert_eq!(cfg.batch_size, 256);
    }
}

//! Ingress: HTTP-context enrichment and the bounded enqueue path.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::http::HeaderMap;
use tokio::sync::mpsc;

use crate::config::AuditBackpressure;

use super::event::AuditEvent;

/// Counters exposed for health/metrics surfaces.
#[derive(Default)]
pub struct AuditCounters {
    pub enqueued: AtomicU64,
    pub dropped: AtomicU64,
    pub write_failures: AtomicU64,
    pub dropped_on_failure: AtomicU64,
}

impl AuditCounters {
    pub fn snapshot(&self) -> AuditCountersSnapshot {
        AuditCountersSnapshot {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            write_failures: self.write_failures.load(Ordering::Relaxed),
            dropped_on_failure: self.dropped_on_failure.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct AuditCountersSnapshot {
    pub enqueued: u64,
    pub dropped: u64,
    pub write_failures: u64,
    pub dropped_on_failure: u64,
}

/// Handle held by request handlers to enqueue events. Cheap to clone.
#[derive(Clone)]
pub struct AuditSink {
    tx: mpsc::Sender<AuditEvent>,
    backpressure: AuditBackpressure,
    counters: Arc<AuditCounters>,
}

impl AuditSink {
    pub fn new(tx: mpsc::Sender<AuditEvent>, backpressure: AuditBackpressure, counters: Arc<AuditCounters>) -> Self {
        Self { tx, backpressure, counters }
    }

    pub fn counters(&self) -> &AuditCounters {
        &self.counters
    }

    /// Enqueue `evt` (already enriched; call [`enrich_from_request`] first
    /// if an `HttpContext` is available). Returns `true` if accepted.
    ///
    /// Under `DropOnFull` backpressure this NEVER suspends: a full channel
    /// is a dropped event, not a blocked caller, per spec §5 ("the audit
    /// enqueue path MUST NOT suspend under backpressure when configured to
    /// drop").
    pub async fn try_enqueue(&self, evt: AuditEvent) -> bool {
        let evt = evt.finalize();
        match self.backpressure {
            AuditBackpressure::DropOnFull => match self.tx.try_send(evt) {
                Ok(()) => {
                    self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
                    true
                }
                Err(_) => {
                    self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                    false
                }
            },
            AuditBackpressure::Wait => match self.tx.send(evt).await {
                Ok(()) => {
                    self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
                    true
                }
                Err(_) => {
                    self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                    false
                }
            },
        }
    }
}

/// The subset of an inbound request needed to enrich an [`AuditEvent`]
/// before enqueue, per spec §4.4.1 step 1.
pub struct HttpContext<'a> {
    pub service: &'a str,
    pub environment: &'a str,
    pub version: &'a str,
    pub headers: &'a HeaderMap,
    pub path: &'a str,
    pub remote_ip: Option<&'a str>,
    pub trace_id: Option<&'a str>,
    pub span_id: Option<&'a str>,
    pub ip_hash_salt: Option<&'a [u8]>,
}

/// Fill any field the caller left unset from the current HTTP context.
/// Caller-supplied fields are never overwritten.
pub fn enrich_from_request(mut evt: AuditEvent, ctx: &HttpContext<'_>) -> AuditEvent {
    if evt.service.is_empty() {
        evt.service = ctx.service.to_string();
    }
    if evt.environment.is_empty() {
        evt.environment = ctx.environment.to_string();
    }
    if evt.version.is_empty() {
        evt.version = ctx.version.to_string();
    }
    if evt.tenant_id.is_none() {
        evt.tenant_id = ctx
            .headers
            .get(crate::tenant::TENANT_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
    }
    if evt.correlation_id.is_none() {
        evt.correlation_id = ctx
            .headers
            .get("x-correlation-id")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
    }
    if evt.trace_id.is_none() {
        evt.trace_id = ctx.trace_id.map(str::to_string);
    }
    if evt.span_id.is_none() {
        evt.span_id = ctx.span_id.map(str::to_string);
    }
    if evt.route_template.is_none() {
        evt.route_template = Some(ctx.path.to_string());
    }
    if evt.client_ip_hash.is_none() {
        if let (Some(salt), Some(ip)) = (ctx.ip_hash_salt, ctx.remote_ip) {
            evt.client_ip_hash = Some(crate::hashing::pseudonymize(salt, ip));
        }
    }
    if evt.user_agent.is_none() {
        evt.user_agent = ctx
            .headers
            .get("user-agent")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
    }
    evt
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn make_sink(capacity: usize, backpressure: AuditBackpressure) -> AuditSink {
        let (tx, mut rx) = mpsc::channel(capacity);
        // Drain in background so the channel doesn't fill unexpectedly in
        // tests that don't care about the receiver.
        tokio::spawn(async move { while rx.recv().await.is_some() {} });
        AuditSink::new(tx, backpressure, Arc::new(AuditCounters::default()))
    }

    #[tokio::test]
    async fn enqueue_increments_counter_on_success() {
        let sink = make_sink(10, AuditBackpressure::DropOnFull);
        let evt = AuditEvent::new("db", "test", "1.0", "Read", "Collections");
        assert!(sink.try_enqueue(evt).await);
        assert_eq!(sink.counters().snapshot().enqueued, 1);
    }

    #[tokio::test]
    async fn drop_on_full_never_blocks_and_increments_dropped() {
        let (tx, _rx) = mpsc::channel(1);
        // Fill the channel and hold the receiver without draining.
        let held = tx.clone();
        held.try_send(AuditEvent::new("db", "t", "1", "X", "Y")).unwrap();
        let sink = AuditSink::new(tx, AuditBackpressure::DropOnFull, Arc::new(AuditCounters::default()));
        let evt = AuditEvent::new("db", "test", "1.0", "Read", "Collections");
        let accepted = sink.try_enqueue(evt).await;
        assert!(!accepted);
        assert_eq!(sink.counters().snapshot().dropped, 1);
    }

    #[test]
    fn enrich_fills_tenant_from_header() {
        let mut headers = HeaderMap::new();
        headers.insert("x-tansu-tenant", HeaderValue::from_static("acme"));
        let ctx = HttpContext {
            service: "db",
            environment: "production",
            version: "1.0",
            headers: &headers,
            path: "/api/x",
            remote_ip: None,
            trace_id: None,
            span_id: None,
            ip_hash_salt: None,
        };
        let evt = AuditEvent::new("", "", "", "Read", "Collections");
        let evt = enrich_from_request(evt, &ctx);
        assert_eq!(evt.tenant_id.as_deref(), Some("acme"));
        assert_eq!(evt.service, "db");
        assert_eq!(evt.route_template.as_deref(), Some("/api/x"));
    }

    #[test]
    fn enrich_never_overwrites_caller_supplied_tenant() {
        let headers = HeaderMap::new();
        let ctx = HttpContext {
            service: "db", environment: "production", version: "1.0", headers: &headers,
            path: "/x", remote_ip: None, trace_id: None, span_id: None, ip_hash_salt: None,
        };
        let mut evt = AuditEvent::new("db", "production", "1.0", "Read", "Collections");
        evt.tenant_id = Some("explicit".to_string());
        let evt = enrich_from_request(evt, &ctx);
        assert_eq!(evt.tenant_id.as_deref(), Some("explicit"));
    }
}

//! `AuditEvent`: the immutable record described in spec §3.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Details over this many UTF-8 bytes are replaced by a truncation marker
/// before the event is enqueued.
pub const MAX_DETAILS_BYTES: usize = 8 * 1024;

/// Maximum stored `user_agent` length in bytes.
pub const MAX_USER_AGENT_BYTES: usize = 128;

/// A single immutable audit record. `idempotency_key` uniquely identifies
/// the logical event; the egress writer relies on it to dedupe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: Uuid,
    pub when_utc: DateTime<Utc>,
    pub service: String,
    pub environment: String,
    pub version: String,
    pub tenant_id: Option<String>,
    #[serde(default = "default_subject")]
    pub subject: String,
    pub action: String,
    pub category: String,
    pub route_template: Option<String>,
    pub correlation_id: Option<String>,
    pub trace_id: Option<String>,
    pub span_id: Option<String>,

    pub client_ip_hash: Option<String>,
    pub user_agent: Option<String>,
    pub outcome: Option<String>,
    pub reason_code: Option<String>,
    pub details: Option<Value>,
    pub impersonated_by: Option<String>,
    pub source_host: Option<String>,
    pub unique_key: Option<String>,

    /// SHA-256 hex of `service | floor(when_utc,1s) | subject | action |
    /// correlation_id | unique_key`. Computed by [`AuditEvent::finalize`] if
    /// not already set by the caller.
    pub idempotency_key: Option<String>,
}

fn default_subject() -> String {
    "system".to_string()
}

impl AuditEvent {
    pub fn new(service: impl Into<String>, environment: impl Into<String>, version: impl Into<String>, action: impl Into<String>, category: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            when_utc: Utc::now(),
            service: service.into(),
            environment: environment.into(),
            version: version.into(),
            tenant_id: None,
            subject: default_subject(),
            action: action.into(),
            category: category.into(),
            route_template: None,
            correlation_id: None,
            trace_id: None,
            span_id: None,
            client_ip_hash: None,
            user_agent: None,
            outcome: None,
            reason_code: None,
            details: None,
            impersonated_by: None,
            source_host: None,
            unique_key: None,
            idempotency_key: None,
        }
    }

    /// Apply the §3 invariants before enqueue: truncate oversized `details`,
    /// clamp `user_agent`, and compute `idempotency_key` if absent. Must be
    /// called exactly once, right before the event enters the channel.
    pub fn finalize(mut self) -> Self {
        self.details = self.details.map(truncate_details);
        if let Some(ua) = &self.user_agent {
            if ua.len() > MAX_USER_AGENT_BYTES {
                self.user_agent = Some(truncate_utf8(ua, MAX_USER_AGENT_BYTES));
            }
        }
        if self.idempotency_key.is_none() {
            self.idempotency_key = Some(self.compute_idempotency_key());
        }
        self
    }

    /// SHA-256 hex of the natural key tuple, floored to the second.
    pub fn compute_idempotency_key(&self) -> String {
        let floored = self.when_utc.trunc_subsecs(0);
        crate::hashing::idempotency_key(&[
            &self.service,
            &floored.to_rfc3339(),
            &self.subject,
            &self.action,
            self.correlation_id.as_deref().unwrap_or(""),
            self.unique_key.as_deref().unwrap_or(""),
        ])
    }
}

fn truncate_utf8(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

/// Replace `details` with `{truncated:true, len:N, preview:"..."}` when its
/// serialized UTF-8 size exceeds [`MAX_DETAILS_BYTES`].
fn truncate_details(details: Value) -> Value {
    let rendered = details.to_string();
    if rendered.len() <= MAX_DETAILS_BYTES {
        return details;
    }
    let preview: String = rendered.chars().take(256).collect();
    serde_json::json!({
        "truncated": true,
        "len": rendered.len(),
        "preview": preview,
    })
}

//! Keyset-paginated audit query and CSV/JSON export (spec §4.4.3, §6).

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[cfg(feature = "database")]
use sqlx::{PgPool, Row};

use super::event::AuditEvent;

/// Page size bounds (spec §8: "page_size clamped to [1,200]").
pub const MIN_PAGE_SIZE: u32 = 1;
pub const MAX_PAGE_SIZE: u32 = 200;

/// Export `limit` clamp (spec §4.4.3: "exports ... clamp limit to 10,000").
pub const MAX_EXPORT_LIMIT: u32 = 10_000;

#[derive(Debug, Clone, Default)]
pub struct AuditQueryFilters {
    pub tenant_id: Option<String>,
    pub subject: Option<String>,
    pub category: Option<String>,
    pub action: Option<String>,
    pub service: Option<String>,
    pub outcome: Option<String>,
    pub correlation_id: Option<String>,
    pub impersonation_only: bool,
}

#[derive(Debug, Clone)]
pub struct AuditQuery {
    pub start_utc: DateTime<Utc>,
    pub end_utc: DateTime<Utc>,
    pub page_size: u32,
    pub filters: AuditQueryFilters,
    pub page_token: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum QueryValidationError {
    #[error("endUtc must be after startUtc")]
    EndBeforeStart,
    #[error("tenantId is required for non-admin callers")]
    TenantRequired,
}

/// A decoded keyset cursor: `(when_ticks_nanos, id)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Cursor {
    when_nanos: i64,
    id: Uuid,
}

fn encode_token(cursor: Cursor) -> String {
    BASE64.encode(format!("{}:{}", cursor.when_nanos, cursor.id))
}

/// Decode a page token. An invalid/unparseable token yields `None` rather
/// than an error — spec §8: "invalid token returns an empty page".
fn decode_token(token: &str) -> Option<Cursor> {
    let raw = BASE64.decode(token).ok()?;
    let s = String::from_utf8(raw).ok()?;
    let (ticks, id) = s.split_once(':')?;
    Some(Cursor { when_nanos: ticks.parse().ok()?, id: id.parse().ok()? })
}

impl AuditQuery {
    pub fn validate(&self, caller_is_admin: bool) -> Result<(), QueryValidationError> {
        if self.end_utc <= self.start_utc {
            return Err(QueryValidationError::EndBeforeStart);
        }
        if !caller_is_admin && self.filters.tenant_id.is_none() {
            return Err(QueryValidationError::TenantRequired);
        }
        Ok(())
    }

    pub fn clamped_page_size(&self) -> u32 {
        self.page_size.clamp(MIN_PAGE_SIZE, MAX_PAGE_SIZE)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditPage {
    pub items: Vec<AuditEvent>,
    pub next_page_token: Option<String>,
}

#[cfg(feature = "database")]
pub async fn run_query(pool: &PgPool, query: &AuditQuery) -> Result<AuditPage, sqlx::Error> {
    let page_size = query.clamped_page_size() as i64;
    let cursor = query.page_token.as_deref().and_then(decode_token);

    // An invalid token must yield an empty page, not fall through to an
    // unfiltered first page.
    if query.page_token.is_some() && cursor.is_none() {
        return Ok(AuditPage { items: vec![], next_page_token: None });
    }

    let mut sql = String::from(
        "SELECT id, when_utc, service, environment, version, tenant_id, subject, action,
                category, route_template, correlation_id, trace_id, span_id, client_ip_hash,
                user_agent, outcome, reason_code, details, impersonated_by, source_host,
                unique_key, idempotency_key
         FROM audit_events WHERE when_utc BETWEEN $1 AND $2",
    );
    let mut idx = 3;
    let mut push_filter = |col: &str, sql: &mut String, idx: &mut i32| {
        sql.push_str(&format!(" AND {col} = ${idx}"));
        *idx += 1;
    };
    if query.filters.tenant_id.is_some() { push_filter("tenant_id", &mut sql, &mut idx); }
    if query.filters.subject.is_some() { push_filter("subject", &mut sql, &mut idx); }
    if query.filters.category.is_some() { push_filter("category", &mut sql, &mut idx); }
    if query.filters.action.is_some() { push_filter("action", &mut sql, &mut idx); }
    if query.filters.service.is_some() { push_filter("service", &mut sql, &mut idx); }
    if query.filters.outcome.is_some() { push_filter("outcome", &mut sql, &mut idx); }
    if query.filters.correlation_id.is_some() { push_filter("correlation_id", &mut sql, &mut idx); }
    if query.filters.impersonation_only {
        sql.push_str(" AND impersonated_by IS NOT NULL");
    }

    let cursor_idx_when = idx;
    let cursor_idx_id = idx + 1;
    if cursor.is_some() {
        sql.push_str(&format!(
            " AND (when_utc < ${cursor_idx_when} OR (when_utc = ${cursor_idx_when} AND id < ${cursor_idx_id}))"
        ));
    }

    let limit_idx = if cursor.is_some() { cursor_idx_id + 1 } else { idx };
    sql.push_str(&format!(" ORDER BY when_utc DESC, id DESC LIMIT ${limit_idx}"));

    let mut q = sqlx::query(&sql).bind(query.start_utc).bind(query.end_utc);
    macro_rules! bind_opt {
        ($field:expr) => {
            if let Some(v) = &$field {
                q = q.bind(v);
            }
        };
    }
    bind_opt!(query.filters.tenant_id);
    bind_opt!(query.filters.subject);
    bind_opt!(query.filters.category);
    bind_opt!(query.filters.action);
    bind_opt!(query.filters.service);
    bind_opt!(query.filters.outcome);
    bind_opt!(query.filters.correlation_id);
    if let Some(c) = cursor {
        let when_dt = DateTime::<Utc>::from_timestamp_nanos(c.when_nanos);
        q = q.bind(when_dt).bind(c.id);
    }
    q = q.bind(page_size + 1);

    let rows = q.fetch_all(pool).await?;
    let mut items: Vec<AuditEvent> = rows.iter().map(row_to_event).collect::<Result<_, _>>()?;

    let next_page_token = if items.len() as i64 > page_size {
        items.truncate(page_size as usize);
        items.last().map(|last| {
            encode_token(Cursor {
                when_nanos: last.when_utc.timestamp_nanos_opt().unwrap_or(0),
                id: last.id,
            })
        })
    } else {
        None
    };

    Ok(AuditPage { items, next_page_token })
}

#[cfg(feature = "database")]
fn row_to_event(row: &sqlx::postgres::PgRow) -> Result<AuditEvent, sqlx::Error> {
    Ok(AuditEvent {
        id: row.try_get("id")?,
        when_utc: row.try_get("when_utc")?,
        service: row.try_get("service")?,
        environment: row.try_get("environment")?,
        version: row.try_get("version")?,
        tenant_id: row.try_get("tenant_id")?,
        subject: row.try_get("subject")?,
        action: row.try_get("action")?,
        category: row.try_get("category")?,
        route_template: row.try_get("route_template")?,
        correlation_id: row.try_get("correlation_id")?,
        trace_id: row.try_get("trace_id")?,
        span_id: row.try_get("span_id")?,
        client_ip_hash: row.try_get("client_ip_hash")?,
        user_agent: row.try_get("user_agent")?,
        outcome: row.try_get("outcome")?,
        reason_code: row.try_get("reason_code")?,
        details: row.try_get("details")?,
        impersonated_by: row.try_get("impersonated_by")?,
        source_host: row.try_get("source_host")?,
        unique_key: row.try_get("unique_key")?,
        idempotency_key: row.try_get("idempotency_key")?,
    })
}

/// Fixed CSV column order (spec §6).
pub const EXPORT_CSV_COLUMNS: &[&str] = &[
    "WhenUtc", "TenantId", "Subject", "Category", "Action", "Service", "Outcome", "ReasonCode",
    "CorrelationId", "TraceId", "SpanId", "RouteTemplate", "Environment", "Version",
    "ClientIpHash", "UserAgent", "ImpersonatedBy", "SourceHost", "Details",
];

/// Render `items` as RFC 4180 CSV with the fixed column order above.
#[cfg(feature = "export")]
pub fn render_csv(items: &[AuditEvent]) -> Result<Vec<u8>, csv::Error> {
    let mut wtr = csv::WriterBuilder::new().from_writer(vec![]);
    wtr.write_record(EXPORT_CSV_COLUMNS)?;
    for e in items {
        wtr.write_record(&[
            e.when_utc.to_rfc3339(),
            e.tenant_id.clone().unwrap_or_default(),
            e.subject.clone(),
            e.category.clone(),
            e.action.clone(),
            e.service.clone(),
            e.outcome.clone().unwrap_or_default(),
            e.reason_code.clone().unwrap_or_default(),
            e.correlation_id.clone().unwrap_or_default(),
            e.trace_id.clone().unwrap_or_default(),
            e.span_id.clone().unwrap_or_default(),
            e.route_template.clone().unwrap_or_default(),
            e.environment.clone(),
            e.version.clone(),
            e.client_ip_hash.clone().unwrap_or_default(),
            e.user_agent.clone().unwrap_or_default(),
            e.impersonated_by.clone().unwrap_or_default(),
            e.source_host.clone().unwrap_or_default(),
            e.details.as_ref().map(ToString::to_string).unwrap_or_default(),
        ])?;
    }
    wtr.into_inner().map_err(|e| e.into_error())
}

pub fn render_json(items: &[AuditEvent]) -> serde_json::Result<Vec<u8>> {
    serde_json::to_vec(items)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_query() -> AuditQuery {
        AuditQuery {
            start_utc: "2024-01-01T00:00:00Z".parse().unwrap(),
            end_utc: "2024-01-02T00:00:00Z".parse().unwrap(),
            page_size: 9999,
            filters: AuditQueryFilters::default(),
            page_token: None,
        }
    }

    #[test]
    fn page_size_clamps_to_200() {
        let q = sample_query();
        assert_eq!(q.clamped_page_size(), MAX_PAGE_SIZE);
    }

    #[test]
    fn page_size_clamps_to_at_least_1() {
        let mut q = sample_query();
        q.page_size = 0;
        assert_eq!(q.clamped_page_size(), MIN_PAGE_SIZE);
    }

    #[test]
    fn rejects_end_before_start() {
        let mut q = sample_query();
        q.end_utc = q.start_utc - chrono::Duration::seconds(1);
        assert!(matches!(q.validate(true), Err(QueryValidationError::EndBeforeStart)));
    }

    #[test]
    fn non_admin_without_tenant_is_rejected() {
        let q = sample_query();
        assert!(matches!(q.validate(false), Err(QueryValidationError::TenantRequired)));
    }

    #[test]
    fn non_admin_with_tenant_is_accepted() {
        let mut q = sample_query();
        q.filters.tenant_id = Some("acme".to_string());
        assert!(q.validate(false).is_ok());
    }

    #[test]
    fn admin_without_tenant_is_accepted() {
        let q = sample_query();
        assert!(q.validate(true).is_ok());
    }

    #[test]
    fn malformed_token_decodes_to_none() {
        assert!(decode_token("not-base64!!!").is_none());
        assert!(decode_token(&BASE64.encode("garbage")).is_none());
    }

    #[test]
    fn token_round_trips() {
        let id = Uuid::new_v4();
        let cursor = Cursor { when_nanos: 12345, id };
        let token = encode_token(cursor);
        let decoded = decode_token(&token).unwrap();
        assert_eq!(decoded, cursor);
    }

    #[cfg(feature = "export")]
    #[test]
    fn csv_export_has_fixed_column_order() {
        let evt = AuditEvent::new("db", "production", "1.0", "Read", "Collections");
        let csv_bytes = render_csv(&[evt]).unwrap();
        let csv_str = String::from_utf8(csv_bytes).unwrap();
        let header = csv_str.lines().next().unwrap();
        assert_eq!(header, EXPORT_CSV_COLUMNS.join(","));
    }
}

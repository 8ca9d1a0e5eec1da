//! Jittered background dispatcher: every report interval, snapshot the
//! buffer, filter/classify/sample, cap the payload and POST it upstream,
//! committing the consumed records only after a successful send (spec §4.6).

use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use reqwest::Client;
use serde::Serialize;

use crate::config::LogReporterConfig;
use crate::hashing::{pseudonymize, sha256_hex};

use super::buffer::{LogBuffer, LogRecord, Severity};

const PERF_SLO_RANGE: std::ops::RangeInclusive<i32> = 1500..=1599;
const TELEMETRY_INTERNAL_RANGE: std::ops::RangeInclusive<i32> = 4000..=4099;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportKind {
    Critical,
    Error,
    Warning,
    Info,
    PerfSloBreach,
    TelemetryInternal,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportItem {
    pub kind: ReportKind,
    pub timestamp: chrono::DateTime<Utc>,
    pub category: String,
    pub event_id: i32,
    pub message: String,
    pub exception: Option<String>,
    pub service: String,
    pub environment: String,
    pub tenant_hash: Option<String>,
    pub correlation_id: Option<String>,
    pub trace_id: Option<String>,
    pub span_id: Option<String>,
    pub template_hash: String,
    /// Set only on aggregated `PerfSloBreach` items.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<u64>,
}

#[derive(Debug, Serialize)]
struct ReportPayload<'a> {
    items: &'a [ReportItem],
}

fn template_hash(category: &str, event_id: i32, message: &str) -> String {
    sha256_hex(format!("{category}|{event_id}|{message}").as_bytes())
}

fn classify(event_id: i32, level: Severity) -> ReportKind {
    if PERF_SLO_RANGE.contains(&event_id) {
        ReportKind::PerfSloBreach
    } else if TELEMETRY_INTERNAL_RANGE.contains(&event_id) {
        ReportKind::TelemetryInternal
    } else {
        match level {
            Severity::Critical => ReportKind::Critical,
            Severity::Error => ReportKind::Error,
            Severity::Warning => ReportKind::Warning,
            _ => ReportKind::Info,
        }
    }
}

fn tenant_hash(cfg: &LogReporterConfig, tenant: &Option<String>) -> Option<String> {
    let tenant = tenant.as_ref()?;
    if !cfg.pseudonymize_tenant {
        return Some(tenant.clone());
    }
    Some(match &cfg.pseudonymization_secret {
        Some(secret) if !secret.is_empty() => pseudonymize(secret.as_bytes(), tenant),
        _ => sha256_hex(tenant.as_bytes()),
    })
}

/// Decide whether a `Warning`-level record survives allowlist/sampling.
/// `sample_roll` is passed in so tests can drive it deterministically.
fn warning_survives(cfg: &LogReporterConfig, category: &str, sample_roll: f64) -> bool {
    if cfg.warning_category_allowlist.iter().any(|prefix| category.starts_with(prefix.as_str())) {
        return true;
    }
    sample_roll * 100.0 < cfg.warning_sampling_percent
}

/// Build the report payload from a buffer snapshot. Returns the items and
/// how many source records were consumed (everything that passed the
/// severity/window gate, whether or not it was ultimately sampled out,
/// since sampled-out records are still considered handled — only records
/// that never reached the gate at all are left for the next tick... in
/// practice the whole snapshot is consumed, since `Snapshot` captures a
/// fixed prefix and every record in it is evaluated here).
pub fn build_report<R: Rng>(cfg: &LogReporterConfig, records: &[LogRecord], now: chrono::DateTime<Utc>, rng: &mut R) -> Vec<ReportItem> {
    let mut perf_counts: std::collections::HashMap<String, (LogRecord, u64)> = std::collections::HashMap::new();
    let mut items = Vec::new();

    for record in records {
        if (record.level as u8) < cfg.severity_threshold {
            continue;
        }
        if now.signed_duration_since(record.timestamp).num_minutes() > cfg.window_minutes {
            continue;
        }
        if record.level == Severity::Warning && !warning_survives(cfg, &record.category, rng.random::<f64>()) {
            continue;
        }

        let hash = template_hash(&record.category, record.event_id, &record.message);
        let kind = classify(record.event_id, record.level);

        if kind == ReportKind::PerfSloBreach {
            perf_counts.entry(hash.clone()).or_insert_with(|| (record.clone(), 0)).1 += 1;
            continue;
        }

        items.push(ReportItem {
            kind,
            timestamp: record.timestamp,
            category: record.category.clone(),
            event_id: record.event_id,
            message: record.message.clone(),
            exception: record.exception.clone(),
            service: record.service.clone(),
            environment: record.environment.clone(),
            tenant_hash: tenant_hash(cfg, &record.tenant),
            correlation_id: record.correlation_id.clone(),
            trace_id: record.trace_id.clone(),
            span_id: record.span_id.clone(),
            template_hash: hash,
            count: None,
        });
    }

    let max_items = cfg.max_items.max(50);
    let room_for_perf = max_items.saturating_sub(items.len());
    items.truncate(max_items);

    let mut perf_items: Vec<ReportItem> = perf_counts
        .into_iter()
        .map(|(hash, (record, count))| ReportItem {
            kind: ReportKind::PerfSloBreach,
            timestamp: record.timestamp,
            category: record.category.clone(),
            event_id: record.event_id,
            message: record.message.clone(),
            exception: None,
            service: record.service.clone(),
            environment: record.environment.clone(),
            tenant_hash: tenant_hash(cfg, &record.tenant),
            correlation_id: None,
            trace_id: None,
            span_id: None,
            template_hash: hash,
            count: Some(count),
        })
        .collect();
    perf_items.truncate(room_for_perf);
    items.extend(perf_items);

    items
}

async fn send(client: &Client, url: &str, bearer: Option<&str>, items: &[ReportItem]) -> bool {
    let mut req = client.post(url).json(&ReportPayload { items });
    if let Some(token) = bearer {
        req = req.bearer_auth(token);
    }
    match req.send().await {
        Ok(resp) => resp.status().is_success(),
        Err(e) => {
            tracing::warn!(error = %e, "log reporter: send failed");
            false
        }
    }
}

/// Background dispatch loop. A pure no-op when `main_server_url` is empty.
/// When `enabled` flips false at runtime the loop keeps sleeping on its
/// normal cadence without ever draining the buffer.
pub async fn run_dispatcher(cfg: LogReporterConfig, buffer: LogBuffer, mut shutdown: tokio::sync::watch::Receiver<bool>) {
    if cfg.main_server_url.is_empty() {
        return;
    }

    let client = Client::new();
    let mut rng = rand::rng();

    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(cfg.initial_stagger_secs)) => {}
        _ = shutdown.changed() => { if *shutdown.borrow() { return; } }
    }

    let mut interval = Duration::from_secs(cfg.report_interval_secs);
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.changed() => { if *shutdown.borrow() { return; } }
        }

        if !cfg.enabled {
            interval = Duration::from_secs(cfg.report_interval_secs);
            continue;
        }

        let snapshot = buffer.snapshot();
        if snapshot.is_empty() {
            interval = Duration::from_secs(cfg.report_interval_secs);
            continue;
        }

        let now = Utc::now();
        let items = build_report(&cfg, &snapshot, now, &mut rng);
        let ok = send(&client, &cfg.main_server_url, cfg.bearer_token.as_deref(), &items).await;

        if ok {
            buffer.remove_batch(snapshot.len());
            interval = Duration::from_secs(cfg.report_interval_secs);
        } else {
            let jitter = rng.random_range(cfg.jitter_min_secs..=cfg.jitter_max_secs.max(cfg.jitter_min_secs));
            interval = Duration::from_secs(jitter);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn base_cfg() -> LogReporterConfig {
        LogReporterConfig {
            report_interval_secs: 3600,
            jitter_min_secs: 5,
            jitter_max_secs: 30,
            initial_stagger_secs: 10,
            main_server_url: "https://example.invalid/report".to_string(),
            buffer_capacity: 5000,
            severity_threshold: 3,
            window_minutes: 60,
            warning_category_allowlist: vec!["security.".to_string()],
            warning_sampling_percent: 0.0,
            max_items: 50,
            pseudonymize_tenant: true,
            pseudonymization_secret: Some("deploy-salt".to_string()),
            bearer_token: None,
            enabled: true,
        }
    }

    fn record(level: Severity, event_id: i32, category: &str) -> LogRecord {
        LogRecord {
            timestamp: Utc::now(),
            level,
            message: "something happened".to_string(),
            category: category.to_string(),
            event_id,
            exception: None,
            service: "db".to_string(),
            environment: "production".to_string(),
            tenant: Some("tenant-1".to_string()),
            correlation_id: None,
            trace_id: None,
            span_id: None,
        }
    }

    #[test]
    fn below_threshold_is_dropped() {
        let cfg = base_cfg();
        let records = vec![record(Severity::Information, 100, "general")];
        let mut rng = rand::rng();
        let items = build_report(&cfg, &records, Utc::now(), &mut rng);
        assert!(items.is_empty());
    }

    #[test]
    fn outside_window_is_dropped() {
        let cfg = base_cfg();
        let mut rec = record(Severity::Critical, 100, "general");
        rec.timestamp = Utc::now() - ChronoDuration::minutes(120);
        let mut rng = rand::rng();
        let items = build_report(&cfg, &[rec], Utc::now(), &mut rng);
        assert!(items.is_empty());
    }

    #[test]
    fn warning_allowlisted_category_always_included() {
        let cfg = base_cfg();
        let rec = record(Severity::Warning, 100, "security.auth");
        let mut rng = rand::rng();
        let items = build_report(&cfg, &[rec], Utc::now(), &mut rng);
        assert_eq!(items.len(), 1);
    }

    #[test]
    fn warning_non_allowlisted_is_sampled_out_at_zero_percent() {
        let cfg = base_cfg();
        let rec = record(Severity::Warning, 100, "general");
        let mut rng = rand::rng();
        let items = build_report(&cfg, &[rec], Utc::now(), &mut rng);
        assert!(items.is_empty());
    }

    #[test]
    fn perf_slo_events_aggregate_by_template_hash() {
        let cfg = base_cfg();
        let records = vec![
            record(Severity::Error, 1550, "perf"),
            record(Severity::Error, 1550, "perf"),
            record(Severity::Error, 1550, "perf"),
        ];
        let mut rng = rand::rng();
        let items = build_report(&cfg, &records, Utc::now(), &mut rng);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].kind, ReportKind::PerfSloBreach);
        assert_eq!(items[0].count, Some(3));
    }

    #[test]
    fn telemetry_internal_range_is_classified_distinctly() {
        let cfg = base_cfg();
        let rec = record(Severity::Information, 4050, "telemetry");
        let mut rng = rand::rng();
        let items = build_report(&cfg, &[rec], Utc::now(), &mut rng);
        assert_eq!(items[0].kind, ReportKind::TelemetryInternal);
    }

    #[test]
    fn tenant_is_pseudonymized_when_enabled() {
        let cfg = base_cfg();
        let rec = record(Severity::Critical, 999, "general");
        let mut rng = rand::rng();
        let items = build_report(&cfg, &[rec], Utc::now(), &mut rng);
        let hash = items[0].tenant_hash.clone().unwrap();
        assert_ne!(hash, "tenant-1");
        assert_eq!(hash.len(), 64);
    }

    #[test]
    fn tenant_passes_through_when_pseudonymization_disabled() {
        let mut cfg = base_cfg();
        cfg.pseudonymize_tenant = false;
        let rec = record(Severity::Critical, 999, "general");
        let mut rng = rand::rng();
        let items = build_report(&cfg, &[rec], Utc::now(), &mut rng);
        assert_eq!(items[0].tenant_hash.as_deref(), Some("tenant-1"));
    }

    #[test]
    fn payload_is_capped_at_max_items() {
        let mut cfg = base_cfg();
        cfg.max_items = 5;
        let records: Vec<LogRecord> = (0..20).map(|i| record(Severity::Critical, 2000 + i, "general")).collect();
        let mut rng = rand::rng();
        let items = build_report(&cfg, &records, Utc::now(), &mut rng);
        assert_eq!(items.len(), 5);
    }

    #[test]
    fn max_items_floors_at_fifty() {
        let mut cfg = base_cfg();
        cfg.max_items = 1;
        assert_eq!(cfg.max_items.max(50), 50);
    }

    #[test]
    fn template_hash_is_stable_for_same_triple() {
        let a = template_hash("cat", 100, "msg");
        let b = template_hash("cat", 100, "msg");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }
}

//! C6 — log reporter agent: a bounded in-process log buffer drained on a
//! jittered schedule to a central reporting endpoint, with severity
//! filtering, per-category sampling, perf-SLO aggregation and tenant
//! pseudonymization (spec §4.6).

pub mod buffer;
pub mod dispatcher;

pub use buffer::{LogBuffer, LogRecord, Severity};
pub use dispatcher::{build_report, run_dispatcher, ReportItem, ReportKind};

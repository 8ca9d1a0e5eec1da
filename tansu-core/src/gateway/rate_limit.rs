//! Rate-limit rejection aggregation: the window-timer that turns a burst of
//! individual rejections into one `RateLimitRejectedSummary` log event,
//! spec §4.1.3 / scenario 7.
//!
//! The limiter itself (governor/Redis token bucket) lives in
//! [`crate::middleware::rate_limit`]; this module only batches *rejections*
//! it is handed via [`RateLimitAggregator::report`].

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tracing::{debug, info};

use crate::log_reporter::buffer::Severity;

/// Runtime override of the minimum emitted level for a logging category.
/// When the override for `"RateLimit"` is `Debug` or finer, every rejection
/// additionally emits a `RateLimitRejectedDebug` event, not just the
/// per-window summary.
#[derive(Debug, Clone, Default)]
pub struct DynamicLogOverrides {
    overrides: HashMap<String, Severity>,
}

impl DynamicLogOverrides {
    pub fn set(&mut self, category: impl Into<String>, level: Severity) {
        self.overrides.insert(category.into(), level);
    }

    /// `Debug` or finer (i.e. `Debug` or `Trace`).
    pub fn is_debug_or_finer(&self, category: &str) -> bool {
        matches!(self.overrides.get(category), Some(level) if *level <= Severity::Debug)
    }
}

/// One partition's rejection count within the current window, used for the
/// top-3-by-count summary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionCount {
    pub partition: String,
    pub count: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RejectionSummary {
    pub total: u64,
    pub top_partitions: Vec<PartitionCount>,
}

#[derive(Default)]
struct WindowState {
    by_partition: HashMap<String, u64>,
    total: u64,
}

/// Aggregates `Report(route, tenant, partition)` calls into one summary per
/// window. `window` defaults to 60s per spec §4.1.3.
pub struct RateLimitAggregator {
    window: Duration,
    state: Mutex<WindowState>,
    log_overrides: Mutex<DynamicLogOverrides>,
}

impl RateLimitAggregator {
    pub fn new(window: Duration) -> Self {
        Self { window, state: Mutex::new(WindowState::default()), log_overrides: Mutex::new(DynamicLogOverrides::default()) }
    }

    pub fn with_default_window() -> Self {
        Self::new(Duration::from_secs(60))
    }

    pub fn set_log_override(&self, category: &str, level: Severity) {
        self.log_overrides.lock().unwrap().set(category, level);
    }

    /// Record one rejection. Never blocks the caller beyond a short mutex
    /// hold; emits `RateLimitRejectedDebug` immediately when the dynamic
    /// override for `"RateLimit"` is `Debug` or finer.
    pub fn report(&self, route: &str, tenant: &str, partition: &str) {
        {
            let mut state = self.state.lock().unwrap();
            state.total += 1;
            *state.by_partition.entry(partition.to_string()).or_insert(0) += 1;
        }

        if self.log_overrides.lock().unwrap().is_debug_or_finer("RateLimit") {
            debug!(
                target: "RateLimitRejectedDebug",
                route, tenant, partition,
                "rate limit rejection"
            );
        }
    }

    /// Drain the current window's counts into a summary, resetting state
    /// for the next window. Top-3 partitions are ordered by count
    /// descending, ties broken by partition name for determinism.
    pub fn take_window(&self) -> RejectionSummary {
        let mut state = self.state.lock().unwrap();
        let total = state.total;
        let mut counts: Vec<PartitionCount> = state
            .by_partition
            .drain()
            .map(|(partition, count)| PartitionCount { partition, count })
            .collect();
        state.total = 0;

        counts.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.partition.cmp(&b.partition)));
        counts.truncate(3);

        RejectionSummary { total, top_partitions: counts }
    }

    pub fn window(&self) -> Duration {
        self.window
    }
}

/// Background loop: every `aggregator.window()`, drain the window and emit
/// one `RateLimitRejectedSummary` event (skipped entirely if nothing was
/// rejected this window).
pub async fn run_window_timer(aggregator: std::sync::Arc<RateLimitAggregator>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(aggregator.window()) => {}
            _ = shutdown.changed() => { if *shutdown.borrow() { return; } }
        }

        let summary = aggregator.take_window();
        if summary.total == 0 {
            continue;
        }

        info!(
            target: "RateLimitRejectedSummary",
            total = summary.total,
            top_partitions = ?summary.top_partitions,
            "rate limit rejections this window"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scenario_rate_limit_summary_window() {
        let agg = RateLimitAggregator::with_default_window();
        agg.report("db", "acme", "p1");
        agg.report("db", "acme", "p1");
        agg.report("db", "globex", "p2");

        let summary = agg.take_window();
        assert_eq!(summary.total, 3);
        assert_eq!(
            summary.top_partitions,
            vec![
                PartitionCount { partition: "p1".to_string(), count: 2 },
                PartitionCount { partition: "p2".to_string(), count: 1 },
            ]
        );

        // Window resets after drain.
        let empty = agg.take_window();
        assert_eq!(empty.total, 0);
    }

    #[test]
    fn no_debug_override_means_summary_only() {
        let agg = RateLimitAggregator::with_default_window();
        assert!(!agg.log_overrides.lock().unwrap().is_debug_or_finer("RateLimit"));
        agg.report("db", "acme", "p1");
        // The debug path is a no-op here; only summary state accrues.
        assert_eq!(agg.state.lock().unwrap().total, 1);
    }

    #[test]
    fn debug_override_enables_per_rejection_event_path() {
        let agg = RateLimitAggregator::with_default_window();
        agg.set_log_override("RateLimit", Severity::Debug);
        assert!(agg.log_overrides.lock().unwrap().is_debug_or_finer("RateLimit"));
        agg.set_log_override("RateLimit", Severity::Trace);
        assert!(agg.log_overrides.lock().unwrap().is_debug_or_finer("RateLimit"));
        agg.set_log_override("RateLimit", Severity::Information);
        assert!(!agg.log_overrides.lock().unwrap().is_debug_or_finer("RateLimit"));
    }

    #[test]
    fn top_three_truncates_and_orders_by_count_then_name() {
        let agg = RateLimitAggregator::with_default_window();
        agg.report("db", "t", "p1");
        agg.report("db", "t", "p2");
        agg.report("db", "t", "p2");
        agg.report("db", "t", "p3");
        agg.report("db", "t", "p3");
        agg.report("db", "t", "p3");
        agg.report("db", "t", "p4");

        let summary = agg.take_window();
        assert_eq!(summary.total, 7);
        assert_eq!(summary.top_partitions.len(), 3);
        assert_eq!(summary.top_partitions[0].partition, "p3");
        assert_eq!(summary.top_partitions[1].partition, "p2");
        assert_eq!(summary.top_partitions[2].partition, "p1");
    }
}

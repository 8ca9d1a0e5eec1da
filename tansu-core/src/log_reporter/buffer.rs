//! Bounded, loss-safe in-memory log buffer with snapshot-then-commit
//! semantics (spec §4.6).

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// `Trace=0 … Critical=5`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum Severity {
    Trace = 0,
    Debug = 1,
    Information = 2,
    Warning = 3,
    Error = 4,
    Critical = 5,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    pub timestamp: DateTime<Utc>,
    pub level: Severity,
    pub message: String,
    pub category: String,
    pub event_id: i32,
    pub exception: Option<String>,
    pub service: String,
    pub environment: String,
    pub tenant: Option<String>,
    pub correlation_id: Option<String>,
    pub trace_id: Option<String>,
    pub span_id: Option<String>,
}

/// Bounded FIFO: `Add` drops the oldest record on overflow rather than
/// blocking or failing the caller — the agent must never slow down the
/// process it's instrumenting.
#[derive(Clone)]
pub struct LogBuffer {
    inner: Arc<Mutex<VecDeque<LogRecord>>>,
    capacity: usize,
}

impl LogBuffer {
    /// Capacity floor of 100 regardless of configuration (spec §4.6).
    pub fn new(configured_capacity: usize) -> Self {
        Self { inner: Arc::new(Mutex::new(VecDeque::new())), capacity: configured_capacity.max(100) }
    }

    pub fn add(&self, record: LogRecord) {
        let mut buf = self.inner.lock().unwrap();
        if buf.len() >= self.capacity {
            buf.pop_front();
        }
        buf.push_back(record);
    }

    /// Non-destructive oldest-to-newest copy of the entire buffer.
    pub fn snapshot(&self) -> Vec<LogRecord> {
        self.inner.lock().unwrap().iter().cloned().collect()
    }

    /// Non-destructive copy of the oldest `n` records.
    pub fn peek_batch(&self, n: usize) -> Vec<LogRecord> {
        self.inner.lock().unwrap().iter().take(n).cloned().collect()
    }

    /// Remove the oldest `n` records. Called only after a batch has been
    /// durably handed off downstream (commit-after-send).
    pub fn remove_batch(&self, n: usize) {
        let mut buf = self.inner.lock().unwrap();
        for _ in 0..n.min(buf.len()) {
            buf.pop_front();
        }
    }

    pub fn clear(&self) {
        self.inner.lock().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(event_id: i32) -> LogRecord {
        LogRecord {
            timestamp: Utc::now(),
            level: Severity::Information,
            message: "m".to_string(),
            category: "cat".to_string(),
            event_id,
            exception: None,
            service: "db".to_string(),
            environment: "production".to_string(),
            tenant: None,
            correlation_id: None,
            trace_id: None,
            span_id: None,
        }
    }

    #[test]
    fn capacity_floors_at_100() {
        let buf = LogBuffer::new(10);
        for i in 0..150 {
            buf.add(record(i));
        }
        assert_eq!(buf.len(), 100);
    }

    #[test]
    fn overflow_drops_the_oldest() {
        let buf = LogBuffer::new(100);
        for i in 0..105 {
            buf.add(record(i));
        }
        let snap = buf.snapshot();
        assert_eq!(snap.first().unwrap().event_id, 5);
        assert_eq!(snap.last().unwrap().event_id, 104);
    }

    #[test]
    fn snapshot_is_non_destructive() {
        let buf = LogBuffer::new(100);
        buf.add(record(1));
        let _ = buf.snapshot();
        assert_eq!(buf.len(), 1);
    }

    #[test]
    fn remove_batch_commits_from_the_head() {
        let buf = LogBuffer::new(100);
        for i in 0..5 {
            buf.add(record(i));
        }
        buf.remove_batch(3);
        let remaining = buf.snapshot();
        assert_eq!(remaining.iter().map(|r| r.event_id).collect::<Vec<_>>(), vec![3, 4]);
    }

    #[test]
    fn peek_batch_is_non_destructive() {
        let buf = LogBuffer::new(100);
        for i in 0..5 {
            buf.add(record(i));
        }
        let peeked = buf.peek_batch(2);
        assert_eq!(peeked.len(), 2);
        assert_eq!(buf.len(), 5);
    }

    #[test]
    fn clear_empties_the_buffer() {
        let buf = LogBuffer::new(100);
        buf.add(record(1));
        buf.clear();
        assert!(buf.is_empty());
    }
}

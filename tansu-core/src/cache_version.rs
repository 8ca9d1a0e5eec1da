//! Per-tenant cache-version counter and the bus subscriber that bumps it.
//!
//! The gateway's dynamic output cache (see [`crate::gateway::cache`]) mixes
//! a per-tenant version token into every cache key. Bumping the counter
//! invalidates an entire tenant's cache in O(1) without touching a single
//! stored entry. The counter itself is process-local; the subscriber below
//! is what keeps every process instance's counter converging on the same
//! value after a mutation anywhere in the fleet.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Deserialize;

/// Process-wide `tenant -> version` table. Cheap to clone (an `Arc` inside).
#[derive(Clone, Default)]
pub struct TenantCacheVersion {
    versions: Arc<DashMap<String, AtomicU64>>,
}

impl TenantCacheVersion {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current version for `tenant`, or `0` if never bumped.
    pub fn get(&self, tenant: &str) -> u64 {
        self.versions
            .get(tenant)
            .map(|v| v.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Atomically bump `tenant`'s version and return the new value. A no-op
    /// returning `0` for an empty/whitespace-only tenant id. Wrap-around on
    /// `u64::MAX` is allowed; this is a cache-invalidation token, not a
    /// durable sequence number, so wrapping to `0` only causes one spurious
    /// cache hit in the astronomically unlikely event it's ever reached.
    pub fn increment(&self, tenant: &str) -> u64 {
        if tenant.trim().is_empty() {
            return 0;
        }
        let entry = self
            .versions
            .entry(tenant.to_string())
            .or_insert_with(|| AtomicU64::new(0));
        entry.fetch_add(1, Ordering::SeqCst) + 1
    }
}

/// Payload shape on the pub/sub channel. Subscribers ignore any field beyond
/// `tenant` and never fail on unknown keys.
#[derive(Debug, Deserialize)]
struct CacheVersionEvent {
    tenant: String,
}

/// Background task: subscribes to `channel` on the Redis pub/sub bus and
/// bumps `versions` on every well-formed message. Reconnects with
/// exponential backoff (capped) on any bus disconnect; never returns except
/// when `shutdown` fires. All failures are logged, never fatal — this is
/// cache invalidation, not a durability-critical path.
#[cfg(feature = "cache")]
pub async fn run_subscriber(
    redis_url: String,
    channel: String,
    versions: TenantCacheVersion,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    use futures::StreamExt;

    let mut backoff = Duration::from_secs(1);
    const MAX_BACKOFF: Duration = Duration::from_secs(30);

    loop {
        if *shutdown.borrow() {
            return;
        }

        let client = match redis::Client::open(redis_url.as_str()) {
            Ok(c) => c,
            Err(e) => {
                tracing::error!(error = %e, "cache-version subscriber: invalid redis url");
                return;
            }
        };

        let conn = match client.get_async_pubsub().await {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(error = %e, backoff = ?backoff, "cache-version subscriber: connect failed, retrying");
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = shutdown.changed() => { if *shutdown.borrow() { return; } }
                }
                backoff = (backoff * 2).min(MAX_BACKOFF);
                continue;
            }
        };

        let mut conn = conn;
        if let Err(e) = conn.subscribe(&channel).await {
            tracing::warn!(error = %e, channel, "cache-version subscriber: subscribe failed, retrying");
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = shutdown.changed() => { if *shutdown.borrow() { return; } }
            }
            backoff = (backoff * 2).min(MAX_BACKOFF);
            continue;
        }

        tracing::info!(channel, "cache-version subscriber connected");
        backoff = Duration::from_secs(1);

        let mut stream = conn.on_message();
        loop {
            tokio::select! {
                msg = stream.next() => {
                    match msg {
                        Some(msg) => {
                            let payload: String = match msg.get_payload() {
                                Ok(p) => p,
                                Err(e) => {
                                    tracing::debug!(error = %e, "cache-version subscriber: non-utf8 payload");
                                    continue;
                                }
                            };
                            match serde_json::from_str::<CacheVersionEvent>(&payload) {
                                Ok(evt) => {
                                    let new_version = versions.increment(&evt.tenant);
                                    tracing::debug!(tenant = %evt.tenant, new_version, "cache version bumped");
                                }
                                Err(e) => {
                                    tracing::debug!(error = %e, payload, "cache-version subscriber: malformed payload ignored");
                                }
                            }
                        }
                        None => {
                            tracing::warn!("cache-version subscriber: stream ended, reconnecting");
                            break;
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn increment_is_monotone_and_atomic() {
        let v = TenantCacheVersion::new();
        assert_eq!(v.get("acme"), 0);
        assert_eq!(v.increment("acme"), 1);
        assert_eq!(v.increment("acme"), 2);
        assert_eq!(v.get("acme"), 2);
    }

    #[test]
    fn increment_on_blank_tenant_is_noop() {
        let v = TenantCacheVersion::new();
        assert_eq!(v.increment(""), 0);
        assert_eq!(v.increment("   "), 0);
        assert_eq!(v.get(""), 0);
    }

    #[test]
    fn tenants_are_independent() {
        let v = TenantCacheVersion::new();
        v.increment("acme");
        v.increment("acme");
        v.increment("globex");
        assert_eq!(v.get("acme"), 2);
        assert_eq!(v.get("globex"), 1);
    }

    #[test]
    fn clone_shares_the_same_table() {
        let v = TenantCacheVersion::new();
        let v2 = v.clone();
        v.increment("acme");
        assert_eq!(v2.get("acme"), 1);
    }
}

//! Dynamic output cache: Redis-backed response caching keyed by tenant,
//! cache-policy id, and per-tenant cache-version token, with conditional
//! request support via weak ETags (spec §4.1.3).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::hashing::{etag_matches, sha256_hex, weak_etag};

/// A cached response body plus the headers needed to replay it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub etag: String,
    pub cached_at: DateTime<Utc>,
}

impl CachedResponse {
    pub fn new(status: u16, headers: Vec<(String, String)>, body: Vec<u8>) -> Self {
        let etag = weak_etag(&body);
        Self { status, headers, body, etag, cached_at: Utc::now() }
    }

    /// Wrap this entry as a staleness envelope for the upstream-unavailable
    /// fallback path (spec §7: `{data, isStale, cachedAt, ageSeconds}`).
    /// `data` is the cached body parsed as JSON, falling back to `null` if
    /// the body isn't valid JSON.
    pub fn into_stale_envelope(self) -> StaleEnvelope<serde_json::Value> {
        let age_seconds = (Utc::now() - self.cached_at).num_seconds().max(0);
        let data = serde_json::from_slice(&self.body).unwrap_or(serde_json::Value::Null);
        StaleEnvelope { data, is_stale: true, cached_at: self.cached_at, age_seconds }
    }
}

/// Envelope wrapping data served from cache while the backing upstream is
/// unavailable (circuit breaker open). Writes never produce this envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaleEnvelope<T> {
    pub data: T,
    pub is_stale: bool,
    pub cached_at: DateTime<Utc>,
    pub age_seconds: i64,
}

/// Inputs that select a cache entry: everything the matched cache policy's
/// vary-by rules say should participate in the key.
#[derive(Debug, Clone)]
pub struct CacheKeyInput<'a> {
    pub tenant: &'a str,
    pub policy_id: &'a str,
    pub cache_version: u64,
    pub method: &'a str,
    pub path: &'a str,
    pub query: Option<&'a str>,
    pub host: Option<&'a str>,
    pub vary_headers: &'a [(String, String)],
}

/// Build the Redis key for one cache lookup: the configured prefix, tenant,
/// policy id, cache-version token, and a digest of the varying inputs. The
/// cache-version token is part of the key itself (not a value checked after
/// lookup) so a version bump naturally orphans old entries without an
/// explicit invalidation sweep.
pub fn cache_key(prefix: &str, input: &CacheKeyInput<'_>) -> String {
    let mut fingerprint = format!("{}\n{}\n{}", input.method, input.path, input.query.unwrap_or(""));
    if let Some(host) = input.host {
        fingerprint.push('\n');
        fingerprint.push_str(host);
    }
    for (name, value) in input.vary_headers {
        fingerprint.push('\n');
        fingerprint.push_str(name);
        fingerprint.push(':');
        fingerprint.push_str(value);
    }
    let digest = sha256_hex(fingerprint.as_bytes());
    format!(
        "{prefix}{tenant}:{policy}:{version}:{digest}",
        prefix = prefix,
        tenant = input.tenant,
        policy = input.policy_id,
        version = input.cache_version,
    )
}

/// Outcome of evaluating a conditional request (`If-None-Match`/`If-Match`)
/// against a cached or freshly computed ETag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionalOutcome {
    /// Serve the full body.
    Serve,
    /// `If-None-Match` matched a GET/HEAD — respond 304 with no body.
    NotModified,
    /// `If-Match` failed on a mutating request — respond 412.
    PreconditionFailed,
}

/// Evaluate `if_none_match`/`if_match` against `current_etag`. `is_safe`
/// distinguishes GET/HEAD (where `If-None-Match` yields 304) from mutating
/// methods (where `If-Match` failure yields 412).
pub fn evaluate_conditional(
    current_etag: &str,
    if_none_match: Option<&str>,
    if_match: Option<&str>,
    is_safe: bool,
) -> ConditionalOutcome {
    if is_safe {
        if let Some(candidate) = if_none_match {
            if candidate == "*" || etag_matches(candidate, current_etag) {
                return ConditionalOutcome::NotModified;
            }
        }
    } else if let Some(candidate) = if_match {
        if candidate != "*" && !etag_matches(candidate, current_etag) {
            return ConditionalOutcome::PreconditionFailed;
        }
    }
    ConditionalOutcome::Serve
}

/// Storage backend for cached entries. A Redis implementation is the
/// production backend (feature `cache`); tests use an in-memory stand-in.
#[async_trait::async_trait]
pub trait OutputCacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Option<CachedResponse>;
    async fn put(&self, key: &str, value: &CachedResponse, ttl_secs: u64);
}

#[cfg(feature = "cache")]
pub mod redis_store {
    use super::*;
    use deadpool_redis::{redis::AsyncCommands, Pool};

    pub struct RedisOutputCacheStore {
        pool: Pool,
    }

    impl RedisOutputCacheStore {
        pub fn new(pool: Pool) -> Self {
            Self { pool }
        }
    }

    #[async_trait::async_trait]
    impl OutputCacheStore for RedisOutputCacheStore {
        async fn get(&self, key: &str) -> Option<CachedResponse> {
            let mut conn = self.pool.get().await.ok()?;
            let raw: Option<Vec<u8>> = conn.get(key).await.ok()?;
            raw.and_then(|bytes| serde_json::from_slice(&bytes).ok())
        }

        async fn put(&self, key: &str, value: &CachedResponse, ttl_secs: u64) {
            let Ok(mut conn) = self.pool.get().await else { return };
            let Ok(bytes) = serde_json::to_vec(value) else { return };
            if ttl_secs == 0 {
                let _: Result<(), _> = conn.set(key, bytes).await;
            } else {
                let _: Result<(), _> = conn.set_ex(key, bytes, ttl_secs).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::collections::HashMap;

    struct MemoryStore(Mutex<HashMap<String, CachedResponse>>);

    #[async_trait::async_trait]
    impl OutputCacheStore for MemoryStore {
        async fn get(&self, key: &str) -> Option<CachedResponse> {
            self.0.lock().unwrap().get(key).cloned()
        }
        async fn put(&self, key: &str, value: &CachedResponse, _ttl_secs: u64) {
            self.0.lock().unwrap().insert(key.to_string(), value.clone());
        }
    }

    fn input<'a>(tenant: &'a str, policy_id: &'a str, version: u64, path: &'a str) -> CacheKeyInput<'a> {
        CacheKeyInput {
            tenant,
            policy_id,
            cache_version: version,
            method: "GET",
            path,
            query: None,
            host: None,
            vary_headers: &[],
        }
    }

    #[test]
    fn cache_key_changes_with_version() {
        let k1 = cache_key("tansu:output-cache:", &input("acme", "cache-1", 1, "/x"));
        let k2 = cache_key("tansu:output-cache:", &input("acme", "cache-1", 2, "/x"));
        assert_ne!(k1, k2);
    }

    #[test]
    fn cache_key_changes_with_tenant_and_path() {
        let base = input("acme", "cache-1", 1, "/x");
        let other_tenant = input("other", "cache-1", 1, "/x");
        let other_path = input("acme", "cache-1", 1, "/y");
        assert_ne!(
            cache_key("p:", &base),
            cache_key("p:", &other_tenant)
        );
        assert_ne!(cache_key("p:", &base), cache_key("p:", &other_path));
    }

    #[test]
    fn conditional_get_returns_not_modified_on_match() {
        let body = b"hello".to_vec();
        let resp = CachedResponse::new(200, vec![], body);
        let outcome = evaluate_conditional(&resp.etag, Some(&resp.etag), None, true);
        assert_eq!(outcome, ConditionalOutcome::NotModified);
    }

    #[test]
    fn conditional_get_serves_on_mismatch() {
        let resp = CachedResponse::new(200, vec![], b"hello".to_vec());
        let outcome = evaluate_conditional(&resp.etag, Some("W/\"stale\""), None, true);
        assert_eq!(outcome, ConditionalOutcome::Serve);
    }

    #[test]
    fn conditional_put_fails_precondition_on_mismatch() {
        let resp = CachedResponse::new(200, vec![], b"hello".to_vec());
        let outcome = evaluate_conditional(&resp.etag, None, Some("W/\"stale\""), false);
        assert_eq!(outcome, ConditionalOutcome::PreconditionFailed);
    }

    #[test]
    fn wildcard_if_none_match_always_matches() {
        let resp = CachedResponse::new(200, vec![], b"hello".to_vec());
        let outcome = evaluate_conditional(&resp.etag, Some("*"), None, true);
        assert_eq!(outcome, ConditionalOutcome::NotModified);
    }

    #[test]
    fn stale_envelope_carries_age_and_parsed_body() {
        let resp = CachedResponse::new(200, vec![], br#"{"ok":true}"#.to_vec());
        let envelope = resp.into_stale_envelope();
        assert!(envelope.is_stale);
        assert_eq!(envelope.data, serde_json::json!({"ok": true}));
        assert!(envelope.age_seconds >= 0);
    }

    #[test]
    fn stale_envelope_falls_back_to_null_for_non_json_body() {
        let resp = CachedResponse::new(200, vec![], b"not json".to_vec());
        let envelope = resp.into_stale_envelope();
        assert_eq!(envelope.data, serde_json::Value::Null);
    }

    #[tokio::test]
    async fn memory_store_roundtrips() {
        let store = MemoryStore(Mutex::new(HashMap::new()));
        let resp = CachedResponse::new(200, vec![("content-type".to_string(), "text/plain".to_string())], b"body".to_vec());
        store.put("k1", &resp, 60).await;
        let got = store.get("k1").await.expect("present");
        assert_eq!(got.etag, resp.etag);
    }
}

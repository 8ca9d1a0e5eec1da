//! Redis-backed rate limiting with per-plan limits and a rejection
//! aggregator, the gateway's last policy-enforcement stage before the
//! dynamic output cache (spec: rate-limit rejection aggregation).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[cfg(feature = "cache")]
use deadpool_redis::Pool as RedisPool;
#[cfg(feature = "cache")]
use std::ops::DerefMut;

use axum::{
    body::Body,
    extract::{Request, State},
    middleware::Next,
    response::Response,
};

use crate::error::Error;

#[cfg(feature = "cache")]
use crate::middleware::Claims;

#[cfg(feature = "cache")]
use tracing::warn;

/// Requests-per-window limits, keyed by subscription plan. `default_rpm`
/// applies when a token carries no `plan` claim or an unrecognized one.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub window_secs: u64,
    pub default_rpm: u32,
    pub plan_rpm: HashMap<String, u32>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self { window_secs: 60, default_rpm: 200, plan_rpm: HashMap::new() }
    }
}

impl RateLimitConfig {
    pub fn limit_for_plan(&self, plan: Option<&str>) -> u32 {
        plan.and_then(|p| self.plan_rpm.get(p)).copied().unwrap_or(self.default_rpm)
    }
}

/// Counts requests rejected by the rate limiter since process start, so an
/// admin endpoint can report rejection volume without a metrics backend.
#[derive(Debug, Default)]
pub struct RejectionCounter(AtomicU64);

impl RejectionCounter {
    pub fn record(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Clone)]
pub struct RateLimit {
    config: RateLimitConfig,
    rejections: Arc<RejectionCounter>,
    #[cfg(feature = "cache")]
    redis_pool: Option<RedisPool>,
}

impl RateLimit {
    #[cfg(feature = "cache")]
    pub fn new(config: RateLimitConfig, redis_pool: RedisPool) -> Self {
        Self { config, rejections: Arc::new(RejectionCounter::default()), redis_pool: Some(redis_pool) }
    }

    #[cfg(not(feature = "cache"))]
    pub fn new(config: RateLimitConfig) -> Self {
        Self { config, rejections: Arc::new(RejectionCounter::default()) }
    }

    pub fn rejected_count(&self) -> u64 {
        self.rejections.snapshot()
    }

    pub async fn middleware(
        #[cfg_attr(not(feature = "cache"), allow(unused_variables))] State(rate_limit): State<Self>,
        request: Request<Body>,
        next: Next,
    ) -> Result<Response, Error> {
        #[cfg(feature = "cache")]
        {
            let claims = request.extensions().get::<Claims>().cloned();
            if let Some(claims) = claims {
                rate_limit.check_rate_limit(&claims).await?;
            } else {
                warn!("rate limit middleware invoked without verified claims");
            }
        }

        Ok(next.run(request).await)
    }

    #[cfg(feature = "cache")]
    async fn check_rate_limit(&self, claims: &Claims) -> Result<(), Error> {
        let redis_pool = self.redis_pool.as_ref().ok_or_else(|| Error::Internal("redis pool not configured".to_string()))?;
        let mut conn = redis_pool.get().await.map_err(|e| {
            Error::Redis(Box::new(redis::RedisError::from((redis::ErrorKind::IoError, "redis pool get failed", e.to_string()))))
        })?;

        let scope = claims.tid.as_deref().unwrap_or("_platform");
        let key = format!("ratelimit:{scope}:{}", claims.sub);
        let limit = self.config.limit_for_plan(claims.plan.as_deref());

        let count: u32 = redis::cmd("INCR").arg(&key).query_async(conn.deref_mut()).await?;
        if count == 1 {
            let _: () = redis::cmd("EXPIRE").arg(&key).arg(self.config.window_secs as i64).query_async(conn.deref_mut()).await?;
        }

        if count > limit {
            self.rejections.record();
            warn!(subject = %claims.sub, tenant = scope, count, limit, "rate limit exceeded");
            return Err(Error::Forbidden("rate limit exceeded".to_string()));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_lookup_falls_back_to_default() {
        let mut plan_rpm = HashMap::new();
        plan_rpm.insert("pro".to_string(), 1000);
        let config = RateLimitConfig { window_secs: 60, default_rpm: 200, plan_rpm };

        assert_eq!(config.limit_for_plan(Some("pro")), 1000);
        assert_eq!(config.limit_for_plan(Some("free")), 200);
        assert_eq!(config.limit_for_plan(None), 200);
    }

    #[test]
    fn rejection_counter_accumulates() {
        let counter = RejectionCounter::default();
        assert_eq!(counter.snapshot(), 0);
        counter.record();
        counter.record();
        assert_eq!(counter.snapshot(), 2);
    }
}

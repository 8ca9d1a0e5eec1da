//! Pool-admin HTTP client (spec §4.2): idempotent `AddPool`/`RemovePool`,
//! `ListPools`, HTTP Basic auth with admin credentials.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::ProvisioningConfig;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolAdminOutcome {
    /// 2xx.
    Added,
    /// 409 — already exists, treated as success.
    AlreadyExists,
    /// 2xx on remove.
    Removed,
    /// 404 on remove — treated as success.
    AlreadyAbsent,
}

#[derive(Debug, Serialize)]
struct AddPoolRequest<'a> {
    database: &'a str,
    pool_size: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PoolInfo {
    pub database: String,
    pub pool_size: u32,
}

pub struct PoolAdminClient {
    base_url: String,
    user: Option<String>,
    password: Option<String>,
    client: reqwest::Client,
}

impl PoolAdminClient {
    pub fn new(config: &ProvisioningConfig) -> Self {
        Self {
            base_url: config.pool_admin_base_url.trim_end_matches('/').to_string(),
            user: config.pool_admin_user.clone(),
            password: config.pool_admin_password.clone(),
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .expect("reqwest client builds with a fixed timeout"),
        }
    }

    fn authed(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match (&self.user, &self.password) {
            (Some(u), p) => req.basic_auth(u, p.clone()),
            _ => req,
        }
    }

    /// Add a pool for `database`. 2xx → `Added`; 409 → `AlreadyExists`
    /// (treated as success); any other status is a logged failure.
    pub async fn add_pool(&self, database: &str, pool_size: u32) -> Result<PoolAdminOutcome> {
        let url = format!("{}/pools", self.base_url);
        let resp = self
            .authed(self.client.post(&url).json(&AddPoolRequest { database, pool_size }))
            .send()
            .await
            .map_err(|e| Error::upstream_unavailable(axum::http::StatusCode::BAD_GATEWAY, format!("pool-admin add_pool: {e}")))?;

        match resp.status().as_u16() {
            200..=299 => Ok(PoolAdminOutcome::Added),
            409 => Ok(PoolAdminOutcome::AlreadyExists),
            status => Err(Error::upstream_unavailable(
                axum::http::StatusCode::BAD_GATEWAY,
                format!("pool-admin add_pool returned {status}"),
            )),
        }
    }

    /// Remove the pool for `database`. 2xx or 404 → success.
    pub async fn remove_pool(&self, database: &str) -> Result<PoolAdminOutcome> {
        let url = format!("{}/pools/{database}", self.base_url);
        let resp = self
            .authed(self.client.delete(&url))
            .send()
            .await
            .map_err(|e| Error::upstream_unavailable(axum::http::StatusCode::BAD_GATEWAY, format!("pool-admin remove_pool: {e}")))?;

        match resp.status().as_u16() {
            200..=299 => Ok(PoolAdminOutcome::Removed),
            404 => Ok(PoolAdminOutcome::AlreadyAbsent),
            status => Err(Error::upstream_unavailable(
                axum::http::StatusCode::BAD_GATEWAY,
                format!("pool-admin remove_pool returned {status}"),
            )),
        }
    }

    pub async fn list_pools(&self) -> Result<Vec<PoolInfo>> {
        let url = format!("{}/pools", self.base_url);
        let resp = self
            .authed(self.client.get(&url))
            .send()
            .await
            .map_err(|e| Error::upstream_unavailable(axum::http::StatusCode::BAD_GATEWAY, format!("pool-admin list_pools: {e}")))?;

        if !resp.status().is_success() {
            return Err(Error::upstream_unavailable(
                axum::http::StatusCode::BAD_GATEWAY,
                format!("pool-admin list_pools returned {}", resp.status()),
            ));
        }
        resp.json::<Vec<PoolInfo>>()
            .await
            .map_err(|e| Error::Internal(format!("pool-admin list_pools decode: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> ProvisioningConfig {
        ProvisioningConfig {
            extension_allowlist: vec!["citus".into(), "vector".into()],
            pool_admin_base_url: "http://pgcat-admin.internal".to_string(),
            pool_admin_user: Some("admin".to_string()),
            pool_admin_password: Some("secret".to_string()),
            expected_schema_version: 1,
            skip_extension_update: false,
        }
    }

    #[test]
    fn client_trims_trailing_slash_from_base_url() {
        let mut cfg = test_config();
        cfg.pool_admin_base_url = "http://pgcat-admin.internal/".to_string();
        let client = PoolAdminClient::new(&cfg);
        assert_eq!(client.base_url, "http://pgcat-admin.internal");
    }
}

//! JWT claim verification (resource-server side only; the identity service
//! issues tokens, this crate only validates the contract it consumes).
//!
//! Access tokens carry `sub`, optional `tid`, `plan`, a space-separated
//! `scope` claim (or `scp`), and `aud` matching the service resource name
//! (`tansu.storage`, `tansu.db`, `tansu.identity`, ...). The audience check
//! is relaxed in [`Environment::Development`]; in `Production` the audience
//! MUST include the resource name, either as a bare string or as one entry
//! of a JSON array.

use axum::{
    body::Body,
    extract::{Request, State},
    http::HeaderMap,
    middleware::Next,
    response::Response,
};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{de::Deserializer, Deserialize, Serialize};
use std::{fs, sync::Arc};

#[cfg(feature = "cache")]
use async_trait::async_trait;

#[cfg(feature = "cache")]
use deadpool_redis::Pool as RedisPool;

use crate::{
    config::{Environment, JwtConfig},
    error::Error,
};

/// Scope granting every resource scope for a given token.
pub const ADMIN_FULL_SCOPE: &str = "admin.full";

/// `aud` may arrive as a bare string or as a JSON array of strings.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Audience {
    One(String),
    Many(Vec<String>),
}

impl Audience {
    pub fn contains(&self, resource: &str) -> bool {
        match self {
            Audience::One(s) => s == resource,
            Audience::Many(items) => items.iter().any(|s| s == resource),
        }
    }
}

impl<'de> Deserialize<'de> for Audience {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            One(String),
            Many(Vec<String>),
        }
        Ok(match Raw::deserialize(deserializer)? {
            Raw::One(s) => Audience::One(s),
            Raw::Many(v) => Audience::Many(v),
        })
    }
}

/// Verified token claims.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject: user id, service account id, or `client:{id}`.
    pub sub: String,

    /// Tenant id, absent for platform-scoped (non-tenant) tokens.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tid: Option<String>,

    /// Subscription plan, used by rate-limit and quota policies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<String>,

    /// Space-separated scopes, normalized to a `Vec` regardless of whether
    /// the issuer used the `scope` or `scp` claim name.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scope: Vec<String>,

    pub aud: Audience,
    pub exp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jti: Option<String>,

    /// Present only on impersonation tokens: the subject of the user who
    /// initiated the impersonation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub impersonated_by: Option<String>,
}

impl Claims {
    /// True if `scope` contains `required` or the blanket `admin.full` scope.
    pub fn has_scope(&self, required: &str) -> bool {
        self.scope.iter().any(|s| s == required || s == ADMIN_FULL_SCOPE)
    }

    pub fn is_impersonated(&self) -> bool {
        self.impersonated_by.is_some()
    }
}

/// Wire shape for decoding: accepts either a `scope` string or an `scp`
/// array, since different issuers use either convention.
#[derive(Deserialize)]
struct RawClaims {
    sub: String,
    #[serde(default)]
    tid: Option<String>,
    #[serde(default)]
    plan: Option<String>,
    #[serde(default)]
    scope: Option<String>,
    #[serde(default)]
    scp: Option<Vec<String>>,
    aud: Audience,
    exp: i64,
    #[serde(default)]
    iat: Option<i64>,
    #[serde(default)]
    iss: Option<String>,
    #[serde(default)]
    jti: Option<String>,
    #[serde(default)]
    impersonated_by: Option<String>,
}

impl From<RawClaims> for Claims {
    fn from(raw: RawClaims) -> Self {
        let scope = raw
            .scope
            .map(|s| s.split_whitespace().map(str::to_string).collect())
            .or(raw.scp)
            .unwrap_or_default();
        Claims {
            sub: raw.sub,
            tid: raw.tid,
            plan: raw.plan,
            scope,
            aud: raw.aud,
            exp: raw.exp,
            iat: raw.iat,
            iss: raw.iss,
            jti: raw.jti,
            impersonated_by: raw.impersonated_by,
        }
    }
}

/// Trait for JWT revocation storage (jti blocklist), consulted after claim
/// verification succeeds.
#[cfg(feature = "cache")]
#[async_trait]
pub trait JwtRevocation: Send + Sync {
    async fn is_revoked(&self, jti: &str) -> Result<bool, Error>;
    async fn revoke(&self, jti: &str, ttl_secs: u64) -> Result<(), Error>;
}

#[cfg(feature = "cache")]
#[derive(Clone)]
pub struct RedisJwtRevocation {
    pool: RedisPool,
}

#[cfg(feature = "cache")]
impl RedisJwtRevocation {
    pub fn new(pool: RedisPool) -> Self {
        Self { pool }
    }

    fn revocation_key(jti: &str) -> String {
        format!("jwt:revoked:{}", jti)
    }
}

#[cfg(feature = "cache")]
#[async_trait]
impl JwtRevocation for RedisJwtRevocation {
    async fn is_revoked(&self, jti: &str) -> Result<bool, Error> {
        use deadpool_redis::redis::AsyncCommands;
        let mut conn = self.pool.get().await.map_err(|e| Error::Internal(format!("redis connection: {e}")))?;
        let exists: bool = conn.exists(Self::revocation_key(jti)).await?;
        Ok(exists)
    }

    async fn revoke(&self, jti: &str, ttl_secs: u64) -> Result<(), Error> {
        use deadpool_redis::redis::AsyncCommands;
        let mut conn = self.pool.get().await.map_err(|e| Error::Internal(format!("redis connection: {e}")))?;
        conn.set_ex::<_, _, ()>(Self::revocation_key(jti), 1, ttl_secs).await?;
        Ok(())
    }
}

/// Shared JWT verification state, built once at startup.
#[derive(Clone)]
pub struct JwtAuth {
    decoding_key: Arc<DecodingKey>,
    validation: Validation,
    resource_name: String,
    environment: Environment,
    #[cfg(feature = "cache")]
    revocation: Option<Arc<dyn JwtRevocation>>,
}

impl JwtAuth {
    /// `resource_name` is this service's own audience value, e.g. `tansu.storage`.
    pub fn new(config: &JwtConfig, resource_name: impl Into<String>, environment: Environment) -> Result<Self, Error> {
        let public_key = fs::read(&config.public_key_path).map_err(|e| {
            Error::Config(Box::new(figment::Error::from(format!(
                "failed to read JWT public key from '{}': {e}",
                config.public_key_path.display()
            ))))
        })?;

        let algorithm = match config.algorithm.to_uppercase().as_str() {
            "RS256" => Algorithm::RS256,
            "RS384" => Algorithm::RS384,
            "RS512" => Algorithm::RS512,
            "ES256" => Algorithm::ES256,
            "ES384" => Algorithm::ES384,
            "HS256" => Algorithm::HS256,
            "HS384" => Algorithm::HS384,
            "HS512" => Algorithm::HS512,
            alg => {
                return Err(Error::Config(Box::new(figment::Error::from(format!(
                    "unsupported JWT algorithm: {alg}"
                )))))
            }
        };

        let decoding_key = match algorithm {
            Algorithm::RS256 | Algorithm::RS384 | Algorithm::RS512 => DecodingKey::from_rsa_pem(&public_key)?,
            Algorithm::ES256 | Algorithm::ES384 => DecodingKey::from_ec_pem(&public_key)?,
            _ => DecodingKey::from_secret(&public_key),
        };

        let mut validation = Validation::new(algorithm);
        if let Some(issuer) = &config.issuer {
            validation.set_issuer(&[issuer]);
        }
        // Audience is checked separately per `environment`, not by jsonwebtoken.
        validation.validate_aud = false;

        Ok(Self {
            decoding_key: Arc::new(decoding_key),
            validation,
            resource_name: resource_name.into(),
            environment,
            #[cfg(feature = "cache")]
            revocation: None,
        })
    }

    #[cfg(feature = "cache")]
    pub fn with_revocation<R: JwtRevocation + 'static>(mut self, revocation: R) -> Self {
        self.revocation = Some(Arc::new(revocation));
        self
    }

    /// Decode, verify signature/expiry, and enforce the audience contract.
    pub fn validate_token(&self, token: &str) -> Result<Claims, Error> {
        let token_data = decode::<RawClaims>(token, &self.decoding_key, &self.validation)?;
        let claims: Claims = token_data.claims.into();
        self.check_audience(&claims)?;
        Ok(claims)
    }

    /// In Development, a missing/mismatched audience is allowed through (with
    /// a log line) so local issuers that don't set `aud` still work. In
    /// Staging/Production the audience MUST include this service's resource
    /// name.
    fn check_audience(&self, claims: &Claims) -> Result<(), Error> {
        if claims.aud.contains(&self.resource_name) {
            return Ok(());
        }
        if self.environment.is_production() {
            return Err(Error::AuthRequired(format!(
                "token audience does not include required resource '{}'",
                self.resource_name
            )));
        }
        tracing::warn!(resource = %self.resource_name, "accepting token with non-matching audience outside production");
        Ok(())
    }

    pub fn extract_token(headers: &HeaderMap) -> Result<String, Error> {
        let auth_header = headers
            .get("Authorization")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| Error::AuthRequired("missing Authorization header".to_string()))?;

        auth_header
            .strip_prefix("Bearer ")
            .map(str::to_string)
            .ok_or_else(|| Error::AuthRequired("invalid Authorization header format".to_string()))
    }

    /// Axum middleware: validate the bearer token, check jti revocation if
    /// configured, and inject [`Claims`] into request extensions.
    pub async fn middleware(State(auth): State<Self>, mut request: Request<Body>, next: Next) -> Result<Response, Error> {
        let token = Self::extract_token(request.headers())?;
        let claims = auth.validate_token(&token)?;

        #[cfg(feature = "cache")]
        if let Some(revocation) = &auth.revocation {
            if let Some(jti) = &claims.jti {
                if revocation.is_revoked(jti).await? {
                    return Err(Error::AuthRequired("token has been revoked".to_string()));
                }
            } else {
                tracing::warn!("JWT revocation is enabled but token has no jti claim");
            }
        }

        request.extensions_mut().insert(claims);
        Ok(next.run(request).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claims(scope: &[&str]) -> Claims {
        Claims {
            sub: "user:123".to_string(),
            tid: Some("acme".to_string()),
            plan: None,
            scope: scope.iter().map(|s| s.to_string()).collect(),
            aud: Audience::One("tansu.storage".to_string()),
            exp: 0,
            iat: None,
            iss: None,
            jti: None,
            impersonated_by: None,
        }
    }

    #[test]
    fn has_scope_matches_exact_or_admin_full() {
        let c = claims(&["storage.read"]);
        assert!(c.has_scope("storage.read"));
        assert!(!c.has_scope("storage.write"));

        let admin = claims(&[ADMIN_FULL_SCOPE]);
        assert!(admin.has_scope("storage.write"));
    }

    #[test]
    fn audience_array_contains_resource() {
        let aud = Audience::Many(vec!["tansu.db".to_string(), "tansu.storage".to_string()]);
        assert!(aud.contains("tansu.storage"));
        assert!(!aud.contains("tansu.identity"));
    }

    #[test]
    fn raw_claims_fold_scope_string_and_scp_array() {
        let from_scope = RawClaims {
            sub: "u".into(),
            tid: None,
            plan: None,
            scope: Some("a b c".into()),
            scp: None,
            aud: Audience::One("tansu.storage".into()),
            exp: 0,
            iat: None,
            iss: None,
            jti: None,
            impersonated_by: None,
        };
        let claims: Claims = from_scope.into();
        assert_eq!(claims.scope, vec!["a", "b", "c"]);

        let from_scp = RawClaims {
            sub: "u".into(),
            tid: None,
            plan: None,
            scope: None,
            scp: Some(vec!["x".into(), "y".into()]),
            aud: Audience::One("tansu.storage".into()),
            exp: 0,
            iat: None,
            iss: None,
            jti: None,
            impersonated_by: None,
        };
        let claims: Claims = from_scp.into();
        assert_eq!(claims.scope, vec!["x", "y"]);
    }

    #[test]
    fn extract_token_requires_bearer_scheme() {
        let mut headers = HeaderMap::new();
        headers.insert("Authorization", "Basic xyz".parse().unwrap());
        assert!(JwtAuth::extract_token(&headers).is_err());

        headers.insert("Authorization", "Bearer abc.def.ghi".parse().unwrap());
        assert_eq!(JwtAuth::extract_token(&headers).unwrap(), "abc.def.ghi");
    }
}

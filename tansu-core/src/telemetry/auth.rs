//! Admin authentication for the telemetry admin surface: a static API key
//! accepted either as a bearer token or via a session cookie minted after
//! posting the key to `/login` (spec §4.5).

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use rand::RngCore;

use crate::hashing::constant_time_eq;

/// Reason codes the well-known login path redirects with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginFailureReason {
    MissingSession,
    InvalidSession,
    InvalidAuthorizationHeader,
}

impl LoginFailureReason {
    pub fn as_query_value(&self) -> &'static str {
        match self {
            LoginFailureReason::MissingSession => "MissingSession",
            LoginFailureReason::InvalidSession => "InvalidSession",
            LoginFailureReason::InvalidAuthorizationHeader => "InvalidAuthorizationHeader",
        }
    }
}

/// An opaque session token with server-side expiry tracking. The cookie
/// itself carries only the token; `SessionStore` holds the expiry.
#[derive(Clone)]
pub struct SessionStore {
    sessions: Arc<DashMap<String, Instant>>,
    ttl: Duration,
}

impl SessionStore {
    pub fn new(ttl: Duration) -> Self {
        Self { sessions: Arc::new(DashMap::new()), ttl }
    }

    /// Mint a new session token valid for `ttl` from now.
    pub fn mint(&self) -> String {
        let mut raw = [0u8; 32];
        rand::rng().fill_bytes(&mut raw);
        let token = hex::encode(raw);
        self.sessions.insert(token.clone(), Instant::now() + self.ttl);
        token
    }

    /// `true` if `token` is a live, unexpired session.
    pub fn is_valid(&self, token: &str) -> bool {
        let live = matches!(self.sessions.get(token), Some(expiry) if *expiry > Instant::now());
        if !live {
            self.sessions.remove(token);
        }
        live
    }

    pub fn revoke(&self, token: &str) {
        self.sessions.remove(token);
    }
}

/// `Authorization: Bearer <key>` compared in constant time against the
/// configured admin API key.
pub fn accepts_bearer(authorization_header: Option<&str>, admin_api_key: &str) -> Result<(), LoginFailureReason> {
    let Some(header) = authorization_header else { return Err(LoginFailureReason::MissingSession) };
    let Some(token) = header.strip_prefix("Bearer ") else {
        return Err(LoginFailureReason::InvalidAuthorizationHeader);
    };
    if constant_time_eq(token, admin_api_key) {
        Ok(())
    } else {
        Err(LoginFailureReason::InvalidAuthorizationHeader)
    }
}

/// Accept the key posted to `/login`, mint a session, and return the
/// cookie value to set. Cookie attributes (`HttpOnly`, `Secure` iff the
/// request arrived over HTTPS, `SameSite=Strict`, `Max-Age` from
/// `session_ttl_secs`) are applied by the caller when building the
/// response header — this just validates the key and mints the token.
pub fn login(submitted_key: &str, admin_api_key: &str, sessions: &SessionStore) -> Option<String> {
    if constant_time_eq(submitted_key, admin_api_key) {
        Some(sessions.mint())
    } else {
        None
    }
}

/// Validate a session cookie value.
pub fn accepts_session_cookie(cookie_value: Option<&str>, sessions: &SessionStore) -> Result<(), LoginFailureReason> {
    let Some(token) = cookie_value else { return Err(LoginFailureReason::MissingSession) };
    if sessions.is_valid(token) {
        Ok(())
    } else {
        Err(LoginFailureReason::InvalidSession)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bearer_accepts_matching_key() {
        assert!(accepts_bearer(Some("Bearer secret-key"), "secret-key").is_ok());
    }

    #[test]
    fn bearer_rejects_mismatched_key() {
        assert_eq!(accepts_bearer(Some("Bearer wrong"), "secret-key"), Err(LoginFailureReason::InvalidAuthorizationHeader));
    }

    #[test]
    fn bearer_rejects_missing_header() {
        assert_eq!(accepts_bearer(None, "secret-key"), Err(LoginFailureReason::MissingSession));
    }

    #[test]
    fn bearer_rejects_non_bearer_scheme() {
        assert_eq!(accepts_bearer(Some("Basic abc"), "secret-key"), Err(LoginFailureReason::InvalidAuthorizationHeader));
    }

    #[test]
    fn login_mints_a_usable_session() {
        let store = SessionStore::new(Duration::from_secs(60));
        let token = login("secret-key", "secret-key", &store).unwrap();
        assert!(accepts_session_cookie(Some(&token), &store).is_ok());
    }

    #[test]
    fn login_rejects_wrong_key() {
        let store = SessionStore::new(Duration::from_secs(60));
        assert!(login("wrong", "secret-key", &store).is_none());
    }

    #[test]
    fn expired_session_is_rejected() {
        let store = SessionStore::new(Duration::from_millis(10));
        let token = store.mint();
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(accepts_session_cookie(Some(&token), &store), Err(LoginFailureReason::InvalidSession));
    }

    #[test]
    fn unknown_session_is_rejected() {
        let store = SessionStore::new(Duration::from_secs(60));
        assert_eq!(accepts_session_cookie(Some("unknown"), &store), Err(LoginFailureReason::InvalidSession));
    }
}

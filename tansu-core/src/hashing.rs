//! Weak ETag, idempotency-key and HMAC helpers.
//!
//! Every caller that needs a content fingerprint, a dedupe key, or a signed
//! token goes through here so the same SHA-256/HMAC-SHA256 primitives and
//! encodings (hex, base64, constant-time compare) are used crate-wide.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// SHA-256 digest of `bytes`, hex-encoded.
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// SHA-256 digest of `bytes`, base64-encoded (standard alphabet, padded).
pub fn sha256_base64(bytes: &[u8]) -> String {
    BASE64.encode(Sha256::digest(bytes))
}

/// A weak ETag per RFC 7232 §2.3: `W/"<base64(sha256(bytes))>"`.
pub fn weak_etag(bytes: &[u8]) -> String {
    format!("W/\"{}\"", sha256_base64(bytes))
}

/// Compare a client-supplied `If-Match`/`If-None-Match` value against a
/// computed weak ETag. Weak comparison ignores the `W/` prefix per spec;
/// byte comparison of the quoted value is constant-time to avoid timing
/// side channels on cache keys derived from tenant-controlled data.
pub fn etag_matches(candidate: &str, current: &str) -> bool {
    let strip = |s: &str| s.strip_prefix("W/").unwrap_or(s).trim_matches('"').to_string();
    let a = strip(candidate);
    let b = strip(current);
    a.len() == b.len() && bool::from(a.as_bytes().ct_eq(b.as_bytes()))
}

/// Stable idempotency key: SHA-256 hex of the natural-key tuple, joined with
/// a separator that cannot appear in any individual component's rendering
/// (components are rendered with their own `:`-free type, so plain `|` is
/// unambiguous here).
pub fn idempotency_key(parts: &[&str]) -> String {
    sha256_hex(parts.join("|").as_bytes())
}

/// HMAC-SHA256 signature, hex-encoded. Used for presigned storage URLs.
pub fn hmac_sign(secret: &[u8], message: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts a key of any length");
    mac.update(message);
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time verification of an HMAC-SHA256 signature.
pub fn hmac_verify(secret: &[u8], message: &[u8], signature_hex: &str) -> bool {
    let Ok(expected_bytes) = hex::decode(signature_hex) else { return false };
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts a key of any length");
    mac.update(message);
    mac.verify_slice(&expected_bytes).is_ok()
}

/// Constant-time string equality, used for bearer/API-key comparisons.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    a.len() == b.len() && bool::from(a.as_bytes().ct_eq(b.as_bytes()))
}

/// HMAC-SHA256 hex pseudonymization of a tenant id or client IP for the log
/// reporter's outbound payloads, keyed by a per-deployment salt so the same
/// raw value always pseudonymizes to the same token within one deployment
/// but cannot be correlated across deployments.
pub fn pseudonymize(salt: &[u8], value: &str) -> String {
    hmac_sign(salt, value.as_bytes())
}

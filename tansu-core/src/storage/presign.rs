//! Presigned URL canonicalization, HMAC-SHA256 signing and verification
//! (spec §4.7.5).

use crate::error::{Error, Result};
use crate::hashing::hmac_verify;

/// The operation a presigned URL authorizes.
#[derive(Debug, Clone)]
pub enum PresignedOp {
    /// A plain object verb: GET/PUT/HEAD/DELETE.
    Object {
        method: String,
        bucket: String,
        key: String,
        expires_unix: i64,
        max_bytes: Option<u64>,
        content_type: Option<String>,
    },
    /// An image transform read.
    Transform {
        bucket: String,
        key: String,
        width: Option<u32>,
        height: Option<u32>,
        format: Option<String>,
        quality: Option<u32>,
        expires_unix: i64,
    },
}

impl PresignedOp {
    fn expires_unix(&self) -> i64 {
        match self {
            PresignedOp::Object { expires_unix, .. } => *expires_unix,
            PresignedOp::Transform { expires_unix, .. } => *expires_unix,
        }
    }
}

fn opt_to_string<T: ToString>(v: &Option<T>) -> String {
    v.as_ref().map(ToString::to_string).unwrap_or_default()
}

/// Newline-joined canonical string per spec §4.7.5. Exact field order and
/// presence matter — this is what both signer and verifier hash.
pub fn canonical_string(tenant: &str, op: &PresignedOp) -> String {
    match op {
        PresignedOp::Object { method, bucket, key, expires_unix, max_bytes, content_type } => [
            tenant.to_string(),
            method.clone(),
            bucket.clone(),
            key.clone(),
            expires_unix.to_string(),
            opt_to_string(max_bytes),
            content_type.clone().unwrap_or_default(),
        ]
        .join("\n"),
        PresignedOp::Transform { bucket, key, width, height, format, quality, expires_unix } => [
            tenant.to_string(),
            "TRANSFORM".to_string(),
            bucket.clone(),
            key.clone(),
            opt_to_string(width),
            opt_to_string(height),
            format.clone().unwrap_or_default(),
            opt_to_string(quality),
            expires_unix.to_string(),
        ]
        .join("\n"),
    }
}

/// Sign `op` for `tenant` with `secret`, returning the hex HMAC-SHA256
/// signature. An empty secret never produces a signature anything can
/// validate against — callers must reject presigning when unconfigured.
pub fn sign(secret: &[u8], tenant: &str, op: &PresignedOp) -> Result<String> {
    if secret.is_empty() {
        return Err(Error::Internal("presign secret is not configured".to_string()));
    }
    Ok(crate::hashing::hmac_sign(secret, canonical_string(tenant, op).as_bytes()))
}

/// Validate `signature` against the recomputed canonical string and check
/// expiry against `now_unix`. Constant-time comparison throughout.
pub fn verify(secret: &[u8], tenant: &str, op: &PresignedOp, now_unix: i64, signature: &str) -> Result<()> {
    if secret.is_empty() {
        return Err(Error::Forbidden("no valid presigned-url signature exists without a configured secret".to_string()));
    }
    if now_unix > op.expires_unix() {
        return Err(Error::Forbidden("presigned url has expired".to_string()));
    }
    let message = canonical_string(tenant, op);
    if !hmac_verify(secret, message.as_bytes(), signature) {
        return Err(Error::Forbidden("presigned url signature mismatch".to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn object_op() -> PresignedOp {
        PresignedOp::Object {
            method: "GET".to_string(),
            bucket: "b1".to_string(),
            key: "a/b.txt".to_string(),
            expires_unix: 1_700_000_000,
            max_bytes: None,
            content_type: None,
        }
    }

    #[test]
    fn canonical_string_has_seven_lines_for_object_ops() {
        let s = canonical_string("acme", &object_op());
        assert_eq!(s.lines().count(), 7);
    }

    #[test]
    fn canonical_string_has_nine_lines_for_transform_ops() {
        let op = PresignedOp::Transform {
            bucket: "b1".to_string(),
            key: "img.png".to_string(),
            width: Some(200),
            height: None,
            format: Some("webp".to_string()),
            quality: None,
            expires_unix: 1_700_000_000,
        };
        let s = canonical_string("acme", &op);
        assert_eq!(s.lines().count(), 9);
    }

    #[test]
    fn sign_and_verify_round_trip() {
        let secret = b"presign-secret";
        let op = object_op();
        let sig = sign(secret, "acme", &op).unwrap();
        assert!(verify(secret, "acme", &op, 1_699_999_999, &sig).is_ok());
    }

    #[test]
    fn verify_rejects_after_expiry() {
        let secret = b"presign-secret";
        let op = object_op();
        let sig = sign(secret, "acme", &op).unwrap();
        assert!(verify(secret, "acme", &op, 1_700_000_001, &sig).is_err());
    }

    #[test]
    fn verify_rejects_tampered_signature() {
        let secret = b"presign-secret";
        let op = object_op();
        let sig = sign(secret, "acme", &op).unwrap();
        let mut tampered = sig.clone();
        tampered.replace_range(0..2, "00");
        assert!(verify(secret, "acme", &op, 1_699_999_999, &tampered).is_err());
    }

    #[test]
    fn empty_secret_never_validates() {
        let op = object_op();
        assert!(sign(b"", "acme", &op).is_err());
        assert!(verify(b"", "acme", &op, 1_699_999_999, "deadbeef").is_err());
    }
}

//! Response compression for storage reads: Brotli over an allowlisted set
//! of MIME types, applied only when the client's `Accept-Encoding` permits
//! and the object's ETag is weak (so re-encoding never invalidates it) —
//! spec §4.7.7.

/// Whether `content_type` is eligible for compression under `allowlist`.
/// Matches the MIME type without parameters (`;charset=...` etc).
pub fn is_compressible(content_type: &str, allowlist: &[String]) -> bool {
    let base = content_type.split(';').next().unwrap_or(content_type).trim();
    allowlist.iter().any(|a| a.eq_ignore_ascii_case(base))
}

/// Whether the client's `Accept-Encoding` header permits Brotli.
pub fn accepts_brotli(accept_encoding: &str) -> bool {
    accept_encoding.split(',').any(|tok| tok.split(';').next().unwrap_or("").trim().eq_ignore_ascii_case("br"))
}

/// Decide whether to compress a response. Weak ETags are stable across
/// `Content-Encoding` changes (the encoding is a representation detail, not
/// a change in selected content), so compression never rewrites the ETag.
pub fn should_compress(content_type: &str, allowlist: &[String], accept_encoding: &str, etag_is_weak: bool) -> bool {
    etag_is_weak && is_compressible(content_type, allowlist) && accepts_brotli(accept_encoding)
}

/// Brotli-compress `bytes` at `level` (0-11).
pub fn compress_brotli(bytes: &[u8], level: u32) -> Vec<u8> {
    let mut out = Vec::new();
    let params = brotli::enc::BrotliEncoderParams {
        quality: level.min(11) as i32,
        ..Default::default()
    };
    let mut reader = std::io::Cursor::new(bytes);
    brotli::BrotliCompress(&mut reader, &mut out, &params).expect("in-memory brotli compression cannot fail");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_type_matches_ignoring_parameters() {
        let allow = vec!["application/json".to_string()];
        assert!(is_compressible("application/json; charset=utf-8", &allow));
        assert!(!is_compressible("image/png", &allow));
    }

    #[test]
    fn accept_encoding_parses_multiple_tokens() {
        assert!(accepts_brotli("gzip, br, deflate"));
        assert!(!accepts_brotli("gzip, deflate"));
    }

    #[test]
    fn should_compress_requires_weak_etag() {
        let allow = vec!["text/plain".to_string()];
        assert!(!should_compress("text/plain", &allow, "br", false));
        assert!(should_compress("text/plain", &allow, "br", true));
    }

    #[test]
    fn brotli_round_trips_via_decompress() {
        let compressed = compress_brotli(b"hello world hello world hello world", 5);
        assert!(!compressed.is_empty());
        let mut out = Vec::new();
        brotli::BrotliDecompress(&mut std::io::Cursor::new(compressed), &mut out).unwrap();
        assert_eq!(out, b"hello world hello world hello world");
    }
}

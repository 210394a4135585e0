//! HMAC-SHA256 request signatures.
//!
//! Signer and verifier must build the canonical message byte-for-byte alike:
//!
//! ```text
//! method=POST;path=/heartbeat;ts=1700000000;nonce=abc;body_sha256=<b64url sha256(body)>
//! ```

use base64::{engine::general_purpose, Engine as _};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use std::borrow::Cow;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Unpadded base64url SHA-256 digest of the raw body bytes.
pub fn body_digest(body: &[u8]) -> String {
    general_purpose::URL_SAFE_NO_PAD.encode(Sha256::digest(body))
}

/// Build the canonical message covered by the signature.
///
/// `path` is the request path including its query string, with the mount
/// prefix already removed (see [`strip_mount_prefix`]).
pub fn canonical_message(method: &str, path: &str, ts: &str, nonce: &str, body: &[u8]) -> String {
    format!(
        "method={};path={};ts={};nonce={};body_sha256={}",
        method.to_ascii_uppercase(),
        path,
        ts,
        nonce,
        body_digest(body)
    )
}

/// Sign a canonical message, returning the unpadded base64url MAC.
pub fn sign(secret: &str, canonical: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(canonical.as_bytes());
    general_purpose::URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes())
}

/// Compare two encoded signatures without leaking where they differ.
///
/// A length mismatch returns early; it reveals nothing about the content.
pub fn signatures_match(expected: &str, provided: &str) -> bool {
    let expected = expected.as_bytes();
    let provided = provided.as_bytes();
    if expected.len() != provided.len() {
        return false;
    }
    bool::from(expected.ct_eq(provided))
}

/// Extract the credential from an `Authorization: Bearer <value>` header.
///
/// The scheme is matched case-insensitively and any run of whitespace may
/// separate it from the value.
pub fn parse_bearer(header: &str) -> Option<&str> {
    let header = header.trim();
    let split = header.find(char::is_whitespace)?;
    let (scheme, rest) = header.split_at(split);
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let value = rest.trim_start();
    if value.is_empty() || value.contains(char::is_whitespace) {
        return None;
    }
    Some(value)
}

/// Remove the mount prefix from a path-and-query, on a segment boundary only.
///
/// `/api/heartbeat?x=1` with prefix `/api` becomes `/heartbeat?x=1`, while
/// `/apiary` is left alone.
pub fn strip_mount_prefix<'a>(path_and_query: &'a str, prefix: &str) -> Cow<'a, str> {
    if prefix.is_empty() {
        return Cow::Borrowed(path_and_query);
    }
    match path_and_query.strip_prefix(prefix) {
        Some(rest) if rest.starts_with('/') => Cow::Borrowed(rest),
        // Bare prefix: keep the path absolute
        Some(rest) if rest.is_empty() || rest.starts_with('?') => Cow::Owned(format!("/{}", rest)),
        _ => Cow::Borrowed(path_and_query),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "0123456789abcdef0123456789abcdef";

    #[test]
    fn test_body_digest_of_empty_body() {
        // sha256("") = e3b0c442...b855
        assert_eq!(body_digest(b""), "47DEQpj8HBSa-_TImW-5JCeuQeRkm5NMpJWZG3hSuFU");
    }

    #[test]
    fn test_canonical_message_layout() {
        let msg = canonical_message("post", "/heartbeat?src=wan", "1700000000", "n-1", b"");
        assert_eq!(
            msg,
            "method=POST;path=/heartbeat?src=wan;ts=1700000000;nonce=n-1;\
             body_sha256=47DEQpj8HBSa-_TImW-5JCeuQeRkm5NMpJWZG3hSuFU"
        );
    }

    #[test]
    fn test_sign_is_deterministic_and_unpadded() {
        let msg = canonical_message("POST", "/heartbeat", "1700000000", "abc", b"{}");
        let a = sign(SECRET, &msg);
        let b = sign(SECRET, &msg);
        assert_eq!(a, b);
        assert_eq!(a.len(), 43); // 32 bytes, base64url without padding
        assert!(!a.contains('=') && !a.contains('+') && !a.contains('/'));
        assert_ne!(a, sign("another-secret-that-is-long-enough!!", &msg));
    }

    #[test]
    fn test_method_and_path_are_bound() {
        let base = sign(SECRET, &canonical_message("POST", "/heartbeat", "1", "n", b""));
        assert_ne!(base, sign(SECRET, &canonical_message("PUT", "/heartbeat", "1", "n", b"")));
        assert_ne!(base, sign(SECRET, &canonical_message("POST", "/other", "1", "n", b"")));
    }

    #[test]
    fn test_signatures_match() {
        let sig = sign(SECRET, "m");
        assert!(signatures_match(&sig, &sig.clone()));
        assert!(!signatures_match(&sig, &sig[..sig.len() - 1]));
        assert!(!signatures_match(&sig, ""));

        let mut tampered = sig.clone().into_bytes();
        tampered[0] = if tampered[0] == b'A' { b'B' } else { b'A' };
        assert!(!signatures_match(&sig, std::str::from_utf8(&tampered).unwrap()));
    }

    #[test]
    fn test_parse_bearer() {
        assert_eq!(parse_bearer("Bearer abc"), Some("abc"));
        assert_eq!(parse_bearer("bearer \t  abc"), Some("abc"));
        assert_eq!(parse_bearer("BEARER abc "), Some("abc"));
        assert_eq!(parse_bearer("Bearer"), None);
        assert_eq!(parse_bearer("Bearer "), None);
        assert_eq!(parse_bearer("Basic abc"), None);
        assert_eq!(parse_bearer("Bearerabc"), None);
        assert_eq!(parse_bearer("Bearer a b"), None);
    }

    #[test]
    fn test_strip_mount_prefix() {
        assert_eq!(strip_mount_prefix("/api/heartbeat", "/api"), "/heartbeat");
        assert_eq!(strip_mount_prefix("/api/heartbeat?x=1", "/api"), "/heartbeat?x=1");
        assert_eq!(strip_mount_prefix("/apiary", "/api"), "/apiary");
        assert_eq!(strip_mount_prefix("/heartbeat", "/api"), "/heartbeat");
        assert_eq!(strip_mount_prefix("/heartbeat", ""), "/heartbeat");
        assert_eq!(strip_mount_prefix("/api?x=1", "/api"), "/?x=1");
    }
}

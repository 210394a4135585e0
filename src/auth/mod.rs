//! Request authentication for signed writes.
//!
//! Every write carries three headers:
//! - `Authorization: Bearer <base64url HMAC-SHA256>`
//! - `Signature-Timestamp: <unix seconds>`
//! - `Signature-Nonce: <opaque string>`
//!
//! Callers only ever learn "authentication failed"; the precise reason is
//! logged server-side. A missing or short secret is a configuration error
//! and fails closed.

mod middleware;
mod nonce;
mod signature;

pub use middleware::*;
pub use nonce::*;
pub use signature::*;

use crate::config::MIN_SECRET_LEN;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde_json::json;
use thiserror::Error;

pub const SIGNATURE_TIMESTAMP_HEADER: &str = "signature-timestamp";
pub const SIGNATURE_NONCE_HEADER: &str = "signature-nonce";

/// Maximum accepted age of a signed request, in seconds.
pub const MAX_AGE_SECS: i64 = 60;
/// Maximum accepted clock skew into the future, in seconds.
pub const MAX_FUTURE_SKEW_SECS: i64 = 10;

/// Why a request was refused. Only [`AuthError::Misconfigured`] is
/// distinguishable from the outside.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum AuthError {
    #[error("signing secret missing or too short")]
    Misconfigured,
    #[error("missing header: {0}")]
    MissingHeader(&'static str),
    #[error("malformed Authorization header")]
    MalformedAuthorization,
    #[error("unparseable timestamp")]
    InvalidTimestamp,
    #[error("timestamp too old ({age_secs}s)")]
    StaleTimestamp { age_secs: i64 },
    #[error("timestamp too far in the future ({ahead_secs}s)")]
    FutureTimestamp { ahead_secs: i64 },
    #[error("empty nonce")]
    EmptyNonce,
    #[error("signature mismatch")]
    SignatureMismatch,
    #[error("nonce already used")]
    ReplayedNonce,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        match self {
            AuthError::Misconfigured => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "server misconfiguration" })),
            )
                .into_response(),
            _ => (
                StatusCode::UNAUTHORIZED,
                Json(json!({ "error": "authentication failed" })),
            )
                .into_response(),
        }
    }
}

/// Everything the authenticator looks at for one request.
#[derive(Debug, Clone)]
pub struct RequestContext<'a> {
    pub method: &'a str,
    /// Path and query as received, before the mount prefix is stripped
    pub path_and_query: &'a str,
    pub authorization: Option<&'a str>,
    pub timestamp: Option<&'a str>,
    pub nonce: Option<&'a str>,
    /// Raw body bytes; empty when the request has no body
    pub body: &'a [u8],
}

/// Verifies signed requests against the shared secret.
pub struct Authenticator {
    secret: Option<String>,
    mount_prefix: String,
    nonces: NonceCache,
}

impl Authenticator {
    pub fn new(secret: Option<String>, mount_prefix: &str, nonce_capacity: usize) -> Self {
        Self {
            secret,
            mount_prefix: mount_prefix.to_string(),
            nonces: NonceCache::new(MAX_AGE_SECS + MAX_FUTURE_SKEW_SECS, nonce_capacity),
        }
    }

    fn secret(&self) -> Result<&str, AuthError> {
        match self.secret.as_deref() {
            Some(s) if s.chars().count() >= MIN_SECRET_LEN => Ok(s),
            _ => Err(AuthError::Misconfigured),
        }
    }

    /// Accept or reject a request, given the current unix time in seconds.
    pub fn authenticate(&self, ctx: &RequestContext<'_>, now: i64) -> Result<(), AuthError> {
        let secret = self.secret()?;

        let authorization = ctx
            .authorization
            .ok_or(AuthError::MissingHeader("authorization"))?;
        let provided = parse_bearer(authorization).ok_or(AuthError::MalformedAuthorization)?;

        let ts_raw = ctx
            .timestamp
            .ok_or(AuthError::MissingHeader(SIGNATURE_TIMESTAMP_HEADER))?;
        let ts: i64 = ts_raw.parse().map_err(|_| AuthError::InvalidTimestamp)?;

        let age_secs = now.saturating_sub(ts);
        if age_secs > MAX_AGE_SECS {
            return Err(AuthError::StaleTimestamp { age_secs });
        }
        if -age_secs > MAX_FUTURE_SKEW_SECS {
            return Err(AuthError::FutureTimestamp {
                ahead_secs: -age_secs,
            });
        }

        let nonce = ctx
            .nonce
            .ok_or(AuthError::MissingHeader(SIGNATURE_NONCE_HEADER))?;
        if nonce.trim().is_empty() {
            return Err(AuthError::EmptyNonce);
        }

        let path = strip_mount_prefix(ctx.path_and_query, &self.mount_prefix);
        let canonical = canonical_message(ctx.method, &path, ts_raw, nonce, ctx.body);
        let expected = sign(secret, &canonical);
        if !signatures_match(&expected, provided) {
            return Err(AuthError::SignatureMismatch);
        }

        // Only verified requests may consume a nonce
        if !self.nonces.insert_if_fresh(nonce, now) {
            return Err(AuthError::ReplayedNonce);
        }

        Ok(())
    }
}

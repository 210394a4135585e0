//! Axum middleware guarding signed routes.

use super::{
    AuthError, Authenticator, RequestContext, SIGNATURE_NONCE_HEADER, SIGNATURE_TIMESTAMP_HEADER,
};

use axum::{
    body::{to_bytes, Body},
    extract::{OriginalUri, Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use chrono::Utc;
use std::sync::Arc;

/// Largest body buffered for signature verification.
pub const MAX_SIGNED_BODY_BYTES: usize = 1024 * 1024;

/// Verify the request signature before the handler runs.
///
/// The body is buffered so the exact bytes the client signed can be hashed,
/// then handed on unchanged.
pub async fn require_signature(
    State(auth): State<Arc<Authenticator>>,
    OriginalUri(uri): OriginalUri,
    req: Request,
    next: Next,
) -> Response {
    let (parts, body) = req.into_parts();
    let bytes = match to_bytes(body, MAX_SIGNED_BODY_BYTES).await {
        Ok(b) => b,
        Err(e) => {
            tracing::warn!(error = %e, "Rejecting signed request: body unreadable or too large");
            return StatusCode::PAYLOAD_TOO_LARGE.into_response();
        }
    };

    let path_and_query = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or_else(|| uri.path());

    let ctx = RequestContext {
        method: parts.method.as_str(),
        path_and_query,
        authorization: header_str(&parts.headers, header::AUTHORIZATION.as_str()),
        timestamp: header_str(&parts.headers, SIGNATURE_TIMESTAMP_HEADER),
        nonce: header_str(&parts.headers, SIGNATURE_NONCE_HEADER),
        body: &bytes,
    };

    if let Err(e) = auth.authenticate(&ctx, Utc::now().timestamp()) {
        match e {
            AuthError::Misconfigured => {
                tracing::error!(error = %e, "Signed request refused: signing secret is not usable");
            }
            _ => {
                tracing::warn!(
                    reason = %e,
                    method = %parts.method,
                    path = path_and_query,
                    "Authentication failed"
                );
            }
        }
        return e.into_response();
    }

    let req = Request::from_parts(parts, Body::from(bytes));
    next.run(req).await
}

/// A header value as text; non-ASCII values are treated as absent.
fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

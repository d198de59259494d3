//! API key guard for the `/api/*` routes
//!
//! When `ApiConfig::api_key` is set, each request must carry it in the
//! `X-Api-Key` header. Artifact downloads and `/health` are mounted outside
//! the guard so the synthesis vendor and health checks can reach them.

use crate::error::{Error, Result};
use axum::{
    extract::{Request, State},
    http::HeaderMap,
    middleware::Next,
    response::{IntoResponse, Response},
};

/// Header carrying the key
pub const API_KEY_HEADER: &str = "x-api-key";

/// Middleware rejecting requests without the configured key
///
/// Rejections go through [`Error::Unauthorized`], so they carry the usual
/// error envelope and status.
///
/// ```no_run
/// use axum::{Router, middleware};
/// use synthgate::api::auth::require_api_key;
///
/// let router: Router = Router::new().layer(middleware::from_fn_with_state(
///     Some("secret-key-123".to_string()),
///     require_api_key,
/// ));
/// ```
pub async fn require_api_key(
    State(expected): State<Option<String>>,
    request: Request,
    next: Next,
) -> Response {
    let Some(expected) = expected else {
        return next.run(request).await;
    };
    match check_api_key(request.headers(), &expected) {
        Ok(()) => next.run(request).await,
        Err(e) => {
            tracing::warn!(path = %request.uri().path(), error = %e, "request refused");
            e.into_response()
        }
    }
}

fn check_api_key(headers: &HeaderMap, expected: &str) -> Result<()> {
    let provided = headers
        .get(API_KEY_HEADER)
        .ok_or_else(|| Error::Unauthorized("missing X-Api-Key header".to_string()))?;
    if keys_match(provided.as_bytes(), expected.as_bytes()) {
        Ok(())
    } else {
        Err(Error::Unauthorized("invalid API key".to_string()))
    }
}

/// Timing depends only on the lengths, not on where the keys differ
fn keys_match(provided: &[u8], expected: &[u8]) -> bool {
    provided.len() == expected.len()
        && provided
            .iter()
            .zip(expected)
            .fold(0u8, |diff, (a, b)| diff | (a ^ b))
            == 0
}

//! Bearer token auth and rate limiting for the relay server.

use crate::error::RelayError;
use crate::server::AppState;
use axum::body::Body;
use axum::extract::State;
use axum::http::{Extensions, HeaderMap, Request};
use axum::middleware::Next;
use axum::response::Response;
use uuid::Uuid;

/// The authenticated installation, inserted into request extensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Caller(pub Uuid);

/// Auth middleware: resolves the bearer token, then applies the caller's
/// rate limit.
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, RelayError> {
    let token = bearer_token(request.headers())?.to_string();

    let installation_id = state
        .storage
        .authenticate(&token)?
        .ok_or_else(|| RelayError::Auth("Unknown token".to_string()))?;

    if !state.limiter.check(installation_id) {
        tracing::warn!("Rate limit exceeded for {}", installation_id);
        return Err(RelayError::RateLimited);
    }

    request.extensions_mut().insert(Caller(installation_id));
    Ok(next.run(request).await)
}

fn bearer_token(headers: &HeaderMap) -> Result<&str, RelayError> {
    let header = headers
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| RelayError::Auth("Missing Authorization header".to_string()))?;

    let token = header
        .strip_prefix("Bearer ")
        .ok_or_else(|| RelayError::Auth("Invalid auth scheme".to_string()))?
        .trim();
    if token.is_empty() {
        return Err(RelayError::Auth("Empty token".to_string()));
    }
    Ok(token)
}

/// The installation the auth middleware resolved for this request.
pub fn caller(extensions: &Extensions) -> Result<Uuid, RelayError> {
    extensions
        .get::<Caller>()
        .map(|c| c.0)
        .ok_or_else(|| RelayError::Auth("No installation ID".to_string()))
}

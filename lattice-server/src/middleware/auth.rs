//! Shared-secret authentication: `x-api-key` or `Authorization: Bearer`,
//! with a configured set of public path prefixes that bypass the check.

use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::Response,
};

use crate::errors::ApiError;
use crate::state::AppState;

pub async fn auth_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let Some(expected) = state.config.auth.api_key.as_deref() else {
        // No key configured: everything is open (the config loader already
        // warned, and production refuses to boot in this state).
        return Ok(next.run(request).await);
    };

    let path = request.uri().path();
    if is_public_path(&state, path) {
        return Ok(next.run(request).await);
    }

    let provided = extract_key(&request);
    match provided {
        Some(key) if key == expected => Ok(next.run(request).await),
        Some(_) => Err(ApiError::unauthorized("invalid API key")),
        None => Err(ApiError::unauthorized("missing API key")),
    }
}

fn is_public_path(state: &AppState, path: &str) -> bool {
    if state
        .config
        .auth
        .public_prefixes
        .iter()
        .any(|prefix| path.starts_with(prefix.as_str()))
    {
        return true;
    }
    if state.config.auth.public_status && path == "/status" {
        return true;
    }
    false
}

fn extract_key(request: &Request) -> Option<String> {
    if let Some(value) = request.headers().get("x-api-key")
        && let Ok(raw) = value.to_str()
    {
        return Some(raw.trim().to_string());
    }
    let auth_header = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())?;
    auth_header
        .strip_prefix("Bearer ")
        .map(|token| token.trim().to_string())
}

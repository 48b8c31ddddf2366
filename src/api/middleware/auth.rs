use axum::{
    extract::{Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::Response,
};
use std::sync::Arc;

use crate::api::error::ApiError;
use crate::api::routes::AppState;

/// Decodes the bearer token once and hands handlers a typed `Identity`.
pub async fn require_identity(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| ApiError::Unauthenticated("missing bearer token".to_string()))?;

    let identity = state
        .tokens
        .verify(token)
        .map_err(|e| ApiError::Unauthenticated(e.to_string()))?;

    req.extensions_mut().insert(identity);
    Ok(next.run(req).await)
}

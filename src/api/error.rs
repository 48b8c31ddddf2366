use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::error;

use crate::errors::{ErrorKind, KaminoError};

/// Everything a handler can fail with. Engine errors keep their kind so
/// clients can branch on it without parsing messages.
#[derive(Debug)]
pub enum ApiError {
    /// No usable bearer token.
    Unauthenticated(String),
    /// Authenticated, but the route needs an admin.
    Forbidden(String),
    BadRequest(String),
    Kamino(KaminoError),
}

impl From<KaminoError> for ApiError {
    fn from(err: KaminoError) -> Self {
        ApiError::Kamino(err)
    }
}

pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Authorization => StatusCode::FORBIDDEN,
        ErrorKind::LockContention | ErrorKind::Capacity => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Config
        | ErrorKind::Transient
        | ErrorKind::Remote
        | ErrorKind::PartialFailure
        | ErrorKind::Timeout => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind, message) = match self {
            ApiError::Unauthenticated(m) => (StatusCode::UNAUTHORIZED, "unauthenticated".to_string(), m),
            ApiError::Forbidden(m) => (StatusCode::FORBIDDEN, ErrorKind::Authorization.to_string(), m),
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, "bad_request".to_string(), m),
            ApiError::Kamino(e) => {
                let kind = e.kind();
                let status = status_for(kind);
                if status.is_server_error() {
                    error!(kind = %kind, error = %e, "Request failed");
                }
                (status, kind.to_string(), e.to_string())
            }
        };
        (status, Json(json!({ "error": message, "kind": kind }))).into_response()
    }
}

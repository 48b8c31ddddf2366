use axum::{
    extract::{Request, State},
    http::{Method, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use std::num::NonZeroU32;
use std::sync::Arc;
use tracing::warn;

use crate::config::RateLimitSettings;

/// Process-wide limits. Every request draws from `api`; requests that start
/// or tear down pods also draw from the stricter `mutations` bucket.
#[derive(Clone)]
pub struct GlobalRateLimit {
    pub api: Arc<DefaultDirectRateLimiter>,
    pub mutations: Arc<DefaultDirectRateLimiter>,
}

fn per_minute(requests: u32) -> Quota {
    Quota::per_minute(NonZeroU32::new(requests).unwrap_or(NonZeroU32::MIN))
}

impl GlobalRateLimit {
    pub fn from_settings(settings: &RateLimitSettings) -> Self {
        Self {
            api: Arc::new(RateLimiter::direct(per_minute(settings.api_requests_per_minute))),
            mutations: Arc::new(RateLimiter::direct(per_minute(
                settings.mutation_requests_per_minute,
            ))),
        }
    }
}

#[derive(Debug)]
pub struct RateLimitExceeded;

impl IntoResponse for RateLimitExceeded {
    fn into_response(self) -> Response {
        (
            StatusCode::TOO_MANY_REQUESTS,
            "Rate limit exceeded. Please try again later.",
        )
            .into_response()
    }
}

pub async fn enforce(
    State(limits): State<GlobalRateLimit>,
    req: Request,
    next: Next,
) -> Result<Response, RateLimitExceeded> {
    if limits.api.check().is_err() {
        warn!(path = %req.uri().path(), "API rate limit hit");
        return Err(RateLimitExceeded);
    }
    if req.method() == Method::POST && limits.mutations.check().is_err() {
        warn!(path = %req.uri().path(), "Mutation rate limit hit");
        return Err(RateLimitExceeded);
    }
    Ok(next.run(req).await)
}

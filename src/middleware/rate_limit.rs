use axum::{
    extract::Request,
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use governor::{clock::DefaultClock, state::InMemoryState, state::NotKeyed, Quota, RateLimiter};
use std::num::NonZeroU32;
use std::sync::Arc;
use tracing::warn;

use crate::error::ErrorResponse;

/// Process-wide request budget for the API routes
#[derive(Clone)]
pub struct RateLimitLayer {
    limiter: Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>,
}

impl RateLimitLayer {
    pub fn per_minute(requests: u32) -> Self {
        let requests = NonZeroU32::new(requests).unwrap_or(NonZeroU32::MIN);
        RateLimitLayer {
            limiter: Arc::new(RateLimiter::direct(Quota::per_minute(requests))),
        }
    }

    pub fn check(&self) -> Result<(), Response> {
        self.limiter.check().map_err(|_| {
            warn!("🚦 Rate limit exceeded");
            let body = ErrorResponse {
                error: "Rate limit exceeded. Please try again later.".to_string(),
                error_code: "RATE_LIMITED".to_string(),
                details: None,
            };
            (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response()
        })
    }
}

/// Rejects requests once the limiter in the request extensions is exhausted
pub async fn rate_limit_middleware(req: Request, next: Next) -> Result<Response, Response> {
    if let Some(limiter) = req.extensions().get::<RateLimitLayer>() {
        limiter.check()?;
    }
    Ok(next.run(req).await)
}

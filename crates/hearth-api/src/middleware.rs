use std::net::SocketAddr;

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, HeaderName, HeaderValue, header},
    middleware::Next,
    response::Response,
};

use hearth_auth::bearer_token;
use hearth_ratelimit::{Decision, client_identifier};

use crate::error::ApiError;
use crate::state::AppState;

const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// Rate-limit guard for one action. Layer it with
/// `middleware::from_fn_with_state((state, action), rate_limit_guard)`.
pub async fn rate_limit_guard(
    State((state, action)): State<(AppState, &'static str)>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let forwarded = req
        .headers()
        .get(X_FORWARDED_FOR)
        .and_then(|v| v.to_str().ok());
    let remote = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());
    let identifier = client_identifier(forwarded, remote);

    if let Decision::Rejected { retry_after_secs } = state.limiter.check(action, &identifier) {
        return Err(ApiError::RateLimited { retry_after_secs });
    }

    let limit = state.limiter.limit_for(action);
    let remaining = state.limiter.remaining(action, &identifier);

    let mut response = next.run(req).await;
    let headers = response.headers_mut();
    set_header(headers, "x-ratelimit-limit", limit.max_requests.into());
    set_header(headers, "x-ratelimit-remaining", remaining.into());
    set_header(headers, "x-ratelimit-window", limit.window.as_secs());
    Ok(response)
}

fn set_header(headers: &mut HeaderMap, name: &'static str, value: u64) {
    headers.insert(HeaderName::from_static(name), HeaderValue::from(value));
}

/// Extract and validate the access token from the Authorization header.
/// On success the token's `Claims` are available as an `Extension`.
pub async fn require_auth(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let auth_header = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::unauthorized("Authorization token required"))?;

    let token = bearer_token(auth_header)
        .ok_or_else(|| ApiError::unauthorized("Invalid authorization header format"))?;

    let claims = state.tokens.verify_access(token)?;

    req.extensions_mut().insert(claims);
    Ok(next.run(req).await)
}

use axum::{
    Extension, Json,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use hearth_auth::{ChallengePurpose, email_hint, hash_password, two_factor, verify_password};
use hearth_db::models::UserRow;
use hearth_types::api::{
    AuthResponse, Claims, LoginRequest, RefreshRequest, RegisterRequest, TwoFactorRequiredResponse,
    UserSummary, VerifyResponse,
};

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// Consecutive password failures before the account locks.
pub const MAX_FAILED_LOGINS: u32 = 5;
pub const LOCKOUT_MINUTES: i64 = 15;

const BAD_CREDENTIALS: &str = "Invalid username or password";

/// Retries when a concurrent login spends a different backup code first.
const BACKUP_CODE_SWAP_ATTEMPTS: usize = 3;

pub(crate) fn user_summary(user: &UserRow) -> ApiResult<UserSummary> {
    Ok(UserSummary {
        id: parse_user_id(&user.id)?,
        username: user.username.clone(),
        email: user.email.clone(),
        email_2fa_enabled: user.two_factor_enabled,
    })
}

fn parse_user_id(id: &str) -> ApiResult<Uuid> {
    id.parse()
        .map_err(|e| ApiError::Internal(anyhow::anyhow!("corrupt user id '{}': {}", id, e)))
}

fn validate_registration(username: &str, password: &str) -> ApiResult<()> {
    if username.is_empty() || password.is_empty() {
        return Err(ApiError::bad_request("Username and password are required"));
    }
    let len = username.chars().count();
    if !(3..=20).contains(&len) {
        return Err(ApiError::bad_request("Username must be 3-20 characters"));
    }
    if password.chars().count() < 6 {
        return Err(ApiError::bad_request("Password must be at least 6 characters"));
    }
    if !username
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(ApiError::bad_request(
            "Username can only contain letters, numbers, underscores, and hyphens",
        ));
    }
    Ok(())
}

pub async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> ApiResult<impl IntoResponse> {
    let username = req.username.trim();
    validate_registration(username, &req.password)?;

    if state.db.get_user_by_username(username)?.is_some() {
        return Err(ApiError::Conflict("Username already exists".into()));
    }

    let password_hash = hash_password(&req.password)?;
    let user_id = Uuid::new_v4();
    state
        .db
        .create_user(&user_id.to_string(), username, &password_hash)?;

    let tokens = state.tokens.issue(user_id, username)?;
    info!("Registered {} ({})", username, user_id);

    Ok((
        StatusCode::CREATED,
        Json(AuthResponse {
            message: "Registration successful".into(),
            user: UserSummary {
                id: user_id,
                username: username.to_string(),
                email: None,
                email_2fa_enabled: false,
            },
            tokens,
        }),
    ))
}

/// Whole seconds left on a lock, or `None` if the account is usable.
fn lock_remaining(user: &UserRow, now: DateTime<Utc>) -> Option<u64> {
    let until = user.locked_until.as_deref()?;
    let until = match DateTime::parse_from_rfc3339(until) {
        Ok(t) => t.with_timezone(&Utc),
        Err(e) => {
            warn!("Unreadable lock time for {}: {}", user.username, e);
            return None;
        }
    };
    let left = (until - now).num_seconds();
    (left > 0).then(|| left as u64)
}

pub async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> ApiResult<Response> {
    let username = req.username.trim();
    if username.is_empty() || req.password.is_empty() {
        return Err(ApiError::bad_request("Username and password are required"));
    }

    let user = state
        .db
        .get_user_by_username(username)?
        .ok_or_else(|| ApiError::unauthorized(BAD_CREDENTIALS))?;

    let now = Utc::now();
    if let Some(retry_after_secs) = lock_remaining(&user, now) {
        return Err(ApiError::Locked { retry_after_secs });
    }
    // An expired lock starts a fresh count.
    let prior_failures = if user.locked_until.is_some() {
        0
    } else {
        user.failed_login_attempts
    };

    if !verify_password(&req.password, &user.password_hash) {
        let failures = prior_failures + 1;
        if failures >= MAX_FAILED_LOGINS {
            let until = (now + Duration::minutes(LOCKOUT_MINUTES)).to_rfc3339();
            state.db.set_failed_logins(&user.id, failures, Some(&until))?;
            warn!("Locked {} after {} failed logins", user.username, failures);
        } else {
            state.db.set_failed_logins(&user.id, failures, None)?;
        }
        return Err(ApiError::unauthorized(BAD_CREDENTIALS));
    }

    if user.two_factor_enabled {
        if let Some(email) = user.email.as_deref() {
            match req.email_2fa_code.as_deref().map(str::trim).filter(|c| !c.is_empty()) {
                None => {
                    let challenge = state.two_factor.issue(&user.id, ChallengePurpose::Login)?;
                    state
                        .two_factor
                        .send(email, &challenge.code, Some(&user.username))
                        .await;
                    return Ok(Json(TwoFactorRequiredResponse {
                        message: "2FA code sent to your email".into(),
                        requires_2fa: true,
                        email_hint: email_hint(email),
                    })
                    .into_response());
                }
                Some(code) => check_second_factor(&state, &user, code)?,
            }
        }
    }

    state.db.reset_failed_logins(&user.id)?;
    let user_id = parse_user_id(&user.id)?;
    let tokens = state.tokens.issue(user_id, &user.username)?;
    info!("{} logged in", user.username);

    Ok(Json(AuthResponse {
        message: "Login successful".into(),
        user: user_summary(&user)?,
        tokens,
    })
    .into_response())
}

/// A live emailed code first; failing that, an unused backup code.
fn check_second_factor(state: &AppState, user: &UserRow, code: &str) -> ApiResult<()> {
    match state.two_factor.redeem(&user.id, ChallengePurpose::Login, code) {
        Ok(()) => return Ok(()),
        Err(hearth_auth::TwoFactorError::ChallengeInvalidOrExpired) => {}
        Err(e) => return Err(e.into()),
    }

    let mut current = user.backup_codes.clone();
    for _ in 0..BACKUP_CODE_SWAP_ATTEMPTS {
        let mut remaining = current.clone();
        if !two_factor::redeem_backup_code(&mut remaining, code) {
            break;
        }
        if state.db.swap_backup_codes(&user.id, &current, &remaining)? {
            info!(
                "{} signed in with a backup code, {} left",
                user.username,
                remaining.len()
            );
            return Ok(());
        }
        // The list changed underneath us; the code may already be spent.
        current = match state.db.get_user_by_id(&user.id)? {
            Some(fresh) => fresh.backup_codes,
            None => break,
        };
    }

    Err(ApiError::unauthorized("Invalid or expired 2FA code"))
}

pub async fn refresh(
    State(state): State<AppState>,
    Json(req): Json<RefreshRequest>,
) -> ApiResult<impl IntoResponse> {
    if req.refresh_token.is_empty() {
        return Err(ApiError::bad_request("Refresh token required"));
    }
    let grant = state.tokens.refresh(&req.refresh_token)?;
    Ok(Json(grant))
}

pub async fn verify(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<impl IntoResponse> {
    let user = match state.db.get_user_by_id(&claims.sub.to_string())? {
        Some(user) => user_summary(&user)?,
        None => UserSummary {
            id: claims.sub,
            username: claims.username,
            email: None,
            email_2fa_enabled: false,
        },
    };
    Ok(Json(VerifyResponse { valid: true, user }))
}

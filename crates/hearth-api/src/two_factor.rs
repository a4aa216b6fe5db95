use axum::{Extension, Json, extract::State, response::IntoResponse};
use serde_json::json;
use tracing::info;

use hearth_auth::{ChallengePurpose, TwoFactorError, email_hint, two_factor, verify_password};
use hearth_db::models::UserRow;
use hearth_types::api::{
    Claims, TwoFactorDisableRequest, TwoFactorEnabledResponse, TwoFactorSetupRequest,
    TwoFactorSetupResponse, TwoFactorVerifyRequest,
};

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

fn current_user(state: &AppState, claims: &Claims) -> ApiResult<UserRow> {
    state
        .db
        .get_user_by_id(&claims.sub.to_string())?
        .ok_or_else(|| TwoFactorError::NotFound.into())
}

fn is_plausible_email(email: &str) -> bool {
    match email.split_once('@') {
        Some((local, domain)) => !local.is_empty() && domain.contains('.') && !domain.starts_with('.'),
        None => false,
    }
}

/// Record the address and email it an enrollment code.
pub async fn setup(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<TwoFactorSetupRequest>,
) -> ApiResult<impl IntoResponse> {
    let email = req.email.trim().to_lowercase();
    if email.is_empty() {
        return Err(ApiError::bad_request("Email address is required"));
    }
    if !is_plausible_email(&email) {
        return Err(ApiError::bad_request("Invalid email address"));
    }

    let user = current_user(&state, &claims)?;
    if user.two_factor_enabled {
        return Err(TwoFactorError::AlreadyEnabled.into());
    }

    state.db.set_email(&user.id, &email)?;
    let challenge = state.two_factor.issue(&user.id, ChallengePurpose::Enroll)?;
    let delivery = state
        .two_factor
        .send(&email, &challenge.code, Some(&user.username))
        .await;

    Ok(Json(TwoFactorSetupResponse {
        message: "Verification code sent to your email".into(),
        email_hint: email_hint(&email),
        email_sent: delivery.was_sent(),
    }))
}

/// Confirm the enrollment code, turn 2FA on and hand out backup codes once.
pub async fn verify(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<TwoFactorVerifyRequest>,
) -> ApiResult<impl IntoResponse> {
    if req.code.trim().is_empty() {
        return Err(ApiError::bad_request("Verification code required"));
    }

    let user = current_user(&state, &claims)?;
    if user.two_factor_enabled {
        return Err(TwoFactorError::AlreadyEnabled.into());
    }
    if user.email.is_none() {
        return Err(ApiError::bad_request(
            "2FA setup not initiated. Please start setup first.",
        ));
    }

    state
        .two_factor
        .redeem(&user.id, ChallengePurpose::Enroll, &req.code)?;

    let backup_codes = two_factor::generate_backup_codes(two_factor::DEFAULT_BACKUP_CODE_COUNT);
    let hashes = two_factor::hash_backup_codes(&backup_codes)?;
    state.db.enable_two_factor(&user.id, &hashes)?;
    info!("{} enabled email 2FA", user.username);

    Ok(Json(TwoFactorEnabledResponse {
        message: "Email 2FA enabled successfully".into(),
        backup_codes,
    }))
}

/// Issue a fresh enrollment code to the address recorded by `setup`.
pub async fn resend(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<impl IntoResponse> {
    let user = current_user(&state, &claims)?;
    if user.two_factor_enabled {
        return Err(TwoFactorError::AlreadyEnabled.into());
    }
    let email = user
        .email
        .as_deref()
        .ok_or_else(|| ApiError::bad_request("No email configured. Start 2FA setup first."))?;

    let challenge = state.two_factor.issue(&user.id, ChallengePurpose::Enroll)?;
    let delivery = state
        .two_factor
        .send(email, &challenge.code, Some(&user.username))
        .await;

    Ok(Json(json!({
        "message": "Verification code resent",
        "email_hint": email_hint(email),
        "email_sent": delivery.was_sent(),
    })))
}

/// Turn 2FA off. Requires the account password; the email is kept.
pub async fn disable(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<TwoFactorDisableRequest>,
) -> ApiResult<impl IntoResponse> {
    if req.password.is_empty() {
        return Err(ApiError::bad_request("Password required"));
    }

    let user = current_user(&state, &claims)?;
    if !verify_password(&req.password, &user.password_hash) {
        return Err(ApiError::unauthorized("Invalid password"));
    }
    if !user.two_factor_enabled {
        return Err(TwoFactorError::NotEnabled.into());
    }

    state.db.disable_two_factor(&user.id)?;
    info!("{} disabled email 2FA", user.username);

    Ok(Json(json!({ "message": "2FA disabled successfully" })))
}

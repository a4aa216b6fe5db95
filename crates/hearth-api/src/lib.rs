pub mod auth;
pub mod error;
pub mod messages;
pub mod middleware;
pub mod rooms;
pub mod state;
pub mod two_factor;

use axum::{
    Json, Router,
    extract::State,
    middleware::from_fn_with_state,
    response::IntoResponse,
    routing::{delete, get, post},
};
use chrono::Utc;
use serde_json::json;

use hearth_ratelimit::actions;

pub use error::{ApiError, ApiResult};
pub use state::{AppState, AppStateInner, TwoFactorService};

use crate::middleware::{rate_limit_guard, require_auth};

pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "online": state.sessions.online_count().await,
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

/// All REST routes under `/api`. The WebSocket upgrade is mounted by the
/// binary.
pub fn router(state: AppState) -> Router {
    let register = Router::new()
        .route("/register", post(auth::register))
        .layer(from_fn_with_state(
            (state.clone(), actions::REGISTER),
            rate_limit_guard,
        ));

    let login = Router::new()
        .route("/login", post(auth::login))
        .layer(from_fn_with_state(
            (state.clone(), actions::LOGIN),
            rate_limit_guard,
        ));

    let public = Router::new()
        .route("/refresh", post(auth::refresh))
        .route("/health", get(health))
        .merge(register)
        .merge(login);

    let protected = Router::new()
        .route("/verify", get(auth::verify))
        .route("/account/2fa/setup", post(two_factor::setup))
        .route("/account/2fa/verify", post(two_factor::verify))
        .route("/account/2fa/resend", post(two_factor::resend))
        .route("/account/2fa/disable", post(two_factor::disable))
        .route("/rooms", get(rooms::list_rooms).post(rooms::create_room))
        .route("/rooms/{name}", delete(rooms::delete_room))
        .route("/messages", get(messages::get_messages))
        .route("/messages/{id}", delete(messages::delete_message))
        .layer(from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .nest("/api", public.merge(protected))
        .with_state(state)
}

mod config;
mod sweep;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Router,
    extract::{State, WebSocketUpgrade},
    response::IntoResponse,
    routing::get,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use hearth_api::{AppState, AppStateInner};
use hearth_auth::{CodeMailer, ConfiguredMailer, TokenService, TwoFactor};
use hearth_crypto::MessageCipher;
use hearth_db::Database;
use hearth_gateway::{SessionManager, connection};
use hearth_ratelimit::RateLimiter;

use crate::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hearth=debug,tower_http=debug".into()),
        )
        .init();

    let config = Config::from_env()?;

    let db = Arc::new(Database::open(&config.db_path)?);
    let tokens = TokenService::new(config.tokens);
    let limiter = Arc::new(RateLimiter::new(config.rate_limits));
    let cipher = MessageCipher::with_iterations(config.master_key, config.kdf_iterations);

    let mailer = ConfiguredMailer::from_config(config.smtp.as_ref())?;
    if !mailer.is_live() {
        warn!("SMTP is not configured; 2FA codes will be written to the log");
    }
    let two_factor = TwoFactor::new(config.two_factor, mailer, db.clone());

    let sessions = SessionManager::new(
        tokens.clone(),
        limiter.clone(),
        cipher.clone(),
        db.clone(),
        config.session,
    );

    let state: AppState = Arc::new(AppStateInner {
        db,
        tokens,
        limiter: limiter.clone(),
        cipher,
        two_factor,
        sessions: sessions.clone(),
    });

    tokio::spawn(sweep::run(limiter, config.sweep_interval));

    let socket_route = Router::new()
        .route("/socket", get(ws_upgrade))
        .with_state(sessions);

    let app = hearth_api::router(state)
        .merge(socket_route)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    info!("Hearth server listening on {}", config.addr);

    let listener = tokio::net::TcpListener::bind(config.addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("Hearth server stopped");
    Ok(())
}

async fn ws_upgrade(
    State(sessions): State<SessionManager>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| connection::handle_connection(socket, sessions))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
                    _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
                }
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                ctrl_c.await;
                info!("Received Ctrl+C, shutting down...");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await;
        info!("Received Ctrl+C, shutting down...");
    }
}

use std::sync::Arc;

use hearth_auth::{ConfiguredMailer, TokenService, TwoFactor};
use hearth_crypto::MessageCipher;
use hearth_db::Database;
use hearth_gateway::SessionManager;
use hearth_ratelimit::RateLimiter;

pub type TwoFactorService = TwoFactor<ConfiguredMailer, Arc<Database>>;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub db: Arc<Database>,
    pub tokens: TokenService,
    pub limiter: Arc<RateLimiter>,
    pub cipher: MessageCipher,
    pub two_factor: TwoFactorService,
    pub sessions: SessionManager,
}

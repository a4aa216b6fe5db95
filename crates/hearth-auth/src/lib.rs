pub mod mail;
pub mod password;
pub mod store;
pub mod tokens;
pub mod two_factor;

pub use mail::{CodeMailer, ConfiguredMailer, LogMailer, SmtpConfig, SmtpMailer, email_hint};
pub use password::{hash_password, verify_password};
pub use store::ChallengeStore;
pub use tokens::{TokenConfig, TokenError, TokenService, bearer_token};
pub use two_factor::{
    ChallengePurpose, Delivery, PendingChallenge, TwoFactor, TwoFactorConfig, TwoFactorError,
};

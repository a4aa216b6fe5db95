use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use rand::RngCore;
use thiserror::Error;
use tracing::warn;

use hearth_auth::{SmtpConfig, TokenConfig, TwoFactorConfig};
use hearth_crypto::MasterKey;
use hearth_crypto::keys::ROOM_KEY_ITERATIONS;
use hearth_gateway::SessionConfig;
use hearth_ratelimit::{Limit, RateLimitConfig, actions};

const PREFIX: &str = "HEARTH_";

/// Values shipped in sample env files. Running with one of them would mean
/// anyone who read the sample can forge tokens.
const PLACEHOLDER_SECRETS: &[&str] = &[
    "dev-secret-change-me",
    "change-me",
    "changeme",
    "secret",
    "your-secret-key",
    "your-refresh-secret-key",
];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{name} is not a valid value: '{value}'")]
    Invalid { name: String, value: String },

    #[error("{0} is set to a placeholder value; generate a real secret")]
    PlaceholderSecret(String),

    #[error("HEARTH_JWT_SECRET and HEARTH_JWT_REFRESH_SECRET must differ")]
    SharedSecret,

    #[error("HEARTH_ENCRYPTION_MASTER_KEY: {0}")]
    MasterKey(#[from] hearth_crypto::CryptoError),

    #[error("access tokens must expire before refresh tokens")]
    TokenLifetimes,

    #[error("HEARTH_SMTP_FROM_EMAIL is required when HEARTH_SMTP_SERVER is set")]
    MissingSender,
}

pub struct Config {
    pub addr: SocketAddr,
    pub db_path: PathBuf,
    pub tokens: TokenConfig,
    pub master_key: MasterKey,
    pub kdf_iterations: u32,
    pub rate_limits: RateLimitConfig,
    pub sweep_interval: Duration,
    pub two_factor: TwoFactorConfig,
    pub smtp: Option<SmtpConfig>,
    pub session: SessionConfig,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let vars: HashMap<String, String> = std::env::vars()
            .filter(|(k, _)| k.starts_with(PREFIX))
            .collect();
        Self::from_vars(&vars)
    }

    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let env = Env(vars);

        let host = env.get("HEARTH_HOST").unwrap_or("0.0.0.0");
        let port: u16 = env.parse("HEARTH_PORT", 5000)?;
        let addr = format!("{}:{}", host, port)
            .parse()
            .map_err(|_| env.invalid("HEARTH_HOST", host))?;

        let access_secret = env.secret("HEARTH_JWT_SECRET")?;
        let refresh_secret = env.secret("HEARTH_JWT_REFRESH_SECRET")?;
        if access_secret == refresh_secret {
            return Err(ConfigError::SharedSecret);
        }
        let mut tokens = TokenConfig::new(access_secret, refresh_secret);
        tokens.access_ttl = env.lifetime("HEARTH_ACCESS_TOKEN_MINUTES", 15, chrono::Duration::try_minutes)?;
        tokens.refresh_ttl = env.lifetime("HEARTH_REFRESH_TOKEN_DAYS", 30, chrono::Duration::try_days)?;
        if tokens.access_ttl >= tokens.refresh_ttl {
            return Err(ConfigError::TokenLifetimes);
        }

        let master_key = match env.get("HEARTH_ENCRYPTION_MASTER_KEY") {
            Some(hex) => MasterKey::from_hex(hex)?,
            None => {
                let key = MasterKey::generate();
                warn!(
                    "HEARTH_ENCRYPTION_MASTER_KEY is not set; generated one for this run. \
                     Stored messages will be unreadable after a restart unless you persist it: {}",
                    key.to_hex()
                );
                key
            }
        };

        let mut rate_limits = RateLimitConfig {
            enabled: env.parse("HEARTH_RATE_LIMIT_ENABLED", true)?,
            ..RateLimitConfig::default()
        };
        for action in [actions::LOGIN, actions::REGISTER, actions::MESSAGE, actions::DEFAULT] {
            let name = format!("HEARTH_RATE_LIMIT_{}", action.to_uppercase());
            if let Some(raw) = env.get(&name) {
                let limit = Limit::from_str(raw).map_err(|_| env.invalid(&name, raw))?;
                rate_limits = rate_limits.with_limit(action, limit);
            }
        }

        let two_factor = TwoFactorConfig {
            code_length: env.positive("HEARTH_2FA_CODE_LENGTH", 6)?,
            expiry: env.lifetime("HEARTH_2FA_EXPIRY_MINUTES", 10, chrono::Duration::try_minutes)?,
        };

        let smtp = match env.get("HEARTH_SMTP_SERVER") {
            Some(server) => Some(SmtpConfig {
                server: server.to_string(),
                port: env.parse("HEARTH_SMTP_PORT", 587)?,
                username: env.get("HEARTH_SMTP_USERNAME").map(str::to_string),
                password: env.get("HEARTH_SMTP_PASSWORD").map(str::to_string),
                from_email: env
                    .get("HEARTH_SMTP_FROM_EMAIL")
                    .ok_or(ConfigError::MissingSender)?
                    .to_string(),
                from_name: env.get("HEARTH_SMTP_FROM_NAME").unwrap_or("Hearth").to_string(),
            }),
            None => None,
        };

        Ok(Self {
            addr,
            db_path: PathBuf::from(env.get("HEARTH_DB_PATH").unwrap_or("hearth.db")),
            tokens,
            master_key,
            kdf_iterations: env.positive("HEARTH_KDF_ITERATIONS", ROOM_KEY_ITERATIONS)?,
            rate_limits,
            sweep_interval: Duration::from_secs(env.positive("HEARTH_RATE_LIMIT_SWEEP_SECS", 300)?),
            two_factor,
            smtp,
            session: SessionConfig {
                max_message_len: env.positive("HEARTH_MAX_MESSAGE_LEN", 2000)?,
            },
        })
    }
}

struct Env<'a>(&'a HashMap<String, String>);

impl Env<'_> {
    /// Unset and blank read the same.
    fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(|v| v.trim()).filter(|v| !v.is_empty())
    }

    fn parse<T: FromStr>(&self, name: &str, default: T) -> Result<T, ConfigError> {
        match self.get(name) {
            Some(raw) => raw.parse().map_err(|_| self.invalid(name, raw)),
            None => Ok(default),
        }
    }

    /// Like `parse`, but zero and negative values are refused.
    fn positive<T>(&self, name: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr + PartialOrd + Default,
    {
        let value = self.parse(name, default)?;
        if value <= T::default() {
            return Err(self.invalid(name, self.get(name).unwrap_or_default()));
        }
        Ok(value)
    }

    fn lifetime(
        &self,
        name: &str,
        default: i64,
        unit: fn(i64) -> Option<chrono::Duration>,
    ) -> Result<chrono::Duration, ConfigError> {
        let count = self.positive(name, default)?;
        unit(count).ok_or_else(|| self.invalid(name, self.get(name).unwrap_or_default()))
    }

    fn invalid(&self, name: &str, value: &str) -> ConfigError {
        ConfigError::Invalid {
            name: name.to_string(),
            value: value.to_string(),
        }
    }

    fn secret(&self, name: &str) -> Result<String, ConfigError> {
        match self.get(name) {
            Some(s) if PLACEHOLDER_SECRETS.contains(&s.to_lowercase().as_str()) => {
                Err(ConfigError::PlaceholderSecret(name.to_string()))
            }
            Some(s) => Ok(s.to_string()),
            None => {
                warn!(
                    "{} is not set; using a random secret. Tokens will not survive a restart.",
                    name
                );
                Ok(random_secret())
            }
        }
    }
}

fn random_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use thiserror::Error;
use uuid::Uuid;

use hearth_types::api::{AccessGrant, Claims, TokenPair, TokenType};

pub const BEARER: &str = "Bearer";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TokenError {
    #[error("token has expired")]
    Expired,
    #[error("malformed or forged token")]
    Malformed,
    #[error("wrong token type")]
    WrongType,
    #[error("failed to sign token")]
    Signing,
}

#[derive(Clone)]
pub struct TokenConfig {
    pub access_secret: String,
    pub refresh_secret: String,
    pub access_ttl: Duration,
    pub refresh_ttl: Duration,
}

impl TokenConfig {
    /// 15 minute access tokens, 30 day refresh tokens.
    pub fn new(access_secret: impl Into<String>, refresh_secret: impl Into<String>) -> Self {
        Self {
            access_secret: access_secret.into(),
            refresh_secret: refresh_secret.into(),
            access_ttl: Duration::minutes(15),
            refresh_ttl: Duration::days(30),
        }
    }
}

struct SigningKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
    ttl: Duration,
}

impl SigningKeys {
    fn new(secret: &str, ttl: Duration) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            ttl,
        }
    }
}

/// Issues and verifies HS256 tokens. Access and refresh tokens are signed
/// with separate secrets; nothing is stored server-side.
#[derive(Clone)]
pub struct TokenService {
    inner: Arc<Inner>,
}

struct Inner {
    access: SigningKeys,
    refresh: SigningKeys,
    validation: Validation,
}

impl TokenService {
    pub fn new(config: TokenConfig) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        // Expiry is checked against the caller's clock in `verify_at`.
        validation.validate_exp = false;
        validation.leeway = 0;
        validation.required_spec_claims = HashSet::from(["exp".to_string(), "sub".to_string()]);

        Self {
            inner: Arc::new(Inner {
                access: SigningKeys::new(&config.access_secret, config.access_ttl),
                refresh: SigningKeys::new(&config.refresh_secret, config.refresh_ttl),
                validation,
            }),
        }
    }

    fn keys(&self, token_type: TokenType) -> &SigningKeys {
        match token_type {
            TokenType::Access => &self.inner.access,
            TokenType::Refresh => &self.inner.refresh,
        }
    }

    pub fn access_ttl(&self) -> Duration {
        self.inner.access.ttl
    }

    pub fn issue(&self, user_id: Uuid, username: &str) -> Result<TokenPair, TokenError> {
        self.issue_at(user_id, username, Utc::now())
    }

    pub fn issue_at(
        &self,
        user_id: Uuid,
        username: &str,
        now: DateTime<Utc>,
    ) -> Result<TokenPair, TokenError> {
        Ok(TokenPair {
            access_token: self.sign(user_id, username, TokenType::Access, now)?,
            refresh_token: self.sign(user_id, username, TokenType::Refresh, now)?,
            token_type: BEARER.to_string(),
            expires_in: self.access_ttl().num_seconds(),
        })
    }

    fn sign(
        &self,
        user_id: Uuid,
        username: &str,
        token_type: TokenType,
        now: DateTime<Utc>,
    ) -> Result<String, TokenError> {
        let keys = self.keys(token_type);
        let claims = Claims {
            sub: user_id,
            username: username.to_string(),
            token_type,
            iat: now.timestamp(),
            exp: (now + keys.ttl).timestamp(),
        };
        encode(&Header::new(Algorithm::HS256), &claims, &keys.encoding)
            .map_err(|_| TokenError::Signing)
    }

    pub fn verify_access(&self, token: &str) -> Result<Claims, TokenError> {
        self.verify_at(token, TokenType::Access, Utc::now())
    }

    pub fn verify_access_at(&self, token: &str, now: DateTime<Utc>) -> Result<Claims, TokenError> {
        self.verify_at(token, TokenType::Access, now)
    }

    pub fn verify_refresh(&self, token: &str) -> Result<Claims, TokenError> {
        self.verify_at(token, TokenType::Refresh, Utc::now())
    }

    pub fn verify_refresh_at(&self, token: &str, now: DateTime<Utc>) -> Result<Claims, TokenError> {
        self.verify_at(token, TokenType::Refresh, now)
    }

    /// Check signature, type and expiry, in that order. A token that only
    /// verifies under the other type's secret is `WrongType`, not `Malformed`.
    fn verify_at(
        &self,
        token: &str,
        expected: TokenType,
        now: DateTime<Utc>,
    ) -> Result<Claims, TokenError> {
        let other = match expected {
            TokenType::Access => TokenType::Refresh,
            TokenType::Refresh => TokenType::Access,
        };

        let claims = match decode::<Claims>(token, &self.keys(expected).decoding, &self.inner.validation) {
            Ok(data) => data.claims,
            Err(e) if matches!(e.kind(), ErrorKind::InvalidSignature) => {
                return match decode::<Claims>(token, &self.keys(other).decoding, &self.inner.validation) {
                    Ok(_) => Err(TokenError::WrongType),
                    Err(_) => Err(TokenError::Malformed),
                };
            }
            Err(_) => return Err(TokenError::Malformed),
        };

        if claims.token_type != expected {
            return Err(TokenError::WrongType);
        }
        if now.timestamp() >= claims.exp {
            return Err(TokenError::Expired);
        }
        Ok(claims)
    }

    pub fn refresh(&self, refresh_token: &str) -> Result<AccessGrant, TokenError> {
        self.refresh_at(refresh_token, Utc::now())
    }

    /// Mint a new access token from a valid refresh token. The refresh
    /// token itself is not rotated.
    pub fn refresh_at(
        &self,
        refresh_token: &str,
        now: DateTime<Utc>,
    ) -> Result<AccessGrant, TokenError> {
        let claims = self.verify_refresh_at(refresh_token, now)?;
        Ok(AccessGrant {
            access_token: self.sign(claims.sub, &claims.username, TokenType::Access, now)?,
            token_type: BEARER.to_string(),
            expires_in: self.access_ttl().num_seconds(),
        })
    }
}

/// Pull the token out of an `Authorization: Bearer <token>` value.
pub fn bearer_token(header: &str) -> Option<&str> {
    let mut parts = header.split_whitespace();
    let scheme = parts.next()?;
    let token = parts.next()?;
    if !scheme.eq_ignore_ascii_case(BEARER) || parts.next().is_some() {
        return None;
    }
    Some(token)
}

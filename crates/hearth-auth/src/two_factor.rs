use chrono::{DateTime, Duration, Utc};
use rand::rngs::OsRng;
use rand::{Rng, TryRngCore};
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::mail::{CodeEmail, CodeMailer, email_hint};
use crate::password::{hash_password, verify_password};
use crate::store::ChallengeStore;

pub const DEFAULT_BACKUP_CODE_COUNT: usize = 8;

#[derive(Debug, Error)]
pub enum TwoFactorError {
    #[error("invalid or expired verification code")]
    ChallengeInvalidOrExpired,
    #[error("two-factor authentication is already enabled")]
    AlreadyEnabled,
    #[error("two-factor authentication is not enabled")]
    NotEnabled,
    #[error("account not found")]
    NotFound,
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChallengePurpose {
    /// Second step of a password login.
    Login,
    /// Confirming an email address while turning 2FA on.
    Enroll,
}

impl ChallengePurpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChallengePurpose::Login => "login",
            ChallengePurpose::Enroll => "enroll",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingChallenge {
    pub owner_id: String,
    pub purpose: ChallengePurpose,
    pub code: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct TwoFactorConfig {
    pub code_length: usize,
    pub expiry: Duration,
}

impl Default for TwoFactorConfig {
    fn default() -> Self {
        Self {
            code_length: 6,
            expiry: Duration::minutes(10),
        }
    }
}

/// How a code left the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    /// No live transport; the code went to the log.
    Logged,
    /// The transport errored; the code went to the log instead.
    Failed,
}

impl Delivery {
    pub fn was_sent(&self) -> bool {
        matches!(self, Delivery::Sent)
    }
}

/// Emailed one-time codes: issue, send, redeem.
pub struct TwoFactor<M, S> {
    config: TwoFactorConfig,
    mailer: M,
    store: S,
}

impl<M: CodeMailer, S: ChallengeStore> TwoFactor<M, S> {
    pub fn new(config: TwoFactorConfig, mailer: M, store: S) -> Self {
        Self {
            config,
            mailer,
            store,
        }
    }

    pub fn config(&self) -> &TwoFactorConfig {
        &self.config
    }

    pub fn generate_code(&self) -> String {
        let mut rng = OsRng.unwrap_err();
        (0..self.config.code_length)
            .map(|_| char::from(b'0' + rng.random_range(0..10u8)))
            .collect()
    }

    pub fn issue(&self, owner_id: &str, purpose: ChallengePurpose) -> Result<PendingChallenge, TwoFactorError> {
        self.issue_at(owner_id, purpose, Utc::now())
    }

    /// Create the live challenge for `owner_id`, replacing any earlier one
    /// for the same purpose.
    pub fn issue_at(
        &self,
        owner_id: &str,
        purpose: ChallengePurpose,
        now: DateTime<Utc>,
    ) -> Result<PendingChallenge, TwoFactorError> {
        let challenge = PendingChallenge {
            owner_id: owner_id.to_string(),
            purpose,
            code: self.generate_code(),
            expires_at: now + self.config.expiry,
        };
        self.store.save(&challenge)?;
        debug!("Issued {} challenge for {}", purpose.as_str(), owner_id);
        Ok(challenge)
    }

    pub fn redeem(&self, owner_id: &str, purpose: ChallengePurpose, supplied: &str) -> Result<(), TwoFactorError> {
        self.redeem_at(owner_id, purpose, supplied, Utc::now())
    }

    /// Succeeds at most once per issued code. An expired challenge is
    /// cleared when it is checked.
    pub fn redeem_at(
        &self,
        owner_id: &str,
        purpose: ChallengePurpose,
        supplied: &str,
        now: DateTime<Utc>,
    ) -> Result<(), TwoFactorError> {
        let challenge = self
            .store
            .load(owner_id, purpose)?
            .ok_or(TwoFactorError::ChallengeInvalidOrExpired)?;

        if now > challenge.expires_at {
            self.store.clear(owner_id, purpose)?;
            debug!("Expired {} challenge for {} cleared", purpose.as_str(), owner_id);
            return Err(TwoFactorError::ChallengeInvalidOrExpired);
        }

        if !verify_at(&challenge.code, supplied, challenge.expires_at, now) {
            return Err(TwoFactorError::ChallengeInvalidOrExpired);
        }

        // Lost a race with a concurrent redeem or a re-issue.
        if !self.store.consume(owner_id, purpose, &challenge.code)? {
            return Err(TwoFactorError::ChallengeInvalidOrExpired);
        }
        Ok(())
    }

    pub fn discard(&self, owner_id: &str, purpose: ChallengePurpose) -> Result<(), TwoFactorError> {
        self.store.clear(owner_id, purpose)?;
        Ok(())
    }

    /// Deliver `code` to `destination`. Never fails the caller: when the
    /// transport is missing or broken the code is written to the log.
    pub async fn send(&self, destination: &str, code: &str, username: Option<&str>) -> Delivery {
        let email = CodeEmail {
            to: destination.to_string(),
            username: username.map(str::to_string),
            code: code.to_string(),
            expiry_minutes: self.config.expiry.num_minutes(),
        };
        let hint = email_hint(destination);

        match self.mailer.deliver(&email).await {
            Ok(()) if self.mailer.is_live() => {
                info!("Verification code sent to {}", hint);
                Delivery::Sent
            }
            Ok(()) => Delivery::Logged,
            Err(e) => {
                warn!("Failed to send verification code to {}: {:#}", hint, e);
                warn!("[dev fallback] verification code for {}: {}", hint, code);
                Delivery::Failed
            }
        }
    }
}

pub fn verify(stored: &str, supplied: &str, expires_at: DateTime<Utc>) -> bool {
    verify_at(stored, supplied, expires_at, Utc::now())
}

/// Fails closed on an empty code, on `now > expires_at`, and on any
/// mismatch. The comparison is constant-time over equal-length input.
pub fn verify_at(stored: &str, supplied: &str, expires_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    if stored.is_empty() || supplied.is_empty() || now > expires_at {
        return false;
    }
    stored.as_bytes().ct_eq(supplied.trim().as_bytes()).into()
}

/// Eight-character uppercase hex codes; shown to the user once.
pub fn generate_backup_codes(count: usize) -> Vec<String> {
    let mut rng = OsRng.unwrap_err();
    (0..count)
        .map(|_| {
            let bytes: [u8; 4] = rng.random();
            hex::encode_upper(bytes)
        })
        .collect()
}

pub fn hash_backup_codes(codes: &[String]) -> Result<Vec<String>, TwoFactorError> {
    codes
        .iter()
        .map(|code| hash_password(code).map_err(TwoFactorError::from))
        .collect()
}

/// Remove the hash matching `supplied`, if any. Returns whether a code was
/// used; the caller persists the shortened list.
pub fn redeem_backup_code(hashes: &mut Vec<String>, supplied: &str) -> bool {
    let supplied = supplied.trim().to_ascii_uppercase();
    if supplied.is_empty() {
        return false;
    }
    match hashes.iter().position(|hash| verify_password(&supplied, hash)) {
        Some(idx) => {
            hashes.remove(idx);
            true
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use anyhow::anyhow;
    use hearth_db::Database;

    use super::*;

    #[derive(Default)]
    struct RecordingMailer {
        fail: bool,
        sent: Mutex<Vec<CodeEmail>>,
    }

    impl CodeMailer for RecordingMailer {
        fn is_live(&self) -> bool {
            true
        }

        async fn deliver(&self, email: &CodeEmail) -> anyhow::Result<()> {
            if self.fail {
                return Err(anyhow!("connection refused"));
            }
            self.sent.lock().unwrap().push(email.clone());
            Ok(())
        }
    }

    fn t0() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn two_factor(mailer: RecordingMailer) -> TwoFactor<RecordingMailer, Arc<Database>> {
        TwoFactor::new(
            TwoFactorConfig::default(),
            mailer,
            Arc::new(Database::open_in_memory().unwrap()),
        )
    }

    #[test]
    fn codes_are_numeric_and_sized() {
        let tf = two_factor(RecordingMailer::default());
        for _ in 0..50 {
            let code = tf.generate_code();
            assert_eq!(code.len(), 6);
            assert!(code.chars().all(|c| c.is_ascii_digit()));
        }
    }

    #[test]
    fn verify_rules() {
        let exp = t0() + Duration::minutes(10);
        assert!(verify_at("123456", "123456", exp, t0()));
        assert!(verify_at("123456", " 123456 ", exp, exp));
        assert!(!verify_at("123456", "123456", exp, exp + Duration::seconds(1)));
        assert!(!verify_at("123456", "123457", exp, t0()));
        assert!(!verify_at("123456", "12345", exp, t0()));
        assert!(!verify_at("", "", exp, t0()));
        assert!(!verify_at("123456", "", exp, t0()));
    }

    #[test]
    fn redeem_succeeds_exactly_once() {
        let tf = two_factor(RecordingMailer::default());
        let challenge = tf.issue_at("u1", ChallengePurpose::Login, t0()).unwrap();

        tf.redeem_at("u1", ChallengePurpose::Login, &challenge.code, t0()).unwrap();
        assert!(matches!(
            tf.redeem_at("u1", ChallengePurpose::Login, &challenge.code, t0()),
            Err(TwoFactorError::ChallengeInvalidOrExpired)
        ));
    }

    #[test]
    fn wrong_code_keeps_challenge_live() {
        let tf = two_factor(RecordingMailer::default());
        let challenge = tf.issue_at("u1", ChallengePurpose::Login, t0()).unwrap();
        let wrong = if challenge.code == "000000" { "111111" } else { "000000" };

        assert!(tf.redeem_at("u1", ChallengePurpose::Login, wrong, t0()).is_err());
        assert!(tf.redeem_at("u1", ChallengePurpose::Login, &challenge.code, t0()).is_ok());
    }

    #[test]
    fn expired_challenge_is_rejected_and_cleared() {
        let tf = two_factor(RecordingMailer::default());
        let challenge = tf.issue_at("u1", ChallengePurpose::Enroll, t0()).unwrap();
        let late = t0() + Duration::minutes(11);

        assert!(tf.redeem_at("u1", ChallengePurpose::Enroll, &challenge.code, late).is_err());
        // Gone, so even the earlier timestamp now fails.
        assert!(tf.redeem_at("u1", ChallengePurpose::Enroll, &challenge.code, t0()).is_err());
    }

    #[test]
    fn reissue_replaces_previous_code() {
        let tf = two_factor(RecordingMailer::default());
        let first = tf.issue_at("u1", ChallengePurpose::Login, t0()).unwrap();
        let mut second = tf.issue_at("u1", ChallengePurpose::Login, t0()).unwrap();
        while second.code == first.code {
            second = tf.issue_at("u1", ChallengePurpose::Login, t0()).unwrap();
        }

        assert!(tf.redeem_at("u1", ChallengePurpose::Login, &first.code, t0()).is_err());
        assert!(tf.redeem_at("u1", ChallengePurpose::Login, &second.code, t0()).is_ok());
    }

    #[test]
    fn purposes_are_independent() {
        let tf = two_factor(RecordingMailer::default());
        let login = tf.issue_at("u1", ChallengePurpose::Login, t0()).unwrap();
        tf.issue_at("u1", ChallengePurpose::Enroll, t0()).unwrap();

        tf.redeem_at("u1", ChallengePurpose::Login, &login.code, t0()).unwrap();
        assert!(tf.store.load("u1", ChallengePurpose::Enroll).unwrap().is_some());
    }

    #[test]
    fn backup_codes_are_single_use() {
        let codes = generate_backup_codes(DEFAULT_BACKUP_CODE_COUNT);
        assert_eq!(codes.len(), 8);
        assert!(codes.iter().all(|c| c.len() == 8 && c.chars().all(|ch| ch.is_ascii_hexdigit())));
        assert!(codes.iter().all(|c| *c == c.to_ascii_uppercase()));

        let mut hashes = hash_backup_codes(&codes[..3]).unwrap();
        assert!(!hashes.contains(&codes[0]));

        assert!(redeem_backup_code(&mut hashes, &codes[1].to_ascii_lowercase()));
        assert_eq!(hashes.len(), 2);
        assert!(!redeem_backup_code(&mut hashes, &codes[1]));
        assert!(!redeem_backup_code(&mut hashes, "ZZZZZZZZ"));
        assert!(!redeem_backup_code(&mut hashes, ""));
    }

    #[tokio::test]
    async fn send_reports_delivery() {
        let tf = two_factor(RecordingMailer::default());
        let delivery = tf.send("alice@example.com", "123456", Some("alice")).await;
        assert_eq!(delivery, Delivery::Sent);
        let sent = tf.mailer.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].code, "123456");
        assert_eq!(sent[0].expiry_minutes, 10);
    }

    #[tokio::test]
    async fn send_falls_back_when_transport_fails() {
        let tf = two_factor(RecordingMailer {
            fail: true,
            ..Default::default()
        });
        assert_eq!(tf.send("a@b.c", "654321", None).await, Delivery::Failed);
    }

    #[tokio::test]
    async fn log_mailer_reports_logged() {
        let tf = TwoFactor::new(
            TwoFactorConfig::default(),
            crate::mail::LogMailer,
            Database::open_in_memory().unwrap(),
        );
        assert_eq!(tf.send("a@b.c", "111222", None).await, Delivery::Logged);
    }
}

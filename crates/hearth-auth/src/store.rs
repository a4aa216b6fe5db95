use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};

use hearth_db::Database;
use hearth_db::models::ChallengeRow;

use crate::two_factor::{ChallengePurpose, PendingChallenge};

/// Where live challenges are kept between issue and redeem.
pub trait ChallengeStore: Send + Sync {
    /// Insert or overwrite the challenge for its owner and purpose.
    fn save(&self, challenge: &PendingChallenge) -> Result<()>;

    fn load(&self, owner_id: &str, purpose: ChallengePurpose) -> Result<Option<PendingChallenge>>;

    /// Remove the challenge only if it still holds `code`; true if removed.
    fn consume(&self, owner_id: &str, purpose: ChallengePurpose, code: &str) -> Result<bool>;

    fn clear(&self, owner_id: &str, purpose: ChallengePurpose) -> Result<()>;
}

impl<T: ChallengeStore> ChallengeStore for Arc<T> {
    fn save(&self, challenge: &PendingChallenge) -> Result<()> {
        (**self).save(challenge)
    }

    fn load(&self, owner_id: &str, purpose: ChallengePurpose) -> Result<Option<PendingChallenge>> {
        (**self).load(owner_id, purpose)
    }

    fn consume(&self, owner_id: &str, purpose: ChallengePurpose, code: &str) -> Result<bool> {
        (**self).consume(owner_id, purpose, code)
    }

    fn clear(&self, owner_id: &str, purpose: ChallengePurpose) -> Result<()> {
        (**self).clear(owner_id, purpose)
    }
}

impl ChallengeStore for Database {
    fn save(&self, challenge: &PendingChallenge) -> Result<()> {
        self.upsert_challenge(&ChallengeRow {
            owner_id: challenge.owner_id.clone(),
            purpose: challenge.purpose.as_str().to_string(),
            code: challenge.code.clone(),
            expires_at: challenge.expires_at.to_rfc3339(),
        })
    }

    fn load(&self, owner_id: &str, purpose: ChallengePurpose) -> Result<Option<PendingChallenge>> {
        let Some(row) = self.get_challenge(owner_id, purpose.as_str())? else {
            return Ok(None);
        };
        let expires_at = DateTime::parse_from_rfc3339(&row.expires_at)
            .with_context(|| format!("bad challenge expiry for {}", owner_id))?
            .with_timezone(&Utc);
        Ok(Some(PendingChallenge {
            owner_id: row.owner_id,
            purpose,
            code: row.code,
            expires_at,
        }))
    }

    fn consume(&self, owner_id: &str, purpose: ChallengePurpose, code: &str) -> Result<bool> {
        self.consume_challenge(owner_id, purpose.as_str(), code)
    }

    fn clear(&self, owner_id: &str, purpose: ChallengePurpose) -> Result<()> {
        self.clear_challenge(owner_id, purpose.as_str())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    #[test]
    fn database_store_round_trips_and_consumes_once() {
        let db = Database::open_in_memory().unwrap();
        let expires_at = DateTime::from_timestamp(1_700_000_600, 0).unwrap();
        let challenge = PendingChallenge {
            owner_id: "user-1".into(),
            purpose: ChallengePurpose::Login,
            code: "424242".into(),
            expires_at,
        };
        db.save(&challenge).unwrap();

        assert_eq!(db.load("user-1", ChallengePurpose::Login).unwrap(), Some(challenge.clone()));
        assert_eq!(db.load("user-1", ChallengePurpose::Enroll).unwrap(), None);

        assert!(!db.consume("user-1", ChallengePurpose::Login, "000000").unwrap());
        assert!(db.consume("user-1", ChallengePurpose::Login, "424242").unwrap());
        assert!(!db.consume("user-1", ChallengePurpose::Login, "424242").unwrap());
        assert_eq!(db.load("user-1", ChallengePurpose::Login).unwrap(), None);
    }

    #[test]
    fn save_overwrites_previous_code() {
        let db = Database::open_in_memory().unwrap();
        let now = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        for code in ["111111", "222222"] {
            db.save(&PendingChallenge {
                owner_id: "u".into(),
                purpose: ChallengePurpose::Enroll,
                code: code.into(),
                expires_at: now + Duration::minutes(10),
            })
            .unwrap();
        }
        let live = db.load("u", ChallengePurpose::Enroll).unwrap().unwrap();
        assert_eq!(live.code, "222222");
    }
}

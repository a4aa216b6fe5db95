/// Database row types, mapped directly from SQLite rows.
/// Distinct from hearth-types API models to keep the DB layer independent.

pub struct UserRow {
    pub id: String,
    pub username: String,
    pub password_hash: String,
    pub email: Option<String>,
    pub two_factor_enabled: bool,
    /// Salted hashes of the unused backup codes
    pub backup_codes: Vec<String>,
    pub failed_login_attempts: u32,
    /// RFC 3339
    pub locked_until: Option<String>,
    pub created_at: String,
}

pub struct RoomRow {
    pub name: String,
    pub encrypted: bool,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct MessageRow {
    pub id: String,
    pub user_id: String,
    pub username: String,
    /// Plain text, or a `nonce:ciphertext` envelope when `encrypted`
    pub content: String,
    pub room: String,
    pub timestamp: String,
    pub encrypted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeRow {
    pub owner_id: String,
    pub purpose: String,
    pub code: String,
    /// RFC 3339
    pub expires_at: String,
}

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// -- JWT Claims --

/// Which secret a token was signed with and what it may be used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenType {
    Access,
    Refresh,
}

/// JWT claims shared across hearth-api (REST middleware) and hearth-gateway
/// (socket authentication). Timestamps are unix seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub username: String,
    #[serde(rename = "type")]
    pub token_type: TokenType,
    pub iat: i64,
    pub exp: i64,
}

// -- Auth --

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// Second-factor code: a live emailed code or an unused backup code.
    #[serde(default)]
    pub email_2fa_code: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    /// Seconds until the access token expires.
    pub expires_in: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessGrant {
    pub access_token: String,
    pub token_type: String,
    pub expires_in: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSummary {
    pub id: Uuid,
    pub username: String,
    pub email: Option<String>,
    #[serde(rename = "email2FAEnabled")]
    pub email_2fa_enabled: bool,
}

#[derive(Debug, Serialize)]
pub struct AuthResponse {
    pub message: String,
    pub user: UserSummary,
    #[serde(flatten)]
    pub tokens: TokenPair,
}

#[derive(Debug, Serialize)]
pub struct TwoFactorRequiredResponse {
    pub message: String,
    pub requires_2fa: bool,
    pub email_hint: String,
}

#[derive(Debug, Deserialize)]
pub struct RefreshRequest {
    #[serde(default)]
    pub refresh_token: String,
}

#[derive(Debug, Serialize)]
pub struct VerifyResponse {
    pub valid: bool,
    pub user: UserSummary,
}

// -- Two-factor --

#[derive(Debug, Deserialize)]
pub struct TwoFactorSetupRequest {
    #[serde(default)]
    pub email: String,
}

#[derive(Debug, Serialize)]
pub struct TwoFactorSetupResponse {
    pub message: String,
    pub email_hint: String,
    pub email_sent: bool,
}

#[derive(Debug, Deserialize)]
pub struct TwoFactorVerifyRequest {
    #[serde(default)]
    pub code: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TwoFactorEnabledResponse {
    pub message: String,
    /// Shown exactly once; only hashes are kept server-side.
    pub backup_codes: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct TwoFactorDisableRequest {
    #[serde(default)]
    pub password: String,
}

// -- Rooms --

#[derive(Debug, Deserialize)]
pub struct CreateRoomRequest {
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RoomResponse {
    pub name: String,
    pub encrypted: bool,
    pub created_at: String,
}

// -- Messages --

#[derive(Debug, Deserialize)]
pub struct MessageQuery {
    #[serde(default = "default_room")]
    pub room: String,
    #[serde(default = "default_limit")]
    pub limit: u32,
}

fn default_room() -> String {
    crate::DEFAULT_ROOM.to_string()
}

fn default_limit() -> u32 {
    50
}

#[derive(Debug, Clone, Serialize)]
pub struct MessageResponse {
    pub id: String,
    pub username: String,
    pub content: String,
    pub room: String,
    pub timestamp: String,
    pub user_id: Uuid,
}

// -- Errors --

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claims_serialize_type_field() {
        let claims = Claims {
            sub: Uuid::nil(),
            username: "alice".into(),
            token_type: TokenType::Refresh,
            iat: 1,
            exp: 2,
        };
        let json = serde_json::to_value(&claims).unwrap();
        assert_eq!(json["type"], "refresh");
        assert!(json.get("token_type").is_none());
    }

    #[test]
    fn message_query_defaults_to_general() {
        let q: MessageQuery = serde_json::from_str("{}").unwrap();
        assert_eq!(q.room, "general");
        assert_eq!(q.limit, 50);
    }
}

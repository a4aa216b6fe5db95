/// Hearth Crypto Library
///
/// At-rest protection for chat message bodies. One master key is held by the
/// server; every room gets its own AES-256-GCM key derived from it with
/// PBKDF2-HMAC-SHA256 (salt = room name), so no per-room key is ever stored.
/// The room name is also bound as associated data, which makes ciphertext
/// from one room undecryptable under another.
pub mod encrypt;
pub mod keys;

pub use encrypt::{ENCRYPTED_PLACEHOLDER, MessageCipher, RoomCipher, StoredContent, hash_for_search};
pub use keys::{ExportKey, KEY_SIZE, MasterKey, derive_export_key};

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("invalid master key: {0}")]
    InvalidKey(String),

    #[error("encryption failed")]
    Encrypt,
}

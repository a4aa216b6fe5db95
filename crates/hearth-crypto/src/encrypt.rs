use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, KeyInit, OsRng, Payload, rand_core::RngCore},
};
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::CryptoError;
use crate::keys::{MasterKey, ROOM_KEY_ITERATIONS, derive_room_key};

pub const NONCE_SIZE: usize = 12;

/// Shown in place of a stored message that fails to decrypt.
pub const ENCRYPTED_PLACEHOLDER: &str = "[Encrypted message]";

/// Separates the nonce from the ciphertext in the storage string.
const DELIMITER: char = ':';

/// How a message body is held in the store; mirrors the `encrypted` column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoredContent {
    Plain(String),
    /// `<base64 nonce>:<base64 ciphertext||tag>`
    Encrypted(String),
}

/// Room-scoped authenticated encryption for message storage.
#[derive(Debug, Clone)]
pub struct MessageCipher {
    master: MasterKey,
    iterations: u32,
}

impl MessageCipher {
    pub fn new(master: MasterKey) -> Self {
        Self::with_iterations(master, ROOM_KEY_ITERATIONS)
    }

    /// Lower iteration counts are only meant for tests.
    pub fn with_iterations(master: MasterKey, iterations: u32) -> Self {
        Self { master, iterations }
    }

    /// Derive the room key once, for encrypting or decrypting many bodies
    /// of the same room.
    pub fn for_room(&self, room_name: &str) -> RoomCipher {
        let mut key = derive_room_key(&self.master, room_name, self.iterations);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
        key.fill(0);
        RoomCipher {
            cipher,
            room: room_name.to_string(),
        }
    }

    /// Encrypt a message body for the given room and serialize it into a
    /// single storage string. Returns `Ok(None)` for an empty body.
    pub fn encrypt_for_storage(
        &self,
        plaintext: &str,
        room_name: &str,
    ) -> Result<Option<String>, CryptoError> {
        if plaintext.is_empty() {
            return Ok(None);
        }
        self.for_room(room_name).encrypt(plaintext).map(Some)
    }

    /// Inverse of [`encrypt_for_storage`](Self::encrypt_for_storage).
    ///
    /// Returns `None` on any failure (wrong room, tampering, bad encoding) so
    /// callers can substitute a placeholder instead of failing the request.
    pub fn decrypt_from_storage(&self, envelope: &str, room_name: &str) -> Option<String> {
        self.for_room(room_name).decrypt(envelope)
    }

    /// Render a stored message body for display.
    pub fn open_stored(&self, content: &StoredContent, room_name: &str) -> String {
        self.for_room(room_name).open(content)
    }
}

/// A derived key bound to one room name.
pub struct RoomCipher {
    cipher: Aes256Gcm,
    room: String,
}

impl RoomCipher {
    pub fn encrypt(&self, plaintext: &str) -> Result<String, CryptoError> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: plaintext.as_bytes(),
                    aad: self.room.as_bytes(),
                },
            )
            .map_err(|_| CryptoError::Encrypt)?;

        Ok(format!(
            "{}{}{}",
            BASE64.encode(nonce_bytes),
            DELIMITER,
            BASE64.encode(ciphertext)
        ))
    }

    pub fn decrypt(&self, envelope: &str) -> Option<String> {
        let (nonce_b64, ciphertext_b64) = envelope.split_once(DELIMITER)?;

        let nonce_bytes = BASE64.decode(nonce_b64).ok()?;
        if nonce_bytes.len() != NONCE_SIZE {
            return None;
        }
        let ciphertext = BASE64.decode(ciphertext_b64).ok()?;

        let plaintext = match self.cipher.decrypt(
            Nonce::from_slice(&nonce_bytes),
            Payload {
                msg: &ciphertext,
                aad: self.room.as_bytes(),
            },
        ) {
            Ok(p) => p,
            Err(_) => {
                debug!("Decryption failed for message in room '{}'", self.room);
                return None;
            }
        };

        String::from_utf8(plaintext).ok()
    }

    /// Plain bodies pass through; undecryptable ones become the placeholder.
    pub fn open(&self, content: &StoredContent) -> String {
        match content {
            StoredContent::Plain(text) => text.clone(),
            StoredContent::Encrypted(envelope) => self
                .decrypt(envelope)
                .unwrap_or_else(|| ENCRYPTED_PLACEHOLDER.to_string()),
        }
    }
}

impl StoredContent {
    /// Build from a row's body and its `encrypted` flag.
    pub fn from_row(content: String, encrypted: bool) -> Self {
        if encrypted {
            StoredContent::Encrypted(content)
        } else {
            StoredContent::Plain(content)
        }
    }
}

/// One-way, case-insensitive digest for exact-match search over encrypted
/// content.
pub fn hash_for_search(content: &str) -> String {
    hex::encode(Sha256::digest(content.to_lowercase().as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::KEY_SIZE;

    fn cipher() -> MessageCipher {
        MessageCipher::with_iterations(MasterKey::from_bytes([42u8; KEY_SIZE]), 1_000)
    }

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let c = cipher();
        let stored = c.encrypt_for_storage("Hello from Hearth!", "general").unwrap().unwrap();
        assert!(!stored.contains("Hello"));
        assert_eq!(stored.matches(':').count(), 1);

        let decrypted = c.decrypt_from_storage(&stored, "general");
        assert_eq!(decrypted.as_deref(), Some("Hello from Hearth!"));
    }

    #[test]
    fn unicode_roundtrip() {
        let c = cipher();
        let text = "héllo wörld ✓ 你好";
        let stored = c.encrypt_for_storage(text, "intl").unwrap().unwrap();
        assert_eq!(c.decrypt_from_storage(&stored, "intl").as_deref(), Some(text));
    }

    #[test]
    fn nonce_is_fresh_per_call() {
        let c = cipher();
        let a = c.encrypt_for_storage("same", "general").unwrap().unwrap();
        let b = c.encrypt_for_storage("same", "general").unwrap().unwrap();
        assert_ne!(a, b);
        assert_ne!(a.split(':').next(), b.split(':').next());
    }

    #[test]
    fn wrong_room_fails() {
        let c = cipher();
        let stored = c.encrypt_for_storage("secret", "room-a").unwrap().unwrap();
        assert_eq!(c.decrypt_from_storage(&stored, "room-b"), None);
    }

    #[test]
    fn wrong_master_key_fails() {
        let c = cipher();
        let other = MessageCipher::with_iterations(MasterKey::from_bytes([1u8; KEY_SIZE]), 1_000);
        let stored = c.encrypt_for_storage("secret", "general").unwrap().unwrap();
        assert_eq!(other.decrypt_from_storage(&stored, "general"), None);
    }

    #[test]
    fn every_flipped_bit_is_detected() {
        let c = cipher();
        let stored = c.encrypt_for_storage("tamper me", "general").unwrap().unwrap();
        let (nonce, ct) = stored.split_once(':').unwrap();
        let raw = BASE64.decode(ct).unwrap();

        for byte in 0..raw.len() {
            for bit in 0..8 {
                let mut tampered = raw.clone();
                tampered[byte] ^= 1 << bit;
                let envelope = format!("{}:{}", nonce, BASE64.encode(&tampered));
                assert_eq!(
                    c.decrypt_from_storage(&envelope, "general"),
                    None,
                    "flip of byte {} bit {} went undetected",
                    byte,
                    bit
                );
            }
        }
    }

    #[test]
    fn malformed_envelopes_yield_none() {
        let c = cipher();
        assert_eq!(c.decrypt_from_storage("no delimiter here", "general"), None);
        assert_eq!(c.decrypt_from_storage("!!!:???", "general"), None);
        assert_eq!(c.decrypt_from_storage("AAAA:AAAA", "general"), None);
        assert_eq!(c.decrypt_from_storage("", "general"), None);
    }

    #[test]
    fn empty_plaintext_is_not_stored() {
        assert_eq!(cipher().encrypt_for_storage("", "general").unwrap(), None);
    }

    #[test]
    fn open_stored_substitutes_placeholder() {
        let c = cipher();
        let stored = c.encrypt_for_storage("hi", "general").unwrap().unwrap();

        assert_eq!(c.open_stored(&StoredContent::Encrypted(stored.clone()), "general"), "hi");
        assert_eq!(
            c.open_stored(&StoredContent::Encrypted(stored), "elsewhere"),
            ENCRYPTED_PLACEHOLDER
        );
        assert_eq!(
            c.open_stored(&StoredContent::Plain("legacy: plain".into()), "general"),
            "legacy: plain"
        );
    }

    #[test]
    fn room_cipher_reuses_one_key() {
        let c = cipher();
        let room = c.for_room("general");
        let stored: Vec<String> = ["a", "b", "c"].iter().map(|m| room.encrypt(m).unwrap()).collect();

        let opened: Vec<String> = stored
            .into_iter()
            .map(|s| room.open(&StoredContent::from_row(s, true)))
            .collect();
        assert_eq!(opened, ["a", "b", "c"]);
        assert_eq!(room.open(&StoredContent::from_row("plain".into(), false)), "plain");
    }

    #[test]
    fn search_hash_ignores_case() {
        assert_eq!(hash_for_search("Hello"), hash_for_search("hELLO"));
        assert_eq!(hash_for_search("x").len(), 64);
    }
}

use aes_gcm::aead::OsRng;
use aes_gcm::aead::rand_core::RngCore;
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use sha2::Sha256;

use crate::CryptoError;

pub const KEY_SIZE: usize = 32;

/// Iteration count for room key derivation.
pub const ROOM_KEY_ITERATIONS: u32 = 100_000;

/// Password-derived export keys get a higher work factor than room keys.
pub const EXPORT_KEY_ITERATIONS: u32 = 480_000;

const EXPORT_SALT_SIZE: usize = 16;

/// The server-wide secret every room key is derived from.
#[derive(Clone)]
pub struct MasterKey([u8; KEY_SIZE]);

impl MasterKey {
    /// Generate a fresh random master key.
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_SIZE];
        OsRng.fill_bytes(&mut key);
        Self(key)
    }

    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Decode a hex-encoded 32-byte key (the `HEARTH_ENCRYPTION_MASTER_KEY` format).
    pub fn from_hex(encoded: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(encoded.trim())
            .map_err(|e| CryptoError::InvalidKey(format!("not hex: {}", e)))?;
        let key: [u8; KEY_SIZE] = bytes.try_into().map_err(|b: Vec<u8>| {
            CryptoError::InvalidKey(format!("expected {} bytes, got {}", KEY_SIZE, b.len()))
        })?;
        Ok(Self(key))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub(crate) fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MasterKey(..)")
    }
}

/// Derive the AES-256 key for a room. Same room, same key; no state kept.
pub fn derive_room_key(master: &MasterKey, room_name: &str, iterations: u32) -> [u8; KEY_SIZE] {
    let mut key = [0u8; KEY_SIZE];
    pbkdf2::pbkdf2_hmac::<Sha256>(master.as_bytes(), room_name.as_bytes(), iterations, &mut key);
    key
}

/// A password-derived key suitable for exporting backups of key material.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportKey {
    /// Base64 of the derived 32-byte key
    pub key: String,
    /// Base64 of the salt; needed to re-derive the same key
    pub salt: String,
}

/// Derive an export key from a password. A random 16-byte salt is generated
/// when `salt` is `None`.
pub fn derive_export_key(password: &str, salt: Option<&[u8]>) -> ExportKey {
    let salt = match salt {
        Some(s) => s.to_vec(),
        None => {
            let mut s = vec![0u8; EXPORT_SALT_SIZE];
            OsRng.fill_bytes(&mut s);
            s
        }
    };

    let mut key = [0u8; KEY_SIZE];
    pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), &salt, EXPORT_KEY_ITERATIONS, &mut key);

    let out = ExportKey {
        key: BASE64.encode(key),
        salt: BASE64.encode(&salt),
    };
    key.fill(0);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_roundtrip() {
        let key = MasterKey::generate();
        let decoded = MasterKey::from_hex(&key.to_hex()).unwrap();
        assert_eq!(decoded.as_bytes(), key.as_bytes());
    }

    #[test]
    fn rejects_short_key() {
        let err = MasterKey::from_hex("abcd").unwrap_err();
        assert!(err.to_string().contains("expected 32 bytes"));
    }

    #[test]
    fn room_keys_are_deterministic_and_distinct() {
        let master = MasterKey::from_bytes([7u8; KEY_SIZE]);
        let a1 = derive_room_key(&master, "room-a", 1_000);
        let a2 = derive_room_key(&master, "room-a", 1_000);
        let b = derive_room_key(&master, "room-b", 1_000);
        assert_eq!(a1, a2);
        assert_ne!(a1, b);
    }

    #[test]
    fn export_key_is_reproducible_from_salt() {
        let first = derive_export_key("hunter22", None);
        let salt = BASE64.decode(&first.salt).unwrap();
        assert_eq!(salt.len(), EXPORT_SALT_SIZE);
        let again = derive_export_key("hunter22", Some(&salt));
        assert_eq!(first, again);
    }
}

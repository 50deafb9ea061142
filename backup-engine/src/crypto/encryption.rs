//! AES-256-GCM sealing of payload frames.
//!
//! A sealed buffer is the 12-byte nonce followed by ciphertext and tag.

use aes_gcm::{
    aead::{rand_core::RngCore, Aead, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD, Engine};

use super::DerivedKey;
use crate::utils::errors::{EngineError, Result};

/// Size of the AES-GCM nonce in bytes (96 bits)
pub const NONCE_SIZE: usize = 12;

/// Known plaintext sealed into archive metadata to detect a wrong password
const KEY_CHECK_PLAINTEXT: &[u8] = b"backup-engine key check v1";

fn cipher(key: &DerivedKey) -> Result<Aes256Gcm> {
    Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|e| EngineError::Encryption(format!("Failed to create cipher: {}", e)))
}

/// Encrypt with a fresh random nonce
pub fn seal(plaintext: &[u8], key: &DerivedKey) -> Result<Vec<u8>> {
    let mut nonce_bytes = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce_bytes);

    let ciphertext = cipher(key)?
        .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
        .map_err(|e| EngineError::Encryption(format!("Encryption failed: {}", e)))?;

    let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    sealed.extend_from_slice(&nonce_bytes);
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed)
}

/// Decrypt a buffer produced by [`seal`]
pub fn open(sealed: &[u8], key: &DerivedKey) -> Result<Vec<u8>> {
    if sealed.len() < NONCE_SIZE {
        return Err(EngineError::Encryption(format!(
            "Sealed frame too short: {} bytes",
            sealed.len()
        )));
    }
    let (nonce, ciphertext) = sealed.split_at(NONCE_SIZE);

    cipher(key)?
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| EngineError::Encryption("Decryption failed: invalid key or corrupted data".to_string()))
}

/// Base64 token that proves knowledge of the key without storing it
pub fn key_check(key: &DerivedKey) -> Result<String> {
    Ok(STANDARD.encode(seal(KEY_CHECK_PLAINTEXT, key)?))
}

/// Fails with `InvalidPassword` unless `token` was produced by the same key
pub fn verify_key_check(token: &str, key: &DerivedKey) -> Result<()> {
    let sealed = STANDARD
        .decode(token)
        .map_err(|e| EngineError::Encryption(format!("Invalid key check encoding: {}", e)))?;

    match open(&sealed, key) {
        Ok(plain) if plain == KEY_CHECK_PLAINTEXT => Ok(()),
        _ => Err(EngineError::InvalidPassword),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KdfConfig;
    use crate::crypto::{derive_key, KeyDerivationParams};

    fn key(password: &str, params: &KeyDerivationParams) -> DerivedKey {
        derive_key(password, params).unwrap()
    }

    fn params() -> KeyDerivationParams {
        KeyDerivationParams::generate(&KdfConfig {
            memory_cost: 1024,
            time_cost: 1,
            parallelism: 1,
        })
    }

    #[test]
    fn test_seal_open() {
        let params = params();
        let k = key("pw", &params);
        let sealed = seal(b"chunk of file data", &k).unwrap();
        assert_eq!(sealed.len(), NONCE_SIZE + 18 + 16);
        assert_eq!(open(&sealed, &k).unwrap(), b"chunk of file data");
    }

    #[test]
    fn test_nonce_is_unique() {
        let params = params();
        let k = key("pw", &params);
        assert_ne!(seal(b"same", &k).unwrap(), seal(b"same", &k).unwrap());
    }

    #[test]
    fn test_wrong_key_fails() {
        let params = params();
        let sealed = seal(b"secret", &key("right", &params)).unwrap();
        assert!(open(&sealed, &key("wrong", &params)).is_err());
    }

    #[test]
    fn test_tampered_frame_fails() {
        let params = params();
        let k = key("pw", &params);
        let mut sealed = seal(b"secret", &k).unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0xff;
        assert!(open(&sealed, &k).is_err());
    }

    #[test]
    fn test_key_check() {
        let params = params();
        let token = key_check(&key("right", &params)).unwrap();
        assert!(verify_key_check(&token, &key("right", &params)).is_ok());
        assert!(matches!(
            verify_key_check(&token, &key("wrong", &params)),
            Err(EngineError::InvalidPassword)
        ));
    }
}

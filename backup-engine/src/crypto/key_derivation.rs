//! Key derivation using Argon2id
//!
//! Every encrypted archive gets its own random salt, so the same password
//! yields a different key per archive.

use aes_gcm::aead::{rand_core::RngCore, OsRng};
use argon2::{Algorithm, Argon2, Params, Version};
use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::config::KdfConfig;
use crate::utils::errors::{EngineError, Result};

const SALT_SIZE: usize = 16;

/// Parameters for key derivation, persisted with the archive
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyDerivationParams {
    /// Salt for key derivation (base64 encoded)
    pub salt: String,
    /// Memory cost in KiB
    pub memory_cost: u32,
    pub time_cost: u32,
    pub parallelism: u32,
}

impl KeyDerivationParams {
    /// Fresh params with a random salt and the configured costs
    pub fn generate(config: &KdfConfig) -> Self {
        let mut salt = [0u8; SALT_SIZE];
        OsRng.fill_bytes(&mut salt);
        Self {
            salt: STANDARD.encode(salt),
            memory_cost: config.memory_cost,
            time_cost: config.time_cost,
            parallelism: config.parallelism,
        }
    }
}

/// A derived AES-256 key, wiped from memory on drop
pub struct DerivedKey {
    key: [u8; 32],
}

impl DerivedKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.key
    }
}

impl Drop for DerivedKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

impl std::fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DerivedKey(..)")
    }
}

/// Derive the archive key from a password
pub fn derive_key(password: &str, params: &KeyDerivationParams) -> Result<DerivedKey> {
    let salt = STANDARD
        .decode(&params.salt)
        .map_err(|e| EngineError::Encryption(format!("Invalid salt: {}", e)))?;

    let argon2_params = Params::new(
        params.memory_cost,
        params.time_cost,
        params.parallelism,
        Some(32),
    )
    .map_err(|e| EngineError::Encryption(format!("Invalid Argon2 parameters: {}", e)))?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon2_params);

    let mut key = [0u8; 32];
    argon2
        .hash_password_into(password.as_bytes(), &salt, &mut key)
        .map_err(|e| EngineError::Encryption(format!("Key derivation failed: {}", e)))?;

    Ok(DerivedKey { key })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_kdf() -> KdfConfig {
        KdfConfig {
            memory_cost: 1024,
            time_cost: 1,
            parallelism: 1,
        }
    }

    #[test]
    fn test_same_password_same_key() {
        let params = KeyDerivationParams::generate(&test_kdf());
        let key1 = derive_key("hunter2", &params).unwrap();
        let key2 = derive_key("hunter2", &params).unwrap();
        assert_eq!(key1.as_bytes(), key2.as_bytes());
    }

    #[test]
    fn test_different_salt_different_key() {
        let params1 = KeyDerivationParams::generate(&test_kdf());
        let params2 = KeyDerivationParams::generate(&test_kdf());
        assert_ne!(params1.salt, params2.salt);
        let key1 = derive_key("hunter2", &params1).unwrap();
        let key2 = derive_key("hunter2", &params2).unwrap();
        assert_ne!(key1.as_bytes(), key2.as_bytes());
    }

    #[test]
    fn test_invalid_salt_is_rejected() {
        let mut params = KeyDerivationParams::generate(&test_kdf());
        params.salt = "not base64!".into();
        assert!(matches!(derive_key("x", &params), Err(EngineError::Encryption(_))));
    }
}

//! Archive encryption: Argon2id key derivation and AES-256-GCM frames.

pub mod encryption;
pub mod key_derivation;

pub use encryption::{key_check, open, seal, verify_key_check};
pub use key_derivation::{derive_key, DerivedKey, KeyDerivationParams};

use crate::config::KdfConfig;
use crate::utils::errors::Result;
use serde::{Deserialize, Serialize};

/// Encryption header stored in archive metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionInfo {
    pub cipher: String,
    pub kdf: KeyDerivationParams,
    pub key_check: String,
}

impl EncryptionInfo {
    /// Derive a key for a new archive and the header that lets it be re-derived
    pub fn create(password: &str, config: &KdfConfig) -> Result<(Self, DerivedKey)> {
        let kdf = KeyDerivationParams::generate(config);
        let key = derive_key(password, &kdf)?;
        let info = Self {
            cipher: "aes-256-gcm".to_string(),
            kdf,
            key_check: key_check(&key)?,
        };
        Ok((info, key))
    }

    /// Re-derive the key; `InvalidPassword` when the password does not match
    pub fn unlock(&self, password: &str) -> Result<DerivedKey> {
        let key = derive_key(password, &self.kdf)?;
        verify_key_check(&self.key_check, &key)?;
        Ok(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::errors::EngineError;

    #[test]
    fn test_create_and_unlock() {
        let config = KdfConfig {
            memory_cost: 1024,
            time_cost: 1,
            parallelism: 1,
        };
        let (info, key) = EncryptionInfo::create("correct horse", &config).unwrap();
        let unlocked = info.unlock("correct horse").unwrap();
        assert_eq!(key.as_bytes(), unlocked.as_bytes());
        assert!(matches!(info.unlock("battery staple"), Err(EngineError::InvalidPassword)));
    }
}

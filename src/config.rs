//! Repository configuration, stored cleartext as `config` in the
//! repository root.
//!
//! The configuration pins everything a reader needs before it can touch
//! a single blob: hashing and chunking parameters, the packfile size
//! cap, the compression choice, and the encryption parameters including
//! KDF, salt and canary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::chunker::ChunkerConfig;
use crate::codec::CompressionConfig;
use crate::crypto::{bytes_as_base64, KeyDerivationConfig};
use crate::error::{Error, Result};
use crate::REPOSITORY_VERSION;

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct HashingConfig {
    pub algorithm: String,
    pub bits: u32,
}

impl Default for HashingConfig {
    fn default() -> Self {
        Self { algorithm: "SHA256".to_string(), bits: 256 }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct PackfileConfig {
    pub max_size: u64,
}

impl Default for PackfileConfig {
    fn default() -> Self {
        Self { max_size: 20 * 1024 * 1024 }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct EncryptionConfig {
    pub data_algorithm: String,
    pub kdf: KeyDerivationConfig,
    /// Known plaintext sealed with the data key; lets a wrong
    /// passphrase fail before any blob is decrypted.
    #[serde(with = "bytes_as_base64")]
    pub canary: Vec<u8>,
}

impl EncryptionConfig {
    pub fn new(kdf: KeyDerivationConfig) -> Self {
        Self {
            data_algorithm: "AES256-GCM".to_string(),
            kdf,
            canary: Vec::new(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct RepositoryConfig {
    pub version: String,
    pub repository_id: String,
    pub timestamp: DateTime<Utc>,
    pub hashing: HashingConfig,
    pub chunking: ChunkerConfig,
    pub packfile: PackfileConfig,
    pub compression: Option<CompressionConfig>,
    pub encryption: Option<EncryptionConfig>,
}

impl RepositoryConfig {
    pub fn new() -> Result<Self> {
        let mut id = [0u8; 16];
        openssl::rand::rand_bytes(&mut id)
            .map_err(|err| Error::Config(format!("id generation failed - {}", err)))?;

        Ok(Self {
            version: REPOSITORY_VERSION.to_string(),
            repository_id: hex::encode(id),
            timestamp: Utc::now(),
            hashing: HashingConfig::default(),
            chunking: ChunkerConfig::default(),
            packfile: PackfileConfig::default(),
            compression: Some(CompressionConfig::zstd()),
            encryption: None,
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.version != REPOSITORY_VERSION {
            return Err(Error::Config(format!(
                "unsupported repository version '{}' (expected '{}')",
                self.version, REPOSITORY_VERSION
            )));
        }
        if self.hashing.algorithm != "SHA256" || self.hashing.bits != 256 {
            return Err(Error::Config(format!(
                "unsupported hashing algorithm '{}/{}'",
                self.hashing.algorithm, self.hashing.bits
            )));
        }
        self.chunking.validate()?;
        if self.packfile.max_size == 0 {
            return Err(Error::Config("packfile maximum size must not be zero".to_string()));
        }
        if let Some(ref encryption) = self.encryption {
            if encryption.data_algorithm != "AES256-GCM" {
                return Err(Error::Config(format!(
                    "unsupported encryption algorithm '{}'",
                    encryption.data_algorithm
                )));
            }
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|err| Error::encode("configuration", err))?;
        Ok(json.into_bytes())
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let config: RepositoryConfig = serde_json::from_slice(bytes)
            .map_err(|err| Error::Config(format!("unable to parse configuration - {}", err)))?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_round_trip() {
        let config = RepositoryConfig::new().unwrap();
        let bytes = config.to_bytes().unwrap();
        let parsed = RepositoryConfig::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.repository_id, config.repository_id);
        assert_eq!(parsed.chunking, config.chunking);
    }

    #[test]
    fn test_bad_version_rejected() {
        let mut config = RepositoryConfig::new().unwrap();
        config.version = "99.0.0".to_string();
        let bytes = serde_json::to_vec(&config).unwrap();
        match RepositoryConfig::from_bytes(&bytes) {
            Err(Error::Config(message)) => assert!(message.contains("version")),
            other => panic!("expected config error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_bad_hash_rejected() {
        let mut config = RepositoryConfig::new().unwrap();
        config.hashing.algorithm = "MD5".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(RepositoryConfig::from_bytes(b"not json at all").is_err());
    }
}

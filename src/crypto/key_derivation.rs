use openssl::hash::MessageDigest;
use openssl::pkcs5::{pbkdf2_hmac, scrypt};
use openssl::rand::rand_bytes;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub mod bytes_as_base64 {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(data: &[u8], serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&base64::encode(data))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> std::result::Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let string = String::deserialize(deserializer)?;
        base64::decode(&string).map_err(serde::de::Error::custom)
    }
}

/// Key-derivation parameters, stored in the repository configuration.
#[derive(Deserialize, Serialize, Clone, Debug)]
pub enum KeyDerivationConfig {
    Scrypt {
        n: u64,
        r: u64,
        p: u64,
        #[serde(with = "bytes_as_base64")]
        salt: Vec<u8>,
    },
    PBKDF2 {
        iter: usize,
        #[serde(with = "bytes_as_base64")]
        salt: Vec<u8>,
    },
}

impl KeyDerivationConfig {
    /// Scrypt with the parameters recommended for interactive use.
    pub fn new_scrypt() -> Result<Self> {
        Ok(KeyDerivationConfig::Scrypt {
            n: 65536,
            r: 8,
            p: 1,
            salt: fresh_salt()?,
        })
    }

    pub fn new_pbkdf2() -> Result<Self> {
        Ok(KeyDerivationConfig::PBKDF2 {
            iter: 65535,
            salt: fresh_salt()?,
        })
    }

    pub fn kdf_name(&self) -> &'static str {
        match self {
            KeyDerivationConfig::Scrypt { .. } => "SCRYPT",
            KeyDerivationConfig::PBKDF2 { .. } => "PBKDF2",
        }
    }

    pub fn salt(&self) -> &[u8] {
        match self {
            KeyDerivationConfig::Scrypt { salt, .. } => salt,
            KeyDerivationConfig::PBKDF2 { salt, .. } => salt,
        }
    }

    /// Derive the 256 bit repository data key from a passphrase.
    pub fn derive_key(&self, passphrase: &[u8]) -> Result<[u8; 32]> {
        let mut key = [0u8; 32];

        match self {
            KeyDerivationConfig::Scrypt { n, r, p, salt } => {
                // maxmem 1GiB
                scrypt(passphrase, salt, *n, *r, *p, 1025 * 1024 * 1024, &mut key)
                    .map_err(|err| Error::Config(format!("scrypt failed - {}", err)))?;
            }
            KeyDerivationConfig::PBKDF2 { iter, salt } => {
                pbkdf2_hmac(passphrase, salt, *iter, MessageDigest::sha256(), &mut key)
                    .map_err(|err| Error::Config(format!("pbkdf2 failed - {}", err)))?;
            }
        }

        Ok(key)
    }
}

fn fresh_salt() -> Result<Vec<u8>> {
    let mut salt = vec![0u8; 32];
    rand_bytes(&mut salt)
        .map_err(|err| Error::Config(format!("salt generation failed - {}", err)))?;
    Ok(salt)
}

use openssl::rand::rand_bytes;
use openssl::symm::{decrypt_aead, encrypt_aead, Cipher};

use crate::error::{Error, Result};

/// Known plaintext encrypted into the repository configuration so that a
/// wrong passphrase is detected before any data blob is touched.
pub const KEY_CANARY: &[u8] = b"cellar-key-canary-v1";

const NONCE_SIZE: usize = 12;
const TAG_SIZE: usize = 16;

/// Repository data key plus the AEAD built on top of it.
///
/// Every blob is sealed individually with AES-256-GCM and a fresh random
/// nonce; the nonce and tag travel with the ciphertext, so the sealed
/// form is `nonce || ciphertext || tag`.
pub struct CryptConfig {
    enc_key: [u8; 32],
}

impl CryptConfig {
    pub fn new(enc_key: [u8; 32]) -> Self {
        Self { enc_key }
    }

    pub fn cipher(&self) -> Cipher {
        Cipher::aes_256_gcm()
    }

    /// Seal `data` with a fresh per-blob nonce.
    pub fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut nonce = [0u8; NONCE_SIZE];
        rand_bytes(&mut nonce)
            .map_err(|err| Error::Integrity(format!("nonce generation failed - {}", err)))?;

        let mut tag = [0u8; TAG_SIZE];
        let ciphertext = encrypt_aead(self.cipher(), &self.enc_key, Some(&nonce), &[], data, &mut tag)
            .map_err(|err| Error::Integrity(format!("encryption failed - {}", err)))?;

        let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len() + TAG_SIZE);
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        sealed.extend_from_slice(&tag);
        Ok(sealed)
    }

    /// Open a sealed blob. A bad key or tampered ciphertext fails the
    /// AEAD tag verification.
    pub fn decrypt(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        if sealed.len() < NONCE_SIZE + TAG_SIZE {
            return Err(Error::Integrity(format!(
                "encrypted blob too small ({} bytes)",
                sealed.len()
            )));
        }

        let nonce = &sealed[..NONCE_SIZE];
        let ciphertext = &sealed[NONCE_SIZE..sealed.len() - TAG_SIZE];
        let tag = &sealed[sealed.len() - TAG_SIZE..];

        decrypt_aead(self.cipher(), &self.enc_key, Some(nonce), &[], ciphertext, tag)
            .map_err(|_| Error::Integrity("AEAD tag verification failed".to_string()))
    }

    /// Produce the canary value stored in the repository configuration.
    pub fn make_canary(&self) -> Result<Vec<u8>> {
        self.encrypt(KEY_CANARY)
    }

    /// Verify the configured canary against this key. A failure means
    /// the passphrase (and therefore the derived key) is wrong.
    pub fn check_canary(&self, canary: &[u8]) -> Result<()> {
        match self.decrypt(canary) {
            Ok(plaintext) if plaintext == KEY_CANARY => Ok(()),
            _ => Err(Error::Config("wrong passphrase for this repository".to_string())),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn test_config() -> CryptConfig {
        CryptConfig::new([0x42u8; 32])
    }

    #[test]
    fn test_seal_round_trip() {
        let config = test_config();
        let data = b"some chunk bytes";
        let sealed = config.encrypt(data).unwrap();
        assert_ne!(&sealed[..], &data[..]);
        assert_eq!(config.decrypt(&sealed).unwrap(), data);
    }

    #[test]
    fn test_nonces_differ() {
        let config = test_config();
        let a = config.encrypt(b"same input").unwrap();
        let b = config.encrypt(b"same input").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_tamper_detected() {
        let config = test_config();
        let mut sealed = config.encrypt(b"payload").unwrap();
        let middle = sealed.len() / 2;
        sealed[middle] ^= 0x01;
        match config.decrypt(&sealed) {
            Err(Error::Integrity(_)) => (),
            other => panic!("expected integrity error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_canary() {
        let config = test_config();
        let canary = config.make_canary().unwrap();
        config.check_canary(&canary).unwrap();

        let wrong = CryptConfig::new([0x43u8; 32]);
        assert!(wrong.check_canary(&canary).is_err());
    }
}

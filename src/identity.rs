//! Signing identities: an Ed25519 keypair bound to an address, used to
//! sign snapshot headers.

use openssl::pkey::{Id, PKey, Private, Public};
use openssl::sign::{Signer, Verifier};

use crate::error::{Error, Result};

pub struct Identity {
    identifier: [u8; 16],
    address: String,
    keypair: PKey<Private>,
}

impl Identity {
    /// Generate a fresh identity for an address (`user@host` shaped).
    pub fn generate(address: &str) -> Result<Identity> {
        if !address.contains('@') || address.starts_with('@') || address.ends_with('@') {
            return Err(Error::Usage(format!("invalid identity address '{}'", address)));
        }

        let mut identifier = [0u8; 16];
        openssl::rand::rand_bytes(&mut identifier)
            .map_err(|err| Error::Config(format!("identifier generation failed - {}", err)))?;

        let keypair = PKey::generate_ed25519()
            .map_err(|err| Error::Config(format!("keypair generation failed - {}", err)))?;

        Ok(Identity { identifier, address: address.to_string(), keypair })
    }

    pub fn identifier(&self) -> &[u8; 16] {
        &self.identifier
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Raw 32-byte Ed25519 public key.
    pub fn public_key(&self) -> Result<Vec<u8>> {
        self.keypair
            .raw_public_key()
            .map_err(|err| Error::Config(format!("public key export failed - {}", err)))
    }

    pub fn sign(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut signer = Signer::new_without_digest(&self.keypair)
            .map_err(|err| Error::Config(format!("signer setup failed - {}", err)))?;
        signer
            .sign_oneshot_to_vec(data)
            .map_err(|err| Error::Config(format!("signing failed - {}", err)))
    }
}

/// Verify a detached signature against a raw public key.
pub fn verify(public_key: &[u8], data: &[u8], signature: &[u8]) -> Result<bool> {
    let key: PKey<Public> = PKey::public_key_from_raw_bytes(public_key, Id::ED25519)
        .map_err(|err| Error::Usage(format!("invalid public key - {}", err)))?;

    let mut verifier = Verifier::new_without_digest(&key)
        .map_err(|err| Error::Config(format!("verifier setup failed - {}", err)))?;
    verifier
        .verify_oneshot(signature, data)
        .map_err(|err| Error::Config(format!("verification failed - {}", err)))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_sign_and_verify() {
        let identity = Identity::generate("alice@example.org").unwrap();
        let signature = identity.sign(b"snapshot header bytes").unwrap();
        let public_key = identity.public_key().unwrap();

        assert!(verify(&public_key, b"snapshot header bytes", &signature).unwrap());
        assert!(!verify(&public_key, b"tampered bytes", &signature).unwrap());
    }

    #[test]
    fn test_addresses_validated() {
        assert!(Identity::generate("not-an-address").is_err());
        assert!(Identity::generate("@host").is_err());
        assert!(Identity::generate("user@").is_err());
        assert!(Identity::generate("user@host").is_ok());
    }

    #[test]
    fn test_identities_are_unique() {
        let a = Identity::generate("a@b").unwrap();
        let b = Identity::generate("a@b").unwrap();
        assert_ne!(a.identifier(), b.identifier());
    }
}

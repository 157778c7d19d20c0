//! Blob encoding: optional compression followed by optional encryption.
//!
//! The codec never tags the payload itself; the chosen transformations
//! are recorded as flags in the packfile index and the catalogue, so the
//! stored bytes are exactly `encrypt(compress(data))`.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::crypto::CryptConfig;
use crate::error::{Error, Result};
use crate::packfile::BlobFlags;

/// Largest blob the codec will accept or reproduce.
pub const MAX_BLOB_SIZE: usize = 128 * 1024 * 1024;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompressionAlgorithm {
    Lz4,
    Zstd,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct CompressionConfig {
    pub algorithm: CompressionAlgorithm,
    pub level: i32,
}

impl CompressionConfig {
    pub fn zstd() -> Self {
        Self { algorithm: CompressionAlgorithm::Zstd, level: 1 }
    }

    pub fn lz4() -> Self {
        Self { algorithm: CompressionAlgorithm::Lz4, level: 0 }
    }
}

pub struct Codec {
    compression: Option<CompressionConfig>,
    crypt: Option<Arc<CryptConfig>>,
}

impl Codec {
    pub fn new(compression: Option<CompressionConfig>, crypt: Option<Arc<CryptConfig>>) -> Self {
        Self { compression, crypt }
    }

    /// Plain pass-through codec.
    pub fn plain() -> Self {
        Self { compression: None, crypt: None }
    }

    pub fn encrypting(&self) -> bool {
        self.crypt.is_some()
    }

    /// Encode a blob for storage. Compression is only kept when the
    /// result is shorter than the input.
    pub fn encode(&self, data: &[u8]) -> Result<(Vec<u8>, BlobFlags)> {
        if data.len() > MAX_BLOB_SIZE {
            return Err(Error::Usage(format!("blob too large ({} bytes)", data.len())));
        }

        let mut flags = BlobFlags::empty();
        let mut payload = None;

        if let Some(ref config) = self.compression {
            let compressed = match config.algorithm {
                CompressionAlgorithm::Zstd => zstd::bulk::compress(data, config.level)?,
                CompressionAlgorithm::Lz4 => lz4_flex::compress_prepend_size(data),
            };
            if compressed.len() < data.len() {
                flags.insert(BlobFlags::COMPRESSED);
                payload = Some(compressed);
            }
        }

        let payload = payload.unwrap_or_else(|| data.to_vec());

        if let Some(ref crypt) = self.crypt {
            flags.insert(BlobFlags::ENCRYPTED);
            return Ok((crypt.encrypt(&payload)?, flags));
        }

        Ok((payload, flags))
    }

    /// Decode a stored blob according to the flags it was written with.
    pub fn decode(&self, data: &[u8], flags: BlobFlags) -> Result<Vec<u8>> {
        let payload = if flags.contains(BlobFlags::ENCRYPTED) {
            match self.crypt {
                Some(ref crypt) => crypt.decrypt(data)?,
                None => {
                    return Err(Error::Config(
                        "blob is encrypted but no key is available".to_string(),
                    ))
                }
            }
        } else {
            data.to_vec()
        };

        if !flags.contains(BlobFlags::COMPRESSED) {
            return Ok(payload);
        }

        match self.compression {
            Some(CompressionConfig { algorithm: CompressionAlgorithm::Zstd, .. }) => {
                zstd::bulk::decompress(&payload, MAX_BLOB_SIZE)
                    .map_err(|err| Error::Integrity(format!("zstd decompression failed - {}", err)))
            }
            Some(CompressionConfig { algorithm: CompressionAlgorithm::Lz4, .. }) => {
                lz4_flex::decompress_size_prepended(&payload)
                    .map_err(|err| Error::Integrity(format!("lz4 decompression failed - {}", err)))
            }
            None => Err(Error::Config(
                "blob is compressed but no compression is configured".to_string(),
            )),
        }
    }
}

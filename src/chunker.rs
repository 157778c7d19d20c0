//! Content-defined chunking of input streams.
//!
//! The splitter is FastCDC with `{min, normal, max}` bounds. Splitting
//! is a pure function of the configuration and the input bytes: the
//! chunk sequence does not depend on how the reader hands out buffers,
//! and memory usage is bounded by `max`.

use std::io::Read;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Smallest accepted minimum chunk size.
pub const CHUNKING_MIN_LIMIT: u32 = 64;
/// Largest accepted maximum chunk size.
pub const CHUNKING_MAX_LIMIT: u32 = 1024 * 1024 * 1024;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ChunkerConfig {
    pub algorithm: String,
    pub min_size: u32,
    pub normal_size: u32,
    pub max_size: u32,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            algorithm: "FASTCDC".to_string(),
            min_size: 64 * 1024,
            normal_size: 1024 * 1024,
            max_size: 4 * 1024 * 1024,
        }
    }
}

impl ChunkerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.algorithm != "FASTCDC" {
            return Err(Error::Config(format!(
                "unsupported chunking algorithm '{}'",
                self.algorithm
            )));
        }
        if self.min_size < CHUNKING_MIN_LIMIT
            || self.max_size > CHUNKING_MAX_LIMIT
            || self.min_size > self.normal_size
            || self.normal_size > self.max_size
        {
            return Err(Error::Config(format!(
                "invalid chunk sizes min={} normal={} max={}",
                self.min_size, self.normal_size, self.max_size
            )));
        }
        Ok(())
    }
}

/// One chunk cut out of the input stream.
pub struct Chunk {
    /// Offset of the first byte within the input stream.
    pub offset: u64,
    pub data: Vec<u8>,
}

/// Streaming splitter over any reader.
pub struct Chunker<R: Read> {
    inner: fastcdc::v2020::StreamCDC<R>,
    offset: u64,
}

impl<R: Read> Chunker<R> {
    pub fn new(reader: R, config: &ChunkerConfig) -> Chunker<R> {
        Chunker {
            inner: fastcdc::v2020::StreamCDC::new(
                reader,
                config.min_size,
                config.normal_size,
                config.max_size,
            ),
            offset: 0,
        }
    }
}

impl<R: Read> Iterator for Chunker<R> {
    type Item = Result<Chunk>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.inner.next()? {
            Ok(chunk) => {
                let offset = self.offset;
                self.offset += chunk.data.len() as u64;
                Some(Ok(Chunk { offset, data: chunk.data }))
            }
            Err(fastcdc::v2020::Error::Empty) => None,
            Err(fastcdc::v2020::Error::IoError(err)) => {
                Some(Err(Error::Read { offset: self.offset, source: err }))
            }
            Err(err) => Some(Err(Error::Read {
                offset: self.offset,
                source: std::io::Error::new(std::io::ErrorKind::Other, err.to_string()),
            })),
        }
    }
}

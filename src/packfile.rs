//! Append-only packfiles: the containers blobs are stored in.
//!
//! Layout:
//!
//! ```text
//!  ┌──────── body ────────┬──── index ─────┬── footer ──┐
//!  │ blob₀ blob₁ … blobₙ  │ entry₀ … entryₙ │ fixed-size │
//!  └──────────────────────┴────────────────┴────────────┘
//! ```
//!
//! The body starts at offset zero, so the offsets recorded in the index
//! and the catalogue address the file directly. The footer carries the
//! magic, format version, index location, blob count and a digest of the
//! index bytes; a reader validates all of that before it trusts a single
//! index entry. The packfile identifier is the digest of the complete
//! file bytes.

use std::convert::TryInto;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::tools::digest_to_hex;
use crate::{Digest, DIGEST_SIZE};

pub const PACKFILE_MAGIC: [u8; 4] = *b"CELP";
pub const PACKFILE_VERSION: u32 = 1;

pub const FOOTER_SIZE: usize = 64;
pub const INDEX_ENTRY_SIZE: usize = 53;

/// Closed set of blob types stored in a repository.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum BlobType {
    Chunk,
    Object,
    Directory,
    File,
    Xattr,
    Error,
    BtreeNode,
    SnapshotHeader,
    State,
    Signature,
}

impl BlobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlobType::Chunk => "chunk",
            BlobType::Object => "object",
            BlobType::Directory => "directory",
            BlobType::File => "file",
            BlobType::Xattr => "xattr",
            BlobType::Error => "error",
            BlobType::BtreeNode => "btree_node",
            BlobType::SnapshotHeader => "snapshot_header",
            BlobType::State => "state",
            BlobType::Signature => "signature",
        }
    }
}

impl std::fmt::Display for BlobType {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl From<BlobType> for u8 {
    fn from(blob_type: BlobType) -> u8 {
        match blob_type {
            BlobType::Chunk => 0,
            BlobType::Object => 1,
            BlobType::Directory => 2,
            BlobType::File => 3,
            BlobType::Xattr => 4,
            BlobType::Error => 5,
            BlobType::BtreeNode => 6,
            BlobType::SnapshotHeader => 7,
            BlobType::State => 8,
            BlobType::Signature => 9,
        }
    }
}

impl std::convert::TryFrom<u8> for BlobType {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, String> {
        match value {
            0 => Ok(BlobType::Chunk),
            1 => Ok(BlobType::Object),
            2 => Ok(BlobType::Directory),
            3 => Ok(BlobType::File),
            4 => Ok(BlobType::Xattr),
            5 => Ok(BlobType::Error),
            6 => Ok(BlobType::BtreeNode),
            7 => Ok(BlobType::SnapshotHeader),
            8 => Ok(BlobType::State),
            9 => Ok(BlobType::Signature),
            other => Err(format!("unknown blob type {}", other)),
        }
    }
}

bitflags::bitflags! {
    /// Per-blob codec choices, recorded in the packfile index and the
    /// catalogue.
    pub struct BlobFlags: u32 {
        const COMPRESSED = 0b0001;
        const ENCRYPTED  = 0b0010;
        /// The catalogue key was supplied by the caller instead of being
        /// the digest of the content (snapshot headers, signatures and
        /// error entries); the content re-hash on read is skipped.
        const KEYED      = 0b0100;
    }
}

impl Default for BlobFlags {
    fn default() -> Self {
        BlobFlags::empty()
    }
}

/// One blob in a packfile index.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexEntry {
    pub blob_type: BlobType,
    pub digest: Digest,
    pub offset: u64,
    pub length: u64,
    pub flags: BlobFlags,
}

impl IndexEntry {
    fn write_to(&self, out: &mut Vec<u8>) {
        out.push(u8::from(self.blob_type));
        out.extend_from_slice(&self.digest);
        out.extend_from_slice(&self.offset.to_le_bytes());
        out.extend_from_slice(&self.length.to_le_bytes());
        out.extend_from_slice(&self.flags.bits().to_le_bytes());
    }

    fn read_from(raw: &[u8]) -> Result<Self> {
        use std::convert::TryFrom;

        if raw.len() != INDEX_ENTRY_SIZE {
            return Err(Error::Integrity(format!(
                "truncated index entry ({} bytes)",
                raw.len()
            )));
        }

        let blob_type = BlobType::try_from(raw[0]).map_err(Error::Integrity)?;
        let digest: Digest = raw[1..33].try_into().unwrap();
        let offset = u64::from_le_bytes(raw[33..41].try_into().unwrap());
        let length = u64::from_le_bytes(raw[41..49].try_into().unwrap());
        let bits = u32::from_le_bytes(raw[49..53].try_into().unwrap());
        let flags = BlobFlags::from_bits(bits)
            .ok_or_else(|| Error::Integrity(format!("unknown blob flags {:#x}", bits)))?;

        Ok(IndexEntry { blob_type, digest, offset, length, flags })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Footer {
    pub version: u32,
    pub index_offset: u64,
    pub index_length: u64,
    pub count: u64,
    pub index_digest: Digest,
}

impl Footer {
    fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&PACKFILE_MAGIC);
        out.extend_from_slice(&self.version.to_le_bytes());
        out.extend_from_slice(&self.index_offset.to_le_bytes());
        out.extend_from_slice(&self.index_length.to_le_bytes());
        out.extend_from_slice(&self.count.to_le_bytes());
        out.extend_from_slice(&self.index_digest);
    }

    fn read_from(raw: &[u8]) -> Result<Self> {
        if raw.len() != FOOTER_SIZE {
            return Err(Error::Integrity(format!("truncated footer ({} bytes)", raw.len())));
        }
        if raw[0..4] != PACKFILE_MAGIC {
            return Err(Error::Integrity("packfile magic mismatch".to_string()));
        }

        let version = u32::from_le_bytes(raw[4..8].try_into().unwrap());
        if version != PACKFILE_VERSION {
            return Err(Error::Integrity(format!("unsupported packfile version {}", version)));
        }

        Ok(Footer {
            version,
            index_offset: u64::from_le_bytes(raw[8..16].try_into().unwrap()),
            index_length: u64::from_le_bytes(raw[16..24].try_into().unwrap()),
            count: u64::from_le_bytes(raw[24..32].try_into().unwrap()),
            index_digest: raw[32..64].try_into().unwrap(),
        })
    }
}

/// Builds one packfile in memory, blob by blob, until sealed.
pub struct PackfileWriter {
    body: Vec<u8>,
    entries: Vec<IndexEntry>,
    max_size: usize,
}

impl PackfileWriter {
    pub fn new(max_size: usize) -> Self {
        Self { body: Vec::new(), entries: Vec::new(), max_size }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn blob_count(&self) -> usize {
        self.entries.len()
    }

    /// Size the packfile would have if sealed right now.
    pub fn sealed_size(&self) -> usize {
        self.body.len() + self.entries.len() * INDEX_ENTRY_SIZE + FOOTER_SIZE
    }

    /// Whether a blob of `length` bytes still fits under the configured
    /// maximum. An empty packfile accepts one oversized blob rather than
    /// rejecting it forever.
    pub fn fits(&self, length: usize) -> bool {
        if self.is_empty() {
            return true;
        }
        self.sealed_size() + length + INDEX_ENTRY_SIZE <= self.max_size
    }

    /// Append an encoded blob. Returns the `(offset, length)` span it
    /// occupies in the packfile body.
    pub fn append(
        &mut self,
        blob_type: BlobType,
        digest: Digest,
        flags: BlobFlags,
        data: &[u8],
    ) -> Result<(u64, u64)> {
        if !self.fits(data.len()) {
            return Err(Error::Usage(format!(
                "blob of {} bytes does not fit in packfile ({} of {} bytes used)",
                data.len(),
                self.sealed_size(),
                self.max_size
            )));
        }

        let offset = self.body.len() as u64;
        let length = data.len() as u64;
        self.body.extend_from_slice(data);
        self.entries.push(IndexEntry { blob_type, digest, offset, length, flags });

        Ok((offset, length))
    }

    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    /// Serve a read from the not-yet-sealed body. Used so a snapshot in
    /// progress can read back blobs it just wrote.
    pub fn read(&self, offset: u64, length: u64) -> Option<&[u8]> {
        let start = offset as usize;
        let end = start.checked_add(length as usize)?;
        self.body.get(start..end)
    }

    /// Seal the packfile: append index and footer, compute the packfile
    /// identifier as the digest of the complete bytes.
    pub fn seal(self) -> Result<(Digest, Vec<u8>, Vec<IndexEntry>)> {
        let mut bytes = self.body;
        let index_offset = bytes.len() as u64;

        let mut index = Vec::with_capacity(self.entries.len() * INDEX_ENTRY_SIZE);
        for entry in &self.entries {
            entry.write_to(&mut index);
        }
        let index_digest = openssl::sha::sha256(&index);
        bytes.extend_from_slice(&index);

        let footer = Footer {
            version: PACKFILE_VERSION,
            index_offset,
            index_length: index.len() as u64,
            count: self.entries.len() as u64,
            index_digest,
        };
        footer.write_to(&mut bytes);

        let id = openssl::sha::sha256(&bytes);
        log::debug!(
            "sealed packfile {} ({} blobs, {} bytes)",
            digest_to_hex(&id),
            self.entries.len(),
            bytes.len()
        );

        Ok((id, bytes, self.entries))
    }
}

/// Read-side view of a sealed packfile. Footer magic and the index
/// digest are validated before any blob is served.
pub struct PackfileReader {
    bytes: Vec<u8>,
    footer: Footer,
    entries: Vec<IndexEntry>,
}

impl PackfileReader {
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        if bytes.len() < FOOTER_SIZE {
            return Err(Error::Integrity(format!("packfile too small ({} bytes)", bytes.len())));
        }

        let footer = Footer::read_from(&bytes[bytes.len() - FOOTER_SIZE..])?;

        let index_start = footer.index_offset as usize;
        let index_end = index_start
            .checked_add(footer.index_length as usize)
            .filter(|end| *end + FOOTER_SIZE == bytes.len())
            .ok_or_else(|| Error::Integrity("packfile index location out of bounds".to_string()))?;

        let index = &bytes[index_start..index_end];
        if openssl::sha::sha256(index) != footer.index_digest {
            return Err(Error::Integrity("packfile index digest mismatch".to_string()));
        }
        if footer.count as usize * INDEX_ENTRY_SIZE != index.len() {
            return Err(Error::Integrity("packfile index length mismatch".to_string()));
        }

        let mut entries = Vec::with_capacity(footer.count as usize);
        for raw in index.chunks(INDEX_ENTRY_SIZE) {
            entries.push(IndexEntry::read_from(raw)?);
        }

        Ok(Self { bytes, footer, entries })
    }

    pub fn footer(&self) -> &Footer {
        &self.footer
    }

    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    /// Read a blob span out of the body.
    pub fn read(&self, offset: u64, length: u64) -> Result<&[u8]> {
        let start = offset as usize;
        let end = start
            .checked_add(length as usize)
            .filter(|end| *end <= self.footer.index_offset as usize)
            .ok_or_else(|| {
                Error::Usage(format!("blob span {}+{} out of packfile body", offset, length))
            })?;
        Ok(&self.bytes[start..end])
    }
}

//! The virtual filesystem a snapshot captures: directory, file, xattr
//! and error entries, all serialized as blobs and linked through
//! digests.

mod summary;
pub use summary::*;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::Digest;

pub const VFS_VERSION: u32 = 1;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryKind {
    Directory,
    Regular,
    Symlink,
    Other,
}

/// Stat-shaped metadata captured for every entry.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct FileInfo {
    pub name: String,
    pub kind: EntryKind,
    pub size: u64,
    pub mode: u32,
    pub mod_time: DateTime<Utc>,
    pub uid: u32,
    pub gid: u32,
    pub nlink: u32,
    pub dev: u64,
    pub ino: u64,
}

impl FileInfo {
    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }
}

/// Reference from a file or directory entry to one of its extended
/// attributes; the value lives in its own `xattr` blob.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct XattrRef {
    pub name: String,
    pub digest: Digest,
    pub size: u64,
}

/// An extended attribute value.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct XattrEntry {
    pub version: u32,
    pub name: String,
    pub value: Vec<u8>,
}

/// One chunk of an object, in stream order.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ObjectChunk {
    pub digest: Digest,
    pub offset: u64,
    pub length: u32,
}

/// A whole file's content: its chunk digests in order plus the totals
/// derived while chunking.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Object {
    pub version: u32,
    pub content_type: String,
    pub total_length: u64,
    pub entropy: f64,
    pub chunks: Vec<ObjectChunk>,
}

/// Directory reference to one child, by digest.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ChildEntry {
    pub name: String,
    pub kind: EntryKind,
    pub digest: Digest,
    pub stat: FileInfo,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct DirEntry {
    pub version: u32,
    pub fileinfo: FileInfo,
    pub children: Vec<ChildEntry>,
    pub xattrs: Vec<XattrRef>,
    /// Head and tail of the snapshot error chain; only set on the root
    /// directory entry.
    pub error_first: Option<Digest>,
    pub error_last: Option<Digest>,
    pub summary: Summary,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct FileEntry {
    pub version: u32,
    pub fileinfo: FileInfo,
    /// Symlink target, empty otherwise.
    pub target: String,
    /// Content object; absent for symlinks and special files.
    pub object: Option<Digest>,
    pub xattrs: Vec<XattrRef>,
}

/// A recorded per-path failure, one link of the doubly linked error
/// chain. The links hold *identity digests*: the digest of the entry
/// serialized with both links cleared, which is also the key the blob
/// is catalogued under.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ErrorEntry {
    pub version: u32,
    pub pathname: String,
    pub message: String,
    pub predecessor: Option<Digest>,
    pub successor: Option<Digest>,
}

impl ErrorEntry {
    pub fn new(pathname: &str, message: &str) -> Self {
        Self {
            version: VFS_VERSION,
            pathname: pathname.to_string(),
            message: message.to_string(),
            predecessor: None,
            successor: None,
        }
    }

    /// Digest of the unlinked form; stable no matter how the entry is
    /// linked into the chain.
    pub fn identity(&self) -> Result<Digest> {
        let unlinked = ErrorEntry {
            version: self.version,
            pathname: self.pathname.clone(),
            message: self.message.clone(),
            predecessor: None,
            successor: None,
        };
        Ok(openssl::sha::sha256(&unlinked.to_bytes()?))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        rmp_serde::to_vec(self).map_err(|err| Error::encode("error entry", err))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        rmp_serde::from_slice(bytes).map_err(|err| Error::decode("error entry", err))
    }
}

/// Tagged entry as returned by pathname lookups; consumers dispatch on
/// the variant.
#[derive(Clone, Debug)]
pub enum Entry {
    Directory(DirEntry),
    File(FileEntry),
}

impl Entry {
    pub fn fileinfo(&self) -> &FileInfo {
        match self {
            Entry::Directory(entry) => &entry.fileinfo,
            Entry::File(entry) => &entry.fileinfo,
        }
    }
}

macro_rules! blob_codec {
    ($type:ty, $name:expr) => {
        impl $type {
            pub fn to_bytes(&self) -> Result<Vec<u8>> {
                rmp_serde::to_vec(self).map_err(|err| Error::encode($name, err))
            }

            pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
                rmp_serde::from_slice(bytes).map_err(|err| Error::decode($name, err))
            }
        }
    };
}

blob_codec!(DirEntry, "directory entry");
blob_codec!(FileEntry, "file entry");
blob_codec!(XattrEntry, "xattr entry");
blob_codec!(Object, "object");

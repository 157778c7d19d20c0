//! Snapshots: immutable, verifiable captures of a scanned tree, rooted
//! in a single header blob catalogued under the snapshot identifier.

mod header;
pub use header::*;

mod events;
pub use events::*;

pub mod importer;

pub mod exporter;

mod builder;
pub use builder::*;

mod check;
pub use check::*;

mod restore;
pub use restore::*;

use std::io::Read;
use std::sync::Arc;

use crate::btree::{BTree, RepositoryNodeStore};
use crate::error::{Error, Result};
use crate::identity;
use crate::packfile::BlobType;
use crate::repository::Repository;
use crate::snapshot::exporter::Exporter;
use crate::snapshot::importer::Importer;
use crate::tools::digest_to_hex;
use crate::vfs::{ChildEntry, DirEntry, Entry, ErrorEntry, FileEntry, Object};
use crate::Digest;

/// Order of the pathname index B-tree.
pub(crate) const INDEX_ORDER: usize = 50;

pub struct Snapshot {
    repository: Arc<Repository>,
    pub header: Header,
}

impl Snapshot {
    /// Build a new snapshot; see [`backup`].
    pub fn backup(
        repository: &Arc<Repository>,
        importer: &dyn Importer,
        options: &BackupOptions,
    ) -> Result<Digest> {
        builder::backup(repository, importer, options)
    }

    /// Load a snapshot by identifier.
    pub fn load(repository: Arc<Repository>, snapshot_id: &Digest) -> Result<Snapshot> {
        let bytes = repository
            .get_blob(BlobType::SnapshotHeader, snapshot_id)
            .map_err(|err| match err {
                Error::NotFound(_) => {
                    Error::NotFound(format!("snapshot {}", digest_to_hex(snapshot_id)))
                }
                other => other,
            })?;
        let header = Header::from_bytes(&bytes)?;
        if header.snapshot_id != *snapshot_id {
            return Err(Error::Integrity(format!(
                "snapshot {} header carries identifier {}",
                digest_to_hex(snapshot_id),
                header.snapshot_id_hex()
            )));
        }
        Ok(Snapshot { repository, header })
    }

    /// Identifiers of every snapshot in the repository.
    pub fn list(repository: &Repository) -> Vec<Digest> {
        repository.list_blobs(BlobType::SnapshotHeader)
    }

    /// Resolve a textual identifier prefix. A prefix matching exactly
    /// one snapshot resolves to it; anything else is an error.
    pub fn resolve_prefix(repository: &Repository, prefix: &str) -> Result<Digest> {
        let prefix = prefix.to_ascii_lowercase();
        if prefix.is_empty()
            || prefix.len() > 64
            || !prefix.chars().all(|c| c.is_ascii_hexdigit())
        {
            return Err(Error::Usage(format!("invalid snapshot prefix '{}'", prefix)));
        }

        let matches: Vec<Digest> = Self::list(repository)
            .into_iter()
            .filter(|id| digest_to_hex(id).starts_with(&prefix))
            .collect();

        match matches.len() {
            0 => Err(Error::NotFound(format!("snapshot with prefix '{}'", prefix))),
            1 => Ok(matches[0]),
            count => Err(Error::Usage(format!(
                "snapshot prefix '{}' is ambiguous ({} matches)",
                prefix, count
            ))),
        }
    }

    pub fn repository(&self) -> &Arc<Repository> {
        &self.repository
    }

    pub fn snapshot_id(&self) -> &Digest {
        &self.header.snapshot_id
    }

    fn index(&self) -> Result<BTree<String, Digest, RepositoryNodeStore<String, Digest>>> {
        BTree::open(
            RepositoryNodeStore::new(Arc::clone(&self.repository)),
            self.header.index,
            INDEX_ORDER,
        )
    }

    /// Entry digest for a pathname, through the index B-tree.
    pub fn lookup(&self, pathname: &str) -> Result<Option<Digest>> {
        self.index()?.lookup(&pathname.to_string())
    }

    /// Tagged entry for a pathname.
    pub fn stat(&self, pathname: &str) -> Result<Entry> {
        let digest = self.lookup(pathname)?.ok_or_else(|| {
            Error::NotFound(format!("'{}' in snapshot {}", pathname, self.header.short_id()))
        })?;

        match self.repository.get_blob(BlobType::Directory, &digest) {
            Ok(bytes) => Ok(Entry::Directory(DirEntry::from_bytes(&bytes)?)),
            Err(Error::NotFound(_)) => {
                let bytes = self.repository.get_blob(BlobType::File, &digest)?;
                Ok(Entry::File(FileEntry::from_bytes(&bytes)?))
            }
            Err(err) => Err(err),
        }
    }

    fn root_entry(&self) -> Result<DirEntry> {
        let bytes = self.repository.get_blob(BlobType::Directory, &self.header.root)?;
        DirEntry::from_bytes(&bytes)
    }

    /// Streaming reader over a file's content.
    pub fn reader(&self, pathname: &str) -> Result<ObjectReader> {
        let entry = match self.stat(pathname)? {
            Entry::File(entry) => entry,
            Entry::Directory(_) => {
                return Err(Error::Usage(format!("'{}' is a directory", pathname)))
            }
        };
        let object_digest = entry
            .object
            .ok_or_else(|| Error::Usage(format!("'{}' has no content", pathname)))?;

        let bytes = self.repository.get_blob(BlobType::Object, &object_digest)?;
        let object = Object::from_bytes(&bytes)?;
        Ok(ObjectReader {
            repository: Arc::clone(&self.repository),
            object,
            chunk_index: 0,
            buffer: Vec::new(),
            position: 0,
        })
    }

    /// Page through a directory's children. Returns the total count and
    /// the slice `[offset, min(offset + limit, total))`; a zero limit
    /// means no limit.
    pub fn children(
        &self,
        pathname: &str,
        offset: usize,
        limit: usize,
    ) -> Result<(usize, Vec<ChildEntry>)> {
        let entry = match self.stat(pathname)? {
            Entry::Directory(entry) => entry,
            Entry::File(_) => {
                return Err(Error::Usage(format!("'{}' is not a directory", pathname)))
            }
        };

        let total = entry.children.len();
        let limit = if limit == 0 { total } else { limit };
        let start = offset.min(total);
        let end = offset.saturating_add(limit).min(total);
        Ok((total, entry.children[start..end].to_vec()))
    }

    /// Page through the error chain; forward from the head, or backward
    /// from the tail with `backward`. Each entry's identity digest is
    /// re-derived and verified. A zero limit means no limit.
    pub fn errors(&self, offset: usize, limit: usize, backward: bool) -> Result<Vec<ErrorEntry>> {
        let limit = if limit == 0 { usize::MAX } else { limit };
        let mut cursor = if backward {
            self.root_entry()?.error_last
        } else {
            self.header.errors
        };

        let mut collected = Vec::new();
        let mut index = 0usize;
        while let Some(id) = cursor {
            if index >= offset.saturating_add(limit) {
                break;
            }

            let bytes = self.repository.get_blob(BlobType::Error, &id)?;
            let entry = ErrorEntry::from_bytes(&bytes)?;
            if entry.identity()? != id {
                return Err(Error::Integrity(format!(
                    "error entry {} failed identity verification",
                    digest_to_hex(&id)
                )));
            }

            cursor = if backward { entry.predecessor } else { entry.successor };
            if index >= offset {
                collected.push(entry);
            }
            index += 1;
        }
        Ok(collected)
    }

    /// Verify the snapshot's detached signature against the public key
    /// recorded in the header.
    pub fn verify_signature(&self) -> Result<bool> {
        if self.header.public_key.is_empty() {
            return Err(Error::Usage("snapshot is not signed".to_string()));
        }
        let public_key = base64::decode(&self.header.public_key)
            .map_err(|err| Error::Usage(format!("invalid public key in header - {}", err)))?;

        let signature =
            self.repository.get_blob(BlobType::Signature, &self.header.snapshot_id)?;
        let header_bytes =
            self.repository.get_blob(BlobType::SnapshotHeader, &self.header.snapshot_id)?;

        identity::verify(&public_key, &header_bytes, &signature)
    }

    /// Verify the snapshot; see [`check`].
    pub fn check(&self, pathname: &str, options: &CheckOptions) -> Result<bool> {
        check::check(self, pathname, options)
    }

    /// Restore the snapshot; see [`restore`].
    pub fn restore(
        &self,
        exporter: &dyn Exporter,
        base: &str,
        pathname: &str,
        options: &RestoreOptions,
    ) -> Result<()> {
        restore::restore(self, exporter, base, pathname, options)
    }
}

/// Reads a file's content chunk by chunk, on demand.
pub struct ObjectReader {
    repository: Arc<Repository>,
    object: Object,
    chunk_index: usize,
    buffer: Vec<u8>,
    position: usize,
}

impl ObjectReader {
    pub fn content_type(&self) -> &str {
        &self.object.content_type
    }

    pub fn total_length(&self) -> u64 {
        self.object.total_length
    }
}

impl Read for ObjectReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        loop {
            if self.position < self.buffer.len() {
                let count = (self.buffer.len() - self.position).min(buf.len());
                buf[..count].copy_from_slice(&self.buffer[self.position..self.position + count]);
                self.position += count;
                return Ok(count);
            }

            let chunk = match self.object.chunks.get(self.chunk_index) {
                Some(chunk) => chunk,
                None => return Ok(0),
            };
            self.buffer = self
                .repository
                .get_blob(BlobType::Chunk, &chunk.digest)
                .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err.to_string()))?;
            self.position = 0;
            self.chunk_index += 1;
        }
    }
}

//! Snapshot restore: walk the tree and stream file contents to an
//! exporter, then apply metadata. Directory attributes are applied
//! after the directory's children so restored timestamps survive.

use std::io::Write;

use crate::error::{Error, Result};
use crate::packfile::BlobType;
use crate::snapshot::events::{emit, Event, EventSender};
use crate::snapshot::exporter::Exporter;
use crate::snapshot::Snapshot;
use crate::vfs::{DirEntry, EntryKind, FileEntry, Object, XattrEntry, XattrRef};

pub struct RestoreOptions {
    /// Strip the snapshot's scanned-root prefix from output paths.
    pub rebase: bool,
    pub events: Option<EventSender>,
}

impl Default for RestoreOptions {
    fn default() -> RestoreOptions {
        RestoreOptions { rebase: true, events: None }
    }
}

/// Restore the subtree at `pathname` (`/` for everything) below
/// `base`.
pub fn restore(
    snapshot: &Snapshot,
    exporter: &dyn Exporter,
    base: &str,
    pathname: &str,
    options: &RestoreOptions,
) -> Result<()> {
    let (start_digest, start_path) = if pathname == "/" || pathname.is_empty() {
        (snapshot.header.root, snapshot.header.directory.clone())
    } else {
        let digest = snapshot.lookup(pathname)?.ok_or_else(|| {
            Error::NotFound(format!("'{}' in snapshot {}", pathname, snapshot.header.short_id()))
        })?;
        (digest, pathname.to_string())
    };

    let mapper = PathMapper {
        base: base.trim_end_matches('/').to_string(),
        prefix: if options.rebase { snapshot.header.directory.clone() } else { String::new() },
    };

    match snapshot.repository().get_blob(BlobType::Directory, &start_digest) {
        Ok(bytes) => {
            let entry = DirEntry::from_bytes(&bytes)?;
            restore_directory(snapshot, exporter, &entry, &start_path, &mapper, options)
        }
        Err(Error::NotFound(_)) => {
            restore_file_digest(snapshot, exporter, &start_digest, &start_path, &mapper, options)
        }
        Err(err) => Err(err),
    }
}

struct PathMapper {
    base: String,
    prefix: String,
}

impl PathMapper {
    fn map(&self, pathname: &str) -> String {
        let relative = if !self.prefix.is_empty() {
            pathname.strip_prefix(&self.prefix).unwrap_or(pathname)
        } else {
            pathname
        };
        format!("{}/{}", self.base, relative.trim_start_matches('/'))
    }
}

fn restore_directory(
    snapshot: &Snapshot,
    exporter: &dyn Exporter,
    entry: &DirEntry,
    pathname: &str,
    mapper: &PathMapper,
    options: &RestoreOptions,
) -> Result<()> {
    let destination = mapper.map(pathname);
    exporter.create_directory(&destination, &entry.fileinfo)?;
    restore_xattrs(snapshot, exporter, &destination, &entry.xattrs)?;

    for child in &entry.children {
        let child_path = format!("{}/{}", pathname.trim_end_matches('/'), child.name);
        match child.kind {
            EntryKind::Directory => {
                let bytes = snapshot.repository().get_blob(BlobType::Directory, &child.digest)?;
                let child_entry = DirEntry::from_bytes(&bytes)?;
                restore_directory(snapshot, exporter, &child_entry, &child_path, mapper, options)?;
            }
            _ => {
                restore_file_digest(
                    snapshot, exporter, &child.digest, &child_path, mapper, options,
                )?;
            }
        }
    }

    // children are done, directory metadata goes last
    exporter.set_attributes(&destination, &entry.fileinfo)?;
    emit(
        &options.events,
        Event::DirectoryOk {
            snapshot_id: snapshot.header.snapshot_id,
            pathname: pathname.to_string(),
        },
    );
    Ok(())
}

fn restore_file_digest(
    snapshot: &Snapshot,
    exporter: &dyn Exporter,
    digest: &crate::Digest,
    pathname: &str,
    mapper: &PathMapper,
    options: &RestoreOptions,
) -> Result<()> {
    let bytes = snapshot.repository().get_blob(BlobType::File, digest)?;
    let entry = FileEntry::from_bytes(&bytes)?;
    let destination = mapper.map(pathname);

    match entry.fileinfo.kind {
        EntryKind::Symlink => {
            exporter.create_symlink(&destination, &entry.target, &entry.fileinfo)?;
            exporter.set_attributes(&destination, &entry.fileinfo)?;
            return Ok(());
        }
        EntryKind::Regular => (),
        _ => {
            // sockets, devices and the like are not recreated
            log::debug!("skipping special file {}", pathname);
            return Ok(());
        }
    }

    let object_digest = entry.object.ok_or_else(|| {
        Error::Integrity(format!("file entry '{}' has no content object", pathname))
    })?;
    let object_bytes = snapshot.repository().get_blob(BlobType::Object, &object_digest)?;
    let object = Object::from_bytes(&object_bytes)?;

    let mut writer = exporter.create_file(&destination, &entry.fileinfo)?;
    for chunk in &object.chunks {
        let data = snapshot.repository().get_blob(BlobType::Chunk, &chunk.digest)?;
        writer.write_all(&data)?;
    }
    writer.flush()?;
    drop(writer);

    restore_xattrs(snapshot, exporter, &destination, &entry.xattrs)?;
    exporter.set_attributes(&destination, &entry.fileinfo)?;

    emit(
        &options.events,
        Event::FileOk {
            snapshot_id: snapshot.header.snapshot_id,
            pathname: pathname.to_string(),
            size: object.total_length,
        },
    );
    Ok(())
}

fn restore_xattrs(
    snapshot: &Snapshot,
    exporter: &dyn Exporter,
    destination: &str,
    xattrs: &[XattrRef],
) -> Result<()> {
    for reference in xattrs {
        let bytes = snapshot.repository().get_blob(BlobType::Xattr, &reference.digest)?;
        let entry = XattrEntry::from_bytes(&bytes)?;
        if let Err(err) = exporter.set_xattr(destination, &entry.name, &entry.value) {
            // target filesystem may not support xattrs
            log::debug!("unable to set xattr '{}' on {}: {}", entry.name, destination, err);
        }
    }
    Ok(())
}

//! Snapshot verification: walk the tree, fetch every referenced blob
//! and verify digests. Integrity failures are reported through the
//! event stream and the walk continues, so one run shows the full
//! extent of any corruption.

use crate::error::{Error, Result};
use crate::packfile::BlobType;
use crate::snapshot::events::{emit, Event, EventSender};
use crate::snapshot::Snapshot;
use crate::vfs::{DirEntry, EntryKind, FileEntry, Object};

pub struct CheckOptions {
    /// Fast mode confirms catalogue presence of chunk data instead of
    /// fetching and re-hashing it.
    pub fast: bool,
    pub events: Option<EventSender>,
}

impl Default for CheckOptions {
    fn default() -> CheckOptions {
        CheckOptions { fast: false, events: None }
    }
}

/// Verify the subtree at `pathname` (`/` for the whole snapshot).
/// Returns true iff nothing failed.
pub fn check(snapshot: &Snapshot, pathname: &str, options: &CheckOptions) -> Result<bool> {
    let mut ok = true;

    let (start_digest, start_path) = if pathname == "/" || pathname.is_empty() {
        (snapshot.header.root, snapshot.header.directory.clone())
    } else {
        let digest = snapshot.lookup(pathname)?.ok_or_else(|| {
            Error::NotFound(format!("'{}' in snapshot {}", pathname, snapshot.header.short_id()))
        })?;
        (digest, pathname.to_string())
    };

    // the starting entry may be a directory or a single file
    match snapshot.repository().get_blob(BlobType::Directory, &start_digest) {
        Ok(bytes) => {
            let entry = DirEntry::from_bytes(&bytes)?;
            check_directory(snapshot, &entry, &start_path, options, &mut ok);
        }
        Err(Error::NotFound(_)) => {
            check_file_digest(snapshot, &start_digest, &start_path, options, &mut ok);
        }
        Err(err) => {
            report(snapshot, options, &start_path, &err, &mut ok);
        }
    }

    Ok(ok)
}

fn check_directory(
    snapshot: &Snapshot,
    entry: &DirEntry,
    pathname: &str,
    options: &CheckOptions,
    ok: &mut bool,
) {
    for xattr in &entry.xattrs {
        check_blob(snapshot, BlobType::Xattr, &xattr.digest, pathname, options, ok);
    }

    for child in &entry.children {
        let child_path = format!("{}/{}", pathname.trim_end_matches('/'), child.name);
        match child.kind {
            EntryKind::Directory => {
                match snapshot.repository().get_blob(BlobType::Directory, &child.digest) {
                    Ok(bytes) => match DirEntry::from_bytes(&bytes) {
                        Ok(child_entry) => {
                            check_directory(snapshot, &child_entry, &child_path, options, ok)
                        }
                        Err(err) => report(snapshot, options, &child_path, &err, ok),
                    },
                    Err(err) => report(snapshot, options, &child_path, &err, ok),
                }
            }
            _ => check_file_digest(snapshot, &child.digest, &child_path, options, ok),
        }
    }

    emit(
        &options.events,
        Event::DirectoryOk {
            snapshot_id: snapshot.header.snapshot_id,
            pathname: pathname.to_string(),
        },
    );
}

fn check_file_digest(
    snapshot: &Snapshot,
    digest: &crate::Digest,
    pathname: &str,
    options: &CheckOptions,
    ok: &mut bool,
) {
    let entry = match snapshot.repository().get_blob(BlobType::File, digest) {
        Ok(bytes) => match FileEntry::from_bytes(&bytes) {
            Ok(entry) => entry,
            Err(err) => return report(snapshot, options, pathname, &err, ok),
        },
        Err(err) => return report(snapshot, options, pathname, &err, ok),
    };

    for xattr in &entry.xattrs {
        check_blob(snapshot, BlobType::Xattr, &xattr.digest, pathname, options, ok);
    }

    let object_digest = match entry.object {
        Some(digest) => digest,
        None => return, // symlinks and special files carry no content
    };

    let object = match snapshot.repository().get_blob(BlobType::Object, &object_digest) {
        Ok(bytes) => match Object::from_bytes(&bytes) {
            Ok(object) => object,
            Err(err) => return report(snapshot, options, pathname, &err, ok),
        },
        Err(err) => return report(snapshot, options, pathname, &err, ok),
    };

    let mut verified_length = 0u64;
    for chunk in &object.chunks {
        check_blob(snapshot, BlobType::Chunk, &chunk.digest, pathname, options, ok);
        verified_length += chunk.length as u64;
    }
    if verified_length != object.total_length {
        let err = Error::Integrity(format!(
            "object length mismatch ({} recorded, {} in chunks)",
            object.total_length, verified_length
        ));
        return report(snapshot, options, pathname, &err, ok);
    }

    emit(
        &options.events,
        Event::FileOk {
            snapshot_id: snapshot.header.snapshot_id,
            pathname: pathname.to_string(),
            size: object.total_length,
        },
    );
}

fn check_blob(
    snapshot: &Snapshot,
    blob_type: BlobType,
    digest: &crate::Digest,
    pathname: &str,
    options: &CheckOptions,
    ok: &mut bool,
) {
    if options.fast {
        if !snapshot.repository().has_blob(blob_type, digest) {
            let err = Error::NotFound(format!("{} blob", blob_type));
            report(snapshot, options, pathname, &err, ok);
        }
        return;
    }

    // digest verification happens inside get_blob
    if let Err(err) = snapshot.repository().get_blob(blob_type, digest) {
        report(snapshot, options, pathname, &err, ok);
    }
}

fn report(
    snapshot: &Snapshot,
    options: &CheckOptions,
    pathname: &str,
    err: &Error,
    ok: &mut bool,
) {
    *ok = false;
    log::warn!("check: {}: {}", pathname, err);
    emit(
        &options.events,
        Event::PathError {
            snapshot_id: snapshot.header.snapshot_id,
            pathname: pathname.to_string(),
            message: err.to_string(),
        },
    );
}

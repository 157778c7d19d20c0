//! The snapshot pipeline: consumes a scan stream, drives the chunker,
//! the repository and the index B-tree, and publishes a snapshot
//! header.
//!
//! Stages:
//!
//! 1. classify scan records (directories, files, xattrs, errors);
//! 2. ingest file content through a bounded worker pool;
//! 3. finalize directories bottom-up once every child is sealed;
//! 4. link recorded errors into the doubly linked chain (two passes:
//!    stage in memory, then publish with final links);
//! 5. build the pathname index B-tree and persist it;
//! 6. fill the header, commit the repository, write the header last.
//!
//! Per-path failures are recorded and the snapshot continues;
//! repository-wide failures abort without publishing a header.

use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;

use crate::btree::{self, ArenaStore, BTree, RepositoryNodeStore};
use crate::chunker::Chunker;
use crate::error::{Error, Result};
use crate::identity::Identity;
use crate::packfile::BlobType;
use crate::repository::Repository;
use crate::snapshot::events::{emit, Event, EventSender};
use crate::snapshot::header::{Context, Header, Metadata, Statistics};
use crate::snapshot::importer::{Importer, ScanRecord, ScanResult};
use crate::snapshot::INDEX_ORDER;
use crate::tools::histogram_entropy;
use crate::vfs::{
    ChildEntry, DirEntry, EntryKind, ErrorEntry, FileEntry, FileInfo, Object, ObjectChunk,
    Summary, XattrEntry, XattrRef, VFS_VERSION,
};
use crate::Digest;

/// Cooperative cancellation token shared with in-flight workers.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> CancelToken {
        CancelToken(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct BackupOptions {
    pub max_concurrency: usize,
    pub category: String,
    pub tags: Vec<String>,
    pub identity: Option<Identity>,
    pub events: Option<EventSender>,
    pub cancel: CancelToken,
}

impl Default for BackupOptions {
    fn default() -> BackupOptions {
        BackupOptions {
            max_concurrency: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            category: "default".to_string(),
            tags: Vec::new(),
            identity: None,
            events: None,
            cancel: CancelToken::new(),
        }
    }
}

/// What file ingestion produced for one regular file.
struct IngestedObject {
    object: Digest,
    content_type: String,
    entropy: f64,
    chunk_count: u64,
    total_length: u64,
}

struct FileResult {
    pathname: String,
    outcome: std::result::Result<IngestedObject, String>,
}

/// Build a snapshot of `importer`'s tree. Returns the snapshot
/// identifier on success; on failure or cancellation nothing is
/// published and the open packfile is discarded.
pub fn backup(
    repository: &Arc<Repository>,
    importer: &dyn Importer,
    options: &BackupOptions,
) -> Result<Digest> {
    repository.lock_writer()?;
    let result = backup_locked(repository, importer, options);
    if result.is_err() {
        if let Err(err) = repository.rollback() {
            log::warn!("rollback failed: {}", err);
        }
    }
    let _ = repository.unlock_writer();
    result
}

fn backup_locked(
    repository: &Arc<Repository>,
    importer: &dyn Importer,
    options: &BackupOptions,
) -> Result<Digest> {
    let started = Instant::now();
    let creation_time = Utc::now();

    let mut snapshot_id = [0u8; 32];
    openssl::rand::rand_bytes(&mut snapshot_id)
        .map_err(|err| Error::Config(format!("snapshot id generation failed - {}", err)))?;

    log::info!("snapshot {} of {} started", hex::encode(&snapshot_id[..4]), importer.root());

    let scan = importer.scan()?;

    // accumulators, owned by the classify loop
    let mut directories: BTreeMap<String, FileInfo> = BTreeMap::new();
    let mut regular_files: BTreeMap<String, FileInfo> = BTreeMap::new();
    let mut specials: BTreeMap<String, (FileInfo, String)> = BTreeMap::new();
    let mut xattrs: BTreeMap<String, Vec<XattrRef>> = BTreeMap::new();
    let mut errors: Vec<ErrorEntry> = Vec::new();

    let (task_sender, task_receiver) =
        crossbeam_channel::bounded::<ScanRecord>(options.max_concurrency.max(1) * 2);
    let (result_sender, result_receiver) = crossbeam_channel::unbounded::<FileResult>();

    std::thread::scope(|scope| {
        for _ in 0..options.max_concurrency.max(1) {
            let task_receiver = task_receiver.clone();
            let result_sender = result_sender.clone();
            let cancel = options.cancel.clone();
            scope.spawn(move || {
                for record in task_receiver.iter() {
                    if cancel.is_cancelled() {
                        continue; // drain without doing work
                    }
                    let outcome = ingest_file(repository, importer, &record, &cancel)
                        .map_err(|err| err.to_string());
                    let _ = result_sender.send(FileResult { pathname: record.pathname, outcome });
                }
            });
        }

        for result in scan {
            if options.cancel.is_cancelled() {
                break;
            }
            match result {
                ScanResult::Record(record) if record.is_xattr => {
                    match ingest_xattr(repository, importer, &record) {
                        Ok(reference) => {
                            xattrs.entry(record.pathname.clone()).or_default().push(reference)
                        }
                        Err(err) => record_error(
                            &mut errors,
                            options,
                            &snapshot_id,
                            &record.pathname,
                            &err.to_string(),
                        ),
                    }
                }
                ScanResult::Record(record) => match record.fileinfo.kind {
                    EntryKind::Directory => {
                        directories.insert(record.pathname.clone(), record.fileinfo);
                    }
                    EntryKind::Regular => {
                        regular_files.insert(record.pathname.clone(), record.fileinfo.clone());
                        if task_sender.send(record).is_err() {
                            break; // workers are gone
                        }
                    }
                    _ => {
                        specials.insert(record.pathname.clone(), (record.fileinfo, record.target));
                    }
                },
                ScanResult::Error(scan_error) => record_error(
                    &mut errors,
                    options,
                    &snapshot_id,
                    &scan_error.pathname,
                    &scan_error.message,
                ),
            }
        }
        drop(task_sender);
    });

    // workers have joined; collect their results
    let mut ingested: BTreeMap<String, IngestedObject> = BTreeMap::new();
    for result in result_receiver.try_iter() {
        match result.outcome {
            Ok(object) => {
                emit(
                    &options.events,
                    Event::FileOk {
                        snapshot_id,
                        pathname: result.pathname.clone(),
                        size: object.total_length,
                    },
                );
                ingested.insert(result.pathname, object);
            }
            Err(message) => {
                regular_files.remove(&result.pathname);
                record_error(&mut errors, options, &snapshot_id, &result.pathname, &message);
            }
        }
    }

    if options.cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }

    let root_path = importer.root();
    if !directories.contains_key(&root_path) {
        return Err(Error::Usage(format!(
            "scan produced no record for root directory '{}'",
            root_path
        )));
    }

    // stage 4, first pass: errors are staged, link them now that the
    // chain is complete
    let (error_head, error_tail) = publish_error_chain(repository, &mut errors)?;

    // file entries
    let mut entries: BTreeMap<String, (Digest, EntryKind, FileInfo)> = BTreeMap::new();
    for (pathname, fileinfo) in &regular_files {
        let object = match ingested.get(pathname) {
            Some(object) => object,
            None => continue, // cancelled before its worker got to it
        };
        let entry = FileEntry {
            version: VFS_VERSION,
            fileinfo: fileinfo.clone(),
            target: String::new(),
            object: Some(object.object),
            xattrs: xattrs.remove(pathname).unwrap_or_default(),
        };
        let digest = repository.put_blob(BlobType::File, &entry.to_bytes()?)?;
        entries.insert(pathname.clone(), (digest, EntryKind::Regular, fileinfo.clone()));
    }
    for (pathname, (fileinfo, target)) in &specials {
        let entry = FileEntry {
            version: VFS_VERSION,
            fileinfo: fileinfo.clone(),
            target: target.clone(),
            object: None,
            xattrs: xattrs.remove(pathname).unwrap_or_default(),
        };
        let digest = repository.put_blob(BlobType::File, &entry.to_bytes()?)?;
        entries.insert(pathname.clone(), (digest, fileinfo.kind, fileinfo.clone()));
    }

    // group children by parent directory
    let mut children_of: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for pathname in entries.keys().chain(directories.keys()) {
        if *pathname == root_path {
            continue;
        }
        if let Some(parent) = parent_of(pathname) {
            if directories.contains_key(&parent) {
                children_of.entry(parent).or_default().push(pathname.clone());
            }
        }
    }

    // stage 3: directories bottom-up, deepest first
    let mut directory_paths: Vec<String> = directories.keys().cloned().collect();
    directory_paths.sort_by_key(|path| std::cmp::Reverse(Path::new(path).components().count()));

    let mut summaries: BTreeMap<String, Summary> = BTreeMap::new();
    let mut root_summary = Summary::default();

    for pathname in directory_paths {
        let fileinfo = directories.get(&pathname).unwrap().clone();
        let mut summary = Summary::default();
        let mut children = Vec::new();

        for child_path in children_of.remove(&pathname).unwrap_or_default() {
            let (digest, kind, stat) = match entries.get(&child_path) {
                Some(entry) => entry.clone(),
                None => continue,
            };

            match kind {
                EntryKind::Directory => {
                    summary.directory.directories += 1;
                    if let Some(child_summary) = summaries.get(&child_path) {
                        summary.merge_below(child_summary);
                    }
                }
                EntryKind::Regular => {
                    summary.directory.files += 1;
                    if let Some(object) = ingested.get(&child_path) {
                        summary.directory.objects += 1;
                        summary.directory.chunks += object.chunk_count;
                        summary.directory.size += object.total_length;
                        summary.directory.entropy_sum += object.entropy;
                        summary.directory.record_mime(&object.content_type);
                    }
                }
                EntryKind::Symlink => summary.directory.symlinks += 1,
                EntryKind::Other => summary.directory.files += 1,
            }

            children.push(ChildEntry {
                name: Path::new(&child_path)
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_else(|| child_path.clone()),
                kind,
                digest,
                stat,
            });
        }

        children.sort_by(|a, b| a.name.cmp(&b.name));

        let is_root = pathname == root_path;
        if is_root {
            summary.directory.errors = errors.len() as u64;
        }

        let entry = DirEntry {
            version: VFS_VERSION,
            fileinfo: fileinfo.clone(),
            children,
            xattrs: xattrs.remove(&pathname).unwrap_or_default(),
            error_first: if is_root { error_head } else { None },
            error_last: if is_root { error_tail } else { None },
            summary: summary.clone(),
        };
        let digest = repository.put_blob(BlobType::Directory, &entry.to_bytes()?)?;
        emit(&options.events, Event::DirectoryOk { snapshot_id, pathname: pathname.clone() });

        if is_root {
            root_summary = summary.clone();
        }
        summaries.insert(pathname.clone(), summary);
        entries.insert(pathname, (digest, EntryKind::Directory, fileinfo));
    }

    let root_digest = entries.get(&root_path).unwrap().0;

    // stage 5: pathname index
    let mut index = BTree::new(ArenaStore::new(), INDEX_ORDER)?;
    for (pathname, (digest, _, _)) in &entries {
        index.insert(pathname.clone(), *digest)?;
    }
    let node_store: RepositoryNodeStore<String, Digest> =
        RepositoryNodeStore::new(Arc::clone(repository));
    let index_root = btree::persist(&index, &node_store)?;

    // auxiliary documents
    let statistics = Statistics {
        directories: directories.len() as u64,
        files: regular_files.len() as u64 + specials.len() as u64,
        symlinks: specials
            .values()
            .filter(|(fileinfo, _)| fileinfo.kind == EntryKind::Symlink)
            .count() as u64,
        errors: errors.len() as u64,
        objects: ingested.len() as u64,
        chunks: ingested.values().map(|object| object.chunk_count).sum(),
        bytes_scanned: ingested.values().map(|object| object.total_length).sum(),
    };
    let statistics_digest = repository.put_blob(BlobType::Object, &statistics.to_bytes()?)?;

    let metadata = Metadata {
        items: vec![
            ("importer.type".to_string(), importer.kind()),
            ("importer.origin".to_string(), importer.origin()),
            ("importer.root".to_string(), root_path.clone()),
        ],
    };
    let metadata_digest = repository.put_blob(BlobType::Object, &metadata.to_bytes()?)?;

    if options.cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }

    // stage 6: the header is the last thing written
    let mut header = Header::new(snapshot_id);
    header.creation_time = creation_time;
    header.creation_duration = started.elapsed();
    header.category = options.category.clone();
    header.tags = options.tags.clone();
    header.context = Context::capture();
    header.importer_type = importer.kind();
    header.importer_origin = importer.origin();
    header.directory = root_path;
    header.root = root_digest;
    header.metadata = metadata_digest;
    header.statistics = statistics_digest;
    header.errors = error_head;
    header.index = index_root;
    header.summary = root_summary;
    if let Some(ref identity) = options.identity {
        header.public_key = base64::encode(identity.public_key()?);
    }

    repository.commit()?;

    let header_bytes = header.to_bytes()?;
    repository.put_blob_keyed(BlobType::SnapshotHeader, snapshot_id, &header_bytes)?;
    if let Some(ref identity) = options.identity {
        let signature = identity.sign(&header_bytes)?;
        repository.put_blob_keyed(BlobType::Signature, snapshot_id, &signature)?;
    }
    repository.commit()?;

    emit(&options.events, Event::Done { snapshot_id });
    log::info!(
        "snapshot {} completed in {:.2?} ({} files, {} directories, {} errors)",
        hex::encode(&snapshot_id[..4]),
        started.elapsed(),
        statistics.files,
        statistics.directories,
        statistics.errors,
    );

    Ok(snapshot_id)
}

fn record_error(
    errors: &mut Vec<ErrorEntry>,
    options: &BackupOptions,
    snapshot_id: &Digest,
    pathname: &str,
    message: &str,
) {
    log::warn!("{}: {}", pathname, message);
    emit(
        &options.events,
        Event::PathError {
            snapshot_id: *snapshot_id,
            pathname: pathname.to_string(),
            message: message.to_string(),
        },
    );
    errors.push(ErrorEntry::new(pathname, message));
}

/// Second pass over the staged error chain: compute every identity,
/// fill predecessor/successor links, publish the blobs keyed by
/// identity. Returns the head and tail digests.
fn publish_error_chain(
    repository: &Repository,
    errors: &mut [ErrorEntry],
) -> Result<(Option<Digest>, Option<Digest>)> {
    if errors.is_empty() {
        return Ok((None, None));
    }

    let mut identities = Vec::with_capacity(errors.len());
    for error in errors.iter() {
        identities.push(error.identity()?);
    }

    for index in 0..errors.len() {
        errors[index].predecessor = index.checked_sub(1).map(|i| identities[i]);
        errors[index].successor = identities.get(index + 1).copied();
        repository.put_blob_keyed(BlobType::Error, identities[index], &errors[index].to_bytes()?)?;
    }

    Ok((identities.first().copied(), identities.last().copied()))
}

fn parent_of(pathname: &str) -> Option<String> {
    Path::new(pathname)
        .parent()
        .map(|parent| parent.to_string_lossy().into_owned())
}

fn detect_content_type(data: &[u8]) -> String {
    if data.is_empty() {
        return "application/x-empty".to_string();
    }
    match infer::get(data) {
        Some(kind) => kind.mime_type().to_string(),
        None if data.iter().all(|byte| !byte.is_ascii_control() || byte.is_ascii_whitespace()) => {
            "text/plain".to_string()
        }
        None => "application/octet-stream".to_string(),
    }
}

/// Chunk one file and store its chunks and object. Runs on a worker.
fn ingest_file(
    repository: &Repository,
    importer: &dyn Importer,
    record: &ScanRecord,
    cancel: &CancelToken,
) -> Result<IngestedObject> {
    let reader = importer.new_reader(&record.pathname)?;

    let mut chunks = Vec::new();
    let mut histogram = [0u64; 256];
    let mut total_length = 0u64;
    let mut content_type = String::new();

    for chunk in Chunker::new(reader, &repository.configuration().chunking) {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let chunk = chunk?;

        if chunks.is_empty() {
            content_type = detect_content_type(&chunk.data);
        }
        for byte in &chunk.data {
            histogram[*byte as usize] += 1;
        }
        total_length += chunk.data.len() as u64;

        let digest = repository.put_blob(BlobType::Chunk, &chunk.data)?;
        chunks.push(ObjectChunk {
            digest,
            offset: chunk.offset,
            length: chunk.data.len() as u32,
        });
    }

    if chunks.is_empty() {
        content_type = detect_content_type(b"");
    }

    let entropy = histogram_entropy(&histogram, total_length);
    let chunk_count = chunks.len() as u64;
    let object = Object {
        version: VFS_VERSION,
        content_type: content_type.clone(),
        total_length,
        entropy,
        chunks,
    };
    let digest = repository.put_blob(BlobType::Object, &object.to_bytes()?)?;

    Ok(IngestedObject {
        object: digest,
        content_type,
        entropy,
        chunk_count,
        total_length,
    })
}

/// Read one extended attribute and store it as an `xattr` blob.
fn ingest_xattr(
    repository: &Repository,
    importer: &dyn Importer,
    record: &ScanRecord,
) -> Result<XattrRef> {
    let mut reader =
        importer.new_extended_attribute_reader(&record.pathname, &record.xattr_name)?;
    let mut value = Vec::new();
    reader.read_to_end(&mut value)?;

    let entry = XattrEntry {
        version: VFS_VERSION,
        name: record.xattr_name.clone(),
        value,
    };
    let size = entry.value.len() as u64;
    let digest = repository.put_blob(BlobType::Xattr, &entry.to_bytes()?)?;

    Ok(XattrRef { name: record.xattr_name.clone(), digest, size })
}

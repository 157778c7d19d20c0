//! End-to-end scenarios over the filesystem backend.

use std::collections::BTreeMap;
use std::fs;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use cellar::btree::{self, ArenaStore, BTree, RepositoryNodeStore};
use cellar::config::RepositoryConfig;
use cellar::error::Error;
use cellar::packfile::BlobType;
use cellar::repository::Repository;
use cellar::snapshot::exporter::fs::FilesystemExporter;
use cellar::snapshot::exporter::Exporter;
use cellar::snapshot::importer::fs::FilesystemImporter;
use cellar::snapshot::importer::{Importer, ScanError, ScanResult};
use cellar::snapshot::{
    event_channel, BackupOptions, CancelToken, CheckOptions, Event, RestoreOptions, Snapshot,
};
use cellar::storage::{FilesystemBackend, Registry};
use cellar::vfs::Entry;
use cellar::Digest;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn small_chunk_config() -> RepositoryConfig {
    init_logging();
    let mut config = RepositoryConfig::new().unwrap();
    config.chunking.min_size = 16 * 1024;
    config.chunking.normal_size = 64 * 1024;
    config.chunking.max_size = 256 * 1024;
    config
}

fn create_repository(root: &Path, config: RepositoryConfig) -> Arc<Repository> {
    let backend = Box::new(FilesystemBackend::new(&root.to_string_lossy()));
    Arc::new(Repository::create(backend, config, None).unwrap())
}

fn open_repository(root: &Path) -> Arc<Repository> {
    let registry = Registry::with_defaults();
    let backend = registry.open(&root.to_string_lossy()).unwrap();
    Arc::new(Repository::open(backend, None).unwrap())
}

fn backup_path(repository: &Arc<Repository>, source: &Path) -> Digest {
    let importer = FilesystemImporter::new(&source.to_string_lossy()).unwrap();
    Snapshot::backup(repository, &importer, &BackupOptions::default()).unwrap()
}

fn pseudo_random(len: usize, seed: u64) -> Vec<u8> {
    let mut state = seed | 1;
    let mut out = Vec::with_capacity(len);
    while out.len() < len {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        out.extend_from_slice(&state.to_le_bytes());
    }
    out.truncate(len);
    out
}

#[test]
fn scenario_empty_snapshot() {
    let source = tempfile::tempdir().unwrap();
    let store = tempfile::tempdir().unwrap();
    let repository = create_repository(&store.path().join("repo"), small_chunk_config());

    let snapshot_id = backup_path(&repository, source.path());

    let snapshots = Snapshot::list(&repository);
    assert_eq!(snapshots, vec![snapshot_id]);

    let snapshot = Snapshot::load(Arc::clone(&repository), &snapshot_id).unwrap();
    let root = snapshot.header.directory.clone();
    let (total, children) = snapshot.children(&root, 0, 0).unwrap();
    assert_eq!(total, 0);
    assert!(children.is_empty());

    assert_eq!(snapshot.header.summary.directory.files, 0);
    assert_eq!(snapshot.header.summary.total_size(), 0);
    assert_eq!(snapshot.header.summary.total_errors(), 0);

    assert!(snapshot.check("/", &CheckOptions::default()).unwrap());
}

#[test]
fn scenario_identical_files_deduplicate() {
    let source = tempfile::tempdir().unwrap();
    fs::write(source.path().join("a.txt"), b"hello").unwrap();
    fs::write(source.path().join("b.txt"), b"hello").unwrap();

    let store = tempfile::tempdir().unwrap();
    let repository = create_repository(&store.path().join("repo"), small_chunk_config());
    let snapshot_id = backup_path(&repository, source.path());

    // one chunk in the catalogue, no matter how many files carried it
    assert_eq!(repository.list_blobs(BlobType::Chunk).len(), 1);
    // identical content collapses to one object as well
    assert_eq!(repository.list_blobs(BlobType::Object).len(), 1 + 2); // + statistics and metadata documents

    let snapshot = Snapshot::load(Arc::clone(&repository), &snapshot_id).unwrap();
    let root = snapshot.header.directory.clone();
    let (total, children) = snapshot.children(&root, 0, 0).unwrap();
    assert_eq!(total, 2);

    let mut objects = Vec::new();
    for child in &children {
        match snapshot.stat(&format!("{}/{}", root, child.name)).unwrap() {
            Entry::File(entry) => objects.push(entry.object.unwrap()),
            Entry::Directory(_) => panic!("expected files"),
        }
    }
    assert_eq!(objects[0], objects[1]);

    assert!(snapshot.check("/", &CheckOptions::default()).unwrap());
}

#[test]
fn scenario_multi_chunk_file() {
    let source = tempfile::tempdir().unwrap();
    let data = pseudo_random(2 * 1024 * 1024, 0xfeed);
    fs::write(source.path().join("large.bin"), &data).unwrap();

    let store = tempfile::tempdir().unwrap();
    let config = small_chunk_config();
    let min_size = config.chunking.min_size;
    let max_size = config.chunking.max_size;
    let repository = create_repository(&store.path().join("repo"), config);
    let snapshot_id = backup_path(&repository, source.path());

    let snapshot = Snapshot::load(Arc::clone(&repository), &snapshot_id).unwrap();
    let pathname = format!("{}/large.bin", snapshot.header.directory);
    let entry = match snapshot.stat(&pathname).unwrap() {
        Entry::File(entry) => entry,
        Entry::Directory(_) => panic!("expected a file"),
    };

    let object_bytes = repository
        .get_blob(BlobType::Object, &entry.object.unwrap())
        .unwrap();
    let object = cellar::vfs::Object::from_bytes(&object_bytes).unwrap();

    assert!(object.chunks.len() >= 8, "only {} chunks", object.chunks.len());
    assert_eq!(object.total_length, data.len() as u64);

    let mut offset = 0u64;
    for (index, chunk) in object.chunks.iter().enumerate() {
        assert_eq!(chunk.offset, offset);
        offset += chunk.length as u64;
        assert!(chunk.length <= max_size);
        if index + 1 != object.chunks.len() {
            assert!(chunk.length >= min_size);
        }
    }
    assert_eq!(offset, data.len() as u64);

    // streamed read reproduces the input bit-exactly
    let mut reader = snapshot.reader(&pathname).unwrap();
    let mut restored = Vec::new();
    reader.read_to_end(&mut restored).unwrap();
    assert_eq!(restored, data);
}

#[test]
fn scenario_corruption_detected_by_check() {
    let source = tempfile::tempdir().unwrap();
    fs::write(source.path().join("victim.bin"), vec![0xaau8; 64 * 1024]).unwrap();

    let store = tempfile::tempdir().unwrap();
    let repo_root = store.path().join("repo");
    let mut config = small_chunk_config();
    config.compression = None;
    let repository = create_repository(&repo_root, config);
    let snapshot_id = backup_path(&repository, source.path());

    // load the header before corrupting anything
    let snapshot = Snapshot::load(Arc::clone(&repository), &snapshot_id).unwrap();

    // the first packfile sealed holds the chunk at body offset zero;
    // it is the big one
    let mut packfiles: Vec<_> = fs::read_dir(repo_root.join("packfiles"))
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .collect();
    packfiles.sort_by_key(|path| std::cmp::Reverse(fs::metadata(path).unwrap().len()));
    let victim = &packfiles[0];

    let mut bytes = fs::read(victim).unwrap();
    bytes[10] ^= 0x01;
    fs::write(victim, &bytes).unwrap();

    let (events_tx, events_rx) = event_channel();
    let options = CheckOptions { fast: false, events: Some(events_tx) };
    let ok = snapshot.check("/", &options).unwrap();
    assert!(!ok);

    let mut integrity_errors = 0;
    for event in events_rx.try_iter() {
        if let Event::PathError { pathname, message, .. } = event {
            assert!(pathname.ends_with("victim.bin"), "unexpected path {}", pathname);
            assert!(message.contains("integrity"), "unexpected message {}", message);
            integrity_errors += 1;
        }
    }
    assert_eq!(integrity_errors, 1);

    // fast mode only checks catalogue presence and stays green
    assert!(snapshot.check("/", &CheckOptions { fast: true, events: None }).unwrap());
}

/// Importer wrapper that trips a cancellation token after a number of
/// records, to make cancelled builds deterministic.
struct CancellingImporter {
    inner: FilesystemImporter,
    cancel: CancelToken,
    after: usize,
}

impl Importer for CancellingImporter {
    fn origin(&self) -> String {
        self.inner.origin()
    }

    fn kind(&self) -> String {
        self.inner.kind()
    }

    fn root(&self) -> String {
        self.inner.root()
    }

    fn scan(&self) -> cellar::Result<Box<dyn Iterator<Item = ScanResult> + Send>> {
        let cancel = self.cancel.clone();
        let after = self.after;
        let inner = self.inner.scan()?;
        Ok(Box::new(inner.enumerate().map(move |(index, result)| {
            if index + 1 == after {
                cancel.cancel();
            }
            result
        })))
    }

    fn new_reader(&self, pathname: &str) -> cellar::Result<Box<dyn Read + Send>> {
        self.inner.new_reader(pathname)
    }

    fn new_extended_attribute_reader(
        &self,
        pathname: &str,
        name: &str,
    ) -> cellar::Result<Box<dyn Read + Send>> {
        self.inner.new_extended_attribute_reader(pathname, name)
    }

    fn get_extended_attributes(
        &self,
        pathname: &str,
    ) -> cellar::Result<Vec<cellar::snapshot::importer::ExtendedAttribute>> {
        self.inner.get_extended_attributes(pathname)
    }

    fn close(&mut self) -> cellar::Result<()> {
        self.inner.close()
    }
}

#[test]
fn scenario_cancelled_build_keeps_dedup() {
    let source = tempfile::tempdir().unwrap();
    for index in 0..24 {
        fs::write(
            source.path().join(format!("file-{:02}.bin", index)),
            pseudo_random(32 * 1024, 0x1000 + index),
        )
        .unwrap();
    }

    let store = tempfile::tempdir().unwrap();
    let repo_root = store.path().join("repo");
    let mut config = small_chunk_config();
    // small packfiles so several seal before the cancellation
    config.packfile.max_size = 64 * 1024;
    let repository = create_repository(&repo_root, config);

    let cancel = CancelToken::new();
    let importer = CancellingImporter {
        inner: FilesystemImporter::new(&source.path().to_string_lossy()).unwrap(),
        cancel: cancel.clone(),
        after: 20,
    };
    // one worker and a shallow task queue: scan backpressure guarantees
    // most dispatched files are ingested before the token trips
    let options = BackupOptions { cancel, max_concurrency: 1, ..Default::default() };

    match Snapshot::backup(&repository, &importer, &options) {
        Err(Error::Cancelled) => (),
        other => panic!("expected cancellation, got {:?}", other.map(|_| ())),
    }

    // no header was published
    assert!(Snapshot::list(&repository).is_empty());
    drop(repository);

    // chunks from sealed packfiles survived the cancellation
    let repository = open_repository(&repo_root);
    let surviving: Vec<Digest> = repository.list_blobs(BlobType::Chunk);
    assert!(!surviving.is_empty());

    // a successful snapshot over the same data reuses them
    let snapshot_id = backup_path(&repository, source.path());
    let snapshot = Snapshot::load(Arc::clone(&repository), &snapshot_id).unwrap();
    assert!(snapshot.check("/", &CheckOptions::default()).unwrap());

    let all_chunks = repository.list_blobs(BlobType::Chunk);
    for chunk in &surviving {
        assert!(all_chunks.contains(chunk), "sealed chunk was lost");
    }
}

#[test]
fn scenario_restore_round_trip() -> anyhow::Result<()> {
    use std::os::unix::fs::MetadataExt;
    use std::os::unix::fs::PermissionsExt;

    let source = tempfile::tempdir()?;
    let mut expected: BTreeMap<String, Vec<u8>> = BTreeMap::new();
    for dir_index in 0..10 {
        let dir = source.path().join(format!("dir-{}", dir_index));
        fs::create_dir_all(dir.join("nested"))?;
        for file_index in 0..100 {
            let data = pseudo_random(512 + file_index * 7, (dir_index * 1000 + file_index) as u64);
            let relative = format!("dir-{}/nested/file-{:03}", dir_index, file_index);
            fs::write(source.path().join(&relative), &data)?;
            expected.insert(relative, data);
        }
    }
    fs::set_permissions(
        source.path().join("dir-0/nested/file-000"),
        fs::Permissions::from_mode(0o600),
    )?;
    std::os::unix::fs::symlink("nested/file-000", source.path().join("dir-0/link"))?;

    // xattrs are filesystem dependent; only assert them when they work
    let xattrs_supported =
        xattr::set(source.path().join("dir-0/nested/file-000"), "user.cellar.test", b"42").is_ok();

    let store = tempfile::tempdir()?;
    let repository = create_repository(&store.path().join("repo"), small_chunk_config());
    let snapshot_id = backup_path(&repository, source.path());
    let snapshot = Snapshot::load(Arc::clone(&repository), &snapshot_id)?;

    let target = tempfile::tempdir()?;
    let exporter = FilesystemExporter::new(&target.path().to_string_lossy());
    snapshot.restore(&exporter, &exporter.root(), "/", &RestoreOptions::default())?;

    for (relative, data) in &expected {
        let source_path = source.path().join(relative);
        let restored_path = target.path().join(relative);

        let restored = fs::read(&restored_path)?;
        assert_eq!(&restored, data, "{} differs", relative);

        let source_meta = fs::metadata(&source_path)?;
        let restored_meta = fs::metadata(&restored_path)?;
        assert_eq!(source_meta.mode() & 0o7777, restored_meta.mode() & 0o7777);
        assert_eq!(source_meta.mtime(), restored_meta.mtime());
    }

    let link = fs::read_link(target.path().join("dir-0/link"))?;
    assert_eq!(link.to_string_lossy(), "nested/file-000");

    if xattrs_supported {
        let value = xattr::get(target.path().join("dir-0/nested/file-000"), "user.cellar.test")?
            .expect("restored xattr missing");
        assert_eq!(value, b"42");
    }
    Ok(())
}

/// Importer wrapper injecting scan errors, to exercise the error
/// chain deterministically.
struct FailingImporter {
    inner: FilesystemImporter,
    failures: usize,
}

impl Importer for FailingImporter {
    fn origin(&self) -> String {
        self.inner.origin()
    }

    fn kind(&self) -> String {
        self.inner.kind()
    }

    fn root(&self) -> String {
        self.inner.root()
    }

    fn scan(&self) -> cellar::Result<Box<dyn Iterator<Item = ScanResult> + Send>> {
        let inner = self.inner.scan()?;
        let injected: Vec<ScanResult> = (0..self.failures)
            .map(|index| {
                ScanResult::Error(ScanError {
                    pathname: format!("/missing/entry-{:02}", index),
                    message: "permission denied".to_string(),
                })
            })
            .collect();
        Ok(Box::new(inner.chain(injected.into_iter())))
    }

    fn new_reader(&self, pathname: &str) -> cellar::Result<Box<dyn Read + Send>> {
        self.inner.new_reader(pathname)
    }

    fn new_extended_attribute_reader(
        &self,
        pathname: &str,
        name: &str,
    ) -> cellar::Result<Box<dyn Read + Send>> {
        self.inner.new_extended_attribute_reader(pathname, name)
    }

    fn get_extended_attributes(
        &self,
        pathname: &str,
    ) -> cellar::Result<Vec<cellar::snapshot::importer::ExtendedAttribute>> {
        self.inner.get_extended_attributes(pathname)
    }

    fn close(&mut self) -> cellar::Result<()> {
        self.inner.close()
    }
}

#[test]
fn scenario_error_chain_pagination() {
    let source = tempfile::tempdir().unwrap();
    fs::write(source.path().join("ok.txt"), b"fine").unwrap();

    let store = tempfile::tempdir().unwrap();
    let repository = create_repository(&store.path().join("repo"), small_chunk_config());

    let importer = FailingImporter {
        inner: FilesystemImporter::new(&source.path().to_string_lossy()).unwrap(),
        failures: 7,
    };
    let snapshot_id =
        Snapshot::backup(&repository, &importer, &BackupOptions::default()).unwrap();
    let snapshot = Snapshot::load(Arc::clone(&repository), &snapshot_id).unwrap();

    assert_eq!(snapshot.header.summary.total_errors(), 7);
    assert!(snapshot.header.errors.is_some());

    let forward = snapshot.errors(0, 0, false).unwrap();
    assert_eq!(forward.len(), 7);
    for (index, entry) in forward.iter().enumerate() {
        assert_eq!(entry.pathname, format!("/missing/entry-{:02}", index));
    }

    // backward walk is the exact reverse
    let backward = snapshot.errors(0, 0, true).unwrap();
    let mut reversed = backward.clone();
    reversed.reverse();
    assert_eq!(
        forward.iter().map(|e| &e.pathname).collect::<Vec<_>>(),
        reversed.iter().map(|e| &e.pathname).collect::<Vec<_>>()
    );

    // links are mutually consistent
    for pair in forward.windows(2) {
        assert_eq!(pair[0].successor, Some(pair[1].identity().unwrap()));
        assert_eq!(pair[1].predecessor, Some(pair[0].identity().unwrap()));
    }
    assert_eq!(forward[0].predecessor, None);
    assert_eq!(forward[6].successor, None);

    // offset/limit slicing, both directions, clamped at the end
    let page = snapshot.errors(2, 3, false).unwrap();
    assert_eq!(
        page.iter().map(|e| &e.pathname).collect::<Vec<_>>(),
        forward[2..5].iter().map(|e| &e.pathname).collect::<Vec<_>>()
    );
    let clamped = snapshot.errors(5, 10, false).unwrap();
    assert_eq!(clamped.len(), 2);
    let clamped_backward = snapshot.errors(5, 10, true).unwrap();
    assert_eq!(clamped_backward.len(), 2);
    assert_eq!(clamped_backward[0].pathname, backward[5].pathname);
}

#[test]
fn scenario_snapshot_prefix_resolution() {
    let source = tempfile::tempdir().unwrap();
    fs::write(source.path().join("one.txt"), b"one").unwrap();

    let store = tempfile::tempdir().unwrap();
    let repository = create_repository(&store.path().join("repo"), small_chunk_config());
    let snapshot_id = backup_path(&repository, source.path());

    let hex_id = hex::encode(snapshot_id);
    assert_eq!(Snapshot::resolve_prefix(&repository, &hex_id[..8]).unwrap(), snapshot_id);
    assert_eq!(Snapshot::resolve_prefix(&repository, &hex_id).unwrap(), snapshot_id);

    match Snapshot::resolve_prefix(&repository, "zz") {
        Err(Error::Usage(_)) => (),
        other => panic!("expected usage error, got {:?}", other.map(|_| ())),
    }
    match Snapshot::resolve_prefix(&repository, "") {
        Err(Error::Usage(_)) => (),
        other => panic!("expected usage error, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn scenario_signed_snapshot() {
    let source = tempfile::tempdir().unwrap();
    fs::write(source.path().join("doc.txt"), b"signed content").unwrap();

    let store = tempfile::tempdir().unwrap();
    let repository = create_repository(&store.path().join("repo"), small_chunk_config());

    let importer = FilesystemImporter::new(&source.path().to_string_lossy()).unwrap();
    let options = BackupOptions {
        identity: Some(cellar::identity::Identity::generate("tester@example.org").unwrap()),
        ..Default::default()
    };
    let snapshot_id = Snapshot::backup(&repository, &importer, &options).unwrap();

    let snapshot = Snapshot::load(Arc::clone(&repository), &snapshot_id).unwrap();
    assert!(!snapshot.header.public_key.is_empty());
    assert!(snapshot.verify_signature().unwrap());
}

#[test]
fn scenario_snapshot_header_is_immutable() {
    let source = tempfile::tempdir().unwrap();
    fs::write(source.path().join("stable.txt"), b"stable").unwrap();

    let store = tempfile::tempdir().unwrap();
    let repo_root = store.path().join("repo");
    let repository = create_repository(&repo_root, small_chunk_config());
    let snapshot_id = backup_path(&repository, source.path());

    let first = repository.get_blob(BlobType::SnapshotHeader, &snapshot_id).unwrap();
    let second = repository.get_blob(BlobType::SnapshotHeader, &snapshot_id).unwrap();
    assert_eq!(first, second);

    drop(repository);
    let reopened = open_repository(&repo_root);
    let third = reopened.get_blob(BlobType::SnapshotHeader, &snapshot_id).unwrap();
    assert_eq!(first, third);
}

#[test]
fn scenario_index_btree_persisted_in_repository() {
    let store = tempfile::tempdir().unwrap();
    let repository = create_repository(&store.path().join("repo"), small_chunk_config());

    let mut tree: BTree<String, u64, _> = BTree::new(ArenaStore::new(), 8).unwrap();
    for index in 0..200u64 {
        tree.insert(format!("/path/{:04}", index), index).unwrap();
    }

    let node_store: RepositoryNodeStore<String, u64> =
        RepositoryNodeStore::new(Arc::clone(&repository));
    let root = btree::persist(&tree, &node_store).unwrap();
    repository.commit().unwrap();

    let reopened: BTree<String, u64, RepositoryNodeStore<String, u64>> = BTree::open(
        RepositoryNodeStore::new(Arc::clone(&repository)),
        root,
        8,
    )
    .unwrap();

    assert_eq!(reopened.lookup(&"/path/0123".to_string()).unwrap(), Some(123));
    assert_eq!(reopened.lookup(&"/path/9999".to_string()).unwrap(), None);

    let scanned: Vec<u64> =
        reopened.scan().unwrap().map(|entry| entry.unwrap().1).collect();
    assert_eq!(scanned, (0..200).collect::<Vec<u64>>());

    let ranged: Vec<u64> = reopened
        .range(&"/path/0010".to_string(), &"/path/0015".to_string())
        .unwrap()
        .map(|entry| entry.unwrap().1)
        .collect();
    assert_eq!(ranged, (10..=15).collect::<Vec<u64>>());
}

#[test]
fn scenario_reopened_repository_deduplicates() {
    let source = tempfile::tempdir().unwrap();
    fs::write(source.path().join("data.bin"), pseudo_random(200 * 1024, 0xbeef)).unwrap();

    let store = tempfile::tempdir().unwrap();
    let repo_root = store.path().join("repo");
    let repository = create_repository(&repo_root, small_chunk_config());
    backup_path(&repository, source.path());
    let chunks_after_first = repository.list_blobs(BlobType::Chunk).len();
    let packfiles_after_first = fs::read_dir(repo_root.join("packfiles")).unwrap().count();
    drop(repository);

    // same data, fresh process: nothing new to upload but header and
    // snapshot-scoped metadata
    let repository = open_repository(&repo_root);
    backup_path(&repository, source.path());
    assert_eq!(repository.list_blobs(BlobType::Chunk).len(), chunks_after_first);

    let packfiles_after_second = fs::read_dir(repo_root.join("packfiles")).unwrap().count();
    assert!(packfiles_after_second > packfiles_after_first);
    assert_eq!(Snapshot::list(&repository).len(), 2);
}

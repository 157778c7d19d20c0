//! The repository coordinator: blob-by-digest put/get on top of the
//! catalogue, the packfile writer and the codec.
//!
//! Writes deduplicate: a blob whose digest is already catalogued (or
//! sitting in the open packfile) costs one lookup and no I/O. Concurrent
//! writers of the same blob are collapsed to a single encode and write
//! through a per-`(type, digest)` single-flight set.
//!
//! Reads are tamper-checked: the decoded blob is re-hashed and compared
//! against the requested digest before it is returned, except for blobs
//! catalogued under a caller-supplied key (`KEYED`), whose identity is
//! verified by the owning layer.

use std::collections::HashSet;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::codec::Codec;
use crate::config::RepositoryConfig;
use crate::crypto::CryptConfig;
use crate::error::{Error, Result};
use crate::packfile::{BlobFlags, BlobType, PackfileReader, PackfileWriter};
use crate::state::{Location, StateLog};
use crate::storage::Backend;
use crate::tools::digest_to_hex;
use crate::Digest;

/// Name of the lock serializing snapshot writers.
pub const WRITER_LOCK: &str = "writer";

const TRANSPORT_RETRIES: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(100);

pub struct Repository {
    backend: Box<dyn Backend>,
    config: RepositoryConfig,
    codec: Codec,
    state: StateLog,
    current: Mutex<Option<PackfileWriter>>,
    inflight: Mutex<HashSet<(BlobType, Digest)>>,
    inflight_done: Condvar,
}

impl Repository {
    /// Initialize a new repository at the backend location.
    ///
    /// When the configuration asks for encryption, a passphrase must be
    /// supplied; the derived key is checked into the configuration as an
    /// encrypted canary.
    pub fn create(
        backend: Box<dyn Backend>,
        mut config: RepositoryConfig,
        passphrase: Option<&[u8]>,
    ) -> Result<Repository> {
        config.validate()?;

        let crypt = match config.encryption.as_mut() {
            Some(encryption) => {
                let passphrase = passphrase.ok_or_else(|| {
                    Error::Config("encryption requested but no passphrase given".to_string())
                })?;
                let crypt = CryptConfig::new(encryption.kdf.derive_key(passphrase)?);
                encryption.canary = crypt.make_canary()?;
                Some(Arc::new(crypt))
            }
            None => None,
        };

        backend.create(&config.to_bytes()?)?;
        log::info!("created repository {} at {}", config.repository_id, backend.location());

        let codec = Codec::new(config.compression.clone(), crypt);
        Ok(Repository {
            backend,
            config,
            codec,
            state: StateLog::new(),
            current: Mutex::new(None),
            inflight: Mutex::new(HashSet::new()),
            inflight_done: Condvar::new(),
        })
    }

    /// Open an existing repository. A wrong passphrase is rejected by
    /// the configuration canary before any blob is read.
    pub fn open(backend: Box<dyn Backend>, passphrase: Option<&[u8]>) -> Result<Repository> {
        let config = RepositoryConfig::from_bytes(&backend.open()?)?;

        let crypt = match config.encryption.as_ref() {
            Some(encryption) => {
                let passphrase = passphrase.ok_or_else(|| {
                    Error::Config("repository is encrypted, passphrase required".to_string())
                })?;
                let crypt = CryptConfig::new(encryption.kdf.derive_key(passphrase)?);
                crypt.check_canary(&encryption.canary)?;
                Some(Arc::new(crypt))
            }
            None => None,
        };

        let codec = Codec::new(config.compression.clone(), crypt);
        let state = StateLog::load(backend.as_ref(), &codec)?;

        Ok(Repository {
            backend,
            config,
            codec,
            state,
            current: Mutex::new(None),
            inflight: Mutex::new(HashSet::new()),
            inflight_done: Condvar::new(),
        })
    }

    pub fn configuration(&self) -> &RepositoryConfig {
        &self.config
    }

    pub fn location(&self) -> &str {
        self.backend.location()
    }

    /// Digest of arbitrary bytes under the configured hash.
    pub fn hash(&self, data: &[u8]) -> Digest {
        openssl::sha::sha256(data)
    }

    /// Store a content-addressed blob, deduplicated. Returns its digest.
    pub fn put_blob(&self, blob_type: BlobType, data: &[u8]) -> Result<Digest> {
        let digest = self.hash(data);
        self.put_blob_inner(blob_type, digest, data, BlobFlags::empty())?;
        Ok(digest)
    }

    /// Store a blob catalogued under a caller-supplied key (snapshot
    /// headers, signatures, error entries). The content re-hash on read
    /// is skipped for these; the owning layer verifies identity.
    pub fn put_blob_keyed(&self, blob_type: BlobType, digest: Digest, data: &[u8]) -> Result<()> {
        self.put_blob_inner(blob_type, digest, data, BlobFlags::KEYED)
    }

    fn put_blob_inner(
        &self,
        blob_type: BlobType,
        digest: Digest,
        data: &[u8],
        extra_flags: BlobFlags,
    ) -> Result<()> {
        if !self.flight_begin(blob_type, digest) {
            // someone else materialized it while we waited
            return Ok(());
        }

        let result = self.write_blob(blob_type, digest, data, extra_flags);
        self.flight_end(blob_type, digest);
        result
    }

    /// Returns true when the caller becomes responsible for writing the
    /// blob. Returns false only once the blob is visible.
    fn flight_begin(&self, blob_type: BlobType, digest: Digest) -> bool {
        let key = (blob_type, digest);
        let mut inflight = self.inflight.lock().unwrap();
        loop {
            if self.has_blob(blob_type, &digest) {
                return false;
            }
            if !inflight.contains(&key) {
                inflight.insert(key);
                return true;
            }
            inflight = self.inflight_done.wait(inflight).unwrap();
        }
    }

    fn flight_end(&self, blob_type: BlobType, digest: Digest) {
        let mut inflight = self.inflight.lock().unwrap();
        inflight.remove(&(blob_type, digest));
        self.inflight_done.notify_all();
    }

    fn write_blob(
        &self,
        blob_type: BlobType,
        digest: Digest,
        data: &[u8],
        extra_flags: BlobFlags,
    ) -> Result<()> {
        let (payload, mut flags) = self.codec.encode(data)?;
        flags.insert(extra_flags);

        let mut current = self.current.lock().unwrap();
        let max_size = self.config.packfile.max_size as usize;

        if current.is_none() {
            *current = Some(PackfileWriter::new(max_size));
        }
        if !current.as_ref().unwrap().fits(payload.len()) {
            let full = current.take().unwrap();
            self.seal_writer(full)?;
            *current = Some(PackfileWriter::new(max_size));
        }

        current
            .as_mut()
            .unwrap()
            .append(blob_type, digest, flags, &payload)?;
        Ok(())
    }

    /// Seal a packfile, store it, and record its blobs in the pending
    /// catalogue. Entries become visible only after the packfile bytes
    /// are durable.
    fn seal_writer(&self, writer: PackfileWriter) -> Result<()> {
        if writer.is_empty() {
            return Ok(());
        }

        let (id, bytes, entries) = writer.seal()?;
        self.with_retry(|| self.backend.put_packfile(&id, &bytes))?;

        for entry in entries {
            self.state.put(
                entry.blob_type,
                entry.digest,
                Location {
                    packfile: id,
                    offset: entry.offset,
                    length: entry.length,
                    flags: entry.flags,
                },
            );
        }
        Ok(())
    }

    /// Fetch a blob by digest, decode it and verify its content address.
    pub fn get_blob(&self, blob_type: BlobType, digest: &Digest) -> Result<Vec<u8>> {
        if let Some(location) = self.state.get(blob_type, digest) {
            let payload = self.with_retry(|| {
                self.backend
                    .get_packfile_range(&location.packfile, location.offset, location.length)
            })?;
            return self.decode_and_verify(digest, &payload, location.flags);
        }

        // the open packfile may hold it already
        let current = self.current.lock().unwrap();
        if let Some(writer) = current.as_ref() {
            let found = writer
                .entries()
                .iter()
                .find(|entry| entry.blob_type == blob_type && entry.digest == *digest)
                .map(|entry| (entry.offset, entry.length, entry.flags));
            if let Some((offset, length, flags)) = found {
                let payload = writer.read(offset, length).unwrap().to_vec();
                drop(current);
                return self.decode_and_verify(digest, &payload, flags);
            }
        }

        Err(Error::NotFound(format!("{} blob {}", blob_type, digest_to_hex(digest))))
    }

    pub fn has_blob(&self, blob_type: BlobType, digest: &Digest) -> bool {
        if self.state.has(blob_type, digest) {
            return true;
        }
        let current = self.current.lock().unwrap();
        match current.as_ref() {
            Some(writer) => writer
                .entries()
                .iter()
                .any(|entry| entry.blob_type == blob_type && entry.digest == *digest),
            None => false,
        }
    }

    /// All known digests of a blob type, catalogued and in-flight.
    pub fn list_blobs(&self, blob_type: BlobType) -> Vec<Digest> {
        let mut digests = self.state.list(blob_type);
        let current = self.current.lock().unwrap();
        if let Some(writer) = current.as_ref() {
            for entry in writer.entries() {
                if entry.blob_type == blob_type {
                    digests.push(entry.digest);
                }
            }
        }
        digests.sort();
        digests.dedup();
        digests
    }

    fn decode_and_verify(
        &self,
        digest: &Digest,
        payload: &[u8],
        flags: BlobFlags,
    ) -> Result<Vec<u8>> {
        let data = self.codec.decode(payload, flags)?;

        if !flags.contains(BlobFlags::KEYED) && self.hash(&data) != *digest {
            return Err(Error::Integrity(format!(
                "blob {} failed digest verification",
                digest_to_hex(digest)
            )));
        }
        Ok(data)
    }

    /// Seal the current packfile (if any) and publish pending state.
    pub fn commit(&self) -> Result<()> {
        let writer = self.current.lock().unwrap().take();
        if let Some(writer) = writer {
            self.seal_writer(writer)?;
        }
        self.state.publish(self.backend.as_ref(), &self.codec)?;
        Ok(())
    }

    /// Abandon the open packfile. Catalogue entries for packfiles sealed
    /// before the rollback are still published: those bytes are durable
    /// and later snapshots deduplicate against them.
    pub fn rollback(&self) -> Result<()> {
        let discarded = self.current.lock().unwrap().take();
        if let Some(writer) = discarded {
            log::info!("discarding open packfile with {} blobs", writer.blob_count());
        }
        self.state.publish(self.backend.as_ref(), &self.codec)?;
        Ok(())
    }

    /// Rewrite the catalogue into a single state blob.
    pub fn compact_state(&self) -> Result<Digest> {
        self.state.compact(self.backend.as_ref(), &self.codec)
    }

    /// Verify one packfile end-to-end: its identifier, footer magic,
    /// index digest, and every contained blob against the digest the
    /// index records for it.
    pub fn verify_packfile(&self, id: &Digest) -> Result<()> {
        let bytes = self.with_retry(|| self.backend.get_packfile(id))?;
        if self.hash(&bytes) != *id {
            return Err(Error::Integrity(format!(
                "packfile {} failed digest verification",
                digest_to_hex(id)
            )));
        }

        let reader = PackfileReader::from_bytes(bytes)?;
        for entry in reader.entries() {
            let payload = reader.read(entry.offset, entry.length)?;
            let data = self.codec.decode(payload, entry.flags)?;
            if !entry.flags.contains(BlobFlags::KEYED) && self.hash(&data) != entry.digest {
                return Err(Error::Integrity(format!(
                    "blob {} in packfile {} failed digest verification",
                    digest_to_hex(&entry.digest),
                    digest_to_hex(id)
                )));
            }
        }
        Ok(())
    }

    /// Scrub every packfile in the backend. Returns the identifiers
    /// that failed, with their errors.
    pub fn verify_storage(&self) -> Result<Vec<(Digest, Error)>> {
        let mut failed = Vec::new();
        for id in self.backend.list_packfiles()? {
            if let Err(err) = self.verify_packfile(&id) {
                log::warn!("packfile {}: {}", digest_to_hex(&id), err);
                failed.push((id, err));
            }
        }
        Ok(failed)
    }

    pub fn lock_writer(&self) -> Result<()> {
        self.backend.lock(WRITER_LOCK)
    }

    pub fn unlock_writer(&self) -> Result<()> {
        self.backend.unlock(WRITER_LOCK)
    }

    /// Structured description of the repository, for diagnostics.
    pub fn info(&self) -> Result<RepositoryInfo> {
        Ok(RepositoryInfo {
            version: self.config.version.clone(),
            repository_id: self.config.repository_id.clone(),
            location: self.backend.location().to_string(),
            packfiles: self.backend.list_packfiles()?.len(),
            states: self.backend.list_states()?.len(),
            snapshots: self.state.list(BlobType::SnapshotHeader).len(),
        })
    }

    fn with_retry<T>(&self, mut operation: impl FnMut() -> Result<T>) -> Result<T> {
        let mut delay = RETRY_BASE_DELAY;
        let mut attempt = 0;
        loop {
            match operation() {
                Err(err) if err.is_retryable() && attempt < TRANSPORT_RETRIES => {
                    attempt += 1;
                    log::warn!(
                        "storage operation failed (attempt {}/{}): {}",
                        attempt,
                        TRANSPORT_RETRIES,
                        err
                    );
                    std::thread::sleep(delay);
                    delay *= 2;
                }
                other => return other,
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct RepositoryInfo {
    pub version: String,
    pub repository_id: String,
    pub location: String,
    pub packfiles: usize,
    pub states: usize,
    pub snapshots: usize,
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::storage::MemoryBackend;

    fn test_repository() -> Repository {
        let config = RepositoryConfig::new().unwrap();
        Repository::create(Box::new(MemoryBackend::new()), config, None).unwrap()
    }

    #[test]
    fn test_put_get_round_trip() {
        let repository = test_repository();
        let digest = repository.put_blob(BlobType::Chunk, b"chunk bytes").unwrap();
        assert_eq!(repository.get_blob(BlobType::Chunk, &digest).unwrap(), b"chunk bytes");

        // still readable after commit
        repository.commit().unwrap();
        assert_eq!(repository.get_blob(BlobType::Chunk, &digest).unwrap(), b"chunk bytes");
    }

    #[test]
    fn test_deduplication() {
        let repository = test_repository();
        let first = repository.put_blob(BlobType::Chunk, b"same bytes").unwrap();
        let second = repository.put_blob(BlobType::Chunk, b"same bytes").unwrap();
        assert_eq!(first, second);

        repository.commit().unwrap();
        assert_eq!(repository.list_blobs(BlobType::Chunk).len(), 1);
    }

    #[test]
    fn test_digest_is_stable_across_repositories() {
        let one = test_repository();
        let two = test_repository();
        assert_eq!(
            one.put_blob(BlobType::Chunk, b"stable").unwrap(),
            two.put_blob(BlobType::Chunk, b"stable").unwrap()
        );
    }

    #[test]
    fn test_missing_blob_is_not_found() {
        let repository = test_repository();
        match repository.get_blob(BlobType::Chunk, &[0u8; 32]) {
            Err(Error::NotFound(_)) => (),
            other => panic!("expected not found, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_type_namespaces_are_distinct() {
        let repository = test_repository();
        let digest = repository.put_blob(BlobType::Chunk, b"payload").unwrap();
        assert!(repository.get_blob(BlobType::Object, &digest).is_err());
    }

    #[test]
    fn test_keyed_blob_round_trip() {
        let repository = test_repository();
        let key = [0x11u8; 32];
        repository.put_blob_keyed(BlobType::SnapshotHeader, key, b"header bytes").unwrap();
        repository.commit().unwrap();
        assert_eq!(
            repository.get_blob(BlobType::SnapshotHeader, &key).unwrap(),
            b"header bytes"
        );
    }

    #[test]
    fn test_commit_publishes_state() {
        let repository = test_repository();
        let digest = repository.put_blob(BlobType::Chunk, b"durable").unwrap();
        assert_eq!(repository.backend.list_states().unwrap().len(), 0);

        repository.commit().unwrap();
        assert_eq!(repository.backend.list_states().unwrap().len(), 1);
        assert!(repository.has_blob(BlobType::Chunk, &digest));
    }

    #[test]
    fn test_concurrent_identical_puts() {
        let repository = Arc::new(test_repository());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let repository = Arc::clone(&repository);
            handles.push(std::thread::spawn(move || {
                repository.put_blob(BlobType::Chunk, &[0xaau8; 8192]).unwrap()
            }));
        }
        let digests: Vec<Digest> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(digests.windows(2).all(|pair| pair[0] == pair[1]));

        repository.commit().unwrap();
        assert_eq!(repository.list_blobs(BlobType::Chunk).len(), 1);
    }

    #[test]
    fn test_packfile_rollover() {
        let mut config = RepositoryConfig::new().unwrap();
        config.packfile.max_size = 4096;
        config.compression = None;
        let repository =
            Repository::create(Box::new(MemoryBackend::new()), config, None).unwrap();

        let mut digests = Vec::new();
        for i in 0..16u8 {
            digests.push(repository.put_blob(BlobType::Chunk, &vec![i; 1024]).unwrap());
        }
        repository.commit().unwrap();

        assert!(repository.backend.list_packfiles().unwrap().len() > 1);
        for (i, digest) in digests.iter().enumerate() {
            assert_eq!(
                repository.get_blob(BlobType::Chunk, digest).unwrap(),
                vec![i as u8; 1024]
            );
        }
    }

    #[test]
    fn test_corruption_detected_on_read() {
        let mut config = RepositoryConfig::new().unwrap();
        config.compression = None;
        let backend = MemoryBackend::new();
        let repository = Repository::create(Box::new(backend), config, None).unwrap();

        let digest = repository.put_blob(BlobType::Chunk, &[0x55u8; 4096]).unwrap();
        repository.commit().unwrap();

        // flip one byte of the stored packfile
        let packfile_id = repository.backend.list_packfiles().unwrap()[0];
        let mut bytes = repository.backend.get_packfile(&packfile_id).unwrap();
        bytes[100] ^= 0x01;
        repository.backend.put_packfile(&packfile_id, &bytes).unwrap();

        match repository.get_blob(BlobType::Chunk, &digest) {
            Err(Error::Integrity(_)) => (),
            other => panic!("expected integrity error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_verify_storage_scrubs_packfiles() {
        let mut config = RepositoryConfig::new().unwrap();
        config.compression = None;
        let repository =
            Repository::create(Box::new(MemoryBackend::new()), config, None).unwrap();

        repository.put_blob(BlobType::Chunk, &[0x33u8; 2048]).unwrap();
        repository.commit().unwrap();
        assert!(repository.verify_storage().unwrap().is_empty());

        let packfile_id = repository.backend.list_packfiles().unwrap()[0];
        let mut bytes = repository.backend.get_packfile(&packfile_id).unwrap();
        bytes[5] ^= 0x01;
        repository.backend.put_packfile(&packfile_id, &bytes).unwrap();

        let failed = repository.verify_storage().unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].0, packfile_id);
    }

    #[test]
    fn test_encrypted_repository_rejects_wrong_passphrase() {
        use crate::config::EncryptionConfig;
        use crate::crypto::KeyDerivationConfig;

        let backend = Arc::new(MemoryBackend::new());

        struct SharedBackend(Arc<MemoryBackend>);
        impl Backend for SharedBackend {
            fn location(&self) -> &str { self.0.location() }
            fn create(&self, config: &[u8]) -> Result<()> { self.0.create(config) }
            fn open(&self) -> Result<Vec<u8>> { self.0.open() }
            fn put_packfile(&self, id: &Digest, bytes: &[u8]) -> Result<()> { self.0.put_packfile(id, bytes) }
            fn get_packfile(&self, id: &Digest) -> Result<Vec<u8>> { self.0.get_packfile(id) }
            fn get_packfile_range(&self, id: &Digest, offset: u64, length: u64) -> Result<Vec<u8>> {
                self.0.get_packfile_range(id, offset, length)
            }
            fn list_packfiles(&self) -> Result<Vec<Digest>> { self.0.list_packfiles() }
            fn put_state(&self, id: &Digest, bytes: &[u8]) -> Result<()> { self.0.put_state(id, bytes) }
            fn get_state(&self, id: &Digest) -> Result<Vec<u8>> { self.0.get_state(id) }
            fn delete_state(&self, id: &Digest) -> Result<()> { self.0.delete_state(id) }
            fn list_states(&self) -> Result<Vec<Digest>> { self.0.list_states() }
            fn lock(&self, name: &str) -> Result<()> { self.0.lock(name) }
            fn unlock(&self, name: &str) -> Result<()> { self.0.unlock(name) }
        }

        let mut config = RepositoryConfig::new().unwrap();
        config.encryption = Some(EncryptionConfig::new(
            KeyDerivationConfig::PBKDF2 { iter: 10, salt: vec![5u8; 32] },
        ));

        let repository = Repository::create(
            Box::new(SharedBackend(Arc::clone(&backend))),
            config,
            Some(b"correct horse"),
        )
        .unwrap();
        let digest = repository.put_blob(BlobType::Chunk, b"secret chunk").unwrap();
        repository.commit().unwrap();
        drop(repository);

        match Repository::open(Box::new(SharedBackend(Arc::clone(&backend))), Some(b"wrong")) {
            Err(Error::Config(_)) => (),
            other => panic!("expected config error, got {:?}", other.map(|_| ())),
        }

        let reopened = Repository::open(
            Box::new(SharedBackend(backend)),
            Some(b"correct horse"),
        )
        .unwrap();
        assert_eq!(reopened.get_blob(BlobType::Chunk, &digest).unwrap(), b"secret chunk");
    }
}

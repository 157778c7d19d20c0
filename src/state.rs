//! The state log: the durable catalogue mapping blob digests to their
//! packfile locations.
//!
//! The catalogue lives as append-only state blobs in the backend.
//! Readers merge all published state blobs at open; writers accumulate
//! pending entries in memory and seal them into a new state blob on
//! [`StateLog::publish`]. [`StateLog::compact`] rewrites the union into
//! a single blob and retires the inputs once the merged blob is durable.
//!
//! Reads take a snapshot-consistent view: the merged map is behind an
//! `Arc` that publishes swap atomically, so readers never block writers.

use std::collections::BTreeMap;
use std::convert::TryFrom;
use std::sync::{Arc, Mutex, RwLock};

use serde::{Deserialize, Serialize};

use crate::codec::Codec;
use crate::error::{Error, Result};
use crate::packfile::{BlobFlags, BlobType};
use crate::storage::Backend;
use crate::tools::digest_to_hex;
use crate::Digest;

pub const STATE_MAGIC: [u8; 4] = *b"CELS";
pub const STATE_VERSION: u32 = 1;

const STATE_HEADER_SIZE: usize = 12;

/// Where a blob lives: which packfile, where in it, and how it was
/// encoded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Location {
    pub packfile: Digest,
    pub offset: u64,
    pub length: u64,
    pub flags: BlobFlags,
}

/// Wire form of one catalogue entry.
#[derive(Serialize, Deserialize)]
struct StateEntry {
    blob_type: u8,
    digest: Digest,
    packfile: Digest,
    offset: u64,
    length: u64,
    flags: u32,
}

#[derive(Serialize, Deserialize)]
struct StateFile {
    version: u32,
    timestamp: i64,
    entries: Vec<StateEntry>,
}

type CatalogueMap = BTreeMap<(BlobType, Digest), Location>;

/// Snapshot-consistent read view of the catalogue.
pub type CatalogueView = Arc<CatalogueMap>;

pub struct StateLog {
    merged: RwLock<CatalogueView>,
    pending: Mutex<CatalogueMap>,
    // serializes publish and compact
    write_lock: Mutex<()>,
}

impl StateLog {
    pub fn new() -> Self {
        Self {
            merged: RwLock::new(Arc::new(BTreeMap::new())),
            pending: Mutex::new(BTreeMap::new()),
            write_lock: Mutex::new(()),
        }
    }

    /// Merge every published state blob into a fresh catalogue.
    pub fn load(backend: &dyn Backend, codec: &Codec) -> Result<Self> {
        let mut merged = BTreeMap::new();
        for id in backend.list_states()? {
            let bytes = backend.get_state(&id)?;
            for (key, location) in decode_state(&bytes, codec)? {
                merged.insert(key, location);
            }
        }
        log::debug!("catalogue loaded with {} entries", merged.len());

        Ok(Self {
            merged: RwLock::new(Arc::new(merged)),
            pending: Mutex::new(BTreeMap::new()),
            write_lock: Mutex::new(()),
        })
    }

    /// Record a mapping. Redundant puts collapse.
    pub fn put(&self, blob_type: BlobType, digest: Digest, location: Location) {
        if self.merged.read().unwrap().contains_key(&(blob_type, digest)) {
            return;
        }
        self.pending.lock().unwrap().insert((blob_type, digest), location);
    }

    pub fn get(&self, blob_type: BlobType, digest: &Digest) -> Option<Location> {
        let key = (blob_type, *digest);
        if let Some(location) = self.merged.read().unwrap().get(&key) {
            return Some(*location);
        }
        self.pending.lock().unwrap().get(&key).copied()
    }

    pub fn has(&self, blob_type: BlobType, digest: &Digest) -> bool {
        self.get(blob_type, digest).is_some()
    }

    /// Snapshot-consistent view of the published catalogue.
    pub fn view(&self) -> CatalogueView {
        self.merged.read().unwrap().clone()
    }

    /// All digests of a given type, published and pending.
    pub fn list(&self, blob_type: BlobType) -> Vec<Digest> {
        let mut digests: Vec<Digest> = self
            .merged
            .read()
            .unwrap()
            .range((blob_type, [0u8; 32])..=(blob_type, [0xffu8; 32]))
            .map(|((_, digest), _)| *digest)
            .collect();
        for ((entry_type, digest), _) in self.pending.lock().unwrap().iter() {
            if *entry_type == blob_type {
                digests.push(*digest);
            }
        }
        digests.sort();
        digests.dedup();
        digests
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    /// Seal pending mappings into a new state blob. Returns the state
    /// identifier, or `None` when there was nothing to publish.
    pub fn publish(&self, backend: &dyn Backend, codec: &Codec) -> Result<Option<Digest>> {
        let _guard = self.write_lock.lock().unwrap();

        let pending = std::mem::take(&mut *self.pending.lock().unwrap());
        if pending.is_empty() {
            return Ok(None);
        }

        let bytes = match encode_state(&pending, codec) {
            Ok(bytes) => bytes,
            Err(err) => {
                self.restore_pending(pending);
                return Err(err);
            }
        };
        let id = openssl::sha::sha256(&bytes);

        if let Err(err) = backend.put_state(&id, &bytes) {
            self.restore_pending(pending);
            return Err(err);
        }

        let mut merged = self.merged.write().unwrap();
        let mut updated = (**merged).clone();
        let published = pending.len();
        updated.extend(pending);
        *merged = Arc::new(updated);

        log::info!("published state {} ({} entries)", digest_to_hex(&id), published);
        Ok(Some(id))
    }

    /// Rewrite the union of all published state blobs into one, then
    /// retire the inputs. Pending entries are untouched.
    pub fn compact(&self, backend: &dyn Backend, codec: &Codec) -> Result<Digest> {
        let _guard = self.write_lock.lock().unwrap();

        let old_ids = backend.list_states()?;
        let mut union: CatalogueMap = BTreeMap::new();
        for id in &old_ids {
            let bytes = backend.get_state(id)?;
            for (key, location) in decode_state(&bytes, codec)? {
                union.insert(key, location);
            }
        }

        let bytes = encode_state(&union, codec)?;
        let id = openssl::sha::sha256(&bytes);
        backend.put_state(&id, &bytes)?;

        // the merged blob is durable, the inputs can go
        for old_id in &old_ids {
            if *old_id != id {
                backend.delete_state(old_id)?;
            }
        }

        *self.merged.write().unwrap() = Arc::new(union);

        log::info!(
            "compacted {} state blobs into {}",
            old_ids.len(),
            digest_to_hex(&id)
        );
        Ok(id)
    }

    fn restore_pending(&self, entries: CatalogueMap) {
        let mut pending = self.pending.lock().unwrap();
        for (key, location) in entries {
            pending.entry(key).or_insert(location);
        }
    }
}

impl Default for StateLog {
    fn default() -> Self {
        Self::new()
    }
}

fn encode_state(entries: &CatalogueMap, codec: &Codec) -> Result<Vec<u8>> {
    let state = StateFile {
        version: STATE_VERSION,
        timestamp: chrono::Utc::now().timestamp(),
        entries: entries
            .iter()
            .map(|((blob_type, digest), location)| StateEntry {
                blob_type: u8::from(*blob_type),
                digest: *digest,
                packfile: location.packfile,
                offset: location.offset,
                length: location.length,
                flags: location.flags.bits(),
            })
            .collect(),
    };

    let body = rmp_serde::to_vec(&state).map_err(|err| Error::encode("state", err))?;
    let (payload, flags) = codec.encode(&body)?;

    let mut bytes = Vec::with_capacity(STATE_HEADER_SIZE + payload.len());
    bytes.extend_from_slice(&STATE_MAGIC);
    bytes.extend_from_slice(&STATE_VERSION.to_le_bytes());
    bytes.extend_from_slice(&flags.bits().to_le_bytes());
    bytes.extend_from_slice(&payload);
    Ok(bytes)
}

fn decode_state(bytes: &[u8], codec: &Codec) -> Result<Vec<((BlobType, Digest), Location)>> {
    if bytes.len() < STATE_HEADER_SIZE {
        return Err(Error::Integrity(format!("state blob too small ({} bytes)", bytes.len())));
    }
    if bytes[0..4] != STATE_MAGIC {
        return Err(Error::Integrity("state magic mismatch".to_string()));
    }

    let version = u32::from_le_bytes(<[u8; 4]>::try_from(&bytes[4..8]).unwrap());
    if version != STATE_VERSION {
        return Err(Error::Integrity(format!("unsupported state version {}", version)));
    }

    let bits = u32::from_le_bytes(<[u8; 4]>::try_from(&bytes[8..12]).unwrap());
    let flags = BlobFlags::from_bits(bits)
        .ok_or_else(|| Error::Integrity(format!("unknown state flags {:#x}", bits)))?;

    let body = codec.decode(&bytes[STATE_HEADER_SIZE..], flags)?;
    let state: StateFile =
        rmp_serde::from_slice(&body).map_err(|err| Error::decode("state", err))?;

    let mut entries = Vec::with_capacity(state.entries.len());
    for entry in state.entries {
        let blob_type = BlobType::try_from(entry.blob_type).map_err(Error::Integrity)?;
        let flags = BlobFlags::from_bits(entry.flags)
            .ok_or_else(|| Error::Integrity(format!("unknown blob flags {:#x}", entry.flags)))?;
        entries.push((
            (blob_type, entry.digest),
            Location {
                packfile: entry.packfile,
                offset: entry.offset,
                length: entry.length,
                flags,
            },
        ));
    }
    Ok(entries)
}

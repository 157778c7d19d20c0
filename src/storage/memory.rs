use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;

use crate::error::{Error, Result};
use crate::storage::Backend;
use crate::tools::digest_to_hex;
use crate::Digest;

/// In-memory backend, mostly useful in tests and for throwaway
/// repositories.
pub struct MemoryBackend {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    config: Option<Vec<u8>>,
    packfiles: BTreeMap<Digest, Vec<u8>>,
    states: BTreeMap<Digest, Vec<u8>>,
    locks: HashSet<String>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self { inner: Mutex::new(Inner::default()) }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for MemoryBackend {
    fn location(&self) -> &str {
        "memory://"
    }

    fn create(&self, config: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.config.is_some() {
            return Err(Error::Config("repository already exists".to_string()));
        }
        inner.config = Some(config.to_vec());
        Ok(())
    }

    fn open(&self) -> Result<Vec<u8>> {
        let inner = self.inner.lock().unwrap();
        inner
            .config
            .clone()
            .ok_or_else(|| Error::Config("no repository at memory://".to_string()))
    }

    fn put_packfile(&self, id: &Digest, bytes: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.packfiles.insert(*id, bytes.to_vec());
        Ok(())
    }

    fn get_packfile(&self, id: &Digest) -> Result<Vec<u8>> {
        let inner = self.inner.lock().unwrap();
        inner
            .packfiles
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("packfile {}", digest_to_hex(id))))
    }

    fn get_packfile_range(&self, id: &Digest, offset: u64, length: u64) -> Result<Vec<u8>> {
        let inner = self.inner.lock().unwrap();
        let bytes = inner
            .packfiles
            .get(id)
            .ok_or_else(|| Error::NotFound(format!("packfile {}", digest_to_hex(id))))?;

        let start = offset as usize;
        let end = start.checked_add(length as usize).filter(|end| *end <= bytes.len());
        match end {
            Some(end) => Ok(bytes[start..end].to_vec()),
            None => Err(Error::Integrity(format!(
                "short read in packfile {} at {}+{}",
                digest_to_hex(id),
                offset,
                length
            ))),
        }
    }

    fn list_packfiles(&self) -> Result<Vec<Digest>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.packfiles.keys().copied().collect())
    }

    fn put_state(&self, id: &Digest, bytes: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.states.insert(*id, bytes.to_vec());
        Ok(())
    }

    fn get_state(&self, id: &Digest) -> Result<Vec<u8>> {
        let inner = self.inner.lock().unwrap();
        inner
            .states
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("state {}", digest_to_hex(id))))
    }

    fn delete_state(&self, id: &Digest) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.states.remove(id);
        Ok(())
    }

    fn list_states(&self) -> Result<Vec<Digest>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.states.keys().copied().collect())
    }

    fn lock(&self, name: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.locks.insert(name.to_string()) {
            return Err(Error::Usage(format!("repository already locked by '{}'", name)));
        }
        Ok(())
    }

    fn unlock(&self, name: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.locks.remove(name);
        Ok(())
    }
}

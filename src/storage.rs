//! Storage backends: the object-store contract a repository runs on.
//!
//! A backend stores three kinds of things: packfiles, state blobs and
//! lock files, plus the repository configuration. Anything satisfying
//! the [`Backend`] trait works (local filesystem, object stores, ...).
//!
//! Backends are looked up through an explicit [`Registry`] value owned
//! by the application; there is no process-wide registration.

use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::Digest;

mod filesystem;
pub use filesystem::*;

mod memory;
pub use memory::*;

/// Minimal object-store contract consumed by the repository.
pub trait Backend: Send + Sync {
    /// Human-readable location, used in messages.
    fn location(&self) -> &str;

    /// Initialize the backend layout and store the configuration.
    /// Fails if a repository already exists at this location.
    fn create(&self, config: &[u8]) -> Result<()>;

    /// Fetch the configuration of an existing repository.
    fn open(&self) -> Result<Vec<u8>>;

    fn put_packfile(&self, id: &Digest, bytes: &[u8]) -> Result<()>;
    fn get_packfile(&self, id: &Digest) -> Result<Vec<u8>>;
    fn get_packfile_range(&self, id: &Digest, offset: u64, length: u64) -> Result<Vec<u8>>;
    fn list_packfiles(&self) -> Result<Vec<Digest>>;

    fn put_state(&self, id: &Digest, bytes: &[u8]) -> Result<()>;
    fn get_state(&self, id: &Digest) -> Result<Vec<u8>>;
    fn delete_state(&self, id: &Digest) -> Result<()>;
    fn list_states(&self) -> Result<Vec<Digest>>;

    /// Take a named advisory lock. Fails with a `usage` error when the
    /// lock is already held.
    fn lock(&self, name: &str) -> Result<()>;
    fn unlock(&self, name: &str) -> Result<()>;
}

pub type BackendBuilder = fn(location: &str) -> Result<Box<dyn Backend>>;

/// Explicit backend registry, passed down by the application.
pub struct Registry {
    backends: HashMap<String, BackendBuilder>,
}

impl Registry {
    pub fn new() -> Self {
        Self { backends: HashMap::new() }
    }

    /// Registry with the built-in backends.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry
            .register("fs", |location| Ok(Box::new(FilesystemBackend::new(location))))
            .unwrap();
        registry
            .register("memory", |_location| Ok(Box::new(MemoryBackend::new())))
            .unwrap();
        registry
    }

    pub fn register(&mut self, name: &str, builder: BackendBuilder) -> Result<()> {
        if self.backends.contains_key(name) {
            return Err(Error::Usage(format!("backend '{}' registered twice", name)));
        }
        self.backends.insert(name.to_string(), builder);
        Ok(())
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.backends.keys().cloned().collect();
        names.sort();
        names
    }

    /// Resolve a location string to a backend instance. Locations with
    /// a scheme (`fs://...`, `s3://...`) select the backend by name,
    /// plain paths go to the filesystem backend.
    pub fn open(&self, location: &str) -> Result<Box<dyn Backend>> {
        let (name, location) = match location.find("://") {
            Some(position) => (&location[..position], &location[position + 3..]),
            None => ("fs", location),
        };

        match self.backends.get(name) {
            Some(builder) => builder(location),
            None => Err(Error::Config(format!("backend '{}' does not exist", name))),
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

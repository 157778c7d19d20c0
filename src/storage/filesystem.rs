use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::storage::Backend;
use crate::tools::{digest_to_hex, hex_to_digest};
use crate::Digest;

const CONFIG_NAME: &str = "config";
const PACKFILES_DIR: &str = "packfiles";
const STATES_DIR: &str = "states";
const LOCKS_DIR: &str = "locks";

/// Local filesystem backend.
///
/// Layout: `config`, `packfiles/<hex-id>`, `states/<hex-id>`,
/// `locks/<name>` below the repository root. All object writes go
/// through a temporary file and an atomic rename, so a reader never
/// observes a partially written packfile or state blob.
pub struct FilesystemBackend {
    root: PathBuf,
    location: String,
}

impl FilesystemBackend {
    pub fn new(location: &str) -> Self {
        Self { root: PathBuf::from(location), location: location.to_string() }
    }

    fn packfile_path(&self, id: &Digest) -> PathBuf {
        self.root.join(PACKFILES_DIR).join(digest_to_hex(id))
    }

    fn state_path(&self, id: &Digest) -> PathBuf {
        self.root.join(STATES_DIR).join(digest_to_hex(id))
    }

    fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        let mut tmp_path = path.to_owned();
        tmp_path.set_extension(format!("tmp.{}", std::process::id()));

        let mut file = File::create(&tmp_path)?;
        if let Err(err) = file.write_all(bytes).and_then(|_| file.sync_all()) {
            let _ = fs::remove_file(&tmp_path);
            return Err(err.into());
        }
        drop(file);

        if let Err(err) = fs::rename(&tmp_path, path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(err.into());
        }
        Ok(())
    }

    fn list_ids(&self, dir: &str) -> Result<Vec<Digest>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(self.root.join(dir))? {
            let entry = entry?;
            let name = entry.file_name();
            // skip leftover temporary files
            if let Ok(id) = hex_to_digest(&name.to_string_lossy()) {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }
}

impl Backend for FilesystemBackend {
    fn location(&self) -> &str {
        &self.location
    }

    fn create(&self, config: &[u8]) -> Result<()> {
        if self.root.join(CONFIG_NAME).exists() {
            return Err(Error::Config(format!(
                "repository already exists at {}",
                self.location
            )));
        }

        fs::create_dir_all(&self.root)?;
        for dir in &[PACKFILES_DIR, STATES_DIR, LOCKS_DIR] {
            fs::create_dir_all(self.root.join(dir))?;
        }
        self.write_atomic(&self.root.join(CONFIG_NAME), config)
    }

    fn open(&self) -> Result<Vec<u8>> {
        match fs::read(self.root.join(CONFIG_NAME)) {
            Ok(bytes) => Ok(bytes),
            Err(ref err) if err.kind() == std::io::ErrorKind::NotFound => Err(Error::Config(
                format!("no repository at {}", self.location),
            )),
            Err(err) => Err(err.into()),
        }
    }

    fn put_packfile(&self, id: &Digest, bytes: &[u8]) -> Result<()> {
        self.write_atomic(&self.packfile_path(id), bytes)
    }

    fn get_packfile(&self, id: &Digest) -> Result<Vec<u8>> {
        match fs::read(self.packfile_path(id)) {
            Ok(bytes) => Ok(bytes),
            Err(ref err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::NotFound(format!("packfile {}", digest_to_hex(id))))
            }
            Err(err) => Err(err.into()),
        }
    }

    fn get_packfile_range(&self, id: &Digest, offset: u64, length: u64) -> Result<Vec<u8>> {
        let mut file = match File::open(self.packfile_path(id)) {
            Ok(file) => file,
            Err(ref err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::NotFound(format!("packfile {}", digest_to_hex(id))))
            }
            Err(err) => return Err(err.into()),
        };

        file.seek(SeekFrom::Start(offset))?;
        let mut buffer = vec![0u8; length as usize];
        file.read_exact(&mut buffer).map_err(|err| {
            Error::Integrity(format!(
                "short read in packfile {} at {}+{} - {}",
                digest_to_hex(id),
                offset,
                length,
                err
            ))
        })?;
        Ok(buffer)
    }

    fn list_packfiles(&self) -> Result<Vec<Digest>> {
        self.list_ids(PACKFILES_DIR)
    }

    fn put_state(&self, id: &Digest, bytes: &[u8]) -> Result<()> {
        self.write_atomic(&self.state_path(id), bytes)
    }

    fn get_state(&self, id: &Digest) -> Result<Vec<u8>> {
        match fs::read(self.state_path(id)) {
            Ok(bytes) => Ok(bytes),
            Err(ref err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::NotFound(format!("state {}", digest_to_hex(id))))
            }
            Err(err) => Err(err.into()),
        }
    }

    fn delete_state(&self, id: &Digest) -> Result<()> {
        fs::remove_file(self.state_path(id))?;
        Ok(())
    }

    fn list_states(&self) -> Result<Vec<Digest>> {
        self.list_ids(STATES_DIR)
    }

    fn lock(&self, name: &str) -> Result<()> {
        let path = self.root.join(LOCKS_DIR).join(name);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                let _ = write!(file, "{}", std::process::id());
                Ok(())
            }
            Err(ref err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(Error::Usage(format!(
                    "repository already locked by '{}' at {}",
                    name,
                    path.display()
                )))
            }
            Err(err) => Err(err.into()),
        }
    }

    fn unlock(&self, name: &str) -> Result<()> {
        match fs::remove_file(self.root.join(LOCKS_DIR).join(name)) {
            Ok(()) => Ok(()),
            Err(ref err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::tools::digest_to_hex;
use crate::vfs::Summary;
use crate::{Digest, REPOSITORY_VERSION};

/// Execution context captured into every snapshot header.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct Context {
    pub machine_id: String,
    pub hostname: String,
    pub username: String,
    pub operating_system: String,
    pub architecture: String,
    pub num_cpu: u32,
    pub process_id: u32,
    pub client: String,
    pub command_line: String,
}

impl Context {
    pub fn capture() -> Context {
        let hostname = hostname::get()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        Context {
            machine_id: String::new(),
            hostname,
            username: std::env::var("USER").unwrap_or_default(),
            operating_system: std::env::consts::OS.to_string(),
            architecture: std::env::consts::ARCH.to_string(),
            num_cpu: std::thread::available_parallelism()
                .map(|n| n.get() as u32)
                .unwrap_or(1),
            process_id: std::process::id(),
            client: format!("cellar/{}", env!("CARGO_PKG_VERSION")),
            command_line: std::env::args().collect::<Vec<_>>().join(" "),
        }
    }
}

/// Aggregate build statistics, stored as a blob referenced from the
/// header.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct Statistics {
    pub directories: u64,
    pub files: u64,
    pub symlinks: u64,
    pub errors: u64,
    pub objects: u64,
    pub chunks: u64,
    pub bytes_scanned: u64,
}

/// Free-form key/value pairs describing the snapshot source, stored as
/// a blob referenced from the header.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct Metadata {
    pub items: Vec<(String, String)>,
}

/// The snapshot header: the single blob a snapshot is rooted in. It is
/// catalogued under the snapshot identifier and written last.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Header {
    pub snapshot_id: Digest,
    pub version: String,
    pub creation_time: DateTime<Utc>,
    pub creation_duration: std::time::Duration,
    /// Base64 Ed25519 public key of the signer; empty when unsigned.
    pub public_key: String,

    pub category: String,
    pub tags: Vec<String>,

    pub context: Context,

    pub importer_type: String,
    pub importer_origin: String,
    /// Root directory that was scanned.
    pub directory: String,

    pub root: Digest,
    pub metadata: Digest,
    pub statistics: Digest,
    pub errors: Option<Digest>,
    /// Root of the pathname index B-tree.
    pub index: Digest,

    pub summary: Summary,
}

impl Header {
    pub fn new(snapshot_id: Digest) -> Header {
        Header {
            snapshot_id,
            version: REPOSITORY_VERSION.to_string(),
            creation_time: Utc::now(),
            creation_duration: std::time::Duration::default(),
            public_key: String::new(),
            category: "default".to_string(),
            tags: Vec::new(),
            context: Context::default(),
            importer_type: String::new(),
            importer_origin: String::new(),
            directory: String::new(),
            root: [0u8; 32],
            metadata: [0u8; 32],
            statistics: [0u8; 32],
            errors: None,
            index: [0u8; 32],
            summary: Summary::default(),
        }
    }

    pub fn snapshot_id_hex(&self) -> String {
        digest_to_hex(&self.snapshot_id)
    }

    pub fn short_id(&self) -> String {
        digest_to_hex(&self.snapshot_id[..4])
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        rmp_serde::to_vec(self).map_err(|err| Error::encode("snapshot header", err))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Header> {
        rmp_serde::from_slice(bytes).map_err(|err| Error::decode("snapshot header", err))
    }
}

macro_rules! aux_codec {
    ($type:ty, $name:expr) => {
        impl $type {
            pub fn to_bytes(&self) -> Result<Vec<u8>> {
                rmp_serde::to_vec(self).map_err(|err| Error::encode($name, err))
            }

            pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
                rmp_serde::from_slice(bytes).map_err(|err| Error::decode($name, err))
            }
        }
    };
}

aux_codec!(Statistics, "statistics");
aux_codec!(Metadata, "metadata");

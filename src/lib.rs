//! This crate implements a deduplicating, content-addressed snapshot
//! repository.
//!
//! # Data model
//!
//! Every persisted byte sequence is a *blob*, addressed by the digest of
//! its content and tagged with a small closed set of types (chunks,
//! objects, directory/file entries, B-tree nodes, snapshot headers, ...).
//! Two blobs with equal digests are considered identical, which is what
//! makes deduplication work: writing the same content twice costs one
//! catalogue lookup and no I/O.
//!
//! Blobs are grouped into append-only *packfiles*, each sealed with a
//! typed index and a fixed-size footer. The *state log* is the durable
//! catalogue mapping `(type, digest)` to a packfile location; it is
//! materialized as append-only state blobs which readers merge and which
//! compaction rewrites into one.
//!
//! On the write path, file content runs through a content-defined
//! chunker, each chunk is optionally compressed and encrypted, and the
//! resulting blobs land in the current packfile. A snapshot ties it all
//! together: a virtual filesystem of directory and file entries linked by
//! digest, a B-tree index keyed on pathname, an error chain, and a header
//! blob that is the last thing written.
//!
//! # Locking
//!
//! A repository admits a single writer per snapshot, enforced with a lock
//! file through the storage backend. Readers never take the writer lock;
//! they operate on snapshot-consistent views of the catalogue.

pub mod error;
pub mod tools;

pub mod crypto;

pub mod codec;

pub mod chunker;

pub mod packfile;

pub mod state;

pub mod config;

pub mod storage;

pub mod repository;

pub mod btree;

pub mod vfs;

pub mod snapshot;

pub mod identity;

pub use error::{Error, Result};

/// Width of every content address in this repository.
pub const DIGEST_SIZE: usize = 32;

/// Content address of a persisted blob.
pub type Digest = [u8; DIGEST_SIZE];

/// On-disk format version, recorded in the repository configuration.
pub const REPOSITORY_VERSION: &str = "1.0.0";

//! Importers: the scan-side connectors a snapshot consumes.
//!
//! An importer walks some source (a filesystem, an archive, a remote
//! share) and produces a lazy sequence of [`ScanResult`]s: entry
//! records, xattr sub-records attached to their parent path, and
//! per-path scan errors. Scan errors are recorded in the snapshot,
//! never fatal.

pub mod fs;

use std::io::Read;

use crate::error::Result;
use crate::vfs::FileInfo;

#[derive(Clone, Debug)]
pub struct ExtendedAttribute {
    pub name: String,
    pub value: Vec<u8>,
}

#[derive(Clone, Debug)]
pub struct ScanRecord {
    pub pathname: String,
    /// Symlink target, empty otherwise.
    pub target: String,
    pub fileinfo: FileInfo,
    /// Names of the entry's extended attributes.
    pub extended_attributes: Vec<String>,
    /// Set on xattr sub-records; `xattr_name` selects the attribute on
    /// `pathname`.
    pub is_xattr: bool,
    pub xattr_name: String,
}

#[derive(Clone, Debug)]
pub struct ScanError {
    pub pathname: String,
    pub message: String,
}

#[derive(Clone, Debug)]
pub enum ScanResult {
    Record(ScanRecord),
    Error(ScanError),
}

pub trait Importer: Send + Sync {
    /// Where the data comes from (host, share, ...).
    fn origin(&self) -> String;

    /// Importer family name (`fs`, ...).
    fn kind(&self) -> String;

    /// Root path of the scan.
    fn root(&self) -> String;

    /// Lazy scan stream. The returned iterator owns whatever resources
    /// the walk needs and releases them when dropped, so a cancelled
    /// consumer can just stop draining.
    fn scan(&self) -> Result<Box<dyn Iterator<Item = ScanResult> + Send>>;

    fn new_reader(&self, pathname: &str) -> Result<Box<dyn Read + Send>>;

    fn new_extended_attribute_reader(
        &self,
        pathname: &str,
        name: &str,
    ) -> Result<Box<dyn Read + Send>>;

    fn get_extended_attributes(&self, pathname: &str) -> Result<Vec<ExtendedAttribute>>;

    fn close(&mut self) -> Result<()>;
}

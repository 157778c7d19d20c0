//! Exporters: the restore-side connectors a snapshot writes into.

pub mod fs;

use std::io::Write;

use crate::error::Result;
use crate::vfs::FileInfo;

pub trait Exporter: Send + Sync {
    /// Base path restored entries are created under.
    fn root(&self) -> String;

    fn create_directory(&self, pathname: &str, fileinfo: &FileInfo) -> Result<()>;

    fn create_file(&self, pathname: &str, fileinfo: &FileInfo) -> Result<Box<dyn Write + Send>>;

    fn create_symlink(&self, pathname: &str, target: &str, fileinfo: &FileInfo) -> Result<()>;

    /// Apply mode, timestamps and ownership. Called after a file's
    /// content is written, and after a directory's children are done so
    /// restored directory times survive.
    fn set_attributes(&self, pathname: &str, fileinfo: &FileInfo) -> Result<()>;

    fn set_xattr(&self, pathname: &str, name: &str, value: &[u8]) -> Result<()>;

    fn close(&mut self) -> Result<()>;
}

//! Filesystem importer: walks a directory tree and streams scan
//! records over a bounded channel, so a slow consumer applies
//! backpressure to the walk and a gone consumer stops it.

use std::fs;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Utc};

use crate::error::{Error, Result};
use crate::snapshot::importer::{
    ExtendedAttribute, Importer, ScanError, ScanRecord, ScanResult,
};
use crate::vfs::{EntryKind, FileInfo};

const SCAN_CHANNEL_DEPTH: usize = 1024;

pub struct FilesystemImporter {
    root: PathBuf,
}

impl FilesystemImporter {
    pub fn new(root: &str) -> Result<FilesystemImporter> {
        let root = PathBuf::from(root);
        if !root.is_dir() {
            return Err(Error::Usage(format!("'{}' is not a directory", root.display())));
        }
        Ok(FilesystemImporter { root })
    }
}

pub fn fileinfo_from_metadata(name: &str, metadata: &fs::Metadata) -> FileInfo {
    use std::os::unix::fs::MetadataExt;

    let kind = if metadata.file_type().is_dir() {
        EntryKind::Directory
    } else if metadata.file_type().is_file() {
        EntryKind::Regular
    } else if metadata.file_type().is_symlink() {
        EntryKind::Symlink
    } else {
        EntryKind::Other
    };

    let mod_time: DateTime<Utc> = metadata
        .modified()
        .unwrap_or(SystemTime::UNIX_EPOCH)
        .into();

    FileInfo {
        name: name.to_string(),
        kind,
        size: metadata.size(),
        mode: metadata.mode() & 0o7777,
        mod_time,
        uid: metadata.uid(),
        gid: metadata.gid(),
        nlink: metadata.nlink() as u32,
        dev: metadata.dev(),
        ino: metadata.ino(),
    }
}

fn scan_one(path: &Path) -> std::result::Result<Vec<ScanResult>, String> {
    let metadata = fs::symlink_metadata(path).map_err(|err| err.to_string())?;
    let name = match path.file_name() {
        Some(name) => name.to_string_lossy().into_owned(),
        None => "/".to_string(),
    };
    let pathname = path.to_string_lossy().into_owned();

    let target = if metadata.file_type().is_symlink() {
        fs::read_link(path)
            .map(|target| target.to_string_lossy().into_owned())
            .unwrap_or_default()
    } else {
        String::new()
    };

    // not every filesystem supports xattrs; a listing failure is not an
    // error, the entry just has none
    let attribute_names: Vec<String> = xattr::list(path)
        .map(|names| {
            names
                .filter_map(|name| {
                    let name = name.to_string_lossy().into_owned();
                    if name.is_empty() {
                        None
                    } else {
                        Some(name)
                    }
                })
                .collect()
        })
        .unwrap_or_default();

    let mut results = vec![ScanResult::Record(ScanRecord {
        pathname: pathname.clone(),
        target,
        fileinfo: fileinfo_from_metadata(&name, &metadata),
        extended_attributes: attribute_names.clone(),
        is_xattr: false,
        xattr_name: String::new(),
    })];

    for attribute in attribute_names {
        results.push(ScanResult::Record(ScanRecord {
            pathname: pathname.clone(),
            target: String::new(),
            fileinfo: fileinfo_from_metadata(&name, &metadata),
            extended_attributes: Vec::new(),
            is_xattr: true,
            xattr_name: attribute,
        }));
    }

    Ok(results)
}

impl Importer for FilesystemImporter {
    fn origin(&self) -> String {
        hostname::get()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    fn kind(&self) -> String {
        "fs".to_string()
    }

    fn root(&self) -> String {
        self.root.to_string_lossy().into_owned()
    }

    fn scan(&self) -> Result<Box<dyn Iterator<Item = ScanResult> + Send>> {
        let root = self.root.clone();
        let (sender, receiver) = crossbeam_channel::bounded(SCAN_CHANNEL_DEPTH);

        std::thread::spawn(move || {
            for entry in walkdir::WalkDir::new(&root) {
                let results = match entry {
                    Ok(entry) => match scan_one(entry.path()) {
                        Ok(results) => results,
                        Err(message) => vec![ScanResult::Error(ScanError {
                            pathname: entry.path().to_string_lossy().into_owned(),
                            message,
                        })],
                    },
                    Err(err) => {
                        let pathname = err
                            .path()
                            .map(|path| path.to_string_lossy().into_owned())
                            .unwrap_or_else(|| root.to_string_lossy().into_owned());
                        vec![ScanResult::Error(ScanError { pathname, message: err.to_string() })]
                    }
                };

                for result in results {
                    if sender.send(result).is_err() {
                        // consumer is gone, stop walking
                        return;
                    }
                }
            }
        });

        Ok(Box::new(receiver.into_iter()))
    }

    fn new_reader(&self, pathname: &str) -> Result<Box<dyn Read + Send>> {
        let file = fs::File::open(pathname)?;
        Ok(Box::new(file))
    }

    fn new_extended_attribute_reader(
        &self,
        pathname: &str,
        name: &str,
    ) -> Result<Box<dyn Read + Send>> {
        match xattr::get(pathname, name)? {
            Some(value) => Ok(Box::new(Cursor::new(value))),
            None => Err(Error::NotFound(format!("xattr '{}' on {}", name, pathname))),
        }
    }

    fn get_extended_attributes(&self, pathname: &str) -> Result<Vec<ExtendedAttribute>> {
        let mut attributes = Vec::new();
        for name in xattr::list(pathname)? {
            let name = name.to_string_lossy().into_owned();
            if let Some(value) = xattr::get(pathname, &name)? {
                attributes.push(ExtendedAttribute { name, value });
            }
        }
        Ok(attributes)
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

//! Filesystem exporter: restores entries below a base directory,
//! applying permissions, timestamps and ownership best-effort.

use std::fs;
use std::io::Write;
use std::path::PathBuf;

use nix::sys::stat::{utimensat, UtimensatFlags};
use nix::sys::time::TimeSpec;
use nix::unistd::{chown, Gid, Uid};

use crate::error::Result;
use crate::snapshot::exporter::Exporter;
use crate::vfs::{EntryKind, FileInfo};

pub struct FilesystemExporter {
    root: PathBuf,
}

impl FilesystemExporter {
    pub fn new(root: &str) -> FilesystemExporter {
        FilesystemExporter { root: PathBuf::from(root) }
    }
}

impl Exporter for FilesystemExporter {
    fn root(&self) -> String {
        self.root.to_string_lossy().into_owned()
    }

    fn create_directory(&self, pathname: &str, _fileinfo: &FileInfo) -> Result<()> {
        fs::create_dir_all(pathname)?;
        Ok(())
    }

    fn create_file(
        &self,
        pathname: &str,
        _fileinfo: &FileInfo,
    ) -> Result<Box<dyn Write + Send>> {
        if let Some(parent) = std::path::Path::new(pathname).parent() {
            fs::create_dir_all(parent)?;
        }
        let file = fs::File::create(pathname)?;
        Ok(Box::new(file))
    }

    fn create_symlink(&self, pathname: &str, target: &str, _fileinfo: &FileInfo) -> Result<()> {
        if let Some(parent) = std::path::Path::new(pathname).parent() {
            fs::create_dir_all(parent)?;
        }
        // replace whatever a previous restore left behind
        let _ = fs::remove_file(pathname);
        std::os::unix::fs::symlink(target, pathname)?;
        Ok(())
    }

    fn set_attributes(&self, pathname: &str, fileinfo: &FileInfo) -> Result<()> {
        use std::os::unix::fs::PermissionsExt;

        if fileinfo.kind != EntryKind::Symlink {
            fs::set_permissions(pathname, fs::Permissions::from_mode(fileinfo.mode))?;
        }

        let mtime = TimeSpec::new(
            fileinfo.mod_time.timestamp(),
            fileinfo.mod_time.timestamp_subsec_nanos() as i64,
        );
        let flag = if fileinfo.kind == EntryKind::Symlink {
            UtimensatFlags::NoFollowSymlink
        } else {
            UtimensatFlags::FollowSymlink
        };
        utimensat(None, std::path::Path::new(pathname), &mtime, &mtime, flag)
            .map_err(|err| std::io::Error::from_raw_os_error(err as i32))?;

        // needs privileges; losing ownership is not a restore failure
        if let Err(err) = chown(
            std::path::Path::new(pathname),
            Some(Uid::from_raw(fileinfo.uid)),
            Some(Gid::from_raw(fileinfo.gid)),
        ) {
            log::debug!("unable to chown {}: {}", pathname, err);
        }

        Ok(())
    }

    fn set_xattr(&self, pathname: &str, name: &str, value: &[u8]) -> Result<()> {
        xattr::set(pathname, name, value)?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::{TimeZone, Utc};
    use std::io::Read;

    fn fileinfo(name: &str, kind: EntryKind, mode: u32) -> FileInfo {
        FileInfo {
            name: name.to_string(),
            kind,
            size: 0,
            mode,
            mod_time: Utc.timestamp_opt(1_600_000_000, 0).unwrap(),
            uid: nix::unistd::getuid().as_raw(),
            gid: nix::unistd::getgid().as_raw(),
            nlink: 1,
            dev: 0,
            ino: 0,
        }
    }

    #[test]
    fn test_file_restore_applies_metadata() {
        use std::os::unix::fs::MetadataExt;

        let dir = tempfile::tempdir().unwrap();
        let exporter = FilesystemExporter::new(&dir.path().to_string_lossy());

        let path = dir.path().join("restored.txt");
        let pathname = path.to_string_lossy().into_owned();
        let info = fileinfo("restored.txt", EntryKind::Regular, 0o640);

        let mut writer = exporter.create_file(&pathname, &info).unwrap();
        writer.write_all(b"contents").unwrap();
        drop(writer);
        exporter.set_attributes(&pathname, &info).unwrap();

        let metadata = fs::metadata(&path).unwrap();
        assert_eq!(metadata.mode() & 0o7777, 0o640);
        assert_eq!(metadata.mtime(), 1_600_000_000);

        let mut contents = String::new();
        fs::File::open(&path).unwrap().read_to_string(&mut contents).unwrap();
        assert_eq!(contents, "contents");
    }

    #[test]
    fn test_symlink_restore() {
        let dir = tempfile::tempdir().unwrap();
        let exporter = FilesystemExporter::new(&dir.path().to_string_lossy());

        let path = dir.path().join("link");
        let pathname = path.to_string_lossy().into_owned();
        let info = fileinfo("link", EntryKind::Symlink, 0o777);

        exporter.create_symlink(&pathname, "somewhere", &info).unwrap();
        assert_eq!(fs::read_link(&path).unwrap().to_string_lossy(), "somewhere");

        // idempotent
        exporter.create_symlink(&pathname, "elsewhere", &info).unwrap();
        assert_eq!(fs::read_link(&path).unwrap().to_string_lossy(), "elsewhere");
    }
}

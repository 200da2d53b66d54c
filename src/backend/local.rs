use std::ffi::OsStr;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use super::Backend;
use crate::error::Result;
use crate::fsops;
use crate::protocol::{DirListing, FileStat, ListOptions, OverwriteMode, StatReport};

/// The local disk.
pub struct LocalBackend {
    home_dir: PathBuf,
}

impl LocalBackend {
    pub fn new() -> Self {
        let home_dir = fsops::get_home_dir().unwrap_or_else(|e| {
            warn!(error = %e, "no home directory, using /");
            PathBuf::from("/")
        });
        Self { home_dir }
    }
}

impl Default for LocalBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for LocalBackend {
    fn list_dir(&mut self, dir: &Path, options: ListOptions, filter: &OsStr) -> Result<DirListing> {
        fsops::list_dir(dir, options, filter)
    }

    fn read_file(&mut self, path: &Path, sink: &mut dyn Write) -> Result<u64> {
        fsops::read_file(path, sink)
    }

    fn write_file(
        &mut self,
        path: &Path,
        len: u64,
        mode: OverwriteMode,
        permissions: u64,
        backup_ext: &OsStr,
        source: &mut dyn Read,
    ) -> Result<FileStat> {
        fsops::write_file(path, len, mode, permissions, backup_ext, source)
    }

    fn check_ordinary_file_access(&mut self, path: &Path, size_limit: u64) -> Result<FileStat> {
        fsops::check_ordinary_file_access(path, size_limit)
    }

    fn stat(&mut self, path: &Path, tolerate_missing: bool) -> Result<StatReport> {
        fsops::stat(path, tolerate_missing)
    }

    fn chdir(&mut self, dir: &Path) -> Result<PathBuf> {
        fsops::chdir(dir)
    }

    fn realpathize(&mut self, path: &Path, homedir: &Path) -> Result<PathBuf> {
        fsops::realpathize(path, homedir)
    }

    fn get_home_dir(&mut self) -> Result<PathBuf> {
        fsops::get_home_dir()
    }

    fn home_dir(&self) -> &Path {
        &self.home_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("note.txt");

        let mut backend = LocalBackend::new();
        let stat = backend
            .write_file(&path, 5, OverwriteMode::Safe, 0o600, OsStr::new(""), &mut &b"hello"[..])
            .unwrap();
        assert_eq!(stat.size, 5);

        let mut out = Vec::new();
        assert_eq!(backend.read_file(&path, &mut out).unwrap(), 5);
        assert_eq!(out, b"hello");
        assert!(backend.home_dir().has_root());
    }
}

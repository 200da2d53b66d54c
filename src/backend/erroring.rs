use std::ffi::OsStr;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use super::Backend;
use crate::error::{Error, Result};
use crate::protocol::{DirListing, FileStat, ListOptions, OverwriteMode, StatReport};

/// Stand-in for a host that could not be set up. Every operation fails
/// with the message recorded at creation.
pub struct ErroringBackend {
    message: String,
}

impl ErroringBackend {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    fn fail<T>(&self) -> Result<T> {
        Err(Error::Unavailable(self.message.clone()))
    }
}

impl Backend for ErroringBackend {
    fn list_dir(&mut self, _dir: &Path, _options: ListOptions, _filter: &OsStr) -> Result<DirListing> {
        self.fail()
    }

    fn read_file(&mut self, _path: &Path, _sink: &mut dyn Write) -> Result<u64> {
        self.fail()
    }

    fn write_file(
        &mut self,
        _path: &Path,
        _len: u64,
        _mode: OverwriteMode,
        _permissions: u64,
        _backup_ext: &OsStr,
        _source: &mut dyn Read,
    ) -> Result<FileStat> {
        self.fail()
    }

    fn check_ordinary_file_access(&mut self, _path: &Path, _size_limit: u64) -> Result<FileStat> {
        self.fail()
    }

    fn stat(&mut self, _path: &Path, _tolerate_missing: bool) -> Result<StatReport> {
        self.fail()
    }

    fn chdir(&mut self, _dir: &Path) -> Result<PathBuf> {
        self.fail()
    }

    fn realpathize(&mut self, _path: &Path, _homedir: &Path) -> Result<PathBuf> {
        self.fail()
    }

    fn get_home_dir(&mut self) -> Result<PathBuf> {
        self.fail()
    }

    fn home_dir(&self) -> &Path {
        Path::new("/")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_call_fails_with_message() {
        let mut backend = ErroringBackend::new("host unreachable");
        match backend.stat(Path::new("/etc"), false) {
            Err(Error::Unavailable(msg)) => assert_eq!(msg, "host unreachable"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(backend.read_file(Path::new("/etc/hosts"), &mut Vec::new()).is_err());
        assert!(backend.chdir(Path::new("")).is_err());
        assert_eq!(backend.home_dir(), Path::new("/"));
    }
}

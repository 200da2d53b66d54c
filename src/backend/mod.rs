//! File-access operation set and its three implementations
//!
//! - `LocalBackend`: the local disk, through `fsops`
//! - `RemoteBackend`: a host reached through a `ClientSession`
//! - `ErroringBackend`: a host that could not be reached; every call fails
//!   with the same message
//!
//! Callers hold a `&mut dyn Backend` from the `Registry` and never need to
//! know which one they got.

mod erroring;
mod local;
mod remote;

pub use erroring::ErroringBackend;
pub use local::LocalBackend;
pub use remote::RemoteBackend;

use std::ffi::OsStr;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::protocol::{DirListing, FileStat, ListOptions, OverwriteMode, StatReport};

/// Paths and names are host bytes (`Path`, `OsStr`) so names that are not
/// UTF-8 survive a round trip.
pub trait Backend {
    /// Entries of `dir` matching `filter`, sorted by name.
    fn list_dir(&mut self, dir: &Path, options: ListOptions, filter: &OsStr) -> Result<DirListing>;

    /// Copy the whole file into `sink`, returning its length.
    fn read_file(&mut self, path: &Path, sink: &mut dyn Write) -> Result<u64>;

    /// Replace `path` with `len` bytes from `source`.
    fn write_file(
        &mut self,
        path: &Path,
        len: u64,
        mode: OverwriteMode,
        permissions: u64,
        backup_ext: &OsStr,
        source: &mut dyn Read,
    ) -> Result<FileStat>;

    fn check_ordinary_file_access(&mut self, path: &Path, size_limit: u64) -> Result<FileStat>;

    fn stat(&mut self, path: &Path, tolerate_missing: bool) -> Result<StatReport>;

    /// Change the working directory; an empty `dir` only reports it.
    fn chdir(&mut self, dir: &Path) -> Result<PathBuf>;

    fn realpathize(&mut self, path: &Path, homedir: &Path) -> Result<PathBuf>;

    fn get_home_dir(&mut self) -> Result<PathBuf>;

    /// Home directory captured when the backend was created.
    fn home_dir(&self) -> &Path;

    /// Release any connection. The backend stays usable.
    fn shutdown(&mut self) {}
}

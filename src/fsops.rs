//! Host-side filesystem operations
//!
//! Both the local backend and the server execute requests through these
//! functions, so a remote host behaves exactly like the local disk.

use std::collections::hash_map::RandomState;
use std::env;
use std::ffi::{CStr, CString, OsStr, OsString};
use std::fs::{self, File, OpenOptions, Permissions};
use std::hash::{BuildHasher, Hasher};
use std::io::{self, Read, Write};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, warn};

use crate::error::{Error, ErrorCode, Result};
use crate::protocol::stat::{S_IFDIR, S_IFIFO, S_IFSOCK};
use crate::protocol::{DirEntry, DirListing, FileStat, ListOptions, OverwriteMode, StatReport, READER_CHUNK};

/// Paths this long or longer are refused by `write_file`.
pub const MAX_PATH_LEN: usize = 1024;
const MAX_LINK_HOPS: usize = 1000;
const TEMP_ATTEMPTS: usize = 100;

fn lstat(path: &Path) -> io::Result<FileStat> {
    fs::symlink_metadata(path).map(|m| FileStat::from(&m))
}

/// List `dir`. Directories are selected by `DIRECTORIES_ONLY`, everything
/// else by `FILES_ONLY`; with neither flag both are. Selection follows
/// symlinks, the recorded stat does not. Names are matched and returned
/// as raw bytes.
pub fn list_dir(dir: &Path, options: ListOptions, filter: &OsStr) -> Result<DirListing> {
    let filter = if filter.is_empty() { &b"*"[..] } else { filter.as_bytes() };
    let want_files = options.contains(ListOptions::FILES_ONLY);
    let want_dirs = options.contains(ListOptions::DIRECTORIES_ONLY);
    let (want_files, want_dirs) = if !want_files && !want_dirs {
        (true, true)
    } else {
        (want_files, want_dirs)
    };

    let reader = fs::read_dir(dir).map_err(|e| Error::fs(&e))?;
    let mut entries = Vec::new();
    for item in reader {
        let item = match item {
            Ok(item) => item,
            Err(e) => {
                debug!(dir = %dir.display(), error = %e, "skipping unreadable entry");
                continue;
            }
        };
        let name = item.file_name();
        let path = dir.join(&name);
        let target = match fs::metadata(&path) {
            Ok(target) => target,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "skipping entry without a target");
                continue;
            }
        };
        let selected = if target.is_dir() { want_dirs } else { want_files };
        if !selected || !glob_match(filter, name.as_bytes()) {
            continue;
        }
        let stat = lstat(&path).unwrap_or_else(|_| FileStat::from(&target));
        entries.push(DirEntry {
            name,
            stat,
            options,
        });
    }

    if want_dirs && dir != Path::new("/") {
        let stat = lstat(&dir.join("..")).unwrap_or_else(|_| FileStat {
            mode: S_IFDIR | 0o777,
            ..Default::default()
        });
        entries.push(DirEntry {
            name: OsString::from(".."),
            stat,
            options,
        });
    }

    let mut listing = DirListing::new(entries);
    listing.sort_by_name();
    Ok(listing)
}

/// Shell-style match supporting `*`, `?` and `[...]` classes with ranges
/// and `!`/`^` negation.
pub fn glob_match(pattern: &[u8], name: &[u8]) -> bool {
    let (mut p, mut n) = (0, 0);
    let mut star: Option<(usize, usize)> = None;
    while n < name.len() {
        if p < pattern.len() {
            match pattern[p] {
                b'*' => {
                    star = Some((p, n));
                    p += 1;
                    continue;
                }
                b'?' => {
                    p += 1;
                    n += 1;
                    continue;
                }
                b'[' => {
                    if let Some((matched, next)) = match_class(pattern, p, name[n]) {
                        if matched {
                            p = next;
                            n += 1;
                            continue;
                        }
                    } else if name[n] == b'[' {
                        p += 1;
                        n += 1;
                        continue;
                    }
                }
                c if c == name[n] => {
                    p += 1;
                    n += 1;
                    continue;
                }
                _ => {}
            }
        }
        match star {
            Some((sp, sn)) => {
                p = sp + 1;
                n = sn + 1;
                star = Some((sp, sn + 1));
            }
            None => return false,
        }
    }
    pattern[p..].iter().all(|&c| c == b'*')
}

/// Match `c` against the class opening at `pattern[start]`. Returns the
/// outcome and the index after `]`, or None when the class is unclosed.
fn match_class(pattern: &[u8], start: usize, c: u8) -> Option<(bool, usize)> {
    let mut i = start + 1;
    let negate = matches!(pattern.get(i), Some(b'!') | Some(b'^'));
    if negate {
        i += 1;
    }
    let mut matched = false;
    let mut first = true;
    while i < pattern.len() {
        let lo = pattern[i];
        if lo == b']' && !first {
            return Some((matched != negate, i + 1));
        }
        first = false;
        if pattern.get(i + 1) == Some(&b'-') && pattern.get(i + 2).is_some_and(|&h| h != b']') {
            let hi = pattern[i + 2];
            matched |= lo <= c && c <= hi;
            i += 3;
        } else {
            matched |= lo == c;
            i += 1;
        }
    }
    None
}

/// An open file and the length it had when opened.
pub struct FileReader {
    file: File,
    len: u64,
}

impl FileReader {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| Error::fs(&e))?;
        let len = file.metadata().map_err(|e| Error::fs(&e))?.len();
        Ok(Self { file, len })
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Fill at most `buf.len()` bytes. A file that shrank since opening
    /// reports ENDOFFILE.
    pub fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize> {
        loop {
            match self.file.read(buf) {
                Ok(0) => {
                    return Err(Error::op(
                        ErrorCode::ENDOFFILE,
                        "System call read() returned zero",
                    ))
                }
                Ok(c) => return Ok(c),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::fs(&e)),
            }
        }
    }
}

/// Copy `path` into `sink`, returning the byte count.
pub fn read_file(path: &Path, sink: &mut dyn Write) -> Result<u64> {
    let mut reader = FileReader::open(path)?;
    let mut chunk = vec![0u8; READER_CHUNK];
    let mut progress = 0u64;
    while progress < reader.len() {
        let want = (reader.len() - progress).min(READER_CHUNK as u64) as usize;
        let c = reader.read_chunk(&mut chunk[..want])?;
        sink.write_all(&chunk[..c])
            .map_err(|e| Error::op(ErrorCode::OTHER_ERROR, e.to_string()))?;
        progress += c as u64;
    }
    Ok(progress)
}

fn temp_name() -> OsString {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let mut h = RandomState::new().build_hasher();
    h.write_u64(COUNTER.fetch_add(1, Ordering::Relaxed));
    h.write_u32(std::process::id());
    h.write_u128(
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0),
    );
    OsString::from(format!("tmp{:x}", h.finish()))
}

/// Create a new sibling of `path` named by `names`. A name that already
/// exists is never opened; the next one is tried.
fn create_temp(
    path: &Path,
    permissions: u32,
    mut names: impl FnMut() -> OsString,
) -> io::Result<(PathBuf, File)> {
    for _ in 0..TEMP_ATTEMPTS {
        let candidate = path.with_file_name(names());
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(permissions)
            .open(&candidate)
        {
            Ok(file) => return Ok((candidate, file)),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                debug!(path = %candidate.display(), "temporary name taken");
            }
            Err(e) => return Err(e),
        }
    }
    Err(io::Error::new(
        io::ErrorKind::AlreadyExists,
        "no free temporary file name",
    ))
}

fn chown(path: &Path, uid: u64, gid: u64) -> io::Result<()> {
    let c = CString::new(path.as_os_str().as_bytes())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    // SAFETY: `c` is a valid NUL-terminated string for the call's duration.
    let r = unsafe { libc::chown(c.as_ptr(), uid as libc::uid_t, gid as libc::gid_t) };
    if r == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// Copy exactly `len` bytes from `source` into `file`. Failures here leave
/// the peer mid-stream, so they carry force_shutdown.
fn copy_body(file: &mut File, len: u64, source: &mut dyn Read) -> Result<()> {
    let mut chunk = vec![0u8; READER_CHUNK];
    let mut remaining = len;
    while remaining > 0 {
        let want = remaining.min(READER_CHUNK as u64) as usize;
        let c = match source.read(&mut chunk[..want]) {
            Ok(0) => {
                return Err(Error::op(ErrorCode::OTHER_ERROR, "Ran out of data to write").with_shutdown())
            }
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(Error::op(ErrorCode::OTHER_ERROR, e.to_string()).with_shutdown()),
        };
        file.write_all(&chunk[..c])
            .map_err(|e| Error::fs(&e).with_shutdown())?;
        remaining -= c as u64;
    }
    Ok(())
}

/// Write `len` bytes from `source` to `path`.
///
/// `Safe` and `Backup` write a random sibling first and only rename it over
/// the target once the whole body has landed, so a failed transfer leaves
/// the original untouched. A missing target always takes the `Quick` path.
pub fn write_file(
    path: &Path,
    len: u64,
    mode: OverwriteMode,
    permissions: u64,
    backup_ext: &OsStr,
    source: &mut dyn Read,
) -> Result<FileStat> {
    if path.as_os_str().len() >= MAX_PATH_LEN {
        return Err(Error::op(ErrorCode::PATHNAME_TOO_LONG, "Pathname too long").with_shutdown());
    }
    let permissions = (permissions & 0o7777) as u32;

    let mut mode = mode;
    let mut original = FileStat::default();
    match OpenOptions::new().write(true).open(path) {
        Ok(_) => {
            if mode != OverwriteMode::Quick {
                original = fs::metadata(path)
                    .map(|m| FileStat::from(&m))
                    .map_err(|e| Error::fs(&e).with_shutdown())?;
            }
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => mode = OverwriteMode::Quick,
        Err(e) => return Err(Error::fs(&e).with_shutdown()),
    }

    let opened = match mode {
        OverwriteMode::Quick => OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(permissions)
            .open(path)
            .map(|file| (path.to_path_buf(), file)),
        OverwriteMode::Safe | OverwriteMode::Backup => create_temp(path, permissions, temp_name),
    };
    let (target, mut file) = opened.map_err(|e| Error::fs(&e).with_shutdown())?;

    if let Err(e) = copy_body(&mut file, len, source) {
        drop(file);
        if target != path {
            let _ = fs::remove_file(&target);
        }
        return Err(e);
    }
    drop(file);

    if mode != OverwriteMode::Quick {
        if mode == OverwriteMode::Backup {
            let mut backup = path.as_os_str().to_os_string();
            backup.push(backup_ext);
            fs::rename(path, &backup).map_err(|e| Error::fs(&e))?;
        }
        fs::rename(&target, path).map_err(|e| Error::fs(&e))?;
        if let Err(e) = chown(path, original.uid, original.gid) {
            debug!(path = %path.display(), error = %e, "chown after safe write failed");
        }
        // after chown, which clears setuid
        fs::set_permissions(path, Permissions::from_mode(original.permissions() as u32))
            .map_err(|e| Error::fs(&e))?;
    }

    fs::metadata(path)
        .map(|m| FileStat::from(&m))
        .map_err(|e| Error::fs(&e))
}

/// Confirm `path` can be opened for reading, is a plain file and is
/// smaller than `size_limit`.
pub fn check_ordinary_file_access(path: &Path, size_limit: u64) -> Result<FileStat> {
    let fail = |msg: String| Error::op(ErrorCode::OTHER_ERROR, msg);
    let shown = path.display();
    let file = File::open(path).map_err(|e| {
        fail(format!(
            " Failed trying to open file for reading: {} \n [{}] ",
            shown,
            Error::fs(&e)
        ))
    })?;
    let stat = fs::metadata(path)
        .map(|m| FileStat::from(&m))
        .map_err(|e| {
            fail(format!(
                " Cannot get size/permissions info on file: {} \n [{}] ",
                shown,
                Error::fs(&e)
            ))
        })?;
    drop(file);
    if matches!(stat.file_type(), S_IFDIR | S_IFSOCK | S_IFIFO) {
        return Err(fail(format!(" Not an ordinary file: {shown} ")));
    }
    if stat.size >= size_limit {
        return Err(fail(format!(" File is too large: {shown} ")));
    }
    Ok(stat)
}

/// Stat following symlinks. With `tolerate_missing`, ENOENT is reported
/// in the result rather than as an error.
pub fn stat(path: &Path, tolerate_missing: bool) -> Result<StatReport> {
    match fs::metadata(path) {
        Ok(m) => Ok(StatReport {
            stat: FileStat::from(&m),
            ..Default::default()
        }),
        Err(e) if tolerate_missing && e.kind() == io::ErrorKind::NotFound => {
            let err = Error::fs(&e);
            Ok(StatReport {
                stat: FileStat::default(),
                just_not_there: true,
                error_code: err.code(),
                message: err.wire_message(),
            })
        }
        Err(e) => Err(Error::fs(&e)),
    }
}

fn current_dir() -> PathBuf {
    env::current_dir().unwrap_or_else(|_| PathBuf::from("/"))
}

/// Change the process working directory; empty means stay. Returns the
/// working directory afterwards.
pub fn chdir(dir: &Path) -> Result<PathBuf> {
    if !dir.as_os_str().is_empty() {
        env::set_current_dir(dir).map_err(|e| Error::fs(&e))?;
    }
    Ok(current_dir())
}

/// `$HOME`, falling back to the passwd entry of the effective user.
pub fn get_home_dir() -> Result<PathBuf> {
    if let Some(home) = env::var_os("HOME").filter(|h| !h.is_empty()) {
        return Ok(PathBuf::from(home));
    }
    // SAFETY: passwd is plain old data; all-zero is a valid value.
    let mut pwd: libc::passwd = unsafe { std::mem::zeroed() };
    let mut buf = vec![0 as libc::c_char; 16 * 1024];
    let mut result: *mut libc::passwd = std::ptr::null_mut();
    // SAFETY: every pointer refers to storage that outlives the call.
    let r = unsafe {
        libc::getpwuid_r(
            libc::geteuid(),
            &mut pwd,
            buf.as_mut_ptr(),
            buf.len(),
            &mut result,
        )
    };
    if r != 0 {
        return Err(Error::fs(&io::Error::from_raw_os_error(r)));
    }
    if result.is_null() || pwd.pw_dir.is_null() {
        return Err(Error::op(ErrorCode::OTHER_ERROR, "no passwd entry for effective user"));
    }
    // SAFETY: getpwuid_r succeeded, so pw_dir points into `buf`.
    let dir = unsafe { CStr::from_ptr(pwd.pw_dir) }.to_bytes();
    if dir.is_empty() {
        warn!("passwd entry has an empty home directory");
        return Err(Error::op(
            ErrorCode::OTHER_ERROR,
            "getpwuid returned empty field pw_dir for home directory and HOME env var is empty",
        ));
    }
    Ok(PathBuf::from(OsStr::from_bytes(dir)))
}

fn components(path: &OsStr) -> Vec<OsString> {
    path.as_bytes()
        .split(|&b| b == b'/')
        .map(|c| OsStr::from_bytes(c).to_os_string())
        .collect()
}

/// Drop empty and `.` components and fold `..` into its parent.
fn strip(comps: Vec<OsString>) -> Vec<OsString> {
    let mut out: Vec<OsString> = Vec::with_capacity(comps.len());
    for c in comps {
        match c.as_bytes() {
            b"" | b"." => {}
            b".." => {
                out.pop();
            }
            _ => out.push(c),
        }
    }
    out
}

fn combine(comps: &[OsString]) -> PathBuf {
    if comps.is_empty() {
        return PathBuf::from("/");
    }
    let joined = comps.iter().fold(OsString::new(), |mut s, c| {
        s.push("/");
        s.push(c);
        s
    });
    PathBuf::from(joined)
}

/// Absolute, `..`-free form of `path` with symlinks in its existing part
/// resolved. A leading `~` component stands for `homedir`.
pub fn realpathize(path: &Path, homedir: &Path) -> Result<PathBuf> {
    let mut comps = components(path.as_os_str());
    if comps.first().is_some_and(|c| c == "~") {
        let mut expanded = components(homedir.as_os_str());
        expanded.extend(comps.drain(1..));
        comps = expanded;
    } else if !path.has_root() {
        let mut expanded = components(current_dir().as_os_str());
        expanded.extend(comps);
        comps = expanded;
    }
    let mut comps = strip(comps);

    let mut hops = 0;
    let mut i = 0;
    while i < comps.len() {
        let prefix = combine(&comps[..=i]);
        match fs::read_link(&prefix) {
            Ok(target) if hops < MAX_LINK_HOPS => {
                hops += 1;
                let mut next = if target.has_root() {
                    Vec::new()
                } else {
                    comps[..i].to_vec()
                };
                next.extend(components(target.as_os_str()));
                next.extend(comps.drain(i + 1..));
                comps = strip(next);
                i = 0;
            }
            _ => i += 1,
        }
    }
    Ok(combine(&comps))
}

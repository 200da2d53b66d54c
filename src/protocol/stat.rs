//! Portable file status and directory listings
//!
//! A `FileStat` travels as a record:
//! ┌─────────┬────────────┬──────────────┬──────────────────┐
//! │ os_type │ os_subtype │ posix record │ windows record?  │
//! └─────────┴────────────┴──────────────┴──────────────────┘
//!
//! The posix record holds 14 unsigned fields in a fixed order. A reader
//! from one OS family skips blocks it does not model.

use std::ffi::{OsStr, OsString};
use std::fs::Metadata;
use std::ops::BitOr;
use std::os::unix::fs::MetadataExt;

use super::encoder::{DecodeError, Decoder, Encoder};
use super::record::{Field, Record};
use crate::error::ErrorCode;

pub const OS_TYPE_POSIX: u64 = 0;
pub const OS_TYPE_WINDOWS: u64 = 1;
pub const OS_SUBTYPE_LINUX: u64 = 0;

pub const S_IFMT: u64 = 0o170000;
pub const S_IFSOCK: u64 = 0o140000;
pub const S_IFLNK: u64 = 0o120000;
pub const S_IFREG: u64 = 0o100000;
pub const S_IFDIR: u64 = 0o040000;
pub const S_IFIFO: u64 = 0o010000;

const POSIX_FIELDS: usize = 14;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WindowsAttributes {
    pub file_attributes: u64,
    pub creation_time: u64,
    pub last_accessed_time: u64,
    pub last_write_time: u64,
    pub file_size: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileStat {
    pub os_type: u64,
    pub os_subtype: u64,
    pub dev: u64,
    pub ino: u64,
    pub mode: u64,
    pub nlink: u64,
    pub uid: u64,
    pub gid: u64,
    pub rdev_major: u64,
    pub rdev_minor: u64,
    pub size: u64,
    pub blksize: u64,
    pub blocks: u64,
    pub atime: u64,
    pub mtime: u64,
    pub ctime: u64,
    pub windows: Option<WindowsAttributes>,
}

/// glibc's `gnu_dev_major`/`gnu_dev_minor` split.
fn split_rdev(rdev: u64) -> (u64, u64) {
    let major = ((rdev >> 8) & 0xfff) | ((rdev >> 32) & !0xfff);
    let minor = (rdev & 0xff) | ((rdev >> 12) & !0xff);
    (major, minor)
}

impl From<&Metadata> for FileStat {
    fn from(m: &Metadata) -> Self {
        let (rdev_major, rdev_minor) = split_rdev(m.rdev());
        Self {
            os_type: OS_TYPE_POSIX,
            os_subtype: OS_SUBTYPE_LINUX,
            dev: m.dev(),
            ino: m.ino(),
            mode: u64::from(m.mode()),
            nlink: m.nlink(),
            uid: u64::from(m.uid()),
            gid: u64::from(m.gid()),
            rdev_major,
            rdev_minor,
            size: m.size(),
            blksize: m.blksize(),
            blocks: m.blocks(),
            atime: m.atime().max(0) as u64,
            mtime: m.mtime().max(0) as u64,
            ctime: m.ctime().max(0) as u64,
            windows: None,
        }
    }
}

impl FileStat {
    #[inline(always)]
    pub fn file_type(&self) -> u64 {
        self.mode & S_IFMT
    }

    pub fn is_dir(&self) -> bool {
        self.file_type() == S_IFDIR
    }

    pub fn is_regular(&self) -> bool {
        self.file_type() == S_IFREG
    }

    pub fn is_symlink(&self) -> bool {
        self.file_type() == S_IFLNK
    }

    pub fn permissions(&self) -> u64 {
        self.mode & 0o7777
    }

    fn posix_record(&self) -> Record {
        [
            self.dev,
            self.ino,
            self.mode,
            self.nlink,
            self.uid,
            self.gid,
            self.rdev_major,
            self.rdev_minor,
            self.size,
            self.blksize,
            self.blocks,
            self.atime,
            self.mtime,
            self.ctime,
        ]
        .into_iter()
        .fold(Record::new(), |r, v| r.with(Field::Uint(v)))
    }

    pub fn to_record(&self) -> Record {
        let mut record = Record::new()
            .with(Field::Uint(self.os_type))
            .with(Field::Uint(self.os_subtype))
            .with(Field::Record(self.posix_record()));
        if let Some(w) = &self.windows {
            record.push(Field::Record(
                Record::new()
                    .with(Field::Uint(w.file_attributes))
                    .with(Field::Uint(w.creation_time))
                    .with(Field::Uint(w.last_accessed_time))
                    .with(Field::Uint(w.last_write_time))
                    .with(Field::Uint(w.file_size)),
            ));
        }
        record
    }

    /// Missing or unexpected fields read as zero.
    pub fn from_record(record: &Record) -> Self {
        let mut stat = FileStat {
            os_type: record.uint(0).unwrap_or(OS_TYPE_POSIX),
            os_subtype: record.uint(1).unwrap_or(OS_SUBTYPE_LINUX),
            ..Default::default()
        };
        if let Some(p) = record.record(2) {
            let mut v = [0u64; POSIX_FIELDS];
            for (i, slot) in v.iter_mut().enumerate() {
                *slot = p.uint(i).unwrap_or(0);
            }
            let [dev, ino, mode, nlink, uid, gid, rdev_major, rdev_minor, size, blksize, blocks, atime, mtime, ctime] =
                v;
            stat = FileStat {
                dev,
                ino,
                mode,
                nlink,
                uid,
                gid,
                rdev_major,
                rdev_minor,
                size,
                blksize,
                blocks,
                atime,
                mtime,
                ctime,
                ..stat
            };
        }
        if stat.os_type == OS_TYPE_WINDOWS {
            stat.windows = record.record(3).map(|w| WindowsAttributes {
                file_attributes: w.uint(0).unwrap_or(0),
                creation_time: w.uint(1).unwrap_or(0),
                last_accessed_time: w.uint(2).unwrap_or(0),
                last_write_time: w.uint(3).unwrap_or(0),
                file_size: w.uint(4).unwrap_or(0),
            });
        }
        stat
    }

    pub fn encode(&self, enc: &mut Encoder) {
        self.to_record().encode(enc);
    }

    pub fn decode(dec: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        Ok(Self::from_record(&Record::decode(dec)?))
    }
}

/// Result of a `stat` call that may tolerate a missing path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatReport {
    pub stat: FileStat,
    pub just_not_there: bool,
    pub error_code: ErrorCode,
    pub message: String,
}

impl StatReport {
    pub fn encode(&self, enc: &mut Encoder) {
        enc.put_uint(u64::from(self.just_not_there))
            .put_uint(self.error_code.0)
            .put_str(&self.message);
        self.stat.encode(enc);
    }

    pub fn decode(dec: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let just_not_there = dec.uint()? != 0;
        let error_code = ErrorCode(dec.uint()?);
        let message = String::from_utf8_lossy(dec.str_bounded(crate::error::MAX_ERROR_MESSAGE + 1)?)
            .into_owned();
        Ok(Self {
            stat: FileStat::decode(dec)?,
            just_not_there,
            error_code,
            message,
        })
    }
}

/// Directory listing flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ListOptions(pub u64);

impl ListOptions {
    pub const NONE: Self = Self(0);
    pub const LAST_ENTRY: Self = Self(1 << 8);
    pub const FILES_ONLY: Self = Self(1 << 15);
    pub const DIRECTORIES_ONLY: Self = Self(1 << 16);

    #[inline(always)]
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for ListOptions {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// One listed name. Names are host bytes and need not be UTF-8.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirEntry {
    pub name: OsString,
    pub stat: FileStat,
    pub options: ListOptions,
}

impl DirEntry {
    pub fn is_last(&self) -> bool {
        self.options.contains(ListOptions::LAST_ENTRY)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirListing {
    entries: Vec<DirEntry>,
}

impl DirListing {
    pub fn new(entries: Vec<DirEntry>) -> Self {
        Self { entries }
    }

    pub fn entries(&self) -> &[DirEntry] {
        &self.entries
    }

    pub fn into_entries(self) -> Vec<DirEntry> {
        self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, DirEntry> {
        self.entries.iter()
    }

    pub fn find(&self, name: impl AsRef<OsStr>) -> Option<&DirEntry> {
        let name = name.as_ref();
        self.entries.iter().find(|e| e.name.as_os_str() == name)
    }

    pub fn sort_by_name(&mut self) {
        self.entries.sort_by(|a, b| a.name.cmp(&b.name));
    }

    /// Entries followed by an empty sentinel flagged `LAST_ENTRY`, for
    /// callers that walk a listing until the marker.
    pub fn terminated(&self) -> Vec<DirEntry> {
        let mut v = self.entries.clone();
        v.push(DirEntry {
            options: ListOptions::LAST_ENTRY,
            ..Default::default()
        });
        v
    }

    pub fn encode(&self, enc: &mut Encoder) {
        enc.put_uint(self.entries.len() as u64);
        for e in &self.entries {
            enc.put_os_str(&e.name);
            e.stat.encode(enc);
        }
    }

    pub fn decode(dec: &mut Decoder<'_>, options: ListOptions) -> Result<Self, DecodeError> {
        let n = dec.uint()?;
        if n > dec.remaining() as u64 {
            return Err(DecodeError::BadLength(n));
        }
        let mut entries = Vec::with_capacity(n as usize);
        for _ in 0..n {
            let name = dec.os_string()?;
            let stat = FileStat::decode(dec)?;
            entries.push(DirEntry {
                name,
                stat,
                options,
            });
        }
        Ok(Self { entries })
    }
}

impl<'a> IntoIterator for &'a DirListing {
    type Item = &'a DirEntry;
    type IntoIter = std::slice::Iter<'a, DirEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> FileStat {
        FileStat {
            dev: 2049,
            ino: 1_234_567,
            mode: S_IFREG | 0o644,
            nlink: 1,
            uid: 1000,
            gid: 1000,
            size: 4096,
            blksize: 4096,
            blocks: 8,
            atime: 1_700_000_000,
            mtime: 1_700_000_001,
            ctime: 1_700_000_002,
            ..Default::default()
        }
    }

    #[test]
    fn test_stat_roundtrip() {
        let mut enc = Encoder::new();
        sample().encode(&mut enc);
        let decoded = FileStat::decode(&mut Decoder::new(enc.as_bytes())).unwrap();
        assert_eq!(decoded, sample());
        assert!(decoded.is_regular());
        assert_eq!(decoded.permissions(), 0o644);
    }

    #[test]
    fn test_windows_block_ignored_by_posix_reader() {
        let mut stat = sample();
        stat.windows = Some(WindowsAttributes {
            file_attributes: 0x20,
            file_size: 4096,
            ..Default::default()
        });
        let mut enc = Encoder::new();
        stat.encode(&mut enc);
        let decoded = FileStat::decode(&mut Decoder::new(enc.as_bytes())).unwrap();
        assert_eq!(decoded.windows, None);
        assert_eq!(decoded.size, 4096);

        stat.os_type = OS_TYPE_WINDOWS;
        let mut enc = Encoder::new();
        stat.encode(&mut enc);
        let decoded = FileStat::decode(&mut Decoder::new(enc.as_bytes())).unwrap();
        assert_eq!(decoded.windows.map(|w| w.file_attributes), Some(0x20));
    }

    #[test]
    fn test_stat_from_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"hello").unwrap();
        let stat = FileStat::from(&std::fs::metadata(&path).unwrap());
        assert_eq!(stat.size, 5);
        assert!(stat.is_regular());
        assert!(FileStat::from(&std::fs::metadata(dir.path()).unwrap()).is_dir());
    }

    #[test]
    fn test_rdev_split() {
        // makedev(8, 1) and a large glibc-style number
        assert_eq!(split_rdev(0x801), (8, 1));
        assert_eq!(split_rdev(0x0000_1000_0000_2345), (0x1023, 0x1_0000_0045));
    }

    #[test]
    fn test_listing_sentinel_and_lookup() {
        let listing = DirListing::new(vec![DirEntry {
            name: "a.txt".into(),
            stat: sample(),
            options: ListOptions::FILES_ONLY,
        }]);
        let terminated = listing.terminated();
        assert_eq!(terminated.len(), 2);
        assert!(terminated[1].is_last());
        assert!(!terminated[0].is_last());
        assert_eq!(listing.find("a.txt").map(|e| e.stat.size), Some(4096));
    }

    #[test]
    fn test_listing_keeps_raw_names() {
        use std::os::unix::ffi::OsStrExt;

        let name = OsStr::from_bytes(b"caf\xe9.txt");
        let listing = DirListing::new(vec![DirEntry {
            name: name.to_os_string(),
            stat: sample(),
            options: ListOptions::FILES_ONLY,
        }]);
        let mut enc = Encoder::new();
        listing.encode(&mut enc);
        let decoded =
            DirListing::decode(&mut Decoder::new(enc.as_bytes()), ListOptions::FILES_ONLY).unwrap();
        assert_eq!(decoded, listing);
        assert!(decoded.find(name).is_some());
    }

    #[test]
    fn test_listing_rejects_absurd_count() {
        let mut enc = Encoder::new();
        enc.put_uint(1_000_000);
        assert!(DirListing::decode(&mut Decoder::new(enc.as_bytes()), ListOptions::NONE).is_err());
    }
}

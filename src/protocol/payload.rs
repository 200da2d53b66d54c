//! Request and response payloads
//!
//! Every response payload opens with a status word: `0` followed by the
//! action's data, or `1` followed by `code`, `message` and
//! `force_shutdown`.
//!
//! Paths and file names travel as raw host bytes.

use std::ffi::OsString;
use std::path::PathBuf;

use super::encoder::{DecodeError, Decoder, Encoder};
use super::message::Action;
use super::stat::{DirListing, FileStat, ListOptions, StatReport};
use crate::error::{Error, ErrorCode, MAX_ERROR_MESSAGE};

const STATUS_SUCCESS: u64 = 0;
const STATUS_ERROR: u64 = 1;

#[repr(u8)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OverwriteMode {
    /// Truncate and write in place.
    #[default]
    Quick = 0,
    /// Write a temporary sibling, then rename it over the target.
    Safe = 1,
    /// Like `Safe`, keeping the old file under a backup name.
    Backup = 2,
}

impl OverwriteMode {
    pub fn from_u64(v: u64) -> Option<Self> {
        match v {
            0 => Some(Self::Quick),
            1 => Some(Self::Safe),
            2 => Some(Self::Backup),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    ReadDir {
        dir: PathBuf,
        options: ListOptions,
        filter: OsString,
    },
    ReadFile {
        path: PathBuf,
    },
    WriteFile {
        path: PathBuf,
        len: u64,
        mode: OverwriteMode,
        permissions: u64,
        backup_ext: OsString,
    },
    CheckOrdinaryFileAccess {
        path: PathBuf,
        size_limit: u64,
    },
    Stat {
        path: PathBuf,
        tolerate_missing: bool,
    },
    Chdir {
        dir: PathBuf,
    },
    Realpathize {
        path: PathBuf,
        homedir: PathBuf,
    },
    GetHomeDir,
}

impl Request {
    pub fn action(&self) -> Action {
        match self {
            Request::ReadDir { .. } => Action::ReadDir,
            Request::ReadFile { .. } => Action::ReadFile,
            Request::WriteFile { .. } => Action::WriteFile,
            Request::CheckOrdinaryFileAccess { .. } => Action::CheckOrdinaryFileAccess,
            Request::Stat { .. } => Action::Stat,
            Request::Chdir { .. } => Action::Chdir,
            Request::Realpathize { .. } => Action::Realpathize,
            Request::GetHomeDir => Action::GetHomeDir,
        }
    }

    pub fn encode(&self, enc: &mut Encoder) {
        match self {
            Request::ReadDir {
                dir,
                options,
                filter,
            } => {
                enc.put_os_str(dir).put_uint(options.0).put_os_str(filter);
            }
            Request::ReadFile { path } => {
                enc.put_os_str(path);
            }
            Request::WriteFile {
                path,
                len,
                mode,
                permissions,
                backup_ext,
            } => {
                enc.put_os_str(path)
                    .put_uint(*len)
                    .put_uint(*mode as u64)
                    .put_uint(*permissions)
                    .put_os_str(backup_ext);
            }
            Request::CheckOrdinaryFileAccess { path, size_limit } => {
                enc.put_os_str(path).put_uint(*size_limit);
            }
            Request::Stat {
                path,
                tolerate_missing,
            } => {
                enc.put_os_str(path).put_uint(u64::from(*tolerate_missing));
            }
            Request::Chdir { dir } => {
                enc.put_os_str(dir);
            }
            Request::Realpathize { path, homedir } => {
                enc.put_os_str(path).put_os_str(homedir);
            }
            Request::GetHomeDir => {}
        }
    }

    /// Parse the payload of a known action. `NotImplemented` has no request
    /// form and is rejected.
    pub fn decode(action: Action, dec: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let request = match action {
            Action::NotImplemented => return Err(DecodeError::Invalid("no request for action 0")),
            Action::ReadDir => Request::ReadDir {
                dir: dec.path()?,
                options: ListOptions(dec.uint()?),
                filter: dec.os_string()?,
            },
            Action::ReadFile => Request::ReadFile {
                path: dec.path()?,
            },
            Action::WriteFile => Request::WriteFile {
                path: dec.path()?,
                len: dec.uint()?,
                mode: OverwriteMode::from_u64(dec.uint()?)
                    .ok_or(DecodeError::Invalid("unknown overwrite mode"))?,
                permissions: dec.uint()?,
                backup_ext: dec.os_string()?,
            },
            Action::CheckOrdinaryFileAccess => Request::CheckOrdinaryFileAccess {
                path: dec.path()?,
                size_limit: dec.uint()?,
            },
            Action::Stat => Request::Stat {
                path: dec.path()?,
                tolerate_missing: dec.uint()? != 0,
            },
            Action::Chdir => Request::Chdir {
                dir: dec.path()?,
            },
            Action::Realpathize => Request::Realpathize {
                path: dec.path()?,
                homedir: dec.path()?,
            },
            Action::GetHomeDir => Request::GetHomeDir,
        };
        Ok(request)
    }
}

/// Successful result of a request, as the server sends it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Listing(DirListing),
    Stat(FileStat),
    StatReport(StatReport),
    Path(PathBuf),
    /// Status word only.
    Done,
}

impl Response {
    pub fn encode(&self, enc: &mut Encoder) {
        enc.put_uint(STATUS_SUCCESS);
        match self {
            Response::Listing(l) => l.encode(enc),
            Response::Stat(s) => s.encode(enc),
            Response::StatReport(r) => r.encode(enc),
            Response::Path(p) => {
                enc.put_os_str(p);
            }
            Response::Done => {}
        }
    }
}

pub fn encode_error(enc: &mut Encoder, err: &Error) {
    encode_error_parts(enc, err.code(), &err.wire_message(), err.force_shutdown());
}

pub fn encode_error_parts(enc: &mut Encoder, code: ErrorCode, message: &str, force_shutdown: bool) {
    enc.put_uint(STATUS_ERROR)
        .put_uint(code.0)
        .put_str(crate::error::truncate_message(message))
        .put_uint(u64::from(force_shutdown));
}

/// Consume the status word. An error response becomes `Error::Op`.
pub fn read_status(dec: &mut Decoder<'_>) -> crate::Result<()> {
    match dec.uint()? {
        STATUS_SUCCESS => Ok(()),
        STATUS_ERROR => {
            let code = ErrorCode(dec.uint()?);
            let message = String::from_utf8_lossy(dec.str_bounded(MAX_ERROR_MESSAGE + 1)?).into_owned();
            let force_shutdown = dec.uint()? != 0;
            Err(Error::Op {
                code,
                message,
                force_shutdown,
            })
        }
        _ => Err(DecodeError::Invalid("bad response status").into()),
    }
}

use std::ffi::OsStr;
use std::io::{self, Read, Write};
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::Backend;
use crate::config::ClientConfig;
use crate::error::{Error, ErrorCode, Result};
use crate::network::ClientSession;
use crate::protocol::message::get_u48;
use crate::protocol::{
    Action, DecodeError, Decoder, DirListing, Encoder, FileStat, ListOptions, OverwriteMode,
    Request, StatReport, READER_CHUNK,
};

/// A host served by `remotefs_server`.
pub struct RemoteBackend {
    session: ClientSession,
    home_dir: PathBuf,
}

impl RemoteBackend {
    /// Connect lazily; the home directory stays "/" until fetched.
    pub fn new(ip: IpAddr, config: ClientConfig) -> Self {
        Self {
            session: ClientSession::new(ip, config),
            home_dir: PathBuf::from("/"),
        }
    }

    /// Reach the host and cache its home directory.
    pub fn connect(ip: IpAddr, config: ClientConfig) -> Result<Self> {
        let mut backend = Self::new(ip, config);
        backend.home_dir = backend.get_home_dir()?;
        Ok(backend)
    }

    pub fn session(&self) -> &ClientSession {
        &self.session
    }

    fn encode(request: &Request) -> Vec<u8> {
        let mut enc = Encoder::new();
        request.encode(&mut enc);
        enc.into_bytes()
    }

    fn call<T>(
        &mut self,
        request: Request,
        decode: impl FnOnce(&mut Decoder<'_>) -> std::result::Result<T, DecodeError>,
    ) -> Result<T> {
        let action = request.action();
        let payload = self.session.request(action, &Self::encode(&request))?;
        self.session.decode_response(&payload, decode)
    }
}

impl Backend for RemoteBackend {
    fn list_dir(&mut self, dir: &Path, options: ListOptions, filter: &OsStr) -> Result<DirListing> {
        let request = Request::ReadDir {
            dir: dir.to_path_buf(),
            options,
            filter: filter.to_os_string(),
        };
        self.call(request, |dec| DirListing::decode(dec, options))
    }

    fn read_file(&mut self, path: &Path, sink: &mut dyn Write) -> Result<u64> {
        let request = Request::ReadFile {
            path: path.to_path_buf(),
        };
        self.session
            .send_message(Action::ReadFile, &Self::encode(&request))?;

        let mut raw = [0u8; 6];
        self.session.read_exact(&mut raw)?;
        let len = get_u48(&raw);

        // Keep reading after a sink failure so the response still lines up.
        let mut chunk = vec![0u8; READER_CHUNK];
        let mut left = len;
        let mut sink_error = None;
        while left > 0 {
            let n = left.min(READER_CHUNK as u64) as usize;
            self.session.read_exact(&mut chunk[..n])?;
            if sink_error.is_none() {
                if let Err(e) = sink.write_all(&chunk[..n]) {
                    warn!(path = %path.display(), error = %e, "sink rejected file data");
                    sink_error = Some(Error::fs(&e));
                }
            }
            left -= n as u64;
        }

        let payload = self.session.recv_message(Action::ReadFile)?;
        let status = self.session.decode_response(&payload, |_| Ok(()));
        if let Some(e) = sink_error {
            return Err(e);
        }
        status.map(|()| len)
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
        // A dropped connection must never leave a half-written file behind.
        let mode = match mode {
            OverwriteMode::Quick => OverwriteMode::Safe,
            other => other,
        };
        let request = Request::WriteFile {
            path: path.to_path_buf(),
            len,
            mode,
            permissions,
            backup_ext: backup_ext.to_os_string(),
        };
        self.session
            .send_message(Action::WriteFile, &Self::encode(&request))?;

        let mut chunk = vec![0u8; READER_CHUNK];
        let mut sent = 0u64;
        let mut early_ack = None;
        while sent < len {
            if let Some(ack) = self.session.maybe_see_ack()? {
                debug!(path = %path.display(), sent, code = %ack.code, "server stopped the upload");
                early_ack = Some(ack);
                break;
            }
            let want = (len - sent).min(READER_CHUNK as u64) as usize;
            let n = match source.read(&mut chunk[..want]) {
                Ok(0) => {
                    self.session.disconnect();
                    return Err(Error::op(ErrorCode::OTHER_ERROR, "Ran out of data to write"));
                }
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.session.disconnect();
                    return Err(Error::fs(&e));
                }
            };
            self.session.write_all(&chunk[..n])?;
            sent += n as u64;
        }

        if early_ack.is_none() {
            self.session.recv_ack()?;
        }
        let payload = self.session.recv_message(Action::WriteFile)?;
        let result = self.session.decode_response(&payload, FileStat::decode);
        if sent < len {
            // the server is still discarding the rest of the body
            self.session.disconnect();
        }
        result
    }

    fn check_ordinary_file_access(&mut self, path: &Path, size_limit: u64) -> Result<FileStat> {
        let request = Request::CheckOrdinaryFileAccess {
            path: path.to_path_buf(),
            size_limit,
        };
        self.call(request, FileStat::decode)
    }

    fn stat(&mut self, path: &Path, tolerate_missing: bool) -> Result<StatReport> {
        let request = Request::Stat {
            path: path.to_path_buf(),
            tolerate_missing,
        };
        self.call(request, StatReport::decode)
    }

    fn chdir(&mut self, dir: &Path) -> Result<PathBuf> {
        let request = Request::Chdir {
            dir: dir.to_path_buf(),
        };
        self.call(request, |dec| dec.path())
    }

    fn realpathize(&mut self, path: &Path, homedir: &Path) -> Result<PathBuf> {
        let request = Request::Realpathize {
            path: path.to_path_buf(),
            homedir: homedir.to_path_buf(),
        };
        self.call(request, |dec| dec.path())
    }

    fn get_home_dir(&mut self) -> Result<PathBuf> {
        self.call(Request::GetHomeDir, |dec| dec.path())
    }

    fn home_dir(&self) -> &Path {
        &self.home_dir
    }

    fn shutdown(&mut self) {
        self.session.disconnect();
    }
}

//! End-to-end tests against a real server on a loopback port.
//!
//! Each test starts its own server thread on port 0 and talks to it with
//! `RemoteBackend`, `ClientSession` or a bare `TcpStream` when the test
//! needs to misbehave on purpose.

use std::ffi::OsStr;
use std::fs;
use std::io::{self, Read, Write};
use std::net::{IpAddr, SocketAddr, TcpStream};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use remotefs::network::{ClientSession, Server};
use remotefs::protocol::payload::read_status;
use remotefs::protocol::{
    Ack, Action, Decoder, ListOptions, MessageHeader, OverwriteMode, ACK_SIZE, HEADER_SIZE, MAGIC,
    VERSION,
};
use remotefs::{Backend, ClientConfig, Error, ErrorCode, RemoteBackend, ServerConfig};

const LOCALHOST: &str = "127.0.0.1";

struct TestServer {
    addr: SocketAddr,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl TestServer {
    fn start(allowed: &str, idle_timeout: Duration) -> Self {
        let config = ServerConfig {
            listen_address: LOCALHOST.to_string(),
            port: 0,
            allowed: allowed.to_string(),
            idle_timeout,
            io_timeout: Duration::from_secs(5),
            ..Default::default()
        };
        let mut server = Server::bind(config).unwrap();
        let addr = server.local_addr().unwrap();
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let handle = thread::spawn(move || server.run_until(&flag).unwrap());
        Self {
            addr,
            stop,
            handle: Some(handle),
        }
    }

    fn new() -> Self {
        Self::start(LOCALHOST, Duration::from_secs(25))
    }

    fn client_config(&self) -> ClientConfig {
        ClientConfig {
            port: self.addr.port(),
            io_timeout: Duration::from_secs(5),
            ..Default::default()
        }
    }

    fn backend(&self) -> RemoteBackend {
        RemoteBackend::connect(self.ip(), self.client_config()).unwrap()
    }

    fn ip(&self) -> IpAddr {
        self.addr.ip()
    }

    fn raw(&self) -> TcpStream {
        let stream = TcpStream::connect(self.addr).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        stream
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn scratch() -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = fs::canonicalize(dir.path()).unwrap();
    (dir, path)
}

fn no_ext() -> &'static OsStr {
    OsStr::new("")
}

/// Endless zeros, counting what was taken.
struct CountingZeros {
    taken: u64,
}

impl Read for CountingZeros {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        buf.fill(0);
        self.taken += buf.len() as u64;
        Ok(buf.len())
    }
}

#[test]
fn test_home_dir_fetched_on_connect() {
    let server = TestServer::new();
    let backend = server.backend();
    assert!(backend.home_dir().has_root());
}

#[test]
fn test_listdir_files_only_with_filter() {
    let server = TestServer::new();
    let (_guard, dir) = scratch();
    fs::write(dir.join("a.txt"), b"a").unwrap();
    fs::write(dir.join("b.txt"), b"bb").unwrap();
    fs::write(dir.join("c.log"), b"c").unwrap();
    fs::create_dir(dir.join("sub.txt")).unwrap();

    let mut backend = server.backend();
    let listing = backend
        .list_dir(&dir, ListOptions::FILES_ONLY, OsStr::new("*.txt"))
        .unwrap();
    let names: Vec<&OsStr> = listing.iter().map(|e| e.name.as_os_str()).collect();
    assert_eq!(names, ["a.txt", "b.txt"]);
    assert_eq!(listing.find("b.txt").unwrap().stat.size, 2);

    let dirs = backend
        .list_dir(&dir, ListOptions::DIRECTORIES_ONLY, OsStr::new(""))
        .unwrap();
    let names: Vec<&OsStr> = dirs.iter().map(|e| e.name.as_os_str()).collect();
    assert_eq!(names, ["..", "sub.txt"]);
}

#[test]
fn test_non_utf8_names_round_trip() {
    let server = TestServer::new();
    let (_guard, dir) = scratch();
    let name = OsStr::from_bytes(b"caf\xe9.txt");
    fs::write(dir.join(name), b"latin-1").unwrap();

    let mut backend = server.backend();
    let listing = backend
        .list_dir(&dir, ListOptions::FILES_ONLY, OsStr::new(""))
        .unwrap();
    assert_eq!(listing.len(), 1);
    let entry = &listing.entries()[0];
    assert_eq!(entry.name.as_bytes(), b"caf\xe9.txt");

    let path = dir.join(&entry.name);
    let mut body = Vec::new();
    assert_eq!(backend.read_file(&path, &mut body).unwrap(), 7);
    assert_eq!(body, b"latin-1");
    assert!(backend.stat(&path, false).unwrap().stat.is_regular());
    assert_eq!(backend.realpathize(&path, Path::new("/")).unwrap(), path);
}

#[test]
fn test_write_then_read_large_file() {
    let server = TestServer::new();
    let (_guard, dir) = scratch();
    let path = dir.join("big.bin");
    let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();

    let mut backend = server.backend();
    let stat = backend
        .write_file(
            &path,
            data.len() as u64,
            OverwriteMode::Quick,
            0o600,
            no_ext(),
            &mut data.as_slice(),
        )
        .unwrap();
    assert_eq!(stat.size, data.len() as u64);
    assert_eq!(stat.permissions(), 0o600);

    let mut back = Vec::new();
    let n = backend.read_file(&path, &mut back).unwrap();
    assert_eq!(n, data.len() as u64);
    assert_eq!(back, data);
}

#[test]
fn test_backup_mode_keeps_old_contents() {
    let server = TestServer::new();
    let (_guard, dir) = scratch();
    let path = dir.join("notes");
    fs::write(&path, b"first").unwrap();

    let mut backend = server.backend();
    backend
        .write_file(&path, 6, OverwriteMode::Backup, 0o644, OsStr::new("~"), &mut &b"second"[..])
        .unwrap();
    assert_eq!(fs::read(&path).unwrap(), b"second");
    assert_eq!(fs::read(dir.join("notes~")).unwrap(), b"first");
}

#[test]
fn test_aborted_safe_write_leaves_original() {
    let server = TestServer::new();
    let (_guard, dir) = scratch();
    let path = dir.join("precious.txt");
    fs::write(&path, b"original contents").unwrap();

    let mut backend = server.backend();
    let short = vec![b'x'; 1000];
    let err = backend
        .write_file(&path, 5000, OverwriteMode::Safe, 0o644, no_ext(), &mut short.as_slice())
        .unwrap_err();
    assert!(err.to_string().contains("Ran out of data to write"));

    // The server is single threaded: once this answers, the aborted upload
    // has been cleaned up.
    let mut other = server.backend();
    other.stat(&dir, false).unwrap();

    assert_eq!(fs::read(&path).unwrap(), b"original contents");
    let names: Vec<_> = fs::read_dir(&dir)
        .unwrap()
        .map(|e| e.unwrap().file_name())
        .collect();
    assert_eq!(names, ["precious.txt"]);
}

#[test]
fn test_server_stops_upload_it_cannot_store() {
    let server = TestServer::new();
    let (_guard, dir) = scratch();
    let len = 50 << 20;

    let mut backend = server.backend();
    let mut source = CountingZeros { taken: 0 };
    let err = backend
        .write_file(
            &dir.join("missing/x"),
            len,
            OverwriteMode::Safe,
            0o644,
            no_ext(),
            &mut source,
        )
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::ENOENT);
    assert!(source.taken < len, "whole body was sent: {}", source.taken);

    // same backend, fresh connection
    assert_eq!(backend.get_home_dir().unwrap(), backend.home_dir());
    assert!(!dir.join("missing").exists());
}

#[test]
fn test_readfile_missing_keeps_connection_usable() {
    let server = TestServer::new();
    let (_guard, dir) = scratch();
    let mut backend = server.backend();

    let mut sink = Vec::new();
    let err = backend.read_file(&dir.join("nope"), &mut sink).unwrap_err();
    assert_eq!(err.code(), ErrorCode::ENOENT);
    assert!(sink.is_empty());

    let report = backend.stat(&dir.join("nope"), true).unwrap();
    assert!(report.just_not_there);
    assert_eq!(report.error_code, ErrorCode::ENOENT);
}

#[test]
fn test_check_access_and_paths() {
    let server = TestServer::new();
    let (_guard, dir) = scratch();
    fs::write(dir.join("small"), b"12345").unwrap();
    let mut backend = server.backend();

    let stat = backend
        .check_ordinary_file_access(&dir.join("small"), 100)
        .unwrap();
    assert!(stat.is_regular());

    let err = backend.check_ordinary_file_access(&dir, 100).unwrap_err();
    assert_eq!(err.code(), ErrorCode::OTHER_ERROR);
    assert!(err.to_string().contains("Not an ordinary file"));

    let resolved = backend
        .realpathize(&dir.join("./x/../small"), Path::new("/"))
        .unwrap();
    assert_eq!(resolved, dir.join("small"));

    let home = backend.home_dir().to_path_buf();
    assert_eq!(
        backend.realpathize(Path::new("~"), &home).unwrap(),
        backend.realpathize(&home, Path::new("/")).unwrap()
    );
}

#[test]
fn test_unknown_action_answered_not_implemented() {
    let server = TestServer::new();
    let mut stream = server.raw();

    let header = MessageHeader {
        magic: MAGIC,
        version: VERSION,
        action: 42,
        payload_len: 0,
    };
    stream.write_all(&header.encode()).unwrap();
    let mut ack = [0u8; ACK_SIZE];
    stream.read_exact(&mut ack).unwrap();
    assert_eq!(Ack::decode(&ack).code, ErrorCode::SUCCESS);

    let mut raw = [0u8; HEADER_SIZE];
    stream.read_exact(&mut raw).unwrap();
    let reply = MessageHeader::decode(&raw);
    assert_eq!(reply.action, Action::NotImplemented as u16);
    let mut payload = vec![0u8; reply.payload_len as usize];
    stream.read_exact(&mut payload).unwrap();
    match read_status(&mut Decoder::new(&payload)) {
        Err(Error::Op { code, message, .. }) => {
            assert_eq!(code, ErrorCode::UNIMPLEMENTED_FUNCTION);
            assert_eq!(message, "Unimplemented function");
        }
        other => panic!("unexpected {other:?}"),
    }

    // same connection still serves real requests
    stream
        .write_all(&MessageHeader::new(Action::GetHomeDir, 0).encode())
        .unwrap();
    stream.read_exact(&mut ack).unwrap();
    stream.read_exact(&mut raw).unwrap();
    assert_eq!(MessageHeader::decode(&raw).action, Action::GetHomeDir as u16);
}

#[test]
fn test_session_reports_not_implemented() {
    let server = TestServer::new();
    let mut session = ClientSession::new(server.ip(), server.client_config());
    let err = session.request(Action::NotImplemented, &[]).unwrap_err();
    assert!(matches!(err, Error::NotImplemented));
    assert!(session.request(Action::GetHomeDir, &[]).is_ok());
}

#[test]
fn test_idle_client_gets_one_ack_then_eof() {
    let server = TestServer::start(LOCALHOST, Duration::from_millis(200));
    let mut stream = server.raw();

    let mut ack = [0u8; ACK_SIZE];
    stream.read_exact(&mut ack).unwrap();
    assert_eq!(Ack::decode(&ack).code, ErrorCode::SERVER_CLOSED_IDLE_CLIENT);

    let mut rest = [0u8; 1];
    assert!(matches!(stream.read(&mut rest), Ok(0) | Err(_)));
}

#[test]
fn test_client_resends_after_idle_close() {
    let server = TestServer::start(LOCALHOST, Duration::from_millis(200));
    let mut backend = server.backend();
    thread::sleep(Duration::from_millis(1500));
    let home = backend.get_home_dir().unwrap();
    assert_eq!(home, backend.home_dir());
}

#[test]
fn test_out_of_range_client_is_dropped() {
    let server = TestServer::start("10.1.2.3", Duration::from_secs(25));
    let mut stream = server.raw();
    let _ = stream.write_all(&MessageHeader::new(Action::GetHomeDir, 0).encode());
    let mut buf = [0u8; ACK_SIZE];
    assert!(matches!(stream.read(&mut buf), Ok(0) | Err(_)));
}

#[test]
fn test_bad_magic_closes_connection() {
    let server = TestServer::new();
    let mut stream = server.raw();
    stream.write_all(&[0u8; HEADER_SIZE]).unwrap();
    let mut buf = [0u8; ACK_SIZE];
    assert!(matches!(stream.read(&mut buf), Ok(0) | Err(_)));
}

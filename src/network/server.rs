//! Request server with event-driven I/O
//!
//! One thread, one `mio::Poll` over the listener and every client. A
//! readable client runs exactly one request cycle to completion before
//! the next one is looked at, so no per-connection locking is needed:
//!
//! ```text
//! header ──> ack(0) ──> payload ──> dispatch ──> header + response
//! ```
//!
//! Readiness is edge-triggered, so a client whose buffer still holds a
//! pipelined request is kept in `pending` and serviced without waiting
//! for a new edge.

use std::collections::{HashMap, HashSet};
use std::ffi::OsStr;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token};
use tracing::{debug, info, warn};

use super::connection::{Connection, Fill};
use super::iprange::IpRangeList;
use crate::config::ServerConfig;
use crate::error::{Error, ErrorCode, Result};
use crate::fsops;
use crate::protocol::message::put_u48;
use crate::protocol::payload::{encode_error, encode_error_parts};
use crate::protocol::{
    Ack, Action, Decoder, Encoder, MessageHeader, OverwriteMode, Request, Response, HEADER_SIZE,
    READER_CHUNK,
};

const SERVER_TOKEN: Token = Token(0);
const IDLE_ACK_TIMEOUT: Duration = Duration::from_millis(100);

/// What to do with a client once its current cycle is over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kill {
    None,
    /// The response told the client to hang up; drain its input until it does.
    Soft,
    /// Close now.
    Hard,
}

pub struct ClientSlot {
    id: u64,
    conn: Connection,
    peer: SocketAddr,
    last_accessed: Instant,
    kill: Kill,
    discard: u64,
}

/// Encoded response plus whether the action failed badly enough that the
/// connection cannot be trusted afterwards.
struct Reply {
    payload: Vec<u8>,
    failed: bool,
}

fn respond(result: Result<Response>) -> Reply {
    let mut enc = Encoder::new();
    let failed = match result {
        Ok(response) => {
            response.encode(&mut enc);
            false
        }
        Err(e) => {
            encode_error(&mut enc, &e);
            e.force_shutdown()
        }
    };
    Reply {
        payload: enc.into_bytes(),
        failed,
    }
}

pub struct Server {
    poll: Poll,
    events: Events,
    listener: TcpListener,
    allowed: IpRangeList,
    config: ServerConfig,
    clients: HashMap<Token, ClientSlot>,
    pending: HashSet<Token>,
    next_token: usize,
    client_count: u64,
}

impl Server {
    pub fn bind(config: ServerConfig) -> Result<Self> {
        let allowed: IpRangeList = config.allowed.parse()?;
        let ip: IpAddr = config
            .listen_address
            .parse()
            .map_err(|_| Error::InvalidAddress(config.listen_address.clone()))?;

        let poll = Poll::new()?;
        let mut listener = TcpListener::bind(SocketAddr::new(ip, config.port))?;
        poll.registry()
            .register(&mut listener, SERVER_TOKEN, Interest::READABLE)?;

        info!(address = %listener.local_addr()?, allowed = %allowed, "listening");

        Ok(Self {
            poll,
            events: Events::with_capacity(config.events_capacity),
            listener,
            allowed,
            config,
            clients: HashMap::new(),
            pending: HashSet::new(),
            next_token: 1,
            client_count: 0,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Connected clients, including ones about to be removed.
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn run(&mut self) -> Result<()> {
        loop {
            self.run_once()?;
        }
    }

    /// Serve until `stop` is set; checked at least once a second.
    pub fn run_until(&mut self, stop: &AtomicBool) -> Result<()> {
        while !stop.load(Ordering::Relaxed) {
            self.run_once()?;
        }
        Ok(())
    }

    pub fn run_once(&mut self) -> Result<()> {
        // === PHASE 1: Wait for readiness ===
        let timeout = if self.pending.is_empty() {
            Duration::from_secs(1)
        } else {
            Duration::ZERO
        };
        if let Err(e) = self.poll.poll(&mut self.events, Some(timeout)) {
            if e.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(e.into());
        }

        let mut accept = false;
        let mut ready: Vec<Token> = self.pending.drain().collect();
        for event in self.events.iter() {
            match event.token() {
                SERVER_TOKEN => accept = true,
                token => ready.push(token),
            }
        }
        ready.sort_unstable();
        ready.dedup();

        // === PHASE 2: Accept new clients ===
        if accept {
            self.accept_clients();
        }

        // === PHASE 3: One request cycle per ready client ===
        for token in ready {
            self.service(token);
        }

        // === PHASE 4: Evict idle and dead clients ===
        self.reap();
        Ok(())
    }

    fn accept_clients(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((mut stream, addr)) => {
                    if !self.allowed.contains(addr.ip()) {
                        info!("incoming address {} not in range {}", addr.ip(), self.allowed);
                        let _ = stream.shutdown(std::net::Shutdown::Both);
                        continue;
                    }
                    let token = Token(self.next_token);
                    self.next_token += 1;
                    if let Err(e) = self
                        .poll
                        .registry()
                        .register(&mut stream, token, Interest::READABLE)
                    {
                        warn!(peer = %addr, error = %e, "register failed");
                        continue;
                    }
                    let conn = match Connection::new(stream) {
                        Ok(conn) => conn,
                        Err(e) => {
                            warn!(peer = %addr, error = %e, "setsockopt TCP_NODELAY failed");
                            continue;
                        }
                    };
                    self.client_count += 1;
                    let id = self.client_count;
                    info!(client = id, peer = %addr, "connection established");
                    self.clients.insert(
                        token,
                        ClientSlot {
                            id,
                            conn,
                            peer: addr,
                            last_accessed: Instant::now(),
                            kill: Kill::None,
                            discard: 0,
                        },
                    );
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    break;
                }
            }
        }
    }

    fn service(&mut self, token: Token) {
        let Some(slot) = self.clients.get_mut(&token) else {
            return;
        };

        if slot.kill != Kill::None {
            drain(slot);
            return;
        }

        match slot.conn.try_fill() {
            Ok(Fill::Eof) if !slot.conn.has_buffered() => {
                debug!(client = slot.id, "client closed connection");
                slot.kill = Kill::Hard;
                return;
            }
            Err(e) => {
                debug!(client = slot.id, error = %e, "read failed");
                slot.kill = Kill::Hard;
                return;
            }
            _ => {}
        }
        if !slot.conn.has_buffered() {
            return;
        }

        process_client(slot, &self.config);
        slot.last_accessed = Instant::now();

        match slot.kill {
            Kill::None => {
                match slot.conn.try_fill() {
                    Ok(Fill::Eof) if !slot.conn.has_buffered() => slot.kill = Kill::Hard,
                    Err(_) => slot.kill = Kill::Hard,
                    _ => {}
                }
                if slot.conn.has_buffered() {
                    self.pending.insert(token);
                }
            }
            Kill::Soft => {
                self.pending.insert(token);
            }
            Kill::Hard => {}
        }
    }

    fn reap(&mut self) {
        let now = Instant::now();
        let idle_timeout = self.config.idle_timeout;
        for slot in self.clients.values_mut() {
            if slot.kill != Kill::Hard && now.duration_since(slot.last_accessed) > idle_timeout {
                let ack = Ack::new(ErrorCode::SERVER_CLOSED_IDLE_CLIENT).encode();
                let _ = slot.conn.write_all_timeout(&ack, IDLE_ACK_TIMEOUT);
                info!(client = slot.id, peer = %slot.peer, "closing idle client");
                slot.kill = Kill::Hard;
            }
        }

        let dead: Vec<Token> = self
            .clients
            .iter()
            .filter(|(_, slot)| slot.kill == Kill::Hard)
            .map(|(token, _)| *token)
            .collect();
        for token in dead {
            self.pending.remove(&token);
            let Some(mut slot) = self.clients.remove(&token) else {
                continue;
            };
            let _ = self.poll.registry().deregister(slot.conn.stream_mut());
            slot.conn.shutdown();
            if slot.discard > 0 {
                info!("removing {}, discarding {} bytes", slot.id, slot.discard);
            } else {
                info!("removing {}", slot.id);
            }
        }
    }
}

/// Read and discard whatever a killed client sends, until it hangs up.
fn drain(slot: &mut ClientSlot) {
    loop {
        let fill = slot.conn.try_fill();
        slot.discard += slot.conn.discard_buffered() as u64;
        match fill {
            Ok(Fill::Full) => continue,
            Ok(Fill::Drained) => return,
            Ok(Fill::Eof) | Err(_) => {
                slot.kill = Kill::Hard;
                return;
            }
        }
    }
}

/// One full request cycle. Sets `slot.kill` on failure.
fn process_client(slot: &mut ClientSlot, config: &ServerConfig) {
    let io_timeout = config.io_timeout;
    let id = slot.id;

    let mut raw = [0u8; HEADER_SIZE];
    if let Err(e) = slot.conn.read_exact_timeout(&mut raw, io_timeout) {
        warn!(client = id, error = %e, "reading header");
        slot.kill = Kill::Hard;
        return;
    }
    let header = MessageHeader::decode(&raw);
    if !header.is_valid() {
        warn!(client = id, magic = header.magic, "bad magic");
        slot.kill = Kill::Hard;
        return;
    }
    if header.payload_len > config.max_message_len {
        warn!(client = id, len = header.payload_len, "message too long");
        slot.kill = Kill::Hard;
        return;
    }

    // Ack before any real work so the client can time out quickly on a
    // dead connection however slow the filesystem is.
    if let Err(e) = slot
        .conn
        .write_all_timeout(&Ack::new(ErrorCode::SUCCESS).encode(), io_timeout)
    {
        warn!(client = id, error = %e, "writing ack");
        slot.kill = Kill::Hard;
        return;
    }

    let mut payload = vec![0u8; header.payload_len as usize];
    if let Err(e) = slot.conn.read_exact_timeout(&mut payload, io_timeout) {
        warn!(client = id, error = %e, "reading request");
        slot.kill = Kill::Hard;
        return;
    }

    let action = header.action().filter(|a| *a != Action::NotImplemented);
    match action {
        Some(action) => info!(client = id, ?action, "request"),
        None => info!(client = id, action = header.action, "unimplemented action"),
    }

    let reply = match dispatch(&mut slot.conn, action, &payload, io_timeout) {
        Ok(reply) => reply,
        Err(e) => {
            warn!(client = id, error = %e, "executing action");
            slot.kill = Kill::Hard;
            return;
        }
    };
    if reply.failed {
        warn!(client = id, ?action, "action failed, client must reconnect");
        slot.kill = Kill::Soft;
    }

    let header = MessageHeader::new(action.unwrap_or(Action::NotImplemented), reply.payload.len());
    let written = slot
        .conn
        .write_all_timeout(&header.encode(), io_timeout)
        .and_then(|()| slot.conn.write_all_timeout(&reply.payload, io_timeout));
    if let Err(e) = written {
        warn!(client = id, error = %e, "writing response");
        slot.kill = Kill::Hard;
    }
}

/// Run one request. `Err` means nothing can be sent back.
fn dispatch(
    conn: &mut Connection,
    action: Option<Action>,
    payload: &[u8],
    io_timeout: Duration,
) -> Result<Reply> {
    let Some(action) = action else {
        let mut enc = Encoder::new();
        encode_error_parts(
            &mut enc,
            ErrorCode::UNIMPLEMENTED_FUNCTION,
            "Unimplemented function",
            false,
        );
        return Ok(Reply {
            payload: enc.into_bytes(),
            failed: false,
        });
    };

    let reply = match Request::decode(action, &mut Decoder::new(payload))? {
        Request::ReadDir {
            dir,
            options,
            filter,
        } => respond(fsops::list_dir(&dir, options, &filter).map(Response::Listing)),
        Request::ReadFile { path } => send_file(conn, &path, io_timeout)?,
        Request::WriteFile {
            path,
            len,
            mode,
            permissions,
            backup_ext,
        } => receive_file(conn, &path, len, mode, permissions, &backup_ext, io_timeout)?,
        Request::CheckOrdinaryFileAccess { path, size_limit } => {
            respond(fsops::check_ordinary_file_access(&path, size_limit).map(Response::Stat))
        }
        Request::Stat {
            path,
            tolerate_missing,
        } => respond(fsops::stat(&path, tolerate_missing).map(Response::StatReport)),
        Request::Chdir { dir } => respond(fsops::chdir(&dir).map(Response::Path)),
        Request::Realpathize { path, homedir } => {
            respond(fsops::realpathize(&path, &homedir).map(Response::Path))
        }
        Request::GetHomeDir => respond(fsops::get_home_dir().map(Response::Path)),
    };
    Ok(reply)
}

/// Stream a file body ahead of the response: a 6-byte length, then
/// exactly that many bytes. A file that cannot be opened streams as empty
/// and one that shrinks is padded, so the client never loses its place.
fn send_file(conn: &mut Connection, path: &Path, io_timeout: Duration) -> Result<Reply> {
    let (mut file, mut failure) = match fsops::FileReader::open(path) {
        Ok(file) => (Some(file), None),
        Err(e) => (None, Some(e)),
    };
    let len = file.as_ref().map_or(0, |f| f.len());

    let mut prefix = [0u8; 6];
    put_u48(&mut prefix, len);
    conn.write_all_timeout(&prefix, io_timeout)?;

    let mut chunk = vec![0u8; READER_CHUNK];
    let mut progress = 0u64;
    while progress < len {
        let want = (len - progress).min(READER_CHUNK as u64) as usize;
        let n = match file.as_mut().filter(|_| failure.is_none()) {
            Some(f) => match f.read_chunk(&mut chunk[..want]) {
                Ok(n) => n,
                Err(e) => {
                    failure = Some(e);
                    chunk[..want].fill(0);
                    want
                }
            },
            None => {
                chunk[..want].fill(0);
                want
            }
        };
        conn.write_all_timeout(&chunk[..n], io_timeout)?;
        progress += n as u64;
    }

    Ok(respond(match failure {
        Some(e) => Err(e),
        None => Ok(Response::Done),
    }))
}

/// Consume an uploaded body into the filesystem, then send the
/// intermediate ack that tells the client whether to keep going.
fn receive_file(
    conn: &mut Connection,
    path: &Path,
    len: u64,
    mode: OverwriteMode,
    permissions: u64,
    backup_ext: &OsStr,
    io_timeout: Duration,
) -> Result<Reply> {
    let mut body = conn.body(len, io_timeout);
    let result = fsops::write_file(path, len, mode, permissions, backup_ext, &mut body);
    let unread = body.remaining();

    let code = if result.is_ok() {
        ErrorCode::SUCCESS
    } else {
        ErrorCode::EARLY_TERMINATE_FROM_WRITE_FILE
    };
    conn.write_all_timeout(&Ack::new(code).encode(), io_timeout)?;

    let mut reply = respond(result.map(Response::Stat));
    reply.failed |= unread > 0;
    Ok(reply)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(allowed: &str) -> ServerConfig {
        ServerConfig {
            listen_address: "127.0.0.1".to_string(),
            port: 0,
            allowed: allowed.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_bind_ephemeral_port() {
        let server = Server::bind(config("127.0.0.1")).unwrap();
        assert_ne!(server.local_addr().unwrap().port(), 0);
        assert_eq!(server.client_count(), 0);
    }

    #[test]
    fn test_bind_rejects_bad_arguments() {
        assert!(matches!(
            Server::bind(config("bogus")),
            Err(Error::InvalidRange(_))
        ));
        let mut bad = config("127.0.0.1");
        bad.listen_address = "nowhere".to_string();
        assert!(matches!(Server::bind(bad), Err(Error::InvalidAddress(_))));
    }

    #[test]
    fn test_unimplemented_reply() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let _peer = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (stream, _) = listener.accept().unwrap();
        stream.set_nonblocking(true).unwrap();
        let mut conn = Connection::new(mio::net::TcpStream::from_std(stream)).unwrap();

        let reply = dispatch(&mut conn, None, &[], Duration::from_secs(1)).unwrap();
        assert!(!reply.failed);
        match crate::protocol::payload::read_status(&mut Decoder::new(&reply.payload)) {
            Err(e) => assert_eq!(e.code(), ErrorCode::UNIMPLEMENTED_FUNCTION),
            Ok(()) => panic!("expected an error response"),
        }
    }
}

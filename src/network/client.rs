//! Client session
//!
//! State machine:
//! ```text
//! Disconnected --connect--> Connecting --writable--> Connected --I/O error--> Disconnected
//!                               |                      |   ^
//!                       refused |        no ack / idle |   | reconnected
//!                               v                      v   |
//!                             Failed <--out of retries-- Reconnecting
//! ```
//!
//! A request whose header goes unanswered (timeout, hangup, or an ack
//! saying the server dropped us for idleness) is resent on a fresh
//! connection from `Reconnecting`, at most `max_retries` times. A failed
//! connect or an exhausted resend budget leaves the session `Failed`; the
//! next request starts over from there just as from `Disconnected`.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::os::unix::io::AsRawFd;
use std::time::Instant;

use mio::net::TcpStream;
use tracing::{debug, warn};

use super::connection::{Connection, Fill};
use super::{wait_fd, Interest};
use crate::config::ClientConfig;
use crate::error::{Error, ErrorCode, Result};
use crate::protocol::payload::read_status;
use crate::protocol::{Ack, Action, DecodeError, Decoder, MessageHeader, ACK_SIZE, HEADER_SIZE};

/// Largest response this client will allocate for.
const MAX_RESPONSE_LEN: u64 = 1 << 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    /// Resending a request on a fresh connection.
    Reconnecting,
    Failed,
}

fn transport_error(e: io::Error, what: &'static str) -> Error {
    match e.kind() {
        io::ErrorKind::TimedOut => Error::Timeout(what),
        io::ErrorKind::UnexpectedEof
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::NotConnected => Error::HangUp,
        _ => Error::Io(e),
    }
}

pub struct ClientSession {
    addr: SocketAddr,
    config: ClientConfig,
    conn: Option<Connection>,
    state: SessionState,
}

impl ClientSession {
    pub fn new(ip: IpAddr, config: ClientConfig) -> Self {
        Self {
            addr: SocketAddr::new(ip, config.port),
            config,
            conn: None,
            state: SessionState::Disconnected,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    fn close(&mut self) {
        if let Some(conn) = self.conn.take() {
            debug!(peer = %self.addr, "closing connection");
            conn.shutdown();
        }
    }

    pub fn disconnect(&mut self) {
        self.close();
        self.state = SessionState::Disconnected;
    }

    /// Non-blocking connect, polled until writable or `connect_timeout`.
    pub fn connect(&mut self) -> Result<()> {
        self.close();
        if self.state != SessionState::Reconnecting {
            self.state = SessionState::Connecting;
        }
        match self.open() {
            Ok(conn) => {
                debug!(peer = %self.addr, "connected");
                self.conn = Some(conn);
                self.state = SessionState::Connected;
                Ok(())
            }
            Err(e) => {
                warn!(peer = %self.addr, error = %e, "connect failed");
                self.state = SessionState::Failed;
                Err(e)
            }
        }
    }

    /// Drop the connection ahead of a resend, or give up once `retries`
    /// has used the whole budget.
    fn begin_resend(&mut self, retries: &mut u32) -> bool {
        self.close();
        if *retries < self.config.max_retries {
            *retries += 1;
            self.state = SessionState::Reconnecting;
            true
        } else {
            self.state = SessionState::Failed;
            false
        }
    }

    fn open(&self) -> Result<Connection> {
        let stream = TcpStream::connect(self.addr)?;
        let deadline = Instant::now() + self.config.connect_timeout;
        loop {
            let left = deadline
                .checked_duration_since(Instant::now())
                .filter(|d| !d.is_zero())
                .ok_or(Error::Timeout("connect"))?;
            if !wait_fd(stream.as_raw_fd(), Interest::Write, left)? {
                continue;
            }
            if let Some(e) = stream.take_error()? {
                return Err(Error::Io(e));
            }
            match stream.peer_addr() {
                Ok(_) => break,
                Err(e) if e.kind() == io::ErrorKind::NotConnected => continue,
                Err(e) => return Err(Error::Io(e)),
            }
        }
        Ok(Connection::new(stream)?)
    }

    fn conn(&mut self) -> Result<&mut Connection> {
        self.conn.as_mut().ok_or(Error::HangUp)
    }

    /// Write the header and wait for its ack.
    fn exchange_header(&mut self, header: &[u8; HEADER_SIZE]) -> io::Result<Ack> {
        let conn = self
            .conn
            .as_mut()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;
        conn.write_all_timeout(header, self.config.io_timeout)?;
        let mut raw = [0u8; ACK_SIZE];
        conn.read_exact_timeout(&mut raw, self.config.ack_timeout)?;
        Ok(Ack::decode(&raw))
    }

    /// Send one request. Reconnects as needed and resends the header when
    /// the ack does not arrive or says the server dropped us as idle.
    pub fn send_message(&mut self, action: Action, payload: &[u8]) -> Result<()> {
        let header = MessageHeader::new(action, payload.len()).encode();
        let mut retries = 0;
        loop {
            if self.conn.is_none() {
                self.connect()?;
            }
            let ack = match self.exchange_header(&header) {
                Ok(ack) => ack,
                Err(e) => {
                    if self.begin_resend(&mut retries) {
                        debug!(peer = %self.addr, ?action, error = %e, retries, "no ack, resending");
                        continue;
                    }
                    return Err(transport_error(e, "ack"));
                }
            };
            if ack.code == ErrorCode::SERVER_CLOSED_IDLE_CLIENT {
                if self.begin_resend(&mut retries) {
                    debug!(peer = %self.addr, ?action, retries, "server closed idle connection, resending");
                    continue;
                }
                return Err(Error::op(ack.code, ack.code.describe()));
            }
            if !ack.code.is_success() {
                self.disconnect();
                return Err(Error::op(ack.code, ack.code.describe()));
            }
            if !payload.is_empty() {
                self.write_all(payload)?;
            }
            return Ok(());
        }
    }

    /// Read a response to `action`. The payload is returned still wrapped
    /// in its status word.
    pub fn recv_message(&mut self, action: Action) -> Result<Vec<u8>> {
        let mut raw = [0u8; HEADER_SIZE];
        self.read_exact(&mut raw)?;
        let header = MessageHeader::decode(&raw);
        if !header.is_valid() {
            self.disconnect();
            return Err(Error::Protocol(format!(
                "invalid magic response from {}",
                self.addr.ip()
            )));
        }
        if header.action != Action::NotImplemented as u16 && header.action != action as u16 {
            self.disconnect();
            return Err(Error::Protocol(format!(
                "invalid action response {} from {}",
                header.action,
                self.addr.ip()
            )));
        }
        if header.payload_len > MAX_RESPONSE_LEN {
            self.disconnect();
            return Err(Error::Protocol(format!(
                "response of {} bytes from {}",
                header.payload_len,
                self.addr.ip()
            )));
        }
        let mut payload = vec![0u8; header.payload_len as usize];
        self.read_exact(&mut payload)?;
        if header.action == Action::NotImplemented as u16 {
            return Err(Error::NotImplemented);
        }
        Ok(payload)
    }

    /// Unwrap a response payload. Error responses carrying force_shutdown
    /// and malformed payloads drop the connection.
    pub fn decode_response<T>(
        &mut self,
        payload: &[u8],
        decode: impl FnOnce(&mut Decoder<'_>) -> std::result::Result<T, DecodeError>,
    ) -> Result<T> {
        let mut dec = Decoder::new(payload);
        let result = read_status(&mut dec).and_then(|()| decode(&mut dec).map_err(Error::from));
        if let Err(e) = &result {
            if e.force_shutdown() || matches!(e, Error::Decode(_)) {
                self.disconnect();
            }
        }
        result
    }

    /// One request/response round trip.
    pub fn request(&mut self, action: Action, payload: &[u8]) -> Result<Vec<u8>> {
        self.send_message(action, payload)?;
        self.recv_message(action)
    }

    /// Block for the intermediate ack of a streamed upload.
    pub fn recv_ack(&mut self) -> Result<Ack> {
        let mut raw = [0u8; ACK_SIZE];
        self.read_exact(&mut raw)?;
        Ok(Ack::decode(&raw))
    }

    /// Return an ack if one has fully arrived, without blocking.
    pub fn maybe_see_ack(&mut self) -> Result<Option<Ack>> {
        let conn = self.conn()?;
        let fill = match conn.try_fill() {
            Ok(fill) => fill,
            Err(e) => {
                self.disconnect();
                return Err(Error::Io(e));
            }
        };
        let conn = self.conn()?;
        if conn.buffered() >= ACK_SIZE {
            return self.recv_ack().map(Some);
        }
        if fill == Fill::Eof {
            self.disconnect();
            return Err(Error::HangUp);
        }
        Ok(None)
    }

    pub fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        let timeout = self.config.io_timeout;
        let r = self.conn()?.read_exact_timeout(buf, timeout);
        r.map_err(|e| {
            self.disconnect();
            transport_error(e, "response")
        })
    }

    pub fn write_all(&mut self, data: &[u8]) -> Result<()> {
        let timeout = self.config.io_timeout;
        let r = self.conn()?.write_all_timeout(data, timeout);
        r.map_err(|e| {
            self.disconnect();
            transport_error(e, "write")
        })
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread;
    use std::time::Duration;

    fn config(port: u16) -> ClientConfig {
        ClientConfig {
            port,
            ack_timeout: Duration::from_millis(200),
            io_timeout: Duration::from_secs(5),
            ..Default::default()
        }
    }

    #[test]
    fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let mut session = ClientSession::new("127.0.0.1".parse().unwrap(), config(port));
        assert!(session.connect().is_err());
        assert_eq!(session.state(), SessionState::Failed);
    }

    #[test]
    fn test_retries_are_bounded() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        // answers every header with an idle-close ack
        let server = thread::spawn(move || {
            let mut served = 0;
            for stream in listener.incoming().take(4) {
                let mut stream = stream.unwrap();
                let mut header = [0u8; HEADER_SIZE];
                stream.read_exact(&mut header).unwrap();
                stream
                    .write_all(&Ack::new(ErrorCode::SERVER_CLOSED_IDLE_CLIENT).encode())
                    .unwrap();
                served += 1;
            }
            served
        });

        let mut session = ClientSession::new("127.0.0.1".parse().unwrap(), config(port));
        let err = session.send_message(Action::GetHomeDir, &[]).unwrap_err();
        assert_eq!(err.code(), ErrorCode::SERVER_CLOSED_IDLE_CLIENT);
        assert_eq!(session.state(), SessionState::Failed);
        assert_eq!(server.join().unwrap(), 4);
    }

    #[test]
    fn test_resend_recovers_after_idle_ack() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        // drops the first connection as idle, acks the second
        let server = thread::spawn(move || {
            let mut streams = Vec::new();
            for (i, stream) in listener.incoming().take(2).enumerate() {
                let mut stream = stream.unwrap();
                let mut header = [0u8; HEADER_SIZE];
                stream.read_exact(&mut header).unwrap();
                let code = if i == 0 {
                    ErrorCode::SERVER_CLOSED_IDLE_CLIENT
                } else {
                    ErrorCode::SUCCESS
                };
                stream.write_all(&Ack::new(code).encode()).unwrap();
                streams.push(stream);
            }
            streams.len()
        });

        let mut session = ClientSession::new("127.0.0.1".parse().unwrap(), config(port));
        session.send_message(Action::GetHomeDir, &[]).unwrap();
        assert_eq!(session.state(), SessionState::Connected);
        assert_eq!(server.join().unwrap(), 2);
    }

    #[test]
    fn test_failed_reconnect_leaves_session_failed() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        // one idle ack, then nobody is listening
        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut header = [0u8; HEADER_SIZE];
            stream.read_exact(&mut header).unwrap();
            stream
                .write_all(&Ack::new(ErrorCode::SERVER_CLOSED_IDLE_CLIENT).encode())
                .unwrap();
        });

        let mut session = ClientSession::new("127.0.0.1".parse().unwrap(), config(port));
        assert!(session.send_message(Action::GetHomeDir, &[]).is_err());
        assert_eq!(session.state(), SessionState::Failed);
        server.join().unwrap();
    }

    #[test]
    fn test_bad_magic_drops_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut header = [0u8; HEADER_SIZE];
            stream.read_exact(&mut header).unwrap();
            stream.write_all(&Ack::new(ErrorCode::SUCCESS).encode()).unwrap();
            stream.write_all(&[0xffu8; HEADER_SIZE]).unwrap();
        });

        let mut session = ClientSession::new("127.0.0.1".parse().unwrap(), config(port));
        let err = session.request(Action::GetHomeDir, &[]).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
        assert_eq!(session.state(), SessionState::Disconnected);
        server.join().unwrap();
    }
}

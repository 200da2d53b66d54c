//! Buffered non-blocking socket
//!
//! Reads land in a pre-allocated buffer so that bytes the peer pipelined
//! beyond the current request survive until the next one. Every blocking
//! operation is a loop of non-blocking syscalls and `poll(2)` waits
//! bounded by a deadline.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::os::unix::io::AsRawFd;
use std::time::{Duration, Instant};

use mio::net::TcpStream;

use super::{wait_fd, Interest};

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Outcome of a non-blocking fill.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fill {
    /// The socket has no more data right now.
    Drained,
    /// The buffer is full; the socket may hold more.
    Full,
    /// The peer closed its side.
    Eof,
}

pub struct Connection {
    stream: TcpStream,
    read_buffer: Box<[u8]>,
    read_pos: usize,
    read_len: usize,
}

fn timed_out(what: &str) -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, format!("timeout {what}"))
}

fn remaining(deadline: Instant) -> Option<Duration> {
    deadline
        .checked_duration_since(Instant::now())
        .filter(|d| !d.is_zero())
}

impl Connection {
    pub fn new(stream: TcpStream) -> io::Result<Self> {
        // Disable Nagle: requests are small and latency bound
        stream.set_nodelay(true)?;
        Ok(Self {
            stream,
            read_buffer: vec![0u8; READ_BUFFER_SIZE].into_boxed_slice(),
            read_pos: 0,
            read_len: 0,
        })
    }

    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }

    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.stream.peer_addr()
    }

    #[inline(always)]
    pub fn buffered(&self) -> usize {
        self.read_len - self.read_pos
    }

    #[inline(always)]
    pub fn has_buffered(&self) -> bool {
        self.buffered() > 0
    }

    /// Throw away buffered input, returning how much there was.
    pub fn discard_buffered(&mut self) -> usize {
        let n = self.buffered();
        self.read_pos = 0;
        self.read_len = 0;
        n
    }

    fn compact(&mut self) {
        if self.read_pos > 0 {
            self.read_buffer.copy_within(self.read_pos..self.read_len, 0);
            self.read_len -= self.read_pos;
            self.read_pos = 0;
        }
    }

    /// One non-blocking read into the buffer. Ok(None) means WouldBlock.
    fn read_once(&mut self) -> io::Result<Option<usize>> {
        self.compact();
        loop {
            match self.stream.read(&mut self.read_buffer[self.read_len..]) {
                Ok(n) => {
                    self.read_len += n;
                    return Ok(Some(n));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Read everything the socket holds without blocking, until it would
    /// block, the buffer fills or the peer closes.
    pub fn try_fill(&mut self) -> io::Result<Fill> {
        loop {
            self.compact();
            if self.read_len == self.read_buffer.len() {
                return Ok(Fill::Full);
            }
            match self.read_once()? {
                None => return Ok(Fill::Drained),
                Some(0) => return Ok(Fill::Eof),
                Some(_) => {}
            }
        }
    }

    /// Copy buffered bytes into `buf`, returning how many.
    fn take(&mut self, buf: &mut [u8]) -> usize {
        let n = buf.len().min(self.buffered());
        buf[..n].copy_from_slice(&self.read_buffer[self.read_pos..self.read_pos + n]);
        self.read_pos += n;
        n
    }

    /// Read at least one byte before `deadline`. Ok(0) means EOF.
    pub fn read_some_until(&mut self, buf: &mut [u8], deadline: Instant) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            if self.has_buffered() {
                return Ok(self.take(buf));
            }
            match self.read_once()? {
                Some(0) => return Ok(0),
                Some(_) => continue,
                None => {}
            }
            let left = remaining(deadline).ok_or_else(|| timed_out("reading"))?;
            wait_fd(self.stream.as_raw_fd(), Interest::Read, left)?;
        }
    }

    pub fn read_exact_until(&mut self, buf: &mut [u8], deadline: Instant) -> io::Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.read_some_until(&mut buf[filled..], deadline)? {
                0 => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "remote hangs up",
                    ))
                }
                n => filled += n,
            }
        }
        Ok(())
    }

    pub fn read_exact_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<()> {
        self.read_exact_until(buf, Instant::now() + timeout)
    }

    pub fn write_all_timeout(&mut self, mut data: &[u8], timeout: Duration) -> io::Result<()> {
        let deadline = Instant::now() + timeout;
        while !data.is_empty() {
            match self.stream.write(data) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "failed to write to socket",
                    ))
                }
                Ok(n) => data = &data[n..],
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    let left = remaining(deadline).ok_or_else(|| timed_out("writing"))?;
                    wait_fd(self.stream.as_raw_fd(), Interest::Write, left)?;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Reader over the next `len` bytes of the stream, each read bounded
    /// by `timeout`.
    pub fn body(&mut self, len: u64, timeout: Duration) -> BodyReader<'_> {
        BodyReader {
            conn: self,
            remaining: len,
            timeout,
        }
    }

    pub fn shutdown(&self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

/// A length-bounded view of an incoming stream body.
pub struct BodyReader<'a> {
    conn: &'a mut Connection,
    remaining: u64,
    timeout: Duration,
}

impl BodyReader<'_> {
    /// Bytes of the body not yet consumed.
    pub fn remaining(&self) -> u64 {
        self.remaining
    }
}

impl Read for BodyReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 {
            return Ok(0);
        }
        let want = (buf.len() as u64).min(self.remaining) as usize;
        let n = self
            .conn
            .read_some_until(&mut buf[..want], Instant::now() + self.timeout)?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "remote hangs up",
            ));
        }
        self.remaining -= n as u64;
        Ok(n)
    }
}

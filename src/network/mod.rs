//! Network layer: non-blocking sockets over mio
//!
//! - `connection`: buffered socket with deadline-bounded reads and writes
//! - `client`: request session with reconnect and bounded retry
//! - `server`: single-threaded readiness loop serving many clients
//! - `iprange`: allow-list parsing and matching

pub mod client;
pub mod connection;
pub mod iprange;
pub mod server;

pub use client::{ClientSession, SessionState};
pub use connection::Connection;
pub use iprange::IpRangeList;
pub use server::Server;

use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Read,
    Write,
}

/// Block on one descriptor for at most `timeout`. Returns false on
/// timeout. Errors and hangups count as ready so the caller's next
/// syscall reports them.
pub fn wait_fd(fd: RawFd, interest: Interest, timeout: Duration) -> io::Result<bool> {
    let events = match interest {
        Interest::Read => libc::POLLIN,
        Interest::Write => libc::POLLOUT,
    };
    let mut pfd = libc::pollfd {
        fd,
        events,
        revents: 0,
    };
    let ms = timeout.as_millis().min(i32::MAX as u128) as libc::c_int;
    loop {
        // SAFETY: `pfd` is a single valid pollfd for the duration of the call.
        let r = unsafe { libc::poll(&mut pfd, 1, ms) };
        if r < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        return Ok(r > 0);
    }
}

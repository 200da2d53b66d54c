//! Tunables for the client session and the server loop.
//!
//! The defaults reproduce the protocol's historical constants. They are
//! plain fields so deployments on unusual networks can override them.

use std::time::Duration;

/// Default service port.
pub const DEFAULT_PORT: u16 = 50095;

/// Largest request payload the server accepts.
pub const MAX_MESSAGE_LEN: u64 = 1024 * 1024;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub port: u16,
    /// Bound on a single non-blocking connect.
    pub connect_timeout: Duration,
    /// How long to wait for the ack that follows every request header.
    pub ack_timeout: Duration,
    /// Bound on any other read or write while a request is in flight.
    pub io_timeout: Duration,
    /// Reconnect-and-resend attempts per logical request.
    pub max_retries: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            connect_timeout: Duration::from_secs(5),
            ack_timeout: Duration::from_millis(2000),
            io_timeout: Duration::from_secs(60),
            max_retries: 3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind, without the port.
    pub listen_address: String,
    pub port: u16,
    /// Allow-list in `IpRangeList` syntax.
    pub allowed: String,
    /// Silence after which a client is told to go away. 25s sits below
    /// the 30s idle cutoff common in NAT gateways and firewalls; retune it
    /// for other environments.
    pub idle_timeout: Duration,
    /// Bound on reads and writes inside one request cycle.
    pub io_timeout: Duration,
    pub max_message_len: u64,
    pub events_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            allowed: "127.0.0.1".to_string(),
            idle_timeout: Duration::from_secs(25),
            io_timeout: Duration::from_secs(60),
            max_message_len: MAX_MESSAGE_LEN,
            events_capacity: 1024,
        }
    }
}

//! remotefs: file access on a remote host over a plain TCP protocol
//!
//! Layout:
//! ┌──────────────────────────────────────────────────────────┐
//! │ registry   host -> Box<dyn Backend> (local/remote/error) │
//! ├──────────────────────────────────────────────────────────┤
//! │ backend    one operation set, three implementations      │
//! ├───────────────────────────┬──────────────────────────────┤
//! │ network::client (session) │ network::server (mio loop)   │
//! ├───────────────────────────┴──────────────────────────────┤
//! │ protocol   header/ack framing, payloads, record codec    │
//! │            varint / signed varint / float wire codec     │
//! └──────────────────────────────────────────────────────────┘
//!
//! The server executes requests with the same host-side operations
//! (`fsops`) the local backend uses, so a remote host behaves exactly
//! like the local disk.

pub mod backend;
pub mod config;
pub mod error;
pub mod fsops;
pub mod network;
pub mod protocol;
pub mod registry;

pub use backend::{Backend, ErroringBackend, LocalBackend, RemoteBackend};
pub use config::{ClientConfig, ServerConfig, DEFAULT_PORT};
pub use error::{Error, ErrorCode, Result};
pub use registry::Registry;

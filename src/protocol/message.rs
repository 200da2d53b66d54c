//! Message framing
//!
//! Layout (big-endian, fixed 12 bytes):
//! ┌────────┬─────────┬────────┬──────────────────┐
//! │ magic  │ version │ action │ payload length   │
//! │ 2      │ 2       │ 2      │ 6                │
//! └────────┴─────────┴────────┴──────────────────┘
//!
//! Every request header is answered by an 8-byte ack before the payload
//! is read:
//! ┌──────────────────┬─────────┐
//! │ error code (6)   │ version │
//! └──────────────────┴─────────┘

use crate::error::ErrorCode;

pub const HEADER_SIZE: usize = 12;
pub const ACK_SIZE: usize = 8;
pub const MAGIC: u16 = 0x726f;
pub const VERSION: u16 = 1;
/// Chunk size for streamed file bodies.
pub const READER_CHUNK: usize = 64 * 1024;

const MAX_U48: u64 = (1 << 48) - 1;

#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    NotImplemented = 0,
    ReadDir = 1,
    ReadFile = 2,
    WriteFile = 3,
    CheckOrdinaryFileAccess = 4,
    Stat = 5,
    Chdir = 6,
    Realpathize = 7,
    GetHomeDir = 8,
}

impl Action {
    #[inline(always)]
    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            0 => Some(Self::NotImplemented),
            1 => Some(Self::ReadDir),
            2 => Some(Self::ReadFile),
            3 => Some(Self::WriteFile),
            4 => Some(Self::CheckOrdinaryFileAccess),
            5 => Some(Self::Stat),
            6 => Some(Self::Chdir),
            7 => Some(Self::Realpathize),
            8 => Some(Self::GetHomeDir),
            _ => None,
        }
    }
}

/// Write the low 48 bits of `v` big-endian.
#[inline(always)]
pub fn put_u48(buf: &mut [u8], v: u64) {
    buf[..6].copy_from_slice(&v.to_be_bytes()[2..]);
}

#[inline(always)]
pub fn get_u48(buf: &[u8]) -> u64 {
    let mut full = [0u8; 8];
    full[2..].copy_from_slice(&buf[..6]);
    u64::from_be_bytes(full)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub magic: u16,
    pub version: u16,
    /// Raw action number; unknown values must still round-trip so the
    /// server can answer them.
    pub action: u16,
    pub payload_len: u64,
}

impl MessageHeader {
    pub fn new(action: Action, payload_len: usize) -> Self {
        Self {
            magic: MAGIC,
            version: VERSION,
            action: action as u16,
            payload_len: (payload_len as u64).min(MAX_U48),
        }
    }

    #[inline(always)]
    pub fn is_valid(&self) -> bool {
        self.magic == MAGIC
    }

    pub fn action(&self) -> Option<Action> {
        Action::from_u16(self.action)
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..2].copy_from_slice(&self.magic.to_be_bytes());
        buf[2..4].copy_from_slice(&self.version.to_be_bytes());
        buf[4..6].copy_from_slice(&self.action.to_be_bytes());
        put_u48(&mut buf[6..], self.payload_len);
        buf
    }

    pub fn decode(buf: &[u8; HEADER_SIZE]) -> Self {
        Self {
            magic: u16::from_be_bytes([buf[0], buf[1]]),
            version: u16::from_be_bytes([buf[2], buf[3]]),
            action: u16::from_be_bytes([buf[4], buf[5]]),
            payload_len: get_u48(&buf[6..]),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    pub code: ErrorCode,
    pub version: u16,
}

impl Ack {
    pub fn new(code: ErrorCode) -> Self {
        Self {
            code,
            version: VERSION,
        }
    }

    pub fn encode(&self) -> [u8; ACK_SIZE] {
        let mut buf = [0u8; ACK_SIZE];
        put_u48(&mut buf, self.code.0);
        buf[6..8].copy_from_slice(&self.version.to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8; ACK_SIZE]) -> Self {
        Self {
            code: ErrorCode(get_u48(buf)),
            version: u16::from_be_bytes([buf[6], buf[7]]),
        }
    }
}

//! Protocol layer: wire codec, record codec and message framing
//!
//! - `encoder`: varints, floats and byte strings over a bounded cursor
//! - `record`: append-only tagged records built on the wire codec
//! - `message`: fixed-width header and ack
//! - `stat`, `payload`: what each action carries

mod encoder;
pub mod float;
pub mod message;
pub mod payload;
pub mod record;
pub mod stat;

pub use encoder::{DecodeError, Decoder, Encoder};
pub use message::{Ack, Action, MessageHeader, ACK_SIZE, HEADER_SIZE, MAGIC, READER_CHUNK, VERSION};
pub use payload::{OverwriteMode, Request, Response};
pub use record::{Field, FieldType, Record};
pub use stat::{DirEntry, DirListing, FileStat, ListOptions, StatReport};

//! Wire codec: variable-length integers, floats and byte strings
//!
//! Layout of an unsigned varint (300 shown):
//! ┌──────────┬──────────┐
//! │ 0 0101100│ 1 0000010│   low group first, terminal byte has 0x80
//! └──────────┴──────────┘
//!
//! The signed form is identical except that the terminal byte spends
//! 0x40 on the sign and keeps 6 payload bits. Decoding locates the
//! terminal byte first and rebuilds the value walking backward, so a
//! truncated buffer is detected before any value is assembled.

use std::ffi::{OsStr, OsString};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::PathBuf;

use super::float;

/// Non-terminal bytes allowed before a varint is rejected.
const MAX_VARINT_PREFIX: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("truncated input")]
    Truncated,
    #[error("varint longer than {MAX_VARINT_PREFIX} bytes")]
    TooLong,
    #[error("integer does not fit 64 bits")]
    Overflow,
    #[error("declared length {0} runs past end of buffer")]
    BadLength(u64),
    #[error("float exponent {0} out of range")]
    FloatRange(i64),
    #[error("record nesting deeper than {0}")]
    TooDeep(usize),
    #[error("record bitmap has no end marker")]
    Unterminated,
    #[error("{0}")]
    Invalid(&'static str),
}

/// Growable output buffer.
#[derive(Debug, Default, Clone)]
pub struct Encoder {
    buffer: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity),
        }
    }

    #[inline(always)]
    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    #[inline]
    pub fn put_uint(&mut self, mut v: u64) -> &mut Self {
        while v > 0x7f {
            self.buffer.push((v & 0x7f) as u8);
            v >>= 7;
        }
        self.buffer.push(v as u8 | 0x80);
        self
    }

    #[inline]
    pub fn put_sint(&mut self, v: i64) -> &mut Self {
        let sign = if v < 0 { 0x40 } else { 0 };
        let mut mag = v.unsigned_abs();
        while mag > 0x3f {
            self.buffer.push((mag & 0x7f) as u8);
            mag >>= 7;
        }
        self.buffer.push(mag as u8 | 0x80 | sign);
        self
    }

    /// Exact encoding of any double, see `float`.
    pub fn put_float(&mut self, v: f64) -> &mut Self {
        let (exponent, mantissa) = float::split(v);
        self.put_sint(exponent).put_sint(mantissa)
    }

    /// Length-prefixed byte string.
    pub fn put_str(&mut self, s: impl AsRef<[u8]>) -> &mut Self {
        let s = s.as_ref();
        self.put_uint(s.len() as u64);
        self.buffer.extend_from_slice(s);
        self
    }

    /// File names and paths go out as their raw bytes.
    pub fn put_os_str(&mut self, s: impl AsRef<OsStr>) -> &mut Self {
        self.put_str(s.as_ref().as_bytes())
    }

    /// Raw bytes with no prefix.
    pub fn put_raw(&mut self, b: &[u8]) -> &mut Self {
        self.buffer.extend_from_slice(b);
        self
    }

    #[inline(always)]
    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

/// Read cursor over a borrowed buffer. Never reads past its end.
#[derive(Debug, Clone)]
pub struct Decoder<'a> {
    buffer: &'a [u8],
    read_pos: usize,
}

impl<'a> Decoder<'a> {
    #[inline(always)]
    pub fn new(buffer: &'a [u8]) -> Self {
        Self {
            buffer,
            read_pos: 0,
        }
    }

    /// Index of the terminal byte of the varint starting at `read_pos`.
    fn terminal(&self, limit: Option<usize>) -> Result<usize, DecodeError> {
        let rest = &self.buffer[self.read_pos..];
        for (i, &b) in rest.iter().enumerate() {
            if b & 0x80 != 0 {
                return Ok(self.read_pos + i);
            }
            if limit.is_some_and(|l| i >= l) {
                return Err(DecodeError::TooLong);
            }
        }
        Err(DecodeError::Truncated)
    }

    /// Sign and magnitude of a varint whose terminal byte keeps `top` bits.
    fn magnitude(&mut self, top: u8) -> Result<(bool, u64), DecodeError> {
        let term = self.terminal(Some(MAX_VARINT_PREFIX))?;
        let last = self.buffer[term];
        let mut v = u64::from(last & top);
        for &b in self.buffer[self.read_pos..term].iter().rev() {
            if v >> 57 != 0 {
                return Err(DecodeError::Overflow);
            }
            v = (v << 7) | u64::from(b & 0x7f);
        }
        self.read_pos = term + 1;
        Ok((top == 0x3f && last & 0x40 != 0, v))
    }

    pub fn uint(&mut self) -> Result<u64, DecodeError> {
        self.magnitude(0x7f).map(|(_, v)| v)
    }

    pub fn sint(&mut self) -> Result<i64, DecodeError> {
        let (negative, mag) = self.magnitude(0x3f)?;
        if negative {
            if mag > 1 << 63 {
                return Err(DecodeError::Overflow);
            }
            Ok((mag as i64).wrapping_neg())
        } else {
            i64::try_from(mag).map_err(|_| DecodeError::Overflow)
        }
    }

    /// Signed varint of any length. Bits that do not fit are dropped from
    /// the low end and counted in the returned shift.
    pub fn apsint(&mut self) -> Result<(i64, u32), DecodeError> {
        let term = self.terminal(None)?;
        let last = self.buffer[term];
        let mut mag = u64::from(last & 0x3f);
        let mut dropped = 0u32;
        for &b in self.buffer[self.read_pos..term].iter().rev() {
            while mag >> 56 != 0 {
                mag >>= 1;
                dropped += 1;
            }
            let group = u64::from(b & 0x7f);
            mag = (mag << 7) | group.checked_shr(dropped).unwrap_or(0);
        }
        self.read_pos = term + 1;
        let v = mag as i64;
        Ok((if last & 0x40 != 0 { -v } else { v }, dropped))
    }

    pub fn float(&mut self) -> Result<f64, DecodeError> {
        let exponent = self.sint()?;
        let (mantissa, shift) = self.apsint()?;
        float::join(exponent, mantissa, shift)
    }

    /// Length-prefixed bytes, exactly as declared.
    pub fn bytes(&mut self) -> Result<&'a [u8], DecodeError> {
        let len = self.uint()?;
        self.raw(len)
    }

    /// Length-prefixed bytes as text; invalid UTF-8 is replaced.
    pub fn string(&mut self) -> Result<String, DecodeError> {
        self.bytes()
            .map(|b| String::from_utf8_lossy(b).into_owned())
    }

    /// Length-prefixed bytes as a host name, kept byte for byte.
    pub fn os_string(&mut self) -> Result<OsString, DecodeError> {
        self.bytes().map(|b| OsString::from_vec(b.to_vec()))
    }

    pub fn path(&mut self) -> Result<PathBuf, DecodeError> {
        self.os_string().map(PathBuf::from)
    }

    /// Length-prefixed bytes cut to fit a buffer of `max` bytes including
    /// its terminator. The cursor still skips the whole declared length.
    pub fn str_bounded(&mut self, max: usize) -> Result<&'a [u8], DecodeError> {
        let b = self.bytes()?;
        Ok(&b[..b.len().min(max.saturating_sub(1))])
    }

    pub fn raw(&mut self, len: u64) -> Result<&'a [u8], DecodeError> {
        let remaining = self.remaining() as u64;
        if len > remaining {
            return Err(DecodeError::BadLength(len));
        }
        let start = self.read_pos;
        self.read_pos += len as usize;
        Ok(&self.buffer[start..self.read_pos])
    }

    #[inline(always)]
    pub fn remaining(&self) -> usize {
        self.buffer.len().saturating_sub(self.read_pos)
    }

    #[inline(always)]
    pub fn position(&self) -> usize {
        self.read_pos
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }
}

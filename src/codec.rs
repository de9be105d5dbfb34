//! Tagged, length-prefixed TLV codec used by the wire protocol.
//!
//! Every record is `<tag:i32><length:i32><value>`, little-endian. The first
//! record's tag doubles as the message-type discriminant (see `message.rs`).
//! Strings are NUL-terminated; string arrays are `count:i32` followed by
//! `count` strings reusing the outer tag. Fields must be decoded in schema
//! order: a mismatched tag or an out-of-bounds length is a protocol error and
//! the partial result is discarded.

use std::ffi::CString;
use std::os::fd::RawFd;

use anyhow::{anyhow, bail, Context, Result};

/// Raised by the decoder when the wire does not match the expected schema.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("expected tag {expected}, found {found}")]
    UnexpectedTag { expected: i32, found: i32 },
    #[error("declared length {len} overflows remaining buffer of {remaining} bytes")]
    LengthOverflow { len: usize, remaining: usize },
    #[error("string value is not NUL-terminated")]
    UnterminatedString,
    #[error("string value is not valid UTF-8")]
    InvalidUtf8,
    #[error("buffer truncated while reading record header")]
    TruncatedHeader,
    #[error("unknown message tag {0}")]
    UnknownMessageTag(i32),
}

/// Accumulates TLV records plus at most one ancillary file descriptor.
///
/// The encoder never blocks and never partial-writes: `finish` hands back a
/// single contiguous buffer meant to be handed to one `sendmsg` call.
#[derive(Default)]
pub struct Encoder {
    buf: Vec<u8>,
    fd: Option<RawFd>,
}

impl Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_i32(&mut self, tag: i32, value: i32) {
        self.write_header(tag, 4);
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_i64(&mut self, tag: i32, value: i64) {
        self.write_header(tag, 8);
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_u16(&mut self, tag: i32, value: u16) {
        self.write_header(tag, 2);
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_str(&mut self, tag: i32, value: &str) -> Result<()> {
        let c = CString::new(value).context("string contains interior NUL")?;
        let bytes = c.as_bytes_with_nul();
        self.write_header(tag, bytes.len());
        self.buf.extend_from_slice(bytes);
        Ok(())
    }

    pub fn write_str_array(&mut self, tag: i32, values: &[String]) -> Result<()> {
        self.write_i32(tag, values.len() as i32);
        for v in values {
            self.write_str(tag, v)?;
        }
        Ok(())
    }

    /// Attach a file descriptor as ancillary data for this message. At most
    /// one is supported per frame.
    pub fn attach_fd(&mut self, fd: RawFd) {
        debug_assert!(self.fd.is_none(), "at most one fd per frame");
        self.fd = Some(fd);
    }

    fn write_header(&mut self, tag: i32, len: usize) {
        self.buf.extend_from_slice(&tag.to_le_bytes());
        self.buf.extend_from_slice(&(len as i32).to_le_bytes());
    }

    /// Publish the accumulated bytes and ancillary fd, ready for `sendmsg`.
    pub fn finish(self) -> (Vec<u8>, Option<RawFd>) {
        (self.buf, self.fd)
    }
}

/// Walks a received buffer left-to-right, asserting the expected tag per
/// field. Any failure discards the partial result and reports a protocol
/// error; the connection must be dropped by the caller.
pub struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn read_header(&mut self, expected_tag: i32) -> Result<usize> {
        if self.buf.len() - self.pos < 8 {
            bail!(ProtocolError::TruncatedHeader);
        }
        let tag = i32::from_le_bytes(self.buf[self.pos..self.pos + 4].try_into().unwrap());
        let len = i32::from_le_bytes(self.buf[self.pos + 4..self.pos + 8].try_into().unwrap());
        self.pos += 8;
        if tag != expected_tag {
            bail!(ProtocolError::UnexpectedTag {
                expected: expected_tag,
                found: tag
            });
        }
        if len < 0 {
            bail!(ProtocolError::LengthOverflow {
                len: len as usize,
                remaining: self.buf.len() - self.pos,
            });
        }
        let len = len as usize;
        if len > self.buf.len() - self.pos {
            bail!(ProtocolError::LengthOverflow {
                len,
                remaining: self.buf.len() - self.pos,
            });
        }
        Ok(len)
    }

    /// Peek the next record's tag without consuming it. Used by message
    /// dispatch to decide which schema to apply.
    pub fn peek_tag(&self) -> Result<i32> {
        if self.buf.len() - self.pos < 4 {
            bail!(ProtocolError::TruncatedHeader);
        }
        Ok(i32::from_le_bytes(
            self.buf[self.pos..self.pos + 4].try_into().unwrap(),
        ))
    }

    pub fn read_i32(&mut self, tag: i32) -> Result<i32> {
        let len = self.read_header(tag)?;
        if len != 4 {
            bail!(anyhow!("expected 4-byte int, got {len} bytes"));
        }
        let v = i32::from_le_bytes(self.buf[self.pos..self.pos + 4].try_into().unwrap());
        self.pos += 4;
        Ok(v)
    }

    pub fn read_i64(&mut self, tag: i32) -> Result<i64> {
        let len = self.read_header(tag)?;
        if len != 8 {
            bail!(anyhow!("expected 8-byte int, got {len} bytes"));
        }
        let v = i64::from_le_bytes(self.buf[self.pos..self.pos + 8].try_into().unwrap());
        self.pos += 8;
        Ok(v)
    }

    pub fn read_u16(&mut self, tag: i32) -> Result<u16> {
        let len = self.read_header(tag)?;
        if len != 2 {
            bail!(anyhow!("expected 2-byte int, got {len} bytes"));
        }
        let v = u16::from_le_bytes(self.buf[self.pos..self.pos + 2].try_into().unwrap());
        self.pos += 2;
        Ok(v)
    }

    pub fn read_str(&mut self, tag: i32) -> Result<String> {
        let len = self.read_header(tag)?;
        if len == 0 {
            bail!(ProtocolError::UnterminatedString);
        }
        let raw = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        if raw[len - 1] != 0 {
            bail!(ProtocolError::UnterminatedString);
        }
        std::str::from_utf8(&raw[..len - 1])
            .map(str::to_owned)
            .map_err(|_| anyhow!(ProtocolError::InvalidUtf8))
    }

    pub fn read_str_array(&mut self, tag: i32) -> Result<Vec<String>> {
        let count = self.read_i32(tag)?;
        if count < 0 {
            bail!(anyhow!("negative string array count"));
        }
        let mut out = Vec::with_capacity(count as usize);
        for _ in 0..count {
            out.push(self.read_str(tag)?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int_round_trip() {
        let mut enc = Encoder::new();
        enc.write_i32(1, -42);
        let (buf, fd) = enc.finish();
        assert!(fd.is_none());
        let mut dec = Decoder::new(&buf);
        assert_eq!(dec.read_i32(1).unwrap(), -42);
        assert!(dec.is_empty());
    }

    #[test]
    fn string_round_trip() {
        let mut enc = Encoder::new();
        enc.write_str(7, "/bin/sh").unwrap();
        let (buf, _) = enc.finish();
        let mut dec = Decoder::new(&buf);
        assert_eq!(dec.read_str(7).unwrap(), "/bin/sh");
    }

    #[test]
    fn string_array_round_trip() {
        let mut enc = Encoder::new();
        let values = vec!["sh".to_string(), "-c".to_string(), "echo hi".to_string()];
        enc.write_str_array(3, &values).unwrap();
        let (buf, _) = enc.finish();
        let mut dec = Decoder::new(&buf);
        assert_eq!(dec.read_str_array(3).unwrap(), values);
    }

    #[test]
    fn wrong_tag_is_protocol_error() {
        let mut enc = Encoder::new();
        enc.write_i32(1, 7);
        let (buf, _) = enc.finish();
        let mut dec = Decoder::new(&buf);
        assert!(dec.read_i32(2).is_err());
    }

    #[test]
    fn swapped_field_order_fails_to_decode() {
        let mut enc = Encoder::new();
        enc.write_i32(1, 1);
        enc.write_i32(2, 2);
        let (buf, _) = enc.finish();

        // Swap the two records' bytes (each record is 8 header + 4 value = 12 bytes).
        let mut swapped = Vec::with_capacity(buf.len());
        swapped.extend_from_slice(&buf[12..24]);
        swapped.extend_from_slice(&buf[0..12]);

        let mut dec = Decoder::new(&swapped);
        assert!(dec.read_i32(1).is_err());
    }

    #[test]
    fn length_overflow_is_protocol_error() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&1i32.to_le_bytes());
        buf.extend_from_slice(&1000i32.to_le_bytes());
        buf.extend_from_slice(b"x");
        let mut dec = Decoder::new(&buf);
        assert!(dec.read_str(1).is_err());
    }
}

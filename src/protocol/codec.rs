//! PostgreSQL wire protocol encoding and decoding primitives.
//!
//! PostgreSQL uses big-endian (network byte order) for all integers.

use crate::error::{Error, Result};

/// Read 1-byte unsigned integer.
#[inline]
pub fn read_u8(data: &[u8]) -> Result<(u8, &[u8])> {
    match data.split_first() {
        Some((byte, rest)) => Ok((*byte, rest)),
        None => Err(Error::Protocol("read_u8: empty buffer".into())),
    }
}

/// Read 2-byte big-endian signed integer.
#[inline]
pub fn read_i16(data: &[u8]) -> Result<(i16, &[u8])> {
    let (head, rest) = data
        .split_at_checked(2)
        .ok_or_else(|| Error::Protocol(format!("read_i16: buffer too short: {} < 2", data.len())))?;
    Ok((i16::from_be_bytes([head[0], head[1]]), rest))
}

/// Read 2-byte big-endian unsigned integer.
#[inline]
pub fn read_u16(data: &[u8]) -> Result<(u16, &[u8])> {
    let (head, rest) = data
        .split_at_checked(2)
        .ok_or_else(|| Error::Protocol(format!("read_u16: buffer too short: {} < 2", data.len())))?;
    Ok((u16::from_be_bytes([head[0], head[1]]), rest))
}

/// Read 4-byte big-endian signed integer.
#[inline]
pub fn read_i32(data: &[u8]) -> Result<(i32, &[u8])> {
    let (head, rest) = data
        .split_at_checked(4)
        .ok_or_else(|| Error::Protocol(format!("read_i32: buffer too short: {} < 4", data.len())))?;
    Ok((i32::from_be_bytes([head[0], head[1], head[2], head[3]]), rest))
}

/// Read 8-byte big-endian signed integer.
#[inline]
pub fn read_i64(data: &[u8]) -> Result<(i64, &[u8])> {
    let (head, rest) = data
        .split_at_checked(8)
        .ok_or_else(|| Error::Protocol(format!("read_i64: buffer too short: {} < 8", data.len())))?;
    Ok((
        i64::from_be_bytes([
            head[0], head[1], head[2], head[3], head[4], head[5], head[6], head[7],
        ]),
        rest,
    ))
}

/// Read 4-byte big-endian unsigned integer.
#[inline]
pub fn read_u32(data: &[u8]) -> Result<(u32, &[u8])> {
    let (head, rest) = data
        .split_at_checked(4)
        .ok_or_else(|| Error::Protocol(format!("read_u32: buffer too short: {} < 4", data.len())))?;
    Ok((u32::from_be_bytes([head[0], head[1], head[2], head[3]]), rest))
}

/// Read fixed-length bytes.
#[inline]
pub fn read_bytes(data: &[u8], len: usize) -> Result<(&[u8], &[u8])> {
    data.split_at_checked(len).ok_or_else(|| {
        Error::Protocol(format!(
            "read_bytes: buffer too short: {} < {}",
            data.len(),
            len
        ))
    })
}

/// Read a length-prefixed byte string (i32 length, -1 = null).
///
/// Returns `None` for a null value.
#[inline]
pub fn read_len_prefixed(data: &[u8]) -> Result<(Option<&[u8]>, &[u8])> {
    let (len, rest) = read_i32(data)?;
    if len == -1 {
        return Ok((None, rest));
    }
    let len = usize::try_from(len)
        .map_err(|_| Error::Protocol(format!("read_len_prefixed: negative length {}", len)))?;
    let (value, rest) = read_bytes(rest, len)?;
    Ok((Some(value), rest))
}

/// Read null-terminated string (PostgreSQL String type).
/// Returns the string bytes (without the null terminator) and remaining data.
#[inline]
pub fn read_cstring(data: &[u8]) -> Result<(&[u8], &[u8])> {
    match memchr::memchr(0, data) {
        Some(pos) => Ok((&data[..pos], &data[pos + 1..])),
        None => Err(Error::Protocol(
            "read_cstring: no null terminator found".into(),
        )),
    }
}

/// Read null-terminated string as &str.
#[inline]
pub fn read_cstr(data: &[u8]) -> Result<(&str, &[u8])> {
    let (bytes, rest) = read_cstring(data)?;
    let s = simdutf8::compat::from_utf8(bytes)
        .map_err(|e| Error::Protocol(format!("read_cstr: invalid UTF-8: {e}")))?;
    Ok((s, rest))
}

/// Message builder helper that handles the length field.
///
/// PostgreSQL message format:
/// - Type byte (1 byte) - NOT included in length
/// - Length (4 bytes) - includes itself
/// - Payload (Length - 4 bytes)
pub struct MessageBuilder<'a> {
    buf: &'a mut Vec<u8>,
    start: usize,
}

impl<'a> MessageBuilder<'a> {
    /// Start building a message with a type byte.
    pub fn new(buf: &'a mut Vec<u8>, type_byte: u8) -> Self {
        buf.push(type_byte);
        let start = buf.len();
        buf.extend_from_slice(&[0, 0, 0, 0]); // Placeholder for length
        Self { buf, start }
    }

    /// Start building a startup-family message (no type byte).
    ///
    /// Used for StartupMessage, SSLRequest and CancelRequest.
    pub fn new_untagged(buf: &'a mut Vec<u8>) -> Self {
        let start = buf.len();
        buf.extend_from_slice(&[0, 0, 0, 0]); // Placeholder for length
        Self { buf, start }
    }

    /// Get mutable access to the underlying buffer.
    pub fn buf(&mut self) -> &mut Vec<u8> {
        self.buf
    }

    /// Write a u8.
    pub fn write_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    /// Write an i16.
    pub fn write_i16(&mut self, value: i16) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    /// Write an i32.
    pub fn write_i32(&mut self, value: i32) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    /// Write an i64.
    pub fn write_i64(&mut self, value: i64) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    /// Write raw bytes.
    pub fn write_bytes(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Write a length-prefixed byte string (`None` = null, length -1).
    pub fn write_len_prefixed(&mut self, data: Option<&[u8]>) {
        match data {
            Some(bytes) => {
                self.write_i32(bytes.len() as i32);
                self.buf.extend_from_slice(bytes);
            }
            None => self.write_i32(-1),
        }
    }

    /// Write null-terminated string.
    pub fn write_cstr(&mut self, s: &str) {
        self.buf.extend_from_slice(s.as_bytes());
        self.buf.push(0);
    }

    /// Finish building the message and fill in the length field.
    pub fn finish(self) {
        let len = (self.buf.len() - self.start) as i32;
        self.buf[self.start..self.start + 4].copy_from_slice(&len.to_be_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitive_reads() {
        let data = [0x00, 0x2A, 0x00, 0x00, 0x00, 0x01];
        let (v, rest) = read_i16(&data).unwrap();
        assert_eq!(v, 42);
        let (v, rest) = read_i32(rest).unwrap();
        assert_eq!(v, 1);
        assert!(rest.is_empty());
        assert!(read_i32(rest).is_err());

        let wide = (-7_i64).to_be_bytes();
        let (v, rest) = read_i64(&wide).unwrap();
        assert_eq!(v, -7);
        assert!(rest.is_empty());
    }

    #[test]
    fn cstring_reads() {
        let data = b"hello\0rest";
        let (s, rest) = read_cstr(data).unwrap();
        assert_eq!(s, "hello");
        assert_eq!(rest, b"rest");
        assert!(read_cstr(b"no terminator").is_err());
    }

    #[test]
    fn len_prefixed_null() {
        let mut buf = Vec::new();
        let mut msg = MessageBuilder::new(&mut buf, b'D');
        msg.write_len_prefixed(None);
        msg.write_len_prefixed(Some(b"ab"));
        msg.finish();

        let payload = &buf[5..];
        let (v, rest) = read_len_prefixed(payload).unwrap();
        assert_eq!(v, None);
        let (v, _) = read_len_prefixed(rest).unwrap();
        assert_eq!(v, Some(&b"ab"[..]));
    }

    #[test]
    fn builder_backpatches_length() {
        let mut buf = Vec::new();
        let mut msg = MessageBuilder::new(&mut buf, b'Q');
        msg.write_cstr("SELECT 1");
        msg.finish();

        assert_eq!(buf[0], b'Q');
        let len = i32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
        assert_eq!(len as usize, buf.len() - 1);
    }

    #[test]
    fn untagged_builder() {
        let mut buf = Vec::new();
        let mut msg = MessageBuilder::new_untagged(&mut buf);
        msg.write_i32(80877103);
        msg.finish();

        assert_eq!(buf.len(), 8);
        assert_eq!(&buf[0..4], &8_i32.to_be_bytes());
    }
}

//! COPY sub-protocol backend messages.
//!
//! Payload semantics are passthrough; the driver only frames these
//! messages and hands them to the caller as opaque data.

use crate::error::Result;
use crate::protocol::codec::{read_i16, read_u8};
use crate::protocol::types::FormatCode;

/// Header shared by CopyInResponse and CopyOutResponse.
#[derive(Debug, Clone)]
pub struct CopyResponseHeader {
    /// Overall copy format (0 = text, 1 = binary)
    pub format: FormatCode,
    /// Per-column format codes
    pub column_formats: Vec<FormatCode>,
}

fn parse_copy_header(payload: &[u8]) -> Result<CopyResponseHeader> {
    let (format, rest) = read_u8(payload)?;
    let (num_columns, mut data) = read_i16(rest)?;

    let mut column_formats = Vec::with_capacity(num_columns.max(0) as usize);
    for _ in 0..num_columns.max(0) {
        let (fmt, rest) = read_i16(data)?;
        column_formats.push(FormatCode::from_u16(fmt as u16));
        data = rest;
    }

    Ok(CopyResponseHeader {
        format: FormatCode::from_u16(format as u16),
        column_formats,
    })
}

/// CopyInResponse message - server is ready to receive copy data.
#[derive(Debug, Clone)]
pub struct CopyInResponse(pub CopyResponseHeader);

impl CopyInResponse {
    /// Parse a CopyInResponse message from payload bytes.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        Ok(Self(parse_copy_header(payload)?))
    }
}

/// CopyOutResponse message - server is about to send copy data.
#[derive(Debug, Clone)]
pub struct CopyOutResponse(pub CopyResponseHeader);

impl CopyOutResponse {
    /// Parse a CopyOutResponse message from payload bytes.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        Ok(Self(parse_copy_header(payload)?))
    }
}

/// CopyData message - one chunk of copy payload.
#[derive(Debug, Clone, Copy)]
pub struct CopyData<'a> {
    /// Opaque payload bytes
    pub data: &'a [u8],
}

impl<'a> CopyData<'a> {
    /// Parse a CopyData message from payload bytes.
    pub fn parse(payload: &'a [u8]) -> Result<Self> {
        Ok(Self { data: payload })
    }
}

/// CopyDone message - end of copy stream.
#[derive(Debug, Clone, Copy)]
pub struct CopyDone;

impl CopyDone {
    /// Parse a CopyDone message from payload bytes.
    pub fn parse(_payload: &[u8]) -> Result<Self> {
        Ok(Self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_copy_out_header() {
        let mut payload = vec![0u8];
        payload.extend_from_slice(&2_i16.to_be_bytes());
        payload.extend_from_slice(&0_i16.to_be_bytes());
        payload.extend_from_slice(&1_i16.to_be_bytes());

        let resp = CopyOutResponse::parse(&payload).unwrap();
        assert_eq!(resp.0.format, FormatCode::Text);
        assert_eq!(
            resp.0.column_formats,
            vec![FormatCode::Text, FormatCode::Binary]
        );
    }
}

//! Extended-query backend messages.

use crate::error::{Error, Result};
use crate::protocol::codec::{read_i16, read_u32};
use crate::protocol::types::Oid;

/// ParseComplete message.
#[derive(Debug, Clone, Copy)]
pub struct ParseComplete;

impl ParseComplete {
    /// Parse a ParseComplete message from payload bytes.
    pub fn parse(_payload: &[u8]) -> Result<Self> {
        Ok(Self)
    }
}

/// BindComplete message.
#[derive(Debug, Clone, Copy)]
pub struct BindComplete;

impl BindComplete {
    /// Parse a BindComplete message from payload bytes.
    pub fn parse(_payload: &[u8]) -> Result<Self> {
        Ok(Self)
    }
}

/// CloseComplete message.
#[derive(Debug, Clone, Copy)]
pub struct CloseComplete;

impl CloseComplete {
    /// Parse a CloseComplete message from payload bytes.
    pub fn parse(_payload: &[u8]) -> Result<Self> {
        Ok(Self)
    }
}

/// NoData message - the described statement or portal returns no rows.
#[derive(Debug, Clone, Copy)]
pub struct NoData;

impl NoData {
    /// Parse a NoData message from payload bytes.
    pub fn parse(_payload: &[u8]) -> Result<Self> {
        Ok(Self)
    }
}

/// PortalSuspended message - Execute hit its row limit.
#[derive(Debug, Clone, Copy)]
pub struct PortalSuspended;

impl PortalSuspended {
    /// Parse a PortalSuspended message from payload bytes.
    pub fn parse(_payload: &[u8]) -> Result<Self> {
        Ok(Self)
    }
}

/// ParameterDescription message - parameter type OIDs for a statement.
#[derive(Debug, Clone)]
pub struct ParameterDescription {
    oids: Vec<Oid>,
}

impl ParameterDescription {
    /// Parse a ParameterDescription message from payload bytes.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let (count, mut data) = read_i16(payload)?;
        if count < 0 {
            return Err(Error::Protocol(format!(
                "ParameterDescription: negative count {}",
                count
            )));
        }

        let mut oids = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let (oid, rest) = read_u32(data)?;
            oids.push(oid);
            data = rest;
        }

        Ok(Self { oids })
    }

    /// The parameter type OIDs.
    pub fn oids(&self) -> &[Oid] {
        &self.oids
    }
}

//! TCP transport with per-operation timeouts.
//!
//! The driver treats the stream as opaque bytes; every read and write
//! is bounded by the configured I/O timeout, and exceeding it is a
//! fatal connection error.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use crate::buffer_set::BufferSet;
use crate::error::{Error, Result};

/// Buffered TCP transport for one connection.
pub struct Transport {
    stream: BufReader<TcpStream>,
    timeout: Duration,
}

impl Transport {
    /// Connect to `host:port`, bounded by `timeout`.
    pub async fn connect(host: &str, port: u16, timeout: Duration) -> Result<Self> {
        if host.is_empty() {
            return Err(Error::InvalidConfig("host is empty".into()));
        }
        let addr = format!("{}:{}", host, port);
        let tcp = tokio::time::timeout(timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| Error::TransportTimeout(timeout))??;
        tcp.set_nodelay(true)?;

        Ok(Self {
            stream: BufReader::new(tcp),
            timeout,
        })
    }

    fn map_read_error(&self, error: std::io::Error) -> Error {
        if error.kind() == std::io::ErrorKind::UnexpectedEof {
            Error::TransportClosed
        } else {
            Error::Io(error)
        }
    }

    /// Read a single raw byte (the response to SSLRequest is unframed).
    pub async fn read_u8(&mut self) -> Result<u8> {
        tokio::time::timeout(self.timeout, self.stream.read_u8())
            .await
            .map_err(|_| Error::TransportTimeout(self.timeout))?
            .map_err(|e| self.map_read_error(e))
    }

    /// Read exactly one protocol message into the buffer set.
    ///
    /// Suspends until the full frame arrives; a transport close
    /// mid-frame fails with `TransportClosed`.
    pub async fn read_message(&mut self, bufs: &mut BufferSet) -> Result<()> {
        tokio::time::timeout(self.timeout, async {
            bufs.type_byte = self.stream.read_u8().await?;

            let mut length_bytes = [0u8; 4];
            self.stream.read_exact(&mut length_bytes).await?;
            let length = i32::from_be_bytes(length_bytes);
            if length < 4 {
                return Ok::<_, std::io::Error>(Err(Error::Protocol(format!(
                    "message length {} below minimum",
                    length
                ))));
            }

            let payload_len = (length - 4) as usize;
            bufs.read_buffer.clear();
            bufs.read_buffer.resize(payload_len, 0);
            self.stream.read_exact(&mut bufs.read_buffer).await?;
            Ok(Ok(()))
        })
        .await
        .map_err(|_| Error::TransportTimeout(self.timeout))?
        .map_err(|e| self.map_read_error(e))?
    }

    /// Write the whole buffer and flush.
    pub async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        tokio::time::timeout(self.timeout, async {
            self.stream.get_mut().write_all(buf).await?;
            self.stream.get_mut().flush().await
        })
        .await
        .map_err(|_| Error::TransportTimeout(self.timeout))?
        .map_err(Error::Io)
    }

    /// Close the transport. Best-effort.
    pub async fn close(&mut self) {
        let _ = self.stream.get_mut().shutdown().await;
    }
}

//! Out-of-band query cancellation.

use std::time::Duration;

use crate::error::Result;
use crate::protocol::frontend::write_cancel_request;
use crate::transport::Transport;

/// A handle for cancelling the outstanding query of one connection.
///
/// Cancellation opens a separate transport to the server, sends a
/// CancelRequest with the recorded process key, and closes it. The
/// primary connection is unaffected by the side channel; if the server
/// honors the request, the outstanding query fails there with SQLSTATE
/// `57014`.
#[derive(Debug, Clone)]
pub struct CancelToken {
    host: String,
    port: u16,
    pid: u32,
    secret: u32,
    timeout: Duration,
}

impl CancelToken {
    pub(crate) fn new(host: String, port: u16, pid: u32, secret: u32, timeout: Duration) -> Self {
        Self {
            host,
            port,
            pid,
            secret,
            timeout,
        }
    }

    /// Backend process ID this token addresses.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Issue the cancel request. The server never acknowledges it.
    pub async fn cancel(&self) -> Result<()> {
        let mut transport = Transport::connect(&self.host, self.port, self.timeout).await?;

        let mut buf = Vec::with_capacity(16);
        write_cancel_request(&mut buf, self.pid, self.secret);
        transport.write_all(&buf).await?;
        transport.close().await;
        Ok(())
    }
}

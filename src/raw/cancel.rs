//! Out-of-band query cancellation.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UnixStream};

use crate::error::Result;
use crate::protocol::frontend::write_cancel_request;

use super::socket::Target;

/// Handle for cancelling the query running on a connection.
///
/// Cancellation is best effort: the server may finish the query anyway,
/// and a request that arrives between queries has no effect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelToken {
    pub(crate) target: Target,
    pub(crate) pid: u32,
    pub(crate) secret: u32,
}

impl CancelToken {
    /// Backend process ID the token cancels.
    pub fn process_id(&self) -> u32 {
        self.pid
    }

    /// Send a CancelRequest on a fresh socket and wait for the server to close it.
    pub async fn cancel(&self) -> Result<()> {
        let mut packet = Vec::with_capacity(16);
        write_cancel_request(&mut packet, self.pid, self.secret);
        tracing::debug!(pid = self.pid, "sending cancel request");

        match &self.target {
            Target::Tcp { host, port } => {
                let stream = TcpStream::connect((host.as_str(), *port)).await?;
                send_and_wait_close(stream, &packet).await
            }
            Target::Unix(path) => {
                let stream = UnixStream::connect(path).await?;
                send_and_wait_close(stream, &packet).await
            }
        }
    }
}

async fn send_and_wait_close<S>(mut stream: S, packet: &[u8]) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(packet).await?;
    stream.flush().await?;
    // The server replies by closing the connection.
    let mut sink = [0u8; 16];
    while stream.read(&mut sink).await? > 0 {}
    Ok(())
}

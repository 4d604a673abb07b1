use std::path::{Path, PathBuf};

use tracing::trace;

use super::protocol::{MessageFrame, Request, Response};
use crate::clienv;
use crate::error::{HostError, Result};

#[cfg(unix)]
pub type HostStream = tokio::net::UnixStream;

#[cfg(not(unix))]
pub type HostStream = tokio::net::TcpStream;

/// Opens a raw connection to the host socket.
pub async fn connect_stream(socket_path: &Path) -> Result<HostStream> {
    #[cfg(unix)]
    let stream = tokio::net::UnixStream::connect(socket_path).await;

    #[cfg(not(unix))]
    let stream = {
        let _ = socket_path;
        tokio::net::TcpStream::connect(format!("127.0.0.1:{}", clienv::tcp_port())).await
    };

    stream.map_err(|e| HostError::Ipc(format!("cannot reach host: {e}")))
}

/// One-shot client for the host's request/response calls.
#[derive(Debug, Clone)]
pub struct HostClient {
    socket_path: PathBuf,
}

impl HostClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub async fn request(&self, request: &Request) -> Result<Response> {
        let mut stream = connect_stream(&self.socket_path).await?;
        trace!(?request, "Sending request");
        MessageFrame::write_request(&mut stream, request).await?;
        MessageFrame::read_response(&mut stream)
            .await?
            .ok_or_else(|| HostError::Ipc("host closed the connection".into()))
    }

    /// Returns `(uptime_secs, version)`.
    pub async fn ping(&self) -> Result<(u64, String)> {
        match self.request(&Request::Ping).await? {
            Response::Pong {
                uptime_secs,
                version,
            } => Ok((uptime_secs, version)),
            other => Err(unexpected(other)),
        }
    }

    pub async fn is_running(&self) -> bool {
        self.ping().await.is_ok()
    }
}

impl Default for HostClient {
    fn default() -> Self {
        Self::new(clienv::socket_path())
    }
}

/// Turns an `Error` response into an error, and anything else unexpected
/// into a protocol complaint.
pub fn unexpected(response: Response) -> HostError {
    match response {
        Response::Error { message } => HostError::Ipc(message),
        other => HostError::Ipc(format!("unexpected response: {other:?}")),
    }
}

//! Establishing an authenticated connection to the companion.
//!
//! The primary channel is a Unix domain socket (a named pipe on Windows).
//! When that cannot be reached, the companion may advertise a loopback TCP
//! port through a discovery file. Either way the first exchange is a token
//! handshake, and nothing else is written until the companion accepts it.

use super::protocol::{decode_line, encode_line, AgentMessage, CompanionMessage};
use super::TransportError;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

/// How long the companion has to acknowledge a handshake.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// Contents of the discovery file written by the companion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Discovery {
    pub host: String,
    pub port: u16,
    pub token: String,
}

impl Discovery {
    pub fn read(path: &Path) -> Result<Self, TransportError> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Loopback address to connect to. Any other host is refused.
    pub fn loopback_addr(&self) -> Result<SocketAddr, TransportError> {
        let ip = if self.host.eq_ignore_ascii_case("localhost") {
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        } else {
            self.host
                .parse::<IpAddr>()
                .map_err(|_| TransportError::NonLoopback(self.host.clone()))?
        };
        if !ip.is_loopback() {
            return Err(TransportError::NonLoopback(self.host.clone()));
        }
        Ok(SocketAddr::new(ip, self.port))
    }
}

/// Where a connection was made, for logging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Local(PathBuf),
    Tcp(SocketAddr),
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Endpoint::Local(path) => write!(f, "{}", path.display()),
            Endpoint::Tcp(addr) => write!(f, "tcp://{addr}"),
        }
    }
}

/// Open the local socket after checking it is a real socket owned by us.
#[cfg(unix)]
pub async fn connect_local(path: &Path) -> Result<BoxedStream, TransportError> {
    use std::os::unix::fs::MetadataExt;

    let meta = tokio::fs::symlink_metadata(path).await?;
    if meta.file_type().is_symlink() {
        return Err(TransportError::SymlinkRefused(path.to_path_buf()));
    }
    let euid = nix::unistd::geteuid().as_raw();
    if meta.uid() != euid {
        return Err(TransportError::ForeignOwner {
            path: path.to_path_buf(),
            owner: meta.uid(),
        });
    }

    let stream = tokio::net::UnixStream::connect(path).await?;
    Ok(Box::new(stream))
}

#[cfg(windows)]
pub async fn connect_local(path: &Path) -> Result<BoxedStream, TransportError> {
    use tokio::net::windows::named_pipe::ClientOptions;

    let client = ClientOptions::new().open(path.as_os_str())?;
    Ok(Box::new(client))
}

pub async fn connect_tcp(addr: SocketAddr) -> Result<BoxedStream, TransportError> {
    let stream = tokio::net::TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    Ok(Box::new(stream))
}

/// Send the handshake and wait for the companion's verdict.
pub async fn handshake(stream: &mut BoxedStream, token: &str) -> Result<(), TransportError> {
    let hello = AgentMessage::Handshake {
        token: token.to_string(),
        agent_version: crate::VERSION.to_string(),
    };
    stream.write_all(&encode_line(&hello)?).await?;
    stream.flush().await?;

    let mut line = String::new();
    let read = {
        let mut reader = BufReader::new(&mut *stream);
        tokio::time::timeout(HANDSHAKE_TIMEOUT, reader.read_line(&mut line))
            .await
            .map_err(|_| TransportError::HandshakeTimeout)??
    };
    if read == 0 {
        return Err(TransportError::HandshakeRejected(
            "connection closed before acknowledgement".into(),
        ));
    }

    match decode_line::<CompanionMessage>(&line)? {
        CompanionMessage::HandshakeAck { ok: true, .. } => Ok(()),
        CompanionMessage::HandshakeAck { ok: false, reason } => Err(
            TransportError::HandshakeRejected(reason.unwrap_or_else(|| "token refused".into())),
        ),
    }
}

//! Transport streams for reaching a bridge.
//!
//! A bridge is usually a USB-serial adapter exported over TCP (ser2net and
//! friends) or a Unix socket (socat PTY relays). Anything else can be
//! handed to [`Connection::attach`](crate::Connection::attach) directly.

use crate::error::ClientError;
use pin_project_lite::pin_project;
use std::fmt;
use std::io;
#[cfg(unix)]
use std::path::PathBuf;
use std::pin::Pin;
use std::str::FromStr;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;

/// Where a bridge can be reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeAddr {
    /// `host:port`
    Tcp(String),
    /// Path to a Unix domain socket.
    #[cfg(unix)]
    Unix(PathBuf),
}

impl BridgeAddr {
    /// Parses an address string.
    ///
    /// Formats:
    /// - `tcp:host:port` or bare `host:port`
    /// - `unix:/path/to/socket` (Unix only)
    pub fn parse(s: &str) -> Result<Self, ClientError> {
        if let Some(path) = s.strip_prefix("unix:") {
            return Self::unix(path);
        }

        let target = s.strip_prefix("tcp:").unwrap_or(s);
        let (host, port) = target
            .rsplit_once(':')
            .ok_or_else(|| ClientError::InvalidAddress(format!("missing port in '{}'", s)))?;
        if host.is_empty() {
            return Err(ClientError::InvalidAddress(format!("missing host in '{}'", s)));
        }
        port.parse::<u16>()
            .map_err(|_| ClientError::InvalidAddress(format!("invalid port '{}'", port)))?;

        Ok(BridgeAddr::Tcp(target.to_string()))
    }

    #[cfg(unix)]
    fn unix(path: &str) -> Result<Self, ClientError> {
        if path.is_empty() {
            return Err(ClientError::InvalidAddress("empty socket path".to_string()));
        }
        Ok(BridgeAddr::Unix(PathBuf::from(path)))
    }

    #[cfg(not(unix))]
    fn unix(_path: &str) -> Result<Self, ClientError> {
        Err(ClientError::InvalidAddress(
            "unix sockets are not supported on this platform".to_string(),
        ))
    }
}

impl FromStr for BridgeAddr {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for BridgeAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BridgeAddr::Tcp(addr) => write!(f, "tcp:{}", addr),
            #[cfg(unix)]
            BridgeAddr::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

pin_project! {
    /// A connected bridge stream.
    #[project = BridgeStreamProj]
    pub enum BridgeStream {
        Tcp { #[pin] stream: TcpStream },
        #[cfg(unix)]
        Unix { #[pin] stream: UnixStream },
    }
}

impl BridgeStream {
    /// Opens a stream to the given bridge address.
    pub async fn connect(addr: &BridgeAddr) -> Result<Self, ClientError> {
        match addr {
            BridgeAddr::Tcp(target) => {
                let stream = TcpStream::connect(target.as_str()).await?;
                // Frames are small; don't let Nagle hold back a header.
                stream.set_nodelay(true).ok();
                Ok(BridgeStream::Tcp { stream })
            }
            #[cfg(unix)]
            BridgeAddr::Unix(path) => {
                let stream = UnixStream::connect(path).await?;
                Ok(BridgeStream::Unix { stream })
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            BridgeStream::Tcp { .. } => "tcp",
            #[cfg(unix)]
            BridgeStream::Unix { .. } => "unix",
        }
    }
}

impl AsyncRead for BridgeStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.project() {
            BridgeStreamProj::Tcp { stream } => stream.poll_read(cx, buf),
            #[cfg(unix)]
            BridgeStreamProj::Unix { stream } => stream.poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for BridgeStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.project() {
            BridgeStreamProj::Tcp { stream } => stream.poll_write(cx, buf),
            #[cfg(unix)]
            BridgeStreamProj::Unix { stream } => stream.poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            BridgeStreamProj::Tcp { stream } => stream.poll_flush(cx),
            #[cfg(unix)]
            BridgeStreamProj::Unix { stream } => stream.poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            BridgeStreamProj::Tcp { stream } => stream.poll_shutdown(cx),
            #[cfg(unix)]
            BridgeStreamProj::Unix { stream } => stream.poll_shutdown(cx),
        }
    }
}

//! TCP transport: socket opening strategy and the plain/TLS stream type
//! shared by control and data connections.

use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::types::FtpConnectionConfig;
use async_trait::async_trait;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::client::TlsStream;

/// How sockets to the server are opened.
///
/// The default goes straight to the server. A proxy implementation can
/// route the socket elsewhere and rewrite the login user.
#[async_trait]
pub trait SocketConnector: Send + Sync + fmt::Debug {
    /// Open a TCP socket to `host:port` within `limit`.
    async fn connect(&self, host: &str, port: u16, limit: Duration) -> FtpResult<TcpStream>;

    /// Argument sent with USER.
    fn login_user(&self, config: &FtpConnectionConfig) -> String {
        config.username.clone()
    }

    /// Whether sockets go through an intermediary. Disables NAT address
    /// correction and restricts REST.
    fn is_proxy(&self) -> bool {
        false
    }
}

/// Direct TCP connections.
#[derive(Debug, Default, Clone, Copy)]
pub struct DirectConnector;

#[async_trait]
impl SocketConnector for DirectConnector {
    async fn connect(&self, host: &str, port: u16, limit: Duration) -> FtpResult<TcpStream> {
        let tcp = timeout(limit, TcpStream::connect((host, port)))
            .await
            .map_err(|_| FtpError::timeout(format!("TCP connect to {}:{} timed out", host, port)))?
            .map_err(|e| {
                FtpError::connection_failed(format!("TCP connect to {}:{}: {}", host, port, e))
            })?;
        tcp.set_nodelay(true).ok();
        Ok(tcp)
    }
}

/// A plain or TLS-wrapped TCP stream.
pub enum FtpStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl FtpStream {
    pub fn is_encrypted(&self) -> bool {
        matches!(self, Self::Tls(_))
    }

    /// The underlying TCP socket.
    pub fn tcp(&self) -> &TcpStream {
        match self {
            Self::Plain(s) => s,
            Self::Tls(s) => s.get_ref().0,
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.tcp().local_addr()
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.tcp().peer_addr()
    }
}

impl fmt::Debug for FtpStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.is_encrypted() { "Tls" } else { "Plain" };
        f.debug_struct("FtpStream")
            .field("kind", &kind)
            .field("peer", &self.peer_addr().ok())
            .finish()
    }
}

impl AsyncRead for FtpStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for FtpStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_flush(cx),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

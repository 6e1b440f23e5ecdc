//! Byte-stream seam and the tokio TCP adapters.
//!
//! Connections and listeners are abstract so tests can substitute
//! in-memory pipes; production uses [`TcpConnector`] and
//! [`TcpStreamListener`] over `tokio::net`.

use crate::error::NodeError;
use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};

/// A full-duplex byte stream with endpoint metadata.
pub trait IoStream: AsyncRead + AsyncWrite + Send + Unpin {
    fn local_addr(&self) -> Option<SocketAddr>;
    fn peer_addr(&self) -> Option<SocketAddr>;
    fn set_nodelay(&self, nodelay: bool) -> io::Result<()>;
}

impl IoStream for TcpStream {
    fn local_addr(&self) -> Option<SocketAddr> {
        TcpStream::local_addr(self).ok()
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        TcpStream::peer_addr(self).ok()
    }

    fn set_nodelay(&self, nodelay: bool) -> io::Result<()> {
        TcpStream::set_nodelay(self, nodelay)
    }
}

/// Opens outbound streams to peers.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, host: &str, port: u16) -> io::Result<Box<dyn IoStream>>;
}

/// Accepts inbound streams from peers.
#[async_trait]
pub trait StreamListener: Send + Sync {
    /// Port peers should be told to connect to.
    fn local_port(&self) -> u16;

    async fn accept(&self) -> io::Result<Box<dyn IoStream>>;
}

/// Plain TCP connector.
#[derive(Debug, Default)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, host: &str, port: u16) -> io::Result<Box<dyn IoStream>> {
        let stream = TcpStream::connect((host, port)).await?;
        Ok(Box::new(stream))
    }
}

/// Plain TCP listener.
#[derive(Debug)]
pub struct TcpStreamListener {
    listener: TcpListener,
    port: u16,
}

impl TcpStreamListener {
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let port = listener.local_addr()?.port();
        Ok(Self { listener, port })
    }
}

#[async_trait]
impl StreamListener for TcpStreamListener {
    fn local_port(&self) -> u16 {
        self.port
    }

    async fn accept(&self) -> io::Result<Box<dyn IoStream>> {
        let (stream, _) = self.listener.accept().await?;
        Ok(Box::new(stream))
    }
}

/// Formats a peer endpoint as a `tcpros://host:port` URL. IPv6 hosts are
/// bracketed.
pub fn tcpros_url(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("tcpros://[{host}]:{port}")
    } else {
        format!("tcpros://{host}:{port}")
    }
}

/// Parses a `tcpros://host:port` URL back into its endpoint.
pub fn parse_tcpros_url(url: &str) -> Result<(String, u16), NodeError> {
    let rest = url
        .strip_prefix("tcpros://")
        .ok_or_else(|| NodeError::InvalidPeerUrl(url.to_string()))?;

    let (host, port_str) = if let Some(bracketed) = rest.strip_prefix('[') {
        let (host, tail) = bracketed
            .split_once(']')
            .ok_or_else(|| NodeError::InvalidPeerUrl(url.to_string()))?;
        let port_str = tail
            .strip_prefix(':')
            .ok_or_else(|| NodeError::InvalidPeerUrl(url.to_string()))?;
        (host, port_str)
    } else {
        rest.rsplit_once(':')
            .ok_or_else(|| NodeError::InvalidPeerUrl(url.to_string()))?
    };

    let port: u16 = port_str
        .parse()
        .map_err(|_| NodeError::InvalidPeerUrl(url.to_string()))?;
    Ok((host.to_string(), port))
}

//! Byte-stream transport abstraction and its TCP implementation.
//!
//! The engine only needs a duplex byte stream per server address. [`Connector`] produces
//! one; [`TcpConnector`] is the production implementation, tests plug in in-memory pipes.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, instrument};

use crate::error::Result;
use crate::transport::session_store::ServerAddress;

/// A duplex byte stream the link tasks can split
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// Opens a stream to one server.
///
/// The caller applies the connection timeout.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, addr: &ServerAddress) -> Result<BoxedStream>;
}

/// Plain TCP with Nagle disabled
#[derive(Debug, Clone, Default)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    #[instrument(skip(self), fields(server = %addr))]
    async fn connect(&self, addr: &ServerAddress) -> Result<BoxedStream> {
        let stream = TcpStream::connect((addr.host.as_str(), addr.port)).await?;
        stream.set_nodelay(true)?;
        debug!(peer = ?stream.peer_addr().ok(), "TCP connected");
        Ok(Box::new(stream))
    }
}

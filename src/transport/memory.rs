//! In-memory connector for tests and embedded peers.
//!
//! Each `connect` creates a `tokio::io::duplex` pipe, keeps the client half and hands the
//! server half to whoever holds the [`MemoryAcceptor`].

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{ProtocolError, Result};
use crate::transport::session_store::ServerAddress;
use crate::transport::tcp::{BoxedStream, Connector};

/// Server side of a memory connection
pub struct Accepted {
    pub addr: ServerAddress,
    pub stream: DuplexStream,
}

#[derive(Clone)]
pub struct MemoryConnector {
    accepted: mpsc::UnboundedSender<Accepted>,
    refused: Arc<Mutex<HashSet<ServerAddress>>>,
    buffer_size: usize,
}

/// Receives the server halves created by a [`MemoryConnector`]
pub struct MemoryAcceptor {
    accepted: mpsc::UnboundedReceiver<Accepted>,
}

impl MemoryAcceptor {
    /// Next connection, or `None` once every connector is dropped
    pub async fn accept(&mut self) -> Option<Accepted> {
        self.accepted.recv().await
    }
}

impl MemoryConnector {
    pub fn pair(buffer_size: usize) -> (Self, MemoryAcceptor) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                accepted: tx,
                refused: Arc::new(Mutex::new(HashSet::new())),
                buffer_size,
            },
            MemoryAcceptor { accepted: rx },
        )
    }

    /// Make connections to `addr` fail with `ConnectionRefused`
    pub fn refuse(&self, addr: ServerAddress) {
        if let Ok(mut refused) = self.refused.lock() {
            refused.insert(addr);
        }
    }

    fn is_refused(&self, addr: &ServerAddress) -> bool {
        self.refused.lock().map(|r| r.contains(addr)).unwrap_or(false)
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, addr: &ServerAddress) -> Result<BoxedStream> {
        if self.is_refused(addr) {
            return Err(std::io::Error::from(std::io::ErrorKind::ConnectionRefused).into());
        }
        let (client, server) = tokio::io::duplex(self.buffer_size);
        self.accepted
            .send(Accepted {
                addr: addr.clone(),
                stream: server,
            })
            .map_err(|_| ProtocolError::ConnectionClosed)?;
        debug!(server = %addr, "Memory connection opened");
        Ok(Box::new(client))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_pipe_and_refusal() {
        let (connector, mut acceptor) = MemoryConnector::pair(64);
        let addr = ServerAddress::new("mem", 1);
        let mut client = connector.connect(&addr).await.unwrap();
        let mut accepted = acceptor.accept().await.unwrap();
        assert_eq!(accepted.addr, addr);

        client.write_all(b"abc").await.unwrap();
        let mut buf = [0u8; 3];
        accepted.stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"abc");

        connector.refuse(addr.clone());
        assert!(matches!(
            connector.connect(&addr).await,
            Err(ProtocolError::Io(_))
        ));
    }
}

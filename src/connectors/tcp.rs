//! Implementation of [Connector] for TCP.

use crate::node::{self, Connection, Connector};

use async_trait::async_trait;
use tokio::net::TcpStream;

/// Opens plain TCP connections to `host:port` node addresses.
#[derive(Clone, Copy, Debug, Default)]
pub struct TcpConnector {}

/// A TCP stream owned by the pool.
#[derive(Debug)]
pub struct TcpConnection {
    stream: Option<TcpStream>,
}

impl TcpConnection {
    /// The underlying stream, or `None` once closed.
    pub fn stream(&mut self) -> Option<&mut TcpStream> {
        self.stream.as_mut()
    }
}

impl Connection for TcpConnection {
    fn is_open(&self) -> bool {
        // NOTE: This only notices errors the kernel has already recorded on
        // the socket. A peer which silently went away looks healthy until
        // the next write; callers which see that should mark the handle
        // corrupted.
        match &self.stream {
            Some(stream) => matches!(stream.take_error(), Ok(None)),
            None => false,
        }
    }

    fn close(&mut self) {
        self.stream.take();
    }
}

#[async_trait]
impl Connector for TcpConnector {
    type Connection = TcpConnection;

    async fn connect(&self, node: &node::Address) -> Result<Self::Connection, node::Error> {
        let stream = TcpStream::connect(node.as_str()).await?;
        stream.set_nodelay(true)?;
        Ok(TcpConnection {
            stream: Some(stream),
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn connects_and_closes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = node::Address::from(listener.local_addr().unwrap());

        let mut conn = TcpConnector {}.connect(&address).await.unwrap();
        assert!(conn.is_open());
        assert!(conn.stream().is_some());

        conn.close();
        assert!(!conn.is_open());
        assert!(conn.stream().is_none());
    }

    #[tokio::test]
    async fn refused_connections_fail() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = node::Address::from(listener.local_addr().unwrap());
        drop(listener);

        let err = TcpConnector {}.connect(&address).await.unwrap_err();
        assert!(matches!(err, node::Error::Io(_)));
    }
}

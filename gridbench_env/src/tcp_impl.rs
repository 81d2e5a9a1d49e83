//! Production transport over TCP sockets.

use crate::connector::{Dialer, Listener};
use crate::link::BoxedStream;
use async_trait::async_trait;
use std::net::SocketAddr;
use tokio::net::{TcpListener as TokioTcpListener, TcpStream};
use tracing::debug;

/// Dials a fixed TCP endpoint.
pub struct TcpDialer {
    /// Host and port, e.g. `127.0.0.1:9000`
    endpoint: String,
}

impl TcpDialer {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self) -> std::io::Result<BoxedStream> {
        let stream = TcpStream::connect(&self.endpoint).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }

    fn endpoint(&self) -> String {
        self.endpoint.clone()
    }
}

/// Accepts TCP connections on a bound socket.
pub struct TcpListener {
    inner: TokioTcpListener,
    local_addr: SocketAddr,
}

impl TcpListener {
    /// Binds to `addr`; port `0` picks a free port.
    pub async fn bind(addr: &str) -> std::io::Result<Self> {
        let inner = TokioTcpListener::bind(addr).await?;
        let local_addr = inner.local_addr()?;
        Ok(Self { inner, local_addr })
    }

    /// The address actually bound (useful after binding port `0`).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

#[async_trait]
impl Listener for TcpListener {
    async fn accept(&self) -> Option<std::io::Result<BoxedStream>> {
        match self.inner.accept().await {
            Ok((stream, peer)) => {
                debug!(peer = %peer, "Accepted TCP connection");
                if let Err(e) = stream.set_nodelay(true) {
                    return Some(Err(e));
                }
                Some(Ok(Box::new(stream) as BoxedStream))
            }
            Err(e) => Some(Err(e)),
        }
    }

    fn endpoint(&self) -> String {
        self.local_addr.to_string()
    }
}

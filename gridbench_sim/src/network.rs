//! In-memory network with fault injection.
//!
//! Endpoints are plain names (`agent-1`, `A1_W2`). A dial produces a pair of
//! `tokio::io::duplex` pipes, so links run the exact framing used over TCP.
//!
//! ```text
//!   SimDialer("agent-1") ──dial──▶ SimNetwork ──queue──▶ SimListener("agent-1")
//!                                     │
//!                          SimNetworkController
//!                   partition / sever / heal per endpoint
//! ```

use async_trait::async_trait;
use gridbench_env::{BoxedStream, Dialer, Listener};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::sync::{mpsc, watch};
use tracing::debug;

/// Buffer size of each in-memory pipe.
const PIPE_CAPACITY: usize = 64 * 1024;

/// Fault injection for a [`SimNetwork`].
#[derive(Default)]
pub struct SimNetworkController {
    /// Endpoints that refuse new dials
    partitioned: Mutex<HashSet<String>>,

    /// Per endpoint generation; bumping it cuts every live stream
    generations: Mutex<HashMap<String, watch::Sender<u64>>>,

    /// Dials refused because of a partition
    refused_dials: Mutex<u64>,
}

impl SimNetworkController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cuts every live connection to `endpoint` and refuses new ones.
    pub fn partition(&self, endpoint: &str) {
        self.partitioned.lock().insert(endpoint.to_string());
        self.sever(endpoint);
    }

    /// Allows dials to `endpoint` again.
    pub fn heal(&self, endpoint: &str) {
        self.partitioned.lock().remove(endpoint);
    }

    pub fn heal_all(&self) {
        self.partitioned.lock().clear();
    }

    /// Cuts every live connection to `endpoint`; new dials still succeed.
    pub fn sever(&self, endpoint: &str) {
        let generations = self.generations.lock();
        if let Some(generation) = generations.get(endpoint) {
            generation.send_modify(|g| *g += 1);
            debug!(endpoint, "Severed connections");
        }
    }

    pub fn is_partitioned(&self, endpoint: &str) -> bool {
        self.partitioned.lock().contains(endpoint)
    }

    pub fn refused_dials(&self) -> u64 {
        *self.refused_dials.lock()
    }

    /// Signal that fires once the endpoint's current connections are cut.
    fn cut_signal(&self, endpoint: &str) -> CutSignal {
        let mut generations = self.generations.lock();
        let sender = generations
            .entry(endpoint.to_string())
            .or_insert_with(|| watch::channel(0).0);
        let mut receiver = sender.subscribe();
        let created = *receiver.borrow_and_update();
        Box::pin(async move {
            while *receiver.borrow_and_update() == created {
                if receiver.changed().await.is_err() {
                    std::future::pending::<()>().await;
                }
            }
        })
    }
}

type CutSignal = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Routes dials to listeners by endpoint name.
#[derive(Default)]
pub struct SimNetwork {
    listeners: Mutex<HashMap<String, mpsc::UnboundedSender<BoxedStream>>>,
    controller: SimNetworkController,
}

impl SimNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn controller(&self) -> &SimNetworkController {
        &self.controller
    }

    /// Opens a listener; replaces any previous listener of the same name.
    pub fn listen(&self, endpoint: &str) -> Arc<SimListener> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners.lock().insert(endpoint.to_string(), tx);
        Arc::new(SimListener {
            endpoint: endpoint.to_string(),
            incoming: tokio::sync::Mutex::new(rx),
        })
    }

    /// Closes a listener and cuts its live connections.
    pub fn close(&self, endpoint: &str) {
        self.listeners.lock().remove(endpoint);
        self.controller.sever(endpoint);
    }

    pub fn dialer(self: &Arc<Self>, endpoint: &str) -> Arc<SimDialer> {
        Arc::new(SimDialer {
            network: Arc::clone(self),
            endpoint: endpoint.to_string(),
        })
    }

    fn connect(&self, endpoint: &str) -> io::Result<BoxedStream> {
        if self.controller.is_partitioned(endpoint) {
            *self.controller.refused_dials.lock() += 1;
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("{} is partitioned", endpoint),
            ));
        }
        let listeners = self.listeners.lock();
        let listener = listeners.get(endpoint).ok_or_else(|| {
            io::Error::new(io::ErrorKind::ConnectionRefused, format!("nothing listens on {}", endpoint))
        })?;

        let (client, server) = tokio::io::duplex(PIPE_CAPACITY);
        let server = SeverableStream::new(server, self.controller.cut_signal(endpoint));
        listener.send(Box::new(server)).map_err(|_| {
            io::Error::new(io::ErrorKind::ConnectionRefused, format!("{} stopped listening", endpoint))
        })?;
        Ok(Box::new(SeverableStream::new(client, self.controller.cut_signal(endpoint))))
    }
}

/// Dials one endpoint of a [`SimNetwork`].
pub struct SimDialer {
    network: Arc<SimNetwork>,
    endpoint: String,
}

#[async_trait]
impl Dialer for SimDialer {
    async fn dial(&self) -> io::Result<BoxedStream> {
        self.network.connect(&self.endpoint)
    }

    fn endpoint(&self) -> String {
        format!("sim://{}", self.endpoint)
    }
}

/// Accepts streams dialed to one endpoint.
pub struct SimListener {
    endpoint: String,
    incoming: tokio::sync::Mutex<mpsc::UnboundedReceiver<BoxedStream>>,
}

#[async_trait]
impl Listener for SimListener {
    async fn accept(&self) -> Option<io::Result<BoxedStream>> {
        self.incoming.lock().await.recv().await.map(Ok)
    }

    fn endpoint(&self) -> String {
        format!("sim://{}", self.endpoint)
    }
}

/// A pipe end that fails all I/O once its endpoint is severed.
struct SeverableStream {
    inner: DuplexStream,
    cut: CutSignal,
    severed: bool,
}

impl SeverableStream {
    fn new(inner: DuplexStream, cut: CutSignal) -> Self {
        Self {
            inner,
            cut,
            severed: false,
        }
    }

    fn check(&mut self, cx: &mut Context<'_>) -> io::Result<()> {
        if !self.severed && self.cut.as_mut().poll(cx).is_ready() {
            self.severed = true;
        }
        if self.severed {
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "connection severed"))
        } else {
            Ok(())
        }
    }
}

impl AsyncRead for SeverableStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if let Err(e) = this.check(cx) {
            return Poll::Ready(Err(e));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for SeverableStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if let Err(e) = this.check(cx) {
            return Poll::Ready(Err(e));
        }
        Pin::new(&mut this.inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if let Err(e) = this.check(cx) {
            return Poll::Ready(Err(e));
        }
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

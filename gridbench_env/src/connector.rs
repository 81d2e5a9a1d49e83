//! Client and server connectors built on top of [`Link`].
//!
//! - [`ClientConnector`] dials one remote endpoint and transparently re-dials
//!   (bounded attempts, exponential backoff) when its link has dropped.
//! - [`ServerConnector`] accepts links from any number of dialers and keeps
//!   them indexed by the address each dialer announced.
//!
//! Both are generic over how bytes are moved: [`Dialer`] and [`Listener`]
//! have a TCP implementation in this crate and an in-memory implementation in
//! the simulation harness.

use crate::address::SimulatorAddress;
use crate::error::{ConnectError, TransportError};
use crate::link::{BoxedStream, Link, MessageHandler, ResponseFuture, WireSchema};
use crate::types::SimulatorMessage;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Transport tuning knobs.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Dial attempts before a connect fails (default: 5)
    pub max_reconnect_attempts: u32,

    /// Delay before the second attempt; doubles per attempt (default: 100ms)
    pub reconnect_backoff_ms: u64,

    /// Upper bound for the reconnect delay (default: 2s)
    pub max_reconnect_backoff_ms: u64,

    /// Timeout for a single dial (default: 5s)
    pub connect_timeout_ms: u64,

    /// Default bound when waiting for a response (default: 60s)
    pub response_timeout_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: 5,
            reconnect_backoff_ms: 100,
            max_reconnect_backoff_ms: 2_000,
            connect_timeout_ms: 5_000,
            response_timeout_ms: 60_000,
        }
    }
}

impl TransportConfig {
    /// Sets the number of dial attempts.
    pub fn with_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts.max(1);
        self
    }

    /// Sets the initial reconnect backoff.
    pub fn with_reconnect_backoff(mut self, backoff: Duration) -> Self {
        self.reconnect_backoff_ms = backoff.as_millis() as u64;
        self
    }

    /// Sets the default response timeout.
    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Backoff to wait after the given (1-based) failed attempt.
    pub fn backoff_after(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        let millis = self
            .reconnect_backoff_ms
            .saturating_mul(factor)
            .min(self.max_reconnect_backoff_ms);
        Duration::from_millis(millis)
    }
}

/// Opens byte streams towards one remote endpoint.
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    /// Opens a new stream.
    async fn dial(&self) -> std::io::Result<BoxedStream>;

    /// Human readable description of the endpoint (for errors and logs).
    fn endpoint(&self) -> String;
}

/// Produces inbound byte streams.
#[async_trait]
pub trait Listener: Send + Sync + 'static {
    /// Waits for the next inbound stream; `None` once the listener is closed.
    async fn accept(&self) -> Option<std::io::Result<BoxedStream>>;

    /// Human readable description of the local endpoint.
    fn endpoint(&self) -> String;
}

/// Dials one remote endpoint, reconnecting on demand.
pub struct ClientConnector {
    local: SimulatorAddress,
    remote: SimulatorAddress,
    dialer: Arc<dyn Dialer>,
    handler: Arc<dyn MessageHandler>,
    schema: Arc<dyn WireSchema>,
    config: TransportConfig,
    link: tokio::sync::Mutex<Option<Arc<Link>>>,
}

impl ClientConnector {
    /// Creates a connector; no connection is made until first use.
    pub fn new(
        local: SimulatorAddress,
        remote: SimulatorAddress,
        dialer: Arc<dyn Dialer>,
        handler: Arc<dyn MessageHandler>,
        schema: Arc<dyn WireSchema>,
        config: TransportConfig,
    ) -> Self {
        Self {
            local,
            remote,
            dialer,
            handler,
            schema,
            config,
            link: tokio::sync::Mutex::new(None),
        }
    }

    pub fn remote(&self) -> SimulatorAddress {
        self.remote
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Returns a live link, dialing if there is none.
    ///
    /// Concurrent callers queue on the connector's lock, so messages
    /// submitted while a reconnect is in progress keep their order.
    pub async fn connect(&self) -> Result<Arc<Link>, ConnectError> {
        let mut guard = self.link.lock().await;
        if let Some(link) = guard.as_ref() {
            if link.is_connected() {
                return Ok(Arc::clone(link));
            }
            debug!(remote = %self.remote, "Link is down, reconnecting");
        }

        let attempts = self.config.max_reconnect_attempts.max(1);
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            match self.dial_once().await {
                Ok(link) => {
                    if attempt > 1 {
                        info!(remote = %self.remote, attempt, "Reconnected");
                    }
                    *guard = Some(Arc::clone(&link));
                    return Ok(link);
                }
                Err(e) => {
                    last_error = e.to_string();
                    warn!(
                        remote = %self.remote,
                        endpoint = %self.dialer.endpoint(),
                        attempt,
                        attempts,
                        error = %last_error,
                        "Connect attempt failed"
                    );
                    if attempt < attempts {
                        tokio::time::sleep(self.config.backoff_after(attempt)).await;
                    }
                }
            }
        }

        *guard = None;
        Err(ConnectError {
            endpoint: format!("{} ({})", self.remote, self.dialer.endpoint()),
            attempts,
            reason: last_error,
        })
    }

    async fn dial_once(&self) -> Result<Arc<Link>, TransportError> {
        let stream = tokio::time::timeout(self.config.connect_timeout(), self.dialer.dial())
            .await
            .map_err(|_| TransportError::Timeout(self.config.connect_timeout_ms))??;
        Link::dial(
            stream,
            self.local,
            self.remote,
            Arc::clone(&self.handler),
            Arc::clone(&self.schema),
        )
        .await
    }

    /// Submits a message, reconnecting first if needed.
    ///
    /// The returned future fails with [`TransportError::Connect`] when the
    /// endpoint could not be reached within the configured attempts.
    pub async fn submit(&self, message: SimulatorMessage) -> ResponseFuture {
        match self.connect().await {
            Ok(link) => link.submit(message),
            Err(e) => ResponseFuture::failed(self.remote, e.into()),
        }
    }

    /// True if a link is currently up (does not dial).
    pub fn is_connected(&self) -> bool {
        match self.link.try_lock() {
            Ok(guard) => guard.as_ref().map(|l| l.is_connected()).unwrap_or(false),
            Err(_) => false,
        }
    }

    /// Closes the current link, if any.
    pub async fn close(&self) {
        if let Some(link) = self.link.lock().await.take() {
            link.close();
        }
    }
}

/// Accepts links and tracks them by remote address.
pub struct ServerConnector {
    local: SimulatorAddress,
    handler: Arc<dyn MessageHandler>,
    schema: Arc<dyn WireSchema>,
    links: Arc<RwLock<HashMap<SimulatorAddress, Arc<Link>>>>,
}

impl ServerConnector {
    pub fn new(
        local: SimulatorAddress,
        handler: Arc<dyn MessageHandler>,
        schema: Arc<dyn WireSchema>,
    ) -> Arc<Self> {
        Arc::new(Self {
            local,
            handler,
            schema,
            links: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    pub fn local(&self) -> SimulatorAddress {
        self.local
    }

    /// Runs the accept loop on a background task.
    pub fn serve(self: &Arc<Self>, listener: Arc<dyn Listener>) -> JoinHandle<()> {
        let server = Arc::clone(self);
        tokio::spawn(async move {
            info!(local = %server.local, endpoint = %listener.endpoint(), "Accepting connections");
            while let Some(accepted) = listener.accept().await {
                match accepted {
                    Ok(stream) => {
                        let server = Arc::clone(&server);
                        tokio::spawn(async move {
                            if let Err(e) = server.accept_stream(stream).await {
                                warn!(local = %server.local, error = %e, "Rejected inbound connection");
                            }
                        });
                    }
                    Err(e) => warn!(local = %server.local, error = %e, "Accept failed"),
                }
            }
            debug!(local = %server.local, "Listener closed");
        })
    }

    /// Completes the handshake on an already accepted stream.
    pub async fn accept_stream(&self, stream: BoxedStream) -> Result<Arc<Link>, TransportError> {
        let link = Link::accept(
            stream,
            self.local,
            Arc::clone(&self.handler),
            Arc::clone(&self.schema),
        )
        .await?;
        let remote = link.remote();
        if let Some(previous) = self.links.write().insert(remote, Arc::clone(&link)) {
            debug!(remote = %remote, "Replacing previous link");
            previous.close();
        }
        info!(local = %self.local, remote = %remote, "Accepted link");
        Ok(link)
    }

    /// Returns the live link to `remote`, if any.
    pub fn link_to(&self, remote: &SimulatorAddress) -> Option<Arc<Link>> {
        self.links
            .read()
            .get(remote)
            .filter(|l| l.is_connected())
            .cloned()
    }

    /// Returns any live link whose remote is an ancestor of this endpoint.
    pub fn parent_link(&self) -> Option<Arc<Link>> {
        let parent = self.local.parent()?;
        self.link_to(&parent)
    }

    /// Submits a message on the link to `remote`.
    pub fn submit(&self, remote: SimulatorAddress, message: SimulatorMessage) -> ResponseFuture {
        match self.link_to(&remote) {
            Some(link) => link.submit(message),
            None => ResponseFuture::failed(remote, TransportError::Unreachable(remote)),
        }
    }

    /// Closes every accepted link.
    pub fn close(&self) {
        for (_, link) in self.links.write().drain() {
            link.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::Promise;
    use crate::types::ResponseType;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct AnySchema;

    impl WireSchema for AnySchema {
        fn is_registered(&self, _operation_type: u16) -> bool {
            true
        }
    }

    struct Ack;

    impl MessageHandler for Ack {
        fn handle(&self, _message: SimulatorMessage, promise: Promise) {
            promise.answer_type(ResponseType::Success, None);
        }
    }

    /// Dialer that hands the server side of a duplex pipe to a server connector.
    struct PipeDialer {
        server: Arc<ServerConnector>,
        refuse: AtomicU32,
        dials: AtomicU32,
    }

    #[async_trait]
    impl Dialer for PipeDialer {
        async fn dial(&self) -> std::io::Result<BoxedStream> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            if self.refuse.load(Ordering::SeqCst) > 0 {
                self.refuse.fetch_sub(1, Ordering::SeqCst);
                return Err(std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused"));
            }
            let (client, server_io) = tokio::io::duplex(64 * 1024);
            let server = Arc::clone(&self.server);
            tokio::spawn(async move {
                let _ = server.accept_stream(Box::new(server_io)).await;
            });
            Ok(Box::new(client))
        }

        fn endpoint(&self) -> String {
            "pipe".to_string()
        }
    }

    fn setup(refuse: u32, attempts: u32) -> (Arc<PipeDialer>, ClientConnector, Arc<ServerConnector>) {
        let agent = SimulatorAddress::agent(1);
        let server = ServerConnector::new(agent, Arc::new(Ack), Arc::new(AnySchema));
        let dialer = Arc::new(PipeDialer {
            server: Arc::clone(&server),
            refuse: AtomicU32::new(refuse),
            dials: AtomicU32::new(0),
        });
        let config = TransportConfig::default()
            .with_reconnect_attempts(attempts)
            .with_reconnect_backoff(Duration::from_millis(1));
        let client = ClientConnector::new(
            SimulatorAddress::coordinator(),
            agent,
            dialer.clone(),
            Arc::new(Ack),
            Arc::new(AnySchema),
            config,
        );
        (dialer, client, server)
    }

    fn ping() -> SimulatorMessage {
        SimulatorMessage::new(SimulatorAddress::agent(1), SimulatorAddress::coordinator(), 1, "{}".into())
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let config = TransportConfig::default();
        assert_eq!(config.backoff_after(1), Duration::from_millis(100));
        assert_eq!(config.backoff_after(2), Duration::from_millis(200));
        assert_eq!(config.backoff_after(3), Duration::from_millis(400));
        assert_eq!(config.backoff_after(10), Duration::from_millis(2_000));
    }

    #[tokio::test]
    async fn test_connect_retries_until_success() {
        let (dialer, client, _server) = setup(2, 5);
        let response = client.submit(ping()).await.await.unwrap();
        assert!(response.is_success());
        assert_eq!(dialer.dials.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_connect_fails_after_bounded_attempts() {
        let (dialer, client, _server) = setup(10, 3);
        let result = client.submit(ping()).await.await;
        assert!(matches!(result, Err(TransportError::Connect(ConnectError { attempts: 3, .. }))));
        assert_eq!(dialer.dials.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_reconnects_after_link_loss() {
        let (dialer, client, server) = setup(0, 3);
        assert!(client.submit(ping()).await.await.is_ok());

        server.close();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!client.is_connected());

        assert!(client.submit(ping()).await.await.is_ok());
        assert_eq!(dialer.dials.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_server_tracks_links_by_address() {
        let (_dialer, client, server) = setup(0, 1);
        client.connect().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(server.link_to(&SimulatorAddress::coordinator()).is_some());
        assert!(server.parent_link().is_some());

        let missing = server.submit(SimulatorAddress::agent(9), ping()).await;
        assert!(matches!(missing, Err(TransportError::Unreachable(_))));
    }
}

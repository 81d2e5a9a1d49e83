//! Messages travelling towards the coordinator.
//!
//! Agents and workers never dial their parent. The parent dials them, and
//! the accepted link is reused in the reverse direction for failures,
//! statistics and forwarded replies.

use crate::codec::OperationCodec;
use crate::operation::Operation;
use gridbench_env::{
    ResponseFuture, ServerConnector, SimulatorAddress, SimulatorMessage, TransportError,
};
use parking_lot::RwLock;
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

/// Sends messages over the link accepted from the parent.
pub struct Upstream {
    local: SimulatorAddress,
    codec: OperationCodec,
    server: RwLock<Weak<ServerConnector>>,
}

impl Upstream {
    pub fn new(local: SimulatorAddress, codec: OperationCodec) -> Self {
        Self {
            local,
            codec,
            server: RwLock::new(Weak::new()),
        }
    }

    /// Connects the upstream to the server that accepts the parent's link.
    ///
    /// Held weakly: the server owns the processor that owns this upstream.
    pub fn attach(&self, server: &Arc<ServerConnector>) {
        *self.server.write() = Arc::downgrade(server);
    }

    /// True once the parent has connected.
    pub fn is_connected(&self) -> bool {
        self.server
            .read()
            .upgrade()
            .and_then(|server| server.parent_link())
            .is_some()
    }

    /// Forwards an already encoded message unchanged.
    pub fn submit(&self, message: SimulatorMessage) -> ResponseFuture {
        let link = self.server.read().upgrade().and_then(|server| server.parent_link());
        match link {
            Some(link) => link.submit(message),
            None => {
                let parent = self.local.parent().unwrap_or(self.local);
                debug!(local = %self.local, destination = %message.destination, "No parent link");
                ResponseFuture::failed(parent, TransportError::Unreachable(parent))
            }
        }
    }

    /// Sends an operation from this endpoint to the coordinator.
    pub fn send(&self, operation: &Operation) -> ResponseFuture {
        let coordinator = SimulatorAddress::coordinator();
        match self.codec.message(coordinator, self.local, operation) {
            Ok(message) => self.submit(message),
            Err(e) => ResponseFuture::failed(coordinator, TransportError::Codec(e.to_string())),
        }
    }

    /// Sends an operation without waiting for the reply; problems are logged.
    pub fn notify(&self, operation: Operation) {
        let kind = operation.kind();
        let future = self.send(&operation);
        let local = self.local;
        tokio::spawn(async move {
            match future.await {
                Ok(response) if response.is_success() => {}
                Ok(response) => {
                    warn!(local = %local, operation = %kind, response = ?response.first_failure(), "Parent rejected report")
                }
                Err(e) => warn!(local = %local, operation = %kind, error = %e, "Could not deliver report"),
            }
        });
    }
}

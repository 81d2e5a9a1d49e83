//! Framed, bidirectional message link over any byte stream.
//!
//! A [`Link`] owns one connection between two endpoints. Both sides may submit
//! messages and both sides receive messages through their [`MessageHandler`].
//!
//! ```text
//!  local                                   remote
//!    |-- submit(msg) --> [outbound queue] --> writer --> reader --> handler.handle(msg, promise)
//!    |<-- ResponseFuture <-- pending map <-- reader <-- writer <-- promise.answer(..)
//! ```
//!
//! Each link has exactly one outbound queue drained by one writer task, so
//! delivery is FIFO per link. When the connection drops, every outstanding
//! [`ResponseFuture`] completes with [`TransportError::Disconnected`].

use crate::address::SimulatorAddress;
use crate::error::TransportError;
use crate::types::{Frame, Response, ResponseType, SimulatorMessage};

use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, trace, warn};

/// Upper bound for a single frame on the wire.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Byte stream a link can run over (TCP socket, in-memory duplex, ...).
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Boxed stream handed out by dialers and listeners.
pub type BoxedStream = Box<dyn AsyncStream>;

/// Tells the link which operation type ids are known.
///
/// Messages carrying an unregistered id are answered with
/// [`ResponseType::UnknownOperation`] and never reach the handler.
pub trait WireSchema: Send + Sync + 'static {
    fn is_registered(&self, operation_type: u16) -> bool;
}

/// Receives messages arriving on a link.
pub trait MessageHandler: Send + Sync + 'static {
    /// Handles an inbound message.
    ///
    /// Called on the link's reader task, so it must not block. Work that
    /// waits on anything is spawned and answered later through `promise`.
    fn handle(&self, message: SimulatorMessage, promise: Promise);

    /// Called once when a link towards `peer` closes.
    fn on_disconnect(&self, _peer: SimulatorAddress) {}
}

type PendingMap = HashMap<u64, oneshot::Sender<Result<Response, TransportError>>>;

/// Handle used to answer an inbound message out of line.
///
/// Dropping a promise without answering sends an
/// `ExceptionDuringOperationExecution` response so the caller never hangs.
pub struct Promise {
    message_id: u64,
    local: SimulatorAddress,
    destination: SimulatorAddress,
    outbound: Option<mpsc::UnboundedSender<Frame>>,
}

impl Promise {
    fn new(
        message_id: u64,
        local: SimulatorAddress,
        destination: SimulatorAddress,
        outbound: mpsc::UnboundedSender<Frame>,
    ) -> Self {
        Self {
            message_id,
            local,
            destination,
            outbound: Some(outbound),
        }
    }

    /// Creates a promise whose answer is delivered to a local channel.
    ///
    /// Used when a process hands a message to its own processor without a
    /// network hop.
    pub fn detached(
        local: SimulatorAddress,
        destination: SimulatorAddress,
    ) -> (Self, mpsc::UnboundedReceiver<Frame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(0, local, destination, tx), rx)
    }

    /// Id of the message this promise answers.
    pub fn message_id(&self) -> u64 {
        self.message_id
    }

    /// Destination the answered message was addressed to.
    pub fn destination(&self) -> SimulatorAddress {
        self.destination
    }

    /// Sends the response. Id and source are filled in by the promise.
    pub fn answer(mut self, mut response: Response) {
        response.message_id = self.message_id;
        response.source = self.local;
        if let Some(outbound) = self.outbound.take() {
            if outbound.send(Frame::Response(response)).is_err() {
                debug!(message_id = self.message_id, "Link closed before response could be sent");
            }
        }
    }

    /// Answers with a single part for `address`.
    pub fn answer_with(
        self,
        address: SimulatorAddress,
        response_type: ResponseType,
        payload: Option<String>,
    ) {
        let response = Response::single(self.message_id, self.local, address, response_type, payload);
        self.answer(response);
    }

    /// Answers with a single part for the message's own destination.
    pub fn answer_type(self, response_type: ResponseType, payload: Option<String>) {
        let address = self.destination;
        self.answer_with(address, response_type, payload);
    }
}

impl Drop for Promise {
    fn drop(&mut self) {
        if let Some(outbound) = self.outbound.take() {
            warn!(message_id = self.message_id, "Promise dropped without an answer");
            let response = Response::single(
                self.message_id,
                self.local,
                self.destination,
                ResponseType::ExceptionDuringOperationExecution,
                Some("request was dropped without an answer".to_string()),
            );
            let _ = outbound.send(Frame::Response(response));
        }
    }
}

enum FutureState {
    Waiting(oneshot::Receiver<Result<Response, TransportError>>),
    Ready(Option<Result<Response, TransportError>>),
}

/// Completion handle for a submitted message.
///
/// Await it, poll it with [`ResponseFuture::try_get`], or bound the wait
/// with [`ResponseFuture::get_timeout`]. It always completes: with the
/// response, or with the transport error that made a response impossible.
pub struct ResponseFuture {
    peer: SimulatorAddress,
    state: FutureState,
    /// Pending-map entry to release when the caller gives up waiting.
    registration: Option<(Weak<LinkShared>, u64)>,
}

impl ResponseFuture {
    /// Creates a future that is already complete.
    pub fn ready(peer: SimulatorAddress, result: Result<Response, TransportError>) -> Self {
        Self {
            peer,
            state: FutureState::Ready(Some(result)),
            registration: None,
        }
    }

    /// Creates a future that is already failed.
    pub fn failed(peer: SimulatorAddress, error: TransportError) -> Self {
        Self::ready(peer, Err(error))
    }

    /// The endpoint the message was sent to.
    pub fn peer(&self) -> SimulatorAddress {
        self.peer
    }

    /// Returns the result if it is available, without waiting.
    pub fn try_get(&mut self) -> Option<Result<Response, TransportError>> {
        match &mut self.state {
            FutureState::Ready(result) => result.take(),
            FutureState::Waiting(rx) => match rx.try_recv() {
                Ok(result) => {
                    self.state = FutureState::Ready(None);
                    Some(result)
                }
                Err(oneshot::error::TryRecvError::Empty) => None,
                Err(oneshot::error::TryRecvError::Closed) => {
                    self.state = FutureState::Ready(None);
                    Some(Err(TransportError::disconnected(self.peer, "link dropped")))
                }
            },
        }
    }

    /// Waits for the response for at most `timeout`.
    ///
    /// On expiry the request is forgotten by the link; a late answer is
    /// dropped by the reader like any unknown message id.
    pub async fn get_timeout(mut self, timeout: Duration) -> Result<Response, TransportError> {
        let registration = self.registration.take();
        match tokio::time::timeout(timeout, self).await {
            Ok(result) => result,
            Err(_) => {
                if let Some((shared, message_id)) = registration {
                    if let Some(shared) = shared.upgrade() {
                        shared.pending.lock().remove(&message_id);
                    }
                }
                Err(TransportError::Timeout(timeout.as_millis() as u64))
            }
        }
    }
}

impl Future for ResponseFuture {
    type Output = Result<Response, TransportError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let peer = this.peer;
        match &mut this.state {
            FutureState::Ready(result) => Poll::Ready(
                result
                    .take()
                    .unwrap_or(Err(TransportError::Closed)),
            ),
            FutureState::Waiting(rx) => match Pin::new(rx).poll(cx) {
                Poll::Pending => Poll::Pending,
                Poll::Ready(Ok(result)) => Poll::Ready(result),
                Poll::Ready(Err(_)) => {
                    Poll::Ready(Err(TransportError::disconnected(peer, "link dropped")))
                }
            },
        }
    }
}

struct LinkShared {
    remote: SimulatorAddress,
    connected: AtomicBool,
    pending: Mutex<PendingMap>,
}

impl LinkShared {
    /// Marks the link dead and fails everything still waiting on it.
    fn fail_pending(&self, reason: &str) {
        let drained: Vec<_> = {
            let mut pending = self.pending.lock();
            self.connected.store(false, Ordering::SeqCst);
            pending.drain().collect()
        };
        if !drained.is_empty() {
            debug!(peer = %self.remote, count = drained.len(), "Failing outstanding requests");
        }
        for (_, tx) in drained {
            let _ = tx.send(Err(TransportError::disconnected(self.remote, reason)));
        }
    }
}

/// One established connection between two endpoints.
pub struct Link {
    local: SimulatorAddress,
    shared: Arc<LinkShared>,
    outbound: mpsc::UnboundedSender<Frame>,
    next_message_id: AtomicU64,
    shutdown: watch::Sender<bool>,
}

impl Link {
    /// Establishes a link as the dialing side; sends `Hello` first.
    pub async fn dial<S: AsyncStream>(
        stream: S,
        local: SimulatorAddress,
        remote: SimulatorAddress,
        handler: Arc<dyn MessageHandler>,
        schema: Arc<dyn WireSchema>,
    ) -> Result<Arc<Link>, TransportError> {
        let (reader, mut writer) = tokio::io::split(stream);
        write_frame(&mut writer, &Frame::Hello { address: local }).await?;
        Ok(Self::start(reader, writer, local, remote, handler, schema))
    }

    /// Establishes a link as the accepting side; waits for `Hello`.
    pub async fn accept<S: AsyncStream>(
        stream: S,
        local: SimulatorAddress,
        handler: Arc<dyn MessageHandler>,
        schema: Arc<dyn WireSchema>,
    ) -> Result<Arc<Link>, TransportError> {
        let (mut reader, writer) = tokio::io::split(stream);
        let remote = match read_frame(&mut reader).await? {
            Some(Frame::Hello { address }) => address,
            Some(other) => {
                return Err(TransportError::Codec(format!(
                    "expected Hello as first frame, got {:?}",
                    other
                )))
            }
            None => return Err(TransportError::Io("connection closed before Hello".to_string())),
        };
        Ok(Self::start(reader, writer, local, remote, handler, schema))
    }

    fn start<R, W>(
        reader: R,
        writer: W,
        local: SimulatorAddress,
        remote: SimulatorAddress,
        handler: Arc<dyn MessageHandler>,
        schema: Arc<dyn WireSchema>,
    ) -> Arc<Link>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shared = Arc::new(LinkShared {
            remote,
            connected: AtomicBool::new(true),
            pending: Mutex::new(HashMap::new()),
        });

        tokio::spawn(writer_loop(
            writer,
            outbound_rx,
            shutdown_rx.clone(),
            Arc::clone(&shared),
        ));
        tokio::spawn(reader_loop(
            reader,
            local,
            outbound_tx.clone(),
            shutdown_rx,
            Arc::clone(&shared),
            handler,
            schema,
        ));

        debug!(local = %local, remote = %remote, "Link established");

        Arc::new(Link {
            local,
            shared,
            outbound: outbound_tx,
            next_message_id: AtomicU64::new(1),
            shutdown: shutdown_tx,
        })
    }

    /// This side's address.
    pub fn local(&self) -> SimulatorAddress {
        self.local
    }

    /// The other side's address (as announced in its `Hello`, or dialed).
    pub fn remote(&self) -> SimulatorAddress {
        self.shared.remote
    }

    /// True until the connection drops or [`Link::close`] is called.
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// Number of submitted messages still waiting for a response.
    pub fn pending_count(&self) -> usize {
        self.shared.pending.lock().len()
    }

    /// Enqueues a message and returns a future for its response.
    ///
    /// Never blocks. If the link is down the future is already failed.
    pub fn submit(&self, mut message: SimulatorMessage) -> ResponseFuture {
        let remote = self.shared.remote;
        let message_id = self.next_message_id.fetch_add(1, Ordering::Relaxed);
        message.message_id = message_id;

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.shared.pending.lock();
            if !self.shared.connected.load(Ordering::SeqCst) {
                return ResponseFuture::failed(
                    remote,
                    TransportError::disconnected(remote, "link is not connected"),
                );
            }
            pending.insert(message_id, tx);
        }

        trace!(
            remote = %remote,
            message_id,
            destination = %message.destination,
            operation_type = message.operation_type,
            "Submitting message"
        );
        if self.outbound.send(Frame::Message(message)).is_err() {
            self.shared.pending.lock().remove(&message_id);
            return ResponseFuture::failed(
                remote,
                TransportError::disconnected(remote, "writer task has stopped"),
            );
        }

        ResponseFuture {
            peer: remote,
            state: FutureState::Waiting(rx),
            registration: Some((Arc::downgrade(&self.shared), message_id)),
        }
    }

    /// Closes the link; outstanding futures fail.
    pub fn close(&self) {
        let _ = self.shutdown.send(true);
        self.shared.fail_pending("link closed locally");
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

async fn writer_loop<W>(
    mut writer: W,
    mut outbound: mpsc::UnboundedReceiver<Frame>,
    mut shutdown: watch::Receiver<bool>,
    shared: Arc<LinkShared>,
) where
    W: AsyncWrite + Send + Unpin + 'static,
{
    loop {
        tokio::select! {
            frame = outbound.recv() => {
                let Some(frame) = frame else { break };
                if let Err(e) = write_frame(&mut writer, &frame).await {
                    warn!(peer = %shared.remote, error = %e, "Write failed, closing link");
                    shared.fail_pending(&e.to_string());
                    break;
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    let _ = writer.shutdown().await;
}

async fn reader_loop<R>(
    mut reader: R,
    local: SimulatorAddress,
    outbound: mpsc::UnboundedSender<Frame>,
    mut shutdown: watch::Receiver<bool>,
    shared: Arc<LinkShared>,
    handler: Arc<dyn MessageHandler>,
    schema: Arc<dyn WireSchema>,
) where
    R: AsyncRead + Send + Unpin + 'static,
{
    let reason = loop {
        let frame = tokio::select! {
            frame = read_frame(&mut reader) => frame,
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break "link closed locally".to_string();
                }
                continue;
            }
        };

        match frame {
            Ok(Some(Frame::Message(message))) => {
                let promise = Promise::new(message.message_id, local, message.destination, outbound.clone());
                if !schema.is_registered(message.operation_type) {
                    warn!(
                        operation_type = message.operation_type,
                        source = %message.source,
                        "Dropping message with unregistered operation type"
                    );
                    promise.answer_type(
                        ResponseType::UnknownOperation,
                        Some(format!("operation type {} is not registered", message.operation_type)),
                    );
                    continue;
                }
                handler.handle(message, promise);
            }
            Ok(Some(Frame::Response(response))) => {
                let waiter = shared.pending.lock().remove(&response.message_id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(Ok(response));
                    }
                    None => trace!(message_id = response.message_id, "Response without waiter"),
                }
            }
            Ok(Some(Frame::Hello { address })) => {
                debug!(address = %address, "Ignoring repeated Hello");
            }
            Ok(None) => break "connection closed by peer".to_string(),
            Err(e) => break e.to_string(),
        }
    };

    debug!(local = %local, peer = %shared.remote, reason = %reason, "Link closed");
    shared.fail_pending(&reason);
    handler.on_disconnect(shared.remote);
}

/// Writes one length-prefixed frame.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    let bytes = serde_json::to_vec(frame)?;
    if bytes.len() > MAX_FRAME_SIZE {
        return Err(TransportError::Codec(format!(
            "frame of {} bytes exceeds limit of {}",
            bytes.len(),
            MAX_FRAME_SIZE
        )));
    }
    writer.write_u32(bytes.len() as u32).await?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one length-prefixed frame; `Ok(None)` on a clean end of stream.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Frame>, TransportError>
where
    R: AsyncRead + Unpin,
{
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if len > MAX_FRAME_SIZE {
        return Err(TransportError::Codec(format!(
            "incoming frame of {} bytes exceeds limit of {}",
            len, MAX_FRAME_SIZE
        )));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(Some(serde_json::from_slice(&buf)?))
}

//! Agent runtime: starts workers and routes messages between them and the
//! coordinator.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        AgentProcessor                        │
//! │                                                              │
//! │  from coordinator ──▶ next_hop()                             │
//! │                        ├─ Local     Ping, InitSession,       │
//! │                        │            CreateWorker, KillWorker │
//! │                        ├─ Children  per-worker FIFO queue ──▶│── worker links
//! │                        └─ Parent    Upstream ───────────────▶│── coordinator link
//! │                                                              │
//! │  worker monitor: polls launched processes for unexpected exit│
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! The same processor handles both directions: it is the handler of the
//! link accepted from the coordinator and of every link it dials to a worker.
//! Nothing that waits runs on a link's reader task; control operations and
//! forwarded replies are completed on spawned tasks.

use crate::codec::OperationCodec;
use crate::failure::{FailureMessage, FailureType};
use crate::launcher::{WorkerLauncher, WorkerProcess, WorkerProcessSettings};
use crate::operation::{Operation, OperationKind};
use crate::routing::{next_hop, not_found, ChildSelector, NextHop};
use crate::schema::MessageSchema;
use crate::upstream::Upstream;
use crate::worker_runtime::log_remote;
use futures::future::join_all;
use gridbench_env::{
    AddressLevel, ClientConnector, Listener, MessageHandler, Promise, Response, ResponseType,
    ServerConnector, SimulatorAddress, SimulatorMessage, TransportConfig, TransportError,
};
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Configuration for an agent.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// How long a worker may take to answer a forwarded message (default: 30000)
    pub forward_timeout_ms: u64,

    /// How long a worker may take to start listening (default: 60000)
    pub worker_startup_timeout_ms: u64,

    /// Interval between worker liveness checks (default: 500)
    pub monitor_interval_ms: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            forward_timeout_ms: 30_000,
            worker_startup_timeout_ms: 60_000,
            monitor_interval_ms: 500,
        }
    }
}

impl AgentConfig {
    pub fn with_forward_timeout(mut self, timeout: Duration) -> Self {
        self.forward_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_monitor_interval(mut self, interval: Duration) -> Self {
        self.monitor_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn forward_timeout(&self) -> Duration {
        Duration::from_millis(self.forward_timeout_ms)
    }

    pub fn worker_startup_timeout(&self) -> Duration {
        Duration::from_millis(self.worker_startup_timeout_ms)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms.max(1))
    }
}

/// A message queued for one worker, with the channel its reply goes to.
struct Forward {
    message: SimulatorMessage,
    reply: oneshot::Sender<Result<Response, TransportError>>,
}

/// A worker started by this agent.
struct WorkerHandle {
    address: SimulatorAddress,
    connector: Arc<ClientConnector>,
    queue: mpsc::UnboundedSender<Forward>,
    process: Mutex<Box<dyn WorkerProcess>>,
    /// Set once the worker was told to terminate; its exit is then expected
    terminating: AtomicBool,
}

/// Handles every message arriving at an agent.
pub struct AgentProcessor {
    address: SimulatorAddress,
    codec: OperationCodec,
    schema: Arc<MessageSchema>,
    config: AgentConfig,
    transport: TransportConfig,
    launcher: Arc<dyn WorkerLauncher>,
    upstream: Arc<Upstream>,
    workers: RwLock<BTreeMap<u32, Arc<WorkerHandle>>>,
    session_id: RwLock<Option<String>>,
    me: Weak<AgentProcessor>,
}

impl AgentProcessor {
    pub fn new(
        address: SimulatorAddress,
        schema: Arc<MessageSchema>,
        config: AgentConfig,
        transport: TransportConfig,
        launcher: Arc<dyn WorkerLauncher>,
    ) -> Arc<Self> {
        let codec = OperationCodec::new(Arc::clone(&schema));
        Arc::new_cyclic(|me| Self {
            address,
            upstream: Arc::new(Upstream::new(address, codec.clone())),
            codec,
            schema,
            config,
            transport,
            launcher,
            workers: RwLock::new(BTreeMap::new()),
            session_id: RwLock::new(None),
            me: me.clone(),
        })
    }

    pub fn address(&self) -> SimulatorAddress {
        self.address
    }

    pub fn upstream(&self) -> &Arc<Upstream> {
        &self.upstream
    }

    pub fn session_id(&self) -> Option<String> {
        self.session_id.read().clone()
    }

    /// Addresses of the workers currently alive.
    pub fn worker_addresses(&self) -> Vec<SimulatorAddress> {
        self.workers.read().values().map(|w| w.address).collect()
    }

    fn handle_of(&self, worker_index: u32) -> Option<Arc<WorkerHandle>> {
        self.workers.read().get(&worker_index).cloned()
    }

    // =========================================================================
    // AGENT LEVEL
    // =========================================================================

    fn process_local(&self, operation: Operation, promise: Promise) {
        let address = self.address;
        match operation {
            Operation::Ping(ping) => {
                debug!(agent = %address, message = %ping.message, "Ping");
                promise.answer_with(address, ResponseType::Success, Some(address.to_string()));
            }
            Operation::Log(log) => {
                log_remote(address, log.level, &log.message);
                promise.answer_with(address, ResponseType::Success, None);
            }
            Operation::InitSession(init) => {
                info!(agent = %address, session_id = %init.session_id, "Joined session");
                *self.session_id.write() = Some(init.session_id);
                promise.answer_with(address, ResponseType::Success, None);
            }
            Operation::CreateWorker(create) => {
                let Some(this) = self.me.upgrade() else {
                    promise.answer_with(address, ResponseType::ExceptionDuringOperationExecution, None);
                    return;
                };
                tokio::spawn(async move {
                    let response = this.create_workers(create.workers).await;
                    promise.answer(response);
                });
            }
            Operation::KillWorker(kill) => match self.handle_of(kill.worker_index) {
                Some(handle) => {
                    warn!(worker = %handle.address, "Killing worker process");
                    handle.process.lock().kill();
                    promise.answer_with(handle.address, ResponseType::Success, None);
                }
                None => {
                    let worker = SimulatorAddress::worker(address.agent_index(), kill.worker_index);
                    promise.answer_with(worker, ResponseType::FailureWorkerNotFound, None);
                }
            },
            other => {
                warn!(agent = %address, operation = %other.kind(), "Operation is not handled by agents");
                promise.answer_with(
                    address,
                    ResponseType::UnknownOperation,
                    Some(format!("{} is not handled by agents", other.kind())),
                );
            }
        }
    }

    /// Launches workers one by one and connects to each of them.
    async fn create_workers(&self, workers: Vec<WorkerProcessSettings>) -> Response {
        let mut response = Response::new(0, self.address);
        for settings in workers {
            let address = SimulatorAddress::worker(self.address.agent_index(), settings.worker_index);
            match self.create_worker(address, &settings).await {
                Ok(()) => response.add_part(address, ResponseType::Success, None),
                Err(reason) => {
                    error!(worker = %address, reason = %reason, "Could not create worker");
                    let failure = FailureMessage::new(FailureType::WorkerCreateError, "Worker could not be created")
                        .with_worker(address)
                        .with_cause(reason.clone());
                    self.upstream.notify(Operation::failure(failure));
                    response.add_part(address, ResponseType::ExceptionDuringOperationExecution, Some(reason));
                }
            }
        }
        response
    }

    async fn create_worker(
        &self,
        address: SimulatorAddress,
        settings: &WorkerProcessSettings,
    ) -> Result<(), String> {
        if self.handle_of(address.worker_index()).is_some() {
            return Err(format!("{} is already running", address));
        }
        let handler: Arc<dyn MessageHandler> = match self.me.upgrade() {
            Some(this) => this,
            None => return Err("agent is shutting down".to_string()),
        };

        let launched = self
            .launcher
            .launch(address, settings)
            .await
            .map_err(|e| e.to_string())?;
        let mut process = launched.process;
        let connector = Arc::new(ClientConnector::new(
            self.address,
            address,
            launched.dialer,
            handler,
            self.schema.clone(),
            self.transport.clone(),
        ));
        if let Err(e) = connector.connect().await {
            process.kill();
            return Err(e.to_string());
        }

        let (queue, receiver) = mpsc::unbounded_channel();
        tokio::spawn(forward_loop(Arc::clone(&connector), receiver));
        info!(worker = %address, process = %process.id(), worker_type = %settings.worker_type, "Worker connected");

        let handle = Arc::new(WorkerHandle {
            address,
            connector,
            queue,
            process: Mutex::new(process),
            terminating: AtomicBool::new(false),
        });
        self.workers.write().insert(address.worker_index(), handle);
        Ok(())
    }

    // =========================================================================
    // TOWARDS WORKERS
    // =========================================================================

    fn forward_down(&self, selector: ChildSelector, message: SimulatorMessage, kind: OperationKind, promise: Promise) {
        let targets: Vec<Arc<WorkerHandle>> = self
            .workers
            .read()
            .iter()
            .filter(|(index, _)| selector.matches(**index))
            .map(|(_, handle)| Arc::clone(handle))
            .collect();

        if targets.is_empty() {
            let destination = promise.destination();
            promise.answer_with(
                destination,
                not_found(AddressLevel::Worker),
                Some(format!("no worker matching {} on {}", destination, self.address)),
            );
            return;
        }

        let timeout = self.config.forward_timeout();
        let mut pending = Vec::with_capacity(targets.len());
        for handle in targets {
            if kind == OperationKind::TerminateWorker {
                handle.terminating.store(true, Ordering::SeqCst);
            }
            let (reply, receiver) = oneshot::channel();
            let queued = handle.queue.send(Forward {
                message: message.clone(),
                reply,
            });
            if queued.is_err() {
                debug!(worker = %handle.address, "Forward queue closed");
            }
            pending.push((handle.address, receiver));
        }

        let upstream = Arc::clone(&self.upstream);
        let local = self.address;
        tokio::spawn(async move {
            let waits = pending.into_iter().map(|(worker, receiver)| async move {
                let result = match tokio::time::timeout(timeout, receiver).await {
                    Ok(Ok(result)) => result,
                    Ok(Err(_)) => Err(TransportError::disconnected(worker, "forward queue closed")),
                    Err(_) => Err(TransportError::Timeout(timeout.as_millis() as u64)),
                };
                (worker, result)
            });
            let mut response = Response::new(0, local);
            for (worker, result) in join_all(waits).await {
                match result {
                    Ok(reply) => response.merge(reply),
                    Err(e) => {
                        warn!(worker = %worker, operation = %kind, error = %e, "Worker did not answer");
                        let failure_type = match e {
                            TransportError::Timeout(_) => FailureType::WorkerTimeout,
                            _ => FailureType::NetworkError,
                        };
                        let failure = FailureMessage::new(
                            failure_type,
                            format!("{} could not be delivered to worker", kind),
                        )
                        .with_worker(worker)
                        .with_cause(e.to_string());
                        upstream.notify(Operation::failure(failure));
                        response.add_part(
                            worker,
                            ResponseType::ExceptionDuringOperationExecution,
                            Some(e.to_string()),
                        );
                    }
                }
            }
            promise.answer(response);
        });
    }

    // =========================================================================
    // TOWARDS THE COORDINATOR
    // =========================================================================

    fn forward_up(&self, message: SimulatorMessage, promise: Promise) {
        let future = self.upstream.submit(message);
        let timeout = self.transport.response_timeout();
        tokio::spawn(async move {
            match future.get_timeout(timeout).await {
                Ok(response) => promise.answer(response),
                Err(e) => promise.answer_type(
                    ResponseType::ExceptionDuringOperationExecution,
                    Some(e.to_string()),
                ),
            }
        });
    }

    // =========================================================================
    // MONITORING
    // =========================================================================

    /// Checks every worker process once; returns the number that exited.
    pub fn check_workers(&self) -> usize {
        let handles: Vec<Arc<WorkerHandle>> = self.workers.read().values().cloned().collect();
        let mut exited = 0;
        for handle in handles {
            let Some(exit) = handle.process.lock().try_exit() else {
                continue;
            };
            exited += 1;
            self.workers.write().remove(&handle.address.worker_index());
            let connector = Arc::clone(&handle.connector);
            tokio::spawn(async move { connector.close().await });

            if handle.terminating.load(Ordering::SeqCst) {
                info!(worker = %handle.address, code = ?exit.code, "Worker exited");
                continue;
            }
            let failure_type = if exit.is_normal() {
                FailureType::WorkerNormalExit
            } else {
                FailureType::WorkerAbnormalExit
            };
            error!(worker = %handle.address, code = ?exit.code, "Worker exited unexpectedly");
            let failure = FailureMessage::new(
                failure_type,
                format!("Worker exited with code {:?}", exit.code),
            )
            .with_worker(handle.address)
            .with_cause(format!("process {} exited", handle.process.lock().id()));
            self.upstream.notify(Operation::failure(failure));
        }
        exited
    }

    /// Terminates every worker process.
    pub fn kill_workers(&self) {
        let handles: Vec<Arc<WorkerHandle>> = self.workers.write().values().cloned().collect();
        for handle in handles {
            handle.terminating.store(true, Ordering::SeqCst);
            handle.process.lock().kill();
        }
    }
}

impl MessageHandler for AgentProcessor {
    fn handle(&self, message: SimulatorMessage, promise: Promise) {
        let operation = match self.codec.decode_message(&message) {
            Ok(operation) => operation,
            Err(e) => {
                warn!(agent = %self.address, error = %e, "Could not decode message");
                promise.answer_type(ResponseType::ExceptionDuringOperationExecution, Some(e.to_string()));
                return;
            }
        };

        match next_hop(self.address, message.destination) {
            Ok(NextHop::Local) => self.process_local(operation, promise),
            Ok(NextHop::Children(selector)) => {
                self.forward_down(selector, message, operation.kind(), promise)
            }
            Ok(NextHop::Parent) => self.forward_up(message, promise),
            Err(e) => {
                error!(agent = %self.address, error = %e, "Unroutable message");
                promise.answer_type(ResponseType::ExceptionDuringOperationExecution, Some(e.to_string()));
            }
        }
    }

    fn on_disconnect(&self, peer: SimulatorAddress) {
        if peer.level() == AddressLevel::Worker {
            debug!(agent = %self.address, worker = %peer, "Worker link closed");
        } else {
            warn!(agent = %self.address, peer = %peer, "Coordinator link closed");
        }
    }
}

/// Delivers queued messages to one worker in submission order.
async fn forward_loop(connector: Arc<ClientConnector>, mut queue: mpsc::UnboundedReceiver<Forward>) {
    while let Some(forward) = queue.recv().await {
        let future = connector.submit(forward.message).await;
        tokio::spawn(async move {
            let _ = forward.reply.send(future.await);
        });
    }
    debug!(worker = %connector.remote(), "Forward loop finished");
}

// =============================================================================
// RUNTIME
// =============================================================================

/// A running agent: processor, accept loop and worker monitor.
pub struct AgentRuntime {
    processor: Arc<AgentProcessor>,
    server: Arc<ServerConnector>,
    accept_task: JoinHandle<()>,
    monitor_task: JoinHandle<()>,
}

impl AgentRuntime {
    /// Starts serving on `listener`. Must be called inside a tokio runtime.
    pub fn start(
        address: SimulatorAddress,
        config: AgentConfig,
        transport: TransportConfig,
        schema: Arc<MessageSchema>,
        launcher: Arc<dyn WorkerLauncher>,
        listener: Arc<dyn Listener>,
    ) -> Self {
        let interval = config.monitor_interval();
        let processor = AgentProcessor::new(address, Arc::clone(&schema), config, transport, launcher);
        let server = ServerConnector::new(address, processor.clone(), schema);
        processor.upstream().attach(&server);
        let accept_task = server.serve(listener);
        let monitor_task = tokio::spawn(monitor_loop(Arc::downgrade(&processor), interval));
        info!(agent = %address, "Agent started");

        Self {
            processor,
            server,
            accept_task,
            monitor_task,
        }
    }

    pub fn address(&self) -> SimulatorAddress {
        self.processor.address()
    }

    pub fn processor(&self) -> &Arc<AgentProcessor> {
        &self.processor
    }

    pub fn server(&self) -> &Arc<ServerConnector> {
        &self.server
    }

    /// Kills the workers and closes every link.
    pub fn shutdown(&self) {
        self.monitor_task.abort();
        self.accept_task.abort();
        self.processor.kill_workers();
        self.server.close();
        info!(agent = %self.address(), "Agent stopped");
    }
}

async fn monitor_loop(processor: Weak<AgentProcessor>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        let Some(processor) = processor.upgrade() else { break };
        processor.check_workers();
    }
}

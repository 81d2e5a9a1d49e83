//! Coordinator: owns the registry, sends commands and aggregates reports.
//!
//! ```text
//!                    ┌──────────────────────────────┐
//!   run_test() ────▶ │          Coordinator         │
//!                    │  registry   failures   perf  │
//!                    └──────┬────────────────▲──────┘
//!                 commands  │                │ Failure / PerformanceStats /
//!                           ▼                │ IntervalStats
//!                 ClientConnector per agent ─┘ (CoordinatorProcessor)
//! ```
//!
//! The coordinator dials every agent. Commands flow down those links;
//! reports from agents and workers come back up the same links and are
//! handled by the [`CoordinatorProcessor`].

use crate::codec::{CodecError, OperationCodec};
use crate::failure::{FailureCollector, FailureMessage};
use crate::launcher::{WorkerProcessSettings, WorkerType};
use crate::operation::{CreateWorkerOperation, InitSessionOperation, Operation};
use crate::performance::PerformanceCollector;
use crate::phase::TestPhase;
use crate::registry::{ComponentRegistry, RegistryError, TestStatus};
use crate::routing::{next_hop, NextHop, RoutingError};
use crate::schema::MessageSchema;
use crate::target::{TargetError, TargetExpression};
use crate::test_case::TestCase;
use crate::test_runner::{TestCaseRunner, TestOutcome};
use crate::worker_runtime::log_remote;
use futures::future::join_all;
use gridbench_env::{
    ClientConnector, ConnectError, Dialer, Frame, MessageHandler, Promise, Response, ResponseType,
    SimulatorAddress, SimulatorMessage, TransportConfig, TransportError,
};
use parking_lot::{Mutex, RwLock};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Target(#[from] TargetError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Routing(#[from] RoutingError),

    #[error("{address} answered {response_type}: {reason}")]
    Rejected {
        address: SimulatorAddress,
        response_type: ResponseType,
        reason: String,
    },

    #[error("Test '{test_id}' did not complete {phase} within {timeout_ms} ms")]
    PhaseTimeout {
        test_id: String,
        phase: TestPhase,
        timeout_ms: u64,
    },

    #[error("No workers are registered")]
    NoWorkers,

    #[error("Could not open failure record: {0}")]
    Io(String),
}

impl CoordinatorError {
    /// Turns the first failed part of a response into an error.
    pub fn check(response: Response) -> Result<Response, CoordinatorError> {
        match response.first_failure() {
            Some(part) => Err(CoordinatorError::Rejected {
                address: part.address,
                response_type: part.response_type,
                reason: part.payload.clone().unwrap_or_default(),
            }),
            None if response.parts.is_empty() => Err(CoordinatorError::Rejected {
                address: response.source,
                response_type: ResponseType::ExceptionDuringOperationExecution,
                reason: "empty response".to_string(),
            }),
            None => Ok(response),
        }
    }
}

/// Configuration for the coordinator.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Maximum time a phase may take on all workers (default: 300000)
    pub phase_timeout_ms: u64,

    /// Duration of the RUN phase before it is stopped (default: 60000)
    pub run_duration_ms: u64,

    /// First delay between phase completion polls (default: 10)
    pub poll_initial_backoff_ms: u64,

    /// Upper bound on the delay between polls (default: 1000)
    pub poll_max_backoff_ms: u64,

    /// Directory for the failure record; in memory only if unset
    pub output_dir: Option<PathBuf>,

    /// Seed for random target selection; entropy if unset
    pub seed: Option<u64>,

    /// Session id; generated if unset
    pub session_id: Option<String>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            phase_timeout_ms: 300_000,
            run_duration_ms: 60_000,
            poll_initial_backoff_ms: 10,
            poll_max_backoff_ms: 1000,
            output_dir: None,
            seed: None,
            session_id: None,
        }
    }
}

impl CoordinatorConfig {
    pub fn with_phase_timeout(mut self, timeout: Duration) -> Self {
        self.phase_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_run_duration(mut self, duration: Duration) -> Self {
        self.run_duration_ms = duration.as_millis() as u64;
        self
    }

    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(dir.into());
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn phase_timeout(&self) -> Duration {
        Duration::from_millis(self.phase_timeout_ms)
    }

    pub fn run_duration(&self) -> Duration {
        Duration::from_millis(self.run_duration_ms)
    }

    pub fn poll_initial_backoff(&self) -> Duration {
        Duration::from_millis(self.poll_initial_backoff_ms.max(1))
    }

    pub fn poll_max_backoff(&self) -> Duration {
        Duration::from_millis(self.poll_max_backoff_ms.max(self.poll_initial_backoff_ms).max(1))
    }
}

// =============================================================================
// REPORTS
// =============================================================================

/// Handles messages sent up to the coordinator.
pub struct CoordinatorProcessor {
    codec: OperationCodec,
    registry: Arc<RwLock<ComponentRegistry>>,
    failures: Arc<FailureCollector>,
    performance: Arc<PerformanceCollector>,
}

impl CoordinatorProcessor {
    /// Records a failure; removes the worker from the registry if it is gone.
    pub fn report_failure(&self, failure: FailureMessage) -> u64 {
        let gone = failure
            .worker_address
            .filter(|_| failure.failure_type.is_worker_finished());
        let number = self.failures.report(failure);
        if let Some(worker) = gone {
            if self.registry.write().remove_worker(&worker).is_some() {
                warn!(worker = %worker, "Removed finished worker from registry");
            }
        }
        number
    }
}

impl MessageHandler for CoordinatorProcessor {
    fn handle(&self, message: SimulatorMessage, promise: Promise) {
        let coordinator = SimulatorAddress::coordinator();
        if message.destination != coordinator {
            promise.answer_with(
                message.destination,
                ResponseType::ExceptionDuringOperationExecution,
                Some("the coordinator does not relay messages".to_string()),
            );
            return;
        }
        let operation = match self.codec.decode_message(&message) {
            Ok(operation) => operation,
            Err(e) => {
                warn!(source = %message.source, error = %e, "Could not decode report");
                promise.answer_type(ResponseType::ExceptionDuringOperationExecution, Some(e.to_string()));
                return;
            }
        };

        match operation {
            Operation::Failure(report) => {
                self.report_failure(report.failure);
                promise.answer_type(ResponseType::Success, None);
            }
            Operation::PerformanceStats(report) => {
                self.performance.update(message.source, report.stats);
                promise.answer_type(ResponseType::Success, None);
            }
            Operation::IntervalStats(report) => {
                self.performance.record_intervals(report.stats);
                promise.answer_type(ResponseType::Success, None);
            }
            Operation::Log(log) => {
                log_remote(message.source, log.level, &log.message);
                promise.answer_type(ResponseType::Success, None);
            }
            Operation::Ping(ping) => {
                debug!(source = %message.source, message = %ping.message, "Ping");
                promise.answer_type(ResponseType::Success, Some(coordinator.to_string()));
            }
            other => {
                warn!(source = %message.source, operation = %other.kind(), "Operation is not handled by the coordinator");
                promise.answer_type(
                    ResponseType::UnknownOperation,
                    Some(format!("{} is not handled by the coordinator", other.kind())),
                );
            }
        }
    }

    fn on_disconnect(&self, peer: SimulatorAddress) {
        warn!(agent = %peer, "Agent link closed");
    }
}

// =============================================================================
// COORDINATOR
// =============================================================================

/// Drives a benchmark session.
pub struct Coordinator {
    config: CoordinatorConfig,
    transport: TransportConfig,
    schema: Arc<MessageSchema>,
    codec: OperationCodec,
    session_id: String,
    registry: Arc<RwLock<ComponentRegistry>>,
    agents: RwLock<BTreeMap<u32, Arc<ClientConnector>>>,
    failures: Arc<FailureCollector>,
    performance: Arc<PerformanceCollector>,
    processor: Arc<CoordinatorProcessor>,
    rng: Mutex<ChaCha8Rng>,
}

impl Coordinator {
    pub fn new(
        config: CoordinatorConfig,
        transport: TransportConfig,
        schema: Arc<MessageSchema>,
    ) -> Result<Self, CoordinatorError> {
        let session_id = config
            .session_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().simple().to_string());
        let failures = Arc::new(match &config.output_dir {
            Some(dir) => FailureCollector::with_record_file(dir, &session_id)
                .map_err(|e| CoordinatorError::Io(e.to_string()))?,
            None => FailureCollector::in_memory(),
        });
        let rng = match config.seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_entropy(),
        };
        let codec = OperationCodec::new(Arc::clone(&schema));
        let registry = Arc::new(RwLock::new(ComponentRegistry::new()));
        let performance = Arc::new(PerformanceCollector::new());
        let processor = Arc::new(CoordinatorProcessor {
            codec: codec.clone(),
            registry: Arc::clone(&registry),
            failures: Arc::clone(&failures),
            performance: Arc::clone(&performance),
        });
        info!(session_id = %session_id, "Coordinator created");

        Ok(Self {
            config,
            transport,
            schema,
            codec,
            session_id,
            registry,
            agents: RwLock::new(BTreeMap::new()),
            failures,
            performance,
            processor,
            rng: Mutex::new(rng),
        })
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn failures(&self) -> &Arc<FailureCollector> {
        &self.failures
    }

    pub fn performance(&self) -> &Arc<PerformanceCollector> {
        &self.performance
    }

    pub fn processor(&self) -> &Arc<CoordinatorProcessor> {
        &self.processor
    }

    /// Runs `f` with read access to the registry.
    pub fn with_registry<T>(&self, f: impl FnOnce(&ComponentRegistry) -> T) -> T {
        f(&self.registry.read())
    }

    pub(crate) fn registry(&self) -> &Arc<RwLock<ComponentRegistry>> {
        &self.registry
    }

    pub fn worker_count(&self) -> usize {
        self.registry.read().worker_count()
    }

    pub fn test_status(&self, test_id: &str) -> Option<TestStatus> {
        self.registry.read().test(test_id).map(|t| t.status)
    }

    // -------------------------------------------------------------------------
    // Components
    // -------------------------------------------------------------------------

    /// Registers an agent, connects to it and opens the session on it.
    pub async fn add_agent(
        &self,
        dialer: Arc<dyn Dialer>,
        public_address: impl Into<String>,
        private_address: impl Into<String>,
    ) -> Result<SimulatorAddress, CoordinatorError> {
        let address = self.registry.write().add_agent(public_address, private_address);
        let connector = Arc::new(ClientConnector::new(
            SimulatorAddress::coordinator(),
            address,
            dialer,
            self.processor.clone(),
            self.schema.clone(),
            self.transport.clone(),
        ));
        if let Err(e) = connector.connect().await {
            self.registry.write().remove_agent(&address);
            return Err(e.into());
        }
        self.agents.write().insert(address.agent_index(), connector);

        let init = Operation::InitSession(InitSessionOperation {
            session_id: self.session_id.clone(),
        });
        CoordinatorError::check(self.send(address, &init).await?)?;
        info!(agent = %address, "Agent registered");
        Ok(address)
    }

    /// Starts `count` workers on an agent; returns their addresses.
    pub async fn create_workers(
        &self,
        agent: SimulatorAddress,
        count: usize,
        worker_type: WorkerType,
    ) -> Result<Vec<SimulatorAddress>, CoordinatorError> {
        let settings: Vec<WorkerProcessSettings> = {
            let mut registry = self.registry.write();
            (0..count)
                .map(|_| {
                    registry
                        .next_worker_address(&agent)
                        .map(|address| WorkerProcessSettings::new(address.worker_index(), worker_type))
                })
                .collect::<Result<_, _>>()?
        };
        let create = Operation::CreateWorker(CreateWorkerOperation {
            workers: settings.clone(),
        });
        let response = self.send(agent, &create).await?;

        let mut created = Vec::with_capacity(count);
        {
            let mut registry = self.registry.write();
            for settings in settings {
                let address = SimulatorAddress::worker(agent.agent_index(), settings.worker_index);
                let started = response
                    .part_for(&address)
                    .map(|part| part.response_type.is_success())
                    .unwrap_or(false);
                if started {
                    registry.add_worker(address, settings)?;
                    created.push(address);
                }
            }
        }
        info!(agent = %agent, created = created.len(), requested = count, "Workers started");
        if created.len() < count {
            CoordinatorError::check(response)?;
        }
        Ok(created)
    }

    // -------------------------------------------------------------------------
    // Messaging
    // -------------------------------------------------------------------------

    /// Sends an operation towards `destination` and collects every reply.
    ///
    /// Per-endpoint problems (unknown component, failed delivery) are
    /// reported as failed parts of the response rather than as an error.
    pub async fn send(
        &self,
        destination: SimulatorAddress,
        operation: &Operation,
    ) -> Result<Response, CoordinatorError> {
        let coordinator = SimulatorAddress::coordinator();
        let message = self.codec.message(destination, coordinator, operation)?;

        match next_hop(coordinator, destination)? {
            NextHop::Local => {
                let (promise, mut answers) = Promise::detached(coordinator, destination);
                self.processor.handle(message, promise);
                match answers.recv().await {
                    Some(Frame::Response(response)) => Ok(response),
                    _ => Err(TransportError::Closed.into()),
                }
            }
            NextHop::Children(selector) => {
                let connectors: Vec<Arc<ClientConnector>> = self
                    .agents
                    .read()
                    .iter()
                    .filter(|(index, _)| selector.matches(**index))
                    .map(|(_, connector)| Arc::clone(connector))
                    .collect();
                if connectors.is_empty() {
                    return Ok(Response::single(
                        0,
                        coordinator,
                        destination,
                        ResponseType::FailureAgentNotFound,
                        None,
                    ));
                }

                let timeout = self.transport.response_timeout();
                let deliveries = connectors.into_iter().map(|connector| {
                    let message = message.clone();
                    async move {
                        let agent = connector.remote();
                        (agent, connector.submit(message).await.get_timeout(timeout).await)
                    }
                });
                let mut response = Response::new(0, coordinator);
                for (agent, result) in join_all(deliveries).await {
                    match result {
                        Ok(reply) => response.merge(reply),
                        Err(e) => {
                            warn!(agent = %agent, operation = %operation.kind(), error = %e, "Delivery failed");
                            response.add_part(
                                agent,
                                ResponseType::ExceptionDuringOperationExecution,
                                Some(e.to_string()),
                            );
                        }
                    }
                }
                Ok(response)
            }
            NextHop::Parent => Err(RoutingError::NoParent {
                local: coordinator,
                destination,
            }
            .into()),
        }
    }

    /// Resolves a target expression and sends the operation to every match.
    pub async fn send_to_targets(
        &self,
        targets: &TargetExpression,
        operation: &Operation,
    ) -> Result<Response, CoordinatorError> {
        let addresses = {
            let registry = self.registry.read();
            let mut rng = self.rng.lock();
            targets.resolve(&registry, &mut *rng)?
        };
        debug!(targets = %targets, count = addresses.len(), "Resolved targets");
        let sends = addresses.iter().map(|address| self.send(*address, operation));
        let mut response = Response::new(0, SimulatorAddress::coordinator());
        for result in join_all(sends).await {
            response.merge(result?);
        }
        Ok(response)
    }

    // -------------------------------------------------------------------------
    // Tests
    // -------------------------------------------------------------------------

    /// Runs one test case through every phase on every worker.
    pub async fn run_test(&self, test_case: TestCase) -> Result<TestOutcome, CoordinatorError> {
        TestCaseRunner::new(self, test_case).run().await
    }

    /// Runs one test case with a specific RUN duration.
    pub async fn run_test_for(
        &self,
        test_case: TestCase,
        run_duration: Duration,
    ) -> Result<TestOutcome, CoordinatorError> {
        TestCaseRunner::new(self, test_case)
            .with_run_duration(run_duration)
            .run()
            .await
    }

    /// Runs several test cases in parallel; a failing test does not stop
    /// the others.
    pub async fn run_tests(&self, test_cases: Vec<TestCase>) -> Vec<Result<TestOutcome, CoordinatorError>> {
        join_all(test_cases.into_iter().map(|test_case| self.run_test(test_case))).await
    }

    /// Asks every worker to shut down and forgets them.
    pub async fn terminate_workers(&self) -> Result<(), CoordinatorError> {
        if self.worker_count() == 0 {
            return Ok(());
        }
        let response = self
            .send(SimulatorAddress::ALL_WORKERS, &Operation::terminate_worker(true))
            .await?;
        let mut registry = self.registry.write();
        for part in response.parts.iter().filter(|p| p.response_type.is_success()) {
            registry.remove_worker(&part.address);
        }
        info!(remaining = registry.worker_count(), "Workers terminated");
        Ok(())
    }

    /// Terminates the workers and closes every agent link.
    pub async fn shutdown(&self) {
        if let Err(e) = self.terminate_workers().await {
            warn!(error = %e, "Could not terminate all workers");
        }
        let connectors: Vec<Arc<ClientConnector>> = self.agents.write().values().cloned().collect();
        for connector in connectors {
            connector.close().await;
        }
        info!(
            session_id = %self.session_id,
            failures = self.failures.count(),
            "Coordinator stopped"
        );
    }
}

//! Worker runtime: hosts test containers and executes their phases.
//!
//! ```text
//!   agent ──link──▶ WorkerProcessor
//!                     ├─ A_W          CreateTest, TerminateWorker, Ping, Log
//!                     ├─ A_W_T<i>     StartTestPhase, StopRun, IsPhaseCompleted
//!                     └─ anything else ──▶ Upstream (towards the coordinator)
//!
//!   performance monitor ── every interval ──▶ PerformanceStats + IntervalStats
//!   end of RUN ───────────────────────────▶ PerformanceStats + IntervalStats
//! ```
//!
//! Phase bodies never run on the link's reader task. `StartTestPhase` is
//! validated and acknowledged immediately, then the phase executes on the
//! blocking pool; its outcome is observed through `IsPhaseCompleted`, and a
//! failure is additionally pushed upwards as a [`FailureMessage`].
//!
//! A container that completes or fails is dropped together with its
//! performance bookkeeping. Only its final state is kept, so late
//! `IsPhaseCompleted` queries still get an answer.

use crate::codec::OperationCodec;
use crate::container::{ContainerError, ContainerState, TestContainer};
use crate::definition::TestCatalog;
use crate::failure::{FailureMessage, FailureType};
use crate::operation::{
    IntervalStatsOperation, LogLevel, LogOperation, Operation, PerformanceStatsOperation,
};
use crate::performance::{IntervalStats, PerformanceState, PerformanceTracker};
use crate::phase::TestPhase;
use crate::routing::{next_hop, ChildSelector, NextHop};
use crate::schema::MessageSchema;
use crate::test_case::TestCase;
use crate::upstream::Upstream;
use gridbench_env::{
    Listener, MessageHandler, Promise, Response, ResponseType, ServerConnector, SimulatorAddress,
    SimulatorMessage,
};
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Configuration for a worker.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Interval between performance reports in milliseconds (default: 1000)
    pub performance_interval_ms: u64,

    /// How long a message forwarded to the parent may take (default: 60000)
    pub forward_timeout_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            performance_interval_ms: 1000,
            forward_timeout_ms: 60_000,
        }
    }
}

impl WorkerConfig {
    pub fn with_performance_interval(mut self, interval: Duration) -> Self {
        self.performance_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn performance_interval(&self) -> Duration {
        Duration::from_millis(self.performance_interval_ms.max(1))
    }

    pub fn forward_timeout(&self) -> Duration {
        Duration::from_millis(self.forward_timeout_ms)
    }
}

/// Finished tests whose final state is still answered after release.
const FINISHED_RETENTION: usize = 256;

/// What a worker holds for one test index.
#[derive(Clone)]
enum Slot {
    Live(Arc<TestContainer>),
    /// The container reached a terminal state and has been dropped.
    Finished {
        address: SimulatorAddress,
        test_id: String,
        state: ContainerState,
    },
}

impl Slot {
    fn address(&self) -> SimulatorAddress {
        match self {
            Slot::Live(container) => container.address(),
            Slot::Finished { address, .. } => *address,
        }
    }
}

/// The containers of one worker and the performance bookkeeping for them.
///
/// Lock order is `tracker` before `slots`.
struct TestHost {
    worker: SimulatorAddress,
    slots: RwLock<BTreeMap<u32, Slot>>,
    tracker: Mutex<PerformanceTracker>,
    upstream: Arc<Upstream>,
}

impl TestHost {
    fn live(&self) -> Vec<Arc<TestContainer>> {
        self.slots
            .read()
            .values()
            .filter_map(|slot| match slot {
                Slot::Live(container) => Some(Arc::clone(container)),
                Slot::Finished { .. } => None,
            })
            .collect()
    }

    /// Reports every running test that produced operations since the last
    /// report.
    ///
    /// Reports are queued while the tracker is locked, so they reach the
    /// parent in the order their deltas were taken.
    fn report(&self) {
        let now = Instant::now();
        let mut stats = BTreeMap::new();
        let mut intervals = BTreeMap::new();
        let mut tracker = self.tracker.lock();
        for container in self.live() {
            let test_id = container.test_id();
            if !tracker.is_tracking(test_id) {
                continue;
            }
            if let Some((state, interval)) = tracker.update(test_id, container.take_probe_snapshot(), now) {
                stats.insert(test_id.to_string(), state);
                intervals.insert(test_id.to_string(), interval);
            }
        }
        if stats.is_empty() {
            return;
        }
        debug!(worker = %self.worker, tests = stats.len(), "Reporting performance");
        self.send(stats, intervals);
        drop(tracker);
    }

    /// Reports the final figures of one test right after its RUN phase.
    fn flush(&self, container: &TestContainer) {
        let test_id = container.test_id().to_string();
        let mut tracker = self.tracker.lock();
        let Some((state, interval)) = tracker.update(&test_id, container.take_probe_snapshot(), Instant::now())
        else {
            return;
        };
        debug!(
            worker = %self.worker,
            test_id = %test_id,
            probe = %container.probe_name(),
            operations = state.operation_count,
            "Flushing final performance"
        );
        self.send(
            BTreeMap::from([(test_id.clone(), state)]),
            BTreeMap::from([(test_id, interval)]),
        );
        drop(tracker);
    }

    fn send(&self, stats: BTreeMap<String, PerformanceState>, intervals: BTreeMap<String, IntervalStats>) {
        self.upstream
            .notify(Operation::PerformanceStats(PerformanceStatsOperation { stats }));
        self.upstream
            .notify(Operation::IntervalStats(IntervalStatsOperation { stats: intervals }));
    }

    /// Replaces a terminal container by its final state.
    fn retire(&self, test_index: u32, container: &TestContainer) {
        let state = container.state();
        if !state.is_terminal() {
            return;
        }
        let mut tracker = self.tracker.lock();
        tracker.remove(container.test_id());
        let mut slots = self.slots.write();
        match slots.get(&test_index) {
            Some(Slot::Live(live)) if std::ptr::eq(Arc::as_ptr(live), container) => {}
            _ => return,
        }
        slots.insert(
            test_index,
            Slot::Finished {
                address: container.address(),
                test_id: container.test_id().to_string(),
                state,
            },
        );
        drop(tracker);

        let finished: Vec<u32> = slots
            .iter()
            .filter(|(_, slot)| matches!(slot, Slot::Finished { .. }))
            .map(|(index, _)| *index)
            .collect();
        let excess = finished.len().saturating_sub(FINISHED_RETENTION);
        for index in &finished[..excess] {
            slots.remove(index);
        }
        debug!(worker = %self.worker, test_index, "Released test container");
    }
}

/// Handles every message arriving at a worker.
pub struct WorkerProcessor {
    address: SimulatorAddress,
    codec: OperationCodec,
    catalog: TestCatalog,
    config: WorkerConfig,
    host: Arc<TestHost>,
    shutdown: watch::Sender<bool>,
}

impl WorkerProcessor {
    pub fn new(
        address: SimulatorAddress,
        codec: OperationCodec,
        catalog: TestCatalog,
        config: WorkerConfig,
    ) -> Self {
        let upstream = Arc::new(Upstream::new(address, codec.clone()));
        let (shutdown, _) = watch::channel(false);
        Self {
            address,
            codec,
            catalog,
            config,
            host: Arc::new(TestHost {
                worker: address,
                slots: RwLock::new(BTreeMap::new()),
                tracker: Mutex::new(PerformanceTracker::new()),
                upstream,
            }),
            shutdown,
        }
    }

    pub fn address(&self) -> SimulatorAddress {
        self.address
    }

    pub fn upstream(&self) -> &Arc<Upstream> {
        &self.host.upstream
    }

    /// The container for `test_index`, unless it has finished.
    pub fn container(&self, test_index: u32) -> Option<Arc<TestContainer>> {
        match self.host.slots.read().get(&test_index) {
            Some(Slot::Live(container)) => Some(Arc::clone(container)),
            _ => None,
        }
    }

    /// Number of containers that have not finished yet.
    pub fn container_count(&self) -> usize {
        self.host
            .slots
            .read()
            .values()
            .filter(|slot| matches!(slot, Slot::Live(_)))
            .count()
    }

    /// Number of finished tests whose final state is still kept.
    pub fn finished_count(&self) -> usize {
        self.host
            .slots
            .read()
            .values()
            .filter(|slot| matches!(slot, Slot::Finished { .. }))
            .count()
    }

    /// Number of tests with performance bookkeeping.
    pub fn tracked_tests(&self) -> usize {
        self.host.tracker.lock().len()
    }

    /// Resolves once a `TerminateWorker` has been processed.
    pub fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Signals every running test to stop.
    pub fn stop_all(&self) {
        for container in self.host.live() {
            container.stop_run();
        }
    }

    // =========================================================================
    // WORKER LEVEL
    // =========================================================================

    fn process_local(&self, operation: Operation, promise: Promise) {
        let address = self.address;
        match operation {
            Operation::Ping(ping) => {
                debug!(worker = %address, message = %ping.message, "Ping");
                promise.answer_with(address, ResponseType::Success, Some(address.to_string()));
            }
            Operation::Log(LogOperation { message, level }) => {
                log_remote(address, level, &message);
                promise.answer_with(address, ResponseType::Success, None);
            }
            Operation::CreateTest(create) => {
                let (response_type, payload) = self.create_test(create.test_index, create.test_case);
                promise.answer_with(address, response_type, payload);
            }
            Operation::TerminateWorker(terminate) => {
                info!(
                    worker = %address,
                    ensure_process_shutdown = terminate.ensure_process_shutdown,
                    "Terminating worker"
                );
                self.stop_all();
                self.report_performance();
                promise.answer_with(address, ResponseType::Success, None);
                self.shutdown.send_replace(true);
            }
            other => {
                warn!(worker = %address, operation = %other.kind(), "Operation is not handled by workers");
                promise.answer_with(
                    address,
                    ResponseType::UnknownOperation,
                    Some(format!("{} is not handled by workers", other.kind())),
                );
            }
        }
    }

    fn create_test(&self, test_index: u32, test_case: TestCase) -> (ResponseType, Option<String>) {
        let test_address = SimulatorAddress::test(
            self.address.agent_index(),
            self.address.worker_index(),
            test_index,
        );
        if self.host.slots.read().contains_key(&test_index) {
            return (
                ResponseType::ExceptionDuringOperationExecution,
                Some(format!("{} already hosts a test", test_address)),
            );
        }

        match TestContainer::create(&self.catalog, test_case.clone(), test_address) {
            Ok(container) => {
                info!(test = %test_address, test_id = %test_case.id(), "Created test container");
                self.host
                    .slots
                    .write()
                    .insert(test_index, Slot::Live(Arc::new(container)));
                (ResponseType::Success, None)
            }
            Err(e) => {
                warn!(test = %test_address, test_id = %test_case.id(), error = %e, "Could not bind test case");
                let failure = FailureMessage::new(FailureType::BindError, "Test case could not be bound")
                    .with_worker(self.address)
                    .with_test(&test_case)
                    .with_phase(TestPhase::Setup)
                    .with_cause(e.to_string());
                self.host.upstream.notify(Operation::failure(failure));
                (ResponseType::ExceptionDuringOperationExecution, Some(e.to_string()))
            }
        }
    }

    // =========================================================================
    // TEST LEVEL
    // =========================================================================

    fn process_tests(&self, selector: ChildSelector, operation: Operation, promise: Promise) {
        let targets: Vec<(u32, Slot)> = self
            .host
            .slots
            .read()
            .iter()
            .filter(|(index, _)| selector.matches(**index))
            .map(|(index, slot)| (*index, slot.clone()))
            .collect();

        if targets.is_empty() {
            let destination = promise.destination();
            promise.answer_with(
                destination,
                ResponseType::FailureTestNotFound,
                Some(format!("no test matching {} on {}", destination, self.address)),
            );
            return;
        }

        let mut response = Response::new(promise.message_id(), self.address);
        for (test_index, slot) in targets {
            let (response_type, payload) = match (&operation, &slot) {
                (Operation::StartTestPhase(start), Slot::Live(container)) => {
                    self.start_phase(test_index, container, start.phase)
                }
                (Operation::StartTestPhase(start), Slot::Finished { test_id, state, .. }) => {
                    let error = ContainerError::IllegalTransition {
                        test_id: test_id.clone(),
                        requested: start.phase,
                        reason: format!("test has been released ({})", state),
                    };
                    (ResponseType::ExceptionDuringOperationExecution, Some(error.to_string()))
                }
                (Operation::StopRun(_), Slot::Live(container)) => {
                    container.stop_run();
                    (ResponseType::Success, None)
                }
                (Operation::StopRun(_), Slot::Finished { .. }) => (ResponseType::Success, None),
                (Operation::IsPhaseCompleted(query), _) => {
                    let completion = match &slot {
                        Slot::Live(container) => container.completion(query.phase),
                        Slot::Finished { state, .. } => state.completion(query.phase),
                    };
                    match serde_json::to_string(&completion) {
                        Ok(body) => (ResponseType::Success, Some(body)),
                        Err(e) => (ResponseType::ExceptionDuringOperationExecution, Some(e.to_string())),
                    }
                }
                (other, _) => (
                    ResponseType::UnknownOperation,
                    Some(format!("{} is not handled by tests", other.kind())),
                ),
            };
            response.add_part(slot.address(), response_type, payload);
        }
        promise.answer(response);
    }

    fn start_phase(
        &self,
        test_index: u32,
        container: &Arc<TestContainer>,
        phase: TestPhase,
    ) -> (ResponseType, Option<String>) {
        if let Err(e) = container.begin_phase(phase) {
            warn!(test = %container.address(), error = %e, "Rejected phase");
            return (ResponseType::ExceptionDuringOperationExecution, Some(e.to_string()));
        }
        if phase == TestPhase::Run {
            self.host.tracker.lock().start(container.test_id(), Instant::now());
        }

        let container = Arc::clone(container);
        let host = Arc::clone(&self.host);
        tokio::task::spawn_blocking(move || {
            let started = Instant::now();
            // Everything sent here is queued ahead of any IsPhaseCompleted
            // answer that can observe the new state.
            let result = container.execute_phase_then(phase, |container, outcome| {
                if phase == TestPhase::Run {
                    host.flush(container);
                }
                if let Err(cause) = outcome {
                    let error = ContainerError::PhaseFailed {
                        test_id: container.test_id().to_string(),
                        phase,
                        cause: cause.clone(),
                    };
                    let failure = FailureMessage::new(
                        FailureType::WorkerException,
                        format!("Test failed in {}", phase),
                    )
                    .with_worker(host.worker)
                    .with_test(container.test_case())
                    .with_phase(phase)
                    .with_cause(error.to_string())
                    .with_duration_ms(started.elapsed().as_millis() as u64);
                    host.upstream.notify(Operation::failure(failure));
                }
            });
            if let Err(e) = result {
                debug!(test = %container.address(), error = %e, "Phase failure reported upwards");
            }
            host.retire(test_index, &container);
        });
        (ResponseType::Success, None)
    }

    // =========================================================================
    // UPWARDS
    // =========================================================================

    fn forward_up(&self, message: SimulatorMessage, promise: Promise) {
        let future = self.host.upstream.submit(message);
        let timeout = self.config.forward_timeout();
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

    /// Sends the statistics gathered since the previous report.
    pub fn report_performance(&self) {
        self.host.report();
    }
}

impl MessageHandler for WorkerProcessor {
    fn handle(&self, message: SimulatorMessage, promise: Promise) {
        let operation = match self.codec.decode_message(&message) {
            Ok(operation) => operation,
            Err(e) => {
                warn!(worker = %self.address, error = %e, "Could not decode message");
                promise.answer_type(ResponseType::ExceptionDuringOperationExecution, Some(e.to_string()));
                return;
            }
        };

        match next_hop(self.address, message.destination) {
            Ok(NextHop::Local) => self.process_local(operation, promise),
            Ok(NextHop::Children(selector)) => self.process_tests(selector, operation, promise),
            Ok(NextHop::Parent) => self.forward_up(message, promise),
            Err(e) => {
                error!(worker = %self.address, error = %e, "Unroutable message");
                promise.answer_type(ResponseType::ExceptionDuringOperationExecution, Some(e.to_string()));
            }
        }
    }

    fn on_disconnect(&self, peer: SimulatorAddress) {
        warn!(worker = %self.address, peer = %peer, "Parent link closed");
    }
}

/// Writes a line requested by a remote `LogOperation`.
pub(crate) fn log_remote(local: SimulatorAddress, level: LogLevel, message: &str) {
    match level {
        LogLevel::Debug => debug!(local = %local, "{}", message),
        LogLevel::Info => info!(local = %local, "{}", message),
        LogLevel::Warn => warn!(local = %local, "{}", message),
        LogLevel::Error => error!(local = %local, "{}", message),
    }
}

// =============================================================================
// RUNTIME
// =============================================================================

/// A running worker: processor, accept loop and performance monitor.
pub struct WorkerRuntime {
    processor: Arc<WorkerProcessor>,
    server: Arc<ServerConnector>,
    accept_task: JoinHandle<()>,
    monitor_task: JoinHandle<()>,
}

impl WorkerRuntime {
    /// Starts serving on `listener`. Must be called inside a tokio runtime.
    pub fn start(
        address: SimulatorAddress,
        config: WorkerConfig,
        catalog: TestCatalog,
        schema: Arc<MessageSchema>,
        listener: Arc<dyn Listener>,
    ) -> Self {
        let interval = config.performance_interval();
        let codec = OperationCodec::new(Arc::clone(&schema));
        let processor = Arc::new(WorkerProcessor::new(address, codec, catalog, config));
        let server = ServerConnector::new(address, processor.clone(), schema);
        processor.upstream().attach(&server);

        let accept_task = server.serve(listener);
        let monitor_task = tokio::spawn(performance_loop(
            Arc::downgrade(&processor),
            interval,
            processor.subscribe_shutdown(),
        ));
        info!(worker = %address, "Worker started");

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

    pub fn processor(&self) -> &Arc<WorkerProcessor> {
        &self.processor
    }

    pub fn server(&self) -> &Arc<ServerConnector> {
        &self.server
    }

    /// Waits until the worker has been told to terminate.
    pub async fn wait_for_shutdown(&self) {
        let mut shutdown = self.processor.subscribe_shutdown();
        while !*shutdown.borrow_and_update() {
            if shutdown.changed().await.is_err() {
                break;
            }
        }
    }

    /// Stops every running test and closes all links.
    pub fn shutdown(&self) {
        self.processor.stop_all();
        self.processor.shutdown.send_replace(true);
        self.accept_task.abort();
        self.monitor_task.abort();
        self.server.close();
        info!(worker = %self.address(), "Worker stopped");
    }
}

async fn performance_loop(
    processor: Weak<WorkerProcessor>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let Some(processor) = processor.upgrade() else { break };
                processor.report_performance();
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{TestDefinition, TestError};
    use crate::operation::PhaseCompletion;
    use gridbench_env::Link;

    /// Stands in for the agent: records what the worker sends upwards.
    struct AgentSide {
        received: Mutex<Vec<Operation>>,
        codec: Option<OperationCodec>,
    }

    impl MessageHandler for AgentSide {
        fn handle(&self, message: SimulatorMessage, promise: Promise) {
            if let Some(codec) = &self.codec {
                if let Ok(operation) = codec.decode_message(&message) {
                    self.received.lock().push(operation);
                }
            }
            promise.answer_type(ResponseType::Success, None);
        }
    }

    #[derive(Default)]
    struct Spin;

    #[derive(Default)]
    struct Broken;

    fn catalog() -> TestCatalog {
        let mut catalog = TestCatalog::new();
        catalog.register_default(TestDefinition::<Spin>::new("Spin").timestep(|_| Ok(())));
        catalog.register_default(
            TestDefinition::<Broken>::new("Broken").timestep(|_| Err(TestError::failed("broken timestep"))),
        );
        catalog
    }

    struct Harness {
        worker: Arc<WorkerProcessor>,
        link: Arc<Link>,
        codec: OperationCodec,
        agent: Arc<AgentSide>,
        _server: Arc<ServerConnector>,
    }

    async fn harness() -> Harness {
        let schema = Arc::new(MessageSchema::standard().unwrap());
        let codec = OperationCodec::new(Arc::clone(&schema));
        let address = SimulatorAddress::worker(1, 1);
        let worker = Arc::new(WorkerProcessor::new(
            address,
            codec.clone(),
            catalog(),
            WorkerConfig::default(),
        ));
        let server = ServerConnector::new(address, worker.clone(), schema.clone());
        worker.upstream().attach(&server);

        let agent = Arc::new(AgentSide {
            received: Mutex::new(Vec::new()),
            codec: Some(codec.clone()),
        });
        let (agent_io, worker_io) = tokio::io::duplex(64 * 1024);
        let accepting = {
            let server = Arc::clone(&server);
            tokio::spawn(async move { server.accept_stream(Box::new(worker_io)).await })
        };
        let link = Link::dial(agent_io, SimulatorAddress::agent(1), address, agent.clone(), schema)
            .await
            .unwrap();
        accepting.await.unwrap().unwrap();
        Harness {
            worker,
            link,
            codec,
            agent,
            _server: server,
        }
    }

    impl Harness {
        async fn send(&self, destination: SimulatorAddress, operation: &Operation) -> Response {
            let message = self
                .codec
                .message(destination, SimulatorAddress::agent(1), operation)
                .unwrap();
            self.link.submit(message).await.unwrap()
        }

        async fn wait_completed(&self, test: SimulatorAddress, phase: TestPhase) -> PhaseCompletion {
            for _ in 0..500 {
                let response = self.send(test, &Operation::is_phase_completed(phase)).await;
                let completion: PhaseCompletion =
                    serde_json::from_str(response.parts[0].payload.as_deref().unwrap()).unwrap();
                if completion.completed || completion.failed {
                    return completion;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            panic!("{} never completed {}", test, phase);
        }
    }

    fn spin_case(id: &str) -> TestCase {
        TestCase::new(id).with_class("Spin")
    }

    impl Harness {
        fn stats_for(&self, test_id: &str) -> Option<PerformanceState> {
            self.agent.received.lock().iter().rev().find_map(|op| match op {
                Operation::PerformanceStats(s) => s.stats.get(test_id).copied(),
                _ => None,
            })
        }

        async fn wait_released(&self) {
            for _ in 0..500 {
                if self.worker.container_count() == 0 {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            panic!("containers were never released");
        }

        /// Runs every phase of the test at `test_index`, stopping RUN after a
        /// short while.
        async fn run_all_phases(&self, test_index: u32) {
            let test = SimulatorAddress::test(1, 1, test_index);
            for &phase in TestPhase::all() {
                let response = self.send(test, &Operation::start_phase(phase)).await;
                assert!(response.is_success(), "{:?}", response);
                if phase == TestPhase::Run {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    assert!(self.send(test, &Operation::stop_run()).await.is_success());
                }
                let completion = self.wait_completed(test, phase).await;
                assert!(completion.completed && !completion.failed);
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_full_lifecycle_on_one_worker() {
        let h = harness().await;
        let worker = SimulatorAddress::worker(1, 1);
        let test = SimulatorAddress::test(1, 1, 1);

        let response = h.send(worker, &Operation::create_test(1, spin_case("spin"))).await;
        assert!(response.is_success());
        assert_eq!(h.worker.container_count(), 1);

        h.run_all_phases(1).await;
        h.wait_released().await;
        assert!(h.worker.container(1).is_none());
        assert_eq!(h.worker.finished_count(), 1);

        // The released test still answers with its final state.
        let completion = h.wait_completed(test, TestPhase::GlobalTeardown).await;
        assert!(completion.completed);
        let response = h.send(test, &Operation::start_phase(TestPhase::Run)).await;
        assert_eq!(
            response.parts[0].response_type,
            ResponseType::ExceptionDuringOperationExecution
        );
        assert!(h.send(test, &Operation::stop_run()).await.is_success());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_final_stats_arrive_before_run_completes() {
        // No periodic reporting runs in this harness.
        let h = harness().await;
        let test = SimulatorAddress::test(1, 1, 1);
        h.send(SimulatorAddress::worker(1, 1), &Operation::create_test(1, spin_case("spin")))
            .await;

        assert!(h.send(test, &Operation::start_phase(TestPhase::Run)).await.is_success());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(h.send(test, &Operation::stop_run()).await.is_success());
        let completion = h.wait_completed(test, TestPhase::Run).await;
        assert!(completion.completed);

        let stats = h.stats_for("spin").expect("final stats precede the completion answer");
        let operations = h.worker.container(1).unwrap().probe_snapshot().operations;
        assert!(operations > 0);
        assert_eq!(stats.operation_count, operations);
        assert!(h
            .agent
            .received
            .lock()
            .iter()
            .any(|op| matches!(op, Operation::IntervalStats(s) if s.stats.contains_key("spin"))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_sequential_tests_do_not_accumulate() {
        let h = harness().await;
        let worker = SimulatorAddress::worker(1, 1);

        for (index, id) in [(1, "first"), (2, "second")] {
            let response = h.send(worker, &Operation::create_test(index, spin_case(id))).await;
            assert!(response.is_success());
            h.run_all_phases(index).await;
            h.wait_released().await;
            assert_eq!(h.worker.container_count(), 0);
            assert_eq!(h.worker.tracked_tests(), 0);
            assert!(h.stats_for(id).is_some());
        }
        assert_eq!(h.worker.finished_count(), 2);

        // Nothing left for the periodic report to scan.
        let before = h.agent.received.lock().len();
        h.worker.report_performance();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(h.agent.received.lock().len(), before);

        // A finished index cannot be reused.
        let response = h.send(worker, &Operation::create_test(1, spin_case("again"))).await;
        assert!(!response.is_success());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_failed_container_is_released() {
        let h = harness().await;
        let test = SimulatorAddress::test(1, 1, 1);
        let case = TestCase::new("broken").with_class("Broken");
        h.send(SimulatorAddress::worker(1, 1), &Operation::create_test(1, case)).await;

        assert!(h.send(test, &Operation::start_phase(TestPhase::Run)).await.is_success());
        let completion = h.wait_completed(test, TestPhase::Run).await;
        assert!(completion.failed);

        // The failure was queued before the failed state became visible.
        let failure = h
            .agent
            .received
            .lock()
            .iter()
            .find_map(|op| match op {
                Operation::Failure(f) => Some(f.failure.clone()),
                _ => None,
            })
            .expect("failure precedes the completion answer");
        assert_eq!(failure.failure_type, FailureType::WorkerException);
        assert_eq!(failure.test_id.as_deref(), Some("broken"));

        h.wait_released().await;
        assert_eq!(h.worker.tracked_tests(), 0);
        assert!(h.wait_completed(test, TestPhase::Run).await.failed);
    }

    #[test]
    fn test_performance_interval_has_a_floor() {
        let config = WorkerConfig::default().with_performance_interval(Duration::ZERO);
        assert_eq!(config.performance_interval(), Duration::from_millis(1));
        assert_eq!(WorkerConfig::default().performance_interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_finished_tests_are_bounded() {
        let schema = Arc::new(MessageSchema::standard().unwrap());
        let worker = WorkerProcessor::new(
            SimulatorAddress::worker(1, 1),
            OperationCodec::new(schema),
            catalog(),
            WorkerConfig::default(),
        );
        let total = FINISHED_RETENTION as u32 + 10;
        for index in 1..=total {
            let (response_type, _) = worker.create_test(index, spin_case(&format!("t{}", index)));
            assert_eq!(response_type, ResponseType::Success);
            let container = worker.container(index).unwrap();
            container.begin_phase(TestPhase::LocalTeardown).unwrap();
            container.execute_phase(TestPhase::LocalTeardown).unwrap();
            worker.host.retire(index, &container);
        }
        assert_eq!(worker.container_count(), 0);
        assert_eq!(worker.finished_count(), FINISHED_RETENTION);
        let slots = worker.host.slots.read();
        assert!(!slots.contains_key(&1));
        assert!(slots.contains_key(&total));
    }

    #[tokio::test]
    async fn test_bind_error_is_reported_upwards() {
        let h = harness().await;
        let case = spin_case("broken").with_property("keyCount", "10");
        let response = h.send(SimulatorAddress::worker(1, 1), &Operation::create_test(1, case)).await;
        assert_eq!(
            response.parts[0].response_type,
            ResponseType::ExceptionDuringOperationExecution
        );
        assert_eq!(h.worker.container_count(), 0);

        tokio::time::sleep(Duration::from_millis(50)).await;
        let received = h.agent.received.lock();
        let failure = received
            .iter()
            .find_map(|op| match op {
                Operation::Failure(f) => Some(&f.failure),
                _ => None,
            })
            .unwrap();
        assert_eq!(failure.failure_type, FailureType::BindError);
        assert_eq!(failure.test_id.as_deref(), Some("broken"));
    }

    #[tokio::test]
    async fn test_unknown_test_index() {
        let h = harness().await;
        let response = h
            .send(SimulatorAddress::test(1, 1, 7), &Operation::stop_run())
            .await;
        assert_eq!(response.parts[0].response_type, ResponseType::FailureTestNotFound);
    }

    #[tokio::test]
    async fn test_wildcard_reaches_every_container() {
        let h = harness().await;
        let worker = SimulatorAddress::worker(1, 1);
        h.send(worker, &Operation::create_test(1, spin_case("a"))).await;
        h.send(worker, &Operation::create_test(2, spin_case("b"))).await;

        let response = h
            .send(SimulatorAddress::test(0, 0, 0), &Operation::is_phase_completed(TestPhase::Setup))
            .await;
        assert_eq!(response.parts.len(), 2);
        assert!(response.part_for(&SimulatorAddress::test(1, 1, 2)).is_some());
    }

    #[tokio::test]
    async fn test_terminate_signals_shutdown() {
        let h = harness().await;
        let mut shutdown = h.worker.subscribe_shutdown();
        let response = h
            .send(SimulatorAddress::worker(1, 1), &Operation::terminate_worker(true))
            .await;
        assert!(response.is_success());
        shutdown.changed().await.unwrap();
        assert!(h.worker.is_shutting_down());
    }
}

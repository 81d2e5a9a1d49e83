//! Per-test phase state machine hosted by a worker.
//!
//! ```text
//!   Created ──begin(p)──▶ Executing(p) ──ok──▶ Idle(p) ──begin(q > p)──▶ Executing(q) ...
//!                              │
//!                              └──error/panic──▶ Failed           Idle(GLOBAL_TEARDOWN) = Completed
//! ```
//!
//! Phases only move forward and never overlap. A phase may be skipped
//! (workers that do not host a global phase go straight to the next one).
//! A container that never ran a global phase is finished after
//! `LOCAL_TEARDOWN`; the one hosting the global phases finishes after
//! `GLOBAL_TEARDOWN`.
//! Errors and panics raised by test code are caught here and turn the
//! container into `Failed`; they never reach the worker.
//!
//! The RUN phase runs the timestep on `threadCount` dedicated OS threads. Each
//! thread checks the stop token before every iteration, records the latency
//! into its own [`Probe`], and exits when stopped, when its iteration cap is
//! reached, or on the first error of any thread.

use crate::definition::{BindError, BoundTest, TestCatalog, TestContext, TestError};
use crate::operation::PhaseCompletion;
use crate::performance::{Probe, ProbeSnapshot};
use crate::phase::TestPhase;
use crate::test_case::TestCase;
use gridbench_env::SimulatorAddress;
use parking_lot::Mutex;
use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContainerError {
    #[error("Test '{test_id}' cannot start {requested}: {reason}")]
    IllegalTransition {
        test_id: String,
        requested: TestPhase,
        reason: String,
    },

    #[error("Test '{test_id}' failed in {phase}: {cause}")]
    PhaseFailed {
        test_id: String,
        phase: TestPhase,
        cause: TestError,
    },
}

/// Lifecycle state of a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerState {
    Created,
    Executing(TestPhase),
    /// The given phase was the last one to finish
    Idle(TestPhase),
    Completed,
    Failed { phase: TestPhase, cause: String },
}

impl ContainerState {
    /// True once no further phase can run.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ContainerState::Completed | ContainerState::Failed { .. })
    }

    /// Whether `phase` (or a later one) has finished in this state.
    pub fn completion(&self, phase: TestPhase) -> PhaseCompletion {
        match self {
            ContainerState::Created => PhaseCompletion::default(),
            ContainerState::Executing(current) => PhaseCompletion {
                completed: *current > phase,
                failed: false,
            },
            ContainerState::Idle(last) => PhaseCompletion {
                completed: *last >= phase,
                failed: false,
            },
            ContainerState::Completed => PhaseCompletion {
                completed: true,
                failed: false,
            },
            ContainerState::Failed { .. } => PhaseCompletion {
                completed: false,
                failed: true,
            },
        }
    }
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContainerState::Created => write!(f, "CREATED"),
            ContainerState::Executing(phase) => write!(f, "EXECUTING {}", phase),
            ContainerState::Idle(phase) => write!(f, "COMPLETED {}", phase),
            ContainerState::Completed => write!(f, "COMPLETED"),
            ContainerState::Failed { phase, .. } => write!(f, "FAILED in {}", phase),
        }
    }
}

/// Owns one test instance and drives it through its phases.
pub struct TestContainer {
    test_case: TestCase,
    context: Arc<TestContext>,
    test: Mutex<Option<Arc<BoundTest>>>,
    state: Mutex<ContainerState>,
    probe_name: Arc<str>,
    probes: Mutex<Vec<Arc<Probe>>>,
    run_duration: Mutex<Option<Duration>>,
    hosts_global: AtomicBool,
}

impl TestContainer {
    pub fn new(test_case: TestCase, address: SimulatorAddress, test: BoundTest) -> Self {
        let context = Arc::new(TestContext::new(test_case.id(), address));
        let probe_name = Arc::from(test.probe_name());
        Self {
            test_case,
            context,
            probe_name,
            test: Mutex::new(Some(Arc::new(test))),
            state: Mutex::new(ContainerState::Created),
            probes: Mutex::new(Vec::new()),
            run_duration: Mutex::new(None),
            hosts_global: AtomicBool::new(false),
        }
    }

    /// Binds the test case through the catalog and wraps the result.
    pub fn create(
        catalog: &TestCatalog,
        test_case: TestCase,
        address: SimulatorAddress,
    ) -> Result<Self, BindError> {
        let test = catalog.create(&test_case)?;
        Ok(Self::new(test_case, address, test))
    }

    pub fn test_id(&self) -> &str {
        self.test_case.id()
    }

    pub fn test_case(&self) -> &TestCase {
        &self.test_case
    }

    pub fn address(&self) -> SimulatorAddress {
        self.context.address()
    }

    pub fn context(&self) -> &Arc<TestContext> {
        &self.context
    }

    pub fn state(&self) -> ContainerState {
        self.state.lock().clone()
    }

    /// How long the last RUN phase took.
    pub fn run_duration(&self) -> Option<Duration> {
        *self.run_duration.lock()
    }

    /// Validates and records the start of `phase`.
    ///
    /// Separate from [`TestContainer::execute_phase`] so the caller can
    /// acknowledge the request before the (possibly long) phase body runs.
    pub fn begin_phase(&self, phase: TestPhase) -> Result<(), ContainerError> {
        let mut state = self.state.lock();
        let reject = |reason: String| ContainerError::IllegalTransition {
            test_id: self.test_id().to_string(),
            requested: phase,
            reason,
        };
        match &*state {
            ContainerState::Created => {}
            ContainerState::Idle(last) if phase > *last => {}
            ContainerState::Idle(last) => {
                return Err(reject(format!("{} has already completed", last)))
            }
            ContainerState::Executing(current) => {
                return Err(reject(format!("{} is still executing", current)))
            }
            ContainerState::Completed => return Err(reject("test has completed".to_string())),
            ContainerState::Failed { phase: failed, .. } => {
                return Err(reject(format!("test failed in {}", failed)))
            }
        }
        if phase.is_global() {
            self.hosts_global.store(true, Ordering::Relaxed);
        }
        *state = ContainerState::Executing(phase);
        Ok(())
    }

    /// Runs the body of a phase previously accepted by `begin_phase`.
    ///
    /// Blocks the calling thread for the duration of the phase.
    pub fn execute_phase(&self, phase: TestPhase) -> Result<(), ContainerError> {
        self.execute_phase_then(phase, |_, _| {})
    }

    /// Like [`TestContainer::execute_phase`], but calls `before_publish`
    /// with the outcome of the phase body before the new state becomes
    /// visible through [`TestContainer::completion`].
    pub fn execute_phase_then<F>(&self, phase: TestPhase, before_publish: F) -> Result<(), ContainerError>
    where
        F: FnOnce(&TestContainer, Result<(), &TestError>),
    {
        if self.state() != ContainerState::Executing(phase) {
            return Err(ContainerError::IllegalTransition {
                test_id: self.test_id().to_string(),
                requested: phase,
                reason: format!("phase was not begun (state is {})", self.state()),
            });
        }
        let Some(test) = self.test.lock().clone() else {
            return Err(ContainerError::IllegalTransition {
                test_id: self.test_id().to_string(),
                requested: phase,
                reason: "test instance has been released".to_string(),
            });
        };

        info!(test_id = %self.test_id(), phase = %phase, "Starting phase");
        let started = Instant::now();
        let result = self.run_callbacks(&test, phase).and_then(|()| {
            if phase == TestPhase::Run && test.has_timestep() {
                self.run_timestep(&test)
            } else {
                Ok(())
            }
        });
        let elapsed = started.elapsed();
        if phase == TestPhase::Run {
            *self.run_duration.lock() = Some(elapsed);
        }
        before_publish(self, result.as_ref().map(|_| ()));

        match result {
            Ok(()) => {
                let finished = phase == TestPhase::last()
                    || (phase == TestPhase::LocalTeardown && !self.hosts_global.load(Ordering::Relaxed));
                let mut state = self.state.lock();
                if finished {
                    *state = ContainerState::Completed;
                    drop(state);
                    self.release();
                } else {
                    *state = ContainerState::Idle(phase);
                }
                info!(test_id = %self.test_id(), phase = %phase, elapsed_ms = elapsed.as_millis() as u64, "Completed phase");
                Ok(())
            }
            Err(cause) => {
                warn!(test_id = %self.test_id(), phase = %phase, cause = %cause, "Phase failed");
                *self.state.lock() = ContainerState::Failed {
                    phase,
                    cause: cause.to_string(),
                };
                self.context.stop();
                self.release();
                Err(ContainerError::PhaseFailed {
                    test_id: self.test_id().to_string(),
                    phase,
                    cause,
                })
            }
        }
    }

    /// Begins and executes a phase.
    pub fn run_phase(&self, phase: TestPhase) -> Result<(), ContainerError> {
        self.begin_phase(phase)?;
        self.execute_phase(phase)
    }

    /// Signals the RUN phase to stop; takes effect at the next iteration.
    pub fn stop_run(&self) {
        debug!(test_id = %self.test_id(), "Stop requested");
        self.context.stop();
    }

    /// Reports whether `phase` (or a later one) has finished.
    pub fn completion(&self, phase: TestPhase) -> PhaseCompletion {
        self.state.lock().completion(phase)
    }

    /// Name of the operation the timestep probes measure.
    pub fn probe_name(&self) -> &str {
        &self.probe_name
    }

    /// Sum of all timestep probes.
    pub fn probe_snapshot(&self) -> ProbeSnapshot {
        self.probes
            .lock()
            .iter()
            .fold(ProbeSnapshot::default(), |acc, probe| acc.add(&probe.snapshot()))
    }

    /// Sum of all timestep probes; starts a new interval maximum on each.
    pub fn take_probe_snapshot(&self) -> ProbeSnapshot {
        self.probes
            .lock()
            .iter()
            .fold(ProbeSnapshot::default(), |acc, probe| acc.add(&probe.take_snapshot()))
    }

    /// True while the RUN phase executes.
    pub fn is_running(&self) -> bool {
        *self.state.lock() == ContainerState::Executing(TestPhase::Run)
    }

    /// Drops the test instance and everything it holds.
    fn release(&self) {
        if self.test.lock().take().is_some() {
            debug!(test_id = %self.test_id(), "Released test instance");
        }
    }

    fn run_callbacks(&self, test: &BoundTest, phase: TestPhase) -> Result<(), TestError> {
        for callback in test.callbacks(phase) {
            match catch_unwind(AssertUnwindSafe(|| callback(&self.context))) {
                Ok(result) => result?,
                Err(panic) => return Err(TestError::Panicked(panic_message(panic.as_ref()))),
            }
        }
        Ok(())
    }

    fn run_timestep(&self, test: &BoundTest) -> Result<(), TestError> {
        let thread_count = test.thread_count();
        let iterations = test.iterations();
        let probes: Vec<Arc<Probe>> = (0..thread_count)
            .map(|_| Arc::new(Probe::new(Arc::clone(&self.probe_name))))
            .collect();
        *self.probes.lock() = probes.clone();

        let first_error: Mutex<Option<TestError>> = Mutex::new(None);
        let context: &TestContext = &self.context;
        let record_error = |error: TestError| {
            context.stop();
            first_error.lock().get_or_insert(error);
        };

        std::thread::scope(|scope| {
            for (index, probe) in probes.iter().enumerate() {
                let Some(mut step) = test.thread_step(index) else {
                    break;
                };
                let record_error = &record_error;
                let spawned = std::thread::Builder::new()
                    .name(format!("{}-timestep-{}", self.test_id(), index))
                    .spawn_scoped(scope, move || {
                        let outcome = catch_unwind(AssertUnwindSafe(|| -> Result<(), TestError> {
                            let mut done = 0u64;
                            while !context.is_stopped() {
                                if iterations > 0 && done >= iterations {
                                    break;
                                }
                                let started = Instant::now();
                                step(context)?;
                                probe.record(started.elapsed());
                                done += 1;
                            }
                            Ok(())
                        }));
                        match outcome {
                            Ok(Ok(())) => {}
                            Ok(Err(error)) => record_error(error),
                            Err(panic) => record_error(TestError::Panicked(panic_message(panic.as_ref()))),
                        }
                    });
                if let Err(e) = spawned {
                    record_error(TestError::failed(format!("could not start timestep thread: {}", e)));
                    break;
                }
            }
        });

        let total = self.probe_snapshot();
        debug!(
            test_id = %self.test_id(),
            probe = %self.probe_name,
            operations = total.operations,
            "Timestep threads finished"
        );
        match first_error.into_inner() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{ensure, TestDefinition};
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

    /// Records a global sequence number for every callback it sees.
    #[derive(Default)]
    struct Recorder {
        sequence: AtomicUsize,
        seen: Mutex<Vec<(usize, TestPhase)>>,
        iterations: AtomicU64,
    }

    fn recording_definition() -> TestDefinition<Recorder> {
        let mut definition = TestDefinition::new("Recorder");
        for &phase in TestPhase::all() {
            definition = definition.on(phase, move |t: &Recorder, _| {
                let n = t.sequence.fetch_add(1, Ordering::SeqCst);
                t.seen.lock().push((n, phase));
                Ok(())
            });
        }
        definition.timestep(|t: &Recorder| {
            t.iterations.fetch_add(1, Ordering::Relaxed);
            Ok(())
        })
    }

    fn container(definition: TestDefinition<Recorder>, test_case: TestCase) -> TestContainer {
        let bound = definition.bind(Recorder::default(), &test_case).unwrap();
        TestContainer::new(test_case, SimulatorAddress::test(1, 1, 1), bound)
    }

    fn recorder_case(iterations: u64) -> TestCase {
        TestCase::new("foo")
            .with_class("Recorder")
            .with_property("threadCount", "2")
            .with_property("iterations", iterations.to_string())
    }

    #[test]
    fn test_phases_execute_in_strictly_increasing_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let definition = recording_definition().on(TestPhase::GlobalTeardown, move |t: &Recorder, _| {
            sink.lock().extend(t.seen.lock().iter().copied());
            Ok(())
        });
        let container = container(definition, recorder_case(10));

        for &phase in TestPhase::all() {
            container.run_phase(phase).unwrap();
        }
        assert_eq!(container.state(), ContainerState::Completed);

        let seen = seen.lock();
        assert_eq!(seen.len(), TestPhase::all().len());
        for pair in seen.windows(2) {
            assert!(pair[0].0 < pair[1].0);
            assert!(pair[0].1 < pair[1].1);
        }
    }

    #[test]
    fn test_backwards_and_repeated_phases_are_rejected() {
        let container = container(recording_definition(), recorder_case(1));
        container.run_phase(TestPhase::Setup).unwrap();
        container.run_phase(TestPhase::LocalPrepare).unwrap();
        assert!(matches!(
            container.run_phase(TestPhase::Setup),
            Err(ContainerError::IllegalTransition { .. })
        ));
        assert!(container.run_phase(TestPhase::LocalPrepare).is_err());
        // Skipping the global phase is allowed.
        container.run_phase(TestPhase::Run).unwrap();
    }

    #[test]
    fn test_local_only_container_finishes_after_local_teardown() {
        let container = container(recording_definition(), recorder_case(1));
        for &phase in TestPhase::all().iter().filter(|p| !p.is_global()) {
            container.run_phase(phase).unwrap();
        }
        assert_eq!(container.state(), ContainerState::Completed);
        assert!(container.completion(TestPhase::GlobalTeardown).completed);
    }

    #[test]
    fn test_concurrent_phase_is_rejected() {
        let container = container(recording_definition(), recorder_case(1));
        container.begin_phase(TestPhase::Setup).unwrap();
        assert!(container.begin_phase(TestPhase::LocalPrepare).is_err());
        assert!(!container.completion(TestPhase::Setup).completed);
        container.execute_phase(TestPhase::Setup).unwrap();
        assert!(container.completion(TestPhase::Setup).completed);
    }

    #[test]
    fn test_iteration_cap_is_per_thread() {
        let container = container(recording_definition(), recorder_case(500));
        container.run_phase(TestPhase::Run).unwrap();
        assert_eq!(container.probe_snapshot().operations, 1_000);
        assert!(container.run_duration().is_some());
    }

    #[test]
    fn test_stop_before_run_exits_immediately() {
        let container = container(recording_definition(), recorder_case(0));
        container.begin_phase(TestPhase::Run).unwrap();
        container.stop_run();
        let started = Instant::now();
        container.execute_phase(TestPhase::Run).unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(container.probe_snapshot().operations, 0);
        assert!(container.completion(TestPhase::Run).completed);
    }

    #[test]
    fn test_stop_ends_running_loop() {
        let container = container(recording_definition(), recorder_case(0));
        let container = Arc::new(container);
        container.begin_phase(TestPhase::Run).unwrap();
        let runner = {
            let container = Arc::clone(&container);
            std::thread::spawn(move || container.execute_phase(TestPhase::Run))
        };
        std::thread::sleep(Duration::from_millis(50));
        assert!(container.is_running());
        container.stop_run();
        runner.join().unwrap().unwrap();
        assert!(container.probe_snapshot().operations > 0);
    }

    #[test]
    fn test_timestep_recorders_use_configured_name() {
        let definition = recording_definition().probe("increment");
        let container = container(definition, recorder_case(5));
        assert_eq!(container.probe_name(), "increment");
        container.run_phase(TestPhase::Run).unwrap();
        let probes = container.probes.lock();
        assert_eq!(probes.len(), 2);
        assert!(probes.iter().all(|probe| probe.name() == "increment"));
    }

    #[test]
    fn test_unnamed_timestep_uses_default_name() {
        let container = container(recording_definition(), recorder_case(1));
        assert_eq!(container.probe_name(), crate::performance::DEFAULT_PROBE_NAME);
    }

    #[test]
    fn test_hook_sees_final_counts_before_state_changes() {
        let container = container(recording_definition(), recorder_case(50));
        container.begin_phase(TestPhase::Run).unwrap();
        let seen = Mutex::new(None);
        container
            .execute_phase_then(TestPhase::Run, |c, _| {
                *seen.lock() = Some((c.state(), c.probe_snapshot().operations));
            })
            .unwrap();
        assert_eq!(
            seen.into_inner(),
            Some((ContainerState::Executing(TestPhase::Run), 100))
        );
        assert_eq!(container.state(), ContainerState::Idle(TestPhase::Run));
    }

    #[test]
    fn test_hook_runs_before_failure_is_published() {
        let definition = TestDefinition::<Recorder>::new("Failing").timestep(|_| Err(TestError::failed("nope")));
        let case = TestCase::new("failing").with_class("Failing");
        let bound = definition.bind(Recorder::default(), &case).unwrap();
        let container = TestContainer::new(case, SimulatorAddress::test(1, 1, 4), bound);

        container.begin_phase(TestPhase::Run).unwrap();
        let mut hooked = None;
        let result = container.execute_phase_then(TestPhase::Run, |c, outcome| {
            hooked = Some((c.completion(TestPhase::Run), outcome.map_err(|e| e.to_string())));
        });
        assert!(result.is_err());
        assert_eq!(hooked, Some((PhaseCompletion::default(), Err("nope".to_string()))));
        assert!(container.state().is_terminal());
    }

    #[test]
    fn test_terminal_states() {
        assert!(ContainerState::Completed.is_terminal());
        assert!(ContainerState::Failed { phase: TestPhase::Run, cause: "x".to_string() }.is_terminal());
        assert!(!ContainerState::Idle(TestPhase::LocalTeardown).is_terminal());
        assert!(!ContainerState::Created.is_terminal());
    }

    #[test]
    fn test_panic_fails_only_this_container() {
        let definition = TestDefinition::<Recorder>::new("Boom").on(TestPhase::LocalPrepare, |_, _| {
            panic!("boom");
        });
        let case = TestCase::new("boom").with_class("Boom");
        let bound = definition.bind(Recorder::default(), &case).unwrap();
        let container = TestContainer::new(case, SimulatorAddress::test(1, 1, 2), bound);

        container.run_phase(TestPhase::Setup).unwrap();
        let err = container.run_phase(TestPhase::LocalPrepare).unwrap_err();
        match err {
            ContainerError::PhaseFailed { phase, cause, .. } => {
                assert_eq!(phase, TestPhase::LocalPrepare);
                assert_eq!(cause, TestError::Panicked("boom".to_string()));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(
            container.completion(TestPhase::LocalPrepare),
            PhaseCompletion { completed: false, failed: true }
        );
        assert!(container.run_phase(TestPhase::Run).is_err());
    }

    #[test]
    fn test_timestep_error_stops_all_threads() {
        let definition = TestDefinition::<Recorder>::new("Flaky").timestep(|t: &Recorder| {
            let n = t.iterations.fetch_add(1, Ordering::SeqCst);
            ensure(n < 100, || "too many iterations".to_string())
        });
        let case = TestCase::new("flaky")
            .with_class("Flaky")
            .with_property("threadCount", "4");
        let bound = definition.bind(Recorder::default(), &case).unwrap();
        let container = TestContainer::new(case, SimulatorAddress::test(1, 1, 3), bound);

        let err = container.run_phase(TestPhase::Run).unwrap_err();
        assert!(matches!(err, ContainerError::PhaseFailed { phase: TestPhase::Run, .. }));
        assert!(container.probe_snapshot().operations <= 100);
    }
}

//! Drives one test case through its phases.
//!
//! ```text
//!   CreateTest ─▶ SETUP ─▶ LOCAL_PREPARE ─▶ GLOBAL_PREPARE ─▶ RUN ─▶ ...
//!                   │
//!                   ├─ StartTestPhase to every container (global: one)
//!                   └─ poll IsPhaseCompleted until all report done
//! ```
//!
//! A phase only starts once every container has completed the previous
//! one. The first failing phase ends the test: the runner stops RUN if it
//! was executing, waits for the other containers to finish the phase, and
//! then tears down every container that has not failed.

use crate::coordinator::{Coordinator, CoordinatorError};
use crate::failure::{FailureMessage, FailureType};
use crate::operation::{Operation, PhaseCompletion};
use crate::performance::{IntervalStats, PerformanceState};
use crate::phase::TestPhase;
use crate::registry::TestStatus;
use crate::test_case::TestCase;
use gridbench_env::{AddressLevel, Response, ResponseType, SimulatorAddress};
use serde::Serialize;
use std::collections::BTreeSet;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Result of running one test case.
#[derive(Debug, Clone, Serialize)]
pub struct TestOutcome {
    pub test_id: String,

    pub test_index: u32,

    pub status: String,

    /// Phase that failed, if any
    pub failed_phase: Option<TestPhase>,

    pub failure_reason: Option<String>,

    /// Failures reported for this test by any component
    pub failure_count: u64,

    pub performance: PerformanceState,

    pub intervals: IntervalStats,

    pub duration_ms: u64,
}

impl TestOutcome {
    pub fn is_success(&self) -> bool {
        self.failed_phase.is_none() && self.failure_count == 0
    }
}

/// Why a phase did not complete.
struct PhaseFailure {
    phase: TestPhase,
    reason: String,
}

pub struct TestCaseRunner<'a> {
    coordinator: &'a Coordinator,
    test_case: TestCase,
    run_duration: Duration,
    phase_timeout: Duration,
    initial_backoff: Duration,
    max_backoff: Duration,
}

impl<'a> TestCaseRunner<'a> {
    pub fn new(coordinator: &'a Coordinator, test_case: TestCase) -> Self {
        let config = coordinator.config();
        Self {
            coordinator,
            test_case,
            run_duration: config.run_duration(),
            phase_timeout: config.phase_timeout(),
            initial_backoff: config.poll_initial_backoff(),
            max_backoff: config.poll_max_backoff(),
        }
    }

    pub fn with_run_duration(mut self, duration: Duration) -> Self {
        self.run_duration = duration;
        self
    }

    pub fn with_phase_timeout(mut self, timeout: Duration) -> Self {
        self.phase_timeout = timeout;
        self
    }

    pub async fn run(self) -> Result<TestOutcome, CoordinatorError> {
        let started = Instant::now();
        if self.coordinator.worker_count() == 0 {
            return Err(CoordinatorError::NoWorkers);
        }
        let test = self
            .coordinator
            .registry()
            .write()
            .add_test(self.test_case.clone())?;
        let test_id = self.test_case.id().to_string();
        info!(test_id = %test_id, test_index = test.test_index, "Starting test");

        let failure = match self.create(test.test_index).await? {
            Ok(expected) => self.run_phases(test.test_index, &expected).await?,
            Err(failure) => Some(failure),
        };

        let status = if failure.is_some() {
            TestStatus::Failed
        } else {
            TestStatus::Completed
        };
        self.set_status(status)?;

        let performance = self.coordinator.performance();
        let outcome = TestOutcome {
            test_id: test_id.clone(),
            test_index: test.test_index,
            status: status.to_string(),
            failed_phase: failure.as_ref().map(|f| f.phase),
            failure_reason: failure.map(|f| f.reason),
            failure_count: self.coordinator.failures().count_for(&test_id),
            performance: performance.total(&test_id),
            intervals: performance.intervals(&test_id),
            duration_ms: started.elapsed().as_millis() as u64,
        };
        if outcome.is_success() {
            info!(test_id = %test_id, duration_ms = outcome.duration_ms, "Test completed");
        } else {
            warn!(
                test_id = %test_id,
                phase = ?outcome.failed_phase,
                reason = ?outcome.failure_reason,
                failures = outcome.failure_count,
                "Test failed"
            );
        }
        Ok(outcome)
    }

    /// Creates the test on every worker; returns the container addresses.
    async fn create(
        &self,
        test_index: u32,
    ) -> Result<Result<Vec<SimulatorAddress>, PhaseFailure>, CoordinatorError> {
        let create = Operation::create_test(test_index, self.test_case.clone());
        let response = self
            .coordinator
            .send(SimulatorAddress::ALL_WORKERS, &create)
            .await?;
        if let Some(part) = response.first_failure() {
            return Ok(Err(PhaseFailure {
                phase: TestPhase::Setup,
                reason: format!(
                    "{} could not create the test: {} {}",
                    part.address,
                    part.response_type,
                    part.payload.as_deref().unwrap_or_default()
                ),
            }));
        }
        let expected: Vec<SimulatorAddress> = response
            .parts
            .iter()
            .map(|part| {
                SimulatorAddress::test(part.address.agent_index(), part.address.worker_index(), test_index)
            })
            .collect();
        if expected.is_empty() {
            return Ok(Err(PhaseFailure {
                phase: TestPhase::Setup,
                reason: "no worker created the test".to_string(),
            }));
        }
        debug!(test_id = %self.test_case.id(), containers = expected.len(), "Test created");
        Ok(Ok(expected))
    }

    async fn run_phases(
        &self,
        test_index: u32,
        expected: &[SimulatorAddress],
    ) -> Result<Option<PhaseFailure>, CoordinatorError> {
        for &phase in TestPhase::all() {
            self.set_status(TestStatus::Running(phase))?;
            let (target, targets) = match self.phase_target(phase, test_index, expected) {
                Some(target) => target,
                None => {
                    self.teardown_after_failure(phase, test_index, expected).await;
                    return Ok(Some(PhaseFailure {
                        phase,
                        reason: "no worker left to run the global phase".to_string(),
                    }));
                }
            };

            debug!(test_id = %self.test_case.id(), phase = %phase, target = %target, "Starting phase");
            let response = self.coordinator.send(target, &Operation::start_phase(phase)).await?;
            if let Some(failure) = Self::rejected(phase, &response) {
                self.settle(phase, target, &Self::accepted(&response)).await;
                self.teardown_after_failure(phase, test_index, expected).await;
                return Ok(Some(failure));
            }

            let result = if phase == TestPhase::Run {
                self.run_phase(target, &targets).await?
            } else {
                self.await_phase(phase, target, &targets).await?
            };
            if let Err(failure) = result {
                if phase == TestPhase::Run {
                    self.stop_run(target).await;
                }
                self.settle(phase, target, &Self::accepted(&response)).await;
                self.teardown_after_failure(phase, test_index, expected).await;
                return Ok(Some(failure));
            }
        }
        Ok(None)
    }

    /// Asks every container at `target` to stop RUN; problems are logged.
    async fn stop_run(&self, target: SimulatorAddress) {
        match self.coordinator.send(target, &Operation::stop_run()).await {
            Ok(response) => {
                for part in response.parts.iter().filter(|p| !p.response_type.is_success()) {
                    warn!(
                        test_id = %self.test_case.id(),
                        container = %part.address,
                        response = %part.response_type,
                        payload = ?part.payload,
                        "Stop request was not accepted"
                    );
                }
            }
            Err(e) => warn!(test_id = %self.test_case.id(), target = %target, error = %e, "Could not stop RUN"),
        }
    }

    /// Runs the teardown phases on the containers that are still healthy.
    ///
    /// Best effort: rejections come from containers that failed or already
    /// finished, and errors are only logged.
    async fn teardown_after_failure(&self, failed: TestPhase, test_index: u32, expected: &[SimulatorAddress]) {
        for phase in [TestPhase::LocalTeardown, TestPhase::GlobalTeardown] {
            if phase <= failed {
                continue;
            }
            // Nothing global was set up before GLOBAL_PREPARE.
            if phase.is_global() && failed < TestPhase::GlobalPrepare {
                continue;
            }
            let Some((target, _)) = self.phase_target(phase, test_index, expected) else {
                continue;
            };

            info!(test_id = %self.test_case.id(), phase = %phase, failed = %failed, "Tearing down after failure");
            let response = match self.coordinator.send(target, &Operation::start_phase(phase)).await {
                Ok(response) => response,
                Err(e) => {
                    warn!(test_id = %self.test_case.id(), phase = %phase, error = %e, "Could not start teardown");
                    continue;
                }
            };
            for part in response.parts.iter().filter(|p| !p.response_type.is_success()) {
                debug!(
                    test_id = %self.test_case.id(),
                    container = %part.address,
                    phase = %phase,
                    payload = ?part.payload,
                    "Container skipped teardown"
                );
            }
            self.settle(phase, target, &Self::accepted(&response)).await;
        }
    }

    /// Waits, bounded by the phase timeout, until each of `started` has
    /// either completed or failed `phase`.
    async fn settle(&self, phase: TestPhase, target: SimulatorAddress, started: &[SimulatorAddress]) {
        if started.is_empty() {
            return;
        }
        let deadline = Instant::now() + self.phase_timeout;
        let mut backoff = self.initial_backoff;
        loop {
            let response = match self.coordinator.send(target, &Operation::is_phase_completed(phase)).await {
                Ok(response) => response,
                Err(e) => {
                    warn!(test_id = %self.test_case.id(), phase = %phase, error = %e, "Could not query phase");
                    return;
                }
            };
            let pending: Vec<SimulatorAddress> = started
                .iter()
                .copied()
                .filter(|address| {
                    let completion = response
                        .part_for(address)
                        .filter(|part| part.response_type.is_success())
                        .and_then(|part| part.payload.as_deref())
                        .and_then(|body| serde_json::from_str::<PhaseCompletion>(body).ok());
                    // A missing answer means the container is gone.
                    !completion.map_or(true, |c| c.completed || c.failed)
                })
                .collect();
            if pending.is_empty() {
                return;
            }
            if Instant::now() >= deadline {
                warn!(
                    test_id = %self.test_case.id(),
                    phase = %phase,
                    pending = ?pending,
                    "Containers did not finish the phase in time"
                );
                return;
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(self.max_backoff);
        }
    }

    /// Containers that accepted a `StartTestPhase`.
    fn accepted(response: &Response) -> Vec<SimulatorAddress> {
        response
            .parts
            .iter()
            .filter(|part| part.response_type.is_success())
            .map(|part| part.address)
            .collect()
    }

    /// Global phases go to the coordinating worker only.
    fn phase_target(
        &self,
        phase: TestPhase,
        test_index: u32,
        expected: &[SimulatorAddress],
    ) -> Option<(SimulatorAddress, Vec<SimulatorAddress>)> {
        if !phase.is_global() {
            return Some((SimulatorAddress::test(0, 0, test_index), expected.to_vec()));
        }
        let worker = self
            .coordinator
            .with_registry(|registry| registry.coordinating_worker().map(|w| w.address))?;
        let target = SimulatorAddress::test(worker.agent_index(), worker.worker_index(), test_index);
        Some((target, vec![target]))
    }

    fn rejected(phase: TestPhase, response: &Response) -> Option<PhaseFailure> {
        response.first_failure().map(|part| PhaseFailure {
            phase,
            reason: format!(
                "{} rejected {}: {} {}",
                part.address,
                phase,
                part.response_type,
                part.payload.as_deref().unwrap_or_default()
            ),
        })
    }

    /// Lets RUN go on for the run duration, then stops it and waits.
    async fn run_phase(
        &self,
        target: SimulatorAddress,
        expected: &[SimulatorAddress],
    ) -> Result<Result<(), PhaseFailure>, CoordinatorError> {
        let deadline = Instant::now() + self.run_duration;
        let mut backoff = self.initial_backoff;
        while Instant::now() < deadline {
            // Tests without a timestep finish RUN by themselves.
            match self.poll(TestPhase::Run, target, expected).await? {
                PollResult::Done => return Ok(Ok(())),
                PollResult::Failed(failure) => return Ok(Err(failure)),
                PollResult::Pending => {}
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            tokio::time::sleep(backoff.min(remaining)).await;
            backoff = (backoff * 2).min(self.max_backoff);
        }

        debug!(test_id = %self.test_case.id(), "Run duration elapsed, stopping");
        let response = self.coordinator.send(target, &Operation::stop_run()).await?;
        if let Some(failure) = Self::rejected(TestPhase::Run, &response) {
            return Ok(Err(failure));
        }
        self.await_phase(TestPhase::Run, target, expected).await
    }

    /// Polls until every expected container reports the phase completed.
    async fn await_phase(
        &self,
        phase: TestPhase,
        target: SimulatorAddress,
        expected: &[SimulatorAddress],
    ) -> Result<Result<(), PhaseFailure>, CoordinatorError> {
        let started = Instant::now();
        let deadline = started + self.phase_timeout;
        let mut backoff = self.initial_backoff;
        loop {
            match self.poll(phase, target, expected).await? {
                PollResult::Done => return Ok(Ok(())),
                PollResult::Failed(failure) => return Ok(Err(failure)),
                PollResult::Pending => {}
            }
            if Instant::now() >= deadline {
                let timeout_ms = self.phase_timeout.as_millis() as u64;
                let reason = CoordinatorError::PhaseTimeout {
                    test_id: self.test_case.id().to_string(),
                    phase,
                    timeout_ms,
                }
                .to_string();
                let failure = FailureMessage::new(FailureType::PhaseTimeout, format!("{} timed out", phase))
                    .with_test(&self.test_case)
                    .with_phase(phase)
                    .with_cause(reason.clone())
                    .with_duration_ms(started.elapsed().as_millis() as u64);
                self.coordinator.processor().report_failure(failure);
                return Ok(Err(PhaseFailure { phase, reason }));
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(self.max_backoff);
        }
    }

    async fn poll(
        &self,
        phase: TestPhase,
        target: SimulatorAddress,
        expected: &[SimulatorAddress],
    ) -> Result<PollResult, CoordinatorError> {
        let response = self
            .coordinator
            .send(target, &Operation::is_phase_completed(phase))
            .await?;

        let mut completed = BTreeSet::new();
        for part in &response.parts {
            if part.response_type != ResponseType::Success {
                return Ok(PollResult::Failed(PhaseFailure {
                    phase,
                    reason: format!(
                        "{} failed to report {}: {} {}",
                        part.address,
                        phase,
                        part.response_type,
                        part.payload.as_deref().unwrap_or_default()
                    ),
                }));
            }
            let completion: PhaseCompletion = part
                .payload
                .as_deref()
                .and_then(|body| serde_json::from_str(body).ok())
                .unwrap_or_default();
            if completion.failed {
                let reason = self
                    .coordinator
                    .failures()
                    .failures_for(self.test_case.id())
                    .into_iter()
                    .find(|f| f.worker_address == part.address.ancestor_at(AddressLevel::Worker))
                    .map(|f| f.summary().to_string())
                    .unwrap_or_else(|| format!("{} failed", part.address));
                return Ok(PollResult::Failed(PhaseFailure { phase, reason }));
            }
            if completion.completed {
                completed.insert(part.address);
            }
        }

        for address in expected {
            let worker = SimulatorAddress::worker(address.agent_index(), address.worker_index());
            let alive = self.coordinator.with_registry(|r| r.worker(&worker).is_some());
            if !alive {
                return Ok(PollResult::Failed(PhaseFailure {
                    phase,
                    reason: format!("{} is gone", worker),
                }));
            }
        }

        if expected.iter().all(|address| completed.contains(address)) {
            Ok(PollResult::Done)
        } else {
            Ok(PollResult::Pending)
        }
    }

    fn set_status(&self, status: TestStatus) -> Result<(), CoordinatorError> {
        self.coordinator
            .registry()
            .write()
            .set_test_status(self.test_case.id(), status)?;
        Ok(())
    }
}

enum PollResult {
    Done,
    Pending,
    Failed(PhaseFailure),
}

//! Scenario runner - executes end-to-end scenarios on a simulated cluster.

use crate::cluster::{SimCluster, SimClusterConfig};
use crate::scenarios::ScenarioId;
use gridbench_core::{
    builtin_catalog, FailureType, Operation, TargetExpression, TestCase, TestOutcome, TestPhase, TestStatus,
};
use gridbench_env::SimulatorAddress;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Results from running a scenario.
#[derive(Debug, Clone)]
pub struct ScenarioResult {
    /// Scenario that was run
    pub scenario: ScenarioId,

    /// Seed used for random targeting
    pub seed: u64,

    /// Whether scenario passed all assertions
    pub passed: bool,

    /// Wall clock time of the scenario
    pub duration_ms: u64,

    /// Outcome of every test the scenario ran
    pub tests: Vec<TestOutcome>,

    /// Failures collected by the coordinator
    pub failures: u64,

    /// Failure message if any
    pub failure_reason: Option<String>,
}

/// Runs scenarios, each on a fresh cluster.
pub struct ScenarioRunner {
    /// Seed for the coordinator's random targeting
    seed: u64,

    /// RUN duration of the tests
    run_duration: Duration,

    /// Timeout of a single phase
    phase_timeout: Duration,
}

/// What a scenario observed.
struct Observation {
    tests: Vec<TestOutcome>,
    problem: Option<String>,
}

impl Observation {
    fn new() -> Self {
        Self {
            tests: Vec::new(),
            problem: None,
        }
    }

    /// Records the first broken expectation.
    fn expect(&mut self, condition: bool, problem: impl FnOnce() -> String) {
        if !condition && self.problem.is_none() {
            self.problem = Some(problem());
        }
    }
}

impl ScenarioRunner {
    /// Creates a new scenario runner.
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            run_duration: Duration::from_millis(300),
            phase_timeout: Duration::from_secs(10),
        }
    }

    /// Sets the RUN duration.
    pub fn with_run_duration(mut self, duration: Duration) -> Self {
        self.run_duration = duration;
        self
    }

    /// Sets the phase timeout.
    pub fn with_phase_timeout(mut self, timeout: Duration) -> Self {
        self.phase_timeout = timeout;
        self
    }

    fn cluster_config(&self) -> SimClusterConfig {
        SimClusterConfig::default()
            .with_seed(self.seed)
            .with_run_duration(self.run_duration)
            .with_phase_timeout(self.phase_timeout)
    }

    /// Runs a scenario and returns the result.
    pub async fn run(&self, scenario: ScenarioId) -> ScenarioResult {
        info!("Starting scenario: {} (seed={})", scenario.name(), self.seed);
        let started = Instant::now();

        let config = match scenario {
            ScenarioId::FailingTest | ScenarioId::WorkerCrash => self.cluster_config().with_workers_per_agent(2),
            ScenarioId::MultiAgent => self.cluster_config().with_agents(3).with_workers_per_agent(2),
            ScenarioId::StopBeforeRun => self.cluster_config().with_run_duration(Duration::ZERO),
            _ => self.cluster_config(),
        };

        let (observation, failures) = match SimCluster::start(config, builtin_catalog()).await {
            Ok(cluster) => {
                let observation = match scenario {
                    ScenarioId::Success => self.run_success(&cluster).await,
                    ScenarioId::StopBeforeRun => self.run_stop_before_run(&cluster).await,
                    ScenarioId::FailingTest => self.run_failing_test(&cluster).await,
                    ScenarioId::BindError => self.run_bind_error(&cluster).await,
                    ScenarioId::MultiAgent => self.run_multi_agent(&cluster).await,
                    ScenarioId::WorkerCrash => self.run_worker_crash(&cluster).await,
                };
                let failures = cluster.coordinator().failures().count();
                cluster.shutdown().await;
                (observation, failures)
            }
            Err(e) => {
                let mut observation = Observation::new();
                observation.problem = Some(format!("cluster did not start: {}", e));
                (observation, 0)
            }
        };

        let result = ScenarioResult {
            scenario,
            seed: self.seed,
            passed: observation.problem.is_none(),
            duration_ms: started.elapsed().as_millis() as u64,
            tests: observation.tests,
            failures,
            failure_reason: observation.problem,
        };
        if result.passed {
            debug!(scenario = %scenario, duration_ms = result.duration_ms, "Scenario passed");
        } else {
            warn!(scenario = %scenario, reason = ?result.failure_reason, "Scenario failed");
        }
        result
    }

    async fn run_test(&self, cluster: &SimCluster, test_case: TestCase, observation: &mut Observation) -> Option<TestOutcome> {
        match cluster.coordinator().run_test(test_case).await {
            Ok(outcome) => {
                observation.tests.push(outcome.clone());
                Some(outcome)
            }
            Err(e) => {
                observation.expect(false, || format!("test could not run: {}", e));
                None
            }
        }
    }

    // =========================================================================
    // SIM-001: Success
    // =========================================================================

    async fn run_success(&self, cluster: &SimCluster) -> Observation {
        let mut observation = Observation::new();
        let test_case = TestCase::new("foo")
            .with_class("SuccessTest")
            .with_property("threadCount", "1");
        let Some(outcome) = self.run_test(cluster, test_case, &mut observation).await else {
            return observation;
        };

        let coordinator = cluster.coordinator();
        observation.expect(outcome.is_success(), || format!("test failed: {:?}", outcome.failure_reason));
        observation.expect(coordinator.test_status("foo") == Some(TestStatus::Completed), || {
            format!("final status is {:?}", coordinator.test_status("foo"))
        });
        observation.expect(coordinator.failures().count() == 0, || {
            format!("{} failures reported", coordinator.failures().count())
        });
        // Workers flush their final figures before RUN reports completion.
        observation.expect(outcome.performance.operation_count > 0, || {
            "no operations were reported".to_string()
        });
        observation.expect(outcome.intervals.operation_count == outcome.performance.operation_count, || {
            format!(
                "intervals cover {} of {} operations",
                outcome.intervals.operation_count, outcome.performance.operation_count
            )
        });
        observation
    }

    // =========================================================================
    // SIM-002: StopRun right after RUN starts
    // =========================================================================

    async fn run_stop_before_run(&self, cluster: &SimCluster) -> Observation {
        let mut observation = Observation::new();
        let started = Instant::now();
        let test_case = TestCase::new("stopped")
            .with_class("SuccessTest")
            .with_property("threadCount", "4");
        let Some(outcome) = self.run_test(cluster, test_case, &mut observation).await else {
            return observation;
        };

        let elapsed = started.elapsed();
        observation.expect(outcome.is_success(), || format!("test failed: {:?}", outcome.failure_reason));
        observation.expect(elapsed < Duration::from_secs(10), || {
            format!("test took {} ms after the stop", elapsed.as_millis())
        });
        observation
    }

    // =========================================================================
    // SIM-003: A failing test next to a healthy one
    // =========================================================================

    async fn run_failing_test(&self, cluster: &SimCluster) -> Observation {
        let mut observation = Observation::new();
        let coordinator = cluster.coordinator();
        let results = coordinator
            .run_tests(vec![
                TestCase::new("bad")
                    .with_class("FailingTest")
                    .with_property("failPhase", "LOCAL_VERIFY"),
                TestCase::new("good").with_class("SuccessTest"),
            ])
            .await;

        for result in results {
            match result {
                Ok(outcome) => observation.tests.push(outcome),
                Err(e) => observation.expect(false, || format!("test could not run: {}", e)),
            }
        }
        let [bad, good] = observation.tests.as_slice() else {
            return observation;
        };
        let (bad_phase, good_ok) = (bad.failed_phase, good.is_success());

        observation.expect(bad_phase == Some(TestPhase::LocalVerify), || {
            format!("bad test failed in {:?}", bad_phase)
        });
        observation.expect(good_ok, || "healthy test was affected".to_string());
        let reported = wait_until(Duration::from_secs(2), || {
            coordinator
                .failures()
                .failures_for("bad")
                .iter()
                .any(|f| f.failure_type == FailureType::WorkerException && f.phase == Some(TestPhase::LocalVerify))
        })
        .await;
        observation.expect(reported, || "no WorkerException failure for the bad test".to_string());
        observation.expect(coordinator.test_status("bad") == Some(TestStatus::Failed), || {
            "bad test is not marked failed".to_string()
        });
        observation
    }

    // =========================================================================
    // SIM-004: Bind error
    // =========================================================================

    async fn run_bind_error(&self, cluster: &SimCluster) -> Observation {
        let mut observation = Observation::new();
        let test_case = TestCase::new("unbindable")
            .with_class("SuccessTest")
            .with_property("valueSize", "10");
        let Some(outcome) = self.run_test(cluster, test_case, &mut observation).await else {
            return observation;
        };

        let coordinator = cluster.coordinator();
        observation.expect(outcome.failed_phase == Some(TestPhase::Setup), || {
            format!("expected a SETUP failure, got {:?}", outcome.failed_phase)
        });
        let reported = wait_until(Duration::from_secs(2), || {
            coordinator
                .failures()
                .failures_for("unbindable")
                .iter()
                .any(|f| f.failure_type == FailureType::BindError && f.cause.contains("valueSize"))
        })
        .await;
        observation.expect(reported, || "bind error naming the property was not reported".to_string());
        observation.expect(coordinator.worker_count() == 1, || "the worker did not survive".to_string());
        observation
    }

    // =========================================================================
    // SIM-005: Several agents
    // =========================================================================

    async fn run_multi_agent(&self, cluster: &SimCluster) -> Observation {
        let mut observation = Observation::new();
        let coordinator = cluster.coordinator();

        for (expression, expected_parts) in [("Agent=*", 3usize), ("Agent=R,Worker=*", 2), ("Agent=*,Worker=O", 1)] {
            let targets = match expression.parse::<TargetExpression>() {
                Ok(targets) => targets,
                Err(e) => {
                    observation.expect(false, || e.to_string());
                    return observation;
                }
            };
            match coordinator.send_to_targets(&targets, &Operation::ping("scenario")).await {
                Ok(response) => {
                    let parts = response.parts.len();
                    observation.expect(response.is_success() && parts == expected_parts, || {
                        format!("{} answered with {} parts, expected {}", expression, parts, expected_parts)
                    });
                }
                Err(e) => observation.expect(false, || format!("{}: {}", expression, e)),
            }
        }

        let Some(outcome) = self
            .run_test(cluster, TestCase::new("wide").with_class("SuccessTest"), &mut observation)
            .await
        else {
            return observation;
        };
        observation.expect(outcome.is_success(), || format!("test failed: {:?}", outcome.failure_reason));
        let all_reported = coordinator.performance().reporting_workers("wide") == 6;
        observation.expect(all_reported, || {
            format!(
                "{} of 6 workers reported performance",
                coordinator.performance().reporting_workers("wide")
            )
        });
        observation
    }

    // =========================================================================
    // SIM-006: Worker crash during RUN
    // =========================================================================

    async fn run_worker_crash(&self, cluster: &SimCluster) -> Observation {
        let mut observation = Observation::new();
        let coordinator = cluster.coordinator();
        let victim = SimulatorAddress::worker(1, 2);

        let test = coordinator.run_test_for(
            TestCase::new("crashed").with_class("SuccessTest"),
            Duration::from_secs(30),
        );
        let crash = async {
            tokio::time::sleep(self.run_duration).await;
            cluster.crash_worker(&victim)
        };
        let started = Instant::now();
        let (result, crashed) = tokio::join!(test, crash);
        observation.expect(crashed, || format!("{} was not running", victim));

        match result {
            Ok(outcome) => {
                observation.expect(!outcome.is_success(), || "test passed despite the crash".to_string());
                observation.expect(started.elapsed() < Duration::from_secs(30), || {
                    "crash was only noticed after the run duration".to_string()
                });
                observation.tests.push(outcome);
            }
            Err(e) => observation.expect(false, || format!("test could not run: {}", e)),
        }

        let reported = wait_until(Duration::from_secs(2), || {
            coordinator
                .failures()
                .failures()
                .iter()
                .any(|f| f.failure_type == FailureType::WorkerAbnormalExit && f.worker_address == Some(victim))
        })
        .await;
        observation.expect(reported, || "abnormal exit was not reported".to_string());
        let removed = wait_until(Duration::from_secs(2), || coordinator.worker_count() == 1).await;
        observation.expect(removed, || {
            format!("{} workers registered after the crash", coordinator.worker_count())
        });
        observation
    }
}

/// Polls `condition` every 10 ms until it holds or `timeout` passes.
async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn run(scenario: ScenarioId) -> ScenarioResult {
        ScenarioRunner::new(42).run(scenario).await
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_success_scenario() {
        let result = run(ScenarioId::Success).await;
        assert!(result.passed, "{:?}", result.failure_reason);
        assert_eq!(result.failures, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_stop_before_run_scenario() {
        let result = run(ScenarioId::StopBeforeRun).await;
        assert!(result.passed, "{:?}", result.failure_reason);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_failing_test_scenario() {
        let result = run(ScenarioId::FailingTest).await;
        assert!(result.passed, "{:?}", result.failure_reason);
        assert!(result.failures >= 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_bind_error_scenario() {
        let result = run(ScenarioId::BindError).await;
        assert!(result.passed, "{:?}", result.failure_reason);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_multi_agent_scenario() {
        let result = run(ScenarioId::MultiAgent).await;
        assert!(result.passed, "{:?}", result.failure_reason);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_worker_crash_scenario() {
        let result = run(ScenarioId::WorkerCrash).await;
        assert!(result.passed, "{:?}", result.failure_reason);
    }
}

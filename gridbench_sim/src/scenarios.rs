//! End-to-end scenarios run against a simulated cluster.

/// Scenario identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScenarioId {
    /// SIM-001: one agent, one worker, a successful test
    Success,

    /// SIM-002: RUN is stopped as soon as it starts
    StopBeforeRun,

    /// SIM-003: a test fails in LOCAL_VERIFY next to a healthy one
    FailingTest,

    /// SIM-004: a test case with an unknown property
    BindError,

    /// SIM-005: three agents with two workers each, random targeting
    MultiAgent,

    /// SIM-006: a worker dies during RUN
    WorkerCrash,
}

impl ScenarioId {
    /// Returns a list of all scenarios.
    pub fn all() -> Vec<ScenarioId> {
        vec![
            ScenarioId::Success,
            ScenarioId::StopBeforeRun,
            ScenarioId::FailingTest,
            ScenarioId::BindError,
            ScenarioId::MultiAgent,
            ScenarioId::WorkerCrash,
        ]
    }

    /// Returns the scenario name.
    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::Success => "success",
            ScenarioId::StopBeforeRun => "stop_before_run",
            ScenarioId::FailingTest => "failing_test",
            ScenarioId::BindError => "bind_error",
            ScenarioId::MultiAgent => "multi_agent",
            ScenarioId::WorkerCrash => "worker_crash",
        }
    }

    /// Returns a description of the scenario.
    pub fn description(&self) -> &'static str {
        match self {
            ScenarioId::Success => "SuccessTest on 1 agent / 1 worker completes with no failures",
            ScenarioId::StopBeforeRun => "StopRun right after RUN starts; test still completes quickly",
            ScenarioId::FailingTest => "FailingTest fails in LOCAL_VERIFY, a parallel SuccessTest passes",
            ScenarioId::BindError => "Unknown property is reported as a bind error in SETUP",
            ScenarioId::MultiAgent => "3 agents x 2 workers, random agent ping and a cluster-wide test",
            ScenarioId::WorkerCrash => "Worker killed during RUN; abnormal exit reported, test fails",
        }
    }

    /// True if the scenario expects a failed test.
    pub fn expects_failure(&self) -> bool {
        matches!(
            self,
            ScenarioId::FailingTest | ScenarioId::BindError | ScenarioId::WorkerCrash
        )
    }
}

impl std::fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for ScenarioId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "success" | "sim-001" => Ok(ScenarioId::Success),
            "stop_before_run" | "stopbeforerun" | "sim-002" => Ok(ScenarioId::StopBeforeRun),
            "failing_test" | "failingtest" | "sim-003" => Ok(ScenarioId::FailingTest),
            "bind_error" | "binderror" | "sim-004" => Ok(ScenarioId::BindError),
            "multi_agent" | "multiagent" | "sim-005" => Ok(ScenarioId::MultiAgent),
            "worker_crash" | "workercrash" | "sim-006" => Ok(ScenarioId::WorkerCrash),
            _ => Err(format!("Unknown scenario: {}", s)),
        }
    }
}

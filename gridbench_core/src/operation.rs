//! Operations exchanged between coordinator, agents and workers.
//!
//! Every operation is a plain serializable value. On the wire it travels as
//! `(type id, JSON body)`; the id comes from the
//! [`MessageSchema`](crate::schema::MessageSchema) and the body is produced by
//! the [`OperationCodec`](crate::codec::OperationCodec).

use crate::failure::FailureMessage;
use crate::launcher::WorkerProcessSettings;
use crate::performance::{IntervalStats, PerformanceState};
use crate::phase::TestPhase;
use crate::test_case::TestCase;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Liveness check; answered by any endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PingOperation {
    pub message: String,
}

/// Carries a failure up to the coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureOperation {
    pub failure: FailureMessage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Asks the receiver to write a line to its log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogOperation {
    pub message: String,
    pub level: LogLevel,
}

/// Tells an agent which session it takes part in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitSessionOperation {
    pub session_id: String,
}

/// Asks an agent to start worker processes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateWorkerOperation {
    pub workers: Vec<WorkerProcessSettings>,
}

/// Asks an agent to kill a worker process without warning it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KillWorkerOperation {
    pub worker_index: u32,
}

/// Asks a worker to shut down.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerminateWorkerOperation {
    /// Exit the process once all containers are released
    pub ensure_process_shutdown: bool,
}

/// Creates a test container on a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateTestOperation {
    pub test_index: u32,
    pub test_case: TestCase,
}

/// Starts a phase on a test container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartTestPhaseOperation {
    pub phase: TestPhase,
}

/// Signals the RUN phase of a test to stop.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StopRunOperation {}

/// Queries whether a phase has finished on a test container.
///
/// Answered with a [`PhaseCompletion`] payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IsPhaseCompletedOperation {
    pub phase: TestPhase,
}

/// Answer to [`IsPhaseCompletedOperation`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseCompletion {
    /// The phase (or a later one) has finished
    pub completed: bool,

    /// The container has failed and will make no further progress
    pub failed: bool,
}

/// Latest performance state per test id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceStatsOperation {
    pub stats: BTreeMap<String, PerformanceState>,
}

/// Interval statistics per test id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IntervalStatsOperation {
    pub stats: BTreeMap<String, IntervalStats>,
}

/// Every operation known to the protocol.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    Ping(PingOperation),
    Failure(FailureOperation),
    Log(LogOperation),
    InitSession(InitSessionOperation),
    CreateWorker(CreateWorkerOperation),
    KillWorker(KillWorkerOperation),
    TerminateWorker(TerminateWorkerOperation),
    CreateTest(CreateTestOperation),
    StartTestPhase(StartTestPhaseOperation),
    StopRun(StopRunOperation),
    IsPhaseCompleted(IsPhaseCompletedOperation),
    PerformanceStats(PerformanceStatsOperation),
    IntervalStats(IntervalStatsOperation),
}

/// Discriminant of [`Operation`], used as the key of the message schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OperationKind {
    Ping,
    Failure,
    Log,
    InitSession,
    CreateWorker,
    KillWorker,
    TerminateWorker,
    CreateTest,
    StartTestPhase,
    StopRun,
    IsPhaseCompleted,
    PerformanceStats,
    IntervalStats,
}

impl OperationKind {
    pub fn all() -> &'static [OperationKind] {
        &[
            OperationKind::Ping,
            OperationKind::Failure,
            OperationKind::Log,
            OperationKind::InitSession,
            OperationKind::CreateWorker,
            OperationKind::KillWorker,
            OperationKind::TerminateWorker,
            OperationKind::CreateTest,
            OperationKind::StartTestPhase,
            OperationKind::StopRun,
            OperationKind::IsPhaseCompleted,
            OperationKind::PerformanceStats,
            OperationKind::IntervalStats,
        ]
    }

    pub fn name(self) -> &'static str {
        match self {
            OperationKind::Ping => "PingOperation",
            OperationKind::Failure => "FailureOperation",
            OperationKind::Log => "LogOperation",
            OperationKind::InitSession => "InitSessionOperation",
            OperationKind::CreateWorker => "CreateWorkerOperation",
            OperationKind::KillWorker => "KillWorkerOperation",
            OperationKind::TerminateWorker => "TerminateWorkerOperation",
            OperationKind::CreateTest => "CreateTestOperation",
            OperationKind::StartTestPhase => "StartTestPhaseOperation",
            OperationKind::StopRun => "StopRunOperation",
            OperationKind::IsPhaseCompleted => "IsPhaseCompletedOperation",
            OperationKind::PerformanceStats => "PerformanceStatsOperation",
            OperationKind::IntervalStats => "IntervalStatsOperation",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl Operation {
    pub fn kind(&self) -> OperationKind {
        match self {
            Operation::Ping(_) => OperationKind::Ping,
            Operation::Failure(_) => OperationKind::Failure,
            Operation::Log(_) => OperationKind::Log,
            Operation::InitSession(_) => OperationKind::InitSession,
            Operation::CreateWorker(_) => OperationKind::CreateWorker,
            Operation::KillWorker(_) => OperationKind::KillWorker,
            Operation::TerminateWorker(_) => OperationKind::TerminateWorker,
            Operation::CreateTest(_) => OperationKind::CreateTest,
            Operation::StartTestPhase(_) => OperationKind::StartTestPhase,
            Operation::StopRun(_) => OperationKind::StopRun,
            Operation::IsPhaseCompleted(_) => OperationKind::IsPhaseCompleted,
            Operation::PerformanceStats(_) => OperationKind::PerformanceStats,
            Operation::IntervalStats(_) => OperationKind::IntervalStats,
        }
    }

    pub fn ping(message: impl Into<String>) -> Self {
        Operation::Ping(PingOperation {
            message: message.into(),
        })
    }

    pub fn failure(failure: FailureMessage) -> Self {
        Operation::Failure(FailureOperation { failure })
    }

    pub fn start_phase(phase: TestPhase) -> Self {
        Operation::StartTestPhase(StartTestPhaseOperation { phase })
    }

    pub fn is_phase_completed(phase: TestPhase) -> Self {
        Operation::IsPhaseCompleted(IsPhaseCompletedOperation { phase })
    }

    pub fn stop_run() -> Self {
        Operation::StopRun(StopRunOperation {})
    }

    pub fn terminate_worker(ensure_process_shutdown: bool) -> Self {
        Operation::TerminateWorker(TerminateWorkerOperation {
            ensure_process_shutdown,
        })
    }

    pub fn create_test(test_index: u32, test_case: TestCase) -> Self {
        Operation::CreateTest(CreateTestOperation {
            test_index,
            test_case,
        })
    }
}

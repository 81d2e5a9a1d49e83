//! Failure reports and their collection at the coordinator.

use crate::phase::TestPhase;
use crate::test_case::TestCase;
use chrono::{DateTime, Utc};
use gridbench_env::SimulatorAddress;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{error, warn};

/// Category of a reported failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureType {
    /// A test phase returned an error or panicked
    WorkerException,
    /// A worker did not respond in time
    WorkerTimeout,
    /// A worker process died without being asked to
    WorkerAbnormalExit,
    /// A worker process exited with code 0 without being asked to
    WorkerNormalExit,
    /// A worker process could not be started
    WorkerCreateError,
    /// A phase did not complete within the phase timeout
    PhaseTimeout,
    /// Test properties could not be bound
    BindError,
    /// A message could not be delivered
    NetworkError,
}

impl FailureType {
    /// True if the failure means the worker is gone.
    pub fn is_worker_finished(self) -> bool {
        matches!(
            self,
            FailureType::WorkerAbnormalExit | FailureType::WorkerNormalExit
        )
    }
}

impl fmt::Display for FailureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// An immutable failure record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureMessage {
    /// When the failure was detected
    pub timestamp: DateTime<Utc>,

    /// One line summary
    pub message: String,

    pub failure_type: FailureType,

    /// Worker the failure originates from
    pub worker_address: Option<SimulatorAddress>,

    /// Agent hosting that worker
    pub agent_address: Option<SimulatorAddress>,

    /// Process level id of the worker (pid, sim id, ...)
    pub worker_id: Option<String>,

    pub test_id: Option<String>,

    pub test_case: Option<TestCase>,

    /// Phase that was executing, if any
    pub phase: Option<TestPhase>,

    /// Full cause (error chain or panic message)
    pub cause: String,

    /// Time spent in the failing operation
    pub duration_ms: u64,
}

impl FailureMessage {
    pub fn new(failure_type: FailureType, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            message: message.into(),
            failure_type,
            worker_address: None,
            agent_address: None,
            worker_id: None,
            test_id: None,
            test_case: None,
            phase: None,
            cause: String::new(),
            duration_ms: 0,
        }
    }

    /// Sets the worker address; the agent address is derived from it.
    pub fn with_worker(mut self, worker: SimulatorAddress) -> Self {
        self.worker_address = Some(worker);
        self.agent_address = worker.parent();
        self
    }

    pub fn with_agent(mut self, agent: SimulatorAddress) -> Self {
        self.agent_address = Some(agent);
        self
    }

    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = Some(worker_id.into());
        self
    }

    pub fn with_test(mut self, test_case: &TestCase) -> Self {
        self.test_id = Some(test_case.id().to_string());
        self.test_case = Some(test_case.clone());
        self
    }

    pub fn with_test_id(mut self, test_id: impl Into<String>) -> Self {
        self.test_id = Some(test_id.into());
        self
    }

    pub fn with_phase(mut self, phase: TestPhase) -> Self {
        self.phase = Some(phase);
        self
    }

    pub fn with_cause(mut self, cause: impl Into<String>) -> Self {
        self.cause = cause.into();
        self
    }

    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    /// First line of the cause, or the message if there is no cause.
    pub fn summary(&self) -> &str {
        self.cause
            .lines()
            .next()
            .filter(|line| !line.is_empty())
            .unwrap_or(&self.message)
    }
}

/// Numbers, logs and persists failures.
pub struct FailureCollector {
    next_number: AtomicU64,
    per_test: Mutex<HashMap<String, u64>>,
    failures: Mutex<Vec<FailureMessage>>,
    record: Option<Mutex<BufWriter<File>>>,
    record_path: Option<PathBuf>,
}

impl FailureCollector {
    /// Creates a collector that only keeps failures in memory.
    pub fn in_memory() -> Self {
        Self {
            next_number: AtomicU64::new(1),
            per_test: Mutex::new(HashMap::new()),
            failures: Mutex::new(Vec::new()),
            record: None,
            record_path: None,
        }
    }

    /// Creates a collector that also appends every failure as a JSON line
    /// to `<output_dir>/failures-<session_id>.jsonl`.
    pub fn with_record_file(output_dir: &Path, session_id: &str) -> std::io::Result<Self> {
        std::fs::create_dir_all(output_dir)?;
        let path = output_dir.join(format!("failures-{}.jsonl", session_id));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let mut collector = Self::in_memory();
        collector.record = Some(Mutex::new(BufWriter::new(file)));
        collector.record_path = Some(path);
        Ok(collector)
    }

    pub fn record_path(&self) -> Option<&Path> {
        self.record_path.as_deref()
    }

    /// Registers a failure and returns its display number.
    pub fn report(&self, failure: FailureMessage) -> u64 {
        let number = self.next_number.fetch_add(1, Ordering::SeqCst);
        let address = failure
            .worker_address
            .or(failure.agent_address)
            .map(|a| a.to_string())
            .unwrap_or_else(|| "C".to_string());

        error!(
            "Failure #{} [{}] test={} type={}: {}",
            number,
            address,
            failure.test_id.as_deref().unwrap_or("-"),
            failure.failure_type,
            failure.summary()
        );

        if let Some(test_id) = &failure.test_id {
            *self.per_test.lock().entry(test_id.clone()).or_insert(0) += 1;
        }
        if let Some(record) = &self.record {
            if let Err(e) = Self::append(record, number, &failure) {
                warn!(error = %e, "Could not write failure record");
            }
        }
        self.failures.lock().push(failure);
        number
    }

    fn append(
        record: &Mutex<BufWriter<File>>,
        number: u64,
        failure: &FailureMessage,
    ) -> std::io::Result<()> {
        #[derive(Serialize)]
        struct Record<'a> {
            number: u64,
            #[serde(flatten)]
            failure: &'a FailureMessage,
        }

        let line = serde_json::to_string(&Record { number, failure })?;
        let mut writer = record.lock();
        writeln!(writer, "{}", line)?;
        writer.flush()
    }

    /// Total number of failures reported.
    pub fn count(&self) -> u64 {
        self.next_number.load(Ordering::SeqCst) - 1
    }

    /// Number of failures reported for one test.
    pub fn count_for(&self, test_id: &str) -> u64 {
        self.per_test.lock().get(test_id).copied().unwrap_or(0)
    }

    /// Copies all failures reported so far.
    pub fn failures(&self) -> Vec<FailureMessage> {
        self.failures.lock().clone()
    }

    /// Copies the failures reported for one test.
    pub fn failures_for(&self, test_id: &str) -> Vec<FailureMessage> {
        self.failures
            .lock()
            .iter()
            .filter(|f| f.test_id.as_deref() == Some(test_id))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_derives_agent() {
        let failure = FailureMessage::new(FailureType::WorkerException, "boom")
            .with_worker(SimulatorAddress::worker(2, 3))
            .with_test_id("foo")
            .with_phase(TestPhase::Run)
            .with_cause("panicked at 'boom'\nstack...");
        assert_eq!(failure.agent_address, Some(SimulatorAddress::agent(2)));
        assert_eq!(failure.summary(), "panicked at 'boom'");
    }

    #[test]
    fn test_worker_finished_types() {
        assert!(FailureType::WorkerAbnormalExit.is_worker_finished());
        assert!(FailureType::WorkerNormalExit.is_worker_finished());
        assert!(!FailureType::PhaseTimeout.is_worker_finished());
    }

    #[test]
    fn test_collector_numbers_and_counts() {
        let collector = FailureCollector::in_memory();
        let first = collector.report(FailureMessage::new(FailureType::BindError, "a").with_test_id("foo"));
        let second = collector.report(FailureMessage::new(FailureType::NetworkError, "b"));
        assert_eq!((first, second), (1, 2));
        assert_eq!(collector.count(), 2);
        assert_eq!(collector.count_for("foo"), 1);
        assert_eq!(collector.count_for("bar"), 0);
        assert_eq!(collector.failures_for("foo").len(), 1);
    }

    #[test]
    fn test_collector_writes_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let collector = FailureCollector::with_record_file(dir.path(), "s1").unwrap();
        collector.report(
            FailureMessage::new(FailureType::PhaseTimeout, "slow")
                .with_test(&TestCase::new("foo").with_class("SuccessTest")),
        );
        collector.report(FailureMessage::new(FailureType::NetworkError, "lost"));

        let contents = std::fs::read_to_string(collector.record_path().unwrap()).unwrap();
        let lines: Vec<_> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["number"], 1);
        assert_eq!(first["failure_type"], "PhaseTimeout");
        assert_eq!(first["test_id"], "foo");
    }
}

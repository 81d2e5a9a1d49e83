//! Coordinator-side registry of agents, workers and tests.
//!
//! Indices are handed out by monotonically increasing counters and are never
//! reused while the registry lives, even after the component they named has
//! been removed.

use crate::launcher::{WorkerProcessSettings, WorkerType};
use crate::phase::TestPhase;
use crate::test_case::TestCase;
use chrono::{DateTime, Utc};
use gridbench_env::SimulatorAddress;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("Agent {0} is not registered")]
    UnknownAgent(SimulatorAddress),

    #[error("Worker {0} is already registered")]
    DuplicateWorker(SimulatorAddress),

    #[error("Test id '{0}' is already in use")]
    DuplicateTestId(String),

    #[error("Test '{0}' is not registered")]
    UnknownTest(String),
}

/// A registered agent.
#[derive(Debug, Clone)]
pub struct AgentData {
    pub address: SimulatorAddress,

    pub public_address: String,

    pub private_address: String,

    /// Next worker index to hand out on this agent
    next_worker_index: u32,
}

impl AgentData {
    pub fn agent_index(&self) -> u32 {
        self.address.agent_index()
    }
}

/// A registered worker.
#[derive(Debug, Clone)]
pub struct WorkerData {
    pub address: SimulatorAddress,

    pub settings: WorkerProcessSettings,

    pub started_at: DateTime<Utc>,

    /// Global creation order; lower is older
    pub sequence: u64,
}

impl WorkerData {
    pub fn worker_type(&self) -> WorkerType {
        self.settings.worker_type
    }

    pub fn is_member(&self) -> bool {
        self.settings.worker_type.is_member()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestStatus {
    Pending,
    Running(TestPhase),
    Completed,
    Failed,
}

impl fmt::Display for TestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TestStatus::Pending => write!(f, "pending"),
            TestStatus::Running(phase) => write!(f, "running {}", phase),
            TestStatus::Completed => write!(f, "completed"),
            TestStatus::Failed => write!(f, "failed"),
        }
    }
}

/// A registered test.
#[derive(Debug, Clone)]
pub struct TestData {
    pub test_index: u32,

    /// Wildcard address reaching this test on every worker
    pub address: SimulatorAddress,

    pub test_case: TestCase,

    pub status: TestStatus,
}

/// All components taking part in a coordinator run.
#[derive(Debug, Default)]
pub struct ComponentRegistry {
    agents: Vec<AgentData>,
    workers: Vec<WorkerData>,
    tests: Vec<TestData>,
    next_agent_index: u32,
    next_test_index: u32,
    next_sequence: u64,
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // -------------------------------------------------------------------------
    // Agents
    // -------------------------------------------------------------------------

    /// Registers an agent and returns its freshly assigned address.
    pub fn add_agent(
        &mut self,
        public_address: impl Into<String>,
        private_address: impl Into<String>,
    ) -> SimulatorAddress {
        self.next_agent_index += 1;
        let address = SimulatorAddress::agent(self.next_agent_index);
        self.agents.push(AgentData {
            address,
            public_address: public_address.into(),
            private_address: private_address.into(),
            next_worker_index: 0,
        });
        address
    }

    /// Removes an agent together with its workers.
    pub fn remove_agent(&mut self, address: &SimulatorAddress) -> Option<AgentData> {
        let position = self.agents.iter().position(|a| &a.address == address)?;
        self.workers
            .retain(|w| w.address.agent_index() != address.agent_index());
        Some(self.agents.remove(position))
    }

    pub fn agents(&self) -> &[AgentData] {
        &self.agents
    }

    pub fn agent(&self, agent_index: u32) -> Option<&AgentData> {
        self.agents.iter().find(|a| a.agent_index() == agent_index)
    }

    pub fn agent_count(&self) -> usize {
        self.agents.len()
    }

    // -------------------------------------------------------------------------
    // Workers
    // -------------------------------------------------------------------------

    /// Reserves the next worker address on an agent.
    pub fn next_worker_address(
        &mut self,
        agent: &SimulatorAddress,
    ) -> Result<SimulatorAddress, RegistryError> {
        let data = self
            .agents
            .iter_mut()
            .find(|a| &a.address == agent)
            .ok_or(RegistryError::UnknownAgent(*agent))?;
        data.next_worker_index += 1;
        Ok(SimulatorAddress::worker(agent.agent_index(), data.next_worker_index))
    }

    /// Records a started worker.
    pub fn add_worker(
        &mut self,
        address: SimulatorAddress,
        settings: WorkerProcessSettings,
    ) -> Result<(), RegistryError> {
        let agent = SimulatorAddress::agent(address.agent_index());
        if self.agent(address.agent_index()).is_none() {
            return Err(RegistryError::UnknownAgent(agent));
        }
        if self.workers.iter().any(|w| w.address == address) {
            return Err(RegistryError::DuplicateWorker(address));
        }
        self.next_sequence += 1;
        self.workers.push(WorkerData {
            address,
            settings,
            started_at: Utc::now(),
            sequence: self.next_sequence,
        });
        Ok(())
    }

    pub fn remove_worker(&mut self, address: &SimulatorAddress) -> Option<WorkerData> {
        let position = self.workers.iter().position(|w| &w.address == address)?;
        Some(self.workers.remove(position))
    }

    /// Workers in creation order.
    pub fn workers(&self) -> &[WorkerData] {
        &self.workers
    }

    pub fn workers_of(&self, agent_index: u32) -> impl Iterator<Item = &WorkerData> {
        self.workers
            .iter()
            .filter(move |w| w.address.agent_index() == agent_index)
    }

    pub fn worker(&self, address: &SimulatorAddress) -> Option<&WorkerData> {
        self.workers.iter().find(|w| &w.address == address)
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// The oldest member worker still alive, if any.
    pub fn first_member_worker(&self) -> Option<&WorkerData> {
        self.workers
            .iter()
            .filter(|w| w.is_member())
            .min_by_key(|w| w.sequence)
    }

    /// The oldest member worker, falling back to the oldest worker.
    pub fn coordinating_worker(&self) -> Option<&WorkerData> {
        self.first_member_worker()
            .or_else(|| self.workers.iter().min_by_key(|w| w.sequence))
    }

    // -------------------------------------------------------------------------
    // Tests
    // -------------------------------------------------------------------------

    /// Registers a test case; its id must be unique.
    pub fn add_test(&mut self, test_case: TestCase) -> Result<TestData, RegistryError> {
        if self.tests.iter().any(|t| t.test_case.id() == test_case.id()) {
            return Err(RegistryError::DuplicateTestId(test_case.id().to_string()));
        }
        self.next_test_index += 1;
        let data = TestData {
            test_index: self.next_test_index,
            address: SimulatorAddress::test(0, 0, self.next_test_index),
            test_case,
            status: TestStatus::Pending,
        };
        self.tests.push(data.clone());
        Ok(data)
    }

    pub fn tests(&self) -> &[TestData] {
        &self.tests
    }

    pub fn test(&self, test_id: &str) -> Option<&TestData> {
        self.tests.iter().find(|t| t.test_case.id() == test_id)
    }

    pub fn test_by_index(&self, test_index: u32) -> Option<&TestData> {
        self.tests.iter().find(|t| t.test_index == test_index)
    }

    pub fn set_test_status(&mut self, test_id: &str, status: TestStatus) -> Result<(), RegistryError> {
        let test = self
            .tests
            .iter_mut()
            .find(|t| t.test_case.id() == test_id)
            .ok_or_else(|| RegistryError::UnknownTest(test_id.to_string()))?;
        test.status = status;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_with_workers() -> ComponentRegistry {
        let mut registry = ComponentRegistry::new();
        let a1 = registry.add_agent("10.0.0.1", "192.168.0.1");
        let a2 = registry.add_agent("10.0.0.2", "192.168.0.2");
        for (agent, worker_type) in [
            (a2, WorkerType::Client),
            (a1, WorkerType::Member),
            (a2, WorkerType::Member),
        ] {
            let address = registry.next_worker_address(&agent).unwrap();
            registry
                .add_worker(address, WorkerProcessSettings::new(address.worker_index(), worker_type))
                .unwrap();
        }
        registry
    }

    #[test]
    fn test_indices_are_never_reused() {
        let mut registry = ComponentRegistry::new();
        let a1 = registry.add_agent("a", "a");
        registry.remove_agent(&a1);
        let a2 = registry.add_agent("b", "b");
        assert_eq!(a2, SimulatorAddress::agent(2));

        let w1 = registry.next_worker_address(&a2).unwrap();
        registry.add_worker(w1, WorkerProcessSettings::new(1, WorkerType::Member)).unwrap();
        registry.remove_worker(&w1);
        let w2 = registry.next_worker_address(&a2).unwrap();
        assert_eq!(w2, SimulatorAddress::worker(2, 2));
    }

    #[test]
    fn test_first_member_is_oldest_member() {
        let registry = registry_with_workers();
        let first = registry.first_member_worker().unwrap();
        assert_eq!(first.address, SimulatorAddress::worker(1, 1));
        assert_eq!(registry.workers_of(2).count(), 2);
    }

    #[test]
    fn test_coordinating_worker_falls_back_to_clients() {
        let mut registry = ComponentRegistry::new();
        let agent = registry.add_agent("a", "a");
        let address = registry.next_worker_address(&agent).unwrap();
        registry
            .add_worker(address, WorkerProcessSettings::new(1, WorkerType::Client))
            .unwrap();
        assert!(registry.first_member_worker().is_none());
        assert_eq!(registry.coordinating_worker().map(|w| w.address), Some(address));
    }

    #[test]
    fn test_duplicate_test_id_rejected() {
        let mut registry = ComponentRegistry::new();
        let first = registry.add_test(TestCase::new("foo")).unwrap();
        assert_eq!(first.address, SimulatorAddress::test(0, 0, 1));
        assert_eq!(
            registry.add_test(TestCase::new("foo")).unwrap_err(),
            RegistryError::DuplicateTestId("foo".to_string())
        );
        registry.set_test_status("foo", TestStatus::Completed).unwrap();
        assert_eq!(registry.test("foo").map(|t| t.status), Some(TestStatus::Completed));
    }

    #[test]
    fn test_worker_requires_agent() {
        let mut registry = ComponentRegistry::new();
        let result = registry.add_worker(
            SimulatorAddress::worker(5, 1),
            WorkerProcessSettings::new(1, WorkerType::Member),
        );
        assert_eq!(result, Err(RegistryError::UnknownAgent(SimulatorAddress::agent(5))));
    }
}

//! A whole GridBench deployment inside one process.
//!
//! ```text
//! ┌──────────────────────────── SimCluster ─────────────────────────────┐
//! │  Coordinator                                                        │
//! │      │ sim://agent-1        │ sim://agent-2                         │
//! │  AgentRuntime A1        AgentRuntime A2                             │
//! │      │ sim://A1_W1 ...      │ sim://A2_W1 ...                       │
//! │  WorkerRuntime(s)       WorkerRuntime(s)   (InProcessLauncher)      │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```

use crate::launcher::InProcessLauncher;
use crate::network::SimNetwork;
use gridbench_core::{
    AgentConfig, AgentRuntime, Coordinator, CoordinatorConfig, CoordinatorError, MessageSchema,
    SchemaError, TestCatalog, WorkerConfig, WorkerType,
};
use gridbench_env::{SimulatorAddress, TransportConfig};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum SimError {
    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),

    #[error("Agent was registered as {actual}, expected {expected}")]
    AgentMismatch {
        expected: SimulatorAddress,
        actual: SimulatorAddress,
    },
}

/// Shape and tuning of a simulated cluster.
#[derive(Debug, Clone)]
pub struct SimClusterConfig {
    /// Number of agents (default: 1)
    pub agents: u32,

    /// Workers started on every agent (default: 1)
    pub workers_per_agent: usize,

    /// Type of the started workers (default: member)
    pub worker_type: WorkerType,

    pub transport: TransportConfig,
    pub coordinator: CoordinatorConfig,
    pub agent: AgentConfig,
    pub worker: WorkerConfig,
}

impl Default for SimClusterConfig {
    fn default() -> Self {
        Self {
            agents: 1,
            workers_per_agent: 1,
            worker_type: WorkerType::Member,
            transport: TransportConfig::default()
                .with_reconnect_attempts(2)
                .with_reconnect_backoff(Duration::from_millis(10))
                .with_response_timeout(Duration::from_secs(5)),
            coordinator: CoordinatorConfig::default()
                .with_phase_timeout(Duration::from_secs(10))
                .with_run_duration(Duration::from_millis(200)),
            agent: AgentConfig::default()
                .with_forward_timeout(Duration::from_secs(5))
                .with_monitor_interval(Duration::from_millis(20)),
            worker: WorkerConfig::default(),
        }
    }
}

impl SimClusterConfig {
    pub fn with_agents(mut self, agents: u32) -> Self {
        self.agents = agents;
        self
    }

    pub fn with_workers_per_agent(mut self, workers: usize) -> Self {
        self.workers_per_agent = workers;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.coordinator = self.coordinator.with_seed(seed);
        self
    }

    pub fn with_run_duration(mut self, duration: Duration) -> Self {
        self.coordinator = self.coordinator.with_run_duration(duration);
        self
    }

    pub fn with_phase_timeout(mut self, timeout: Duration) -> Self {
        self.coordinator = self.coordinator.with_phase_timeout(timeout);
        self
    }
}

/// Coordinator, agents and workers wired over a [`SimNetwork`].
pub struct SimCluster {
    network: Arc<SimNetwork>,
    launcher: Arc<InProcessLauncher>,
    coordinator: Coordinator,
    agents: Vec<AgentRuntime>,
}

impl SimCluster {
    /// Starts the agents, registers them and starts their workers.
    pub async fn start(config: SimClusterConfig, catalog: TestCatalog) -> Result<Self, SimError> {
        let schema = Arc::new(MessageSchema::standard()?);
        let network = SimNetwork::new();
        let launcher = Arc::new(InProcessLauncher::new(
            Arc::clone(&network),
            Arc::clone(&schema),
            catalog,
            config.worker.clone(),
        ));
        let coordinator = Coordinator::new(
            config.coordinator.clone(),
            config.transport.clone(),
            Arc::clone(&schema),
        )?;

        let mut cluster = Self {
            network,
            launcher,
            coordinator,
            agents: Vec::new(),
        };
        for agent_index in 1..=config.agents {
            let expected = SimulatorAddress::agent(agent_index);
            let endpoint = format!("agent-{}", agent_index);
            let listener = cluster.network.listen(&endpoint);
            cluster.agents.push(AgentRuntime::start(
                expected,
                config.agent.clone(),
                config.transport.clone(),
                Arc::clone(&schema),
                cluster.launcher.clone(),
                listener,
            ));

            let actual = cluster
                .coordinator
                .add_agent(cluster.network.dialer(&endpoint), endpoint.clone(), endpoint)
                .await?;
            if actual != expected {
                return Err(SimError::AgentMismatch { expected, actual });
            }
            cluster
                .coordinator
                .create_workers(actual, config.workers_per_agent, config.worker_type)
                .await?;
        }

        info!(
            agents = config.agents,
            workers = cluster.coordinator.worker_count(),
            "Simulated cluster started"
        );
        Ok(cluster)
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    pub fn network(&self) -> &Arc<SimNetwork> {
        &self.network
    }

    pub fn launcher(&self) -> &Arc<InProcessLauncher> {
        &self.launcher
    }

    pub fn agents(&self) -> &[AgentRuntime] {
        &self.agents
    }

    /// Kills a worker without telling its agent.
    pub fn crash_worker(&self, address: &SimulatorAddress) -> bool {
        self.launcher.crash(address)
    }

    /// Terminates all workers and stops every component.
    pub async fn shutdown(self) {
        self.coordinator.shutdown().await;
        for agent in &self.agents {
            agent.shutdown();
        }
        info!("Simulated cluster stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridbench_core::{builtin_catalog, Operation, TargetExpression, TestCase, TestPhase, TestStatus};

    fn fast() -> SimClusterConfig {
        SimClusterConfig::default().with_seed(7)
    }

    /// Workers release a container right after publishing its final state.
    async fn assert_no_containers_left(cluster: &SimCluster) {
        let workers = cluster.launcher().running();
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        loop {
            let hosted: Vec<_> = workers
                .iter()
                .map(|worker| cluster.launcher().container_count(worker))
                .collect();
            if hosted.iter().all(|count| *count == Some(0)) {
                return;
            }
            assert!(
                std::time::Instant::now() < deadline,
                "containers left on {:?}: {:?}",
                workers,
                hosted
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_cluster_starts_workers() {
        let cluster = SimCluster::start(fast().with_agents(2).with_workers_per_agent(2), builtin_catalog())
            .await
            .unwrap();
        assert_eq!(cluster.coordinator().worker_count(), 4);
        assert_eq!(cluster.launcher().running().len(), 4);
        cluster.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_success_test_completes_without_failures() {
        let cluster = SimCluster::start(fast(), builtin_catalog()).await.unwrap();
        let outcome = cluster
            .coordinator()
            .run_test(
                TestCase::new("foo")
                    .with_class("SuccessTest")
                    .with_property("threadCount", "1"),
            )
            .await
            .unwrap();

        assert!(outcome.is_success(), "{:?}", outcome);
        assert_eq!(cluster.coordinator().test_status("foo"), Some(TestStatus::Completed));
        assert_eq!(cluster.coordinator().failures().count(), 0);
        cluster.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_stop_right_after_run_starts() {
        let cluster = SimCluster::start(fast().with_run_duration(Duration::ZERO), builtin_catalog())
            .await
            .unwrap();
        let started = std::time::Instant::now();
        let outcome = cluster
            .coordinator()
            .run_test(TestCase::new("stop").with_class("SuccessTest"))
            .await
            .unwrap();
        assert!(outcome.is_success(), "{:?}", outcome);
        assert!(started.elapsed() < Duration::from_secs(10));
        cluster.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_failing_phase_fails_only_that_test() {
        let cluster = SimCluster::start(fast().with_workers_per_agent(2), builtin_catalog())
            .await
            .unwrap();
        let results = cluster
            .coordinator()
            .run_tests(vec![
                TestCase::new("bad")
                    .with_class("FailingTest")
                    .with_property("failPhase", "LOCAL_PREPARE"),
                TestCase::new("good").with_class("SuccessTest"),
            ])
            .await;

        let bad = results[0].as_ref().unwrap();
        assert_eq!(bad.failed_phase, Some(TestPhase::LocalPrepare));
        assert!(bad.failure_count >= 1);
        let good = results[1].as_ref().unwrap();
        assert!(good.is_success(), "{:?}", good);
        cluster.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_healthy_peer_is_torn_down_after_global_failure() {
        let cluster = SimCluster::start(fast().with_workers_per_agent(2), builtin_catalog())
            .await
            .unwrap();
        // GLOBAL_VERIFY only runs on the coordinating worker, so the other
        // worker's container is healthy when the test fails.
        let outcome = cluster
            .coordinator()
            .run_test(
                TestCase::new("half")
                    .with_class("FailingTest")
                    .with_property("failPhase", "GLOBAL_VERIFY"),
            )
            .await
            .unwrap();
        assert_eq!(outcome.failed_phase, Some(TestPhase::GlobalVerify));

        assert_eq!(cluster.launcher().running().len(), 2);
        assert_no_containers_left(&cluster).await;
        cluster.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_local_failure_leaves_no_containers() {
        let cluster = SimCluster::start(fast().with_workers_per_agent(2), builtin_catalog())
            .await
            .unwrap();
        let outcome = cluster
            .coordinator()
            .run_test(
                TestCase::new("early")
                    .with_class("FailingTest")
                    .with_property("failPhase", "LOCAL_PREPARE"),
            )
            .await
            .unwrap();
        assert_eq!(outcome.failed_phase, Some(TestPhase::LocalPrepare));

        // A following test runs normally on the same workers.
        let next = cluster
            .coordinator()
            .run_test(TestCase::new("next").with_class("SuccessTest"))
            .await
            .unwrap();
        assert!(next.is_success(), "{:?}", next);
        assert!(next.performance.operation_count > 0);
        assert_no_containers_left(&cluster).await;
        cluster.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_ping_random_worker() {
        let cluster = SimCluster::start(fast().with_agents(2), builtin_catalog()).await.unwrap();
        let targets: TargetExpression = "Agent=R,Worker=*".parse().unwrap();
        let response = cluster
            .coordinator()
            .send_to_targets(&targets, &Operation::ping("hello"))
            .await
            .unwrap();
        assert!(response.is_success());
        assert_eq!(response.parts.len(), 1);
        cluster.shutdown().await;
    }
}

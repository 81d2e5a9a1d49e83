//! Workers running as tasks of the simulator process.

use crate::network::SimNetwork;
use async_trait::async_trait;
use gridbench_core::{
    LaunchError, LaunchedWorker, MessageSchema, TestCatalog, WorkerConfig, WorkerExit, WorkerLauncher,
    WorkerProcess, WorkerProcessSettings, WorkerRuntime,
};
use gridbench_env::SimulatorAddress;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Time left to a terminating worker to flush its last answer.
const EXIT_GRACE: Duration = Duration::from_millis(50);

/// Shared between the process handle and the exit watcher.
struct WorkerState {
    runtime: WorkerRuntime,
    exit: Mutex<Option<WorkerExit>>,
}

impl WorkerState {
    fn stop(&self, network: &SimNetwork, exit: WorkerExit) {
        let mut current = self.exit.lock();
        if current.is_some() {
            return;
        }
        *current = Some(exit);
        self.runtime.shutdown();
        network.close(&self.runtime.address().to_string());
    }
}

/// Starts every worker as a [`WorkerRuntime`] on the simulated network.
pub struct InProcessLauncher {
    network: Arc<SimNetwork>,
    schema: Arc<MessageSchema>,
    catalog: TestCatalog,
    config: WorkerConfig,
    workers: Mutex<BTreeMap<SimulatorAddress, Arc<WorkerState>>>,
}

impl InProcessLauncher {
    pub fn new(
        network: Arc<SimNetwork>,
        schema: Arc<MessageSchema>,
        catalog: TestCatalog,
        config: WorkerConfig,
    ) -> Self {
        Self {
            network,
            schema,
            catalog,
            config,
            workers: Mutex::new(BTreeMap::new()),
        }
    }

    /// Addresses of the workers that have not exited.
    pub fn running(&self) -> Vec<SimulatorAddress> {
        self.workers
            .lock()
            .iter()
            .filter(|(_, state)| state.exit.lock().is_none())
            .map(|(address, _)| *address)
            .collect()
    }

    /// Number of tests hosted by a running worker.
    pub fn container_count(&self, address: &SimulatorAddress) -> Option<usize> {
        self.workers
            .lock()
            .get(address)
            .map(|state| state.runtime.processor().container_count())
    }

    /// Kills a worker behind its agent's back.
    pub fn crash(&self, address: &SimulatorAddress) -> bool {
        let state = self.workers.lock().get(address).cloned();
        match state {
            Some(state) => {
                warn!(worker = %address, "Crashing worker");
                state.stop(&self.network, WorkerExit { code: Some(137) });
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl WorkerLauncher for InProcessLauncher {
    async fn launch(
        &self,
        address: SimulatorAddress,
        settings: &WorkerProcessSettings,
    ) -> Result<LaunchedWorker, LaunchError> {
        let endpoint = address.to_string();
        let listener = self.network.listen(&endpoint);
        let runtime = WorkerRuntime::start(
            address,
            self.config.clone(),
            self.catalog.clone(),
            Arc::clone(&self.schema),
            listener,
        );
        let state = Arc::new(WorkerState {
            runtime,
            exit: Mutex::new(None),
        });
        self.workers.lock().insert(address, Arc::clone(&state));

        let watcher = Arc::clone(&state);
        let network = Arc::clone(&self.network);
        tokio::spawn(async move {
            watcher.runtime.wait_for_shutdown().await;
            tokio::time::sleep(EXIT_GRACE).await;
            watcher.stop(&network, WorkerExit { code: Some(0) });
        });

        info!(worker = %address, worker_type = %settings.worker_type, "In-process worker started");
        Ok(LaunchedWorker {
            dialer: self.network.dialer(&endpoint),
            process: Box::new(InProcessWorker {
                address,
                state,
                network: Arc::clone(&self.network),
            }),
        })
    }
}

/// Process handle of an in-process worker.
struct InProcessWorker {
    address: SimulatorAddress,
    state: Arc<WorkerState>,
    network: Arc<SimNetwork>,
}

impl WorkerProcess for InProcessWorker {
    fn id(&self) -> String {
        format!("sim-{}", self.address)
    }

    fn try_exit(&mut self) -> Option<WorkerExit> {
        *self.state.exit.lock()
    }

    fn kill(&mut self) {
        self.state.stop(&self.network, WorkerExit { code: None });
    }
}

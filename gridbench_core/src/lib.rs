//! GridBench core
//!
//! Coordination protocol and test lifecycle engine of a distributed
//! benchmark for data grids.
//!
//! ```text
//!   Coordinator ─────────────▶ Agent ─────────────▶ Worker ───▶ TestContainer
//!   registry, targets,         launches and         hosts test    phases, RUN
//!   phase barrier, reports     monitors workers     containers    threads, probes
//! ```
//!
//! 1. **Protocol**: typed [`Operation`]s encoded through a [`MessageSchema`]
//!    into the wire messages of `gridbench_env`.
//! 2. **Lifecycle**: a [`TestDefinition`] binds a [`TestCase`] to a test
//!    instance; a [`TestContainer`] drives it through the [`TestPhase`]s.
//! 3. **Coordination**: the [`Coordinator`] runs each phase on every worker
//!    and waits for all of them before starting the next one.

pub mod agent_runtime;
pub mod codec;
pub mod config;
pub mod container;
pub mod coordinator;
pub mod definition;
pub mod failure;
pub mod launcher;
pub mod operation;
pub mod performance;
pub mod phase;
pub mod registry;
pub mod routing;
pub mod schema;
pub mod streamer;
pub mod target;
pub mod test_case;
pub mod test_runner;
pub mod upstream;
pub mod worker_runtime;
pub mod workloads;

// Re-export key types for convenience
pub use agent_runtime::{AgentConfig, AgentProcessor, AgentRuntime};
pub use codec::{CodecError, OperationCodec};
pub use config::{ConfigError, GridConfig};
pub use container::{ContainerError, ContainerState, TestContainer};
pub use coordinator::{Coordinator, CoordinatorConfig, CoordinatorError, CoordinatorProcessor};
pub use definition::{ensure, BindError, BoundTest, TestCatalog, TestContext, TestDefinition, TestError};
pub use failure::{FailureCollector, FailureMessage, FailureType};
pub use launcher::{
    LaunchError, LaunchedWorker, ProcessWorkerLauncher, WorkerExit, WorkerLauncher, WorkerProcess,
    WorkerProcessSettings, WorkerType, LISTENING_PREFIX,
};
pub use operation::{Operation, OperationKind, PhaseCompletion};
pub use performance::{IntervalStats, PerformanceCollector, PerformanceState, Probe};
pub use phase::TestPhase;
pub use registry::{ComponentRegistry, RegistryError, TestStatus};
pub use routing::{next_hop, ChildSelector, NextHop, RoutingError};
pub use schema::{MessageSchema, SchemaError};
pub use streamer::{AsyncStore, Streamer, StreamerConfig, StreamerError};
pub use target::{TargetError, TargetExpression};
pub use test_case::TestCase;
pub use test_runner::{TestCaseRunner, TestOutcome};
pub use worker_runtime::{WorkerConfig, WorkerProcessor, WorkerRuntime};
pub use workloads::builtin_catalog;

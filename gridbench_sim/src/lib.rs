//! GridBench simulation harness
//!
//! Runs a complete deployment (coordinator, agents, workers) inside one
//! process. Workers are [`gridbench_core::WorkerRuntime`]s started by an
//! in-process launcher, and every link runs over an in-memory network that
//! speaks the same framing as TCP.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        SimCluster                            │
//! │  ┌────────────┐   sim://agent-N   ┌──────────────┐           │
//! │  │ Coordinator│──────────────────►│ AgentRuntime │ ...       │
//! │  └────────────┘                   └──────┬───────┘           │
//! │                                          │ sim://AN_WM       │
//! │                                   ┌──────▼───────┐           │
//! │                                   │WorkerRuntime │ ...       │
//! │                                   └──────────────┘           │
//! │  ┌───────────────────────────────────────────────────────┐   │
//! │  │ SimNetwork + SimNetworkController (partition / sever) │   │
//! │  └───────────────────────────────────────────────────────┘   │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use gridbench_sim::{SimCluster, SimClusterConfig};
//!
//! let cluster = SimCluster::start(
//!     SimClusterConfig::default().with_agents(2),
//!     gridbench_core::builtin_catalog(),
//! ).await?;
//! let outcome = cluster.coordinator().run_test(TestCase::new("foo")).await?;
//! ```

mod cluster;
mod launcher;
mod network;
mod runner;
pub mod scenarios;

pub use cluster::{SimCluster, SimClusterConfig, SimError};
pub use launcher::InProcessLauncher;
pub use network::{SimDialer, SimListener, SimNetwork, SimNetworkController};
pub use runner::{ScenarioResult, ScenarioRunner};

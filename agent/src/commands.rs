//! The three roles of the `gridbench` binary.

use crate::suite::{load_suite, parse_property};
use anyhow::{bail, Context, Result};
use clap::Args;
use gridbench_core::{
    builtin_catalog, AgentRuntime, Coordinator, GridConfig, MessageSchema, ProcessWorkerLauncher,
    TestCase, TestOutcome, WorkerRuntime, WorkerType, LISTENING_PREFIX,
};
use gridbench_env::{SimulatorAddress, TcpDialer, TcpListener};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

// =============================================================================
// COORDINATOR
// =============================================================================

#[derive(Args, Debug)]
pub struct CoordinatorArgs {
    /// Agent endpoints (host:port), in agent index order
    #[arg(short, long = "agent", required = true)]
    agents: Vec<String>,

    /// Workers started on every agent
    #[arg(short, long, default_value = "1")]
    workers: usize,

    /// Type of the started workers (member, client)
    #[arg(long = "type", default_value = "member")]
    worker_type: WorkerType,

    /// TOML test suite; ignored if --class is given
    #[arg(long)]
    suite: Option<PathBuf>,

    /// Class of a single test to run
    #[arg(long)]
    class: Option<String>,

    /// Id of the single test
    #[arg(long, default_value = "test")]
    test_id: String,

    /// Property of the single test (key=value, repeatable)
    #[arg(short = 'p', long = "property", value_parser = parse_property)]
    properties: Vec<(String, String)>,

    /// RUN phase duration; overrides the configuration
    #[arg(short, long)]
    duration_ms: Option<u64>,

    /// Seed for random target selection
    #[arg(long)]
    seed: Option<u64>,

    /// Directory for the failure record
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Run the tests in parallel instead of one after another
    #[arg(long)]
    parallel: bool,

    /// Print outcomes as JSON
    #[arg(long)]
    json: bool,
}

impl CoordinatorArgs {
    fn test_cases(&self) -> Result<Vec<TestCase>> {
        if let Some(class) = &self.class {
            let mut test_case = TestCase::new(self.test_id.as_str()).with_class(class);
            for (key, value) in &self.properties {
                test_case.set_property(key.as_str(), value);
            }
            return Ok(vec![test_case]);
        }
        match &self.suite {
            Some(path) => load_suite(path),
            None => bail!("Either --class or --suite is required"),
        }
    }
}

pub async fn run_coordinator(config: GridConfig, args: CoordinatorArgs) -> Result<()> {
    let test_cases = args.test_cases()?;
    if test_cases.is_empty() {
        bail!("No tests to run");
    }

    let mut coordinator_config = config.coordinator;
    if let Some(ms) = args.duration_ms {
        coordinator_config = coordinator_config.with_run_duration(Duration::from_millis(ms));
    }
    if let Some(seed) = args.seed {
        coordinator_config = coordinator_config.with_seed(seed);
    }
    if let Some(dir) = &args.output_dir {
        coordinator_config = coordinator_config.with_output_dir(dir);
    }

    let schema = Arc::new(MessageSchema::standard()?);
    let coordinator = Coordinator::new(coordinator_config, config.transport, schema)?;
    info!(session_id = %coordinator.session_id(), "Starting session");

    for endpoint in &args.agents {
        let agent = coordinator
            .add_agent(Arc::new(TcpDialer::new(endpoint.as_str())), endpoint.as_str(), endpoint.as_str())
            .await
            .with_context(|| format!("Could not register agent {}", endpoint))?;
        coordinator
            .create_workers(agent, args.workers, args.worker_type)
            .await
            .with_context(|| format!("Could not start workers on {}", agent))?;
    }

    let outcomes = if args.parallel {
        coordinator.run_tests(test_cases).await
    } else {
        let mut outcomes = Vec::with_capacity(test_cases.len());
        for test_case in test_cases {
            outcomes.push(coordinator.run_test(test_case).await);
        }
        outcomes
    };

    let mut completed: Vec<TestOutcome> = Vec::new();
    let mut errors = 0;
    for outcome in outcomes {
        match outcome {
            Ok(outcome) => completed.push(outcome),
            Err(e) => {
                error!(error = %e, "Test could not be run");
                errors += 1;
            }
        }
    }
    let failed = completed.iter().filter(|o| !o.is_success()).count() + errors;

    if args.json {
        let summary = serde_json::json!({
            "session_id": coordinator.session_id(),
            "failures": coordinator.failures().count(),
            "tests": completed,
        });
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        for outcome in &completed {
            if outcome.is_success() {
                info!(
                    "✓ {} completed in {} ms ({} operations)",
                    outcome.test_id, outcome.duration_ms, outcome.performance.operation_count
                );
            } else {
                error!(
                    "✗ {} {}: {}",
                    outcome.test_id,
                    outcome.status,
                    outcome.failure_reason.as_deref().unwrap_or("unknown")
                );
            }
        }
    }

    coordinator.shutdown().await;
    if failed > 0 {
        bail!("{} test(s) failed", failed);
    }
    Ok(())
}

// =============================================================================
// AGENT
// =============================================================================

#[derive(Args, Debug)]
pub struct AgentArgs {
    /// Index the coordinator assigns to this agent (1-based)
    #[arg(short, long)]
    index: u32,

    /// Address to listen on for the coordinator
    #[arg(short, long, default_value = "0.0.0.0:9001")]
    listen: String,
}

pub async fn run_agent(config: GridConfig, args: AgentArgs) -> Result<()> {
    if args.index == 0 {
        bail!("Agent index starts at 1");
    }
    let address = SimulatorAddress::agent(args.index);
    let listener = TcpListener::bind(&args.listen)
        .await
        .with_context(|| format!("Could not listen on {}", args.listen))?;
    info!(agent = %address, endpoint = %listener.local_addr(), "Listening");

    let launcher = ProcessWorkerLauncher::current_exe(config.agent.worker_startup_timeout())
        .context("Could not locate the gridbench binary")?;
    let schema = Arc::new(MessageSchema::standard()?);
    let runtime = AgentRuntime::start(
        address,
        config.agent,
        config.transport,
        schema,
        Arc::new(launcher),
        Arc::new(listener),
    );

    tokio::signal::ctrl_c().await.context("Could not wait for Ctrl-C")?;
    runtime.shutdown();
    Ok(())
}

// =============================================================================
// WORKER
// =============================================================================

/// Time left to the last response before the links close.
const EXIT_GRACE: Duration = Duration::from_millis(100);

#[derive(Args, Debug)]
pub struct WorkerArgs {
    /// Address of this worker (e.g. A1_W2)
    #[arg(short, long)]
    address: String,

    /// Worker type (member, client)
    #[arg(long = "type", default_value = "member")]
    worker_type: WorkerType,

    /// Address to listen on for the agent
    #[arg(short, long, default_value = "127.0.0.1:0")]
    listen: String,
}

pub async fn run_worker(config: GridConfig, args: WorkerArgs) -> Result<()> {
    let address: SimulatorAddress = args.address.parse()?;
    if address.worker_index() == 0 || address.test_index() != 0 {
        bail!("{} is not a worker address", address);
    }
    let listener = TcpListener::bind(&args.listen)
        .await
        .with_context(|| format!("Could not listen on {}", args.listen))?;
    let port = listener.local_addr().port();

    let schema = Arc::new(MessageSchema::standard()?);
    let runtime = WorkerRuntime::start(address, config.worker, builtin_catalog(), schema, Arc::new(listener));
    info!(worker = %address, worker_type = %args.worker_type, port, "Worker listening");

    {
        let mut stdout = std::io::stdout().lock();
        writeln!(stdout, "{}{}", LISTENING_PREFIX, port)?;
        stdout.flush()?;
    }

    tokio::select! {
        _ = runtime.wait_for_shutdown() => {
            tokio::time::sleep(EXIT_GRACE).await;
        }
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                warn!(error = %e, "Could not wait for Ctrl-C");
            }
        }
    }
    runtime.shutdown();
    Ok(())
}

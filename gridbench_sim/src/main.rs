//! GridBench simulator CLI
//!
//! Runs end-to-end scenarios against an in-process cluster.

use anyhow::{bail, Context, Result};
use clap::Parser;
use gridbench_sim::scenarios::ScenarioId;
use gridbench_sim::{ScenarioResult, ScenarioRunner};
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// GridBench in-process simulation CLI
#[derive(Parser, Debug)]
#[command(name = "gridbench-sim")]
#[command(about = "Run end-to-end GridBench scenarios in one process", long_about = None)]
struct Args {
    /// Seed for random targeting (0 = random)
    #[arg(short, long, default_value = "42")]
    seed: u64,

    /// Scenario to run (success, stop_before_run, failing_test, bind_error, multi_agent, worker_crash, all)
    #[arg(short = 'S', long, default_value = "all")]
    scenario: String,

    /// Number of seeds to run every scenario with
    #[arg(long, default_value = "1")]
    seeds: usize,

    /// RUN phase duration of the scenario tests
    #[arg(long, default_value = "300")]
    run_duration_ms: u64,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// JSON output for CI parsing
    #[arg(long)]
    json: bool,
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn parse_scenarios(arg: &str) -> Result<Vec<ScenarioId>> {
    if arg == "all" {
        return Ok(ScenarioId::all());
    }
    arg.split(',')
        .map(|name| name.trim().parse::<ScenarioId>().map_err(anyhow::Error::msg))
        .collect::<Result<Vec<_>>>()
        .context("Available scenarios: success, stop_before_run, failing_test, bind_error, multi_agent, worker_crash, all")
}

fn summary_json(results: &[ScenarioResult]) -> serde_json::Value {
    let failed = results.iter().filter(|r| !r.passed).count();
    serde_json::json!({
        "total": results.len(),
        "passed": results.len() - failed,
        "failed": failed,
        "results": results.iter().map(|r| {
            serde_json::json!({
                "scenario": r.scenario.name(),
                "seed": r.seed,
                "passed": r.passed,
                "duration_ms": r.duration_ms,
                "failures": r.failures,
                "tests": r.tests,
                "failure_reason": r.failure_reason,
            })
        }).collect::<Vec<_>>(),
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    let scenarios = parse_scenarios(&args.scenario)?;
    let base_seed = if args.seed == 0 { rand::random() } else { args.seed };

    if !args.json {
        info!("GridBench simulator v{}", env!("CARGO_PKG_VERSION"));
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    }

    let mut results: Vec<ScenarioResult> = Vec::new();
    for seed_offset in 0..args.seeds {
        let seed = base_seed.wrapping_add(seed_offset as u64);
        let runner = ScenarioRunner::new(seed)
            .with_run_duration(Duration::from_millis(args.run_duration_ms));

        for scenario in &scenarios {
            let result = runner.run(*scenario).await;
            if !args.json {
                if result.passed {
                    info!("✓ {} (seed={}) PASSED in {} ms", scenario.name(), seed, result.duration_ms);
                } else {
                    error!(
                        "✗ {} (seed={}) FAILED: {}",
                        scenario.name(),
                        seed,
                        result.failure_reason.as_deref().unwrap_or("unknown")
                    );
                }
            }
            results.push(result);
        }
    }

    let failed = results.iter().filter(|r| !r.passed).count();
    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary_json(&results))?);
    } else {
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
        if failed == 0 {
            info!("All {} scenario runs passed", results.len());
        } else {
            error!("{}/{} scenario runs failed", failed, results.len());
        }
    }

    if failed > 0 {
        bail!("{} scenario run(s) failed", failed);
    }
    Ok(())
}

//! mwgrid Scenario CLI
//!
//! Run kernel scenarios and check the reports every agent produced.

use clap::Parser;
use mwgrid_sim::scenarios::ScenarioId;
use mwgrid_sim::{RunExport, ScenarioResult, ScenarioRunner};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// mwgrid kernel scenario runner
#[derive(Parser, Debug)]
#[command(name = "mwgrid-sim")]
#[command(about = "Run optimistic simulation kernel scenarios", long_about = None)]
struct Args {
    /// Master seed for determinism (0 = random from time)
    #[arg(short, long, default_value = "42")]
    seed: u64,

    /// Number of agents per scenario
    #[arg(short, long, default_value = "8")]
    agents: usize,

    /// Scenario to run (random_walk, validation, messaging, spawning, contention, distributed_walk, all)
    #[arg(short = 'S', long, default_value = "all")]
    scenario: String,

    /// Last simulated time unit
    #[arg(short, long, default_value = "20")]
    end_time: i64,

    /// Worker ranks for distributed scenarios
    #[arg(short, long, default_value = "2")]
    workers: u32,

    /// Directory for the bootstrap file of distributed scenarios
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// JSON output for CI parsing
    #[arg(long)]
    json: bool,

    /// Export every report of a single scenario to a JSON file
    #[arg(long)]
    export: Option<PathBuf>,
}

fn main() {
    let args = Args::parse();

    // Initialize logging; RUST_LOG wins over --verbose
    let default_level = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    if let Err(e) = tracing_subscriber::fmt().with_env_filter(filter).try_init() {
        eprintln!("Failed to set tracing subscriber: {}", e);
    }

    if !args.json {
        info!("mwgrid scenario runner v{}", env!("CARGO_PKG_VERSION"));
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    }

    // Parse scenarios
    let scenarios: Vec<ScenarioId> = if args.scenario == "all" {
        ScenarioId::all()
    } else {
        vec![args.scenario.parse().unwrap_or_else(|e| {
            eprintln!("Error: {}", e);
            let names: Vec<&str> = ScenarioId::all().iter().map(|s| s.name()).collect();
            eprintln!("Available scenarios: {}, all", names.join(", "));
            std::process::exit(1);
        })]
    };

    // Determine seed
    let seed = if args.seed == 0 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(1)
    } else {
        args.seed
    };

    let mut runner = ScenarioRunner::new(seed, args.agents)
        .with_end_time(args.end_time)
        .with_workers(args.workers);
    if let Some(dir) = &args.data_dir {
        runner = runner.with_data_dir(dir);
    }

    // Handle --export mode
    if let Some(export_path) = &args.export {
        if scenarios.len() > 1 {
            eprintln!("Error: --export only supports a single scenario, not 'all'");
            std::process::exit(1);
        }
        let scenario = scenarios[0];
        let (result, log) = runner.run_logged(scenario);

        let mut export = RunExport::new(scenario.name(), seed).with_reports(&log);
        export.finalize(result.passed, result.failure_reason.clone(), Some(result.summary.clone()));
        match export.write_to_file(export_path) {
            Ok(()) => info!("Exported {} reports to {}", export.reports.len(), export_path.display()),
            Err(e) => error!("Failed to write export: {:?}", e),
        }

        log_result(&result);
        if !result.passed {
            std::process::exit(1);
        }
        return;
    }

    let mut all_results: Vec<ScenarioResult> = Vec::new();
    for scenario in &scenarios {
        let result = runner.run(*scenario);
        if !args.json {
            log_result(&result);
        }
        all_results.push(result);
    }

    // Summary
    let total = all_results.len();
    let failed_count = all_results.iter().filter(|r| !r.passed).count();
    let passed = total - failed_count;

    if args.json {
        let summary = serde_json::json!({
            "total": total,
            "passed": passed,
            "failed": failed_count,
            "results": all_results.iter().map(|r| {
                serde_json::json!({
                    "scenario": r.scenario.name(),
                    "seed": r.seed,
                    "passed": r.passed,
                    "entities": r.final_entity_count,
                    "summary": r.summary,
                    "failure_reason": r.failure_reason,
                })
            }).collect::<Vec<_>>(),
        });
        match serde_json::to_string_pretty(&summary) {
            Ok(text) => println!("{}", text),
            Err(e) => error!("Failed to render summary: {}", e),
        }
    } else {
        info!("");
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

        if failed_count == 0 {
            info!("✅ All {} scenario runs passed!", total);
        } else {
            error!("❌ {}/{} scenario runs failed!", failed_count, total);
            for result in all_results.iter().filter(|r| !r.passed) {
                error!(
                    "  - {} seed={}: {}",
                    result.scenario.name(),
                    result.seed,
                    result.failure_reason.as_deref().unwrap_or("unknown")
                );
            }
        }
    }

    // Exit with proper code for CI
    if failed_count > 0 {
        std::process::exit(1);
    }
}

fn log_result(result: &ScenarioResult) {
    if result.passed {
        info!(
            "✓ {} (seed={}) PASSED - {} rounds, {} steps, {} rollbacks",
            result.scenario.name(),
            result.seed,
            result.summary.rounds,
            result.summary.steps,
            result.summary.rollbacks
        );
    } else {
        error!(
            "✗ {} (seed={}) FAILED: {}",
            result.scenario.name(),
            result.seed,
            result.failure_reason.as_deref().unwrap_or("unknown")
        );
    }
}

//! # Datachain Rope Fleet Benchmark CLI
//!
//! Command-line interface for running load experiments from a driver fleet.
//!
//! ## Usage
//!
//! ```bash
//! # Ramp the configured load over 10 iterations
//! rope-fleetbench run --config fleetbench.toml --iterations 10 --rps-step 200
//!
//! # Print targets, subnet and driver machines
//! rope-fleetbench resolve --config fleetbench.toml
//! ```

use anyhow::Context;
use clap::{Parser, Subcommand};
use rope_fleetbench::config::LoggingConfig;
use rope_fleetbench::prelude::*;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// File the orchestration metrics are written to, in the output directory
const METRICS_FILE: &str = "metrics.prom";

#[derive(Parser)]
#[command(name = "rope-fleetbench")]
#[command(author = "Datachain Rope Team")]
#[command(version)]
#[command(about = "Fleet load experiments for Datachain Rope testnets", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an experiment, raising the load every iteration
    Run {
        /// Experiment configuration file
        #[arg(short, long)]
        config: PathBuf,

        /// Number of iterations
        #[arg(short, long, default_value = "1")]
        iterations: u32,

        /// Requests per second of the first iteration (defaults to the configured rate)
        #[arg(long)]
        initial_rps: Option<u64>,

        /// Requests per second added every iteration
        #[arg(long, default_value = "0")]
        rps_step: u64,

        /// Duration of every workload in seconds
        #[arg(short, long, default_value = "300")]
        duration: u64,
    },

    /// Resolve targets and driver machines without touching the fleet
    Resolve {
        /// Experiment configuration file
        #[arg(short, long)]
        config: PathBuf,
    },
}

fn init_logging(logging: &LoggingConfig, verbose: bool) {
    let level = if verbose { "debug" } else { logging.level.as_str() };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let registry = tracing_subscriber::registry().with(env_filter);
    if logging.format == "json" {
        registry.with(fmt::layer().json()).init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_thread_ids(false))
            .init();
    }
}

fn load_config(path: &Path) -> anyhow::Result<ExperimentConfig> {
    ExperimentConfig::load(path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            iterations,
            initial_rps,
            rps_step,
            duration,
        } => {
            let config = load_config(&config)?;
            init_logging(&config.logging, cli.verbose);
            let ramp = Ramp {
                iterations,
                initial_rps: initial_rps.unwrap_or(config.target_requests_per_second),
                rps_step,
                duration: Duration::from_secs(duration),
            };
            run_experiment(config, ramp).await
        }
        Commands::Resolve { config } => {
            let config = load_config(&config)?;
            init_logging(&config.logging, cli.verbose);
            resolve(config).await
        }
    }
}

/// Linear load ramp across iterations
struct Ramp {
    iterations: u32,
    initial_rps: u64,
    rps_step: u64,
    duration: Duration,
}

impl Ramp {
    fn rps_at(&self, iteration: u32) -> u64 {
        self.initial_rps + self.rps_step * u64::from(iteration)
    }
}

async fn resolve(config: ExperimentConfig) -> anyhow::Result<()> {
    let collaborators = Collaborators::production(&config)?;
    let mut runner = ExperimentRunner::new(config, collaborators)?;
    runner.resolve().await.context("Resolution failed")?;

    let summary = runner
        .summary()
        .context("Resolution produced no experiment summary")?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

async fn run_experiment(config: ExperimentConfig, ramp: Ramp) -> anyhow::Result<()> {
    info!(
        "Datachain Rope fleet benchmark v{} against {}",
        env!("CARGO_PKG_VERSION"),
        config.testnet
    );

    let output_dir = config.output.dir.clone();
    let collaborators = Collaborators::production(&config)?;
    let mut runner = ExperimentRunner::new(config, collaborators)?.with_hook(ExperimentSummaryHook);
    if let Err(e) = runner.init().await {
        if runner.state() == LifecycleState::Initializing {
            if let Err(teardown) = runner.end_experiment().await {
                warn!("Teardown after failed initialization failed: {}", teardown);
            }
        }
        return Err(anyhow::Error::new(e).context("Failed to initialize experiment"));
    }

    let mut results = Vec::new();
    let outcome = run_iterations(&mut runner, &ramp, &mut results).await;
    if let Err(e) = &outcome {
        error!("Experiment aborted: {:#}", e);
    }

    runner.end_experiment().await?;

    let metrics_path = output_dir.join(METRICS_FILE);
    std::fs::write(&metrics_path, runner.metrics().encode()?)
        .with_context(|| format!("Failed to write {}", metrics_path.display()))?;
    info!("Metrics saved to {}", metrics_path.display());

    print_results(&results);
    outcome
}

async fn run_iterations(
    runner: &mut ExperimentRunner,
    ramp: &Ramp,
    results: &mut Vec<(u64, AggregatedReport)>,
) -> anyhow::Result<()> {
    for iteration in 0..ramp.iterations {
        let rps = ramp.rps_at(iteration);

        runner.start_iteration().await?;
        let request = runner.workload_request(rps)?.with_duration(ramp.duration);
        let report = runner.run_workload(request).await?;

        let mut configuration = BTreeMap::new();
        configuration.insert("target_rps".to_string(), serde_json::json!(rps));
        configuration.insert(
            "duration_secs".to_string(),
            serde_json::json!(ramp.duration.as_secs()),
        );
        configuration.insert("report".to_string(), serde_json::to_value(&report)?);
        runner.end_iteration(configuration).await?;

        let verdict = report.verdict();
        results.push((rps, report));
        if verdict.should_stop {
            info!("Stopping ramp at {} RPS, the testnet is saturated", rps);
            break;
        }
    }
    Ok(())
}

fn print_results(results: &[(u64, AggregatedReport)]) {
    println!("\n╔══════════════════════════════════════════════════════════════╗");
    println!("║                 DATACHAIN ROPE FLEET BENCHMARK               ║");
    println!("╠══════════╦══════════╦══════════╦═════════════╦═══════════════╣");
    println!("║   RPS    ║ Requests ║ Failures ║ Median (ms) ║    Result     ║");
    println!("╠══════════╬══════════╬══════════╬═════════════╬═══════════════╣");
    for (rps, report) in results {
        let result = if report.verdict().succeeded {
            "✅ pass"
        } else {
            "❌ fail"
        };
        println!(
            "║ {:>8} ║ {:>8} ║ {:>7.1}% ║ {:>11.1} ║ {:<13} ║",
            rps,
            report.total_requests,
            report.failure_rate * 100.0,
            report.latency_median_ms,
            result
        );
    }
    println!("╚══════════╩══════════╩══════════╩═════════════╩═══════════════╝\n");
}

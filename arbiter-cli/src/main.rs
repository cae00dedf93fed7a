//! # Arbiter CLI
//!
//! Diagnostics front end for the Arbiter lock engine: inspect the effective
//! configuration and run contention simulations.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use arbiter_core::{
    AcquireOptions, ArbiterConfig, ConfigLoader, LockErrorKind, LockManager, OwnerId,
    SchedulingStrategy,
};
use clap::{Parser, Subcommand};
use tracing::{debug, error, info};

/// CLI structure
#[derive(Parser, Debug)]
#[command(name = "arbiter")]
#[command(about = "Arbiter - async lock engine diagnostics")]
#[command(version)]
struct Cli {
    /// Output JSON instead of a human-readable summary
    #[arg(long, global = true)]
    json: bool,

    /// Configuration file (defaults to $ARBITER_CONFIG or the user config dir)
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Main commands
#[derive(Subcommand, Debug)]
enum Commands {
    /// Configuration inspection
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Run contending workers against a single lock and report the outcome
    Simulate(SimulateArgs),
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the effective configuration (defaults -> file -> env)
    Show,
    /// Print a commented configuration template
    Template,
    /// Print the configuration file location
    Path,
}

#[derive(clap::Args, Debug)]
struct SimulateArgs {
    /// Scheduling strategy (fifo | round-robin | priority | weighted)
    #[arg(long, short)]
    strategy: Option<SchedulingStrategy>,

    /// Number of concurrent workers
    #[arg(long, short, default_value_t = 8)]
    workers: u32,

    /// Acquisitions per worker
    #[arg(long, short, default_value_t = 20)]
    iterations: u32,

    /// How long each acquisition holds the lock
    #[arg(long, default_value_t = 2)]
    hold_ms: u64,

    /// Every n-th worker acquires shared read access (0 = exclusive only)
    #[arg(long, default_value_t = 0)]
    reader_every: u32,

    /// Per-request timeout; 0 waits forever
    #[arg(long, default_value_t = 0)]
    timeout_ms: u64,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    info!("Running command: {:?}", cli.command);

    if let Err(e) = run_command(cli).await {
        error!("Command failed: {:#}", e);
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn loader(path: Option<PathBuf>) -> ConfigLoader {
    match path {
        Some(path) => ConfigLoader::with_path(path),
        None => ConfigLoader::new(),
    }
}

async fn run_command(cli: Cli) -> anyhow::Result<()> {
    let loader = loader(cli.config);

    match cli.command {
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                let config = loader.load().context("failed to load configuration")?;
                println!("{}", serde_json::to_string_pretty(&config)?);
            }
            ConfigAction::Template => print!("{}", loader.create_template()),
            ConfigAction::Path => println!("{}", loader.config_path().display()),
        },
        Commands::Simulate(args) => {
            let config = loader.load().context("failed to load configuration")?;
            simulate(config, args, cli.json).await?;
        }
    }
    Ok(())
}

#[derive(Debug, Default)]
struct Outcome {
    completed: u64,
    timed_out: u64,
    other_failures: u64,
}

async fn simulate(mut config: ArbiterConfig, args: SimulateArgs, json: bool) -> anyhow::Result<()> {
    if args.workers == 0 {
        anyhow::bail!("--workers must be at least 1");
    }
    if let Some(strategy) = args.strategy {
        config.lock.strategy = strategy;
    }
    config.validate().context("invalid lock options")?;

    let strategy = config.lock.strategy;
    let manager = LockManager::new(config);
    let lock = manager.create("simulation");
    let hold = Duration::from_millis(args.hold_ms);
    let timeout = Duration::from_millis(args.timeout_ms);

    info!(
        %strategy,
        workers = args.workers,
        iterations = args.iterations,
        ?hold,
        "Starting simulation"
    );

    let mut handles = Vec::with_capacity(args.workers as usize);
    for worker in 0..args.workers {
        let lock = lock.clone();
        let reader = args.reader_every > 0 && worker % args.reader_every == 0;
        let iterations = args.iterations;

        handles.push(tokio::spawn(async move {
            let mut outcome = Outcome::default();
            for _ in 0..iterations {
                let opts = AcquireOptions::new()
                    .with_owner(OwnerId::new(u64::from(worker)))
                    .with_priority(worker % 8)
                    .with_timeout(timeout);
                let acquired = if reader {
                    lock.read_lock(opts).await
                } else {
                    lock.write_lock(opts).await
                };

                match acquired {
                    Ok(guard) => {
                        tokio::time::sleep(hold).await;
                        drop(guard);
                        outcome.completed += 1;
                    }
                    Err(e) if e.kind() == LockErrorKind::AcquireTimeout => outcome.timed_out += 1,
                    Err(e) => {
                        debug!(worker, error = %e, "Acquisition failed");
                        outcome.other_failures += 1;
                    }
                }
            }
            outcome
        }));
    }

    let mut total = Outcome::default();
    for handle in handles {
        let outcome = handle.await.context("worker task panicked")?;
        total.completed += outcome.completed;
        total.timed_out += outcome.timed_out;
        total.other_failures += outcome.other_failures;
    }

    let snapshot = lock.dump();
    manager.shutdown();

    if json {
        let report = serde_json::json!({
            "strategy": strategy,
            "completed": total.completed,
            "timed_out": total.timed_out,
            "other_failures": total.other_failures,
            "contention": snapshot.stats.contention(),
            "snapshot": snapshot,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    let stats = &snapshot.stats;
    println!("Strategy:        {}", strategy);
    println!("Completed:       {}", total.completed);
    println!("Timed out:       {}", total.timed_out);
    println!("Other failures:  {}", total.other_failures);
    println!("Acquisitions:    {}", stats.total_acquisitions);
    println!("Queued:          {}", stats.queued);
    println!("Peak waiters:    {}", stats.peak_waiters);
    println!("Avg wait:        {:?}", stats.avg_wait_time());
    println!("Max wait:        {:?}", stats.max_wait_time);
    println!("Avg hold:        {:?}", stats.avg_hold_time());
    println!("Timeout rate:    {:.2}%", stats.timeout_rate() * 100.0);
    println!("Contention:      {}", stats.contention());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simulate() {
        let cli = Cli::try_parse_from([
            "arbiter",
            "simulate",
            "--strategy",
            "round-robin",
            "--workers",
            "4",
            "--hold-ms",
            "5",
        ])
        .unwrap();

        match cli.command {
            Commands::Simulate(args) => {
                assert_eq!(args.strategy, Some(SchedulingStrategy::RoundRobin));
                assert_eq!(args.workers, 4);
                assert_eq!(args.iterations, 20);
                assert_eq!(args.hold_ms, 5);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_parse_rejects_unknown_strategy() {
        assert!(Cli::try_parse_from(["arbiter", "simulate", "--strategy", "lottery"]).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_simulate_completes_every_iteration() {
        let args = SimulateArgs {
            strategy: Some(SchedulingStrategy::Priority),
            workers: 3,
            iterations: 4,
            hold_ms: 1,
            reader_every: 2,
            timeout_ms: 0,
        };
        simulate(ArbiterConfig::default(), args, true).await.unwrap();
    }
}

//! rolloutctl - drive the progressive deployment reconciler from a terminal

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use rollout_core::{
    HistoryLog, Phase, ReconcilerConfig, RolloutController, RolloutEvent, RolloutState,
};

mod scenario;

use scenario::Scenario;

/// rolloutctl - staged traffic migration with automatic rollback
#[derive(Parser, Debug)]
#[command(name = "rolloutctl", version, about, long_about = None)]
struct Cli {
    /// Emit logs and reports as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run one rollout against scripted collaborators
    ///
    /// Exits 0 when the rollout completes and 1 for any other outcome.
    Simulate(SimulateArgs),

    /// Validate a reconciler configuration file and print the effective values
    CheckConfig {
        /// Path to the reconciler TOML configuration
        #[arg(short = 'c', long = "config")]
        config: PathBuf,
    },

    /// List rollouts recorded in a history file
    History {
        /// Path to the JSONL history file
        #[arg(short = 'f', long = "file")]
        file: PathBuf,
    },
}

#[derive(Parser, Debug)]
struct SimulateArgs {
    /// Scenario TOML file
    #[arg(short = 's', long = "scenario")]
    scenario: PathBuf,

    /// Reconciler TOML configuration; defaults apply when omitted
    #[arg(short = 'c', long = "config", env = "ROLLOUT_CONFIG")]
    config: Option<PathBuf>,

    /// Persist history and baselines in this directory
    #[arg(long, env = "ROLLOUT_STATE_DIR")]
    state_dir: Option<PathBuf>,
}

#[derive(Serialize)]
struct SimulationReport<'a> {
    state: &'a RolloutState,
    events: &'a [RolloutEvent],
    final_split: u8,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if cli.json {
        tracing_subscriber::registry()
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_writer(std::io::stderr))
            .with(filter)
            .init();
    }

    match cli.command {
        Commands::Simulate(args) => {
            let completed = simulate(&args, cli.json).await?;
            std::process::exit(if completed { 0 } else { 1 });
        }
        Commands::CheckConfig { config } => check_config(&config),
        Commands::History { file } => history(&file, cli.json),
    }
}

async fn simulate(args: &SimulateArgs, json: bool) -> anyhow::Result<bool> {
    let scenario = Scenario::load(&args.scenario)?;
    let config = match &args.config {
        Some(path) => ReconcilerConfig::load(path)?,
        None => ReconcilerConfig::default(),
    };
    if let Some(dir) = &args.state_dir {
        std::fs::create_dir_all(dir)?;
    }

    let wiring = scenario.wire(args.state_dir.as_deref())?;
    let controller = Arc::new(RolloutController::new(config, wiring.deps)?);

    let id = controller.start_rollout(scenario.request.clone())?;
    tracing::info!(rollout_id = %id, scenario = %args.scenario.display(), "Simulation started");

    if let Some(delay) = scenario.abort_after_ms {
        let controller = Arc::clone(&controller);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay)).await;
            if let Err(e) = controller.abort(id) {
                tracing::warn!(rollout_id = %id, error = %e, "Scripted abort skipped");
            }
        });
    }

    let state = controller.wait(id).await?;
    let events = wiring.sink.events();
    let final_split = wiring.traffic.current(&scenario.request.environment);

    if json {
        let report = SimulationReport {
            state: &state,
            events: &events,
            final_split,
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&state, &events, final_split);
    }

    Ok(state.phase == Phase::Completed)
}

fn print_report(state: &RolloutState, events: &[RolloutEvent], final_split: u8) {
    println!("Rollout {}", state.id);
    println!("  Environment: {}", state.request.environment);
    println!("  Artifact:    {}", state.request.artifact);
    println!("  Outcome:     {}", state.phase);
    println!("  Traffic:     {final_split}% on new version");
    if let Some(step) = state.step_index {
        println!("  Last step:   {} of {}", step + 1, state.request.steps.len());
    }
    if let Some(failure) = &state.failure {
        println!("  Reason:      {}", failure.reason);
    }
    if state.degraded_start {
        println!("  Note:        started in degraded health");
    }
    println!();
    println!("Events:");
    for event in events {
        println!(
            "  {}  {:<16} {}",
            event.at.format("%H:%M:%S%.3f"),
            event.kind.name(),
            serde_json::to_string(&event.kind).unwrap_or_default()
        );
    }
}

fn check_config(path: &Path) -> anyhow::Result<()> {
    let config = ReconcilerConfig::load(path)?;
    println!("Configuration OK: {}", path.display());
    println!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}

fn history(path: &Path, json: bool) -> anyhow::Result<()> {
    if !path.exists() {
        anyhow::bail!("history file not found: {}", path.display());
    }
    let log = HistoryLog::open(path)?;
    let entries = log.entries();

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    println!("{} rollouts in {}", entries.len(), path.display());
    for entry in &entries {
        let outcome = entry
            .outcome
            .map_or_else(|| "ABANDONED".to_string(), |o| o.to_string());
        println!(
            "  {}  {:<12} {:<24} {:<16} {}",
            entry.id,
            entry.environment,
            entry.artifact,
            outcome,
            entry.reason.as_deref().unwrap_or("")
        );
    }
    if !log.abandoned().is_empty() {
        println!();
        println!(
            "{} rollout(s) were in flight when the reconciler stopped; reconcile them manually",
            log.abandoned().len()
        );
    }
    Ok(())
}

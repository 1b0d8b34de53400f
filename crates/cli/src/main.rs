use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use kubestrap_core::storage::{FileStateStore, JsonlEventLog};
use kubestrap_core::{
    BootstrapConfig, ConfigError, Orchestrator, OrchestratorError, Role, RunId, RunOptions,
    RunOutcome, RunResult,
};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

mod report;

const EXIT_FAILURE: u8 = 1;
const EXIT_CONFIG: u8 = 2;
const EXIT_STEP_FAILED: u8 = 3;
const EXIT_INTERRUPTED: u8 = 130;

#[derive(Parser, Debug)]
#[command(name = "bootstrap")]
#[command(about = "Declarative, resumable Kubernetes node bootstrap", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, env = "KUBESTRAP_CONFIG", default_value = "kubestrap.toml")]
    config: PathBuf,

    /// Directory for run state and event logs
    #[arg(long, global = true, env = "KUBESTRAP_STATE_DIR", default_value = "/var/lib/kubestrap")]
    state_dir: PathBuf,

    /// Print JSON instead of text
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Provision this node, resuming earlier progress of the same run
    Run {
        #[arg(long)]
        role: Role,

        /// Run identifier (defaults to the role name)
        #[arg(long)]
        run_id: Option<String>,

        /// Fail unless state from an earlier run exists
        #[arg(long)]
        resume: bool,

        /// Show the plan without running anything
        #[arg(long)]
        dry_run: bool,
    },

    /// Show what a run would do
    Plan {
        #[arg(long)]
        role: Role,

        #[arg(long)]
        run_id: Option<String>,
    },

    /// Show recorded progress of a run, or list runs
    Status {
        #[arg(long)]
        run_id: Option<String>,
    },

    /// Delete a run's state so the next run starts over
    Reset {
        #[arg(long)]
        run_id: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kubestrap=info,bootstrap=info".into()),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match execute(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            tracing::error!("{:#}", err);
            eprintln!("error: {:#}", err);
            ExitCode::from(exit_code_for_error(&err))
        }
    }
}

async fn execute(cli: Cli) -> Result<u8> {
    let orchestrator = build_orchestrator(&cli.config, &cli.state_dir)?;

    match cli.command {
        Command::Run {
            role,
            run_id,
            resume,
            dry_run,
        } => {
            let cancel = CancellationToken::new();
            if !dry_run {
                spawn_signal_handler(cancel.clone())?;
            }

            tracing::info!("Bootstrapping {} node", role);
            let options = RunOptions {
                run_id: run_id.map(RunId::new),
                resume,
                dry_run,
            };
            let outcome = orchestrator.run(role, options, cancel).await?;
            report::print_outcome(&outcome, cli.json)?;
            Ok(exit_code_for_outcome(&outcome))
        }
        Command::Plan { role, run_id } => {
            let planned = orchestrator.plan(role, run_id.map(RunId::new)).await?;
            report::print_plan(&planned, cli.json)?;
            Ok(0)
        }
        Command::Status { run_id: Some(run_id) } => {
            let run_id = RunId::new(run_id);
            match orchestrator.status(&run_id).await? {
                Some(state) => {
                    report::print_state(&state, cli.json)?;
                    Ok(0)
                }
                None => {
                    println!("No state recorded for run '{}'", run_id);
                    Ok(EXIT_FAILURE)
                }
            }
        }
        Command::Status { run_id: None } => {
            let runs = orchestrator.runs().await?;
            report::print_runs(&runs, cli.json)?;
            Ok(0)
        }
        Command::Reset { run_id } => {
            let run_id = RunId::new(run_id);
            if orchestrator.reset(&run_id).await? {
                println!("Run '{}' reset", run_id);
            } else {
                println!("No state recorded for run '{}'", run_id);
            }
            Ok(0)
        }
    }
}

fn build_orchestrator(config_path: &Path, state_dir: &Path) -> Result<Orchestrator> {
    let config = BootstrapConfig::load(config_path)
        .map_err(|e| ConfigError::Invalid(format!("{:#}", e)))?;

    let store = FileStateStore::new(state_dir.join("runs"))
        .with_context(|| format!("Failed to open state directory {}", state_dir.display()))?;
    let event_log =
        JsonlEventLog::new(state_dir.join("events")).context("Failed to create event log")?;

    Ok(Orchestrator::new(
        Arc::new(store),
        Arc::new(event_log),
        config,
    ))
}

/// Cancel the run on Ctrl-C or SIGTERM; the executor records the interrupted step
fn spawn_signal_handler(cancel: CancellationToken) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate =
        signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => tracing::warn!("Interrupted, stopping the run"),
            _ = terminate.recv() => tracing::warn!("Terminated, stopping the run"),
        }
        cancel.cancel();
    });
    Ok(())
}

fn exit_code_for_outcome(outcome: &RunOutcome) -> u8 {
    match outcome {
        RunOutcome::Planned { .. } => 0,
        RunOutcome::Executed { result, .. } => match result {
            RunResult::Succeeded => 0,
            RunResult::Failed { .. } => EXIT_STEP_FAILED,
            RunResult::PartiallyComplete { .. } => EXIT_INTERRUPTED,
        },
    }
}

fn exit_code_for_error(err: &anyhow::Error) -> u8 {
    let config_error = match err.downcast_ref::<OrchestratorError>() {
        Some(OrchestratorError::Config(_)) => true,
        Some(OrchestratorError::StateStore(_)) => false,
        None => err.downcast_ref::<ConfigError>().is_some(),
    };
    if config_error {
        EXIT_CONFIG
    } else {
        EXIT_FAILURE
    }
}

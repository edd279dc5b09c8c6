//! Command-line interface for marketflow
//!
//! Exit codes: 0 on a completed run, 1 on an aborted run or internal
//! failure, 2 for usage errors (unknown mode, missing resume target).

use anyhow::Context;
use clap::{Parser, Subcommand};
use marketflow_agents::MarketCatalog;
use marketflow_checkpoint::CheckpointStore;
use marketflow_core::{Error, Mode};
use marketflow_engine::{RunController, RunOutcome};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

const EXIT_COMPLETED: i32 = 0;
const EXIT_ABORTED: i32 = 1;
const EXIT_USAGE: i32 = 2;

#[derive(Parser, Debug)]
#[command(name = "marketflow")]
#[command(about = "Multi-agent market analysis workflow", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start a fresh run, or resume one from a checkpoint
    Run {
        /// Run mode: full, quick, test, or monitor
        #[arg(long, default_value = "full", conflicts_with = "resume")]
        mode: String,

        /// Resume from this checkpoint id instead of starting fresh
        #[arg(long)]
        resume: Option<String>,

        /// Directory holding checkpoint snapshots
        #[arg(long, default_value = "checkpoints")]
        checkpoint_dir: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    marketflow_utils::init_tracing();
    let args = Args::parse();

    let code = match execute(args).await {
        Ok(outcome) => {
            print_summary(&outcome);
            if outcome.is_completed() {
                EXIT_COMPLETED
            } else {
                EXIT_ABORTED
            }
        }
        Err(err) => {
            eprintln!("error: {err:#}");
            match err.downcast_ref::<Error>() {
                Some(Error::UnknownMode(_) | Error::ResumeTargetNotFound(_)) => EXIT_USAGE,
                _ => EXIT_ABORTED,
            }
        }
    };
    std::process::exit(code);
}

async fn execute(args: Args) -> anyhow::Result<RunOutcome> {
    let Command::Run {
        mode,
        resume,
        checkpoint_dir,
    } = args.command;

    let store = Arc::new(
        CheckpointStore::new(&checkpoint_dir)
            .with_context(|| format!("opening checkpoint store at {}", checkpoint_dir.display()))?,
    );
    // The analysis backend is an external collaborator; the shipped binary
    // wires the deterministic stub so every mode is runnable offline.
    let controller = RunController::new(Arc::new(MarketCatalog::stubbed()), store);

    if let Some(checkpoint_id) = resume {
        info!(checkpoint = %checkpoint_id, "resuming run");
        Ok(controller.resume(&checkpoint_id).await?)
    } else {
        let mode: Mode = mode.parse()?;
        info!(%mode, "starting run");
        Ok(controller.run(mode).await?)
    }
}

fn print_summary(outcome: &RunOutcome) {
    let summary = outcome.progress.summary();
    println!(
        "Run {} finished: {:?} ({}/{} stages completed)",
        outcome.progress.run_id,
        outcome.state,
        summary.completed,
        summary.completed + summary.failed + summary.pending,
    );

    if !outcome.progress.completed().is_empty() {
        println!("Completed: {}", outcome.progress.completed().join(", "));
    }
    for (stage, reason) in outcome.progress.failed() {
        println!("Failed: {stage} ({reason})");
    }

    let artifacts: Vec<&str> = outcome.shared_state.keys().collect();
    if !artifacts.is_empty() {
        println!("Produced: {}", artifacts.join(", "));
    }
}

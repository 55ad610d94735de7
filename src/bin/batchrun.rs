//! batchrun CLI: drive a file of work items through an external command
//! in paced batches, with checkpointed resumption.

use batchrun::checkpoint::CheckpointStore;
use batchrun::config::Config;
use batchrun::handler::{CheckpointHandler, CommandHandler};
use batchrun::input::load_items;
use batchrun::model::Outcome;
use batchrun::phase::ResultsLog;
use batchrun::runner::{RunResults, TaskRunner};
use batchrun::telemetry::{TelemetryConfig, init_telemetry};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "batchrun", about = "Paced batch runner with checkpointed resumption")]
struct Cli {
    /// TOML config file (environment variables override it)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Checkpoint directory
    #[arg(long, global = true)]
    checkpoint_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Process a file of work items
    Run(RunArgs),
    /// Inspect or edit the checkpoint
    Checkpoint {
        #[command(subcommand)]
        action: CheckpointAction,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Work items: JSON array or JSON lines
    #[arg(long)]
    input: PathBuf,
    /// Program run once per item
    #[arg(long)]
    command: PathBuf,
    /// Extra arguments passed to the program
    #[arg(last = true)]
    command_args: Vec<String>,
    /// Field to use as the item id instead of `id`
    #[arg(long)]
    id_field: Option<String>,
    #[arg(long)]
    batch_size: Option<usize>,
    #[arg(long)]
    max_concurrent: Option<usize>,
    /// Stagger between dispatches inside a batch
    #[arg(long)]
    item_delay_ms: Option<u64>,
    /// Pause between batches
    #[arg(long)]
    batch_delay_ms: Option<u64>,
    /// Per-item time limit for the program
    #[arg(long)]
    timeout_secs: Option<u64>,
    /// Item ids to exclude (repeatable)
    #[arg(long)]
    exclude: Vec<String>,
    /// Write the outcome map as JSON to this file
    #[arg(long)]
    report: Option<PathBuf>,
    /// Abort outstanding follow-ups instead of waiting at the end
    #[arg(long)]
    no_wait_followups: bool,
    /// Append one JSON line per settled item (timestamp, phase, id, status, error)
    #[arg(long)]
    results_log: Option<PathBuf>,
    /// Program run afterwards, once per item that succeeded
    #[arg(long)]
    then: Option<PathBuf>,
    /// Argument for the downstream program (repeatable)
    #[arg(long = "then-arg", requires = "then")]
    then_args: Vec<String>,
    /// Wait this long before the downstream phase starts
    #[arg(long, default_value_t = 0, requires = "then")]
    then_delay_ms: u64,
}

#[derive(Subcommand)]
enum CheckpointAction {
    /// List processed ids
    Show,
    /// Forget every processed id
    Clear,
    /// Forget one id so the next run retries it
    Forget {
        id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let mut config = match cli.config {
        Some(ref path) => Config::from_file(path)?,
        None => Config::default(),
    };
    config.apply_env()?;
    if let Some(dir) = cli.checkpoint_dir {
        config.checkpoint_dir = dir;
    }

    let _guard = init_telemetry(
        TelemetryConfig::new("batchrun")
            .endpoint(config.otel_endpoint.clone())
            .log_level(config.log_level.clone()),
    )?;

    match cli.command {
        Command::Run(args) => cmd_run(config, args).await,
        Command::Checkpoint { action } => cmd_checkpoint(&config, action),
    }
}

async fn cmd_run(mut config: Config, args: RunArgs) -> anyhow::Result<()> {
    config.override_batch(
        args.batch_size,
        args.max_concurrent,
        args.item_delay_ms,
        args.batch_delay_ms,
    );
    if args.no_wait_followups {
        config.batch.wait_for_followups = false;
    }
    config.validate()?;

    let items = load_items(&args.input, args.id_field.as_deref())?;
    info!(count = items.len(), input = %args.input.display(), "loaded work items");

    let store = Arc::new(CheckpointStore::open(
        &config.checkpoint_dir,
        &config.checkpoint_file,
    ));
    info!(
        processed = store.processed_count(),
        path = %store.path().display(),
        "checkpoint ready"
    );

    let mut command = CommandHandler::new(&args.command).args(args.command_args);
    if let Some(secs) = args.timeout_secs {
        command = command.timeout(Duration::from_secs(secs));
    }
    let handler = CheckpointHandler::new(command, Arc::clone(&store)).exclude(args.exclude);

    let runner = TaskRunner::new(config.batch.clone())?;
    let stopper = runner.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        stopper.stop();
    });

    let results_log = args.results_log.map(ResultsLog::new);
    let results = runner.run(items.clone(), handler).await;

    print_results(&results);
    log_results(results_log.as_ref(), "run", &results);
    if let Some(ref path) = args.report {
        std::fs::write(path, serde_json::to_string_pretty(&results)?)?;
        println!("Report written to {}", path.display());
    }

    let mut failed = results.summary().error;
    if let Some(program) = args.then {
        let mut command = CommandHandler::new(program).args(args.then_args);
        if let Some(secs) = args.timeout_secs {
            command = command.timeout(Duration::from_secs(secs));
        }
        let delay = Duration::from_millis(args.then_delay_ms);
        match runner.run_downstream(&items, &results, delay, command).await {
            Some(downstream) => {
                println!("\n=== Downstream phase ===");
                print_results(&downstream);
                log_results(results_log.as_ref(), "downstream", &downstream);
                failed += downstream.summary().error;
            }
            None => println!("\nDownstream phase skipped"),
        }
    }

    if failed > 0 {
        anyhow::bail!("{failed} item(s) failed; rerun to retry them");
    }
    Ok(())
}

/// A results log that cannot be written never fails the run.
fn log_results(log: Option<&ResultsLog>, phase: &str, results: &RunResults) {
    let Some(log) = log else {
        return;
    };
    if let Err(e) = log.append(phase, results) {
        warn!(path = %log.path().display(), error = %e, "cannot append to results log");
    }
}

fn print_results(results: &RunResults) {
    let mut rows: Vec<_> = results.iter().collect();
    rows.sort_by(|a, b| a.0.cmp(b.0));

    println!("{:<40}  {:<12}  DETAIL", "ID", "STATUS");
    println!("{}", "-".repeat(80));
    for (id, outcome) in &rows {
        let detail = outcome.detail().unwrap_or_default();
        let status = match outcome {
            Outcome::ManualInterventionRequired { .. } => "manual",
            other => other.status(),
        };
        println!("{id:<40}  {status:<12}  {detail}");
    }
    println!("\n{}", results.summary());

    let attention: Vec<_> = rows
        .iter()
        .filter(|(_, o)| matches!(o, Outcome::ManualInterventionRequired { .. }))
        .map(|(id, _)| *id)
        .collect();
    if !attention.is_empty() {
        println!("Needs attention: {}", attention.join(", "));
    }
}

fn cmd_checkpoint(config: &Config, action: CheckpointAction) -> anyhow::Result<()> {
    let store = CheckpointStore::open(&config.checkpoint_dir, &config.checkpoint_file);

    match action {
        CheckpointAction::Show => {
            let ids = store.processed_ids();
            if ids.is_empty() {
                println!("No processed items in {}", store.path().display());
                return Ok(());
            }
            for id in &ids {
                println!("{id}");
            }
            println!("\n{} processed item(s)", ids.len());
        }
        CheckpointAction::Clear => {
            let count = store.processed_count();
            store.clear();
            store.flush()?;
            println!("Cleared {count} item(s) from {}", store.path().display());
        }
        CheckpointAction::Forget { id } => {
            if !store.is_processed(&id) {
                anyhow::bail!("'{id}' is not in the checkpoint");
            }
            store.mark_failed(&id);
            store.flush()?;
            println!("Forgot {id}");
        }
    }

    Ok(())
}

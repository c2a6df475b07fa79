//! cursorflow CLI - run JSON-lines pipelines and inspect their state

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use cursorflow::{
    init_tracing, FileQuarantineStore, FileStateStore, JsonLinesSink, JsonLinesSource,
    PassThrough, PipelineConfig, PipelineParts, ProgressTracker, QuarantineReplayer,
    QuarantineStore, ReplayOutcome, RunState, RunStatus, Runner, SizingPolicy, StateStore,
    Telemetry,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(500);
const SPINNER_REFRESH_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, Parser)]
#[command(name = "cursorflow", version, about = "Cursor-driven batch ETL over JSON-lines files")]
struct Cli {
    /// Directory holding checkpoints, run states, cancel markers, and the quarantine log
    #[arg(long, global = true, env = "CURSORFLOW_STATE_DIR", default_value = ".cursorflow")]
    state_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run a pipeline from a JSON-lines source into a JSON-lines sink
    Run(RunArgs),
    /// Print the last persisted state of a run
    Status {
        #[arg(long)]
        run_id: Uuid,
    },
    /// Ask a running pipeline to drain and stop
    Cancel {
        #[arg(long)]
        run_id: Uuid,
    },
    /// Inspect or replay quarantined batches
    Quarantine {
        #[command(subcommand)]
        command: QuarantineCommand,
    },
}

#[derive(Debug, Subcommand)]
enum QuarantineCommand {
    /// List batches that have not been replayed yet
    List,
    /// Re-submit one quarantined batch to a sink
    Replay {
        #[arg(long)]
        run_id: Uuid,
        #[arg(long)]
        batch_id: u64,
        #[arg(long)]
        sink: PathBuf,
        #[command(flatten)]
        retry: RetryArgs,
    },
}

#[derive(Debug, Args)]
struct RunArgs {
    #[arg(long)]
    source: PathBuf,
    #[arg(long)]
    sink: PathBuf,
    /// Opaque scope handed to the source when the cursor is opened
    #[arg(long, default_value = "")]
    query: String,
    /// Name under which the resume checkpoint is stored
    #[arg(long, env = "CURSORFLOW_PIPELINE", default_value = "default")]
    pipeline_name: String,
    #[command(flatten)]
    tuning: TuningArgs,
    #[command(flatten)]
    retry: RetryArgs,
    /// Hide the progress spinner
    #[arg(long)]
    quiet: bool,
}

#[derive(Debug, Args)]
struct TuningArgs {
    #[arg(long, env = "CURSORFLOW_CONCURRENCY", default_value_t = 4)]
    concurrency: usize,
    #[arg(long = "min-batch", env = "CURSORFLOW_MIN_BATCH", default_value_t = 1)]
    min_batch: usize,
    #[arg(long = "max-batch", env = "CURSORFLOW_MAX_BATCH", default_value_t = 1000)]
    max_batch: usize,
    /// Use a fixed batch size instead of latency-driven sizing
    #[arg(long, env = "CURSORFLOW_FIXED_BATCH")]
    fixed_batch: Option<usize>,
    /// First batch size of adaptive sizing (defaults to --min-batch)
    #[arg(long, env = "CURSORFLOW_SEED_BATCH")]
    seed_batch: Option<usize>,
    #[arg(long, env = "CURSORFLOW_QUEUE_CAPACITY", default_value_t = 8)]
    queue_capacity: usize,
    #[arg(long, env = "CURSORFLOW_SOURCE_MAX_ATTEMPTS", default_value_t = 5)]
    source_max_attempts: u32,
    #[arg(long, env = "CURSORFLOW_GRACE_TIMEOUT_SECS", default_value_t = 10)]
    grace_timeout_secs: u64,
    #[arg(long, env = "CURSORFLOW_METRICS_INTERVAL_SECS", default_value_t = 5)]
    metrics_interval_secs: u64,
}

#[derive(Debug, Args)]
struct RetryArgs {
    #[arg(long, env = "CURSORFLOW_MAX_WRITE_ATTEMPTS", default_value_t = 5)]
    max_write_attempts: u32,
    #[arg(long, env = "CURSORFLOW_RETRY_INITIAL_BACKOFF_MS", default_value_t = 100)]
    retry_initial_backoff_ms: u64,
    #[arg(long, env = "CURSORFLOW_RETRY_MAX_BACKOFF_MS", default_value_t = 5000)]
    retry_max_backoff_ms: u64,
    #[arg(long, env = "CURSORFLOW_WRITE_TIMEOUT_SECS", default_value_t = 30)]
    write_timeout_secs: u64,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing();

    match execute_command(cli).await {
        Ok(code) => process::exit(code),
        Err(err) => {
            tracing::error!(error = %err, "command failed");
            eprintln!("Error: {err:#}");
            process::exit(1);
        }
    }
}

async fn execute_command(cli: Cli) -> Result<i32> {
    let state_dir = cli.state_dir;
    match cli.command {
        Command::Run(args) => run_pipeline(&state_dir, args).await,
        Command::Status { run_id } => show_status(&state_dir, run_id).await,
        Command::Cancel { run_id } => request_cancel(&state_dir, run_id).await,
        Command::Quarantine { command } => match command {
            QuarantineCommand::List => list_quarantine(&state_dir).await,
            QuarantineCommand::Replay {
                run_id,
                batch_id,
                sink,
                retry,
            } => replay_batch(&state_dir, run_id, batch_id, &sink, &retry).await,
        },
    }
}

fn quarantine_path(state_dir: &Path) -> PathBuf {
    state_dir.join("quarantine.jsonl")
}

fn build_config(args: &RunArgs) -> Result<PipelineConfig> {
    let tuning = &args.tuning;
    let sizing = match tuning.fixed_batch {
        Some(size) => SizingPolicy::Fixed { size },
        None => SizingPolicy::adaptive(tuning.seed_batch.unwrap_or(tuning.min_batch)),
    };

    PipelineConfig::builder()
        .pipeline_name(args.pipeline_name.clone())
        .concurrency(tuning.concurrency)
        .min_batch_size(tuning.min_batch)
        .max_batch_size(tuning.max_batch)
        .sizing(sizing)
        .queue_capacity(tuning.queue_capacity)
        .source_max_attempts(tuning.source_max_attempts)
        .grace_timeout(Duration::from_secs(tuning.grace_timeout_secs))
        .metrics_interval(Duration::from_secs(tuning.metrics_interval_secs))
        .max_write_attempts(args.retry.max_write_attempts)
        .retry_initial_backoff(Duration::from_millis(args.retry.retry_initial_backoff_ms))
        .retry_max_backoff(Duration::from_millis(args.retry.retry_max_backoff_ms))
        .write_timeout(Duration::from_secs(args.retry.write_timeout_secs))
        .build()
        .context("invalid pipeline configuration")
}

async fn run_pipeline(state_dir: &Path, args: RunArgs) -> Result<i32> {
    let config = build_config(&args)?;
    let state = FileStateStore::new(state_dir);
    let parts = PipelineParts {
        source: Arc::new(JsonLinesSource::new(&args.source)),
        transform: Arc::new(PassThrough::<serde_json::Value>::new()),
        sink: Arc::new(JsonLinesSink::open(&args.sink).await?),
        quarantine: Arc::new(FileQuarantineStore::new(quarantine_path(state_dir))),
        state: Arc::new(state.clone()),
    };

    let runner = Runner::new(config, parts);
    let handle = runner.pipeline().start(args.query);
    let run_id = handle.run_id();
    println!("run_id: {run_id}");

    let stop_watchers = CancellationToken::new();
    let cancel_watch = spawn_cancel_watch(
        state,
        run_id,
        runner.cancellation_token(),
        stop_watchers.clone(),
    );
    let spinner =
        (!args.quiet).then(|| spawn_spinner(handle.progress_tracker(), stop_watchers.clone()));

    let result = runner.supervise(handle).await;
    stop_watchers.cancel();
    let _ = cancel_watch.await;
    if let Some(spinner) = spinner {
        let _ = spinner.await;
    }

    let final_state = result?;
    print_state(&final_state)?;
    Ok(exit_code_for(final_state.status))
}

fn exit_code_for(status: RunStatus) -> i32 {
    match status {
        RunStatus::Completed => 0,
        RunStatus::Cancelled => 3,
        _ => 2,
    }
}

/// Polls for the marker written by `cursorflow cancel`.
fn spawn_cancel_watch(
    state: FileStateStore,
    run_id: Uuid,
    shutdown: CancellationToken,
    stop: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(CANCEL_POLL_INTERVAL);
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {
                    match state.cancel_requested(run_id).await {
                        Ok(true) => {
                            tracing::info!(%run_id, "cancel marker found; draining run");
                            shutdown.cancel();
                            break;
                        }
                        Ok(false) => {}
                        Err(err) => tracing::warn!(%run_id, error = %err, "failed to poll cancel marker"),
                    }
                }
            }
        }
    })
}

fn create_spinner(message: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} [{elapsed_precise}] {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.set_message(message.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

fn spawn_spinner(
    progress: Arc<ProgressTracker>,
    stop: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let pb = create_spinner("starting");
        let mut ticker = tokio::time::interval(SPINNER_REFRESH_INTERVAL);
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {
                    let run = progress.snapshot();
                    pb.set_message(format!(
                        "{:?}: {} committed, {} quarantined, {} in flight (batch size {})",
                        run.status,
                        run.committed_records,
                        run.quarantined_records,
                        run.in_flight_records,
                        run.current_batch_size,
                    ));
                }
            }
        }
        pb.finish_and_clear();
    })
}

fn print_state(state: &RunState) -> Result<()> {
    let rendered = serde_json::to_string_pretty(state).context("failed to render run state")?;
    println!("{rendered}");
    Ok(())
}

async fn show_status(state_dir: &Path, run_id: Uuid) -> Result<i32> {
    let store = FileStateStore::new(state_dir);
    let Some(state) = store.load_run_state(run_id).await? else {
        bail!("no run {run_id} under {}", state_dir.display());
    };
    print_state(&state)?;
    Ok(0)
}

async fn request_cancel(state_dir: &Path, run_id: Uuid) -> Result<i32> {
    let store = FileStateStore::new(state_dir);
    let Some(state) = store.load_run_state(run_id).await? else {
        bail!("no run {run_id} under {}", state_dir.display());
    };
    if state.status.is_terminal() {
        println!("run {run_id} already finished with status {:?}", state.status);
        return Ok(0);
    }
    store.request_cancel(run_id).await?;
    println!("cancellation requested for run {run_id}");
    Ok(0)
}

async fn list_quarantine(state_dir: &Path) -> Result<i32> {
    let store = FileQuarantineStore::new(quarantine_path(state_dir));
    let pending = store.list_pending().await?;
    if pending.is_empty() {
        println!("no pending quarantined batches");
        return Ok(0);
    }

    for record in pending {
        println!(
            "{}\tbatch {}\t{} record(s)\t{:?}\t{} attempt(s)\t{}",
            record.run_id,
            record.batch_id,
            record.record_count(),
            record.error_kind,
            record.attempts,
            record.error_message,
        );
    }
    Ok(0)
}

async fn replay_batch(
    state_dir: &Path,
    run_id: Uuid,
    batch_id: u64,
    sink: &Path,
    retry: &RetryArgs,
) -> Result<i32> {
    let replayer = QuarantineReplayer::new(
        Arc::new(PassThrough::<serde_json::Value>::new()),
        Arc::new(JsonLinesSink::open(sink).await?),
        Arc::new(FileQuarantineStore::new(quarantine_path(state_dir))),
        cursorflow::RetryPolicy::new(
            retry.max_write_attempts,
            Duration::from_millis(retry.retry_initial_backoff_ms),
            Duration::from_millis(retry.retry_max_backoff_ms),
        ),
        Duration::from_secs(retry.write_timeout_secs),
        Arc::new(Telemetry::default()),
    );

    let shutdown = CancellationToken::new();
    let ctrl_c = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.cancel();
        }
    });

    match replayer.replay(run_id, batch_id, &shutdown).await? {
        ReplayOutcome::Committed { records } => {
            println!("batch {batch_id} of run {run_id} replayed: {records} record(s) committed");
            Ok(0)
        }
        ReplayOutcome::StillFailing { reason, message } => {
            println!("batch {batch_id} of run {run_id} still failing ({reason:?}): {message}");
            Ok(2)
        }
        ReplayOutcome::NotFound => {
            println!("no pending quarantined batch {batch_id} for run {run_id}");
            Ok(1)
        }
    }
}

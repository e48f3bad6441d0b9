mod aggregator;
mod catalog;
mod config;
mod engine;
mod evaluator;
mod executor;
mod materializer;
mod reporting;
mod scheduler;
mod sweeper;

use anyhow::Context;
use catalog::Catalog;
use clap::Parser;
use config::{HarnessConfigManager, Overrides};
use executor::UnitExecutor;
use reporting::ReportWriter;
use scheduler::BatchScheduler;
use std::path::PathBuf;
use std::sync::Arc;
use sweeper::Sweeper;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};
use trialbench_common::config::DEFAULT_CONFIG_PATH;
use trialbench_common::types::{OverallSummary, TaskSummary};

#[derive(Parser, Debug)]
#[command(name = "trialbench-runner")]
#[command(about = "Run every candidate variant of every task against its fixed test suite", long_about = None)]
struct Args {
    /// Directory holding one subdirectory per task
    root: PathBuf,

    /// Harness configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Per-run wall-clock timeout in seconds
    #[arg(long)]
    timeout_secs: Option<u64>,

    /// Maximum number of build-tool runs in flight
    #[arg(long)]
    concurrency: Option<usize>,

    /// Units dispatched per batch
    #[arg(long)]
    batch_size: Option<usize>,

    /// Only run these task ids (repeatable)
    #[arg(long = "task")]
    tasks: Vec<String>,

    /// Only run the ground-truth solution of each task
    #[arg(long, default_value = "false")]
    solution_only: bool,

    /// Where workspaces are created
    #[arg(long)]
    work_root: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, default_value = "false")]
    log_json: bool,
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    info!("Trialbench runner booting...");

    let config = HarnessConfigManager::load(&args.config)
        .and_then(|manager| {
            manager.with_overrides(&Overrides {
                timeout_secs: args.timeout_secs,
                concurrency: args.concurrency,
                batch_size: args.batch_size,
                work_root: args.work_root.clone(),
            })
        })
        .map_err(|e| {
            error!(error = %e, "Invalid harness configuration");
            e
        })?;

    let settings = config.config();
    info!(
        timeout_secs = settings.timeout_secs,
        concurrency = settings.concurrency,
        batch_size = settings.batch_size,
        work_root = %settings.work_root.display(),
        tool = %settings.tool.program,
        groups = ?config.list_groups(),
        "Harness configured"
    );

    let tasks = Catalog::new(&config)
        .solution_only(args.solution_only)
        .only_tasks(args.tasks.clone())
        .enumerate(&args.root)
        .with_context(|| format!("Cannot enumerate tasks under {}", args.root.display()))?;

    if tasks.is_empty() {
        warn!(root = %args.root.display(), "No runnable tasks found");
        return Ok(());
    }

    // Operator interrupt: stop dispatching, kill in-flight runs, reclaim workspaces
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => {
                warn!("Received shutdown signal, stopping dispatch and reclaiming workspaces...");
                shutdown_tx.send_replace(true);
            }
            Err(e) => error!(error = %e, "Failed to install CTRL+C handler"),
        }
    });

    let sweeper = Arc::new(Sweeper::new());
    let executor = Arc::new(UnitExecutor::new(&config, Arc::clone(&sweeper)));
    let scheduler = BatchScheduler::new(executor, settings.concurrency, settings.batch_size)
        .with_reports(ReportWriter::new(settings.layout.results_dir.clone()));

    let started = std::time::Instant::now();
    let (mut summaries_rx, handle) = scheduler.run_all(tasks, shutdown_rx);

    let mut summaries: Vec<TaskSummary> = Vec::new();
    while let Some(summary) = summaries_rx.recv().await {
        summaries.push(summary);
    }

    let stats = handle
        .await
        .context("Scheduler task panicked")?
        .map_err(|e| {
            error!(error = %e, "Batch aborted");
            e
        })?;

    summaries.sort_by(|a, b| a.task_id.cmp(&b.task_id));
    let leaks = sweeper.leaks();
    for leak in &leaks {
        warn!(path = %leak, "Resource leak: workspace could not be deleted");
    }

    let overall = OverallSummary::build(&summaries, leaks);
    match ReportWriter::new(settings.layout.results_dir.clone()).write_overall(&args.root, &overall) {
        Ok(path) => info!(path = %path.display(), "Overall summary written"),
        Err(e) => error!(error = %e, "Failed to write overall summary"),
    }

    info!(
        tasks = overall.tasks,
        variants = overall.variants,
        passed = overall.counts.pass,
        failed = overall.counts.fail,
        build_errors = overall.counts.build_error,
        timeouts = overall.counts.timeout,
        infrastructure_errors = overall.counts.infrastructure_error,
        dispatched = stats.dispatched,
        units = stats.units,
        workspaces_reclaimed = sweeper.reclaimed(),
        elapsed_secs = started.elapsed().as_secs(),
        "Batch complete"
    );

    if stats.interrupted {
        warn!("Run was interrupted; summaries cover completed tasks only");
    }
    Ok(())
}

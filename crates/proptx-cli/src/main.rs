use std::fmt::Write as _;
use std::fs::{self, OpenOptions};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Local};
use clap::{Parser, Subcommand};
use proptx_sync::{build_scheduler, maybe_build_scheduler, SyncConfig, SyncPipeline, SyncRunSummary};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "proptx")]
#[command(about = "Private property transaction archive")]
struct Cli {
    /// Append logs to this file; strftime patterns like `logs/%Y-%m-%d.log` are expanded.
    #[arg(long, global = true)]
    log_file: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch every enabled source once and merge into the archives.
    Sync {
        /// Exit non-zero when a source produced no usable segment.
        #[arg(long)]
        strict: bool,
        /// Only run this source id.
        #[arg(long)]
        source: Option<String>,
    },
    /// Serve the read-only archive API.
    Serve,
    /// Run syncs on the configured cron schedule until interrupted.
    Schedule,
}

fn expand_log_path(pattern: &str, started: DateTime<Local>) -> Result<PathBuf> {
    let mut expanded = String::new();
    write!(expanded, "{}", started.format(pattern))
        .map_err(|_| anyhow!("invalid log file pattern {pattern:?}"))?;
    Ok(PathBuf::from(expanded))
}

fn init_logging(log_file: Option<&str>, started: DateTime<Local>) -> Result<Option<PathBuf>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let Some(pattern) = log_file else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();
        return Ok(None);
    };

    let path = expand_log_path(pattern, started)?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("opening log file {}", path.display()))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .with_file(true)
        .with_line_number(true)
        .with_writer(Mutex::new(file))
        .init();
    Ok(Some(path))
}

fn print_summary(summary: &SyncRunSummary) {
    println!(
        "sync complete: run_id={} sources={} rows_written={} report={}",
        summary.run_id,
        summary.sources.len(),
        summary.rows_written(),
        summary.report_path
    );
    for source in &summary.sources {
        println!(
            "  {}: status={:?} segments={}/{} rejected={} written={}",
            source.source_id,
            source.status,
            source.segments_succeeded,
            source.segments_planned,
            source.records_rejected,
            source.merge.map(|m| m.written_rows).unwrap_or(0)
        );
    }
}

async fn run_sync(strict: bool, source: Option<String>) -> Result<ExitCode> {
    let pipeline = SyncPipeline::new(SyncConfig::from_env())?;
    let summary = pipeline.run_filtered(source.as_deref()).await?;
    print_summary(&summary);

    if strict && summary.is_degraded() {
        eprintln!("sync degraded: at least one source returned no usable data");
        return Ok(ExitCode::from(2));
    }
    Ok(ExitCode::SUCCESS)
}

async fn run_serve() -> Result<()> {
    let pipeline = Arc::new(SyncPipeline::new(SyncConfig::from_env())?);
    let scheduler = maybe_build_scheduler(pipeline).await?;
    if let Some(sched) = &scheduler {
        sched.start().await.context("starting scheduler")?;
        info!("scheduler enabled alongside api");
    }
    proptx_web::serve_from_env().await
}

async fn run_schedule() -> Result<()> {
    let pipeline = Arc::new(SyncPipeline::new(SyncConfig::from_env())?);
    let cron = pipeline.config().sync_cron.clone();
    let mut sched = build_scheduler(pipeline).await?;
    sched.start().await.context("starting scheduler")?;
    info!(%cron, "scheduler running; press ctrl-c to stop");

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    warn!("shutting down scheduler");
    sched.shutdown().await.context("stopping scheduler")?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let started = Local::now();
    if let Some(path) = init_logging(cli.log_file.as_deref(), started)? {
        eprintln!("logging to {}", path.display());
    }
    info!(command = ?cli.command, "starting proptx");

    let code = match cli.command.unwrap_or(Commands::Sync {
        strict: false,
        source: None,
    }) {
        Commands::Sync { strict, source } => run_sync(strict, source).await?,
        Commands::Serve => {
            run_serve().await?;
            ExitCode::SUCCESS
        }
        Commands::Schedule => {
            run_schedule().await?;
            ExitCode::SUCCESS
        }
    };

    let elapsed = Local::now() - started;
    info!(duration_ms = elapsed.num_milliseconds(), "program ended");
    Ok(code)
}

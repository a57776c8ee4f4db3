mod commands;
mod config;

use std::future::Future;
use std::io::Write;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use blockship_ledger::{
    CONTEXT_FILE, SessionContext, SessionHistory, SessionHistoryManager, SessionStatus,
    TransferKind,
};
use blockship_transfer::{
    LocalFileClient, PlanSource, ProgressSnapshot, RunReport, TransferCoordinator, TransferError,
};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use commands::{Cli, Commands, UploadArgs, resume_overrides};
use config::CliConfig;

const PROGRESS_INTERVAL: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,blockship=debug")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = CliConfig::load().unwrap_or_default();
    let root = config.session_root(cli.root.as_deref())?;
    let manager = SessionHistoryManager::new(&root);
    tracing::debug!(root = %root.display(), "session root");

    match cli.command {
        Commands::Upload(args) => upload(&manager, &config, &args).await,
        Commands::Resume {
            sid,
            threads,
            discard_bad_records,
        } => {
            let history = select(&manager, sid.as_deref())?;
            resume(history, threads, discard_bad_records).await
        }
        Commands::History { n } => {
            let stdout = std::io::stdout();
            let mut out = stdout.lock();
            manager.show_history(n, &mut out)?;
            out.flush()?;
            Ok(())
        }
        Commands::Purge { days } => {
            let removed = manager.purge_history(days)?;
            println!("purged {} sessions older than {days} days", removed.len());
            Ok(())
        }
        Commands::Delete { sid } => {
            manager
                .get(&sid)?
                .delete()
                .with_context(|| format!("failed to delete session {sid}"))?;
            println!("deleted {sid}");
            Ok(())
        }
        Commands::Pending { sid } => {
            let history = select(&manager, sid.as_deref())?;
            let blocks = history
                .load_block_index()
                .with_context(|| format!("session {}", history.session_id()))?;
            let stdout = std::io::stdout();
            let mut out = stdout.lock();
            for block in &blocks {
                writeln!(out, "{block}")?;
            }
            out.flush()?;
            Ok(())
        }
    }
}

/// The named session, or the most recent one.
fn select(manager: &SessionHistoryManager, sid: Option<&str>) -> anyhow::Result<SessionHistory> {
    Ok(match sid {
        Some(sid) => manager.get(sid)?,
        None => manager.get_latest()?,
    })
}

async fn upload(
    manager: &SessionHistoryManager,
    config: &CliConfig,
    args: &UploadArgs,
) -> anyhow::Result<()> {
    let source_path = std::path::absolute(&args.source)
        .with_context(|| format!("invalid source {}", args.source.display()))?;
    let source = PlanSource::from_path(&source_path)
        .with_context(|| format!("cannot read source {}", source_path.display()))?;
    let target = std::path::absolute(&args.target)
        .with_context(|| format!("invalid target {}", args.target.display()))?;
    std::fs::create_dir_all(&target)
        .with_context(|| format!("cannot create target {}", target.display()))?;

    let mut transfer = config.transfer.clone();
    args.overrides().apply(&mut transfer);

    let sid = args
        .session_id
        .clone()
        .unwrap_or_else(SessionHistoryManager::new_session_id);
    if manager.find(&sid)?.is_some_and(|h| h.has_context()) {
        bail!("session {sid} already exists, use `blockship resume {sid}`");
    }
    let history = manager.create_session_history(&sid)?;

    let mut ctx = SessionContext::new(
        &sid,
        command_line(),
        chrono::Utc::now().timestamp_millis(),
        transfer,
    );
    ctx.kind = TransferKind::Upload;
    ctx.source = source_path.display().to_string();
    ctx.target = target.display().to_string();

    info!(session = %sid, source = %ctx.source, target = %ctx.target, "starting upload");
    let client = Arc::new(LocalFileClient::new(source.base_dir(), &target));
    let coordinator = TransferCoordinator::new(client);
    let report = supervise(&coordinator, coordinator.start(history, ctx, &source))
        .await
        .with_context(|| format!("upload of session {sid} failed"))?;
    print_report(&report);
    Ok(())
}

async fn resume(
    history: SessionHistory,
    threads: Option<usize>,
    discard_bad_records: bool,
) -> anyhow::Result<()> {
    let sid = history.session_id().to_string();
    if !history.has_context() {
        bail!("session {sid}: missing {CONTEXT_FILE}, cannot resume");
    }
    let ctx = history
        .load_session_context()
        .with_context(|| format!("session {sid}"))?;
    let source = PlanSource::from_path(&ctx.source)
        .with_context(|| format!("session {sid}: cannot read source {}", ctx.source))?;

    let client = Arc::new(LocalFileClient::new(source.base_dir(), &ctx.target));
    let coordinator = TransferCoordinator::new(client);
    let overrides = resume_overrides(threads, discard_bad_records);
    let report = supervise(&coordinator, coordinator.resume(history, &overrides))
        .await
        .with_context(|| format!("resume of session {sid} failed"))?;
    print_report(&report);
    Ok(())
}

/// Runs `run` with progress reporting and Ctrl-C wired to the
/// coordinator's cancel token.
async fn supervise<F>(coordinator: &TransferCoordinator, run: F) -> Result<RunReport, TransferError>
where
    F: Future<Output = Result<RunReport, TransferError>>,
{
    let stop = tokio_util::sync::CancellationToken::new();
    let reporter = coordinator.progress().start_reporting(
        Some(PROGRESS_INTERVAL),
        Box::new(log_progress),
        stop.clone(),
    );

    let cancel = coordinator.cancel_token();
    let signal = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, stopping after in-flight blocks");
            cancel.cancel();
        }
    });

    let result = run.await;
    signal.abort();
    stop.cancel();
    if let Err(e) = reporter.await {
        warn!(error = %e, "progress reporter failed");
    }
    result
}

fn log_progress(snap: ProgressSnapshot) {
    info!(
        done = snap.resumed_blocks + snap.completed_blocks,
        planned = snap.planned_blocks,
        bytes = snap.transferred_bytes,
        "progress {:.1}%",
        snap.fraction() * 100.0
    );
}

fn print_report(report: &RunReport) {
    println!(
        "session {}: {} ({} of {} pending blocks, {} bytes)",
        report.session_id,
        report.status,
        report.transferred_blocks,
        report.pending_blocks,
        report.transferred_bytes
    );
    if report.status == SessionStatus::Bad {
        println!("rejected records were kept in the session directory");
    }
}

fn command_line() -> String {
    let args: Vec<String> = std::env::args().skip(1).collect();
    format!("blockship {}", args.join(" "))
}

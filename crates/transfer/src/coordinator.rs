//! Fresh and resumed runs of a session.
//!
//! Status transitions are persisted to the session context at each
//! checkpoint: `created -> running` before dispatch, then `success`, `bad`
//! or `failed`. A failed run leaves the ledger untouched so a later resume
//! picks up the pending blocks.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use blockship_ledger::{
    BLOCK_INDEX_FILE, BlockInfo, CONTEXT_FILE, ConfigOverrides, LedgerError, SessionContext,
    SessionHistory, SessionStatus, TransferConfig,
};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::TransferError;
use crate::client::TransferClient;
use crate::plan::{PlanSource, plan};
use crate::progress::TransferProgress;
use crate::retry::{RetryPolicy, retry};

/// Pause between attempts of the same block.
const DEFAULT_BLOCK_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Outcome of one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub session_id: String,
    pub status: SessionStatus,
    pub planned_blocks: usize,
    /// Blocks that were still pending when the run started.
    pub pending_blocks: usize,
    pub transferred_blocks: u64,
    pub transferred_bytes: u64,
}

/// Drives one session through planning, dispatch and finalize.
pub struct TransferCoordinator {
    client: Arc<dyn TransferClient>,
    finalize_retry: RetryPolicy,
    block_retry_interval: Duration,
    cancel: CancellationToken,
    progress: Arc<TransferProgress>,
}

/// State shared by the workers of one dispatch.
struct Dispatch {
    client: Arc<dyn TransferClient>,
    history: Arc<SessionHistory>,
    config: TransferConfig,
    queue: Mutex<VecDeque<BlockInfo>>,
    rejected: AtomicU64,
    retry: RetryPolicy,
    stop: CancellationToken,
    progress: Arc<TransferProgress>,
}

impl TransferCoordinator {
    pub fn new(client: Arc<dyn TransferClient>) -> Self {
        Self {
            client,
            finalize_retry: RetryPolicy::default(),
            block_retry_interval: DEFAULT_BLOCK_RETRY_INTERVAL,
            cancel: CancellationToken::new(),
            progress: Arc::new(TransferProgress::new()),
        }
    }

    /// Ceiling and interval of the finalize/commit retry.
    pub fn with_finalize_retry(mut self, policy: RetryPolicy) -> Self {
        self.finalize_retry = policy;
        self
    }

    pub fn with_block_retry_interval(mut self, interval: Duration) -> Self {
        self.block_retry_interval = interval;
        self
    }

    /// Cancelling stops dispatch of new blocks and any finalize backoff.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn progress(&self) -> Arc<TransferProgress> {
        Arc::clone(&self.progress)
    }

    /// Plans `source`, snapshots the plan, and transfers every block.
    pub async fn start(
        &self,
        history: SessionHistory,
        mut ctx: SessionContext,
        source: &PlanSource,
    ) -> Result<RunReport, TransferError> {
        let history = Arc::new(history);
        ctx.session_id = history.session_id().to_string();
        ctx.status = SessionStatus::Created;
        history.save_session_context(&ctx)?;
        history.log(&format!("session created: {}", ctx.command))?;

        let blocks = match snapshot_plan(&history, source, ctx.config.block_size) {
            Ok(blocks) => blocks,
            Err(e) => return Err(self.fail(&history, &mut ctx, e)),
        };
        info!(session = %ctx.session_id, blocks = blocks.len(), "session planned");

        let planned = blocks.len();
        self.dispatch(history, ctx, planned, blocks).await
    }

    /// Continues an interrupted session under its id, transferring only
    /// the blocks missing from the completion log.
    pub async fn resume(
        &self,
        history: SessionHistory,
        overrides: &ConfigOverrides,
    ) -> Result<RunReport, TransferError> {
        let history = Arc::new(history);
        let sid = history.session_id().to_string();

        if !history.has_context() {
            return Err(TransferError::MissingArtifact {
                session_id: sid,
                artifact: CONTEXT_FILE.into(),
            });
        }
        if !history.has_block_index() {
            return Err(TransferError::MissingArtifact {
                session_id: sid,
                artifact: BLOCK_INDEX_FILE.into(),
            });
        }

        let named = |source: LedgerError| TransferError::Session {
            session_id: sid.clone(),
            source,
        };
        let mut ctx = history.load_session_context().map_err(named)?;
        overrides.apply(&mut ctx.config);
        let planned = history.load_full_block_index().map_err(named)?.len();
        let pending = history.load_block_index().map_err(named)?;

        if pending.is_empty() && matches!(ctx.status, SessionStatus::Success | SessionStatus::Bad)
        {
            info!(session = %sid, status = %ctx.status, "session already finished");
            return Ok(RunReport {
                session_id: sid,
                status: ctx.status,
                planned_blocks: planned,
                pending_blocks: 0,
                transferred_blocks: 0,
                transferred_bytes: 0,
            });
        }

        if !overrides.is_empty() {
            debug!(session = %sid, ?overrides, "applying command-line overrides");
        }
        history.log(&format!(
            "resuming from {}: {} of {} blocks pending",
            ctx.status,
            pending.len(),
            planned
        ))?;
        info!(session = %sid, pending = pending.len(), planned, "resuming session");

        self.dispatch(history, ctx, planned, pending).await
    }

    async fn dispatch(
        &self,
        history: Arc<SessionHistory>,
        mut ctx: SessionContext,
        planned: usize,
        pending: Vec<BlockInfo>,
    ) -> Result<RunReport, TransferError> {
        let pending_count = pending.len();
        self.progress.reset(planned as u64, pending_count as u64);

        ctx.status = SessionStatus::Running;
        let result = match history.save_session_context(&ctx) {
            Ok(()) => self.run_workers(&history, &ctx.config, pending).await,
            Err(e) => Err(e.into()),
        };
        let result = match result {
            Ok(()) => self.finish(&history).await,
            Err(e) => Err(e),
        };

        let status = match result {
            Ok(status) => status,
            Err(e) => return Err(self.fail(&history, &mut ctx, e)),
        };

        ctx.status = status;
        if let Err(e) = history.save_session_context(&ctx) {
            return Err(self.fail(&history, &mut ctx, e.into()));
        }
        let snap = self.progress.snapshot();
        history.log(&format!(
            "finished with status {status}: {} blocks, {} bytes this run",
            snap.completed_blocks, snap.transferred_bytes
        ))?;
        info!(session = %ctx.session_id, %status, blocks = snap.completed_blocks, "session finished");

        Ok(RunReport {
            session_id: ctx.session_id,
            status,
            planned_blocks: planned,
            pending_blocks: pending_count,
            transferred_blocks: snap.completed_blocks,
            transferred_bytes: snap.transferred_bytes,
        })
    }

    /// Runs the worker pool over `pending` and the completion writer.
    async fn run_workers(
        &self,
        history: &Arc<SessionHistory>,
        config: &TransferConfig,
        pending: Vec<BlockInfo>,
    ) -> Result<(), TransferError> {
        let workers = config.threads.max(1).min(pending.len());
        if workers == 0 {
            return Ok(());
        }

        let (done_tx, mut done_rx) = mpsc::channel::<BlockInfo>(workers * 2);
        let writer_history = Arc::clone(history);
        let writer = tokio::task::spawn_blocking(move || -> Result<(), LedgerError> {
            while let Some(block) = done_rx.blocking_recv() {
                writer_history.save_finish_block(&block)?;
            }
            Ok(())
        });

        let shared = Arc::new(Dispatch {
            client: Arc::clone(&self.client),
            history: Arc::clone(history),
            config: config.clone(),
            queue: Mutex::new(pending.into()),
            rejected: AtomicU64::new(0),
            retry: RetryPolicy::new(
                config.block_retries.saturating_add(1),
                self.block_retry_interval,
            ),
            stop: self.cancel.child_token(),
            progress: Arc::clone(&self.progress),
        });

        debug!(session = %history.session_id(), workers, "starting workers");
        let mut set = JoinSet::new();
        for worker in 0..workers {
            let shared = Arc::clone(&shared);
            let done_tx = done_tx.clone();
            set.spawn(async move { shared.work(worker, done_tx).await });
        }
        drop(done_tx);

        let mut first_err = None;
        while let Some(joined) = set.join_next().await {
            let result = joined
                .map_err(|e| TransferError::Client(format!("worker task failed: {e}")))
                .and_then(|r| r);
            if let Err(e) = result {
                shared.stop.cancel();
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        }

        let written = writer
            .await
            .map_err(|e| TransferError::Client(format!("completion writer failed: {e}")))?;
        written?;

        if let Some(e) = first_err {
            return Err(e);
        }
        if self.cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        Ok(())
    }

    /// Checks the ledger, commits, and picks the final status.
    async fn finish(&self, history: &SessionHistory) -> Result<SessionStatus, TransferError> {
        let remaining = history.load_block_index()?;
        if let Some(block) = remaining.first() {
            return Err(TransferError::Block {
                block_id: block.id,
                source: Box::new(TransferError::Client(format!(
                    "{} blocks still pending after dispatch",
                    remaining.len()
                ))),
            });
        }

        let client = &*self.client;
        retry(self.finalize_retry, &self.cancel, |attempt| {
            debug!(attempt, "finalizing");
            client.finalize()
        })
        .await?;

        Ok(if history.exists_bad()? {
            SessionStatus::Bad
        } else {
            SessionStatus::Success
        })
    }

    /// Records the failure in the context and the event log, keeping the
    /// ledger as it is.
    fn fail(
        &self,
        history: &SessionHistory,
        ctx: &mut SessionContext,
        err: TransferError,
    ) -> TransferError {
        error!(session = %ctx.session_id, error = %err, "session failed");
        ctx.status = SessionStatus::Failed;
        if let Err(e) = history.save_session_context(ctx) {
            warn!(session = %ctx.session_id, error = %e, "failed to persist failed status");
        }
        if let Err(e) = history.log(&format!("failed: {err}")) {
            warn!(session = %ctx.session_id, error = %e, "failed to write event log");
        }
        err
    }
}

/// Plans `source` and writes the plan snapshot.
fn snapshot_plan(
    history: &SessionHistory,
    source: &PlanSource,
    block_size: u64,
) -> Result<Vec<BlockInfo>, TransferError> {
    let blocks = plan(source, block_size)?;
    history.save_block_index(&blocks)?;
    history.log(&format!(
        "planned {} blocks from {}",
        blocks.len(),
        source.path().display()
    ))?;
    Ok(blocks)
}

impl Dispatch {
    async fn work(
        &self,
        worker: usize,
        done_tx: mpsc::Sender<BlockInfo>,
    ) -> Result<(), TransferError> {
        loop {
            if self.stop.is_cancelled() {
                return Ok(());
            }
            let next = self
                .queue
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .pop_front();
            let Some(block) = next else {
                return Ok(());
            };

            debug!(worker, block = block.id, "transferring block");
            self.transfer_one(&block)
                .await
                .map_err(|e| match e {
                    TransferError::Cancelled => TransferError::Cancelled,
                    other => TransferError::Block {
                        block_id: block.id,
                        source: Box::new(other),
                    },
                })?;

            let length = block.length;
            if done_tx.send(block).await.is_err() {
                // Writer gone; its own error is reported by the caller.
                return Ok(());
            }
            self.progress.record_block(length);
        }
    }

    async fn transfer_one(&self, block: &BlockInfo) -> Result<(), TransferError> {
        let client = &*self.client;
        let outcome = retry(self.retry, &self.stop, |attempt| {
            if attempt > 1 {
                debug!(block = block.id, attempt, "retrying block");
            }
            client.transfer(block)
        })
        .await?;

        if !outcome.has_rejected() {
            self.history.clear_bad_data(block.id)?;
            return Ok(());
        }

        self.history.save_bad_data(block.id, &outcome.rejected_payload)?;
        self.history.log(&format!(
            "block {}: {} rejected records",
            block.id, outcome.rejected_records
        ))?;
        warn!(block = block.id, records = outcome.rejected_records, "rejected records captured");

        if !self.config.discard_bad_records {
            return Err(TransferError::BadRecords { block_id: block.id });
        }
        let total = self
            .rejected
            .fetch_add(outcome.rejected_records, Ordering::SeqCst)
            + outcome.rejected_records;
        if total > self.config.max_bad_records {
            return Err(TransferError::TooManyBadRecords {
                limit: self.config.max_bad_records,
            });
        }
        Ok(())
    }
}

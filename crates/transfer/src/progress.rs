use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Default progress notification interval.
const DEFAULT_INTERVAL: Duration = Duration::from_millis(500);

/// Callback invoked with a progress snapshot.
pub type ProgressCallback = Box<dyn Fn(ProgressSnapshot) + Send + Sync>;

/// Point-in-time view of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProgressSnapshot {
    /// Blocks in the plan snapshot.
    pub planned_blocks: u64,
    /// Blocks already completed before this run started.
    pub resumed_blocks: u64,
    /// Blocks completed by this run.
    pub completed_blocks: u64,
    pub transferred_bytes: u64,
}

impl ProgressSnapshot {
    /// Completed fraction of the plan, `1.0` for an empty plan.
    pub fn fraction(&self) -> f64 {
        if self.planned_blocks == 0 {
            1.0
        } else {
            (self.resumed_blocks + self.completed_blocks) as f64 / self.planned_blocks as f64
        }
    }
}

/// Lock-free counters shared by the workers of one run.
#[derive(Debug, Default)]
pub struct TransferProgress {
    planned_blocks: AtomicU64,
    resumed_blocks: AtomicU64,
    completed_blocks: AtomicU64,
    transferred_bytes: AtomicU64,
}

impl TransferProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn reset(&self, planned: u64, pending: u64) {
        self.planned_blocks.store(planned, Ordering::SeqCst);
        self.resumed_blocks
            .store(planned.saturating_sub(pending), Ordering::SeqCst);
        self.completed_blocks.store(0, Ordering::SeqCst);
        self.transferred_bytes.store(0, Ordering::SeqCst);
    }

    pub(crate) fn record_block(&self, bytes: u64) {
        self.completed_blocks.fetch_add(1, Ordering::SeqCst);
        self.transferred_bytes.fetch_add(bytes, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            planned_blocks: self.planned_blocks.load(Ordering::SeqCst),
            resumed_blocks: self.resumed_blocks.load(Ordering::SeqCst),
            completed_blocks: self.completed_blocks.load(Ordering::SeqCst),
            transferred_bytes: self.transferred_bytes.load(Ordering::SeqCst),
        }
    }

    /// Calls `callback` every `interval` (500 ms if `None`) until `stop`
    /// is cancelled, then once more with the final numbers.
    pub fn start_reporting(
        self: &Arc<Self>,
        interval: Option<Duration>,
        callback: ProgressCallback,
        stop: CancellationToken,
    ) -> JoinHandle<()> {
        let progress = Arc::clone(self);
        let period = interval.unwrap_or(DEFAULT_INTERVAL);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => callback(progress.snapshot()),
                    _ = stop.cancelled() => break,
                }
            }
            callback(progress.snapshot());
        })
    }
}

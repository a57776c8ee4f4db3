//! Resumable block transfers driven by the session ledger.
//!
//! A fresh run plans the input into blocks, snapshots the plan, then
//! dispatches blocks to a pool of workers calling a [`TransferClient`].
//! Every finished block is appended to the completion log by a single
//! writer task. A resumed run reloads the saved context and dispatches
//! only `plan - completed`.

mod client;
mod coordinator;
mod local;
mod plan;
mod progress;
mod retry;
mod validation;

use blockship_ledger::LedgerError;

pub use client::{BlockOutcome, BoxFuture, TransferClient};
pub use coordinator::{RunReport, TransferCoordinator};
pub use local::{LocalFileClient, checksum_bytes};
pub use plan::{PlanSource, plan, plan_dir_blocks, plan_file_blocks};
pub use progress::{ProgressSnapshot, TransferProgress};
pub use retry::{RetryPolicy, retry};
pub use validation::validate_locator;

/// Errors produced while transferring a session.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("session {session_id}: {source}")]
    Session {
        session_id: String,
        #[source]
        source: LedgerError,
    },

    #[error("session {session_id}: missing {artifact}, cannot resume")]
    MissingArtifact {
        session_id: String,
        artifact: String,
    },

    #[error("transfer client error: {0}")]
    Client(String),

    #[error("checksum mismatch on block {block_id}")]
    ChecksumMismatch { block_id: u64 },

    #[error("block {block_id} has rejected records")]
    BadRecords { block_id: u64 },

    #[error("rejected records exceed the limit of {limit}")]
    TooManyBadRecords { limit: u64 },

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("block {block_id}: {source}")]
    Block {
        block_id: u64,
        #[source]
        source: Box<TransferError>,
    },

    #[error("gave up after {attempts} attempts: {last}")]
    RetryExhausted {
        attempts: u32,
        #[source]
        last: Box<TransferError>,
    },

    #[error("cancelled")]
    Cancelled,
}

//! Filesystem-backed session ledger for resumable block transfers.
//!
//! A transfer is split into blocks. Each session keeps, under
//! `root/sessions/<yyyyMMdd>/<sid>/`, a context snapshot, an event log,
//! the planned block set and an append-only completion log. The pending
//! work of an interrupted session is `plan - completed`, by block id.

mod block;
mod context;
mod error;
mod files;
mod history;
mod manager;

pub use block::{BlockInfo, ParseBlockError};
pub use context::{ConfigOverrides, SessionContext, SessionStatus, TransferConfig, TransferKind};
pub use error::LedgerError;
pub use files::{
    BAD_DATA_PREFIX, BLOCK_INDEX_FILE, CONTEXT_FILE, FINISH_BLOCK_FILE, LOG_FILE, SESSIONS_DIR,
};
pub use history::SessionHistory;
pub use manager::{HistoryEntry, SessionHistoryManager, validate_session_id};

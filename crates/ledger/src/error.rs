//! Ledger error types.

use std::path::PathBuf;

use crate::block::ParseBlockError;

/// Errors produced by the session ledger.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("session not found: {0}")]
    NotFound(String),

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt ledger {} at line {line}: {source}", path.display())]
    Corrupt {
        path: PathBuf,
        line: usize,
        #[source]
        source: ParseBlockError,
    },

    #[error("invalid context value for `{key}`: {value:?}")]
    InvalidContext { key: String, value: String },

    #[error("invalid session id {id:?}: {reason}")]
    InvalidSessionId { id: String, reason: &'static str },
}

impl LedgerError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

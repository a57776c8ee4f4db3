//! The seam to whatever actually moves bytes.

use std::future::Future;
use std::pin::Pin;

use blockship_ledger::BlockInfo;

use crate::TransferError;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Result of one successful block transfer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockOutcome {
    /// Number of input records the sink rejected.
    pub rejected_records: u64,
    /// The rejected input, as captured in `bad_<blockId>`. Empty when
    /// nothing was rejected.
    pub rejected_payload: Vec<u8>,
}

impl BlockOutcome {
    pub fn clean() -> Self {
        Self::default()
    }

    pub fn has_rejected(&self) -> bool {
        !self.rejected_payload.is_empty() || self.rejected_records > 0
    }
}

/// Transfers blocks for one session.
///
/// The coordinator calls [`transfer`](Self::transfer) concurrently from
/// several workers, one block per call, and [`finalize`](Self::finalize)
/// once every block has landed. Implementations wrap the platform SDK; the
/// crate ships [`LocalFileClient`](crate::LocalFileClient) for local copies.
pub trait TransferClient: Send + Sync {
    fn transfer<'a>(
        &'a self,
        block: &'a BlockInfo,
    ) -> BoxFuture<'a, Result<BlockOutcome, TransferError>>;

    /// Commits the transferred blocks on the sink side.
    fn finalize(&self) -> BoxFuture<'_, Result<(), TransferError>>;
}

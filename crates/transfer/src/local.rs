//! Block copies between two local directory roots.

use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use blockship_ledger::BlockInfo;
use sha2::{Digest, Sha256};
use tracing::trace;

use crate::client::{BlockOutcome, BoxFuture, TransferClient};
use crate::TransferError;
use crate::validation::validate_locator;

/// Computes SHA-256 of `data` and returns the hex-encoded digest.
pub fn checksum_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Copies each block's byte range from `source_root/<locator>` to the same
/// offset in `target_root/<locator>`, then reads it back and compares
/// checksums.
#[derive(Debug, Clone)]
pub struct LocalFileClient {
    source_root: PathBuf,
    target_root: PathBuf,
}

impl LocalFileClient {
    pub fn new(source_root: impl Into<PathBuf>, target_root: impl Into<PathBuf>) -> Self {
        Self {
            source_root: source_root.into(),
            target_root: target_root.into(),
        }
    }

    pub fn source_root(&self) -> &Path {
        &self.source_root
    }

    pub fn target_root(&self) -> &Path {
        &self.target_root
    }
}

impl TransferClient for LocalFileClient {
    fn transfer<'a>(
        &'a self,
        block: &'a BlockInfo,
    ) -> BoxFuture<'a, Result<BlockOutcome, TransferError>> {
        Box::pin(async move {
            validate_locator(&block.locator)?;
            let src = self.source_root.join(&block.locator);
            let dst = self.target_root.join(&block.locator);
            let block = block.clone();

            tokio::task::spawn_blocking(move || copy_block(&src, &dst, &block))
                .await
                .map_err(|e| TransferError::Client(format!("copy task failed: {e}")))??;
            Ok(BlockOutcome::clean())
        })
    }

    fn finalize(&self) -> BoxFuture<'_, Result<(), TransferError>> {
        Box::pin(async move {
            let metadata = tokio::fs::metadata(&self.target_root).await?;
            if !metadata.is_dir() {
                return Err(TransferError::InvalidPath(format!(
                    "target is not a directory: {}",
                    self.target_root.display()
                )));
            }
            Ok(())
        })
    }
}

/// Bytes moved per read/write while copying a block.
const COPY_BUFFER_SIZE: usize = 1024 * 1024;

fn copy_block(src: &Path, dst: &Path, block: &BlockInfo) -> Result<(), TransferError> {
    let mut input = std::fs::File::open(src)?;
    input.seek(SeekFrom::Start(block.offset))?;

    if let Some(parent) = dst.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut output = std::fs::OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(dst)?;
    output.seek(SeekFrom::Start(block.offset))?;

    let mut buf = vec![0u8; buffer_len(block.length)?];
    let mut hasher = Sha256::new();
    let mut remaining = block.length;
    while remaining > 0 {
        let chunk = &mut buf[..buffer_len(remaining)?];
        input.read_exact(chunk)?;
        hasher.update(&*chunk);
        output.write_all(chunk)?;
        remaining -= chunk.len() as u64;
    }
    output.flush()?;
    let expected = hex::encode(hasher.finalize());

    output.seek(SeekFrom::Start(block.offset))?;
    let mut hasher = Sha256::new();
    let mut remaining = block.length;
    while remaining > 0 {
        let chunk = &mut buf[..buffer_len(remaining)?];
        output.read_exact(chunk)?;
        hasher.update(&*chunk);
        remaining -= chunk.len() as u64;
    }
    if hex::encode(hasher.finalize()) != expected {
        return Err(TransferError::ChecksumMismatch { block_id: block.id });
    }

    trace!(block = block.id, bytes = block.length, checksum = %expected, "block copied");
    Ok(())
}

/// Size of the next copy step for `remaining` bytes.
fn buffer_len(remaining: u64) -> Result<usize, TransferError> {
    let len = remaining.min(COPY_BUFFER_SIZE as u64);
    usize::try_from(len)
        .map_err(|_| TransferError::InvalidPath(format!("block length {remaining} too large")))
}

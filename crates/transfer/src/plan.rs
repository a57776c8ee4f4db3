//! Deterministic partitioning of an input into blocks.

use std::path::{Path, PathBuf};

use blockship_ledger::BlockInfo;

use crate::TransferError;
use crate::validation::validate_locator;

/// What a fresh run transfers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanSource {
    /// One file split into fixed-size byte ranges.
    File(PathBuf),
    /// A directory tree, one block per regular file.
    Directory(PathBuf),
}

impl PlanSource {
    /// Picks the variant from what `path` is on disk.
    pub fn from_path(path: impl Into<PathBuf>) -> Result<Self, TransferError> {
        let path = path.into();
        let metadata = std::fs::metadata(&path)?;
        if metadata.is_dir() {
            Ok(Self::Directory(path))
        } else if metadata.is_file() {
            Ok(Self::File(path))
        } else {
            Err(TransferError::InvalidPath(format!(
                "not a file or directory: {}",
                path.display()
            )))
        }
    }

    /// Directory that block locators are relative to.
    pub fn base_dir(&self) -> PathBuf {
        match self {
            Self::File(path) => path
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from(".")),
            Self::Directory(path) => path.clone(),
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            Self::File(path) | Self::Directory(path) => path,
        }
    }
}

/// Plans `source`. `block_size` only applies to single files.
pub fn plan(source: &PlanSource, block_size: u64) -> Result<Vec<BlockInfo>, TransferError> {
    match source {
        PlanSource::File(path) => plan_file_blocks(path, block_size),
        PlanSource::Directory(path) => plan_dir_blocks(path),
    }
}

/// Splits a file into `block_size` ranges, ids from 1. The locator is the
/// file name. An empty file still gets one zero-length block so that it is
/// created on the other side.
pub fn plan_file_blocks(path: &Path, block_size: u64) -> Result<Vec<BlockInfo>, TransferError> {
    if block_size == 0 {
        return Err(TransferError::InvalidPath(
            "block size must be greater than zero".into(),
        ));
    }
    let size = std::fs::metadata(path)?.len();
    let locator = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| TransferError::InvalidPath(format!("no file name: {}", path.display())))?;
    validate_locator(&locator)?;

    if size == 0 {
        return Ok(vec![BlockInfo::new(1, 0, 0, locator)]);
    }

    let mut blocks = Vec::with_capacity(size.div_ceil(block_size) as usize);
    let mut offset = 0;
    let mut id = 1;
    while offset < size {
        let length = block_size.min(size - offset);
        blocks.push(BlockInfo::new(id, offset, length, locator.clone()));
        offset += length;
        id += 1;
    }
    Ok(blocks)
}

/// One block per regular file under `root`, sorted by relative path so the
/// numbering does not depend on directory iteration order.
pub fn plan_dir_blocks(root: &Path) -> Result<Vec<BlockInfo>, TransferError> {
    let mut files = Vec::new();
    walk_dir(root, root, &mut files)?;
    files.sort();

    files
        .into_iter()
        .zip(1u64..)
        .map(|((locator, size), id)| {
            validate_locator(&locator)?;
            Ok(BlockInfo::new(id, 0, size, locator))
        })
        .collect()
}

fn walk_dir(
    root: &Path,
    current: &Path,
    files: &mut Vec<(String, u64)>,
) -> Result<(), TransferError> {
    for entry in std::fs::read_dir(current)? {
        let entry = entry?;
        let path = entry.path();
        let metadata = entry.metadata()?;

        if metadata.is_dir() {
            walk_dir(root, &path, files)?;
        } else if metadata.is_file() {
            let rel_path = path.strip_prefix(root).map_err(std::io::Error::other)?;
            // Locators use `/` on every platform.
            let rel_str = rel_path.to_string_lossy().replace('\\', "/");
            files.push((rel_str, metadata.len()));
        }
    }
    Ok(())
}

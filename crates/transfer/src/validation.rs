use std::path::{Component, Path};

use crate::TransferError;

/// Validates that a block locator is a relative path that stays inside the
/// transfer root.
///
/// Rejects empty locators, absolute paths, `..` components, Windows prefixes
/// and line breaks (a locator is stored on one ledger line).
pub fn validate_locator(locator: &str) -> Result<(), TransferError> {
    if locator.is_empty() {
        return Err(TransferError::InvalidPath("empty locator".into()));
    }
    if locator.contains(['\n', '\r']) {
        return Err(TransferError::InvalidPath(format!(
            "line break in locator: {locator:?}"
        )));
    }

    let path = Path::new(locator);
    if path.is_absolute() {
        return Err(TransferError::InvalidPath(format!(
            "absolute path not allowed: {locator}"
        )));
    }

    for component in path.components() {
        match component {
            Component::ParentDir => {
                return Err(TransferError::InvalidPath(format!(
                    "parent directory traversal not allowed: {locator}"
                )));
            }
            Component::Prefix(_) | Component::RootDir => {
                return Err(TransferError::InvalidPath(format!(
                    "absolute path not allowed: {locator}"
                )));
            }
            Component::CurDir | Component::Normal(_) => {}
        }
    }

    Ok(())
}

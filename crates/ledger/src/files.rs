//! On-disk artifacts of a session directory and their text codecs.

use std::collections::BTreeMap;
use std::io::{ErrorKind, Write};
use std::path::Path;

use crate::block::BlockInfo;
use crate::error::LedgerError;

/// Directory under the ledger root that holds the date buckets.
pub const SESSIONS_DIR: &str = "sessions";
/// Flat `key=value` context snapshot.
pub const CONTEXT_FILE: &str = "context.properties";
/// Append-only event log.
pub const LOG_FILE: &str = "log.txt";
/// Planned block set, overwritten once per planning epoch.
pub const BLOCK_INDEX_FILE: &str = "block_index.txt";
/// Append-only completion log.
pub const FINISH_BLOCK_FILE: &str = "finish_block.txt";
/// Prefix of per-block rejected-record captures (`bad_<blockId>`).
pub const BAD_DATA_PREFIX: &str = "bad_";

/// Reads a text file, treating a missing file as `None`.
pub(crate) fn read_optional(path: &Path) -> Result<Option<String>, LedgerError> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(LedgerError::io(path, e)),
    }
}

/// Replaces `path` with `content` through a sibling temp file and a rename,
/// so readers never observe a half-written snapshot.
pub(crate) fn write_replace(path: &Path, content: &[u8]) -> Result<(), LedgerError> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(".{file_name}.tmp"));

    let mut file = std::fs::File::create(&tmp).map_err(|e| LedgerError::io(&tmp, e))?;
    file.write_all(content)
        .and_then(|()| file.sync_all())
        .map_err(|e| LedgerError::io(&tmp, e))?;
    drop(file);

    std::fs::rename(&tmp, path).map_err(|e| LedgerError::io(path, e))
}

/// Appends `content` with a single write call.
pub(crate) fn append(path: &Path, content: &[u8]) -> Result<(), LedgerError> {
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| LedgerError::io(path, e))?;
    file.write_all(content).map_err(|e| LedgerError::io(path, e))
}

// ---------------------------------------------------------------------------
// Block lists
// ---------------------------------------------------------------------------

pub(crate) fn encode_blocks(blocks: &[BlockInfo]) -> String {
    let mut out = String::new();
    for block in blocks {
        out.push_str(&block.serialize());
        out.push('\n');
    }
    out
}

/// Reads a block list file. Missing file is an empty list; blank lines are
/// skipped; any other malformed line is `Corrupt`.
pub(crate) fn read_blocks(path: &Path) -> Result<Vec<BlockInfo>, LedgerError> {
    let Some(content) = read_optional(path)? else {
        return Ok(Vec::new());
    };

    let mut blocks = Vec::new();
    for (idx, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let block = BlockInfo::parse(line).map_err(|source| LedgerError::Corrupt {
            path: path.to_path_buf(),
            line: idx + 1,
            source,
        })?;
        blocks.push(block);
    }
    Ok(blocks)
}

// ---------------------------------------------------------------------------
// Properties
// ---------------------------------------------------------------------------

pub(crate) fn encode_properties(header: &[String], map: &BTreeMap<String, String>) -> String {
    let mut out = String::new();
    for line in header {
        out.push('#');
        out.push_str(line);
        out.push('\n');
    }
    for (key, value) in map {
        out.push_str(&escape(key));
        out.push('=');
        out.push_str(&escape(value));
        out.push('\n');
    }
    out
}

/// Parses `key=value` lines. Lines whose key starts with `#`, blank lines
/// and lines without `=` are skipped.
pub(crate) fn decode_properties(content: &str) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    for line in content.lines() {
        let line = line.trim_start();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = split_key(line) {
            map.insert(unescape(key.trim_end()), unescape(value));
        }
    }
    map
}

/// Splits at the first `=` not escaped by a backslash.
fn split_key(line: &str) -> Option<(&str, &str)> {
    let mut escaped = false;
    for (i, b) in line.bytes().enumerate() {
        match b {
            _ if escaped => escaped = false,
            b'\\' => escaped = true,
            b'=' => return Some((&line[..i], &line[i + 1..])),
            _ => {}
        }
    }
    None
}

fn escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '=' => out.push_str("\\="),
            c => out.push(c),
        }
    }
    out
}

fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('t') => out.push('\t'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

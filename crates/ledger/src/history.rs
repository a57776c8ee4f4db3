//! One session's directory and the operations on its ledger files.

use std::collections::{BTreeMap, HashSet};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::Local;
use tracing::debug;

use crate::block::BlockInfo;
use crate::context::{self, SessionContext, SessionStatus};
use crate::error::LedgerError;
use crate::files::{
    self, BAD_DATA_PREFIX, BLOCK_INDEX_FILE, CONTEXT_FILE, FINISH_BLOCK_FILE, LOG_FILE,
};

/// Handle on `root/sessions/<bucket>/<sid>/`.
///
/// Appends to the event log and the completion log go through one mutex,
/// so concurrent callers sharing this handle never interleave records.
/// Share it with `Arc` rather than opening the same directory twice.
#[derive(Debug)]
pub struct SessionHistory {
    session_id: String,
    dir: PathBuf,
    append_lock: Mutex<()>,
}

impl SessionHistory {
    /// Opens the session directory, creating it if absent.
    pub fn open(dir: impl Into<PathBuf>, session_id: impl Into<String>) -> Result<Self, LedgerError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| LedgerError::io(&dir, e))?;
        Ok(Self {
            session_id: session_id.into(),
            dir,
            append_lock: Mutex::new(()),
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of a ledger artifact inside this session.
    pub fn path(&self, file_name: &str) -> PathBuf {
        self.dir.join(file_name)
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        self.append_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // -----------------------------------------------------------------------
    // Context
    // -----------------------------------------------------------------------

    /// Overwrites the context snapshot with `map`.
    pub fn save_context(&self, map: &BTreeMap<String, String>) -> Result<(), LedgerError> {
        let header = vec![
            format!("blockship session {}", self.session_id),
            Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
        ];
        let content = files::encode_properties(&header, map);
        files::write_replace(&self.path(CONTEXT_FILE), content.as_bytes())
    }

    /// Loads the context snapshot; an absent file is an empty map.
    pub fn load_context(&self) -> Result<BTreeMap<String, String>, LedgerError> {
        Ok(files::read_optional(&self.path(CONTEXT_FILE))?
            .map(|content| files::decode_properties(&content))
            .unwrap_or_default())
    }

    pub fn has_context(&self) -> bool {
        self.path(CONTEXT_FILE).is_file()
    }

    pub fn save_session_context(&self, ctx: &SessionContext) -> Result<(), LedgerError> {
        self.save_context(&ctx.to_properties())
    }

    /// Typed view of the context. The session id falls back to this
    /// handle's id when the snapshot does not carry one.
    pub fn load_session_context(&self) -> Result<SessionContext, LedgerError> {
        let mut ctx = SessionContext::from_properties(&self.load_context()?)?;
        if ctx.session_id.is_empty() {
            ctx.session_id = self.session_id.clone();
        }
        Ok(ctx)
    }

    /// Creation time in Unix milliseconds, `0` when missing or unreadable.
    pub fn created_at(&self) -> Result<i64, LedgerError> {
        Ok(context::created_at_of(&self.load_context()?))
    }

    pub fn status(&self) -> Result<SessionStatus, LedgerError> {
        Ok(context::status_of(&self.load_context()?))
    }

    pub fn command(&self) -> Result<String, LedgerError> {
        Ok(context::command_of(&self.load_context()?))
    }

    // -----------------------------------------------------------------------
    // Event log
    // -----------------------------------------------------------------------

    /// Appends one timestamped line to `log.txt`.
    pub fn log(&self, message: &str) -> Result<(), LedgerError> {
        let flat: String = message
            .chars()
            .filter(|&c| c != '\r')
            .map(|c| if c == '\n' { ' ' } else { c })
            .collect();
        let line = format!(
            "[{}] {}\n",
            Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            flat
        );

        let _guard = self.lock();
        files::append(&self.path(LOG_FILE), line.as_bytes())
    }

    pub fn read_log(&self) -> Result<Vec<String>, LedgerError> {
        Ok(files::read_optional(&self.path(LOG_FILE))?
            .map(|content| content.lines().map(str::to_string).collect())
            .unwrap_or_default())
    }

    // -----------------------------------------------------------------------
    // Block ledger
    // -----------------------------------------------------------------------

    /// Replaces the plan snapshot with `plan`, one line per block in order.
    pub fn save_block_index(&self, plan: &[BlockInfo]) -> Result<(), LedgerError> {
        files::write_replace(
            &self.path(BLOCK_INDEX_FILE),
            files::encode_blocks(plan).as_bytes(),
        )?;
        debug!(session = %self.session_id, blocks = plan.len(), "block index saved");
        Ok(())
    }

    pub fn has_block_index(&self) -> bool {
        self.path(BLOCK_INDEX_FILE).is_file()
    }

    /// Appends one completion record. Repeated ids are kept.
    pub fn save_finish_block(&self, block: &BlockInfo) -> Result<(), LedgerError> {
        let line = format!("{}\n", block.serialize());
        let _guard = self.lock();
        files::append(&self.path(FINISH_BLOCK_FILE), line.as_bytes())
    }

    /// Pending blocks: the plan minus every id present in the completion
    /// log, in plan order.
    pub fn load_block_index(&self) -> Result<Vec<BlockInfo>, LedgerError> {
        let plan = self.load_full_block_index()?;
        let finished: HashSet<BlockInfo> = self.load_finish_block_list()?.into_iter().collect();
        Ok(plan
            .into_iter()
            .filter(|block| !finished.contains(block))
            .collect())
    }

    /// The plan snapshot as written, ignoring completions.
    pub fn load_full_block_index(&self) -> Result<Vec<BlockInfo>, LedgerError> {
        files::read_blocks(&self.path(BLOCK_INDEX_FILE))
    }

    /// The completion log in append order, duplicates included.
    pub fn load_finish_block_list(&self) -> Result<Vec<BlockInfo>, LedgerError> {
        files::read_blocks(&self.path(FINISH_BLOCK_FILE))
    }

    // -----------------------------------------------------------------------
    // Rejected records
    // -----------------------------------------------------------------------

    pub fn bad_data_path(&self, block_id: u64) -> PathBuf {
        self.path(&format!("{BAD_DATA_PREFIX}{block_id}"))
    }

    /// Replaces the rejected-record capture of one block.
    pub fn save_bad_data(&self, block_id: u64, payload: &[u8]) -> Result<(), LedgerError> {
        let path = self.bad_data_path(block_id);
        std::fs::write(&path, payload).map_err(|e| LedgerError::io(&path, e))
    }

    /// Removes the capture of one block, if any.
    pub fn clear_bad_data(&self, block_id: u64) -> Result<(), LedgerError> {
        let path = self.bad_data_path(block_id);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(LedgerError::io(&path, e)),
        }
    }

    /// Whether any block captured rejected records.
    pub fn exists_bad(&self) -> Result<bool, LedgerError> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(LedgerError::io(&self.dir, e)),
        };
        for entry in entries {
            let entry = entry.map_err(|e| LedgerError::io(&self.dir, e))?;
            if entry
                .file_name()
                .to_string_lossy()
                .starts_with(BAD_DATA_PREFIX)
            {
                return Ok(true);
            }
        }
        Ok(false)
    }

    // -----------------------------------------------------------------------
    // Removal
    // -----------------------------------------------------------------------

    /// Removes the session directory, then its date bucket if it is empty.
    pub fn delete(self) -> Result<(), LedgerError> {
        let entries = std::fs::read_dir(&self.dir).map_err(|e| LedgerError::io(&self.dir, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| LedgerError::io(&self.dir, e))?;
            let path = entry.path();
            let removed = if entry.file_type().is_ok_and(|t| t.is_dir()) {
                std::fs::remove_dir_all(&path)
            } else {
                std::fs::remove_file(&path)
            };
            removed.map_err(|e| LedgerError::io(&path, e))?;
        }
        std::fs::remove_dir(&self.dir).map_err(|e| LedgerError::io(&self.dir, e))?;

        if let Some(bucket) = self.dir.parent() {
            let empty = std::fs::read_dir(bucket)
                .map_err(|e| LedgerError::io(bucket, e))?
                .next()
                .is_none();
            if empty {
                std::fs::remove_dir(bucket).map_err(|e| LedgerError::io(bucket, e))?;
            }
        }

        debug!(session = %self.session_id, "session deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn test_session() -> (TempDir, SessionHistory) {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("sessions").join("20261017").join("s1");
        let history = SessionHistory::open(dir, "s1").unwrap();
        (tmp, history)
    }

    fn plan(ids: &[u64]) -> Vec<BlockInfo> {
        ids.iter()
            .map(|&id| BlockInfo::new(id, (id - 1) * 100, 100, "input.csv"))
            .collect()
    }

    fn ids(blocks: &[BlockInfo]) -> Vec<u64> {
        blocks.iter().map(|b| b.id).collect()
    }

    #[test]
    fn open_is_idempotent() {
        let (_tmp, history) = test_session();
        history.log("first").unwrap();
        let again = SessionHistory::open(history.dir(), "s1").unwrap();
        assert_eq!(again.read_log().unwrap().len(), 1);
    }

    #[test]
    fn context_roundtrip_and_overwrite() {
        let (_tmp, history) = test_session();
        let mut map = BTreeMap::new();
        map.insert("threads".to_string(), "4".to_string());
        map.insert("old".to_string(), "x".to_string());
        history.save_context(&map).unwrap();
        assert_eq!(history.load_context().unwrap(), map);

        map.remove("old");
        history.save_context(&map).unwrap();
        let loaded = history.load_context().unwrap();
        assert_eq!(loaded.len(), 1);
        assert!(!loaded.contains_key("old"));
    }

    #[test]
    fn missing_context_is_empty() {
        let (_tmp, history) = test_session();
        assert!(!history.has_context());
        assert!(history.load_context().unwrap().is_empty());
        assert_eq!(history.created_at().unwrap(), 0);
    }

    #[test]
    fn context_comment_lines_skipped() {
        let (_tmp, history) = test_session();
        std::fs::write(
            history.path(CONTEXT_FILE),
            "#comment\n#threads=9\nthreads=2\n",
        )
        .unwrap();
        let map = history.load_context().unwrap();
        assert_eq!(map.len(), 1);
        assert_eq!(map["threads"], "2");
    }

    #[test]
    fn typed_context_fills_session_id() {
        let (_tmp, history) = test_session();
        let ctx = history.load_session_context().unwrap();
        assert_eq!(ctx.session_id, "s1");
    }

    #[test]
    fn log_appends_single_lines() {
        let (_tmp, history) = test_session();
        history.log("start").unwrap();
        history.log("multi\nline\r\nmessage").unwrap();

        let lines = history.read_log().unwrap();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with('['));
        assert!(lines[0].ends_with("] start"));
        assert!(lines[1].ends_with("] multi line message"));
    }

    #[test]
    fn block_index_roundtrip_without_completions() {
        let (_tmp, history) = test_session();
        let blocks = plan(&[1, 2, 3]);
        history.save_block_index(&blocks).unwrap();

        let loaded = history.load_block_index().unwrap();
        assert_eq!(ids(&loaded), vec![1, 2, 3]);
        assert_eq!(loaded[2].offset, 200);
        assert_eq!(loaded[2].locator, "input.csv");
    }

    #[test]
    fn save_block_index_overwrites_previous_plan() {
        let (_tmp, history) = test_session();
        history.save_block_index(&plan(&[1, 2, 3, 4])).unwrap();
        history.save_block_index(&plan(&[1, 2])).unwrap();
        assert_eq!(ids(&history.load_full_block_index().unwrap()), vec![1, 2]);
    }

    #[test]
    fn pending_excludes_completed_in_plan_order() {
        let (_tmp, history) = test_session();
        history.save_block_index(&plan(&[1, 2, 3, 4, 5])).unwrap();
        history.save_finish_block(&BlockInfo::new(1, 0, 100, "input.csv")).unwrap();
        history.save_finish_block(&BlockInfo::new(2, 100, 100, "input.csv")).unwrap();

        assert_eq!(ids(&history.load_block_index().unwrap()), vec![3, 4, 5]);
    }

    #[test]
    fn pending_ignores_finish_order_and_duplicates() {
        let (_tmp, history) = test_session();
        history.save_block_index(&plan(&[1, 2, 3, 4, 5, 6])).unwrap();
        for id in [5, 2, 5, 2, 2] {
            history.save_finish_block(&BlockInfo::new(id, 0, 0, "x")).unwrap();
        }

        assert_eq!(ids(&history.load_block_index().unwrap()), vec![1, 3, 4, 6]);
    }

    #[test]
    fn finish_list_keeps_order_and_duplicates() {
        let (_tmp, history) = test_session();
        for id in [3, 1, 3] {
            history.save_finish_block(&BlockInfo::new(id, 0, 1, "f")).unwrap();
        }
        assert_eq!(ids(&history.load_finish_block_list().unwrap()), vec![3, 1, 3]);
    }

    #[test]
    fn missing_ledger_files_are_empty() {
        let (_tmp, history) = test_session();
        assert!(!history.has_block_index());
        assert!(history.load_block_index().unwrap().is_empty());
        assert!(history.load_finish_block_list().unwrap().is_empty());
    }

    #[test]
    fn finished_without_plan_is_empty_pending() {
        let (_tmp, history) = test_session();
        history.save_finish_block(&BlockInfo::new(1, 0, 1, "f")).unwrap();
        assert!(history.load_block_index().unwrap().is_empty());
    }

    #[test]
    fn corrupt_finish_log_propagates() {
        let (_tmp, history) = test_session();
        history.save_block_index(&plan(&[1, 2])).unwrap();
        std::fs::write(history.path(FINISH_BLOCK_FILE), "1:0:100:input.csv\nnot a block\n")
            .unwrap();

        match history.load_block_index() {
            Err(LedgerError::Corrupt { path, line, .. }) => {
                assert!(path.ends_with(FINISH_BLOCK_FILE));
                assert_eq!(line, 2);
            }
            other => panic!("expected Corrupt, got {other:?}"),
        }
    }

    #[test]
    fn concurrent_finish_appends_do_not_interleave() {
        let (_tmp, history) = test_session();
        let history = Arc::new(history);
        let long_locator = "p".repeat(2048);

        let handles: Vec<_> = (0..8u64)
            .map(|worker| {
                let h = Arc::clone(&history);
                let locator = long_locator.clone();
                std::thread::spawn(move || {
                    for i in 0..50u64 {
                        let id = worker * 1000 + i;
                        h.save_finish_block(&BlockInfo::new(id, i, 1, locator.as_str()))
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let finished = history.load_finish_block_list().unwrap();
        assert_eq!(finished.len(), 400);
        assert!(finished.iter().all(|b| b.locator == long_locator));
    }

    #[test]
    fn bad_data_is_per_block() {
        let (_tmp, history) = test_session();
        assert!(!history.exists_bad().unwrap());

        history.save_bad_data(1, b"bad row 1").unwrap();
        history.save_bad_data(2, b"bad row 2").unwrap();
        history.save_bad_data(1, b"replaced").unwrap();
        assert!(history.exists_bad().unwrap());
        assert_eq!(std::fs::read(history.bad_data_path(1)).unwrap(), b"replaced");

        history.clear_bad_data(1).unwrap();
        assert!(!history.bad_data_path(1).exists());
        assert_eq!(std::fs::read(history.bad_data_path(2)).unwrap(), b"bad row 2");
        assert!(history.exists_bad().unwrap());

        history.clear_bad_data(2).unwrap();
        history.clear_bad_data(2).unwrap();
        assert!(!history.exists_bad().unwrap());
    }

    #[test]
    fn delete_removes_only_empty_bucket() {
        let tmp = TempDir::new().unwrap();
        let bucket = tmp.path().join("sessions").join("20261017");
        let a = SessionHistory::open(bucket.join("a"), "a").unwrap();
        let b = SessionHistory::open(bucket.join("b"), "b").unwrap();
        a.save_block_index(&plan(&[1])).unwrap();
        a.save_bad_data(1, b"x").unwrap();
        b.log("keep").unwrap();

        a.delete().unwrap();
        assert!(!bucket.join("a").exists());
        assert!(bucket.exists());
        assert_eq!(b.read_log().unwrap().len(), 1);

        b.delete().unwrap();
        assert!(!bucket.exists());
        assert!(tmp.path().join("sessions").exists());
    }
}

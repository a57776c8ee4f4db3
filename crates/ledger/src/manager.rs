//! Discovery and housekeeping of all sessions under a ledger root.

use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use chrono::{Local, TimeZone, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::context::SessionStatus;
use crate::error::LedgerError;
use crate::files::SESSIONS_DIR;
use crate::history::SessionHistory;

const MILLIS_PER_DAY: i64 = 24 * 60 * 60 * 1000;

/// One row of `history` output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistoryEntry {
    pub session_id: String,
    pub status: SessionStatus,
    pub command: String,
    pub created_at: i64,
}

/// Owns `root/sessions/<yyyyMMdd>/<sid>/`.
#[derive(Debug, Clone)]
pub struct SessionHistoryManager {
    sessions_dir: PathBuf,
}

impl SessionHistoryManager {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            sessions_dir: root.as_ref().join(SESSIONS_DIR),
        }
    }

    pub fn sessions_dir(&self) -> &Path {
        &self.sessions_dir
    }

    /// Generates a time-derived session id: `yyyyMMddHHmmss` followed by
    /// twelve random hex digits.
    pub fn new_session_id() -> String {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        format!("{}{}", Local::now().format("%Y%m%d%H%M%S"), &suffix[..12])
    }

    /// Every session, oldest first by persisted creation time. Sessions
    /// without a readable timestamp sort first; ties go by id.
    pub fn list(&self) -> Result<Vec<SessionHistory>, LedgerError> {
        let mut keyed = Vec::new();
        for (sid, dir) in self.session_dirs()? {
            let history = SessionHistory::open(dir, sid)?;
            let created_at = history.created_at()?;
            keyed.push((created_at, history));
        }
        keyed.sort_by(|(ta, a), (tb, b)| {
            ta.cmp(tb)
                .then_with(|| a.session_id().cmp(b.session_id()))
        });
        Ok(keyed.into_iter().map(|(_, history)| history).collect())
    }

    /// The most recently created session.
    pub fn get_latest(&self) -> Result<SessionHistory, LedgerError> {
        self.list()?
            .pop()
            .ok_or_else(|| LedgerError::NotFound("no sessions recorded".into()))
    }

    /// Locates an existing session by id in any bucket.
    pub fn find(&self, session_id: &str) -> Result<Option<SessionHistory>, LedgerError> {
        for (sid, dir) in self.session_dirs()? {
            if sid == session_id {
                return SessionHistory::open(dir, sid).map(Some);
            }
        }
        Ok(None)
    }

    /// Like [`find`](Self::find), but a missing session is `NotFound`.
    pub fn get(&self, session_id: &str) -> Result<SessionHistory, LedgerError> {
        self.find(session_id)?
            .ok_or_else(|| LedgerError::NotFound(session_id.to_string()))
    }

    /// Opens the session directory for `session_id`, creating it in the
    /// bucket derived from the id when it does not exist yet.
    pub fn create_session_history(&self, session_id: &str) -> Result<SessionHistory, LedgerError> {
        validate_session_id(session_id)?;
        if let Some(existing) = self.find(session_id)? {
            return Ok(existing);
        }
        let dir = self
            .sessions_dir
            .join(date_bucket(session_id))
            .join(session_id);
        SessionHistory::open(dir, session_id)
    }

    /// The `n` most recently created sessions, oldest of them first.
    /// A `success` session with captured rejected records reports `bad`.
    pub fn history(&self, n: usize) -> Result<Vec<HistoryEntry>, LedgerError> {
        let sessions = self.list()?;
        let skip = sessions.len().saturating_sub(n);

        let mut entries = Vec::with_capacity(sessions.len() - skip);
        for history in sessions.into_iter().skip(skip) {
            let ctx = history.load_context()?;
            let mut status = crate::context::status_of(&ctx);
            if status == SessionStatus::Success && history.exists_bad()? {
                status = SessionStatus::Bad;
            }
            entries.push(HistoryEntry {
                session_id: history.session_id().to_string(),
                status,
                command: crate::context::command_of(&ctx),
                created_at: crate::context::created_at_of(&ctx),
            });
        }
        Ok(entries)
    }

    /// Writes [`history`](Self::history) as one line per session.
    pub fn show_history<W: Write>(&self, n: usize, out: &mut W) -> Result<(), LedgerError> {
        for entry in self.history(n)? {
            writeln!(
                out,
                "{}\t{}\t{}\t{}",
                entry.session_id,
                format_millis(entry.created_at),
                entry.status,
                entry.command
            )
            .map_err(|e| LedgerError::io("<output>", e))?;
        }
        Ok(())
    }

    /// Deletes every session created more than `days` days ago. Returns the
    /// deleted ids.
    pub fn purge_history(&self, days: u32) -> Result<Vec<String>, LedgerError> {
        let cutoff = Utc::now().timestamp_millis() - i64::from(days) * MILLIS_PER_DAY;
        self.purge_history_before(cutoff)
    }

    /// Deletes every session whose creation time is strictly before
    /// `cutoff` (Unix millis).
    pub fn purge_history_before(&self, cutoff: i64) -> Result<Vec<String>, LedgerError> {
        let mut deleted = Vec::new();
        for history in self.list()? {
            if history.created_at()? >= cutoff {
                continue;
            }
            let sid = history.session_id().to_string();
            history.delete()?;
            info!(session = %sid, "purged session");
            deleted.push(sid);
        }
        Ok(deleted)
    }

    /// `(sid, dir)` for every session directory under every bucket.
    fn session_dirs(&self) -> Result<Vec<(String, PathBuf)>, LedgerError> {
        let mut found = Vec::new();
        for bucket in read_subdirs(&self.sessions_dir)? {
            for dir in read_subdirs(&bucket)? {
                let Some(sid) = dir.file_name().and_then(|n| n.to_str()) else {
                    warn!(path = %dir.display(), "skipping session with non UTF-8 name");
                    continue;
                };
                found.push((sid.to_string(), dir.clone()));
            }
        }
        Ok(found)
    }
}

/// Checks that `session_id` names exactly one directory level under its
/// bucket.
pub fn validate_session_id(session_id: &str) -> Result<(), LedgerError> {
    let reason = if session_id.is_empty() {
        Some("empty")
    } else if session_id == "." || session_id == ".." {
        Some("relative directory name")
    } else if session_id.contains(['/', '\\']) {
        Some("contains a path separator")
    } else if session_id.contains(['\n', '\r', '\0']) {
        Some("contains a control character")
    } else {
        None
    };
    match reason {
        Some(reason) => Err(LedgerError::InvalidSessionId {
            id: session_id.to_string(),
            reason,
        }),
        None => Ok(()),
    }
}

/// Bucket name for a session id: its `yyyyMMdd` prefix when the id is
/// time-derived, today's date otherwise.
pub(crate) fn date_bucket(session_id: &str) -> String {
    let prefix = session_id.get(..8).unwrap_or("");
    if prefix.len() == 8 && prefix.bytes().all(|b| b.is_ascii_digit()) {
        prefix.to_string()
    } else {
        Local::now().format("%Y%m%d").to_string()
    }
}

fn read_subdirs(dir: &Path) -> Result<Vec<PathBuf>, LedgerError> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(LedgerError::io(dir, e)),
    };

    let mut dirs = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| LedgerError::io(dir, e))?;
        if entry.file_type().is_ok_and(|t| t.is_dir()) {
            dirs.push(entry.path());
        }
    }
    Ok(dirs)
}

fn format_millis(millis: i64) -> String {
    match Local.timestamp_millis_opt(millis).single() {
        Some(ts) if millis > 0 => ts.format("%Y-%m-%d %H:%M:%S").to_string(),
        _ => "-".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockInfo;
    use crate::context::{SessionContext, TransferConfig};
    use tempfile::TempDir;

    fn create(manager: &SessionHistoryManager, sid: &str, created_at: i64) -> SessionHistory {
        let history = manager.create_session_history(sid).unwrap();
        let mut ctx = SessionContext::new(
            sid,
            format!("upload {sid}"),
            created_at,
            TransferConfig::default(),
        );
        ctx.status = SessionStatus::Success;
        history.save_session_context(&ctx).unwrap();
        history
    }

    #[test]
    fn empty_root_lists_nothing() {
        let tmp = TempDir::new().unwrap();
        let manager = SessionHistoryManager::new(tmp.path());
        assert!(manager.list().unwrap().is_empty());
        assert!(matches!(manager.get_latest(), Err(LedgerError::NotFound(_))));
    }

    #[test]
    fn latest_is_max_timestamp() {
        let tmp = TempDir::new().unwrap();
        let manager = SessionHistoryManager::new(tmp.path());
        create(&manager, "s2", 200);
        create(&manager, "s1", 100);

        assert_eq!(manager.get_latest().unwrap().session_id(), "s2");
    }

    #[test]
    fn list_sorts_across_buckets() {
        let tmp = TempDir::new().unwrap();
        let manager = SessionHistoryManager::new(tmp.path());
        create(&manager, "20260101000000aaaaaaaaaaaa", 300);
        create(&manager, "20251231000000bbbbbbbbbbbb", 100);
        create(&manager, "20260102000000cccccccccccc", 200);

        let ids: Vec<String> = manager
            .list()
            .unwrap()
            .iter()
            .map(|h| h.session_id().to_string())
            .collect();
        assert_eq!(
            ids,
            vec![
                "20251231000000bbbbbbbbbbbb",
                "20260102000000cccccccccccc",
                "20260101000000aaaaaaaaaaaa",
            ]
        );
        assert!(manager.sessions_dir().join("20251231").is_dir());
    }

    #[test]
    fn unparseable_timestamp_sorts_first() {
        let tmp = TempDir::new().unwrap();
        let manager = SessionHistoryManager::new(tmp.path());
        create(&manager, "s1", 100);
        let broken = manager.create_session_history("s0").unwrap();
        let mut map = broken.load_context().unwrap();
        map.insert("create_time".into(), "yesterday".into());
        broken.save_context(&map).unwrap();

        let list = manager.list().unwrap();
        assert_eq!(list[0].session_id(), "s0");
        assert_eq!(list[1].session_id(), "s1");
    }

    #[test]
    fn create_reuses_existing_directory() {
        let tmp = TempDir::new().unwrap();
        let manager = SessionHistoryManager::new(tmp.path());
        let first = manager.create_session_history("custom-id").unwrap();
        first.log("hello").unwrap();

        let again = manager.create_session_history("custom-id").unwrap();
        assert_eq!(again.dir(), first.dir());
        assert_eq!(manager.list().unwrap().len(), 1);
    }

    #[test]
    fn create_fails_when_root_is_a_file() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("root");
        std::fs::write(&root, b"not a dir").unwrap();
        let manager = SessionHistoryManager::new(&root);
        assert!(matches!(
            manager.create_session_history("20261017000000aaaaaaaaaaaa"),
            Err(LedgerError::Io { .. })
        ));
    }

    #[test]
    fn find_and_get() {
        let tmp = TempDir::new().unwrap();
        let manager = SessionHistoryManager::new(tmp.path());
        create(&manager, "s1", 100);
        assert!(manager.find("s1").unwrap().is_some());
        assert!(manager.find("nope").unwrap().is_none());
        assert!(matches!(manager.get("nope"), Err(LedgerError::NotFound(id)) if id == "nope"));
    }

    #[test]
    fn history_overrides_success_with_bad() {
        let tmp = TempDir::new().unwrap();
        let manager = SessionHistoryManager::new(tmp.path());
        create(&manager, "s1", 100);
        let s2 = create(&manager, "s2", 200);
        s2.save_bad_data(3, b"bad").unwrap();
        create(&manager, "s3", 300);

        let entries = manager.history(2).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].session_id, "s2");
        assert_eq!(entries[0].status, SessionStatus::Bad);
        assert_eq!(entries[1].session_id, "s3");
        assert_eq!(entries[1].status, SessionStatus::Success);
        assert_eq!(entries[1].command, "upload s3");
    }

    #[test]
    fn show_history_prints_one_line_per_session() {
        let tmp = TempDir::new().unwrap();
        let manager = SessionHistoryManager::new(tmp.path());
        create(&manager, "s1", 100);
        create(&manager, "s2", 200);

        let mut out = Vec::new();
        manager.show_history(10, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("s1\t"));
        assert!(lines[1].contains("\tsuccess\tupload s2"));
    }

    #[test]
    fn purge_removes_only_old_sessions() {
        let tmp = TempDir::new().unwrap();
        let manager = SessionHistoryManager::new(tmp.path());
        let now = Utc::now().timestamp_millis();
        let old = create(&manager, "old", now - 31 * MILLIS_PER_DAY);
        old.save_block_index(&[BlockInfo::new(1, 0, 1, "f")]).unwrap();
        let recent = create(&manager, "recent", now - 29 * MILLIS_PER_DAY);
        recent.save_block_index(&[BlockInfo::new(1, 0, 1, "f")]).unwrap();

        let deleted = manager.purge_history(30).unwrap();
        assert_eq!(deleted, vec!["old".to_string()]);

        let remaining = manager.list().unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].session_id(), "recent");
        assert_eq!(remaining[0].load_full_block_index().unwrap().len(), 1);
    }

    #[test]
    fn purge_before_cutoff_is_strict() {
        let tmp = TempDir::new().unwrap();
        let manager = SessionHistoryManager::new(tmp.path());
        create(&manager, "a", 999);
        create(&manager, "b", 1000);
        create(&manager, "c", 1001);

        let deleted = manager.purge_history_before(1000).unwrap();
        assert_eq!(deleted, vec!["a".to_string()]);
        assert_eq!(manager.list().unwrap().len(), 2);
    }

    #[test]
    fn date_bucket_from_id() {
        assert_eq!(date_bucket("20261017123000abcdefabcdef"), "20261017");
        let today = Local::now().format("%Y%m%d").to_string();
        assert_eq!(date_bucket("s1"), today);
        assert_eq!(date_bucket("2026x017123000"), today);
    }

    #[test]
    fn generated_ids_are_time_derived() {
        let sid = SessionHistoryManager::new_session_id();
        assert_eq!(sid.len(), 26);
        assert!(sid[..14].bytes().all(|b| b.is_ascii_digit()));
        assert_ne!(sid, SessionHistoryManager::new_session_id());
    }

    #[test]
    fn unsafe_session_ids_are_rejected() {
        let tmp = TempDir::new().unwrap();
        let manager = SessionHistoryManager::new(tmp.path());

        for sid in ["", ".", "..", "../../outside", "a/b", "a\\b", "line\nbreak"] {
            let err = manager.create_session_history(sid).unwrap_err();
            assert!(
                matches!(err, LedgerError::InvalidSessionId { ref id, .. } if id == sid),
                "{sid:?} accepted"
            );
        }
        assert!(!tmp.path().join("outside").exists());
        assert!(manager.list().unwrap().is_empty());
        validate_session_id(&SessionHistoryManager::new_session_id()).unwrap();
    }

    #[test]
    fn stray_files_are_not_sessions() {
        let tmp = TempDir::new().unwrap();
        let manager = SessionHistoryManager::new(tmp.path());
        create(&manager, "20261017000000aaaaaaaaaaaa", 100);

        std::fs::write(manager.sessions_dir().join("notes.txt"), b"x").unwrap();
        std::fs::write(manager.sessions_dir().join("20261017").join("stray"), b"x").unwrap();

        let ids: Vec<String> = manager
            .list()
            .unwrap()
            .iter()
            .map(|h| h.session_id().to_string())
            .collect();
        assert_eq!(ids, vec!["20261017000000aaaaaaaaaaaa".to_string()]);
        assert!(manager.find("stray").unwrap().is_none());
        assert_eq!(manager.history(10).unwrap().len(), 1);
    }
}

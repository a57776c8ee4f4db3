//! Typed session context, persisted as flat `key=value` properties.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::LedgerError;

const KEY_SID: &str = "sid";
const KEY_COMMAND: &str = "command";
const KEY_STATUS: &str = "status";
const KEY_CREATE_TIME: &str = "create_time";
const KEY_KIND: &str = "kind";
const KEY_SOURCE: &str = "source";
const KEY_TARGET: &str = "target";
const KEY_THREADS: &str = "threads";
const KEY_BLOCK_SIZE: &str = "block_size";
const KEY_FIELD_DELIMITER: &str = "field_delimiter";
const KEY_RECORD_DELIMITER: &str = "record_delimiter";
const KEY_DISCARD_BAD_RECORDS: &str = "discard_bad_records";
const KEY_MAX_BAD_RECORDS: &str = "max_bad_records";
const KEY_CHARSET: &str = "charset";
const KEY_BLOCK_RETRIES: &str = "block_retries";

const KNOWN_KEYS: &[&str] = &[
    KEY_SID,
    KEY_COMMAND,
    KEY_STATUS,
    KEY_CREATE_TIME,
    KEY_KIND,
    KEY_SOURCE,
    KEY_TARGET,
    KEY_THREADS,
    KEY_BLOCK_SIZE,
    KEY_FIELD_DELIMITER,
    KEY_RECORD_DELIMITER,
    KEY_DISCARD_BAD_RECORDS,
    KEY_MAX_BAD_RECORDS,
    KEY_CHARSET,
    KEY_BLOCK_RETRIES,
];

/// Default block size: 64 MiB.
pub const DEFAULT_BLOCK_SIZE: u64 = 64 * 1024 * 1024;

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    #[default]
    Created,
    Running,
    Success,
    /// Finished, but some blocks captured rejected records.
    Bad,
    Failed,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Success => "success",
            Self::Bad => "bad",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(Self::Created),
            "running" => Ok(Self::Running),
            "success" => Ok(Self::Success),
            "bad" => Ok(Self::Bad),
            "failed" => Ok(Self::Failed),
            _ => Err(()),
        }
    }
}

/// Direction of a transfer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferKind {
    #[default]
    Upload,
    Download,
}

impl TransferKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Upload => "upload",
            Self::Download => "download",
        }
    }
}

/// Effective run options of a transfer. The ledger stores them verbatim;
/// only the coordinator interprets them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Number of concurrent block workers.
    pub threads: usize,
    /// Block size in bytes when splitting a single file.
    pub block_size: u64,
    pub field_delimiter: String,
    pub record_delimiter: String,
    /// Keep going when a block reports rejected records.
    pub discard_bad_records: bool,
    /// Upper bound on rejected records across the whole session.
    pub max_bad_records: u64,
    pub charset: String,
    /// Extra attempts per block after the first failure.
    pub block_retries: u32,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            threads: 1,
            block_size: DEFAULT_BLOCK_SIZE,
            field_delimiter: ",".into(),
            record_delimiter: "\n".into(),
            discard_bad_records: false,
            max_bad_records: 1000,
            charset: "utf-8".into(),
            block_retries: 3,
        }
    }
}

/// Command-line values that take precedence over a saved context on resume.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigOverrides {
    pub threads: Option<usize>,
    pub block_size: Option<u64>,
    pub field_delimiter: Option<String>,
    pub record_delimiter: Option<String>,
    pub discard_bad_records: Option<bool>,
    pub max_bad_records: Option<u64>,
    pub charset: Option<String>,
    pub block_retries: Option<u32>,
}

impl ConfigOverrides {
    /// Applies every set override to `config`.
    pub fn apply(&self, config: &mut TransferConfig) {
        if let Some(threads) = self.threads {
            config.threads = threads;
        }
        if let Some(block_size) = self.block_size {
            config.block_size = block_size;
        }
        if let Some(ref d) = self.field_delimiter {
            config.field_delimiter = d.clone();
        }
        if let Some(ref d) = self.record_delimiter {
            config.record_delimiter = d.clone();
        }
        if let Some(discard) = self.discard_bad_records {
            config.discard_bad_records = discard;
        }
        if let Some(max) = self.max_bad_records {
            config.max_bad_records = max;
        }
        if let Some(ref charset) = self.charset {
            config.charset = charset.clone();
        }
        if let Some(retries) = self.block_retries {
            config.block_retries = retries;
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Everything a session needs to be resumed, plus unknown keys carried
/// through untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionContext {
    pub session_id: String,
    /// Original command line, for `history`.
    pub command: String,
    pub status: SessionStatus,
    /// Creation time in Unix milliseconds.
    pub created_at: i64,
    pub kind: TransferKind,
    pub source: String,
    pub target: String,
    pub config: TransferConfig,
    pub extra: BTreeMap<String, String>,
}

impl SessionContext {
    pub fn new(
        session_id: impl Into<String>,
        command: impl Into<String>,
        created_at: i64,
        config: TransferConfig,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            command: command.into(),
            status: SessionStatus::Created,
            created_at,
            kind: TransferKind::Upload,
            source: String::new(),
            target: String::new(),
            config,
            extra: BTreeMap::new(),
        }
    }

    pub fn to_properties(&self) -> BTreeMap<String, String> {
        let mut map = self.extra.clone();
        let c = &self.config;
        for (key, value) in [
            (KEY_SID, self.session_id.clone()),
            (KEY_COMMAND, self.command.clone()),
            (KEY_STATUS, self.status.to_string()),
            (KEY_CREATE_TIME, self.created_at.to_string()),
            (KEY_KIND, self.kind.as_str().to_string()),
            (KEY_SOURCE, self.source.clone()),
            (KEY_TARGET, self.target.clone()),
            (KEY_THREADS, c.threads.to_string()),
            (KEY_BLOCK_SIZE, c.block_size.to_string()),
            (KEY_FIELD_DELIMITER, c.field_delimiter.clone()),
            (KEY_RECORD_DELIMITER, c.record_delimiter.clone()),
            (KEY_DISCARD_BAD_RECORDS, c.discard_bad_records.to_string()),
            (KEY_MAX_BAD_RECORDS, c.max_bad_records.to_string()),
            (KEY_CHARSET, c.charset.clone()),
            (KEY_BLOCK_RETRIES, c.block_retries.to_string()),
        ] {
            map.insert(key.to_string(), value);
        }
        map
    }

    /// Decodes a context map. Missing keys fall back to defaults; present
    /// but malformed numeric or boolean values are rejected.
    pub fn from_properties(map: &BTreeMap<String, String>) -> Result<Self, LedgerError> {
        let defaults = TransferConfig::default();
        let text = |key: &str| map.get(key).cloned();

        let config = TransferConfig {
            threads: parse_or(map, KEY_THREADS, defaults.threads)?,
            block_size: parse_or(map, KEY_BLOCK_SIZE, defaults.block_size)?,
            field_delimiter: text(KEY_FIELD_DELIMITER).unwrap_or(defaults.field_delimiter),
            record_delimiter: text(KEY_RECORD_DELIMITER).unwrap_or(defaults.record_delimiter),
            discard_bad_records: parse_or(
                map,
                KEY_DISCARD_BAD_RECORDS,
                defaults.discard_bad_records,
            )?,
            max_bad_records: parse_or(map, KEY_MAX_BAD_RECORDS, defaults.max_bad_records)?,
            charset: text(KEY_CHARSET).unwrap_or(defaults.charset),
            block_retries: parse_or(map, KEY_BLOCK_RETRIES, defaults.block_retries)?,
        };

        let kind = match map.get(KEY_KIND).map(String::as_str) {
            None | Some("upload") => TransferKind::Upload,
            Some("download") => TransferKind::Download,
            Some(other) => {
                return Err(LedgerError::InvalidContext {
                    key: KEY_KIND.into(),
                    value: other.into(),
                });
            }
        };

        let extra = map
            .iter()
            .filter(|(k, _)| !KNOWN_KEYS.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        Ok(Self {
            session_id: text(KEY_SID).unwrap_or_default(),
            command: text(KEY_COMMAND).unwrap_or_default(),
            status: map
                .get(KEY_STATUS)
                .and_then(|s| s.parse().ok())
                .unwrap_or_default(),
            created_at: parse_or(map, KEY_CREATE_TIME, 0)?,
            kind,
            source: text(KEY_SOURCE).unwrap_or_default(),
            target: text(KEY_TARGET).unwrap_or_default(),
            config,
            extra,
        })
    }
}

fn parse_or<T: FromStr>(
    map: &BTreeMap<String, String>,
    key: &str,
    default: T,
) -> Result<T, LedgerError> {
    match map.get(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|_| LedgerError::InvalidContext {
            key: key.to_string(),
            value: raw.clone(),
        }),
    }
}

/// Parses the creation timestamp of a raw context map, `0` when absent or
/// unreadable.
pub(crate) fn created_at_of(map: &BTreeMap<String, String>) -> i64 {
    map.get(KEY_CREATE_TIME)
        .and_then(|raw| raw.trim().parse().ok())
        .unwrap_or(0)
}

pub(crate) fn status_of(map: &BTreeMap<String, String>) -> SessionStatus {
    map.get(KEY_STATUS)
        .and_then(|s| s.parse().ok())
        .unwrap_or_default()
}

pub(crate) fn command_of(map: &BTreeMap<String, String>) -> String {
    map.get(KEY_COMMAND).cloned().unwrap_or_default()
}

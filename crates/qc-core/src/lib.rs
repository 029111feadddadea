use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::Write;
use std::path::{Component, Path, PathBuf};

pub const STATUS_SUCCESS: i64 = 0;
pub const STATUS_INVALID_ARGUMENT: i64 = 1;
pub const STATUS_EXECUTION_ERROR: i64 = 1111;
pub const STATUS_CANCELLED: i64 = 2222;
pub const CANCELLED_MESSAGE: &str = "Interrupted by user";

/// On-disk channel value marking a board-level summary.
pub const BOARD_CHANNEL_SENTINEL: i64 = -999;

pub const SESSION_MANIFEST_FILE: &str = "session.yaml";

/// Open set of named extension fields attached to a record.
pub type Extras = BTreeMap<String, Value>;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ResultModelError {
    #[error("board summary must use the BOARD channel, got channel {0}")]
    BoardSummaryChannel(i64),
    #[error("channel summary may not contain a BOARD entry")]
    BoardInChannelSummary,
    #[error("channel summary has duplicate entries for channel {0}")]
    DuplicateChannel(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub enum Channel {
    Board,
    Index(u32),
}

impl From<Channel> for i64 {
    fn from(value: Channel) -> Self {
        match value {
            Channel::Board => BOARD_CHANNEL_SENTINEL,
            Channel::Index(idx) => idx as i64,
        }
    }
}

impl TryFrom<i64> for Channel {
    type Error = String;

    fn try_from(value: i64) -> std::result::Result<Self, Self::Error> {
        if value == BOARD_CHANNEL_SENTINEL {
            return Ok(Channel::Board);
        }
        u32::try_from(value)
            .map(Channel::Index)
            .map_err(|_| format!("invalid channel value: {}", value))
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Channel::Board => write!(f, "BOARD"),
            Channel::Index(idx) => write!(f, "{}", idx),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusCode(pub i64, pub String);

impl StatusCode {
    pub fn success() -> Self {
        Self(STATUS_SUCCESS, String::new())
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self(STATUS_INVALID_ARGUMENT, message.into())
    }

    pub fn execution_error(message: impl Into<String>) -> Self {
        Self(STATUS_EXECUTION_ERROR, message.into())
    }

    pub fn cancelled() -> Self {
        Self(STATUS_CANCELLED, CANCELLED_MESSAGE.to_string())
    }

    pub fn code(&self) -> i64 {
        self.0
    }

    pub fn message(&self) -> &str {
        &self.1
    }

    pub fn is_success(&self) -> bool {
        self.0 == STATUS_SUCCESS
    }

    pub fn is_cancelled(&self) -> bool {
        self.0 == STATUS_CANCELLED
    }
}

/// Reference to one artifact file produced during a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataEntry {
    pub path: String,
    pub desc: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub extras: Extras,
}

impl DataEntry {
    pub fn new(path: impl Into<String>, desc: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            desc: desc.into(),
            timestamp: timestamp_now(),
            extras: Extras::new(),
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.extras.insert(key.to_string(), value.into());
        self
    }

    pub fn extra(&self, key: &str) -> Option<&Value> {
        self.extras.get(key)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SingularResult {
    pub status: i64,
    pub desc: String,
    pub channel: Channel,
    #[serde(flatten)]
    pub extras: Extras,
}

impl SingularResult {
    pub fn board(status: i64, desc: impl Into<String>) -> Self {
        Self {
            status,
            desc: desc.into(),
            channel: Channel::Board,
            extras: Extras::new(),
        }
    }

    pub fn channel(channel: u32, status: i64, desc: impl Into<String>) -> Self {
        Self {
            status,
            desc: desc.into(),
            channel: Channel::Index(channel),
            extras: Extras::new(),
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.extras.insert(key.to_string(), value.into());
        self
    }

    pub fn is_board(&self) -> bool {
        self.channel == Channel::Board
    }
}

/// Durable record of one procedure execution attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcedureResult {
    pub name: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub input: BTreeMap<String, Value>,
    pub status_code: StatusCode,
    #[serde(default)]
    pub data_files: Vec<DataEntry>,
    #[serde(default)]
    pub board_summary: Option<SingularResult>,
    #[serde(default)]
    pub channel_summary: Vec<SingularResult>,
}

impl ProcedureResult {
    pub fn new(name: impl Into<String>, input: BTreeMap<String, Value>) -> Self {
        let now = timestamp_now();
        Self {
            name: name.into(),
            start_time: now,
            end_time: now,
            input,
            status_code: StatusCode::success(),
            data_files: Vec::new(),
            board_summary: None,
            channel_summary: Vec::new(),
        }
    }

    /// True only for a clean run with a passing board-level verdict.
    pub fn is_valid(&self) -> bool {
        if !self.status_code.is_success() {
            return false;
        }
        match &self.board_summary {
            Some(summary) => summary.status == STATUS_SUCCESS,
            None => false,
        }
    }

    pub fn last_data(&self) -> Option<&DataEntry> {
        self.data_files.last()
    }

    pub fn push_data(&mut self, entry: DataEntry) -> &DataEntry {
        self.data_files.push(entry);
        &self.data_files[self.data_files.len() - 1]
    }

    pub fn set_board_summary(&mut self, summary: SingularResult) -> Result<(), ResultModelError> {
        if !summary.is_board() {
            return Err(ResultModelError::BoardSummaryChannel(summary.channel.into()));
        }
        self.board_summary = Some(summary);
        Ok(())
    }

    pub fn set_channel_summary(
        &mut self,
        summary: Vec<SingularResult>,
    ) -> Result<(), ResultModelError> {
        let mut seen = BTreeSet::new();
        for entry in &summary {
            match entry.channel {
                Channel::Board => return Err(ResultModelError::BoardInChannelSummary),
                Channel::Index(idx) => {
                    if !seen.insert(idx) {
                        return Err(ResultModelError::DuplicateChannel(idx));
                    }
                }
            }
        }
        self.channel_summary = summary;
        Ok(())
    }

    pub fn finish(&mut self, status: StatusCode) {
        self.status_code = status;
        self.end_time = timestamp_now();
    }
}

pub fn timestamp_now() -> DateTime<Utc> {
    Utc::now()
}

/// Filesystem-friendly timestamp; not meant to be parsed back.
pub fn filename_timestamp(t: DateTime<Utc>) -> String {
    t.format("%Y-%m-%dT%H%M%S%.6f").to_string()
}

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)?;
    Ok(())
}

pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            ensure_dir(parent)?;
        }
    }
    let ts = Utc::now().timestamp_micros();
    let pid = std::process::id();
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(".{}.tmp.{}.{}", name, pid, ts));
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    if let Some(parent) = path.parent() {
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

fn normalized_components(path: &Path) -> Vec<Component<'_>> {
    path.components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect()
}

/// Express `path` relative to `base`. Both must be of the same kind
/// (absolute or relative); otherwise `path` is returned unchanged.
pub fn relative_path(path: &Path, base: &Path) -> PathBuf {
    if path.is_absolute() != base.is_absolute() {
        return path.to_path_buf();
    }
    let path_parts = normalized_components(path);
    let base_parts = normalized_components(base);
    let common = path_parts
        .iter()
        .zip(base_parts.iter())
        .take_while(|(a, b)| a == b)
        .count();
    if path.is_absolute() && common == 0 {
        return path.to_path_buf();
    }
    let mut out = PathBuf::new();
    for _ in common..base_parts.len() {
        out.push("..");
    }
    for part in &path_parts[common..] {
        out.push(part.as_os_str());
    }
    if out.as_os_str().is_empty() {
        out.push(".");
    }
    out
}

//! Core data model: remote entries, transfer records and progress frames.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One remote directory listing entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteEntry {
    pub name: String,
    /// Absolute remote path.
    pub path: String,
    pub kind: EntryKind,
    pub size: u64,
    /// Seconds since the Unix epoch, if the server reported one.
    pub modified: Option<i64>,
    /// Unix mode bits, if reported.
    pub permissions: Option<u32>,
    /// Target path for symlinks.
    pub link_target: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
    Other,
}

impl RemoteEntry {
    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }
}

/// Cheap change detector for conflict checks: size plus mtime. Two writes
/// inside the same second with identical length are indistinguishable; the
/// conflict check is best effort, not a content hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub size: u64,
    pub modified: Option<i64>,
}

impl Fingerprint {
    pub fn of_entry(entry: &RemoteEntry) -> Self {
        Self {
            size: entry.size,
            modified: entry.modified,
        }
    }

    pub fn of_metadata(meta: &std::fs::Metadata) -> Self {
        let modified = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64);
        Self {
            size: meta.len(),
            modified,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferDirection {
    Upload,
    Download,
}

/// Lifecycle of a transfer record.
///
/// `Queued -> Running -> {Succeeded, Failed, Cancelled}`, with `Paused`
/// reachable from `Running` and `Failed -> Queued` on manual retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferState {
    Queued,
    Running,
    Paused,
    Succeeded,
    Failed,
    Cancelled,
}

impl TransferState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferState::Succeeded | TransferState::Failed | TransferState::Cancelled
        )
    }
}

/// A single scheduled transfer. Directory jobs get one parent record with
/// `is_directory = true` and one child record per contained file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferRecord {
    pub id: String,
    pub session_id: String,
    pub direction: TransferDirection,
    pub source: String,
    pub destination: String,
    pub state: TransferState,
    pub bytes_total: u64,
    pub bytes_done: u64,
    pub is_directory: bool,
    /// Directory job executed as one rsync run rather than a fan-out. A
    /// directory record without this flag is aggregation-only and never
    /// dispatched itself.
    #[serde(default)]
    pub bulk: bool,
    /// Set on children of a directory job.
    #[serde(default)]
    pub parent_id: Option<String>,
    /// Number of attempts so far (1 after the first try).
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub error: Option<String>,
    /// Whether a manual retry is offered for a failed record.
    #[serde(default)]
    pub retryable: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl TransferRecord {
    pub fn new(
        session_id: &str,
        direction: TransferDirection,
        source: impl Into<String>,
        destination: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            direction,
            source: source.into(),
            destination: destination.into(),
            state: TransferState::Queued,
            bytes_total: 0,
            bytes_done: 0,
            is_directory: false,
            bulk: false,
            parent_id: None,
            attempts: 0,
            error: None,
            retryable: false,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn mark_running(&mut self) {
        self.state = TransferState::Running;
        self.attempts += 1;
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
        self.error = None;
    }

    pub fn mark_succeeded(&mut self) {
        self.state = TransferState::Succeeded;
        self.finished_at = Some(Utc::now());
        self.bytes_done = self.bytes_total.max(self.bytes_done);
        self.error = None;
        self.retryable = false;
    }

    pub fn mark_failed(&mut self, error: impl Into<String>, retryable: bool) {
        self.state = TransferState::Failed;
        self.finished_at = Some(Utc::now());
        self.error = Some(error.into());
        self.retryable = retryable;
    }

    pub fn mark_cancelled(&mut self) {
        self.state = TransferState::Cancelled;
        self.finished_at = Some(Utc::now());
        self.retryable = false;
    }

    /// Manual retry: back to the queue, keeping attempt history.
    pub fn mark_requeued(&mut self) {
        self.state = TransferState::Queued;
        self.finished_at = None;
        self.error = None;
    }
}

/// One progress frame, coalesced by the sink before fan-out.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressUpdate {
    pub transfer_id: String,
    pub bytes_done: u64,
    pub bytes_total: u64,
    /// Bytes per second over the sampling window, when known.
    pub speed_bps: Option<u64>,
    /// Estimated seconds remaining, when the speed is known and nonzero.
    pub eta_secs: Option<u64>,
}

impl ProgressUpdate {
    pub fn percent(&self) -> u8 {
        if self.bytes_total == 0 {
            return 0;
        }
        ((self.bytes_done as f64 / self.bytes_total as f64) * 100.0).min(100.0) as u8
    }
}

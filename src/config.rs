//! Bridge configuration. Everything has a serde default so a partial config
//! file deserializes cleanly.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeConfig {
    /// Concurrent transfer workers per session.
    #[serde(default = "default_workers")]
    pub workers_per_session: usize,

    /// Concurrent SFTP requests in flight on one session, across all callers.
    #[serde(default = "default_ops_in_flight")]
    pub ops_in_flight: usize,

    /// Streaming chunk size in bytes.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Per-I/O deadline for a single SFTP read or write.
    #[serde(default = "default_io_timeout")]
    pub io_timeout_secs: u64,

    /// TCP + handshake deadline when connecting.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    #[serde(default)]
    pub retry: RetryConfig,

    /// Quiet interval before a file change is flushed to an upload.
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    /// Minimum interval between progress events for one transfer.
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,

    /// Number of finished transfer records kept in history.
    #[serde(default = "default_history_retention")]
    pub history_retention: usize,

    /// Optionally also drop history entries older than this many days.
    #[serde(default)]
    pub history_max_age_days: Option<u32>,

    /// Root directory for shadow files. Defaults to a per-user data dir.
    #[serde(default)]
    pub shadow_root: Option<PathBuf>,

    /// How long `close` waits for a pending upload before giving up.
    #[serde(default = "default_flush_timeout")]
    pub shadow_flush_timeout_secs: u64,

    /// Re-stat the remote file before every auto-upload.
    #[serde(default = "default_true")]
    pub conflict_check_on_save: bool,

    /// What to do when an ingested file collides with a remote entry.
    #[serde(default)]
    pub collision_policy: CollisionPolicy,

    /// Allow rsync bulk sync for directory jobs when available on both ends.
    #[serde(default = "default_true")]
    pub bulk_transfers: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_secs: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,
}

/// Collision handling for drop ingestion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollisionPolicy {
    Overwrite,
    Skip,
    /// `report.txt` becomes `report (1).txt`, then `report (2).txt`.
    AutoRename,
    /// Surface the collision and let the caller decide per file.
    #[default]
    Ask,
}

fn default_workers() -> usize {
    3
}
fn default_ops_in_flight() -> usize {
    3
}
fn default_chunk_size() -> usize {
    64 * 1024
}
fn default_io_timeout() -> u64 {
    30
}
fn default_connect_timeout() -> u64 {
    15
}
fn default_debounce_ms() -> u64 {
    500
}
fn default_progress_interval_ms() -> u64 {
    100
}
fn default_history_retention() -> usize {
    50
}
fn default_flush_timeout() -> u64 {
    10
}
fn default_true() -> bool {
    true
}
fn default_max_retries() -> u32 {
    3
}
fn default_initial_backoff() -> u64 {
    1
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_max_backoff() -> u64 {
    30
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            workers_per_session: default_workers(),
            ops_in_flight: default_ops_in_flight(),
            chunk_size: default_chunk_size(),
            io_timeout_secs: default_io_timeout(),
            connect_timeout_secs: default_connect_timeout(),
            retry: RetryConfig::default(),
            debounce_ms: default_debounce_ms(),
            progress_interval_ms: default_progress_interval_ms(),
            history_retention: default_history_retention(),
            history_max_age_days: None,
            shadow_root: None,
            shadow_flush_timeout_secs: default_flush_timeout(),
            conflict_check_on_save: true,
            collision_policy: CollisionPolicy::default(),
            bulk_transfers: true,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_secs: default_initial_backoff(),
            backoff_multiplier: default_backoff_multiplier(),
            max_backoff_secs: default_max_backoff(),
        }
    }
}

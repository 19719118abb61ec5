//! Error taxonomy for the bridge.
//!
//! Connection establishment, steady-state transport I/O and edit conflicts
//! fail in different ways and are handled by different layers, so each gets
//! its own enum. `BridgeError` is the facade-level union.

use thiserror::Error;

/// Failures while establishing a session. None of these are retried
/// automatically; all are surfaced for a user decision.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("authentication failed for {user}@{host}")]
    AuthFailure { host: String, user: String },

    #[error("cannot reach {host}:{port}: {reason}")]
    NetworkUnreachable {
        host: String,
        port: u16,
        reason: String,
    },

    /// The presented host key differs from the recorded one. Never bypassed
    /// silently; the caller must obtain explicit confirmation and call
    /// [`crate::transport::KnownHostsStore::replace_host`] before retrying.
    #[error("host key mismatch for {host}: expected {expected}, got {actual}")]
    HostKeyMismatch {
        host: String,
        expected: String,
        actual: String,
    },

    #[error("connection to {host} timed out after {seconds}s")]
    Timeout { host: String, seconds: u64 },

    #[error("credential lookup failed: {0}")]
    Credential(String),

    #[error("SSH protocol error: {0}")]
    Protocol(String),
}

/// Failures during steady-state remote I/O.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("session disconnected")]
    Disconnected,

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("transfer cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(String),

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl TransportError {
    /// Whether an automatic retry can plausibly succeed. Permission and
    /// existence failures are deterministic; cancellation is a user decision.
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::Timeout(_) | TransportError::Io(_) => true,
            TransportError::Protocol(msg) => {
                let m = msg.to_lowercase();
                m.contains("connection") || m.contains("reset") || m.contains("broken pipe")
            }
            TransportError::Disconnected
            | TransportError::PermissionDenied(_)
            | TransportError::NotFound(_)
            | TransportError::AlreadyExists(_)
            | TransportError::Cancelled => false,
        }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::NotFound => TransportError::NotFound(e.to_string()),
            std::io::ErrorKind::PermissionDenied => {
                TransportError::PermissionDenied(e.to_string())
            }
            std::io::ErrorKind::TimedOut => TransportError::Timeout(e.to_string()),
            std::io::ErrorKind::AlreadyExists => TransportError::AlreadyExists(e.to_string()),
            _ => TransportError::Io(e.to_string()),
        }
    }
}

/// Edit-session conflicts. Blocks the auto-upload path until resolved.
#[derive(Debug, Error)]
pub enum ConflictError {
    #[error("remote file {remote_path} changed since it was opened")]
    RemoteChangedSinceOpen { remote_path: String },
}

/// Facade-level error union.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Conflict(#[from] ConflictError),

    #[error("unknown session: {0}")]
    UnknownSession(String),

    #[error("session not connected: {0}")]
    NotConnected(String),

    #[error("unknown transfer: {0}")]
    UnknownTransfer(String),

    #[error("unknown shadow entry: {0}")]
    UnknownShadow(String),

    #[error("pending upload did not complete within {0}s")]
    FlushTimeout(u64),

    #[error("pending upload did not succeed: {0}")]
    FlushFailed(String),

    #[error("destination exists: {0}")]
    DestinationExists(String),

    #[error("history store error: {0}")]
    History(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

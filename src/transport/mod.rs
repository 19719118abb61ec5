//! Remote I/O seam. Everything above this module (scheduler, shadow store,
//! ingest) talks to a `dyn Transport`; the real implementation is SFTP over
//! russh, tests substitute mocks.

pub mod bulk;
pub mod client;
pub mod known_hosts;
pub mod sftp;

pub use client::{connect_session, ConnectedTransport};
pub use known_hosts::{HostKeyVerification, KnownHostsStore};
pub use sftp::SftpTransport;

use crate::error::TransportError;
use crate::types::{ProgressUpdate, RemoteEntry};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

use crate::credentials::AuthRef;

/// Everything needed to establish a session. Persist-safe: authentication is
/// an opaque [`AuthRef`], never a secret.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionParams {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: String,
    pub auth: AuthRef,
}

fn default_port() -> u16 {
    22
}

impl SessionParams {
    /// Stable label for logs and known-hosts keys.
    pub fn endpoint(&self) -> String {
        if self.port == 22 {
            self.host.clone()
        } else {
            format!("[{}]:{}", self.host, self.port)
        }
    }
}

/// Cancellation and pause signalling for one transfer. Clone-cheap; every
/// worker loop checkpoint reads the watch channels.
#[derive(Clone)]
pub struct TransferControl {
    cancel_tx: Arc<watch::Sender<bool>>,
    cancel_rx: watch::Receiver<bool>,
    pause_tx: Arc<watch::Sender<bool>>,
    pause_rx: watch::Receiver<bool>,
}

impl TransferControl {
    pub fn new() -> Self {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (pause_tx, pause_rx) = watch::channel(false);
        Self {
            cancel_tx: Arc::new(cancel_tx),
            cancel_rx,
            pause_tx: Arc::new(pause_tx),
            pause_rx,
        }
    }

    pub fn cancel(&self) {
        let _ = self.cancel_tx.send(true);
    }

    pub fn pause(&self) {
        let _ = self.pause_tx.send(true);
    }

    pub fn resume(&self) {
        let _ = self.pause_tx.send(false);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel_rx.borrow()
    }

    pub fn is_paused(&self) -> bool {
        *self.pause_rx.borrow()
    }

    /// A receiver for `select!`-style waits on cancellation.
    pub fn subscribe_cancellation(&self) -> watch::Receiver<bool> {
        self.cancel_rx.clone()
    }

    /// Returns `Err(Cancelled)` if cancelled; otherwise parks while paused,
    /// still honoring cancellation.
    pub async fn checkpoint(&self) -> Result<(), TransportError> {
        loop {
            if self.is_cancelled() {
                return Err(TransportError::Cancelled);
            }
            if !self.is_paused() {
                return Ok(());
            }
            let mut cancel_rx = self.cancel_rx.clone();
            let mut pause_rx = self.pause_rx.clone();
            tokio::select! {
                _ = cancel_rx.changed() => {}
                _ = pause_rx.changed() => {}
            }
        }
    }
}

impl Default for TransferControl {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-transfer context handed down into streaming operations.
#[derive(Clone)]
pub struct TransferContext {
    pub transfer_id: String,
    pub chunk_size: usize,
    /// Deadline for one chunk read or write, not the whole transfer.
    pub io_timeout: Duration,
    pub control: TransferControl,
    pub progress: mpsc::UnboundedSender<ProgressUpdate>,
}

impl TransferContext {
    pub fn send_progress(&self, bytes_done: u64, bytes_total: u64) {
        let _ = self.progress.send(ProgressUpdate {
            transfer_id: self.transfer_id.clone(),
            bytes_done,
            bytes_total,
            speed_bps: None,
            eta_secs: None,
        });
    }
}

/// Remote filesystem operations over one session.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn stat(&self, path: &str) -> Result<RemoteEntry, TransportError>;

    /// Entries sorted directories-first, then by name.
    async fn list_dir(&self, path: &str) -> Result<Vec<RemoteEntry>, TransportError>;

    async fn mkdir(&self, path: &str) -> Result<(), TransportError>;

    async fn rename(&self, from: &str, to: &str) -> Result<(), TransportError>;

    async fn remove_file(&self, path: &str) -> Result<(), TransportError>;

    /// Fails on non-empty directories; see [`delete_recursive`].
    async fn remove_dir(&self, path: &str) -> Result<(), TransportError>;

    async fn canonicalize(&self, path: &str) -> Result<String, TransportError>;

    /// Stream a remote file to a local path, creating or truncating it.
    async fn download(
        &self,
        remote: &str,
        local: &Path,
        ctx: &TransferContext,
    ) -> Result<u64, TransportError>;

    /// Stream a local file to a remote path, creating or truncating it.
    async fn upload(
        &self,
        local: &Path,
        remote: &str,
        ctx: &TransferContext,
    ) -> Result<u64, TransportError>;
}

/// Create every missing component of `path` in order. `AlreadyExists` from a
/// concurrent creator is fine.
pub async fn mkdir_all(transport: &dyn Transport, path: &str) -> Result<(), TransportError> {
    let normalized = crate::path::normalize_remote(path);
    let mut current = String::new();
    for seg in normalized.split('/').filter(|s| !s.is_empty()) {
        current = crate::path::join_remote(&current, seg);
        match transport.mkdir(&current).await {
            Ok(()) | Err(TransportError::AlreadyExists(_)) => {}
            // Some servers report mkdir-over-existing as a generic failure;
            // accept it if the path stats as a directory.
            Err(e) => match transport.stat(&current).await {
                Ok(entry) if entry.is_dir() => {}
                _ => return Err(e),
            },
        }
    }
    Ok(())
}

/// Depth-first removal of a file or directory tree.
pub async fn delete_recursive(
    transport: &dyn Transport,
    path: &str,
) -> Result<(), TransportError> {
    let entry = transport.stat(path).await?;
    if !entry.is_dir() {
        return transport.remove_file(path).await;
    }
    // Iterative DFS; recursion over async fns would need boxing at each level.
    let mut stack = vec![path.to_string()];
    let mut dirs_postorder = Vec::new();
    while let Some(dir) = stack.pop() {
        for child in transport.list_dir(&dir).await? {
            if child.is_dir() {
                stack.push(child.path);
            } else {
                transport.remove_file(&child.path).await?;
            }
        }
        dirs_postorder.push(dir);
    }
    for dir in dirs_postorder.into_iter().rev() {
        transport.remove_dir(&dir).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_control_cancel() {
        let control = TransferControl::new();
        assert!(!control.is_cancelled());
        control.cancel();
        assert!(control.is_cancelled());
        assert!(matches!(
            control.checkpoint().await,
            Err(TransportError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn test_checkpoint_waits_while_paused() {
        let control = TransferControl::new();
        control.pause();
        let c2 = control.clone();
        let handle = tokio::spawn(async move { c2.checkpoint().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_finished());
        control.resume();
        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_cancel_unblocks_paused_checkpoint() {
        let control = TransferControl::new();
        control.pause();
        let c2 = control.clone();
        let handle = tokio::spawn(async move { c2.checkpoint().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        control.cancel();
        assert!(matches!(
            handle.await.unwrap(),
            Err(TransportError::Cancelled)
        ));
    }
}

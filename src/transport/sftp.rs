//! SFTP-backed [`Transport`]. One instance per session. Metadata operations
//! share a small op semaphore; streaming transfers are not counted against it
//! (the scheduler already bounds concurrent transfers per session), so a
//! directory refresh stays responsive while transfers run.

use crate::error::TransportError;
use crate::transport::client::ConnectedTransport;
use crate::transport::{Transport, TransferContext};
use crate::types::{EntryKind, RemoteEntry};
use async_trait::async_trait;
use russh_sftp::client::SftpSession as RusshSftpSession;
use russh_sftp::protocol::OpenFlags;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

pub struct SftpTransport {
    sftp: RusshSftpSession,
    ops: Arc<Semaphore>,
}

impl SftpTransport {
    /// Open the SFTP subsystem on an authenticated session. Returns the
    /// transport and the server-side home directory.
    pub async fn open(
        connected: &ConnectedTransport,
        ops_in_flight: usize,
    ) -> Result<(Self, String), TransportError> {
        let channel = connected
            .handle
            .channel_open_session()
            .await
            .map_err(|e| TransportError::Protocol(e.to_string()))?;
        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(|e| TransportError::Protocol(format!("SFTP subsystem: {e}")))?;
        let sftp = RusshSftpSession::new(channel.into_stream())
            .await
            .map_err(|e| TransportError::Protocol(e.to_string()))?;
        let home = sftp
            .canonicalize(".")
            .await
            .map_err(|e| TransportError::Protocol(e.to_string()))?;
        debug!(%home, "SFTP subsystem opened");
        Ok((
            Self {
                sftp,
                ops: Arc::new(Semaphore::new(ops_in_flight.max(1))),
            },
            home,
        ))
    }

    async fn permit(&self) -> Result<tokio::sync::SemaphorePermit<'_>, TransportError> {
        self.ops
            .acquire()
            .await
            .map_err(|_| TransportError::Disconnected)
    }

    fn map_error(e: russh_sftp::client::error::Error, path: &str) -> TransportError {
        let msg = e.to_string();
        let lower = msg.to_lowercase();
        if lower.contains("no such file") || lower.contains("not found") {
            TransportError::NotFound(path.to_string())
        } else if lower.contains("permission denied") {
            TransportError::PermissionDenied(path.to_string())
        } else if lower.contains("already exists") || lower.contains("file exists") {
            TransportError::AlreadyExists(path.to_string())
        } else {
            TransportError::Protocol(msg)
        }
    }

    fn entry_from_attrs(
        name: String,
        path: String,
        attrs: &russh_sftp::protocol::FileAttributes,
        link_target: Option<String>,
    ) -> RemoteEntry {
        let kind = if attrs.is_dir() {
            EntryKind::Directory
        } else if attrs.is_symlink() {
            EntryKind::Symlink
        } else if attrs.is_regular() {
            EntryKind::File
        } else {
            EntryKind::Other
        };
        RemoteEntry {
            name,
            path,
            kind,
            size: attrs.size.unwrap_or(0),
            modified: attrs.mtime.map(|t| t as i64),
            permissions: attrs.permissions.map(|p| p & 0o7777),
            link_target,
        }
    }
}

#[async_trait]
impl Transport for SftpTransport {
    async fn stat(&self, path: &str) -> Result<RemoteEntry, TransportError> {
        let _permit = self.permit().await?;
        let attrs = self
            .sftp
            .metadata(path)
            .await
            .map_err(|e| Self::map_error(e, path))?;
        let link_target = if attrs.is_symlink() {
            self.sftp.read_link(path).await.ok()
        } else {
            None
        };
        let name = crate::path::file_name(path).to_string();
        Ok(Self::entry_from_attrs(
            name,
            path.to_string(),
            &attrs,
            link_target,
        ))
    }

    async fn list_dir(&self, path: &str) -> Result<Vec<RemoteEntry>, TransportError> {
        let _permit = self.permit().await?;
        let read_dir = self
            .sftp
            .read_dir(path)
            .await
            .map_err(|e| Self::map_error(e, path))?;

        let mut entries = Vec::new();
        for entry in read_dir {
            let name = entry.file_name();
            if name == "." || name == ".." {
                continue;
            }
            let full_path = crate::path::join_remote(path, &name);
            let attrs = entry.metadata();
            let link_target = if attrs.is_symlink() {
                self.sftp.read_link(&full_path).await.ok()
            } else {
                None
            };
            entries.push(Self::entry_from_attrs(name, full_path, &attrs, link_target));
        }

        entries.sort_by(|a, b| {
            b.is_dir()
                .cmp(&a.is_dir())
                .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
        });
        debug!(count = entries.len(), %path, "listed directory");
        Ok(entries)
    }

    async fn mkdir(&self, path: &str) -> Result<(), TransportError> {
        let _permit = self.permit().await?;
        self.sftp
            .create_dir(path)
            .await
            .map_err(|e| Self::map_error(e, path))
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), TransportError> {
        let _permit = self.permit().await?;
        self.sftp
            .rename(from, to)
            .await
            .map_err(|e| Self::map_error(e, from))
    }

    async fn remove_file(&self, path: &str) -> Result<(), TransportError> {
        let _permit = self.permit().await?;
        self.sftp
            .remove_file(path)
            .await
            .map_err(|e| Self::map_error(e, path))
    }

    async fn remove_dir(&self, path: &str) -> Result<(), TransportError> {
        let _permit = self.permit().await?;
        self.sftp
            .remove_dir(path)
            .await
            .map_err(|e| Self::map_error(e, path))
    }

    async fn canonicalize(&self, path: &str) -> Result<String, TransportError> {
        let _permit = self.permit().await?;
        self.sftp
            .canonicalize(path)
            .await
            .map_err(|e| Self::map_error(e, path))
    }

    async fn download(
        &self,
        remote: &str,
        local: &Path,
        ctx: &TransferContext,
    ) -> Result<u64, TransportError> {
        let total = self
            .sftp
            .metadata(remote)
            .await
            .map_err(|e| Self::map_error(e, remote))?
            .size
            .unwrap_or(0);

        let mut remote_file = self
            .sftp
            .open_with_flags(remote, OpenFlags::READ)
            .await
            .map_err(|e| Self::map_error(e, remote))?;

        if let Some(parent) = local.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut local_file = tokio::fs::File::create(local).await?;

        let mut buffer = vec![0u8; ctx.chunk_size];
        let mut transferred = 0u64;
        loop {
            ctx.control.checkpoint().await?;

            let bytes_read = match tokio::time::timeout(
                ctx.io_timeout,
                remote_file.read(&mut buffer),
            )
            .await
            {
                Ok(Ok(n)) => n,
                Ok(Err(e)) => return Err(TransportError::Io(e.to_string())),
                Err(_) => {
                    warn!(%remote, transferred, "download read timed out");
                    return Err(TransportError::Timeout(format!("reading {remote}")));
                }
            };
            if bytes_read == 0 {
                break;
            }

            tokio::time::timeout(ctx.io_timeout, local_file.write_all(&buffer[..bytes_read]))
                .await
                .map_err(|_| TransportError::Timeout("writing local file".into()))?
                .map_err(|e| TransportError::Io(e.to_string()))?;

            transferred += bytes_read as u64;
            ctx.send_progress(transferred, total.max(transferred));
        }

        local_file
            .flush()
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;
        Ok(transferred)
    }

    async fn upload(
        &self,
        local: &Path,
        remote: &str,
        ctx: &TransferContext,
    ) -> Result<u64, TransportError> {
        let total = tokio::fs::metadata(local).await?.len();
        let mut local_file = tokio::fs::File::open(local).await?;

        let mut remote_file = self
            .sftp
            .open_with_flags(
                remote,
                OpenFlags::CREATE | OpenFlags::TRUNCATE | OpenFlags::WRITE,
            )
            .await
            .map_err(|e| Self::map_error(e, remote))?;

        let mut buffer = vec![0u8; ctx.chunk_size];
        let mut transferred = 0u64;
        loop {
            ctx.control.checkpoint().await?;

            let bytes_read = local_file
                .read(&mut buffer)
                .await
                .map_err(|e| TransportError::Io(e.to_string()))?;
            if bytes_read == 0 {
                break;
            }

            match tokio::time::timeout(
                ctx.io_timeout,
                AsyncWriteExt::write_all(&mut remote_file, &buffer[..bytes_read]),
            )
            .await
            {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(TransportError::Io(e.to_string())),
                Err(_) => {
                    warn!(%remote, transferred, "upload write timed out");
                    return Err(TransportError::Timeout(format!("writing {remote}")));
                }
            }

            transferred += bytes_read as u64;
            ctx.send_progress(transferred, total.max(transferred));
        }

        tokio::time::timeout(ctx.io_timeout, remote_file.flush())
            .await
            .map_err(|_| TransportError::Timeout(format!("flushing {remote}")))?
            .map_err(|e| TransportError::Io(e.to_string()))?;
        Ok(transferred)
    }
}

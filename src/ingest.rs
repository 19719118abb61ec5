//! Drop ingestion: local paths dropped onto a remote directory become
//! transfers, and remote entries pulled to a local directory likewise.
//! Directories either go through the rsync bulk path or fan out into one
//! child transfer per file under an aggregating parent record.

use crate::config::{BridgeConfig, CollisionPolicy};
use crate::error::{BridgeError, TransportError};
use crate::events::{BridgeEvent, EventBus};
use crate::queue::TransferQueue;
use crate::session::{Session, SessionRegistry};
use crate::transport::{self, Transport};
use crate::types::{TransferDirection, TransferRecord};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};
use walkdir::WalkDir;

pub struct Ingestor {
    config: BridgeConfig,
    registry: Arc<SessionRegistry>,
    queue: Arc<TransferQueue>,
    events: EventBus,
}

impl Ingestor {
    pub fn new(
        config: BridgeConfig,
        registry: Arc<SessionRegistry>,
        queue: Arc<TransferQueue>,
        events: EventBus,
    ) -> Self {
        Self {
            config,
            registry,
            queue,
            events,
        }
    }

    /// Ingest dropped local paths into a remote directory. Returns the ids
    /// of the top-level records created (files and directory parents).
    pub async fn ingest_local(
        &self,
        session_id: &str,
        paths: &[PathBuf],
        remote_dir: &str,
        policy: Option<CollisionPolicy>,
    ) -> Result<Vec<String>, BridgeError> {
        let session = self.registry.get(session_id)?;
        let remote_dir = session.resolve(remote_dir);
        let policy = policy.unwrap_or(self.config.collision_policy);
        let mut ids = Vec::new();

        for path in paths {
            let meta = std::fs::metadata(path).map_err(|e| {
                BridgeError::Transport(TransportError::from(e))
            })?;
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .ok_or_else(|| {
                    BridgeError::InvalidArgument(format!("no file name in {}", path.display()))
                })?;

            if meta.is_dir() {
                let target = crate::path::join_remote(&remote_dir, &name);
                ids.push(self.ingest_local_dir(&session, path, &target).await?);
            } else {
                let transport = session.transport()?;
                let target = crate::path::join_remote(&remote_dir, &name);
                let Some(target) = self
                    .settle_remote_collision(&session, transport.as_ref(), path, &target, policy)
                    .await?
                else {
                    continue;
                };
                ids.push(
                    self.queue
                        .enqueue_upload(session_id, path.clone(), target)
                        .await?,
                );
            }
        }
        Ok(ids)
    }

    /// One dropped directory. rsync when the session supports it, otherwise
    /// a fan-out with an aggregating parent.
    ///
    /// The collision policy applies to the top-level drop only: a dropped
    /// directory merges into the destination, and files inside it overwrite
    /// same-named remote files.
    async fn ingest_local_dir(
        &self,
        session: &Arc<Session>,
        local_dir: &Path,
        remote_dir: &str,
    ) -> Result<String, BridgeError> {
        if self.config.bulk_transfers && session.bulk_available().await {
            info!(local = %local_dir.display(), remote = %remote_dir, "directory via rsync");
            let mut record = TransferRecord::new(
                &session.id,
                TransferDirection::Upload,
                local_dir.to_string_lossy(),
                remote_dir,
            );
            record.bytes_total = dir_size(local_dir);
            return self.queue.enqueue_bulk(session.clone(), record).await;
        }

        let mut files = Vec::new();
        let mut empty_dirs = Vec::new();
        let mut total = 0u64;
        for entry in WalkDir::new(local_dir).follow_links(false) {
            let entry = entry.map_err(|e| {
                BridgeError::Transport(TransportError::Io(e.to_string()))
            })?;
            let rel = entry
                .path()
                .strip_prefix(local_dir)
                .map_err(|e| BridgeError::InvalidArgument(e.to_string()))?;
            if rel.as_os_str().is_empty() {
                continue;
            }
            let rel_remote = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            if entry.file_type().is_dir() {
                if std::fs::read_dir(entry.path())
                    .map(|mut d| d.next().is_none())
                    .unwrap_or(false)
                {
                    empty_dirs.push(crate::path::join_remote(remote_dir, &rel_remote));
                }
            } else if entry.file_type().is_file() {
                let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
                total += size;
                files.push((
                    entry.path().to_path_buf(),
                    crate::path::join_remote(remote_dir, &rel_remote),
                    size,
                ));
            }
        }

        let mut parent = TransferRecord::new(
            &session.id,
            TransferDirection::Upload,
            local_dir.to_string_lossy(),
            remote_dir,
        );
        parent.is_directory = true;
        parent.bytes_total = total;
        parent.mark_running();
        // No files means no children to aggregate from; settle now.
        if files.is_empty() {
            parent.mark_succeeded();
        }
        let parent_id = self.queue.enqueue_parent(parent).await?;

        // File transfers create their own parents; empty directories must be
        // created explicitly or they would be silently dropped.
        let transport = session.transport()?;
        transport::mkdir_all(transport.as_ref(), remote_dir).await?;
        for dir in empty_dirs {
            transport::mkdir_all(transport.as_ref(), &dir).await?;
        }

        debug!(parent = %parent_id, count = files.len(), "directory fan-out queued");
        for (local, remote, size) in files {
            let mut child = TransferRecord::new(
                &session.id,
                TransferDirection::Upload,
                local.to_string_lossy(),
                remote,
            );
            child.bytes_total = size;
            self.queue
                .enqueue_child(session.clone(), child, &parent_id)
                .await?;
        }
        Ok(parent_id)
    }

    /// Pull remote entries into a local directory.
    pub async fn ingest_remote(
        &self,
        session_id: &str,
        remote_paths: &[String],
        local_dir: &Path,
        policy: Option<CollisionPolicy>,
    ) -> Result<Vec<String>, BridgeError> {
        let session = self.registry.get(session_id)?;
        let transport = session.transport()?;
        let policy = policy.unwrap_or(self.config.collision_policy);
        let mut ids = Vec::new();

        // Preflight: stat the batch up front and refuse it outright when the
        // destination filesystem is known to be too small for the plain
        // files. Directory totals are checked after expansion.
        let mut batch = Vec::new();
        let mut file_total = 0u64;
        for remote_path in remote_paths {
            let remote_path = session.resolve(remote_path);
            let entry = transport.stat(&remote_path).await.map_err(BridgeError::from)?;
            if !entry.is_dir() {
                file_total += entry.size;
            }
            batch.push((remote_path, entry));
        }
        ensure_local_capacity(local_dir, file_total).await?;

        for (remote_path, entry) in batch {
            if entry.is_dir() {
                ids.push(
                    self.ingest_remote_dir(&session, &remote_path, local_dir)
                        .await?,
                );
            } else {
                let Some(local) =
                    self.settle_local_collision(&session, &remote_path, local_dir, &entry.name, policy)?
                else {
                    continue;
                };
                ids.push(
                    self.queue
                        .enqueue_download(session_id, remote_path, local, entry.size)
                        .await?,
                );
            }
        }
        Ok(ids)
    }

    /// Mirrors `ingest_local_dir`: the pulled directory merges into the
    /// local destination, overwriting same-named files.
    async fn ingest_remote_dir(
        &self,
        session: &Arc<Session>,
        remote_dir: &str,
        local_parent: &Path,
    ) -> Result<String, BridgeError> {
        let name = crate::path::file_name(remote_dir).to_string();
        let local_dir = local_parent.join(&name);

        if self.config.bulk_transfers && session.bulk_available().await {
            info!(remote = %remote_dir, local = %local_dir.display(), "directory via rsync");
            let record = TransferRecord::new(
                &session.id,
                TransferDirection::Download,
                remote_dir,
                local_dir.to_string_lossy(),
            );
            return self.queue.enqueue_bulk(session.clone(), record).await;
        }

        let transport = session.transport()?;
        // Depth-first expansion of the remote tree.
        let mut files = Vec::new();
        let mut total = 0u64;
        let mut stack = vec![remote_dir.to_string()];
        while let Some(dir) = stack.pop() {
            for child in transport.list_dir(&dir).await.map_err(BridgeError::from)? {
                if child.is_dir() {
                    stack.push(child.path);
                } else {
                    total += child.size;
                    files.push((child.path, child.size));
                }
            }
        }

        ensure_local_capacity(local_parent, total).await?;
        let mut parent = TransferRecord::new(
            &session.id,
            TransferDirection::Download,
            remote_dir,
            local_dir.to_string_lossy(),
        );
        parent.is_directory = true;
        parent.bytes_total = total;
        parent.mark_running();
        if files.is_empty() {
            parent.mark_succeeded();
        }
        let parent_id = self.queue.enqueue_parent(parent).await?;
        tokio::fs::create_dir_all(&local_dir)
            .await
            .map_err(|e| BridgeError::Transport(TransportError::from(e)))?;

        let prefix = format!("{}/", remote_dir.trim_end_matches('/'));
        for (remote_file, size) in files {
            let rel = remote_file
                .strip_prefix(&prefix)
                .unwrap_or(crate::path::file_name(&remote_file));
            let local = local_dir.join(rel);
            let mut child = TransferRecord::new(
                &session.id,
                TransferDirection::Download,
                remote_file.clone(),
                local.to_string_lossy(),
            );
            child.bytes_total = size;
            self.queue
                .enqueue_child(session.clone(), child, &parent_id)
                .await?;
        }
        Ok(parent_id)
    }

    /// Returns the remote target to use, or `None` when the file should be
    /// skipped (policy `Skip`, or `Ask` after emitting the prompt event).
    async fn settle_remote_collision(
        &self,
        session: &Arc<Session>,
        transport: &dyn Transport,
        local: &Path,
        target: &str,
        policy: CollisionPolicy,
    ) -> Result<Option<String>, BridgeError> {
        let exists = transport.stat(target).await.is_ok();
        if !exists {
            return Ok(Some(target.to_string()));
        }
        match policy {
            CollisionPolicy::Overwrite => Ok(Some(target.to_string())),
            CollisionPolicy::Skip => {
                debug!(%target, "collision, skipping");
                Ok(None)
            }
            CollisionPolicy::AutoRename => {
                let parent = crate::path::parent_remote(target);
                let name = crate::path::file_name(target);
                for counter in 1..1000u32 {
                    let candidate = crate::path::join_remote(
                        &parent,
                        &crate::path::renamed_with_counter(name, counter),
                    );
                    match transport.stat(&candidate).await {
                        Err(TransportError::NotFound(_)) => return Ok(Some(candidate)),
                        Ok(_) => continue,
                        Err(e) => return Err(e.into()),
                    }
                }
                Err(BridgeError::DestinationExists(target.to_string()))
            }
            CollisionPolicy::Ask => {
                self.events.emit(BridgeEvent::CollisionPrompt {
                    session_id: session.id.clone(),
                    local_path: local.to_string_lossy().into_owned(),
                    remote_path: target.to_string(),
                });
                Ok(None)
            }
        }
    }

    fn settle_local_collision(
        &self,
        session: &Arc<Session>,
        remote: &str,
        local_dir: &Path,
        name: &str,
        policy: CollisionPolicy,
    ) -> Result<Option<PathBuf>, BridgeError> {
        let target = local_dir.join(name);
        if !target.exists() {
            return Ok(Some(target));
        }
        match policy {
            CollisionPolicy::Overwrite => Ok(Some(target)),
            CollisionPolicy::Skip => Ok(None),
            CollisionPolicy::AutoRename => {
                for counter in 1..1000u32 {
                    let candidate =
                        local_dir.join(crate::path::renamed_with_counter(name, counter));
                    if !candidate.exists() {
                        return Ok(Some(candidate));
                    }
                }
                Err(BridgeError::DestinationExists(
                    target.to_string_lossy().into_owned(),
                ))
            }
            CollisionPolicy::Ask => {
                self.events.emit(BridgeEvent::CollisionPrompt {
                    session_id: session.id.clone(),
                    local_path: target.to_string_lossy().into_owned(),
                    remote_path: remote.to_string(),
                });
                Ok(None)
            }
        }
    }
}

/// Refuse a batch when the destination filesystem is known to lack space
/// for it. The probe is best effort; when it fails the batch proceeds and a
/// genuine shortfall surfaces as an IO error mid-write.
async fn ensure_local_capacity(dir: &Path, needed: u64) -> Result<(), BridgeError> {
    let Some(available) = local_free_space(dir).await else {
        return Ok(());
    };
    if available < needed {
        return Err(BridgeError::Transport(TransportError::Io(format!(
            "{needed} bytes needed but only {available} free under {}",
            dir.display()
        ))));
    }
    Ok(())
}

async fn local_free_space(dir: &Path) -> Option<u64> {
    let out = tokio::process::Command::new("df")
        .arg("-Pk")
        .arg(dir)
        .output()
        .await
        .ok()?;
    if !out.status.success() {
        return None;
    }
    parse_df_available(&String::from_utf8_lossy(&out.stdout))
}

/// Available bytes from POSIX `df -Pk` output (KiB in the fourth column).
fn parse_df_available(output: &str) -> Option<u64> {
    let avail_kib: u64 = output.lines().nth(1)?.split_whitespace().nth(3)?.parse().ok()?;
    Some(avail_kib * 1024)
}

fn dir_size(dir: &Path) -> u64 {
    WalkDir::new(dir)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}

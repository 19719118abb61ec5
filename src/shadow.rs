//! Shadow files: a remote file opened for editing becomes a local temp copy
//! whose saves flow back through the transfer queue. Each (session, remote
//! path) pair has at most one shadow entry; reopening returns the existing
//! one so an editor is never pointed at two copies of the same file.

use crate::config::BridgeConfig;
use crate::error::{BridgeError, ConflictError, TransportError};
use crate::events::{BridgeEvent, EventBus};
use crate::queue::TransferQueue;
use crate::session::SessionRegistry;
use crate::transport::{TransferContext, TransferControl};
use crate::types::{Fingerprint, TransferState};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShadowStatus {
    /// In sync with the remote.
    Clean,
    /// Open in an editor, no unsaved flush pending.
    Editing,
    /// A save was observed and an upload is queued.
    UploadPending,
    Uploading,
    /// The remote changed since open; auto-upload is blocked until resolved.
    Conflict,
    /// The session is gone; the local copy remains but cannot flush.
    Orphaned,
}

#[derive(Debug, Clone)]
pub struct ShadowEntry {
    pub session_id: String,
    pub remote_path: String,
    pub local_path: PathBuf,
    pub status: ShadowStatus,
    /// Remote fingerprint at download or last successful upload. The
    /// conflict check compares the live remote against this.
    pub remote_fingerprint: Fingerprint,
    /// Local fingerprint at the last observed save; filters duplicate and
    /// spurious watcher events.
    pub local_fingerprint: Option<Fingerprint>,
    pub opened_at: chrono::DateTime<chrono::Utc>,
    /// In-flight or last upload for this entry.
    pub transfer_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictResolution {
    /// Push the local copy, clobbering the newer remote.
    OverwriteRemote,
    /// Throw the local edits away and re-download.
    DiscardAndReload,
    /// Upload under a renamed path next to the original.
    SaveAsNew,
}

type EntryKey = (String, String);

pub struct ShadowStore {
    config: BridgeConfig,
    registry: Arc<SessionRegistry>,
    queue: Arc<TransferQueue>,
    events: EventBus,
    root: PathBuf,
    entries: RwLock<HashMap<EntryKey, ShadowEntry>>,
    by_local: RwLock<HashMap<PathBuf, EntryKey>>,
}

impl ShadowStore {
    pub fn new(
        config: BridgeConfig,
        registry: Arc<SessionRegistry>,
        queue: Arc<TransferQueue>,
        events: EventBus,
    ) -> Arc<Self> {
        let root = config
            .shadow_root
            .clone()
            .or_else(|| dirs::data_dir().map(|d| d.join("filebridge").join("shadow")))
            .unwrap_or_else(|| std::env::temp_dir().join("filebridge-shadow"));
        let store = Arc::new(Self {
            config,
            registry,
            queue,
            events: events.clone(),
            root,
            entries: RwLock::new(HashMap::new()),
            by_local: RwLock::new(HashMap::new()),
        });
        tokio::spawn(Self::track_uploads(store.clone(), events.subscribe()));
        store
    }

    pub fn shadow_root(&self) -> &Path {
        &self.root
    }

    pub fn entry(&self, session_id: &str, remote_path: &str) -> Option<ShadowEntry> {
        self.entries
            .read()
            .get(&(session_id.to_string(), remote_path.to_string()))
            .cloned()
    }

    pub fn entries(&self) -> Vec<ShadowEntry> {
        self.entries.read().values().cloned().collect()
    }

    pub fn entry_for_local(&self, local_path: &Path) -> Option<ShadowEntry> {
        let key = self.by_local.read().get(local_path).cloned()?;
        self.entries.read().get(&key).cloned()
    }

    fn set_status(&self, key: &EntryKey, status: ShadowStatus) {
        let mut entries = self.entries.write();
        if let Some(entry) = entries.get_mut(key) {
            if entry.status != status {
                entry.status = status;
                self.events.emit(BridgeEvent::ShadowStatusChanged {
                    session_id: key.0.clone(),
                    remote_path: key.1.clone(),
                    status,
                });
            }
        }
    }

    fn inline_ctx(&self, label: &str) -> (TransferContext, mpsc::UnboundedReceiver<crate::types::ProgressUpdate>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            TransferContext {
                transfer_id: label.to_string(),
                chunk_size: self.config.chunk_size,
                io_timeout: Duration::from_secs(self.config.io_timeout_secs),
                control: TransferControl::new(),
                progress: tx,
            },
            rx,
        )
    }

    /// Open a remote file for local editing. Returns the existing entry if
    /// the file is already open on this session.
    pub async fn open_for_edit(
        &self,
        session_id: &str,
        remote_path: &str,
    ) -> Result<ShadowEntry, BridgeError> {
        let session = self.registry.get(session_id)?;
        let remote_path = session.resolve(remote_path);
        let key = (session_id.to_string(), remote_path.clone());

        if let Some(existing) = self.entries.read().get(&key) {
            debug!(remote = %remote_path, "already open, reusing shadow entry");
            return Ok(existing.clone());
        }

        let transport = session.transport()?;
        let remote_entry = transport.stat(&remote_path).await.map_err(BridgeError::from)?;
        if remote_entry.is_dir() {
            return Err(BridgeError::InvalidArgument(format!(
                "{remote_path} is a directory"
            )));
        }

        let dir = self.root.join(uuid::Uuid::new_v4().to_string());
        tokio::fs::create_dir_all(&dir).await.map_err(|e| {
            BridgeError::Transport(TransportError::Io(format!("shadow dir: {e}")))
        })?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o700));
        }
        let local_path = dir.join(crate::path::file_name(&remote_path));

        let (ctx, _progress) = self.inline_ctx("shadow-open");
        transport
            .download(&remote_path, &local_path, &ctx)
            .await
            .map_err(BridgeError::from)?;

        let local_fingerprint = std::fs::metadata(&local_path)
            .ok()
            .map(|m| Fingerprint::of_metadata(&m));
        let entry = ShadowEntry {
            session_id: session_id.to_string(),
            remote_path: remote_path.clone(),
            local_path: local_path.clone(),
            status: ShadowStatus::Editing,
            remote_fingerprint: Fingerprint::of_entry(&remote_entry),
            local_fingerprint,
            opened_at: chrono::Utc::now(),
            transfer_id: None,
        };
        self.entries.write().insert(key.clone(), entry.clone());
        self.by_local.write().insert(local_path, key);
        info!(remote = %remote_path, local = %entry.local_path.display(), "opened for edit");
        self.events.emit(BridgeEvent::ShadowStatusChanged {
            session_id: entry.session_id.clone(),
            remote_path: entry.remote_path.clone(),
            status: ShadowStatus::Editing,
        });
        Ok(entry)
    }

    /// Entry point for the debounced watcher: a shadow file was written.
    /// Returns the queued transfer id, or `None` when the event was spurious
    /// or the entry is blocked on a conflict.
    pub async fn notify_local_change(
        &self,
        local_path: &Path,
    ) -> Result<Option<String>, BridgeError> {
        let Some(entry) = self.entry_for_local(local_path) else {
            return Ok(None);
        };
        let key = (entry.session_id.clone(), entry.remote_path.clone());

        let meta = match std::fs::metadata(local_path) {
            Ok(m) => m,
            // Deleted out from under us; nothing to upload.
            Err(_) => return Ok(None),
        };
        let fingerprint = Fingerprint::of_metadata(&meta);
        if entry.local_fingerprint == Some(fingerprint) {
            debug!(local = %local_path.display(), "unchanged content, ignoring watcher event");
            return Ok(None);
        }

        match entry.status {
            ShadowStatus::Conflict => {
                // Still blocked; remind the listeners.
                self.events.emit(BridgeEvent::ConflictDetected {
                    session_id: entry.session_id.clone(),
                    remote_path: entry.remote_path.clone(),
                });
                return Ok(None);
            }
            ShadowStatus::Orphaned => return Ok(None),
            _ => {}
        }

        if self.config.conflict_check_on_save {
            if let Err(conflict) = self.check_remote_unchanged(&entry).await {
                warn!(remote = %entry.remote_path, "remote changed since open, blocking upload");
                self.set_status(&key, ShadowStatus::Conflict);
                self.events.emit(BridgeEvent::ConflictDetected {
                    session_id: entry.session_id.clone(),
                    remote_path: entry.remote_path.clone(),
                });
                return Err(conflict.into());
            }
        }

        let transfer_id = self
            .queue
            .enqueue_upload(
                &entry.session_id,
                entry.local_path.clone(),
                entry.remote_path.clone(),
            )
            .await?;
        {
            let mut entries = self.entries.write();
            if let Some(e) = entries.get_mut(&key) {
                e.local_fingerprint = Some(fingerprint);
                e.transfer_id = Some(transfer_id.clone());
            }
        }
        self.set_status(&key, ShadowStatus::UploadPending);
        Ok(Some(transfer_id))
    }

    async fn check_remote_unchanged(&self, entry: &ShadowEntry) -> Result<(), ConflictError> {
        let Ok(session) = self.registry.get(&entry.session_id) else {
            return Ok(());
        };
        let Ok(transport) = session.transport() else {
            // Can't check while disconnected; the queued upload will wait
            // and the check reruns on the next save.
            return Ok(());
        };
        match transport.stat(&entry.remote_path).await {
            Ok(remote) => {
                if Fingerprint::of_entry(&remote) != entry.remote_fingerprint {
                    Err(ConflictError::RemoteChangedSinceOpen {
                        remote_path: entry.remote_path.clone(),
                    })
                } else {
                    Ok(())
                }
            }
            // Remote deleted: uploading recreates it, which is what the
            // editor user expects from "save".
            Err(TransportError::NotFound(_)) => Ok(()),
            Err(_) => Ok(()),
        }
    }

    pub async fn resolve_conflict(
        &self,
        session_id: &str,
        remote_path: &str,
        resolution: ConflictResolution,
    ) -> Result<ShadowEntry, BridgeError> {
        let key = (session_id.to_string(), remote_path.to_string());
        let entry = self
            .entry(session_id, remote_path)
            .ok_or_else(|| BridgeError::UnknownShadow(remote_path.to_string()))?;
        let session = self.registry.get(session_id)?;
        let transport = session.transport()?;

        match resolution {
            ConflictResolution::OverwriteRemote => {
                let transfer_id = self
                    .queue
                    .enqueue_upload(session_id, entry.local_path.clone(), entry.remote_path.clone())
                    .await?;
                let mut entries = self.entries.write();
                if let Some(e) = entries.get_mut(&key) {
                    e.transfer_id = Some(transfer_id);
                    e.status = ShadowStatus::UploadPending;
                }
                drop(entries);
                self.events.emit(BridgeEvent::ShadowStatusChanged {
                    session_id: key.0.clone(),
                    remote_path: key.1.clone(),
                    status: ShadowStatus::UploadPending,
                });
            }
            ConflictResolution::DiscardAndReload => {
                let (ctx, _progress) = self.inline_ctx("shadow-reload");
                transport
                    .download(&entry.remote_path, &entry.local_path, &ctx)
                    .await
                    .map_err(BridgeError::from)?;
                let remote = transport
                    .stat(&entry.remote_path)
                    .await
                    .map_err(BridgeError::from)?;
                let local_fingerprint = std::fs::metadata(&entry.local_path)
                    .ok()
                    .map(|m| Fingerprint::of_metadata(&m));
                let mut entries = self.entries.write();
                if let Some(e) = entries.get_mut(&key) {
                    e.remote_fingerprint = Fingerprint::of_entry(&remote);
                    e.local_fingerprint = local_fingerprint;
                    e.status = ShadowStatus::Editing;
                }
                drop(entries);
                self.events.emit(BridgeEvent::ShadowStatusChanged {
                    session_id: key.0.clone(),
                    remote_path: key.1.clone(),
                    status: ShadowStatus::Editing,
                });
            }
            ConflictResolution::SaveAsNew => {
                let new_remote = self.next_free_name(&*transport, &entry.remote_path).await?;
                let transfer_id = self
                    .queue
                    .enqueue_upload(session_id, entry.local_path.clone(), new_remote.clone())
                    .await?;
                // The entry now shadows the renamed file; the original stays
                // untouched on the remote.
                let mut entries = self.entries.write();
                if let Some(mut e) = entries.remove(&key) {
                    e.remote_path = new_remote.clone();
                    e.transfer_id = Some(transfer_id);
                    e.status = ShadowStatus::UploadPending;
                    let new_key = (session_id.to_string(), new_remote.clone());
                    self.by_local
                        .write()
                        .insert(e.local_path.clone(), new_key.clone());
                    entries.insert(new_key, e);
                }
                drop(entries);
                self.events.emit(BridgeEvent::ShadowStatusChanged {
                    session_id: session_id.to_string(),
                    remote_path: new_remote,
                    status: ShadowStatus::UploadPending,
                });
            }
        }

        let updated = self
            .entries
            .read()
            .values()
            .find(|e| e.session_id == session_id && e.local_path == entry.local_path)
            .cloned()
            .ok_or_else(|| BridgeError::UnknownShadow(remote_path.to_string()))?;
        Ok(updated)
    }

    async fn next_free_name(
        &self,
        transport: &dyn crate::transport::Transport,
        remote_path: &str,
    ) -> Result<String, BridgeError> {
        let parent = crate::path::parent_remote(remote_path);
        let name = crate::path::file_name(remote_path);
        for counter in 1..1000u32 {
            let candidate =
                crate::path::join_remote(&parent, &crate::path::renamed_with_counter(name, counter));
            match transport.stat(&candidate).await {
                Err(TransportError::NotFound(_)) => return Ok(candidate),
                Ok(_) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(BridgeError::InvalidArgument(format!(
            "no free name next to {remote_path}"
        )))
    }

    /// Close an edit session. With a pending upload this waits up to the
    /// configured flush timeout; `force` discards pending changes instead.
    pub async fn close(
        &self,
        session_id: &str,
        remote_path: &str,
        force: bool,
    ) -> Result<(), BridgeError> {
        let key = (session_id.to_string(), remote_path.to_string());
        let entry = self
            .entry(session_id, remote_path)
            .ok_or_else(|| BridgeError::UnknownShadow(remote_path.to_string()))?;

        if !force {
            if let (ShadowStatus::UploadPending | ShadowStatus::Uploading, Some(transfer_id)) =
                (entry.status, entry.transfer_id.as_deref())
            {
                self.wait_for_flush(transfer_id).await?;
            }
        }

        self.entries.write().remove(&key);
        self.by_local.write().remove(&entry.local_path);
        self.cleanup_local(&entry.local_path).await;
        info!(remote = %remote_path, "closed edit session");
        Ok(())
    }

    async fn wait_for_flush(&self, transfer_id: &str) -> Result<(), BridgeError> {
        let deadline =
            tokio::time::Instant::now() + Duration::from_secs(self.config.shadow_flush_timeout_secs);
        loop {
            match self.queue.record(transfer_id) {
                None => return Ok(()),
                Some(r) if r.state.is_terminal() => {
                    if r.state == TransferState::Succeeded {
                        return Ok(());
                    }
                    return Err(BridgeError::FlushFailed(
                        r.error.unwrap_or_else(|| format!("{:?}", r.state)),
                    ));
                }
                Some(_) => {}
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(BridgeError::FlushTimeout(self.config.shadow_flush_timeout_secs));
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Delete the shadow file and prune now-empty parents up to the root.
    async fn cleanup_local(&self, local_path: &Path) {
        if let Err(e) = tokio::fs::remove_file(local_path).await {
            debug!(error = %e, "shadow file already gone");
        }
        let mut dir = local_path.parent().map(Path::to_path_buf);
        while let Some(d) = dir {
            if d == self.root || !d.starts_with(&self.root) {
                break;
            }
            match std::fs::read_dir(&d).map(|mut iter| iter.next().is_none()) {
                Ok(true) => {
                    let _ = std::fs::remove_dir(&d);
                }
                _ => break,
            }
            dir = d.parent().map(Path::to_path_buf);
        }
    }

    /// Session teardown: entries become orphans, local copies stay on disk
    /// so nothing edited is lost.
    pub fn invalidate_session(&self, session_id: &str) {
        let keys: Vec<EntryKey> = self
            .entries
            .read()
            .keys()
            .filter(|(s, _)| s == session_id)
            .cloned()
            .collect();
        for key in keys {
            self.set_status(&key, ShadowStatus::Orphaned);
        }
    }

    /// Engine shutdown: flush every pending upload within the configured
    /// bound, then remove all shadow files. Entries whose flush fails are
    /// discarded rather than left behind.
    pub async fn shutdown(&self) {
        let keys: Vec<EntryKey> = self.entries.read().keys().cloned().collect();
        for (session_id, remote_path) in keys {
            if let Err(e) = self.close(&session_id, &remote_path, false).await {
                warn!(remote = %remote_path, error = %e, "flush on shutdown failed, discarding shadow");
                let _ = self.close(&session_id, &remote_path, true).await;
            }
        }
    }

    /// Follows upload records so entry status and the remote fingerprint
    /// baseline track what actually happened.
    async fn track_uploads(
        store: Arc<Self>,
        mut rx: tokio::sync::broadcast::Receiver<BridgeEvent>,
    ) {
        loop {
            let event = match rx.recv().await {
                Ok(e) => e,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
            };
            let BridgeEvent::TransferUpdated { record } = event else {
                continue;
            };
            let key = {
                let entries = store.entries.read();
                entries
                    .values()
                    .find(|e| e.transfer_id.as_deref() == Some(record.id.as_str()))
                    .map(|e| (e.session_id.clone(), e.remote_path.clone()))
            };
            let Some(key) = key else { continue };

            match record.state {
                TransferState::Running => store.set_status(&key, ShadowStatus::Uploading),
                TransferState::Succeeded => {
                    store.refresh_baseline(&key).await;
                    store.set_status(&key, ShadowStatus::Editing);
                }
                TransferState::Failed | TransferState::Cancelled => {
                    store.set_status(&key, ShadowStatus::UploadPending);
                }
                _ => {}
            }
        }
    }

    /// After a successful upload the remote mtime is ours; re-stat so the
    /// next save does not call its own write a conflict.
    async fn refresh_baseline(&self, key: &EntryKey) {
        let Ok(session) = self.registry.get(&key.0) else { return };
        let Ok(transport) = session.transport() else { return };
        if let Ok(remote) = transport.stat(&key.1).await {
            let mut entries = self.entries.write();
            if let Some(e) = entries.get_mut(key) {
                e.remote_fingerprint = Fingerprint::of_entry(&remote);
            }
        }
    }
}

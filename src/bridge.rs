//! The facade wiring everything together: sessions, browsing, the transfer
//! queue, shadow editing, drop ingestion and history.

use crate::config::{BridgeConfig, CollisionPolicy};
use crate::credentials::CredentialProvider;
use crate::error::BridgeError;
use crate::events::{BridgeEvent, EventBus};
use crate::history::{HistoryStore, RedbHistoryStore};
use crate::ingest::Ingestor;
use crate::queue::TransferQueue;
use crate::session::{ConnectionState, Session, SessionRegistry};
use crate::shadow::{ConflictResolution, ShadowEntry, ShadowStore};
use crate::transport::client::HostKeyMode;
use crate::transport::{
    connect_session, KnownHostsStore, SessionParams, SftpTransport,
};
use crate::types::{RemoteEntry, TransferRecord};
use crate::watch::WatchDispatcher;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};

pub struct FileBridge {
    config: BridgeConfig,
    events: EventBus,
    registry: Arc<SessionRegistry>,
    queue: Arc<TransferQueue>,
    shadows: Arc<ShadowStore>,
    ingestor: Ingestor,
    history: Arc<dyn HistoryStore>,
    known_hosts: Arc<KnownHostsStore>,
    _watcher: WatchDispatcher,
}

impl FileBridge {
    /// Production setup: redb history under the platform data dir and the
    /// user's known_hosts.
    pub fn new(config: BridgeConfig) -> Result<Arc<Self>, BridgeError> {
        let history: Arc<dyn HistoryStore> = Arc::new(RedbHistoryStore::open_default()?);
        Self::with_history(config, history)
    }

    pub fn with_history(
        config: BridgeConfig,
        history: Arc<dyn HistoryStore>,
    ) -> Result<Arc<Self>, BridgeError> {
        let events = EventBus::new();
        let registry = Arc::new(SessionRegistry::new());
        let queue = TransferQueue::new(
            config.clone(),
            registry.clone(),
            history.clone(),
            events.clone(),
        );
        let shadows = ShadowStore::new(
            config.clone(),
            registry.clone(),
            queue.clone(),
            events.clone(),
        );
        let watcher =
            WatchDispatcher::spawn(shadows.clone(), Duration::from_millis(config.debounce_ms))?;
        let ingestor = Ingestor::new(
            config.clone(),
            registry.clone(),
            queue.clone(),
            events.clone(),
        );
        let bridge = Arc::new(Self {
            config,
            events: events.clone(),
            registry,
            queue,
            shadows,
            ingestor,
            history,
            known_hosts: Arc::new(KnownHostsStore::open_default()),
            _watcher: watcher,
        });
        // Session drops can originate outside the facade (keepalive death,
        // direct mark_disconnected); mirror them into the queue.
        tokio::spawn(Self::watch_session_states(
            Arc::downgrade(&bridge),
            events.subscribe(),
        ));
        Ok(bridge)
    }

    async fn watch_session_states(
        bridge: std::sync::Weak<Self>,
        mut rx: broadcast::Receiver<BridgeEvent>,
    ) {
        loop {
            let event = match rx.recv().await {
                Ok(e) => e,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return,
            };
            if let BridgeEvent::SessionStateChanged { session_id, state } = event {
                if matches!(
                    state,
                    ConnectionState::Disconnected | ConnectionState::Failed { .. }
                ) {
                    let Some(bridge) = bridge.upgrade() else { return };
                    bridge.queue.handle_disconnect(&session_id).await;
                }
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.events.subscribe()
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    // ---- sessions -------------------------------------------------------

    /// Register a session. It starts disconnected; call [`connect`] next.
    ///
    /// [`connect`]: Self::connect
    pub fn add_session(&self, id: impl Into<String>, params: SessionParams) -> Arc<Session> {
        let session = Session::new(id, params, self.events.clone());
        self.registry.insert(session.clone());
        session
    }

    pub fn session(&self, id: &str) -> Result<Arc<Session>, BridgeError> {
        self.registry.get(id)
    }

    pub async fn connect(
        &self,
        session_id: &str,
        credentials: &dyn CredentialProvider,
        host_key_mode: HostKeyMode,
    ) -> Result<(), BridgeError> {
        let session = self.registry.get(session_id)?;
        session.mark_connecting();

        let auth = match credentials.resolve(&session.params.auth).await {
            Ok(auth) => auth,
            Err(e) => {
                session.mark_failed(e.to_string());
                return Err(e.into());
            }
        };
        let connected = match connect_session(
            &session.params,
            auth,
            self.known_hosts.clone(),
            host_key_mode,
            &self.config,
        )
        .await
        {
            Ok(c) => c,
            Err(e) => {
                session.mark_failed(e.to_string());
                return Err(e.into());
            }
        };
        let (transport, home) = match SftpTransport::open(&connected, self.config.ops_in_flight)
            .await
        {
            Ok(pair) => pair,
            Err(e) => {
                session.mark_failed(e.to_string());
                return Err(e.into());
            }
        };
        session.mark_connected(Arc::new(transport), home, Some(Arc::new(connected)));
        Ok(())
    }

    pub async fn disconnect(&self, session_id: &str) -> Result<(), BridgeError> {
        let session = self.registry.get(session_id)?;
        if let Some(handle) = session.connected_handle() {
            handle.disconnect().await;
        }
        session.mark_disconnected();
        Ok(())
    }

    /// Remove a session entirely. Shadow entries for it become orphans.
    pub async fn remove_session(&self, session_id: &str) -> Result<(), BridgeError> {
        self.disconnect(session_id).await?;
        self.shadows.invalidate_session(session_id);
        self.registry.remove(session_id);
        info!(session = %session_id, "session removed");
        Ok(())
    }

    /// Orderly teardown: flush and remove every shadow file, then drop all
    /// connections. Call before process exit so edits in flight reach the
    /// remote.
    pub async fn shutdown(&self) {
        self.shadows.shutdown().await;
        for id in self.registry.ids() {
            if let Err(e) = self.disconnect(&id).await {
                warn!(session = %id, error = %e, "disconnect during shutdown failed");
            }
        }
    }

    // ---- browsing -------------------------------------------------------

    pub async fn list_dir(
        &self,
        session_id: &str,
        path: &str,
    ) -> Result<Vec<RemoteEntry>, BridgeError> {
        let session = self.registry.get(session_id)?;
        let resolved = session.resolve(path);
        let entries = session.transport()?.list_dir(&resolved).await?;
        Ok(entries)
    }

    pub async fn stat(&self, session_id: &str, path: &str) -> Result<RemoteEntry, BridgeError> {
        let session = self.registry.get(session_id)?;
        let resolved = session.resolve(path);
        Ok(session.transport()?.stat(&resolved).await?)
    }

    /// Change the browsing cwd; relative paths in later calls resolve
    /// against it.
    pub async fn change_dir(&self, session_id: &str, path: &str) -> Result<String, BridgeError> {
        let session = self.registry.get(session_id)?;
        let resolved = session.resolve(path);
        let canonical = session.transport()?.canonicalize(&resolved).await?;
        session.set_cwd(canonical.clone());
        Ok(canonical)
    }

    pub async fn mkdir(&self, session_id: &str, path: &str) -> Result<(), BridgeError> {
        let session = self.registry.get(session_id)?;
        let resolved = session.resolve(path);
        crate::transport::mkdir_all(session.transport()?.as_ref(), &resolved).await?;
        Ok(())
    }

    pub async fn rename(
        &self,
        session_id: &str,
        from: &str,
        to: &str,
    ) -> Result<(), BridgeError> {
        let session = self.registry.get(session_id)?;
        let from = session.resolve(from);
        let to = session.resolve(to);
        session.transport()?.rename(&from, &to).await?;
        Ok(())
    }

    pub async fn delete(&self, session_id: &str, path: &str) -> Result<(), BridgeError> {
        let session = self.registry.get(session_id)?;
        let resolved = session.resolve(path);
        crate::transport::delete_recursive(session.transport()?.as_ref(), &resolved).await?;
        Ok(())
    }

    // ---- transfers ------------------------------------------------------

    pub async fn upload(
        &self,
        session_id: &str,
        local: PathBuf,
        remote: &str,
    ) -> Result<String, BridgeError> {
        let session = self.registry.get(session_id)?;
        let remote = session.resolve(remote);
        self.queue.enqueue_upload(session_id, local, remote).await
    }

    pub async fn download(
        &self,
        session_id: &str,
        remote: &str,
        local: PathBuf,
    ) -> Result<String, BridgeError> {
        let session = self.registry.get(session_id)?;
        let remote = session.resolve(remote);
        let size = match session.transport()?.stat(&remote).await {
            Ok(entry) => entry.size,
            Err(e) => {
                warn!(error = %e, "stat before download failed");
                0
            }
        };
        self.queue
            .enqueue_download(session_id, remote, local, size)
            .await
    }

    pub async fn cancel_transfer(&self, id: &str) -> Result<(), BridgeError> {
        self.queue.cancel(id).await
    }

    pub fn pause_transfer(&self, id: &str) -> Result<(), BridgeError> {
        self.queue.pause(id)
    }

    pub fn resume_transfer(&self, id: &str) -> Result<(), BridgeError> {
        self.queue.resume(id)
    }

    pub async fn retry_transfer(&self, id: &str) -> Result<(), BridgeError> {
        self.queue.retry(id).await
    }

    pub fn transfer(&self, id: &str) -> Option<TransferRecord> {
        self.queue.record(id)
    }

    pub fn transfers(&self, session_id: &str) -> Vec<TransferRecord> {
        self.queue.records_for_session(session_id)
    }

    pub async fn transfer_history(&self) -> Result<Vec<TransferRecord>, BridgeError> {
        self.history.list().await
    }

    /// Clear persisted history; with a cutoff only terminal records that
    /// finished before it are dropped.
    pub async fn clear_history(
        &self,
        older_than: Option<chrono::DateTime<chrono::Utc>>,
    ) -> Result<(), BridgeError> {
        self.history.clear(older_than).await
    }

    // ---- shadow editing -------------------------------------------------

    pub async fn open_for_edit(
        &self,
        session_id: &str,
        remote_path: &str,
    ) -> Result<ShadowEntry, BridgeError> {
        self.shadows.open_for_edit(session_id, remote_path).await
    }

    pub async fn resolve_conflict(
        &self,
        session_id: &str,
        remote_path: &str,
        resolution: ConflictResolution,
    ) -> Result<ShadowEntry, BridgeError> {
        self.shadows
            .resolve_conflict(session_id, remote_path, resolution)
            .await
    }

    pub async fn close_edit(
        &self,
        session_id: &str,
        remote_path: &str,
        force: bool,
    ) -> Result<(), BridgeError> {
        self.shadows.close(session_id, remote_path, force).await
    }

    pub fn open_edits(&self) -> Vec<ShadowEntry> {
        self.shadows.entries()
    }

    // ---- drop ingestion -------------------------------------------------

    pub async fn ingest_local(
        &self,
        session_id: &str,
        paths: &[PathBuf],
        remote_dir: &str,
        policy: Option<CollisionPolicy>,
    ) -> Result<Vec<String>, BridgeError> {
        self.ingestor
            .ingest_local(session_id, paths, remote_dir, policy)
            .await
    }

    pub async fn ingest_remote(
        &self,
        session_id: &str,
        remote_paths: &[String],
        local_dir: &Path,
        policy: Option<CollisionPolicy>,
    ) -> Result<Vec<String>, BridgeError> {
        self.ingestor
            .ingest_remote(session_id, remote_paths, local_dir, policy)
            .await
    }
}

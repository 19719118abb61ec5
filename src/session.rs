//! Session lifecycle. A session owns one transport and a state watch channel
//! that the scheduler and shadow store observe; queued work survives a
//! disconnect because dispatch blocks until the channel says `Connected`.

use crate::error::BridgeError;
use crate::events::{BridgeEvent, EventBus};
use crate::path::RemotePathResolver;
use crate::transport::client::ConnectedTransport;
use crate::transport::{SessionParams, Transport};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Failed { reason: String },
}

pub struct Session {
    pub id: String,
    pub params: SessionParams,
    state_tx: watch::Sender<ConnectionState>,
    transport: RwLock<Option<Arc<dyn Transport>>>,
    /// Raw SSH handle, present only for real connections. Used for exec
    /// probes and the rsync bulk path.
    connected: Mutex<Option<Arc<ConnectedTransport>>>,
    resolver: RwLock<RemotePathResolver>,
    /// Result of the per-session rsync probe, filled on first directory job.
    bulk_available: tokio::sync::OnceCell<bool>,
    events: EventBus,
}

impl Session {
    pub fn new(id: impl Into<String>, params: SessionParams, events: EventBus) -> Arc<Self> {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Arc::new(Self {
            id: id.into(),
            params,
            state_tx,
            transport: RwLock::new(None),
            connected: Mutex::new(None),
            resolver: RwLock::new(RemotePathResolver::new("/")),
            bulk_available: tokio::sync::OnceCell::new(),
            events,
        })
    }

    pub fn state(&self) -> ConnectionState {
        self.state_tx.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    fn set_state(&self, state: ConnectionState) {
        // send() drops the value when no receiver is alive; dispatchers
        // subscribe lazily, so the transition must be stored regardless.
        self.state_tx.send_replace(state.clone());
        self.events.emit(BridgeEvent::SessionStateChanged {
            session_id: self.id.clone(),
            state,
        });
    }

    pub fn mark_connecting(&self) {
        self.set_state(ConnectionState::Connecting);
    }

    pub fn mark_connected(
        &self,
        transport: Arc<dyn Transport>,
        home: String,
        connected: Option<Arc<ConnectedTransport>>,
    ) {
        *self.transport.write() = Some(transport);
        *self.connected.lock() = connected;
        *self.resolver.write() = RemotePathResolver::new(home);
        self.set_state(ConnectionState::Connected);
        info!(session = %self.id, "session connected");
    }

    pub fn mark_failed(&self, reason: impl Into<String>) {
        *self.transport.write() = None;
        *self.connected.lock() = None;
        self.set_state(ConnectionState::Failed {
            reason: reason.into(),
        });
    }

    pub fn mark_disconnected(&self) {
        *self.transport.write() = None;
        *self.connected.lock() = None;
        self.set_state(ConnectionState::Disconnected);
        info!(session = %self.id, "session disconnected");
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn transport(&self) -> Result<Arc<dyn Transport>, BridgeError> {
        self.transport
            .read()
            .clone()
            .ok_or_else(|| BridgeError::NotConnected(self.id.clone()))
    }

    pub fn connected_handle(&self) -> Option<Arc<ConnectedTransport>> {
        self.connected.lock().clone()
    }

    pub fn resolve(&self, path: &str) -> String {
        self.resolver.read().resolve(path)
    }

    pub fn cwd(&self) -> String {
        self.resolver.read().cwd().to_string()
    }

    pub fn set_cwd(&self, cwd: impl Into<String>) {
        self.resolver.write().set_cwd(cwd);
    }

    /// Whether rsync bulk sync can run on this session. Probed once.
    pub async fn bulk_available(&self) -> bool {
        *self
            .bulk_available
            .get_or_init(|| async {
                match self.connected_handle() {
                    Some(connected) => {
                        crate::transport::bulk::probe(&self.params, &connected).await
                    }
                    None => false,
                }
            })
            .await
    }
}

#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, Arc<Session>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, session: Arc<Session>) {
        self.sessions.insert(session.id.clone(), session);
    }

    pub fn get(&self, id: &str) -> Result<Arc<Session>, BridgeError> {
        self.sessions
            .get(id)
            .map(|s| s.clone())
            .ok_or_else(|| BridgeError::UnknownSession(id.to_string()))
    }

    pub fn remove(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.remove(id).map(|(_, s)| s)
    }

    pub fn ids(&self) -> Vec<String> {
        self.sessions.iter().map(|e| e.key().clone()).collect()
    }
}

//! Broadcast event bus. Consumers (a UI, a logger, tests) subscribe and get
//! every state change; slow consumers lag rather than block the engine.

use crate::shadow::ShadowStatus;
use crate::session::ConnectionState;
use crate::types::{ProgressUpdate, TransferRecord};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeEvent {
    SessionStateChanged {
        session_id: String,
        state: ConnectionState,
    },
    /// Full record snapshot on every state transition.
    TransferUpdated { record: TransferRecord },
    /// Coalesced byte counters; high frequency, no record payload.
    TransferProgress { update: ProgressUpdate },
    ShadowStatusChanged {
        session_id: String,
        remote_path: String,
        status: ShadowStatus,
    },
    /// An auto-upload was blocked; the edit session needs a resolution.
    ConflictDetected {
        session_id: String,
        remote_path: String,
    },
    /// An ingested file collided under `CollisionPolicy::Ask`; nothing was
    /// queued for it.
    CollisionPrompt {
        session_id: String,
        local_path: String,
        remote_path: String,
    },
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<BridgeEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.tx.subscribe()
    }

    /// Fire and forget; an event with no subscribers is dropped.
    pub fn emit(&self, event: BridgeEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

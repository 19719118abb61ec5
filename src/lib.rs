//! Remote file bridge for SSH sessions: browse an SFTP tree, edit remote
//! files through local shadow copies with watched auto-upload, and move
//! files either way through a bounded, retrying transfer queue.
//!
//! [`FileBridge`] is the entry point. Register a session with connection
//! parameters, connect it, then browse, transfer and edit through the
//! facade. Everything observable flows out of [`events::BridgeEvent`].

pub mod bridge;
pub mod config;
pub mod credentials;
pub mod error;
pub mod events;
pub mod history;
pub mod ingest;
pub mod path;
pub mod queue;
pub mod session;
pub mod shadow;
pub mod transport;
pub mod types;
pub mod watch;

pub use bridge::FileBridge;
pub use config::{BridgeConfig, CollisionPolicy, RetryConfig};
pub use credentials::{AuthRef, CredentialProvider, KeyringProvider, ResolvedAuth};
pub use error::{BridgeError, ConflictError, ConnectError, TransportError};
pub use events::BridgeEvent;
pub use history::{HistoryStore, MemoryHistoryStore, RedbHistoryStore};
pub use session::{ConnectionState, Session};
pub use shadow::{ConflictResolution, ShadowEntry, ShadowStatus};
pub use transport::client::HostKeyMode;
pub use transport::{SessionParams, Transport};
pub use types::{
    EntryKind, ProgressUpdate, RemoteEntry, TransferDirection, TransferRecord, TransferState,
};

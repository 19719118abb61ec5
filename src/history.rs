//! Persisted transfer history. Records are stored as named-field msgpack so
//! older builds can read records written by newer ones, unknown fields are
//! simply ignored on decode.

use crate::error::BridgeError;
use crate::types::TransferRecord;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, TableDefinition};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

const HISTORY_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("transfer_history");

#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn save(&self, record: &TransferRecord) -> Result<(), BridgeError>;
    async fn load(&self, id: &str) -> Result<Option<TransferRecord>, BridgeError>;
    /// Most recent first, by creation time.
    async fn list(&self) -> Result<Vec<TransferRecord>, BridgeError>;
    async fn delete(&self, id: &str) -> Result<(), BridgeError>;
    /// Drop terminal records beyond `keep`, oldest first, and any older than
    /// `max_age_days` when set. Non-terminal records are never pruned.
    async fn prune(&self, keep: usize, max_age_days: Option<u32>) -> Result<usize, BridgeError>;
    /// Drop records. With a cutoff only terminal records that finished
    /// before it go; without one the whole history goes.
    async fn clear(&self, older_than: Option<DateTime<Utc>>) -> Result<(), BridgeError>;
}

pub struct RedbHistoryStore {
    db: Arc<Database>,
}

impl RedbHistoryStore {
    pub fn open(path: &Path) -> Result<Self, BridgeError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| BridgeError::History(format!("create dir: {e}")))?;
        }
        let db = Database::create(path).map_err(|e| BridgeError::History(e.to_string()))?;
        // Make sure the table exists so first reads don't fail.
        let txn = db
            .begin_write()
            .map_err(|e| BridgeError::History(e.to_string()))?;
        txn.open_table(HISTORY_TABLE)
            .map_err(|e| BridgeError::History(e.to_string()))?;
        txn.commit().map_err(|e| BridgeError::History(e.to_string()))?;
        Ok(Self { db: Arc::new(db) })
    }

    /// Default location under the platform data directory.
    pub fn open_default() -> Result<Self, BridgeError> {
        let base = dirs::data_dir()
            .ok_or_else(|| BridgeError::History("no data directory".into()))?;
        Self::open(&base.join("filebridge").join("history.redb"))
    }

    fn encode(record: &TransferRecord) -> Result<Vec<u8>, BridgeError> {
        rmp_serde::to_vec_named(record).map_err(|e| BridgeError::History(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Option<TransferRecord> {
        match rmp_serde::from_slice(bytes) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(error = %e, "skipping undecodable history record");
                None
            }
        }
    }
}

#[async_trait]
impl HistoryStore for RedbHistoryStore {
    async fn save(&self, record: &TransferRecord) -> Result<(), BridgeError> {
        let bytes = Self::encode(record)?;
        let txn = self
            .db
            .begin_write()
            .map_err(|e| BridgeError::History(e.to_string()))?;
        {
            let mut table = txn
                .open_table(HISTORY_TABLE)
                .map_err(|e| BridgeError::History(e.to_string()))?;
            table
                .insert(record.id.as_str(), bytes.as_slice())
                .map_err(|e| BridgeError::History(e.to_string()))?;
        }
        txn.commit().map_err(|e| BridgeError::History(e.to_string()))?;
        Ok(())
    }

    async fn load(&self, id: &str) -> Result<Option<TransferRecord>, BridgeError> {
        let txn = self
            .db
            .begin_read()
            .map_err(|e| BridgeError::History(e.to_string()))?;
        let table = txn
            .open_table(HISTORY_TABLE)
            .map_err(|e| BridgeError::History(e.to_string()))?;
        let value = table
            .get(id)
            .map_err(|e| BridgeError::History(e.to_string()))?;
        Ok(value.and_then(|v| Self::decode(v.value())))
    }

    async fn list(&self) -> Result<Vec<TransferRecord>, BridgeError> {
        let txn = self
            .db
            .begin_read()
            .map_err(|e| BridgeError::History(e.to_string()))?;
        let table = txn
            .open_table(HISTORY_TABLE)
            .map_err(|e| BridgeError::History(e.to_string()))?;
        let mut records = Vec::new();
        for item in table
            .iter()
            .map_err(|e| BridgeError::History(e.to_string()))?
        {
            let (_, value) = item.map_err(|e| BridgeError::History(e.to_string()))?;
            if let Some(record) = Self::decode(value.value()) {
                records.push(record);
            }
        }
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records)
    }

    async fn delete(&self, id: &str) -> Result<(), BridgeError> {
        let txn = self
            .db
            .begin_write()
            .map_err(|e| BridgeError::History(e.to_string()))?;
        {
            let mut table = txn
                .open_table(HISTORY_TABLE)
                .map_err(|e| BridgeError::History(e.to_string()))?;
            table
                .remove(id)
                .map_err(|e| BridgeError::History(e.to_string()))?;
        }
        txn.commit().map_err(|e| BridgeError::History(e.to_string()))?;
        Ok(())
    }

    async fn prune(&self, keep: usize, max_age_days: Option<u32>) -> Result<usize, BridgeError> {
        let mut records = self.list().await?;
        records.retain(|r| r.state.is_terminal());

        let cutoff = max_age_days
            .map(|days| chrono::Utc::now() - chrono::Duration::days(i64::from(days)));

        // list() is newest first, so everything past `keep` goes.
        let mut doomed: Vec<String> = records
            .iter()
            .skip(keep)
            .map(|r| r.id.clone())
            .collect();
        if let Some(cutoff) = cutoff {
            doomed.extend(
                records
                    .iter()
                    .take(keep)
                    .filter(|r| r.created_at < cutoff)
                    .map(|r| r.id.clone()),
            );
        }

        for id in &doomed {
            self.delete(id).await?;
        }
        if !doomed.is_empty() {
            debug!(count = doomed.len(), "pruned history records");
        }
        Ok(doomed.len())
    }

    async fn clear(&self, older_than: Option<DateTime<Utc>>) -> Result<(), BridgeError> {
        if let Some(cutoff) = older_than {
            let doomed: Vec<String> = self
                .list()
                .await?
                .into_iter()
                .filter(|r| r.state.is_terminal())
                .filter(|r| r.finished_at.unwrap_or(r.created_at) < cutoff)
                .map(|r| r.id)
                .collect();
            for id in &doomed {
                self.delete(id).await?;
            }
            return Ok(());
        }
        let txn = self
            .db
            .begin_write()
            .map_err(|e| BridgeError::History(e.to_string()))?;
        {
            let mut table = txn
                .open_table(HISTORY_TABLE)
                .map_err(|e| BridgeError::History(e.to_string()))?;
            // redb has no truncate; drain by key.
            let keys: Vec<String> = table
                .iter()
                .map_err(|e| BridgeError::History(e.to_string()))?
                .filter_map(|item| item.ok().map(|(k, _)| k.value().to_string()))
                .collect();
            for key in keys {
                table
                    .remove(key.as_str())
                    .map_err(|e| BridgeError::History(e.to_string()))?;
            }
        }
        txn.commit().map_err(|e| BridgeError::History(e.to_string()))?;
        Ok(())
    }
}

/// In-memory store for tests and ephemeral use.
#[derive(Default)]
pub struct MemoryHistoryStore {
    records: parking_lot::RwLock<std::collections::HashMap<String, TransferRecord>>,
}

impl MemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HistoryStore for MemoryHistoryStore {
    async fn save(&self, record: &TransferRecord) -> Result<(), BridgeError> {
        self.records
            .write()
            .insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn load(&self, id: &str) -> Result<Option<TransferRecord>, BridgeError> {
        Ok(self.records.read().get(id).cloned())
    }

    async fn list(&self) -> Result<Vec<TransferRecord>, BridgeError> {
        let mut records: Vec<_> = self.records.read().values().cloned().collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records)
    }

    async fn delete(&self, id: &str) -> Result<(), BridgeError> {
        self.records.write().remove(id);
        Ok(())
    }

    async fn prune(&self, keep: usize, max_age_days: Option<u32>) -> Result<usize, BridgeError> {
        let mut records = self.list().await?;
        records.retain(|r| r.state.is_terminal());
        let cutoff = max_age_days
            .map(|days| chrono::Utc::now() - chrono::Duration::days(i64::from(days)));
        let doomed: Vec<String> = records
            .iter()
            .enumerate()
            .filter(|(i, r)| {
                *i >= keep || cutoff.map(|c| r.created_at < c).unwrap_or(false)
            })
            .map(|(_, r)| r.id.clone())
            .collect();
        let mut map = self.records.write();
        for id in &doomed {
            map.remove(id);
        }
        Ok(doomed.len())
    }

    async fn clear(&self, older_than: Option<DateTime<Utc>>) -> Result<(), BridgeError> {
        match older_than {
            None => self.records.write().clear(),
            Some(cutoff) => self.records.write().retain(|_, r| {
                !r.state.is_terminal() || r.finished_at.unwrap_or(r.created_at) >= cutoff
            }),
        }
        Ok(())
    }
}

//! Shared test harness: an in-memory transport plus a wired-up queue and
//! session, so integration tests exercise real scheduling against fake I/O.

#![allow(dead_code)]

use async_trait::async_trait;
use filebridge::config::{BridgeConfig, RetryConfig};
use filebridge::credentials::AuthRef;
use filebridge::error::TransportError;
use filebridge::events::EventBus;
use filebridge::history::{HistoryStore, MemoryHistoryStore};
use filebridge::queue::TransferQueue;
use filebridge::session::{Session, SessionRegistry};
use filebridge::transport::{SessionParams, Transport, TransferContext};
use filebridge::types::{EntryKind, RemoteEntry, TransferRecord};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Failure injected by a test, consumed one per attempt.
#[derive(Clone, Copy)]
pub enum Planned {
    Retryable,
    NotFound,
}

/// In-memory remote filesystem with per-path overlap and global concurrency
/// accounting. Uploads write partial content chunk by chunk so cancellation
/// leaves a visible partial file, like the real transport.
#[derive(Default)]
pub struct MockRemote {
    pub files: Mutex<HashMap<String, Vec<u8>>>,
    pub dirs: Mutex<HashSet<String>>,
    pub fail_plan: Mutex<HashMap<String, VecDeque<Planned>>>,
    /// Delay per streamed chunk, to hold transfers open for the test.
    pub step_delay_ms: u64,
    /// Reported as every entry's mtime; bump to simulate a remote-side write.
    pub clock: AtomicI64,
    pub active_per_path: Mutex<HashMap<String, usize>>,
    pub overlap_seen: AtomicUsize,
    pub active: AtomicUsize,
    pub max_active: AtomicUsize,
}

impl MockRemote {
    pub fn new(step_delay_ms: u64) -> Arc<Self> {
        Arc::new(Self {
            step_delay_ms,
            clock: AtomicI64::new(1_700_000_000),
            ..Default::default()
        })
    }

    pub fn seed_file(&self, path: &str, content: &[u8]) {
        self.files.lock().insert(path.to_string(), content.to_vec());
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.files.lock().get(path).cloned()
    }

    /// Overwrite a file as if someone else wrote it: content changes and the
    /// reported mtime moves forward.
    pub fn remote_side_write(&self, path: &str, content: &[u8]) {
        self.seed_file(path, content);
        self.clock.fetch_add(60, Ordering::SeqCst);
    }

    pub fn plan_failures(&self, path: &str, failures: &[Planned]) {
        self.fail_plan
            .lock()
            .insert(path.to_string(), failures.iter().copied().collect());
    }

    fn take_planned(&self, path: &str) -> Option<Planned> {
        self.fail_plan
            .lock()
            .get_mut(path)
            .and_then(VecDeque::pop_front)
    }

    fn enter_path(&self, path: &str) {
        let mut active = self.active_per_path.lock();
        let n = active.entry(path.to_string()).or_insert(0);
        *n += 1;
        if *n > 1 {
            self.overlap_seen.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn leave_path(&self, path: &str) {
        let mut active = self.active_per_path.lock();
        if let Some(n) = active.get_mut(path) {
            *n -= 1;
        }
    }

    fn enter_global(&self) {
        let n = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(n, Ordering::SeqCst);
    }

    fn leave_global(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }

    fn entry_for(&self, path: &str, kind: EntryKind, size: u64) -> RemoteEntry {
        RemoteEntry {
            name: path.rsplit('/').next().unwrap_or(path).to_string(),
            path: path.to_string(),
            kind,
            size,
            modified: Some(self.clock.load(Ordering::SeqCst)),
            permissions: Some(0o644),
            link_target: None,
        }
    }

    async fn stream(
        &self,
        remote: &str,
        bytes: &[u8],
        ctx: &TransferContext,
        write_remote: bool,
    ) -> Result<u64, TransportError> {
        let total = bytes.len() as u64;
        let chunk = ctx.chunk_size.max(1);
        let mut done = 0usize;
        while done < bytes.len() {
            ctx.control.checkpoint().await?;
            tokio::time::sleep(Duration::from_millis(self.step_delay_ms)).await;
            done = (done + chunk).min(bytes.len());
            if write_remote {
                self.files
                    .lock()
                    .insert(remote.to_string(), bytes[..done].to_vec());
            }
            ctx.send_progress(done as u64, total);
        }
        // Zero-length files still need a checkpoint so cancel wins a race.
        ctx.control.checkpoint().await?;
        if write_remote {
            self.files.lock().insert(remote.to_string(), bytes.to_vec());
        }
        Ok(total)
    }
}

#[async_trait]
impl Transport for MockRemote {
    async fn stat(&self, path: &str) -> Result<RemoteEntry, TransportError> {
        if let Some(content) = self.file(path) {
            return Ok(self.entry_for(path, EntryKind::File, content.len() as u64));
        }
        if self.dirs.lock().contains(path) {
            return Ok(self.entry_for(path, EntryKind::Directory, 0));
        }
        Err(TransportError::NotFound(path.to_string()))
    }

    async fn list_dir(&self, path: &str) -> Result<Vec<RemoteEntry>, TransportError> {
        let prefix = format!("{}/", path.trim_end_matches('/'));
        let files = self.files.lock();
        Ok(files
            .iter()
            .filter(|(p, _)| p.starts_with(&prefix))
            .map(|(p, c)| self.entry_for(p, EntryKind::File, c.len() as u64))
            .collect())
    }

    async fn mkdir(&self, path: &str) -> Result<(), TransportError> {
        self.dirs.lock().insert(path.to_string());
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), TransportError> {
        let mut files = self.files.lock();
        match files.remove(from) {
            Some(content) => {
                files.insert(to.to_string(), content);
                Ok(())
            }
            None => Err(TransportError::NotFound(from.to_string())),
        }
    }

    async fn remove_file(&self, path: &str) -> Result<(), TransportError> {
        self.files
            .lock()
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| TransportError::NotFound(path.to_string()))
    }

    async fn remove_dir(&self, path: &str) -> Result<(), TransportError> {
        self.dirs.lock().remove(path);
        Ok(())
    }

    async fn canonicalize(&self, path: &str) -> Result<String, TransportError> {
        Ok(path.to_string())
    }

    async fn download(
        &self,
        remote: &str,
        local: &Path,
        ctx: &TransferContext,
    ) -> Result<u64, TransportError> {
        if let Some(planned) = self.take_planned(remote) {
            return Err(match planned {
                Planned::Retryable => TransportError::Io("injected fault".into()),
                Planned::NotFound => TransportError::NotFound(remote.to_string()),
            });
        }
        let bytes = self
            .file(remote)
            .ok_or_else(|| TransportError::NotFound(remote.to_string()))?;
        self.enter_path(remote);
        self.enter_global();
        let result = self.stream(remote, &bytes, ctx, false).await;
        self.leave_global();
        self.leave_path(remote);
        if result.is_ok() {
            tokio::fs::write(local, &bytes).await?;
        }
        result
    }

    async fn upload(
        &self,
        local: &Path,
        remote: &str,
        ctx: &TransferContext,
    ) -> Result<u64, TransportError> {
        if let Some(planned) = self.take_planned(remote) {
            return Err(match planned {
                Planned::Retryable => TransportError::Io("injected fault".into()),
                Planned::NotFound => TransportError::NotFound(remote.to_string()),
            });
        }
        let bytes = tokio::fs::read(local).await?;
        self.enter_path(remote);
        self.enter_global();
        let result = self.stream(remote, &bytes, ctx, true).await;
        self.leave_global();
        self.leave_path(remote);
        result
    }
}

pub struct Harness {
    pub config: BridgeConfig,
    pub events: EventBus,
    pub registry: Arc<SessionRegistry>,
    pub queue: Arc<TransferQueue>,
    pub session: Arc<Session>,
    pub remote: Arc<MockRemote>,
    pub tmp: tempfile::TempDir,
}

impl Harness {
    pub fn local_file(&self, name: &str, content: &[u8]) -> std::path::PathBuf {
        let path = self.tmp.path().join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    pub async fn wait_terminal(&self, id: &str) -> TransferRecord {
        self.wait_for(id, |r| r.state.is_terminal()).await
    }

    pub async fn wait_for(
        &self,
        id: &str,
        predicate: impl Fn(&TransferRecord) -> bool,
    ) -> TransferRecord {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            if let Some(r) = self.queue.record(id) {
                if predicate(&r) {
                    return r;
                }
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting on transfer {id}"
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

pub fn setup(config: BridgeConfig, step_delay_ms: u64) -> Harness {
    let events = EventBus::new();
    let registry = Arc::new(SessionRegistry::new());
    let history: Arc<dyn HistoryStore> = Arc::new(MemoryHistoryStore::new());
    let queue = TransferQueue::new(config.clone(), registry.clone(), history, events.clone());
    let params = SessionParams {
        host: "test.invalid".into(),
        port: 22,
        username: "user".into(),
        auth: AuthRef::Agent,
    };
    let session = Session::new("s1", params, events.clone());
    registry.insert(session.clone());
    let remote = MockRemote::new(step_delay_ms);
    session.mark_connected(remote.clone(), "/home/user".into(), None);
    Harness {
        config,
        events,
        registry,
        queue,
        session,
        remote,
        tmp: tempfile::tempdir().unwrap(),
    }
}

/// Tight retry timing and a tiny chunk size so transfers stream in multiple
/// observable steps.
pub fn fast_retry_config() -> BridgeConfig {
    BridgeConfig {
        retry: RetryConfig {
            max_retries: 2,
            initial_backoff_secs: 0,
            backoff_multiplier: 2.0,
            max_backoff_secs: 1,
        },
        chunk_size: 2,
        ..Default::default()
    }
}

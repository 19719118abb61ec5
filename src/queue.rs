//! Transfer scheduling. One dispatch task per session pulls queued transfer
//! ids, waits for the session to be connected, and hands them to workers
//! bounded by a semaphore. Two transfers touching the same remote path are
//! serialized by a per-path async mutex regardless of worker availability.

use crate::config::BridgeConfig;
use crate::error::{BridgeError, TransportError};
use crate::events::{BridgeEvent, EventBus};
use crate::history::HistoryStore;
use crate::session::{ConnectionState, Session, SessionRegistry};
use crate::transport::{self, TransferContext, TransferControl};
use crate::types::{ProgressUpdate, TransferDirection, TransferRecord, TransferState};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, info, warn};

pub struct TransferQueue {
    config: BridgeConfig,
    registry: Arc<SessionRegistry>,
    history: Arc<dyn HistoryStore>,
    events: EventBus,
    self_weak: Weak<Self>,
    records: RwLock<HashMap<String, TransferRecord>>,
    controls: RwLock<HashMap<String, TransferControl>>,
    dispatchers: Mutex<HashMap<String, mpsc::UnboundedSender<String>>>,
    /// Weak entries so finished paths do not accumulate.
    path_locks: Mutex<HashMap<String, Weak<tokio::sync::Mutex<()>>>>,
}

impl TransferQueue {
    pub fn new(
        config: BridgeConfig,
        registry: Arc<SessionRegistry>,
        history: Arc<dyn HistoryStore>,
        events: EventBus,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_weak| Self {
            config,
            registry,
            history,
            events,
            self_weak: self_weak.clone(),
            records: RwLock::new(HashMap::new()),
            controls: RwLock::new(HashMap::new()),
            dispatchers: Mutex::new(HashMap::new()),
            path_locks: Mutex::new(HashMap::new()),
        })
    }

    fn arc(&self) -> Option<Arc<Self>> {
        self.self_weak.upgrade()
    }

    pub fn record(&self, id: &str) -> Option<TransferRecord> {
        self.records.read().get(id).cloned()
    }

    pub fn records_for_session(&self, session_id: &str) -> Vec<TransferRecord> {
        self.records
            .read()
            .values()
            .filter(|r| r.session_id == session_id)
            .cloned()
            .collect()
    }

    /// Children of a directory job, in creation order.
    pub fn children(&self, parent_id: &str) -> Vec<TransferRecord> {
        let mut children: Vec<_> = self
            .records
            .read()
            .values()
            .filter(|r| r.parent_id.as_deref() == Some(parent_id))
            .cloned()
            .collect();
        children.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        children
    }

    pub async fn enqueue_upload(
        &self,
        session_id: &str,
        local: PathBuf,
        remote: String,
    ) -> Result<String, BridgeError> {
        let session = self.registry.get(session_id)?;
        let mut record = TransferRecord::new(
            session_id,
            TransferDirection::Upload,
            local.to_string_lossy(),
            remote,
        );
        record.bytes_total = std::fs::metadata(&local).map(|m| m.len()).unwrap_or(0);
        self.submit(session, record).await
    }

    pub async fn enqueue_download(
        &self,
        session_id: &str,
        remote: String,
        local: PathBuf,
        bytes_total: u64,
    ) -> Result<String, BridgeError> {
        let session = self.registry.get(session_id)?;
        let mut record = TransferRecord::new(
            session_id,
            TransferDirection::Download,
            remote,
            local.to_string_lossy(),
        );
        record.bytes_total = bytes_total;
        self.submit(session, record).await
    }

    /// Parent record of a fan-out directory job. Never dispatched itself;
    /// its state is aggregated from the children.
    pub async fn enqueue_parent(&self, record: TransferRecord) -> Result<String, BridgeError> {
        debug_assert!(record.is_directory);
        let id = record.id.clone();
        self.records.write().insert(id.clone(), record.clone());
        self.controls
            .write()
            .insert(id.clone(), TransferControl::new());
        self.persist(&record).await;
        self.events.emit(BridgeEvent::TransferUpdated { record });
        Ok(id)
    }

    /// Directory job executed as a single rsync run.
    pub async fn enqueue_bulk(
        &self,
        session: Arc<Session>,
        mut record: TransferRecord,
    ) -> Result<String, BridgeError> {
        record.is_directory = true;
        record.bulk = true;
        self.submit(session, record).await
    }

    pub async fn enqueue_child(
        &self,
        session: Arc<Session>,
        mut record: TransferRecord,
        parent_id: &str,
    ) -> Result<String, BridgeError> {
        record.parent_id = Some(parent_id.to_string());
        self.submit(session, record).await
    }

    async fn submit(
        &self,
        session: Arc<Session>,
        record: TransferRecord,
    ) -> Result<String, BridgeError> {
        let id = record.id.clone();
        self.records.write().insert(id.clone(), record.clone());
        self.controls
            .write()
            .insert(id.clone(), TransferControl::new());
        self.persist(&record).await;
        self.events.emit(BridgeEvent::TransferUpdated { record });
        self.dispatcher_for(&session)?
            .send(id.clone())
            .map_err(|_| {
                BridgeError::InvalidArgument(format!("dispatcher for {} is gone", session.id))
            })?;
        debug!(transfer = %id, session = %session.id, "transfer queued");
        Ok(id)
    }

    fn dispatcher_for(
        &self,
        session: &Arc<Session>,
    ) -> Result<mpsc::UnboundedSender<String>, BridgeError> {
        let mut dispatchers = self.dispatchers.lock();
        if let Some(tx) = dispatchers.get(&session.id) {
            if !tx.is_closed() {
                return Ok(tx.clone());
            }
        }
        let queue = self
            .arc()
            .ok_or_else(|| BridgeError::InvalidArgument("queue shut down".into()))?;
        let (tx, rx) = mpsc::unbounded_channel();
        dispatchers.insert(session.id.clone(), tx.clone());
        tokio::spawn(Self::dispatch_loop(queue, session.clone(), rx));
        Ok(tx)
    }

    async fn dispatch_loop(
        queue: Arc<Self>,
        session: Arc<Session>,
        mut rx: mpsc::UnboundedReceiver<String>,
    ) {
        let workers = Arc::new(Semaphore::new(queue.config.workers_per_session.max(1)));
        let mut state_rx = session.subscribe_state();
        while let Some(id) = rx.recv().await {
            // Cancelled while still waiting in the queue.
            match queue.record(&id) {
                Some(r) if r.state == TransferState::Queued => {}
                _ => continue,
            }
            // Queued work survives a disconnect: block here until the
            // session comes back rather than failing the record.
            loop {
                if matches!(*state_rx.borrow_and_update(), ConnectionState::Connected) {
                    break;
                }
                if state_rx.changed().await.is_err() {
                    return;
                }
            }
            // Re-check after a potentially long wait.
            match queue.record(&id) {
                Some(r) if r.state == TransferState::Queued => {}
                _ => continue,
            }
            let Ok(permit) = workers.clone().acquire_owned().await else {
                return;
            };
            let queue = queue.clone();
            let session = session.clone();
            tokio::spawn(async move {
                queue.run_transfer(session, id).await;
                drop(permit);
            });
        }
    }

    /// The serialization point for one remote path on one session.
    fn path_lock(&self, session_id: &str, remote_path: &str) -> Arc<tokio::sync::Mutex<()>> {
        let key = format!("{session_id}:{remote_path}");
        let mut locks = self.path_locks.lock();
        if let Some(existing) = locks.get(&key).and_then(Weak::upgrade) {
            return existing;
        }
        let lock = Arc::new(tokio::sync::Mutex::new(()));
        locks.insert(key, Arc::downgrade(&lock));
        lock
    }

    fn remote_path_of(record: &TransferRecord) -> &str {
        match record.direction {
            TransferDirection::Upload => &record.destination,
            TransferDirection::Download => &record.source,
        }
    }

    async fn run_transfer(self: Arc<Self>, session: Arc<Session>, id: String) {
        let Some(record) = self.record(&id) else { return };
        let lock = self.path_lock(&session.id, Self::remote_path_of(&record));
        let _path_guard = lock.lock().await;

        // State may have changed while waiting on the path lock.
        match self.record(&id) {
            Some(r) if r.state == TransferState::Queued => {}
            _ => return,
        }

        let control = match self.controls.read().get(&id) {
            Some(c) => c.clone(),
            None => return,
        };
        if control.is_cancelled() {
            self.finish(&id, |r| r.mark_cancelled()).await;
            return;
        }

        self.update(&id, |r| r.mark_running()).await;

        let (progress_tx, progress_rx) = mpsc::unbounded_channel();
        let reporter = tokio::spawn(Self::report_progress(
            self.clone(),
            progress_rx,
            Duration::from_millis(self.config.progress_interval_ms),
        ));

        let outcome = self
            .run_with_retry(&session, &id, &control, progress_tx)
            .await;
        let _ = reporter.await;

        match outcome {
            Ok(bytes) => {
                info!(transfer = %id, bytes, "transfer completed");
                self.finish(&id, |r| {
                    if r.bytes_total == 0 {
                        r.bytes_total = bytes;
                    }
                    r.bytes_done = bytes;
                    r.mark_succeeded();
                })
                .await;
            }
            Err(TransportError::Cancelled) => {
                info!(transfer = %id, "transfer cancelled");
                self.finish(&id, |r| r.mark_cancelled()).await;
            }
            Err(e) => {
                warn!(transfer = %id, error = %e, "transfer failed");
                let retryable = e.is_retryable() || matches!(e, TransportError::Disconnected);
                self.finish(&id, |r| r.mark_failed(e.to_string(), retryable))
                    .await;
            }
        }

        if let Some(parent_id) = self.record(&id).and_then(|r| r.parent_id) {
            self.aggregate_parent(&parent_id).await;
        }
    }

    async fn run_with_retry(
        &self,
        session: &Arc<Session>,
        id: &str,
        control: &TransferControl,
        progress_tx: mpsc::UnboundedSender<ProgressUpdate>,
    ) -> Result<u64, TransportError> {
        let retry = self.config.retry;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            if attempt > 1 {
                self.update(id, |r| r.mark_running()).await;
            }
            let result = self
                .run_attempt(session, id, control, progress_tx.clone())
                .await;
            match result {
                Ok(bytes) => return Ok(bytes),
                Err(TransportError::Cancelled) => return Err(TransportError::Cancelled),
                Err(e) if e.is_retryable() && attempt <= retry.max_retries => {
                    let backoff = calculate_backoff(attempt, &retry);
                    warn!(
                        transfer = %id,
                        attempt,
                        backoff_secs = backoff.as_secs(),
                        error = %e,
                        "retrying transfer"
                    );
                    let mut cancel_rx = control.subscribe_cancellation();
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = cancel_rx.changed() => {
                            if control.is_cancelled() {
                                return Err(TransportError::Cancelled);
                            }
                        }
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn run_attempt(
        &self,
        session: &Arc<Session>,
        id: &str,
        control: &TransferControl,
        progress_tx: mpsc::UnboundedSender<ProgressUpdate>,
    ) -> Result<u64, TransportError> {
        let record = self
            .record(id)
            .ok_or_else(|| TransportError::Io("record vanished".into()))?;
        let ctx = TransferContext {
            transfer_id: id.to_string(),
            chunk_size: self.config.chunk_size,
            io_timeout: Duration::from_secs(self.config.io_timeout_secs),
            control: control.clone(),
            progress: progress_tx,
        };

        if record.bulk {
            return Self::run_bulk(session, &record, &ctx).await;
        }

        let transport = session
            .transport()
            .map_err(|_| TransportError::Disconnected)?;

        match record.direction {
            TransferDirection::Upload => {
                let local = PathBuf::from(&record.source);
                // Pre-existence decides whether a cancelled partial may be
                // deleted. A file that was already there is never removed.
                let pre_existed = transport.stat(&record.destination).await.is_ok();
                transport::mkdir_all(
                    transport.as_ref(),
                    &crate::path::parent_remote(&record.destination),
                )
                .await?;
                let result = transport.upload(&local, &record.destination, &ctx).await;
                if matches!(result, Err(TransportError::Cancelled)) && !pre_existed {
                    if let Err(e) = transport.remove_file(&record.destination).await {
                        debug!(error = %e, "partial remote cleanup failed");
                    }
                }
                result
            }
            TransferDirection::Download => {
                let local = PathBuf::from(&record.destination);
                let pre_existed = local.exists();
                let result = transport.download(&record.source, &local, &ctx).await;
                if matches!(result, Err(TransportError::Cancelled)) && !pre_existed {
                    if let Err(e) = tokio::fs::remove_file(&local).await {
                        debug!(error = %e, "partial local cleanup failed");
                    }
                }
                result
            }
        }
    }

    async fn run_bulk(
        session: &Arc<Session>,
        record: &TransferRecord,
        ctx: &TransferContext,
    ) -> Result<u64, TransportError> {
        match record.direction {
            TransferDirection::Upload => {
                transport::bulk::sync_up(
                    &session.params,
                    &PathBuf::from(&record.source),
                    &record.destination,
                    ctx,
                )
                .await?
            }
            TransferDirection::Download => {
                transport::bulk::sync_down(
                    &session.params,
                    &record.source,
                    &PathBuf::from(&record.destination),
                    ctx,
                )
                .await?
            }
        }
        Ok(record.bytes_total)
    }

    /// Throttled progress fan-out with speed and ETA derivation.
    async fn report_progress(
        queue: Arc<Self>,
        mut rx: mpsc::UnboundedReceiver<ProgressUpdate>,
        interval: Duration,
    ) {
        let mut last_emit: Option<tokio::time::Instant> = None;
        let mut last_bytes = 0u64;
        let mut last_sample = tokio::time::Instant::now();
        while let Some(mut update) = rx.recv().await {
            let now = tokio::time::Instant::now();
            if last_emit.is_some_and(|t| now.duration_since(t) < interval) {
                continue;
            }
            let elapsed = now.duration_since(last_sample).as_secs_f64();
            if elapsed > 0.0 && update.bytes_done >= last_bytes {
                let speed = ((update.bytes_done - last_bytes) as f64 / elapsed) as u64;
                update.speed_bps = Some(speed);
                if speed > 0 && update.bytes_total >= update.bytes_done {
                    update.eta_secs = Some((update.bytes_total - update.bytes_done) / speed);
                }
            }
            last_emit = Some(now);
            last_sample = now;
            last_bytes = update.bytes_done;
            {
                let mut records = queue.records.write();
                if let Some(r) = records.get_mut(&update.transfer_id) {
                    r.bytes_done = update.bytes_done;
                    if r.bytes_total < update.bytes_total {
                        r.bytes_total = update.bytes_total;
                    }
                }
            }
            queue.events.emit(BridgeEvent::TransferProgress { update });
        }
    }

    /// Roll a directory parent up from its children: failed wins over
    /// cancelled wins over succeeded; unfinished children keep it running.
    async fn aggregate_parent(&self, parent_id: &str) {
        let children = self.children(parent_id);
        if children.is_empty() || children.iter().any(|c| !c.state.is_terminal()) {
            return;
        }
        let failed = children
            .iter()
            .filter(|c| c.state == TransferState::Failed)
            .count();
        let cancelled = children
            .iter()
            .filter(|c| c.state == TransferState::Cancelled)
            .count();
        let done: u64 = children.iter().map(|c| c.bytes_done).sum();
        self.finish(parent_id, |r| {
            r.bytes_done = done;
            if failed > 0 {
                r.mark_failed(format!("{failed} of {} items failed", children.len()), true);
            } else if cancelled > 0 {
                r.mark_cancelled();
            } else {
                r.mark_succeeded();
            }
        })
        .await;
    }

    pub async fn cancel(&self, id: &str) -> Result<(), BridgeError> {
        let record = self
            .record(id)
            .ok_or_else(|| BridgeError::UnknownTransfer(id.to_string()))?;
        if record.state.is_terminal() {
            return Ok(());
        }
        // Fan-out is one level deep: cancelling the parent settles every
        // child first so the aggregate verdict is Cancelled, not Failed.
        let children = self.children(id);
        for child in &children {
            if child.state.is_terminal() {
                continue;
            }
            if let Some(control) = self.controls.read().get(&child.id) {
                control.cancel();
            }
            if child.state == TransferState::Queued {
                self.finish(&child.id, |r| r.mark_cancelled()).await;
            }
        }
        if let Some(control) = self.controls.read().get(id) {
            control.cancel();
        }
        // Queued records have no worker to observe the flag; settle now. A
        // record with children is settled by aggregation only, so it can
        // never reach a terminal state ahead of a still-running child.
        if record.state == TransferState::Queued && children.is_empty() {
            self.finish(id, |r| r.mark_cancelled()).await;
        }
        // Children settled above have no worker to trigger aggregation;
        // running ones trigger it again from their own workers.
        if record.is_directory {
            self.aggregate_parent(id).await;
        } else if let Some(parent_id) = record.parent_id.as_deref() {
            if self.record(id).map(|r| r.state.is_terminal()).unwrap_or(false) {
                self.aggregate_parent(parent_id).await;
            }
        }
        Ok(())
    }

    pub fn pause(&self, id: &str) -> Result<(), BridgeError> {
        let control = self
            .controls
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| BridgeError::UnknownTransfer(id.to_string()))?;
        control.pause();
        let mut records = self.records.write();
        if let Some(r) = records.get_mut(id) {
            if r.state == TransferState::Running {
                r.state = TransferState::Paused;
                self.events
                    .emit(BridgeEvent::TransferUpdated { record: r.clone() });
            }
        }
        Ok(())
    }

    pub fn resume(&self, id: &str) -> Result<(), BridgeError> {
        let control = self
            .controls
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| BridgeError::UnknownTransfer(id.to_string()))?;
        control.resume();
        let mut records = self.records.write();
        if let Some(r) = records.get_mut(id) {
            if r.state == TransferState::Paused {
                r.state = TransferState::Running;
                self.events
                    .emit(BridgeEvent::TransferUpdated { record: r.clone() });
            }
        }
        Ok(())
    }

    /// Manual retry of a failed record. Automatic retries happen inside the
    /// worker; this is the user-facing second chance.
    pub async fn retry(&self, id: &str) -> Result<(), BridgeError> {
        let record = self
            .record(id)
            .ok_or_else(|| BridgeError::UnknownTransfer(id.to_string()))?;
        if record.state != TransferState::Failed {
            return Err(BridgeError::InvalidArgument(format!(
                "transfer {id} is not in a failed state"
            )));
        }
        let session = self.registry.get(&record.session_id)?;

        // A fan-out parent never runs itself; retrying it means requeueing
        // the children that failed and letting aggregation settle it again.
        if record.is_directory && !record.bulk {
            let failed: Vec<TransferRecord> = self
                .children(id)
                .into_iter()
                .filter(|c| c.state == TransferState::Failed)
                .collect();
            if failed.is_empty() {
                return Err(BridgeError::InvalidArgument(format!(
                    "directory {id} has no failed items to retry"
                )));
            }
            self.update(id, |r| {
                r.mark_requeued();
                r.mark_running();
            })
            .await;
            let tx = self.dispatcher_for(&session)?;
            for child in failed {
                self.controls
                    .write()
                    .insert(child.id.clone(), TransferControl::new());
                self.update(&child.id, |r| r.mark_requeued()).await;
                tx.send(child.id)
                    .map_err(|_| BridgeError::InvalidArgument("dispatcher gone".into()))?;
            }
            return Ok(());
        }

        // Fresh control: the old one may carry a cancel flag.
        self.controls
            .write()
            .insert(id.to_string(), TransferControl::new());
        self.update(id, |r| r.mark_requeued()).await;
        self.dispatcher_for(&session)?
            .send(id.to_string())
            .map_err(|_| BridgeError::InvalidArgument("dispatcher gone".into()))?;
        Ok(())
    }

    /// Called when a session drops: running transfers fail (retryable),
    /// queued ones stay queued and restart on reconnect.
    pub async fn handle_disconnect(&self, session_id: &str) {
        let running: Vec<String> = self
            .records
            .read()
            .values()
            .filter(|r| {
                r.session_id == session_id
                    && matches!(r.state, TransferState::Running | TransferState::Paused)
            })
            .map(|r| r.id.clone())
            .collect();
        for id in running {
            if let Some(control) = self.controls.read().get(&id) {
                // Unblock the worker; the terminal state below wins.
                control.cancel();
            }
            self.finish(&id, |r| r.mark_failed("session disconnected", true))
                .await;
        }
    }

    async fn update(&self, id: &str, f: impl FnOnce(&mut TransferRecord)) {
        let record = {
            let mut records = self.records.write();
            let Some(r) = records.get_mut(id) else { return };
            f(r);
            r.clone()
        };
        self.persist(&record).await;
        self.events.emit(BridgeEvent::TransferUpdated { record });
    }

    /// Like `update` but refuses to overwrite an already terminal state, so
    /// a late worker result cannot clobber a disconnect or cancel verdict.
    async fn finish(&self, id: &str, f: impl FnOnce(&mut TransferRecord)) {
        let record = {
            let mut records = self.records.write();
            let Some(r) = records.get_mut(id) else { return };
            if r.state.is_terminal() {
                return;
            }
            f(r);
            r.clone()
        };
        self.persist(&record).await;
        self.events.emit(BridgeEvent::TransferUpdated { record });
    }

    async fn persist(&self, record: &TransferRecord) {
        if let Err(e) = self.history.save(record).await {
            warn!(error = %e, transfer = %record.id, "failed to persist transfer record");
        }
        if record.state.is_terminal() {
            if let Err(e) = self
                .history
                .prune(
                    self.config.history_retention,
                    self.config.history_max_age_days,
                )
                .await
            {
                warn!(error = %e, "history prune failed");
            }
        }
    }
}

/// Exponential backoff with a cap.
pub fn calculate_backoff(attempt: u32, retry: &crate::config::RetryConfig) -> Duration {
    let secs = retry.initial_backoff_secs as f64
        * retry.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);
    Duration::from_secs((secs as u64).min(retry.max_backoff_secs))
}

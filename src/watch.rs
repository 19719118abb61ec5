//! Filesystem watching for shadow files. Editors produce bursts of events
//! per save (truncate, write, rename, metadata); a per-path debounce map
//! collapses each burst into one upload once the path has been quiet for the
//! configured interval.

use crate::error::BridgeError;
use crate::shadow::ShadowStore;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub struct WatchDispatcher {
    // Kept alive; dropping it stops the notify backend.
    _watcher: RecommendedWatcher,
}

impl WatchDispatcher {
    /// Watch the shadow root recursively and drive debounced flushes into
    /// the shadow store.
    pub fn spawn(shadow: Arc<ShadowStore>, debounce: Duration) -> Result<Self, BridgeError> {
        let root = shadow.shadow_root().to_path_buf();
        std::fs::create_dir_all(&root)
            .map_err(|e| BridgeError::InvalidArgument(format!("shadow root: {e}")))?;

        let (tx, rx) = mpsc::unbounded_channel::<PathBuf>();
        let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            match res {
                Ok(event) => {
                    if !matches!(
                        event.kind,
                        EventKind::Create(_) | EventKind::Modify(_)
                    ) {
                        return;
                    }
                    for path in event.paths {
                        let _ = tx.send(path);
                    }
                }
                Err(e) => warn!(error = %e, "watcher error"),
            }
        })
        .map_err(|e| BridgeError::InvalidArgument(format!("cannot create watcher: {e}")))?;
        watcher
            .watch(&root, RecursiveMode::Recursive)
            .map_err(|e| BridgeError::InvalidArgument(format!("cannot watch {}: {e}", root.display())))?;

        tokio::spawn(Self::debounce_loop(shadow, rx, debounce));
        Ok(Self { _watcher: watcher })
    }

    async fn debounce_loop(
        shadow: Arc<ShadowStore>,
        mut rx: mpsc::UnboundedReceiver<PathBuf>,
        debounce: Duration,
    ) {
        let tick = debounce.min(Duration::from_millis(100)).max(Duration::from_millis(10));
        let mut interval = tokio::time::interval(tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // path -> instant of the latest event in the burst
        let mut pending: HashMap<PathBuf, tokio::time::Instant> = HashMap::new();

        loop {
            tokio::select! {
                event = rx.recv() => match event {
                    Some(path) => {
                        pending.insert(path, tokio::time::Instant::now());
                    }
                    None => return,
                },
                _ = interval.tick() => {
                    if pending.is_empty() {
                        continue;
                    }
                    let now = tokio::time::Instant::now();
                    let quiet: Vec<PathBuf> = pending
                        .iter()
                        .filter(|(_, &t)| now.duration_since(t) >= debounce)
                        .map(|(p, _)| p.clone())
                        .collect();
                    for path in quiet {
                        pending.remove(&path);
                        match shadow.notify_local_change(&path).await {
                            Ok(Some(transfer_id)) => {
                                debug!(path = %path.display(), %transfer_id, "save flushed to upload");
                            }
                            Ok(None) => {}
                            // Conflict already emitted an event; nothing to do here.
                            Err(e) => debug!(path = %path.display(), error = %e, "flush blocked"),
                        }
                    }
                }
            }
        }
    }
}

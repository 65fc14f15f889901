//! Hot reload of extensions whose bundles change on disk.
//!
//! File-system events are collected into a pending set and flushed once no
//! new event has arrived for the debounce window. A flush rediscovers the
//! extension root and reloads every loaded extension whose bundle changed.

use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::ExtensionError;
use crate::lifecycle::{BatchReport, LifecycleController};

type WatchResult = notify::Result<Event>;

/// Reload every loaded extension whose bundle contains one of `paths`.
///
/// The catalog is refreshed first so edited manifests are picked up.
pub async fn apply_changes(controller: &LifecycleController, paths: &[PathBuf]) -> BatchReport {
    if let Err(e) = controller.discover().await {
        tracing::warn!("rediscovery before reload failed: {e}");
    }

    let mut ids = BTreeSet::new();
    for path in paths {
        if let Some(id) = controller.bundle_for_path(path).await {
            ids.insert(id);
        }
    }

    let mut report = BatchReport::default();
    for id in ids {
        if !controller.is_loaded(&id).await {
            continue;
        }
        match controller.reload(&id).await {
            Ok(()) => {
                tracing::info!(extension = %id, "hot reload complete");
                report.succeeded.push(id);
            }
            Err(e) => {
                tracing::error!(extension = %id, "hot reload failed: {e}");
                report.failed.push(crate::lifecycle::BatchFailure {
                    identifier: id,
                    error: e.to_string(),
                });
            }
        }
    }
    report
}

fn is_relevant(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_) | EventKind::Any
    )
}

/// Watches the extension root and drives reloads through the controller.
pub struct HotReloadWatcher {
    controller: Arc<LifecycleController>,
    /// Canonical form of the controller root, as reported by notify.
    watch_root: PathBuf,
    events_tx: mpsc::UnboundedSender<WatchResult>,
    watcher: StdMutex<Option<RecommendedWatcher>>,
    enabled: Arc<AtomicBool>,
    stop: CancellationToken,
    task: StdMutex<Option<JoinHandle<()>>>,
}

impl HotReloadWatcher {
    /// Start watching `controller.root()` recursively.
    pub fn start(
        controller: Arc<LifecycleController>,
        debounce: Duration,
    ) -> Result<Self, ExtensionError> {
        std::fs::create_dir_all(controller.root())?;
        let watch_root = std::fs::canonicalize(controller.root())?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let enabled = Arc::new(AtomicBool::new(false));
        let stop = CancellationToken::new();

        let task = tokio::spawn(run(
            Arc::clone(&controller),
            watch_root.clone(),
            events_rx,
            Arc::clone(&enabled),
            stop.clone(),
            debounce,
        ));

        let this = Self {
            controller,
            watch_root,
            events_tx,
            watcher: StdMutex::new(None),
            enabled,
            stop,
            task: StdMutex::new(Some(task)),
        };
        this.rewatch()?;
        Ok(this)
    }

    /// (Re-)establish the file-system watch and re-enable automatic reload.
    pub fn rewatch(&self) -> Result<(), ExtensionError> {
        let events_tx = self.events_tx.clone();
        let mut watcher = RecommendedWatcher::new(
            move |result| {
                if events_tx.send(result).is_err() {
                    tracing::trace!("watch event after watcher shutdown, dropped");
                }
            },
            Config::default(),
        )?;
        watcher.watch(&self.watch_root, RecursiveMode::Recursive)?;

        *self
            .watcher
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(watcher);
        self.enabled.store(true, Ordering::SeqCst);
        tracing::info!(root = %self.watch_root.display(), "watching extension root");
        Ok(())
    }

    /// Whether changes currently trigger reloads.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn controller(&self) -> &Arc<LifecycleController> {
        &self.controller
    }

    /// Stop watching and wait for the event task to finish.
    pub async fn stop(&self) {
        self.stop.cancel();
        self.watcher
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let task = self
            .task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    #[cfg(test)]
    fn inject(&self, result: WatchResult) {
        let _ = self.events_tx.send(result);
    }
}

impl Drop for HotReloadWatcher {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

/// Map a path reported by notify back under the controller's root.
fn rebase(path: &Path, watch_root: &Path, root: &Path) -> PathBuf {
    match path.strip_prefix(watch_root) {
        Ok(rest) => root.join(rest),
        Err(_) => path.to_path_buf(),
    }
}

async fn run(
    controller: Arc<LifecycleController>,
    watch_root: PathBuf,
    mut events_rx: mpsc::UnboundedReceiver<WatchResult>,
    enabled: Arc<AtomicBool>,
    stop: CancellationToken,
    debounce: Duration,
) {
    let mut pending: HashSet<PathBuf> = HashSet::new();
    let mut deadline: Option<Instant> = None;

    loop {
        let settle_at = deadline;
        let settle = async move {
            match settle_at {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            _ = stop.cancelled() => break,
            msg = events_rx.recv() => match msg {
                None => break,
                Some(Ok(event)) => {
                    if !is_relevant(&event.kind) || !enabled.load(Ordering::SeqCst) {
                        continue;
                    }
                    pending.extend(
                        event
                            .paths
                            .iter()
                            .map(|p| rebase(p, &watch_root, controller.root())),
                    );
                    deadline = Some(Instant::now() + debounce);
                }
                Some(Err(e)) => {
                    tracing::error!("extension watcher failed, hot reload disabled: {e}");
                    enabled.store(false, Ordering::SeqCst);
                    pending.clear();
                    deadline = None;
                }
            },
            _ = settle => {
                deadline = None;
                let paths: Vec<PathBuf> = pending.drain().collect();
                if !enabled.load(Ordering::SeqCst) {
                    continue;
                }
                tracing::debug!(paths = paths.len(), "extension changes settled");
                let report = apply_changes(&controller, &paths).await;
                if !report.failed.is_empty() {
                    tracing::warn!(failed = report.failed.len(), "some hot reloads failed");
                }
            }
        }
    }
    tracing::debug!("extension watcher stopped");
}

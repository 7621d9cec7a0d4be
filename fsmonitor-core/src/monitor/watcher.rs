//! Real-time watcher adapters
//!
//! One adapter per backing store subscribes to native change notifications,
//! maps them to candidate file events, and hands them to the shared
//! debouncer. Pause suppresses intake without tearing down the native
//! subscription, so resume cannot miss a re-subscription window; events
//! arriving while paused are dropped by design.

use crate::error::{MonitorError, Result};
use crate::monitor::{Debouncer, EventType, FileEvent, PathFilters};
use crate::storage::{ChangeKind, StorageProvider};
use async_trait::async_trait;
use notify::{Event as NotifyEvent, EventKind, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Location-specific real-time watching capability.
#[async_trait]
pub trait LocationWatcher: Send + Sync {
    async fn start(&self) -> Result<()>;

    async fn stop(&self);

    /// Suppress event intake; the native subscription stays alive.
    fn pause(&self);

    fn resume(&self);

    fn is_watching(&self) -> bool;
}

/// Resolve a native change notification to a candidate file event.
///
/// The native kind maps directly to the event type; metadata and checksum
/// are fetched fresh, skipped for deletions. A fetch failure (the file may
/// already be gone again) drops the notification.
async fn resolve_change(
    location: &str,
    provider: &Arc<dyn StorageProvider>,
    path: &str,
    kind: ChangeKind,
    skip_checksum: bool,
    cancel: &CancellationToken,
) -> Option<FileEvent> {
    let event_type = match kind {
        ChangeKind::Created => EventType::Added,
        ChangeKind::Modified => EventType::Changed,
        ChangeKind::Removed => return Some(FileEvent::deleted(location, path)),
    };
    let meta = match provider.get_metadata(path, cancel).await {
        Ok(meta) => meta,
        Err(err) => {
            debug!(path, %err, "dropping native event, metadata fetch failed");
            return None;
        }
    };
    let checksum = if skip_checksum {
        String::new()
    } else {
        match provider.get_checksum(path, cancel).await {
            Ok(checksum) => checksum,
            Err(err) => {
                debug!(path, %err, "dropping native event, checksum fetch failed");
                return None;
            }
        }
    };
    Some(FileEvent::new(
        location,
        path,
        event_type,
        Some(meta.len),
        Some(meta.modified),
        checksum,
    ))
}

/// Shared per-event handling for both adapters.
struct WatchPump {
    location: String,
    provider: Arc<dyn StorageProvider>,
    debouncer: Arc<Debouncer>,
    filters: PathFilters,
    skip_checksum: bool,
    suppressed: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl WatchPump {
    async fn handle(&self, path: &str, kind: ChangeKind) {
        if self.suppressed.load(Ordering::Acquire) {
            return;
        }
        if !self.filters.matches(path) {
            return;
        }
        if let Some(event) = resolve_change(
            &self.location,
            &self.provider,
            path,
            kind,
            self.skip_checksum,
            &self.cancel,
        )
        .await
        {
            self.debouncer.offer(event).await;
        }
    }
}

fn relative_path(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<String> =
        rel.components().map(|c| c.as_os_str().to_string_lossy().into_owned()).collect();
    if parts.is_empty() { None } else { Some(parts.join("/")) }
}

struct LocalWatchTask {
    // Held to keep the native subscription alive.
    _watcher: notify::RecommendedWatcher,
    pump: JoinHandle<()>,
    cancel: CancellationToken,
}

/// Watcher backed by native OS notifications over a local directory.
pub struct LocalFsWatcher {
    location: String,
    provider: Arc<dyn StorageProvider>,
    root: PathBuf,
    debouncer: Arc<Debouncer>,
    filters: PathFilters,
    skip_checksum: bool,
    suppressed: Arc<AtomicBool>,
    state: Mutex<Option<LocalWatchTask>>,
}

impl LocalFsWatcher {
    /// Fails fast when the provider has no local root to subscribe to.
    pub fn new(
        location: impl Into<String>,
        provider: Arc<dyn StorageProvider>,
        debouncer: Arc<Debouncer>,
        filters: PathFilters,
        skip_checksum: bool,
    ) -> Result<Self> {
        let location = location.into();
        let root = provider
            .local_root()
            .ok_or_else(|| {
                MonitorError::misconfigured(
                    &location,
                    "local filesystem watcher requires a provider with a local root",
                )
            })?
            .to_path_buf();
        Ok(Self {
            location,
            provider,
            root,
            debouncer,
            filters,
            skip_checksum,
            suppressed: Arc::new(AtomicBool::new(false)),
            state: Mutex::new(None),
        })
    }
}

fn native_kind(kind: &EventKind) -> Option<ChangeKind> {
    match kind {
        EventKind::Create(_) => Some(ChangeKind::Created),
        EventKind::Modify(_) => Some(ChangeKind::Modified),
        EventKind::Remove(_) => Some(ChangeKind::Removed),
        _ => None,
    }
}

#[async_trait]
impl LocationWatcher for LocalFsWatcher {
    async fn start(&self) -> Result<()> {
        if self.is_watching() {
            return Ok(());
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<(PathBuf, ChangeKind)>();
        let mut watcher = notify::recommended_watcher(
            move |res: std::result::Result<NotifyEvent, notify::Error>| match res {
                Ok(event) => {
                    if let Some(kind) = native_kind(&event.kind) {
                        for path in event.paths {
                            let _ = tx.send((path, kind));
                        }
                    }
                }
                Err(err) => error!(%err, "native watch error"),
            },
        )?;
        watcher.watch(&self.root, RecursiveMode::Recursive)?;
        info!(location = %self.location, root = %self.root.display(), "watching local root");

        let cancel = CancellationToken::new();
        let pump_state = WatchPump {
            location: self.location.clone(),
            provider: self.provider.clone(),
            debouncer: self.debouncer.clone(),
            filters: self.filters.clone(),
            skip_checksum: self.skip_checksum,
            suppressed: self.suppressed.clone(),
            cancel: cancel.clone(),
        };
        let root = self.root.clone();
        let pump_cancel = cancel.clone();
        let pump = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = pump_cancel.cancelled() => break,
                    received = rx.recv() => {
                        let Some((path, kind)) = received else { break };
                        // Directory events carry no file-level meaning here.
                        if kind != ChangeKind::Removed && path.is_dir() {
                            continue;
                        }
                        if let Some(rel) = relative_path(&root, &path) {
                            pump_state.handle(&rel, kind).await;
                        }
                    }
                }
            }
        });

        *self.state.lock().unwrap() =
            Some(LocalWatchTask { _watcher: watcher, pump, cancel });
        Ok(())
    }

    async fn stop(&self) {
        let task = self.state.lock().unwrap().take();
        if let Some(task) = task {
            task.cancel.cancel();
            let _ = task.pump.await;
        }
    }

    fn pause(&self) {
        self.suppressed.store(true, Ordering::Release);
    }

    fn resume(&self) {
        self.suppressed.store(false, Ordering::Release);
    }

    fn is_watching(&self) -> bool {
        self.state.lock().unwrap().is_some()
    }
}

/// Watcher backed by a provider's in-process broadcast change feed.
pub struct BroadcastWatcher {
    location: String,
    provider: Arc<dyn StorageProvider>,
    debouncer: Arc<Debouncer>,
    filters: PathFilters,
    skip_checksum: bool,
    suppressed: Arc<AtomicBool>,
    state: Mutex<Option<(JoinHandle<()>, CancellationToken)>>,
}

impl BroadcastWatcher {
    /// Fails fast when the provider exposes no change feed.
    pub fn new(
        location: impl Into<String>,
        provider: Arc<dyn StorageProvider>,
        debouncer: Arc<Debouncer>,
        filters: PathFilters,
        skip_checksum: bool,
    ) -> Result<Self> {
        let location = location.into();
        if !provider.supports_notifications() {
            return Err(MonitorError::misconfigured(
                &location,
                "provider does not support change notifications",
            ));
        }
        Ok(Self {
            location,
            provider,
            debouncer,
            filters,
            skip_checksum,
            suppressed: Arc::new(AtomicBool::new(false)),
            state: Mutex::new(None),
        })
    }
}

#[async_trait]
impl LocationWatcher for BroadcastWatcher {
    async fn start(&self) -> Result<()> {
        if self.is_watching() {
            return Ok(());
        }
        let mut rx = self.provider.subscribe_changes().ok_or_else(|| {
            MonitorError::misconfigured(&self.location, "provider exposes no change feed")
        })?;
        info!(location = %self.location, "subscribed to provider change feed");

        let cancel = CancellationToken::new();
        let pump_state = WatchPump {
            location: self.location.clone(),
            provider: self.provider.clone(),
            debouncer: self.debouncer.clone(),
            filters: self.filters.clone(),
            skip_checksum: self.skip_checksum,
            suppressed: self.suppressed.clone(),
            cancel: cancel.clone(),
        };
        let pump_cancel = cancel.clone();
        let pump = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = pump_cancel.cancelled() => break,
                    received = rx.recv() => match received {
                        Ok(change) => pump_state.handle(&change.path, change.kind).await,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(missed, "change feed lagged, events dropped");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });

        *self.state.lock().unwrap() = Some((pump, cancel));
        Ok(())
    }

    async fn stop(&self) {
        let task = self.state.lock().unwrap().take();
        if let Some((pump, cancel)) = task {
            cancel.cancel();
            let _ = pump.await;
        }
    }

    fn pause(&self) {
        self.suppressed.store(true, Ordering::Release);
    }

    fn resume(&self) {
        self.suppressed.store(false, Ordering::Release);
    }

    fn is_watching(&self) -> bool {
        self.state.lock().unwrap().is_some()
    }
}

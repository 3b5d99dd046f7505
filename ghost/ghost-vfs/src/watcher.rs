//! File-change watcher with debouncing and change coalescing.
//!
//! Watches `data/global` and `data/bots` under the data root. When a file is
//! touched by something other than Ghost itself (an editor, a git checkout),
//! its cache entries are invalidated and the relative path is published to
//! subscribers.

use crate::cache::{ObjectCache, buffer_key, object_key};
use crate::path::GhostPath;
use dashmap::DashMap;
use ghost_core::{GhostError, Result};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, trace, warn};

/// Trees watched under the data root.
pub const WATCHED_TREES: &[&str] = &["data/global", "data/bots"];

const CHANGE_CHANNEL_CAPACITY: usize = 1024;

/// A debounced change, carrying the path relative to the data root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileEvent {
    Created(String),
    Modified(String),
    Deleted(String),
}

impl FileEvent {
    pub fn path(&self) -> &str {
        match self {
            Self::Created(p) | Self::Modified(p) | Self::Deleted(p) => p,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RawKind {
    Created,
    Modified,
    Deleted,
}

#[derive(Debug, Clone)]
struct PendingEvent {
    kind: RawKind,
    last_updated: Instant,
}

/// Installs the OS watcher and owns the change channel.
pub struct FileChangeWatcher {
    data_root: PathBuf,
    cache: Arc<dyn ObjectCache>,
    debounce: Duration,
    changes: broadcast::Sender<FileEvent>,
}

impl FileChangeWatcher {
    pub fn new(data_root: impl Into<PathBuf>, cache: Arc<dyn ObjectCache>, debounce: Duration) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            data_root: data_root.into(),
            cache,
            debounce,
            changes,
        }
    }

    /// Receive every debounced change after cache invalidation.
    pub fn subscribe(&self) -> broadcast::Receiver<FileEvent> {
        self.changes.subscribe()
    }

    /// Start watching. Dropping the returned handle stops the watcher.
    pub async fn start(&self) -> Result<WatcherHandle> {
        let root = self.data_root.clone();
        let mut watched = Vec::with_capacity(WATCHED_TREES.len());
        for tree in WATCHED_TREES {
            let dir = root.join(tree);
            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(|e| GhostError::watcher(format!("Failed to create {}: {}", dir.display(), e)))?;
            watched.push(dir);
        }

        // notify may report canonical paths (e.g. /private/var on macOS).
        let canonical_root = tokio::fs::canonicalize(&root).await.unwrap_or_else(|_| root.clone());

        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                for item in convert_event(event) {
                    let _ = raw_tx.send(item);
                }
            }
            Err(e) => warn!("File watcher error: {}", e),
        })
        .map_err(|e| GhostError::watcher(format!("Failed to create watcher: {}", e)))?;

        for dir in &watched {
            watcher
                .watch(dir, RecursiveMode::Recursive)
                .map_err(|e| GhostError::watcher(format!("Failed to watch {}: {}", dir.display(), e)))?;
        }

        let task = tokio::spawn(coalesce_events(
            raw_rx,
            Roots {
                root,
                canonical: canonical_root,
            },
            Arc::clone(&self.cache),
            self.changes.clone(),
            self.debounce,
        ));

        info!(
            "File watcher started on {} (debounce {:?})",
            self.data_root.display(),
            self.debounce
        );

        Ok(WatcherHandle {
            watcher: Some(watcher),
            task: Some(task),
        })
    }
}

/// Running watcher. Stops on [`WatcherHandle::stop`] or drop.
pub struct WatcherHandle {
    watcher: Option<RecommendedWatcher>,
    task: Option<JoinHandle<()>>,
}

impl WatcherHandle {
    pub fn stop(mut self) {
        self.shutdown();
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    fn shutdown(&mut self) {
        self.watcher.take();
        if let Some(task) = self.task.take() {
            task.abort();
            debug!("File watcher stopped");
        }
    }
}

impl Drop for WatcherHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct Roots {
    root: PathBuf,
    canonical: PathBuf,
}

impl Roots {
    fn relative(&self, path: &Path) -> Option<String> {
        GhostPath::from_physical(path, &self.root)
            .or_else(|_| GhostPath::from_physical(path, &self.canonical))
            .ok()
            .map(|p| p.to_string())
    }
}

async fn coalesce_events(
    mut raw_rx: mpsc::UnboundedReceiver<(PathBuf, RawKind)>,
    roots: Roots,
    cache: Arc<dyn ObjectCache>,
    changes: broadcast::Sender<FileEvent>,
    debounce: Duration,
) {
    let pending: DashMap<PathBuf, PendingEvent> = DashMap::new();
    let mut ticker = interval(debounce.max(Duration::from_millis(10)));

    loop {
        tokio::select! {
            raw = raw_rx.recv() => {
                let Some((path, kind)) = raw else { break };
                let now = Instant::now();
                match pending.get_mut(&path) {
                    Some(mut existing) => {
                        existing.kind = merge_kinds(existing.kind, kind);
                        existing.last_updated = now;
                        trace!("Coalesced event for {}", path.display());
                    }
                    None => {
                        pending.insert(path, PendingEvent { kind, last_updated: now });
                    }
                }
            }
            _ = ticker.tick() => {
                let now = Instant::now();
                let mut ready = Vec::new();
                pending.retain(|path, event| {
                    if now.duration_since(event.last_updated) >= debounce {
                        ready.push((path.clone(), event.kind));
                        false
                    } else {
                        true
                    }
                });

                for (path, kind) in ready {
                    let Some(relative) = roots.relative(&path) else {
                        trace!("Ignoring change outside data root: {}", path.display());
                        continue;
                    };
                    invalidate(cache.as_ref(), &relative).await;

                    let event = match kind {
                        RawKind::Created => FileEvent::Created(relative),
                        RawKind::Modified => FileEvent::Modified(relative),
                        RawKind::Deleted => FileEvent::Deleted(relative),
                    };
                    debug!("File changed outside Ghost: {:?}", event);
                    let _ = changes.send(event);
                }
            }
        }
    }
}

/// Drop the entries of a file, or of every file under it when it was a folder.
async fn invalidate(cache: &dyn ObjectCache, relative: &str) {
    cache.invalidate(&buffer_key(relative)).await;
    cache.invalidate(&object_key(relative)).await;
    cache.invalidate_starting_with(&format!("{}/", relative)).await;
}

fn merge_kinds(old: RawKind, new: RawKind) -> RawKind {
    match (old, new) {
        (RawKind::Created, RawKind::Modified) => RawKind::Created,
        (RawKind::Deleted, RawKind::Created) => RawKind::Modified,
        (_, new) => new,
    }
}

fn convert_event(event: Event) -> Vec<(PathBuf, RawKind)> {
    let kind = match event.kind {
        EventKind::Create(_) => RawKind::Created,
        EventKind::Modify(notify::event::ModifyKind::Name(_)) if event.paths.len() >= 2 => {
            // Rename: the source disappears, the target appears.
            let mut paths = event.paths.into_iter();
            let mut out = Vec::with_capacity(2);
            if let Some(from) = paths.next() {
                out.push((from, RawKind::Deleted));
            }
            if let Some(to) = paths.next() {
                out.push((to, RawKind::Created));
            }
            return out;
        }
        EventKind::Modify(_) => RawKind::Modified,
        EventKind::Remove(_) => RawKind::Deleted,
        _ => return Vec::new(),
    };
    event.paths.into_iter().map(|p| (p, kind)).collect()
}

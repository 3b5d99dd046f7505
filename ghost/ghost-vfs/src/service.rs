//! Ghost service: registry of scoped services and cross-scope operations.
//!
//! Scopes are created lazily and memoized (`global`, `bots`, one per bot);
//! `root` and `custom` scopes are built fresh on every call. The registry
//! also owns the bulk algorithms that span scopes: the first-boot disk to
//! database sync, change-set computation against a local tree, forced
//! overwrites and whole-instance archives.

use crate::archive;
use crate::cache::{CacheEvent, MemoryObjectCache, ObjectCache, buffer_key, object_key};
use crate::diff::describe_edit;
use crate::driver::{DatabaseStorageDriver, DiskStorageDriver, StorageDriver};
use crate::glob::{BULK_IGNORED_FILES, DEFAULT_LISTING_PATTERN, GlobFilter};
use crate::lock::LockOptions;
use crate::path::GhostPath;
use crate::scoped::{BOT_CONFIG_FILE, ScopeLimits, ScopeOptions, ScopedGhost, log_cleanup_error};
use crate::types::{
    FileChange, FileChangeAction, FileRevision, ForceUpdateReport, ListingOptions,
    ReplaceContent, ScopedChange, ServerWidePendingRevisions, SyncRequest,
};
use crate::watcher::{FileChangeWatcher, FileEvent, WatcherHandle};
use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use ghost_core::{GhostConfig, GhostError, Result};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub const ROOT_DIR: &str = "data";
pub const GLOBAL_DIR: &str = "data/global";
pub const BOTS_DIR: &str = "data/bots";

/// Stands in for `/bots/<id>/` in exported bot archives.
pub const BOT_ID_PLACEHOLDER: &str = "/bots/BOT_ID_PLACEHOLDER/";

/// Exported bots leave out trained models and installed packages.
const BOT_EXPORT_EXCLUDES: &[&str] = &["models/**", "libraries/node_modules/**"];

const MAX_BOT_ID_LEN: usize = 50;

/// Bot ids start with a letter or digit, continue with letters, digits,
/// `-` or `_`, and are at most 50 characters long.
pub fn is_valid_bot_id(bot_id: &str) -> bool {
    let mut chars = bot_id.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    bot_id.len() <= MAX_BOT_ID_LEN
        && first.is_ascii_alphanumeric()
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

pub struct GhostService {
    config: GhostConfig,
    disk: Arc<DiskStorageDriver>,
    db: Option<Arc<DatabaseStorageDriver>>,
    cache: Arc<dyn ObjectCache>,
    limits: ScopeLimits,
    use_db: AtomicBool,
    scopes: DashMap<String, Arc<ScopedGhost>>,
    sync_listener: Mutex<Option<JoinHandle<()>>>,
    watcher: Mutex<Option<(FileChangeWatcher, WatcherHandle)>>,
}

impl GhostService {
    pub fn new(
        config: GhostConfig,
        db: Option<DatabaseStorageDriver>,
        cache: Arc<dyn ObjectCache>,
    ) -> Result<Self> {
        config.validate()?;

        let disk = DiskStorageDriver::new(
            config.storage.data_root.clone(),
            LockOptions::from(&config.lock),
        )
        .with_ignore_file(config.ignore_file_path());
        let limits = ScopeLimits::from_config(&config)?;
        let use_db = config.storage.use_db_driver && db.is_some();

        Ok(Self {
            config,
            disk: Arc::new(disk),
            db: db.map(Arc::new),
            cache,
            limits,
            use_db: AtomicBool::new(use_db),
            scopes: DashMap::new(),
            sync_listener: Mutex::new(None),
            watcher: Mutex::new(None),
        })
    }

    /// Connect the database and build an in-memory cache from `config`.
    pub async fn from_config(config: GhostConfig) -> Result<Self> {
        let db = DatabaseStorageDriver::connect(
            &config.storage.database_url,
            config.storage.max_connections,
        )
        .await?;
        let cache = Arc::new(MemoryObjectCache::new(config.cache_size_bytes()? as usize));
        Self::new(config, Some(db), cache)
    }

    pub fn config(&self) -> &GhostConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<dyn ObjectCache> {
        &self.cache
    }

    pub fn uses_db(&self) -> bool {
        self.use_db.load(Ordering::Acquire)
    }

    fn database(&self) -> Result<&Arc<DatabaseStorageDriver>> {
        self.db
            .as_ref()
            .ok_or_else(|| GhostError::config("No database is configured"))
    }

    /// Select the primary backend and, on first boot with an empty database,
    /// copy the global and bots trees from disk.
    pub async fn initialize(&self, use_db: bool, ignore_sync: bool) -> Result<()> {
        if use_db {
            self.database()?;
        }
        let previous = self.use_db.swap(use_db, Ordering::AcqRel);
        self.scopes.clear();
        if previous != use_db {
            // Cached entries were read through the other backend.
            self.cache.invalidate_starting_with(&format!("{}/", ROOT_DIR)).await;
            debug!("Primary backend switched, cache cleared under {}", ROOT_DIR);
        }

        if !use_db || ignore_sync {
            return Ok(());
        }

        let existing = self
            .global()?
            .directory_listing("/", "*", ListingOptions::default())
            .await?;
        if existing.is_empty() {
            info!("Database is empty, syncing local files");
            self.global()?.sync().await?;
            self.bots()?.sync().await?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Scopes
    // ------------------------------------------------------------------------

    fn build_scope(&self, base_dir: &str, use_db: bool, options: ScopeOptions) -> Result<ScopedGhost> {
        ScopedGhost::new(
            base_dir,
            Arc::clone(&self.disk),
            self.db.clone(),
            use_db,
            Arc::clone(&self.cache),
            options,
            self.limits.clone(),
        )
    }

    fn memoized<F>(&self, key: String, build: F) -> Result<Arc<ScopedGhost>>
    where
        F: FnOnce() -> Result<ScopedGhost>,
    {
        if let Some(scope) = self.scopes.get(&key) {
            return Ok(Arc::clone(scope.value()));
        }
        let scope = Arc::new(build()?);
        Ok(Arc::clone(self.scopes.entry(key).or_insert(scope).value()))
    }

    /// The whole `data` tree. Never memoized.
    pub fn root(&self, use_db: Option<bool>) -> Result<Arc<ScopedGhost>> {
        let use_db = use_db.unwrap_or_else(|| self.uses_db());
        Ok(Arc::new(self.build_scope(ROOT_DIR, use_db, ScopeOptions::default())?))
    }

    pub fn global(&self) -> Result<Arc<ScopedGhost>> {
        self.memoized("global".to_string(), || {
            self.build_scope(GLOBAL_DIR, self.uses_db(), ScopeOptions::default())
        })
    }

    pub fn bots(&self) -> Result<Arc<ScopedGhost>> {
        self.memoized("bots".to_string(), || {
            self.build_scope(BOTS_DIR, self.uses_db(), ScopeOptions::default())
        })
    }

    pub fn for_bot(&self, bot_id: &str) -> Result<Arc<ScopedGhost>> {
        if !is_valid_bot_id(bot_id) {
            return Err(GhostError::InvalidBotId(bot_id.to_string()));
        }
        self.memoized(format!("bot:{}", bot_id), || {
            let options = ScopeOptions {
                bot_id: Some(bot_id.to_string()),
                no_sanitize: false,
            };
            self.build_scope(&format!("{}/{}", BOTS_DIR, bot_id), self.uses_db(), options)
        })
    }

    /// A disk-only scope over an arbitrary tree. Never memoized.
    pub fn custom(&self, base_dir: &Path) -> Result<Arc<ScopedGhost>> {
        let base = base_dir.to_str().ok_or_else(|| {
            GhostError::invalid_path(format!("{} is not valid UTF-8", base_dir.display()))
        })?;
        let options = ScopeOptions {
            bot_id: None,
            no_sanitize: true,
        };
        Ok(Arc::new(self.build_scope(base, false, options)?))
    }

    /// A database-backed view used as the remote side of change sets.
    fn remote(&self, base_dir: &str) -> Result<ScopedGhost> {
        self.database()?;
        self.build_scope(base_dir, true, ScopeOptions::default())
    }

    /// Detach the bot's listeners and forget its scope.
    pub fn unmount_bot(&self, bot_id: &str) {
        if let Some((_, scope)) = self.scopes.remove(&format!("bot:{}", bot_id)) {
            scope.detach_listeners();
            debug!("Unmounted bot {}", bot_id);
        }
    }

    async fn invalidate_path(&self, path: &str) {
        self.cache.invalidate(&object_key(path)).await;
        self.cache.invalidate(&buffer_key(path)).await;
    }

    // ------------------------------------------------------------------------
    // Change sets
    // ------------------------------------------------------------------------

    /// Compare the tree under `tmp_dir` (laid out as `data/global`,
    /// `data/bots/<id>`) against the database.
    ///
    /// Returns one entry per bot found on either side, then the global scope.
    pub async fn list_file_changes(&self, tmp_dir: &Path) -> Result<Vec<ScopedChange>> {
        let local_bots = self.custom(&tmp_dir.join(BOTS_DIR))?;
        let remote_bots = self.remote(BOTS_DIR)?;

        let mut bot_ids = BTreeSet::new();
        for scope in [local_bots.as_ref(), &remote_bots] {
            let configs = scope
                .directory_listing("/", BOT_CONFIG_FILE, ListingOptions::default())
                .await?;
            bot_ids.extend(configs.iter().filter_map(|p| bot_dir_of(p)));
        }

        let mut result = Vec::with_capacity(bot_ids.len() + 1);
        for bot_id in bot_ids {
            let prefix = format!("{}/{}", BOTS_DIR, bot_id);
            let local = self.custom(&tmp_dir.join(&prefix))?;
            let remote = self.remote(&prefix)?;
            result.push(diff_scope(&local, &remote, &prefix, Some(bot_id)).await?);
        }

        let local = self.custom(&tmp_dir.join(GLOBAL_DIR))?;
        let remote = self.remote(GLOBAL_DIR)?;
        result.push(diff_scope(&local, &remote, GLOBAL_DIR, None).await?);

        Ok(result)
    }

    /// Make the database match the tree under `tmp_dir`, whatever the state
    /// of the revision log.
    pub async fn force_update(&self, tmp_dir: &Path) -> Result<ForceUpdateReport> {
        let started = Instant::now();
        let db = Arc::clone(self.database()?);
        let mut report = ForceUpdateReport::default();

        let revisions = db.list_revisions(ROOT_DIR).await?;
        for rev in &revisions {
            log_cleanup_error(
                "Deleting revision",
                db.delete_revision(&rev.path, &rev.revision).await,
            );
        }
        debug!("Cleared {} revisions", revisions.len());

        let changes = self.list_file_changes(tmp_dir).await?;
        for scope in &changes {
            for change in scope.changes.iter().filter(|c| c.action == FileChangeAction::Del) {
                match db.delete_file(&change.path, false).await {
                    Ok(()) => report.files_deleted += 1,
                    Err(e) if e.is_not_found() => {}
                    Err(e) => report.errors.push(format!("{}: {}", change.path, e)),
                }
                self.invalidate_path(&change.path).await;
            }

            let uploads: Vec<(String, Result<()>)> = stream::iter(scope.local_files.iter())
                .map(|file| {
                    let db = Arc::clone(&db);
                    async move {
                        let result: Result<()> = async {
                            let physical = GhostPath::new(file)?.to_physical(tmp_dir);
                            let content = tokio::fs::read(&physical)
                                .await
                                .map_err(|e| GhostError::backend("read", file, e))?;
                            db.upsert_file(file, &content, false).await
                        }
                        .await;
                        (file.clone(), result)
                    }
                })
                .buffer_unordered(self.limits.upload_concurrency)
                .collect()
                .await;

            for (file, result) in uploads {
                match result {
                    Ok(()) => report.files_uploaded += 1,
                    Err(e) => {
                        error!("Could not upload {}: {}", file, e);
                        report.errors.push(format!("{}: {}", file, e));
                    }
                }
                self.invalidate_path(&file).await;
            }

            if let Some(bot_id) = &scope.bot_id {
                if !scope.local_files.is_empty() {
                    report.updated_bots.push(bot_id.clone());
                }
            }
        }

        report.duration_ms = started.elapsed().as_millis() as u64;
        info!(
            "Force update done: {} uploaded, {} deleted, {} errors in {}ms",
            report.files_uploaded,
            report.files_deleted,
            report.errors.len(),
            report.duration_ms
        );
        Ok(report)
    }

    // ------------------------------------------------------------------------
    // Export / pending
    // ------------------------------------------------------------------------

    /// Archive every bot and the global scope, without bulk-ignored files.
    pub async fn export_archive(&self) -> Result<Vec<u8>> {
        let temp = tempfile::tempdir()?;
        let mut files = Vec::new();

        for bot_id in self.list_bot_ids().await? {
            let dir = format!("bots/{}", bot_id);
            let exported = self
                .for_bot(&bot_id)?
                .export_to_directory(&temp.path().join(&dir), BULK_IGNORED_FILES)
                .await?;
            files.extend(exported.into_iter().map(|f| format!("{}/{}", dir, f)));
        }

        let exported = self
            .global()?
            .export_to_directory(&temp.path().join("global"), BULK_IGNORED_FILES)
            .await?;
        files.extend(exported.into_iter().map(|f| format!("global/{}", f)));

        info!("Archiving {} files", files.len());
        archive::create_archive(temp.path(), &files).await
    }

    /// Archive one bot with its own id replaced by [`BOT_ID_PLACEHOLDER`] in
    /// every JSON file, so the archive can be imported under another id.
    pub async fn export_bot(&self, bot_id: &str) -> Result<Vec<u8>> {
        let replace = ReplaceContent::new(format!("/bots/{}/", bot_id), BOT_ID_PLACEHOLDER);
        self.for_bot(bot_id)?
            .export_to_archive_buffer(BOT_EXPORT_EXCLUDES, Some(&replace))
            .await
    }

    /// Bots that have a configuration file in the primary backend.
    pub async fn list_bot_ids(&self) -> Result<Vec<String>> {
        let configs = self
            .bots()?
            .directory_listing("/", BOT_CONFIG_FILE, ListingOptions::default())
            .await?;
        let ids: BTreeSet<String> = configs.iter().filter_map(|p| bot_dir_of(p)).collect();
        Ok(ids.into_iter().collect())
    }

    pub async fn get_pending<S: AsRef<str>>(
        &self,
        bot_ids: &[S],
    ) -> Result<ServerWidePendingRevisions> {
        let mut pending = ServerWidePendingRevisions::default();
        if !self.uses_db() {
            return Ok(pending);
        }

        pending.global = self.global()?.get_pending_changes().await?;
        for bot_id in bot_ids {
            pending
                .bots
                .push(self.for_bot(bot_id.as_ref())?.get_pending_changes().await?);
        }
        Ok(pending)
    }

    // ------------------------------------------------------------------------
    // Background tasks
    // ------------------------------------------------------------------------

    /// Pull folders to disk when a peer broadcasts a sync request.
    pub fn start_sync_listener(self: &Arc<Self>) {
        let mut events = self.cache.subscribe();
        let service: Weak<Self> = Arc::downgrade(self);

        let task = tokio::spawn(async move {
            loop {
                let message = match events.recv().await {
                    Ok(CacheEvent::SyncRequested(message)) => message,
                    Ok(CacheEvent::Invalidated(_)) => continue,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Sync listener lagged, {} events skipped", skipped);
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };
                let Some(service) = service.upgrade() else {
                    break;
                };
                if let Err(e) = service.handle_sync_request(&message).await {
                    error!("Could not sync database files to disk: {}", e);
                }
            }
        });

        if let Some(previous) = self.sync_listener.lock().replace(task) {
            previous.abort();
        }
    }

    async fn handle_sync_request(&self, message: &str) -> Result<()> {
        let request: SyncRequest = serde_json::from_str(message)?;
        let scope = match &request.bot_id {
            Some(bot_id) => self.for_bot(bot_id)?,
            None => self.global()?,
        };
        scope.sync_database_files_to_disk(&request.root_folder).await?;
        Ok(())
    }

    /// Watch the disk trees for outside changes. Returns `false` when the
    /// watcher is disabled in configuration.
    pub async fn start_watcher(&self) -> Result<bool> {
        if self.config.watcher.disabled {
            debug!("File watcher disabled");
            return Ok(false);
        }

        let watcher = FileChangeWatcher::new(
            self.config.storage.data_root.clone(),
            Arc::clone(&self.cache),
            Duration::from_millis(self.config.watcher.debounce_ms),
        );
        let handle = watcher.start().await?;
        *self.watcher.lock() = Some((watcher, handle));
        Ok(true)
    }

    /// Changes made outside Ghost, once the watcher runs.
    pub fn subscribe_file_changes(&self) -> Option<broadcast::Receiver<FileEvent>> {
        self.watcher
            .lock()
            .as_ref()
            .map(|(watcher, _)| watcher.subscribe())
    }

    pub fn shutdown(&self) {
        if let Some(task) = self.sync_listener.lock().take() {
            task.abort();
        }
        if let Some((_, handle)) = self.watcher.lock().take() {
            handle.stop();
        }
    }
}

impl Drop for GhostService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// `my-bot/bot.config.json` -> `my-bot`.
fn bot_dir_of(config_path: &str) -> Option<String> {
    let path = GhostPath::new(config_path).ok()?;
    match path.segments() {
        [bot, file] if file == BOT_CONFIG_FILE => Some(bot.clone()),
        _ => None,
    }
}

fn without_ignored(revisions: Vec<FileRevision>, ignored: &GlobFilter) -> Vec<FileRevision> {
    ignored.reject(revisions, |r| r.path.as_str())
}

/// Changes turning the `remote` scope into the `local` one. Paths are
/// reported under `prefix` (e.g. `data/bots/my-bot/flows/main.flow.json`).
async fn diff_scope(
    local: &ScopedGhost,
    remote: &ScopedGhost,
    prefix: &str,
    bot_id: Option<String>,
) -> Result<ScopedChange> {
    let ignored = GlobFilter::excludes(BULK_IGNORED_FILES)?;

    let local_revs = without_ignored(local.list_disk_revisions().await?, &ignored);
    let remote_revs = without_ignored(remote.list_db_revisions().await?, &ignored);

    let local_keys: HashSet<String> = local_revs.iter().map(FileRevision::unique_key).collect();
    let mut unsynced: Vec<String> = Vec::new();
    for rev in &remote_revs {
        if !local_keys.contains(&rev.unique_key()) && !unsynced.contains(&rev.path) {
            unsynced.push(rev.path.clone());
        }
    }

    let mut excludes: Vec<&str> = BULK_IGNORED_FILES.to_vec();
    excludes.push("**/revisions.json");
    let listing = ListingOptions::with_excludes(&excludes);
    let with_prefix = |files: Vec<String>| -> Vec<String> {
        files.into_iter().map(|f| format!("{}/{}", prefix, f)).collect()
    };
    let local_files = with_prefix(
        local
            .directory_listing("/", DEFAULT_LISTING_PATTERN, listing.clone())
            .await?,
    );
    let remote_files = with_prefix(
        remote
            .directory_listing("/", DEFAULT_LISTING_PATTERN, listing)
            .await?,
    );

    let local_set: HashSet<&str> = local_files.iter().map(String::as_str).collect();
    let remote_set: HashSet<&str> = remote_files.iter().map(String::as_str).collect();

    let mut changes: Vec<FileChange> = Vec::new();
    changes.extend(
        remote_files
            .iter()
            .filter(|f| !local_set.contains(f.as_str()))
            .map(|f| FileChange::new(f, FileChangeAction::Del)),
    );
    changes.extend(
        local_files
            .iter()
            .filter(|f| !remote_set.contains(f.as_str()))
            .map(|f| FileChange::new(f, FileChangeAction::Add)),
    );

    for path in unsynced {
        // Added, deleted, and files gone on both sides are already settled.
        if !local_set.contains(path.as_str()) || !remote_set.contains(path.as_str()) {
            continue;
        }
        match compare_edit(local, remote, prefix, &path).await {
            Ok(Some(change)) => changes.push(change),
            Ok(None) => debug!("{} is unsynced but identical", path),
            Err(e) => {
                warn!("Could not compare {}: {}", path, e);
                changes.push(FileChange::new(&path, FileChangeAction::Edit));
            }
        }
    }

    Ok(ScopedChange {
        bot_id,
        local_files,
        changes,
    })
}

async fn compare_edit(
    local: &ScopedGhost,
    remote: &ScopedGhost,
    prefix: &str,
    path: &str,
) -> Result<Option<FileChange>> {
    let relative = path
        .strip_prefix(prefix)
        .map(|p| p.trim_start_matches('/'))
        .ok_or_else(|| GhostError::invalid_path(format!("{} is not under {}", path, prefix)))?;

    // Disk scopes over the same paths share cache keys with the remote view.
    let local_content = local.read_file_uncached("/", relative).await?;
    let remote_content = remote.read_file_uncached("/", relative).await?;
    Ok(describe_edit(path, &remote_content, &local_content))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bot_id_validation() {
        assert!(is_valid_bot_id("welcome-bot"));
        assert!(is_valid_bot_id("bot_01"));
        assert!(!is_valid_bot_id(""));
        assert!(!is_valid_bot_id("-leading"));
        assert!(!is_valid_bot_id("has space"));
        assert!(!is_valid_bot_id("../escape"));
        assert!(!is_valid_bot_id(&"a".repeat(51)));
        assert!(is_valid_bot_id(&"a".repeat(50)));
    }

    #[test]
    fn test_bot_dir_of() {
        assert_eq!(bot_dir_of("b1/bot.config.json").as_deref(), Some("b1"));
        assert_eq!(bot_dir_of("b1/nested/bot.config.json"), None);
        assert_eq!(bot_dir_of("bot.config.json"), None);
    }
}

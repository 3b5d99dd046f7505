//! Scoped Ghost service.
//!
//! A [`ScopedGhost`] exposes file operations over one namespace (`data/global`,
//! `data/bots/<id>`, or a custom tree) and routes them to the primary driver.
//! It normalizes paths, serves reads from the object cache, enforces size
//! limits and the bot `locked` flag, and notifies change listeners.

use crate::archive;
use crate::cache::{CachedValue, ObjectCache, buffer_key, object_key};
use crate::driver::disk::REVISIONS_FILE;
use crate::driver::{DatabaseStorageDriver, DiskStorageDriver, StorageDriver};
use crate::glob::GlobFilter;
use crate::json::parse_json;
use crate::path::GhostPath;
use crate::types::{
    DriverKind, FileContent, FileRevision, ListingOptions, PendingRevisions, ReplaceContent,
    SyncReport, SyncRequest, UpsertOptions,
};
use futures::stream::{self, StreamExt, TryStreamExt};
use ghost_core::{GhostConfig, GhostError, Result};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

/// Bot configuration file checked for the `locked` flag.
pub const BOT_CONFIG_FILE: &str = "bot.config.json";

const GLOB_SCOPE_ERROR: &str = "Ghost can't read or write under this scope";

/// Patterns never carried from disk to the database by [`ScopedGhost::sync`].
const SYNC_EXCLUDES: &[&str] = &["**/node_modules/**", "**/revisions.json"];

/// Per-scope flags.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScopeOptions {
    /// Owning bot; enables the `locked` check
    pub bot_id: Option<String>,
    /// Keep folder names verbatim (archive imports, temporary trees)
    pub no_sanitize: bool,
}

/// Write limits shared by every scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeLimits {
    pub max_file_size: u64,
    pub max_model_file_size: u64,
    pub model_extension: String,
    pub upload_concurrency: usize,
}

impl Default for ScopeLimits {
    fn default() -> Self {
        Self {
            max_file_size: 100 * 1024 * 1024,
            max_model_file_size: 500 * 1024 * 1024,
            model_extension: ".model".to_string(),
            upload_concurrency: 50,
        }
    }
}

impl ScopeLimits {
    pub fn from_config(config: &GhostConfig) -> Result<Self> {
        Ok(Self {
            max_file_size: config.max_file_size_bytes()?,
            max_model_file_size: config.max_model_file_size_bytes()?,
            model_extension: config.limits.model_extension.clone(),
            upload_concurrency: config.limits.upload_concurrency.max(1),
        })
    }

    pub fn limit_for(&self, path: &str) -> u64 {
        if path.ends_with(&self.model_extension) {
            self.max_model_file_size
        } else {
            self.max_file_size
        }
    }
}

/// Callback invoked with the normalized path of every changed file.
pub type ChangeListener = Arc<dyn Fn(&str) + Send + Sync>;

type ListenerList = Mutex<Vec<(u64, ChangeListener)>>;

/// Returned by [`ScopedGhost::on_file_changed`].
pub struct ListenHandle {
    id: u64,
    listeners: Weak<ListenerList>,
}

impl ListenHandle {
    /// Stop receiving notifications.
    pub fn remove(self) {
        if let Some(listeners) = self.listeners.upgrade() {
            listeners.lock().retain(|(id, _)| *id != self.id);
        }
    }
}

pub struct ScopedGhost {
    base_dir: String,
    base: GhostPath,
    is_glob: bool,
    disk: Arc<DiskStorageDriver>,
    db: Option<Arc<DatabaseStorageDriver>>,
    use_db: bool,
    cache: Arc<dyn ObjectCache>,
    options: ScopeOptions,
    limits: ScopeLimits,
    listeners: Arc<ListenerList>,
    next_listener: AtomicU64,
}

impl ScopedGhost {
    /// Create a scope rooted at `base_dir`.
    ///
    /// A trailing `/*` makes the scope a read-only glob over the parent.
    /// `use_db` requires a database driver.
    pub fn new(
        base_dir: &str,
        disk: Arc<DiskStorageDriver>,
        db: Option<Arc<DatabaseStorageDriver>>,
        use_db: bool,
        cache: Arc<dyn ObjectCache>,
        options: ScopeOptions,
        limits: ScopeLimits,
    ) -> Result<Self> {
        if use_db && db.is_none() {
            return Err(GhostError::config(format!(
                "Scope {} uses the database driver but no database is configured",
                base_dir
            )));
        }

        let trimmed = base_dir.trim_end_matches('/');
        let (is_glob, root) = match trimmed.strip_suffix("/*") {
            Some(parent) => (true, parent),
            None if trimmed == "*" => (true, ""),
            None => (false, trimmed),
        };
        if root.contains('*') {
            return Err(GhostError::invalid_scope(format!(
                "Only a single trailing wildcard is allowed in {}",
                base_dir
            )));
        }

        let mut base = GhostPath::new(root)?;
        if !options.no_sanitize {
            base = base.sanitized();
        }

        Ok(Self {
            base_dir: base_dir.to_string(),
            base,
            is_glob,
            disk,
            db,
            use_db,
            cache,
            options,
            limits,
            listeners: Arc::new(Mutex::new(Vec::new())),
            next_listener: AtomicU64::new(0),
        })
    }

    pub fn base_dir(&self) -> &str {
        &self.base_dir
    }

    pub fn base(&self) -> &GhostPath {
        &self.base
    }

    pub fn bot_id(&self) -> Option<&str> {
        self.options.bot_id.as_deref()
    }

    pub fn is_glob(&self) -> bool {
        self.is_glob
    }

    pub fn primary_kind(&self) -> DriverKind {
        self.primary().kind()
    }

    fn primary(&self) -> &dyn StorageDriver {
        match (&self.db, self.use_db) {
            (Some(db), true) => db.as_ref() as &dyn StorageDriver,
            _ => self.disk.as_ref(),
        }
    }

    fn database(&self) -> Option<&DatabaseStorageDriver> {
        self.db.as_deref()
    }

    // ------------------------------------------------------------------------
    // Path normalization
    // ------------------------------------------------------------------------

    fn normalize_folder(&self, root_folder: &str) -> Result<GhostPath> {
        let joined = self.base.join(root_folder)?;
        let folder = if self.options.no_sanitize {
            joined
        } else {
            joined.sanitized()
        };
        if !folder.starts_with(&self.base) {
            return Err(GhostError::invalid_path(format!(
                "{} is outside of {}",
                root_folder, self.base
            )));
        }
        Ok(folder)
    }

    fn normalize_file(&self, root_folder: &str, file: &str) -> Result<String> {
        let full = self.base.join(root_folder)?.join(file)?;
        let normalized = if self.options.no_sanitize {
            full.with_sanitized_file_name()
        } else {
            full.sanitized()
        };
        if normalized.len() <= self.base.len() || !normalized.starts_with(&self.base) {
            return Err(GhostError::invalid_path(format!(
                "{} does not name a file under {}",
                file, self.base
            )));
        }
        Ok(normalized.to_string())
    }

    fn reject_glob(&self) -> Result<()> {
        if self.is_glob {
            Err(GhostError::invalid_scope(GLOB_SCOPE_ERROR))
        } else {
            Ok(())
        }
    }

    async fn assert_bot_unlocked(&self, root_folder: &str) -> Result<()> {
        let Some(bot_id) = &self.options.bot_id else {
            return Ok(());
        };
        if GhostPath::new(root_folder)?.first_segment() == Some("models") {
            return Ok(());
        }

        if self.file_exists("/", BOT_CONFIG_FILE).await {
            let config = self.read_file_as_object("/", BOT_CONFIG_FILE).await?;
            if config.get("locked").and_then(Value::as_bool) == Some(true) {
                return Err(GhostError::scope_locked(bot_id));
            }
        }
        Ok(())
    }

    async fn invalidate_path(&self, path: &str) {
        self.cache.invalidate(&object_key(path)).await;
        self.cache.invalidate(&buffer_key(path)).await;
    }

    fn emit_changed(&self, path: &str) {
        let listeners: Vec<ChangeListener> = self
            .listeners
            .lock()
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in listeners {
            listener(path);
        }
    }

    // ------------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------------

    pub async fn upsert_file(
        &self,
        root_folder: &str,
        file: &str,
        content: impl AsRef<[u8]>,
        options: UpsertOptions,
    ) -> Result<()> {
        if !options.ignore_lock {
            self.assert_bot_unlocked(root_folder).await?;
        }
        self.reject_glob()?;

        let path = self.normalize_file(root_folder, file)?;
        let content = content.as_ref();
        let limit = self.limits.limit_for(&path);
        if content.len() as u64 > limit {
            return Err(GhostError::size_limit(&path, content.len() as u64, limit));
        }

        self.primary()
            .upsert_file(&path, content, options.record_revision)
            .await?;
        self.emit_changed(&path);
        self.invalidate_path(&path).await;

        if options.sync_db_to_disk {
            let request = SyncRequest {
                root_folder: root_folder.to_string(),
                bot_id: self.options.bot_id.clone(),
            };
            self.cache.sync(&serde_json::to_string(&request)?).await;
        }
        Ok(())
    }

    /// Upsert several files concurrently, bounded by the upload concurrency.
    pub async fn upsert_files(
        &self,
        root_folder: &str,
        files: Vec<FileContent>,
        options: UpsertOptions,
    ) -> Result<()> {
        if !options.ignore_lock {
            self.assert_bot_unlocked(root_folder).await?;
        }
        let per_file = UpsertOptions {
            ignore_lock: true,
            ..options
        };

        stream::iter(files)
            .map(move |f| {
                let opts = per_file.clone();
                async move { self.upsert_file(root_folder, &f.name, &f.content, opts).await }
            })
            .buffer_unordered(self.limits.upload_concurrency)
            .try_collect::<Vec<_>>()
            .await?;
        Ok(())
    }

    pub async fn delete_file(&self, root_folder: &str, file: &str) -> Result<()> {
        self.assert_bot_unlocked(root_folder).await?;
        self.reject_glob()?;

        let path = self.normalize_file(root_folder, file)?;
        self.primary().delete_file(&path, true).await?;
        self.emit_changed(&path);
        self.invalidate_path(&path).await;
        Ok(())
    }

    pub async fn delete_folder(&self, folder: &str) -> Result<()> {
        self.assert_bot_unlocked(folder).await?;
        self.reject_glob()?;

        let path = self.normalize_folder(folder)?;
        self.primary().delete_dir(&path.to_string()).await?;
        self.cache.invalidate_starting_with(&path.as_dir_prefix()).await;
        self.emit_changed(&path.to_string());
        Ok(())
    }

    pub async fn rename_file(&self, root_folder: &str, from: &str, to: &str) -> Result<()> {
        self.assert_bot_unlocked(root_folder).await?;
        self.reject_glob()?;

        let from_path = self.normalize_file(root_folder, from)?;
        let to_path = self.normalize_file(root_folder, to)?;
        self.primary().move_file(&from_path, &to_path).await?;

        for path in [&from_path, &to_path] {
            self.invalidate_path(path).await;
            self.emit_changed(path);
        }
        Ok(())
    }

    /// Create directories under `root_folder`. The database has no directories.
    pub async fn ensure_dirs<S: AsRef<str>>(&self, root_folder: &str, dirs: &[S]) -> Result<()> {
        if self.use_db {
            return Ok(());
        }
        for dir in dirs {
            let path = self.normalize_file(root_folder, dir.as_ref())?;
            self.disk.create_dir(&path).await?;
        }
        Ok(())
    }

    pub async fn invalidate_file(&self, root_folder: &str, file: &str) -> Result<()> {
        let path = self.normalize_file(root_folder, file)?;
        self.invalidate_path(&path).await;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------------

    pub async fn read_file_as_buffer(&self, root_folder: &str, file: &str) -> Result<Vec<u8>> {
        self.reject_glob()?;
        let path = self.normalize_file(root_folder, file)?;
        let key = buffer_key(&path);

        if let Some(cached) = self.cache.get(&key).await.and_then(|v| v.as_buffer()) {
            return Ok((*cached).clone());
        }

        let content = self.primary().read_file(&path).await?;
        self.cache.set(&key, CachedValue::buffer(content.clone())).await;
        Ok(content)
    }

    pub async fn read_file_as_string(&self, root_folder: &str, file: &str) -> Result<String> {
        let bytes = self.read_file_as_buffer(root_folder, file).await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Read straight from the primary backend, bypassing the shared cache.
    pub async fn read_file_uncached(&self, root_folder: &str, file: &str) -> Result<Vec<u8>> {
        self.reject_glob()?;
        let path = self.normalize_file(root_folder, file)?;
        self.primary().read_file(&path).await
    }

    pub async fn read_file_as_object(&self, root_folder: &str, file: &str) -> Result<Value> {
        self.reject_glob()?;
        let path = self.normalize_file(root_folder, file)?;
        let key = object_key(&path);

        if let Some(cached) = self.cache.get(&key).await.and_then(|v| v.as_object()) {
            return Ok((*cached).clone());
        }

        let content = self.read_file_as_buffer(root_folder, file).await?;
        let value = parse_json(&path, &content)?;
        self.cache.set(&key, CachedValue::object(value.clone())).await;
        Ok(value)
    }

    /// Decode a JSON file into `T`.
    pub async fn read_file_as<T: DeserializeOwned>(&self, root_folder: &str, file: &str) -> Result<T> {
        let value = self.read_file_as_object(root_folder, file).await?;
        serde_json::from_value(value).map_err(|e| {
            GhostError::invalid_json(format!("{}/{}", root_folder, file), e.to_string())
        })
    }

    /// Never fails; driver errors count as "missing".
    pub async fn file_exists(&self, root_folder: &str, file: &str) -> bool {
        let path = match self.normalize_file(root_folder, file) {
            Ok(path) => path,
            Err(_) => return false,
        };
        if self.cache.has(&object_key(&path)).await {
            return true;
        }
        match self.primary().file_exists(&path).await {
            Ok(exists) => exists,
            Err(e) => {
                debug!("Existence check failed for {}: {}", path, e);
                false
            }
        }
    }

    pub async fn file_size(&self, root_folder: &str, file: &str) -> Result<u64> {
        let path = self.normalize_file(root_folder, file)?;
        self.primary().file_size(&path).await
    }

    /// Files under `root_folder` matching `pattern`, relative to it.
    ///
    /// A missing folder yields an empty list.
    pub async fn directory_listing(
        &self,
        root_folder: &str,
        pattern: &str,
        options: ListingOptions,
    ) -> Result<Vec<String>> {
        let folder = self.normalize_folder(root_folder)?.to_string();
        let files = match self.primary().directory_listing(&folder, &options).await {
            Ok(files) => files,
            Err(e) if e.is_not_found() => return Ok(Vec::new()),
            Err(e) => {
                return Err(GhostError::backend(
                    "list",
                    &folder,
                    format!("Could not list directory under {}: {}", folder, e),
                ));
            }
        };

        let include = GlobFilter::new(&[pattern], options.include_dot_files)?;
        Ok(include.retain(files, |f| f.as_str()))
    }

    // ------------------------------------------------------------------------
    // Revisions
    // ------------------------------------------------------------------------

    pub async fn list_db_revisions(&self) -> Result<Vec<FileRevision>> {
        match self.database() {
            Some(db) => db.list_revisions(&self.base.to_string()).await,
            None => Ok(Vec::new()),
        }
    }

    pub async fn list_disk_revisions(&self) -> Result<Vec<FileRevision>> {
        self.disk.list_revisions(&self.base.to_string()).await
    }

    /// Revisions of the primary driver.
    pub async fn list_revisions(&self) -> Result<Vec<FileRevision>> {
        if self.use_db {
            self.list_db_revisions().await
        } else {
            self.list_disk_revisions().await
        }
    }

    /// Unsynced revisions grouped by top-level folder (`root` for files at
    /// the scope root).
    pub async fn get_pending_changes(&self) -> Result<PendingRevisions> {
        let mut pending = PendingRevisions::new();
        if !self.use_db {
            return Ok(pending);
        }

        for revision in self.list_db_revisions().await? {
            let relative = GhostPath::new(&revision.path)?
                .strip_prefix(&self.base)
                .unwrap_or_else(GhostPath::root);
            let folder = if relative.len() > 1 {
                relative.first_segment().unwrap_or("root").to_string()
            } else {
                "root".to_string()
            };
            pending.entry(folder).or_default().push(revision);
        }
        Ok(pending)
    }

    pub async fn is_fully_synced(&self) -> Result<bool> {
        if !self.use_db {
            return Ok(true);
        }
        Ok(self.list_db_revisions().await?.is_empty())
    }

    // ------------------------------------------------------------------------
    // Synchronization
    // ------------------------------------------------------------------------

    /// Reconcile the local disk tree into the database.
    ///
    /// Revisions already present in the disk sidecars are purged, database
    /// files missing on disk are deleted, and every local file overwrites its
    /// database copy. A no-op for disk-backed scopes.
    pub async fn sync(&self) -> Result<SyncReport> {
        let mut report = SyncReport::default();
        let Some(db) = self.database().filter(|_| self.use_db) else {
            debug!("Scope {} is disk-backed, nothing to sync", self.base_dir);
            return Ok(report);
        };

        let base = self.base.to_string();
        let listing = ListingOptions::with_excludes(SYNC_EXCLUDES).include_dot_files(true);
        let local_files = match self.disk.directory_listing(&base, &listing).await {
            Ok(files) => files,
            Err(e) if e.is_not_found() => Vec::new(),
            Err(e) => return Err(e),
        };

        let disk_revs: HashSet<String> = self
            .disk
            .list_revisions(&base)
            .await?
            .iter()
            .map(FileRevision::unique_key)
            .collect();
        for rev in db.list_revisions(&base).await? {
            if disk_revs.contains(&rev.unique_key()) {
                db.delete_revision(&rev.path, &rev.revision).await?;
                report.revisions_cleared += 1;
            }
        }

        let local_set: HashSet<&str> = local_files.iter().map(String::as_str).collect();
        let db_files = db
            .directory_listing(&base, &ListingOptions::default().include_dot_files(true))
            .await?;
        for file in db_files.iter().filter(|f| !local_set.contains(f.as_str())) {
            let path = self.base.join(file)?.to_string();
            db.delete_file(&path, false).await?;
            report.files_deleted += 1;
        }

        stream::iter(local_files.iter())
            .map(move |file| async move {
                let path = self.base.join(file)?.to_string();
                let content = self.disk.read_file(&path).await?;
                db.upsert_file(&path, &content, false).await
            })
            .buffer_unordered(self.limits.upload_concurrency)
            .try_collect::<Vec<_>>()
            .await?;
        report.files_uploaded = local_files.len();

        self.cache.invalidate_starting_with(&self.base.as_dir_prefix()).await;
        info!(
            "Synced {}: {} uploaded, {} deleted, {} revisions cleared",
            self.base_dir, report.files_uploaded, report.files_deleted, report.revisions_cleared
        );
        Ok(report)
    }

    /// Pull one folder from the database to disk.
    pub async fn sync_database_files_to_disk(&self, root_folder: &str) -> Result<usize> {
        let Some(db) = self.database().filter(|_| self.use_db) else {
            return Ok(0);
        };

        let folder = self.normalize_folder(root_folder)?;
        let options = ListingOptions::default().include_dot_files(true);
        let files = match db.directory_listing(&folder.to_string(), &options).await {
            Ok(files) => files,
            Err(e) if e.is_not_found() => Vec::new(),
            Err(e) => return Err(e),
        };

        for file in &files {
            let path = folder.join(file)?.to_string();
            let content = db.read_file(&path).await?;
            self.disk.upsert_file(&path, &content, false).await?;
        }

        self.cache.invalidate_starting_with(&folder.as_dir_prefix()).await;
        debug!("Pulled {} files from the database into {}", files.len(), folder);
        Ok(files.len())
    }

    // ------------------------------------------------------------------------
    // Import / export
    // ------------------------------------------------------------------------

    /// Copy every file of the scope into `dir` and write the database
    /// revision log next to them as `revisions.json`.
    pub async fn export_to_directory<S: AsRef<str>>(
        &self,
        dir: &Path,
        excludes: &[S],
    ) -> Result<Vec<String>> {
        let options = ListingOptions::with_excludes(excludes).include_dot_files(true);
        let mut files = self.directory_listing("/", "*", options).await?;
        files.retain(|f| f != REVISIONS_FILE);

        for file in &files {
            let content = self.read_file_as_buffer("/", file).await?;
            let target = GhostPath::new(file)?.to_physical(dir);
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&target, content).await?;
        }

        let revisions = self.list_db_revisions().await?;
        tokio::fs::write(dir.join(REVISIONS_FILE), serde_json::to_vec_pretty(&revisions)?).await?;
        files.push(REVISIONS_FILE.to_string());

        debug!("Exported {} files from {} to {}", files.len(), self.base_dir, dir.display());
        Ok(files)
    }

    /// Upsert every file found under an arbitrary physical directory.
    pub async fn import_from_directory(&self, dir: &Path) -> Result<usize> {
        let files = self.disk.absolute_directory_listing(dir).await?;
        let mut contents = Vec::with_capacity(files.len());
        for file in files {
            let content = tokio::fs::read(dir.join(&file)).await?;
            contents.push(FileContent::new(file, content));
        }

        let count = contents.len();
        let options = UpsertOptions {
            ignore_lock: true,
            ..UpsertOptions::default()
        };
        self.upsert_files("/", contents, options).await?;
        info!("Imported {} files into {}", count, self.base_dir);
        Ok(count)
    }

    /// Archive the scope. With `replace`, every exported `.json` file is
    /// rewritten first.
    pub async fn export_to_archive_buffer<S: AsRef<str>>(
        &self,
        excludes: &[S],
        replace: Option<&ReplaceContent>,
    ) -> Result<Vec<u8>> {
        let temp = tempfile::tempdir()?;
        let files = self.export_to_directory(temp.path(), excludes).await?;

        if let Some(replace) = replace {
            let mut rewritten = 0;
            for file in files.iter().filter(|f| f.to_lowercase().ends_with(".json")) {
                let target = GhostPath::new(file)?.to_physical(temp.path());
                let text = tokio::fs::read_to_string(&target).await?;
                if let Some(replaced) = replace.apply(&text) {
                    tokio::fs::write(&target, replaced).await?;
                    rewritten += 1;
                }
            }
            debug!("Replaced content in {} exported files", rewritten);
        }

        archive::create_archive(temp.path(), &files).await
    }

    // ------------------------------------------------------------------------
    // Listeners
    // ------------------------------------------------------------------------

    pub fn on_file_changed<F>(&self, callback: F) -> ListenHandle
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        let id = self.next_listener.fetch_add(1, Ordering::Relaxed);
        self.listeners.lock().push((id, Arc::new(callback)));
        ListenHandle {
            id,
            listeners: Arc::downgrade(&self.listeners),
        }
    }

    pub fn detach_listeners(&self) {
        let removed = std::mem::take(&mut *self.listeners.lock()).len();
        if removed > 0 {
            debug!("Detached {} listeners from {}", removed, self.base_dir);
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }
}

impl std::fmt::Debug for ScopedGhost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopedGhost")
            .field("base_dir", &self.base_dir)
            .field("use_db", &self.use_db)
            .field("options", &self.options)
            .finish()
    }
}

/// Log and drop errors from best-effort cleanup.
pub(crate) fn log_cleanup_error(operation: &str, result: Result<()>) {
    if let Err(e) = result {
        warn!("{} failed: {}", operation, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryObjectCache;
    use crate::lock::LockOptions;
    use tempfile::TempDir;

    fn disk_scope(temp: &TempDir, base: &str, options: ScopeOptions) -> ScopedGhost {
        let disk = Arc::new(DiskStorageDriver::new(
            temp.path(),
            LockOptions::new(std::env::temp_dir().join("ghost-vfs-unit-locks")),
        ));
        ScopedGhost::new(
            base,
            disk,
            None,
            false,
            Arc::new(MemoryObjectCache::new(1024 * 1024)),
            options,
            ScopeLimits::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_normalize_file_sanitizes() {
        let temp = TempDir::new().unwrap();
        let scope = disk_scope(&temp, "data/bots/b1", ScopeOptions::default());
        assert_eq!(
            scope.normalize_file("flows", "ma:in?.json").unwrap(),
            "data/bots/b1/flows/main.json"
        );
        assert!(scope.normalize_file("/", "../b2/x.json").is_err());
        assert!(scope.normalize_file("/", "???").is_err());
    }

    #[test]
    fn test_no_sanitize_keeps_folders() {
        let temp = TempDir::new().unwrap();
        let options = ScopeOptions {
            no_sanitize: true,
            ..Default::default()
        };
        let scope = disk_scope(&temp, "/tmp/import:1/data", options);
        assert_eq!(
            scope.normalize_file("a:b", "c:d.json").unwrap(),
            "/tmp/import:1/data/a:b/cd.json"
        );
    }

    #[test]
    fn test_glob_scope() {
        let temp = TempDir::new().unwrap();
        let scope = disk_scope(&temp, "data/bots/*", ScopeOptions::default());
        assert!(scope.is_glob());
        assert_eq!(scope.base().to_string(), "data/bots");
        assert!(scope.reject_glob().is_err());
    }

    #[test]
    fn test_model_limit() {
        let limits = ScopeLimits::default();
        assert_eq!(limits.limit_for("data/bots/b/models/x.model"), 500 * 1024 * 1024);
        assert_eq!(limits.limit_for("data/bots/b/x.json"), 100 * 1024 * 1024);
    }

    #[tokio::test]
    async fn test_listener_handle_remove() {
        let temp = TempDir::new().unwrap();
        let scope = disk_scope(&temp, "data/global", ScopeOptions::default());
        let seen = Arc::new(Mutex::new(Vec::<String>::new()));

        let sink = Arc::clone(&seen);
        let handle = scope.on_file_changed(move |p| sink.lock().push(p.to_string()));
        scope
            .upsert_file("/", "a.txt", b"one", UpsertOptions::default())
            .await
            .unwrap();
        handle.remove();
        scope
            .upsert_file("/", "b.txt", b"two", UpsertOptions::default())
            .await
            .unwrap();

        assert_eq!(*seen.lock(), vec!["data/global/a.txt".to_string()]);
        assert_eq!(scope.listener_count(), 0);
    }
}

//! Disk storage driver.
//!
//! Files live under a data root. Every read takes a shared advisory lock and
//! every write an exclusive one (see [`crate::lock`]). There is no live
//! revision log on disk: `list_revisions` reads the `revisions.json` sidecars
//! written by exports, and deletes are physical.

use super::StorageDriver;
use crate::glob::GlobFilter;
use crate::lock::{self, LockMode, LockOptions};
use crate::path::GhostPath;
use crate::types::{
    DriverKind, FileRevision, ListingOptions, SortColumn, SortDirection, SortOrder,
};
use async_trait::async_trait;
use ghost_core::{GhostError, Result};
use ignore::WalkBuilder;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, warn};

/// Sidecar file holding exported revisions.
pub const REVISIONS_FILE: &str = "revisions.json";

pub struct DiskStorageDriver {
    root: PathBuf,
    ignore_file: Option<PathBuf>,
    lock: LockOptions,
}

impl DiskStorageDriver {
    pub fn new(root: impl Into<PathBuf>, lock: LockOptions) -> Self {
        Self {
            root: root.into(),
            ignore_file: None,
            lock,
        }
    }

    /// Merge the patterns of `path` (one glob per line) into every listing.
    pub fn with_ignore_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.ignore_file = Some(path.into());
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Physical location of a Ghost path. Absolute paths bypass the root.
    pub fn resolve(&self, path: &str) -> Result<PathBuf> {
        Ok(GhostPath::new(path)?.to_physical(&self.root))
    }

    async fn ignore_patterns(&self) -> Vec<String> {
        let Some(file) = &self.ignore_file else {
            return Vec::new();
        };

        match tokio::fs::read_to_string(file).await {
            Ok(content) => content
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty() && !l.starts_with('#'))
                .map(str::to_string)
                .collect(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                warn!("Could not read ignore file {}: {}", file.display(), e);
                Vec::new()
            }
        }
    }

    /// List files under an arbitrary physical directory, relative to it.
    pub async fn absolute_directory_listing(&self, dir: &Path) -> Result<Vec<String>> {
        let entries = walk_files(dir.to_path_buf(), true).await?;
        let mut files: Vec<String> = entries.into_iter().map(|(p, _)| p).collect();
        files.sort();
        Ok(files)
    }
}

fn map_io(operation: &str, path: &str, e: io::Error) -> GhostError {
    if e.kind() == io::ErrorKind::NotFound {
        GhostError::not_found(path)
    } else {
        GhostError::backend(operation, path, e)
    }
}

/// Walk `dir` on the blocking pool, returning forward-slash relative paths
/// with their modification times.
async fn walk_files(dir: PathBuf, include_hidden: bool) -> Result<Vec<(String, SystemTime)>> {
    tokio::task::spawn_blocking(move || -> Result<Vec<(String, SystemTime)>> {
        if !dir.is_dir() {
            return Err(GhostError::not_found(dir.display().to_string()));
        }

        let mut walker = WalkBuilder::new(&dir);
        walker
            .standard_filters(false)
            .hidden(!include_hidden)
            .follow_links(false);

        let mut files = Vec::new();
        for entry in walker.build() {
            let entry = entry.map_err(|e| {
                GhostError::backend("list", dir.display().to_string(), e.to_string())
            })?;
            if !entry.file_type().is_some_and(|t| t.is_file()) {
                continue;
            }

            let relative = GhostPath::from_physical(entry.path(), &dir)?;
            let modified = entry
                .metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            files.push((relative.to_string(), modified));
        }
        Ok(files)
    })
    .await
    .map_err(|e| GhostError::internal(format!("Directory walk panicked: {}", e)))?
}

pub(crate) fn sort_listing(mut files: Vec<(String, SystemTime)>, order: SortOrder) -> Vec<String> {
    match order.column {
        SortColumn::FilePath => files.sort_by(|a, b| a.0.cmp(&b.0)),
        SortColumn::ModifiedOn => files.sort_by(|a, b| a.1.cmp(&b.1).then(a.0.cmp(&b.0))),
    }
    if order.direction == SortDirection::Desc {
        files.reverse();
    }
    files.into_iter().map(|(p, _)| p).collect()
}

#[async_trait]
impl StorageDriver for DiskStorageDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::Disk
    }

    async fn upsert_file(&self, path: &str, content: &[u8], _record_revision: bool) -> Result<()> {
        let physical = self.resolve(path)?;
        if let Some(parent) = physical.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| GhostError::backend("upsert", path, e))?;
        }

        let _guard = lock::acquire(&self.lock, &physical, LockMode::Exclusive).await?;
        tokio::fs::write(&physical, content)
            .await
            .map_err(|e| GhostError::backend("upsert", path, e))?;

        debug!("Wrote {} bytes to {}", content.len(), physical.display());
        Ok(())
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        let physical = self.resolve(path)?;
        let _guard = lock::acquire(&self.lock, &physical, LockMode::Shared).await?;
        tokio::fs::read(&physical)
            .await
            .map_err(|e| map_io("read", path, e))
    }

    async fn file_exists(&self, path: &str) -> Result<bool> {
        let physical = self.resolve(path)?;
        match tokio::fs::metadata(&physical).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(GhostError::backend("exists", path, e)),
        }
    }

    async fn file_size(&self, path: &str) -> Result<u64> {
        let physical = self.resolve(path)?;
        let meta = tokio::fs::metadata(&physical)
            .await
            .map_err(|e| map_io("size", path, e))?;
        Ok(meta.len())
    }

    async fn delete_file(&self, path: &str, _record_revision: bool) -> Result<()> {
        let physical = self.resolve(path)?;
        let _guard = lock::acquire(&self.lock, &physical, LockMode::Exclusive).await?;
        tokio::fs::remove_file(&physical)
            .await
            .map_err(|e| map_io("delete", path, e))?;
        debug!("Deleted {}", physical.display());
        Ok(())
    }

    async fn delete_dir(&self, path: &str) -> Result<()> {
        let physical = self.resolve(path)?;
        match tokio::fs::remove_dir_all(&physical).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(GhostError::backend("delete_dir", path, e)),
        }
    }

    async fn directory_listing(
        &self,
        folder: &str,
        options: &ListingOptions,
    ) -> Result<Vec<String>> {
        let physical = self.resolve(folder)?;
        let entries = walk_files(physical, options.include_dot_files).await?;

        let mut excludes = options.excludes.clone();
        excludes.extend(self.ignore_patterns().await);
        let filter = GlobFilter::excludes(&excludes)?;

        let kept = filter.reject(entries, |(p, _)| p.as_str());
        Ok(sort_listing(kept, options.sort_order.unwrap_or_default()))
    }

    async fn list_revisions(&self, path_prefix: &str) -> Result<Vec<FileRevision>> {
        let physical = self.resolve(path_prefix)?;
        let entries = match walk_files(physical.clone(), true).await {
            Ok(entries) => entries,
            Err(e) if e.is_not_found() => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut sidecars: Vec<String> = entries
            .into_iter()
            .map(|(p, _)| p)
            .filter(|p| p == REVISIONS_FILE || p.ends_with(&format!("/{}", REVISIONS_FILE)))
            .collect();
        sidecars.sort();

        let mut revisions = Vec::new();
        for sidecar in sidecars {
            let file = physical.join(&sidecar);
            let content = tokio::fs::read(&file)
                .await
                .map_err(|e| map_io("list_revisions", &sidecar, e))?;
            let mut parsed: Vec<FileRevision> = serde_json::from_slice(&content).map_err(|e| {
                GhostError::invalid_json(file.display().to_string(), e.to_string())
            })?;
            revisions.append(&mut parsed);
        }
        Ok(revisions)
    }

    async fn delete_revision(&self, _path: &str, _revision: &str) -> Result<()> {
        // Sidecars are informational snapshots; there is no live log to purge.
        Ok(())
    }

    async fn move_file(&self, from: &str, to: &str) -> Result<()> {
        let from_physical = self.resolve(from)?;
        let to_physical = self.resolve(to)?;
        if from_physical == to_physical {
            return Ok(());
        }

        if let Some(parent) = to_physical.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| GhostError::backend("move", to, e))?;
        }

        let _from_guard = lock::acquire(&self.lock, &from_physical, LockMode::Exclusive).await?;
        let _to_guard = lock::acquire(&self.lock, &to_physical, LockMode::Exclusive).await?;
        tokio::fs::rename(&from_physical, &to_physical)
            .await
            .map_err(|e| map_io("move", from, e))
    }

    async fn create_dir(&self, path: &str) -> Result<()> {
        let physical = self.resolve(path)?;
        tokio::fs::create_dir_all(&physical)
            .await
            .map_err(|e| GhostError::backend("create_dir", path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_sort_listing() {
        let t = |s| SystemTime::UNIX_EPOCH + Duration::from_secs(s);
        let files = vec![
            ("b.txt".to_string(), t(1)),
            ("a.txt".to_string(), t(3)),
            ("c.txt".to_string(), t(2)),
        ];

        assert_eq!(
            sort_listing(files.clone(), SortOrder::by_name()),
            vec!["a.txt", "b.txt", "c.txt"]
        );
        assert_eq!(
            sort_listing(files, SortOrder::newest_first()),
            vec!["a.txt", "c.txt", "b.txt"]
        );
    }

    #[test]
    fn test_resolve() {
        let driver = DiskStorageDriver::new("/srv/app", LockOptions::new("/tmp/locks"));
        assert_eq!(
            driver.resolve("./data/global/a.json").unwrap(),
            PathBuf::from("/srv/app/data/global/a.json")
        );
        assert_eq!(
            driver.resolve("/tmp/restore/data/global").unwrap(),
            PathBuf::from("/tmp/restore/data/global")
        );
    }
}

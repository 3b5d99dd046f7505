//! Storage drivers.
//!
//! A driver performs raw byte-level file operations and revision bookkeeping
//! for one medium. Paths are the normalized strings produced by scoped
//! services (`data/global/x.json`, or absolute for custom trees).

use crate::types::{DriverKind, FileRevision, ListingOptions};
use async_trait::async_trait;
use ghost_core::Result;

pub mod database;
pub mod disk;

pub use database::DatabaseStorageDriver;
pub use disk::DiskStorageDriver;

/// Capability set shared by the disk and database backends.
#[async_trait]
pub trait StorageDriver: Send + Sync {
    fn kind(&self) -> DriverKind;

    /// Create or overwrite. Appends a revision when `record_revision` is set
    /// and the backend keeps a revision log.
    async fn upsert_file(&self, path: &str, content: &[u8], record_revision: bool) -> Result<()>;

    /// Fails with `NotFound` for missing or deleted files.
    async fn read_file(&self, path: &str) -> Result<Vec<u8>>;

    async fn file_exists(&self, path: &str) -> Result<bool>;

    async fn file_size(&self, path: &str) -> Result<u64>;

    async fn delete_file(&self, path: &str, record_revision: bool) -> Result<()>;

    /// Delete every file under a folder.
    async fn delete_dir(&self, path: &str) -> Result<()>;

    /// Files under `folder`, relative to it.
    async fn directory_listing(&self, folder: &str, options: &ListingOptions)
    -> Result<Vec<String>>;

    async fn list_revisions(&self, path_prefix: &str) -> Result<Vec<FileRevision>>;

    async fn delete_revision(&self, path: &str, revision: &str) -> Result<()>;

    async fn move_file(&self, from: &str, to: &str) -> Result<()>;

    async fn create_dir(&self, _path: &str) -> Result<()> {
        Ok(())
    }
}

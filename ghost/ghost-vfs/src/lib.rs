//! Ghost: a virtual file layer over disk and database storage.
//!
//! Callers read and write "files" (bot configuration, flows, content,
//! models) through a [`ScopedGhost`] without knowing whether they live on
//! local disk or in SQLite. The layer provides:
//! - Two storage drivers with per-file advisory locks (disk) and an
//!   append-only revision log (database)
//! - A byte-budgeted object cache with prefix invalidation and a sync channel
//! - A file-change watcher that keeps the cache coherent with outside edits
//! - Change-set computation and forced overwrites between a local tree and
//!   the database, plus tar.gz export
//!
//! # Example
//!
//! ```no_run
//! use ghost_core::GhostConfig;
//! use ghost_vfs::{GhostService, UpsertOptions};
//!
//! # async fn example() -> ghost_core::Result<()> {
//! let service = GhostService::from_config(GhostConfig::default()).await?;
//! service.initialize(true, false).await?;
//!
//! let bot = service.for_bot("welcome-bot")?;
//! bot.upsert_file("flows", "main.flow.json", b"{}", UpsertOptions::default())
//!     .await?;
//! let flow = bot.read_file_as_object("flows", "main.flow.json").await?;
//! # let _ = flow;
//! # Ok(())
//! # }
//! ```

pub mod archive;
pub mod cache;
pub mod diff;
pub mod driver;
pub mod glob;
pub mod json;
pub mod lock;
pub mod path;
pub mod scoped;
pub mod service;
pub mod types;
pub mod watcher;

pub use cache::{CacheEvent, CacheStatistics, CachedValue, MemoryObjectCache, ObjectCache};
pub use driver::{DatabaseStorageDriver, DiskStorageDriver, StorageDriver};
pub use glob::{BULK_IGNORED_FILES, DIFFABLE_EXTENSIONS, GlobFilter};
pub use lock::{LockMode, LockOptions};
pub use path::GhostPath;
pub use scoped::{ListenHandle, ScopeLimits, ScopeOptions, ScopedGhost};
pub use service::{BOT_ID_PLACEHOLDER, GhostService, is_valid_bot_id};
pub use types::*;
pub use watcher::{FileChangeWatcher, FileEvent, WatcherHandle};

/// Prelude module with commonly used types.
pub mod prelude {
    pub use crate::cache::{MemoryObjectCache, ObjectCache};
    pub use crate::driver::{DatabaseStorageDriver, DiskStorageDriver, StorageDriver};
    pub use crate::scoped::ScopedGhost;
    pub use crate::service::GhostService;
    pub use crate::types::{
        FileChange, FileChangeAction, FileContent, FileRevision, ListingOptions, ScopedChange,
        UpsertOptions,
    };
    pub use ghost_core::{GhostError, Result};
}

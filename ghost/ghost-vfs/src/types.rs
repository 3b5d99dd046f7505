//! Data types shared by drivers, scopes and the registry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ============================================================================
// Revisions
// ============================================================================

/// One entry of the append-only revision log.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRevision {
    pub path: String,
    pub revision: String,
    #[serde(default)]
    pub created_by: String,
    #[serde(default = "Utc::now")]
    pub created_on: DateTime<Utc>,
}

impl FileRevision {
    /// Identity of the historical event: `path | revision`.
    pub fn unique_key(&self) -> String {
        format!("{} | {}", self.path, self.revision)
    }
}

/// Revisions grouped by the first folder under a scope (`root` for files at the top).
pub type PendingRevisions = BTreeMap<String, Vec<FileRevision>>;

/// Pending revisions across the global scope and a set of bots.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerWidePendingRevisions {
    pub global: PendingRevisions,
    pub bots: Vec<PendingRevisions>,
}

// ============================================================================
// Diffing
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileChangeAction {
    Add,
    Edit,
    Del,
}

impl fmt::Display for FileChangeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Add => "add",
            Self::Edit => "edit",
            Self::Del => "del",
        };
        f.write_str(s)
    }
}

/// A single difference between a local tree and the remote tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileChange {
    pub path: String,
    pub action: FileChangeAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub add: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub del: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_diff: Option<u64>,
}

impl FileChange {
    pub fn new(path: impl Into<String>, action: FileChangeAction) -> Self {
        Self {
            path: path.into(),
            action,
            add: None,
            del: None,
            size_diff: None,
        }
    }
}

/// Changes for one scope. `bot_id` is `None` for the global scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopedChange {
    pub bot_id: Option<String>,
    /// Local files that will overwrite their remote counterpart
    pub local_files: Vec<String>,
    pub changes: Vec<FileChange>,
}

// ============================================================================
// Operation options and results
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpsertOptions {
    pub record_revision: bool,
    /// Broadcast a request for other processes to pull this folder to disk
    pub sync_db_to_disk: bool,
    /// Bypass the bot `locked` flag
    pub ignore_lock: bool,
}

impl Default for UpsertOptions {
    fn default() -> Self {
        Self {
            record_revision: true,
            sync_db_to_disk: false,
            ignore_lock: false,
        }
    }
}

impl UpsertOptions {
    pub fn untracked() -> Self {
        Self {
            record_revision: false,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortColumn {
    #[default]
    FilePath,
    ModifiedOn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SortOrder {
    pub column: SortColumn,
    pub direction: SortDirection,
}

impl SortOrder {
    pub fn by_name() -> Self {
        Self::default()
    }

    pub fn newest_first() -> Self {
        Self {
            column: SortColumn::ModifiedOn,
            direction: SortDirection::Desc,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListingOptions {
    pub excludes: Vec<String>,
    pub include_dot_files: bool,
    pub sort_order: Option<SortOrder>,
}

impl ListingOptions {
    pub fn with_excludes<S: AsRef<str>>(excludes: &[S]) -> Self {
        Self {
            excludes: excludes.iter().map(|s| s.as_ref().to_string()).collect(),
            ..Self::default()
        }
    }

    pub fn include_dot_files(mut self, include: bool) -> Self {
        self.include_dot_files = include;
        self
    }

    pub fn sorted(mut self, order: SortOrder) -> Self {
        self.sort_order = Some(order);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    Disk,
    Database,
}

impl fmt::Display for DriverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disk => f.write_str("disk"),
            Self::Database => f.write_str("database"),
        }
    }
}

/// A named blob for batch uploads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileContent {
    pub name: String,
    pub content: Vec<u8>,
}

impl FileContent {
    pub fn new(name: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            content: content.into(),
        }
    }
}

/// Text substitution applied to exported `.json` files before archiving.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplaceContent {
    pub from: String,
    pub to: String,
}

impl ReplaceContent {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
        }
    }

    /// `None` when `text` has no occurrence of `from`.
    pub fn apply(&self, text: &str) -> Option<String> {
        if self.from.is_empty() || !text.contains(&self.from) {
            return None;
        }
        Some(text.replace(&self.from, &self.to))
    }
}

/// Outcome of a disk to database sync of one scope.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub revisions_cleared: usize,
    pub files_deleted: usize,
    pub files_uploaded: usize,
}

/// Outcome of a forced overwrite from a local tree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForceUpdateReport {
    /// Bots that received local overwrites and likely need a remount
    pub updated_bots: Vec<String>,
    pub files_uploaded: usize,
    pub files_deleted: usize,
    pub errors: Vec<String>,
    pub duration_ms: u64,
}

/// Cross-process request to pull a folder from the database to disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
    pub root_folder: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bot_id: Option<String>,
}

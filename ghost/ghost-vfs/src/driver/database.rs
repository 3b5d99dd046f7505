//! Database storage driver (SQLite via sqlx).
//!
//! Files are rows keyed by path with a soft-delete flag; every tracked write
//! or delete appends a row to the revision index.

use super::StorageDriver;
use crate::glob::GlobFilter;
use crate::path::GhostPath;
use crate::types::{DriverKind, FileRevision, ListingOptions, SortColumn, SortDirection};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ghost_core::{GhostError, Result, RevisionId};
use sqlx::{
    Row,
    sqlite::{SqliteConnection, SqlitePool, SqlitePoolOptions},
};
use tracing::{debug, info};

const DEFAULT_AUTHOR: &str = "admin";

#[derive(Debug, Clone)]
pub struct DatabaseStorageDriver {
    pool: SqlitePool,
    author: String,
}

impl DatabaseStorageDriver {
    /// Connect to `url` and create the tables if needed.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(|e| GhostError::backend("connect", url, e))?;

        info!("Connected to ghost database at {}", url);
        Self::from_pool(pool).await
    }

    /// A private in-memory database, mostly for tests.
    pub async fn connect_in_memory() -> Result<Self> {
        // Every connection to :memory: is a separate database, so keep exactly one alive.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| GhostError::backend("connect", "sqlite::memory:", e))?;

        Self::from_pool(pool).await
    }

    pub async fn from_pool(pool: SqlitePool) -> Result<Self> {
        let driver = Self {
            pool,
            author: DEFAULT_AUTHOR.to_string(),
        };
        driver.init_schema().await?;
        Ok(driver)
    }

    /// Name recorded as `created_by` on new revisions.
    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = author.into();
        self
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS srv_ghost_files (
                file_path TEXT PRIMARY KEY NOT NULL,
                content BLOB NOT NULL,
                deleted INTEGER NOT NULL DEFAULT 0,
                modified_on TEXT NOT NULL
            )
            ",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| GhostError::backend("init_schema", "srv_ghost_files", e))?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS srv_ghost_index (
                file_path TEXT NOT NULL,
                revision TEXT NOT NULL,
                created_by TEXT NOT NULL,
                created_on TEXT NOT NULL,
                PRIMARY KEY (file_path, revision)
            )
            ",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| GhostError::backend("init_schema", "srv_ghost_index", e))?;

        Ok(())
    }

    /// Count of live files, regardless of scope.
    pub async fn count_files(&self) -> Result<u64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM srv_ghost_files WHERE deleted = 0")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| GhostError::backend("count", "srv_ghost_files", e))?;
        let n: i64 = row.get("n");
        Ok(n.max(0) as u64)
    }

    async fn record_revision(&self, conn: &mut SqliteConnection, path: &str) -> Result<()> {
        let revision = RevisionId::new();
        sqlx::query(
            r"
            INSERT INTO srv_ghost_index (file_path, revision, created_by, created_on)
            VALUES (?1, ?2, ?3, ?4)
            ",
        )
        .bind(path)
        .bind(revision.as_str())
        .bind(&self.author)
        .bind(Utc::now().to_rfc3339())
        .execute(&mut *conn)
        .await
        .map_err(|e| GhostError::backend("record_revision", path, e))?;

        debug!("Recorded revision {} for {}", revision, path);
        Ok(())
    }
}

fn normalize(path: &str) -> Result<String> {
    Ok(GhostPath::new(path)?.to_string())
}

fn parse_timestamp(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

fn is_hidden(relative: &str) -> bool {
    relative.split('/').any(|s| s.starts_with('.'))
}

#[async_trait]
impl StorageDriver for DatabaseStorageDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::Database
    }

    async fn upsert_file(&self, path: &str, content: &[u8], record_revision: bool) -> Result<()> {
        let key = normalize(path)?;
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| GhostError::backend("upsert", &key, e))?;

        sqlx::query(
            r"
            INSERT INTO srv_ghost_files (file_path, content, deleted, modified_on)
            VALUES (?1, ?2, 0, ?3)
            ON CONFLICT(file_path) DO UPDATE SET
                content = excluded.content,
                deleted = 0,
                modified_on = excluded.modified_on
            ",
        )
        .bind(&key)
        .bind(content)
        .bind(Utc::now().to_rfc3339())
        .execute(&mut *tx)
        .await
        .map_err(|e| GhostError::backend("upsert", &key, e))?;

        if record_revision {
            self.record_revision(&mut *tx, &key).await?;
        }

        tx.commit()
            .await
            .map_err(|e| GhostError::backend("upsert", &key, e))?;

        debug!("Upserted {} ({} bytes)", key, content.len());
        Ok(())
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        let key = normalize(path)?;
        let row = sqlx::query(
            "SELECT content FROM srv_ghost_files WHERE file_path = ?1 AND deleted = 0",
        )
        .bind(&key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| GhostError::backend("read", &key, e))?;

        match row {
            Some(row) => Ok(row.get("content")),
            None => Err(GhostError::not_found(key)),
        }
    }

    async fn file_exists(&self, path: &str) -> Result<bool> {
        let key = normalize(path)?;
        let row = sqlx::query("SELECT 1 FROM srv_ghost_files WHERE file_path = ?1 AND deleted = 0")
            .bind(&key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| GhostError::backend("exists", &key, e))?;
        Ok(row.is_some())
    }

    async fn file_size(&self, path: &str) -> Result<u64> {
        let key = normalize(path)?;
        let row = sqlx::query(
            "SELECT length(content) AS size FROM srv_ghost_files WHERE file_path = ?1 AND deleted = 0",
        )
        .bind(&key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| GhostError::backend("size", &key, e))?;

        match row {
            Some(row) => {
                let size: i64 = row.get("size");
                Ok(size.max(0) as u64)
            }
            None => Err(GhostError::not_found(key)),
        }
    }

    async fn delete_file(&self, path: &str, record_revision: bool) -> Result<()> {
        let key = normalize(path)?;
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| GhostError::backend("delete", &key, e))?;

        let result = sqlx::query(
            r"
            UPDATE srv_ghost_files SET deleted = 1, modified_on = ?2
            WHERE file_path = ?1 AND deleted = 0
            ",
        )
        .bind(&key)
        .bind(Utc::now().to_rfc3339())
        .execute(&mut *tx)
        .await
        .map_err(|e| GhostError::backend("delete", &key, e))?;

        if result.rows_affected() == 0 {
            return Err(GhostError::not_found(key));
        }

        if record_revision {
            self.record_revision(&mut *tx, &key).await?;
        }

        tx.commit()
            .await
            .map_err(|e| GhostError::backend("delete", &key, e))?;

        debug!("Soft-deleted {}", key);
        Ok(())
    }

    async fn delete_dir(&self, path: &str) -> Result<()> {
        let prefix = GhostPath::new(path)?.as_dir_prefix();
        let result = sqlx::query(
            r"
            UPDATE srv_ghost_files SET deleted = 1, modified_on = ?2
            WHERE instr(file_path, ?1) = 1 AND deleted = 0
            ",
        )
        .bind(&prefix)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| GhostError::backend("delete_dir", &prefix, e))?;

        debug!("Soft-deleted {} files under {}", result.rows_affected(), prefix);
        Ok(())
    }

    async fn directory_listing(
        &self,
        folder: &str,
        options: &ListingOptions,
    ) -> Result<Vec<String>> {
        let prefix = GhostPath::new(folder)?.as_dir_prefix();
        let rows = sqlx::query(
            r"
            SELECT file_path, modified_on FROM srv_ghost_files
            WHERE deleted = 0 AND (?1 = '' OR instr(file_path, ?1) = 1)
            ORDER BY file_path
            ",
        )
        .bind(&prefix)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| GhostError::backend("list", &prefix, e))?;

        let filter = GlobFilter::excludes(&options.excludes)?;
        let mut files: Vec<(String, String)> = rows
            .into_iter()
            .map(|row| {
                let path: String = row.get("file_path");
                let modified: String = row.get("modified_on");
                (path[prefix.len()..].to_string(), modified)
            })
            .filter(|(p, _)| options.include_dot_files || !is_hidden(p))
            .filter(|(p, _)| !filter.is_match(p))
            .collect();

        if let Some(order) = options.sort_order {
            if order.column == SortColumn::ModifiedOn {
                files.sort_by(|a, b| parse_timestamp(&a.1).cmp(&parse_timestamp(&b.1)));
            }
            if order.direction == SortDirection::Desc {
                files.reverse();
            }
        }

        Ok(files.into_iter().map(|(p, _)| p).collect())
    }

    async fn list_revisions(&self, path_prefix: &str) -> Result<Vec<FileRevision>> {
        let key = normalize(path_prefix)?;
        let rows = sqlx::query(
            r"
            SELECT file_path, revision, created_by, created_on FROM srv_ghost_index
            WHERE ?1 = '' OR file_path = ?1 OR instr(file_path, ?1 || '/') = 1
            ORDER BY created_on, rowid
            ",
        )
        .bind(&key)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| GhostError::backend("list_revisions", &key, e))?;

        Ok(rows
            .into_iter()
            .map(|row| {
                let created_on: String = row.get("created_on");
                FileRevision {
                    path: row.get("file_path"),
                    revision: row.get("revision"),
                    created_by: row.get("created_by"),
                    created_on: parse_timestamp(&created_on),
                }
            })
            .collect())
    }

    async fn delete_revision(&self, path: &str, revision: &str) -> Result<()> {
        let key = normalize(path)?;
        sqlx::query("DELETE FROM srv_ghost_index WHERE file_path = ?1 AND revision = ?2")
            .bind(&key)
            .bind(revision)
            .execute(&self.pool)
            .await
            .map_err(|e| GhostError::backend("delete_revision", &key, e))?;
        Ok(())
    }

    async fn move_file(&self, from: &str, to: &str) -> Result<()> {
        let from_key = normalize(from)?;
        let to_key = normalize(to)?;
        if from_key == to_key {
            return Ok(());
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| GhostError::backend("move", &from_key, e))?;

        // A soft-deleted row may still hold the destination key.
        sqlx::query("DELETE FROM srv_ghost_files WHERE file_path = ?1")
            .bind(&to_key)
            .execute(&mut *tx)
            .await
            .map_err(|e| GhostError::backend("move", &to_key, e))?;

        let moved = sqlx::query(
            r"
            UPDATE srv_ghost_files SET file_path = ?2, modified_on = ?3
            WHERE file_path = ?1 AND deleted = 0
            ",
        )
        .bind(&from_key)
        .bind(&to_key)
        .bind(Utc::now().to_rfc3339())
        .execute(&mut *tx)
        .await
        .map_err(|e| GhostError::backend("move", &from_key, e))?;

        if moved.rows_affected() == 0 {
            return Err(GhostError::not_found(from_key));
        }

        sqlx::query("UPDATE OR IGNORE srv_ghost_index SET file_path = ?2 WHERE file_path = ?1")
            .bind(&from_key)
            .bind(&to_key)
            .execute(&mut *tx)
            .await
            .map_err(|e| GhostError::backend("move", &from_key, e))?;

        tx.commit()
            .await
            .map_err(|e| GhostError::backend("move", &from_key, e))?;

        debug!("Moved {} to {}", from_key, to_key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_soft_delete_and_undelete() {
        let driver = DatabaseStorageDriver::connect_in_memory().await.unwrap();
        driver.upsert_file("data/global/a.txt", b"one", false).await.unwrap();
        driver.delete_file("data/global/a.txt", false).await.unwrap();

        assert!(!driver.file_exists("data/global/a.txt").await.unwrap());
        assert_eq!(driver.count_files().await.unwrap(), 0);

        // The row is still there; a new write revives it.
        driver.upsert_file("data/global/a.txt", b"two", false).await.unwrap();
        assert_eq!(driver.read_file("data/global/a.txt").await.unwrap(), b"two");
    }

    #[tokio::test]
    async fn test_delete_missing_is_not_found() {
        let driver = DatabaseStorageDriver::connect_in_memory().await.unwrap();
        let err = driver.delete_file("data/global/nope", true).await.unwrap_err();
        assert!(err.is_not_found());
        assert!(driver.list_revisions("data").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_revision_author_and_shape() {
        let driver = DatabaseStorageDriver::connect_in_memory()
            .await
            .unwrap()
            .with_author("studio");
        driver.upsert_file("./data/bots/b1/x.json", b"{}", true).await.unwrap();

        let revs = driver.list_revisions("data/bots/b1").await.unwrap();
        assert_eq!(revs.len(), 1);
        assert_eq!(revs[0].path, "data/bots/b1/x.json");
        assert_eq!(revs[0].created_by, "studio");
        assert_eq!(revs[0].revision.len(), 8);
    }

    #[tokio::test]
    async fn test_revision_prefix_does_not_match_siblings() {
        let driver = DatabaseStorageDriver::connect_in_memory().await.unwrap();
        driver.upsert_file("data/bots/b1/x.json", b"{}", true).await.unwrap();
        driver.upsert_file("data/bots/b10/x.json", b"{}", true).await.unwrap();

        assert_eq!(driver.list_revisions("data/bots/b1").await.unwrap().len(), 1);
        assert_eq!(driver.list_revisions("data/bots").await.unwrap().len(), 2);
        assert_eq!(
            driver
                .list_revisions("data/bots/b1/x.json")
                .await
                .unwrap()
                .len(),
            1
        );
    }
}

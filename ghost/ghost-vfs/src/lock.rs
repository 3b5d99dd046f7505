//! Per-file advisory locks for the disk driver.
//!
//! Each physical file maps to a lock file named after the blake3 hash of its
//! absolute path, so any process on the host that uses the same lock
//! directory serializes on the same file. Acquisition is non-blocking and
//! retried with exponential backoff; after the retry budget is spent the
//! caller gets [`GhostError::LockTimeout`].
//!
//! `std::fs::File` grew inherent lock methods in Rust 1.89; the `fs2` trait
//! is called fully qualified to keep resolution unambiguous.

use fs2::FileExt;
use ghost_core::config::LockConfig;
use ghost_core::{GhostError, Result};
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Shared for readers, exclusive for writers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

/// Retry policy for lock acquisition.
#[derive(Debug, Clone)]
pub struct LockOptions {
    pub lock_dir: PathBuf,
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl LockOptions {
    pub fn new(lock_dir: impl Into<PathBuf>) -> Self {
        Self {
            lock_dir: lock_dir.into(),
            max_attempts: 10,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(500),
        }
    }

    /// Delay before attempt `attempt + 1` (zero-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

impl From<&LockConfig> for LockOptions {
    fn from(config: &LockConfig) -> Self {
        Self {
            lock_dir: config.lock_dir.clone(),
            max_attempts: config.max_attempts,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }
}

/// Held lock; released when dropped.
#[derive(Debug)]
pub struct FileLockGuard {
    file: File,
    lock_path: PathBuf,
}

impl FileLockGuard {
    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }
}

impl Drop for FileLockGuard {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            // Closing the handle releases the lock regardless.
            debug!("Failed to unlock {}: {}", self.lock_path.display(), e);
        }
    }
}

/// Lock file location for a physical path. Relative targets are resolved
/// against the working directory first.
pub fn lock_path_for(lock_dir: &Path, target: &Path) -> PathBuf {
    let absolute = absolute_target(target);
    let hash = blake3::hash(absolute.to_string_lossy().as_bytes());
    lock_dir.join(format!("{}.lock", hash.to_hex()))
}

/// Lexical: `.` and `..` are folded, symlinks are left alone.
fn absolute_target(target: &Path) -> PathBuf {
    let joined = match std::path::absolute(target) {
        Ok(path) => path,
        Err(_) => std::env::current_dir()
            .map(|cwd| cwd.join(target))
            .unwrap_or_else(|_| target.to_path_buf()),
    };

    let mut normalized = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other),
        }
    }
    normalized
}

/// Acquire a lock on `target`, retrying with backoff.
pub async fn acquire(
    options: &LockOptions,
    target: &Path,
    mode: LockMode,
) -> Result<FileLockGuard> {
    let lock_path = lock_path_for(&options.lock_dir, target);

    for attempt in 0..options.max_attempts {
        match try_acquire(&options.lock_dir, &lock_path, mode) {
            Ok(file) => {
                trace!(
                    "Acquired {:?} lock on {} (attempt {})",
                    mode,
                    target.display(),
                    attempt + 1
                );
                return Ok(FileLockGuard { file, lock_path });
            }
            Err(e) if is_contended(&e) => {
                let delay = options.backoff(attempt);
                trace!(
                    "Lock on {} busy, retrying in {:?}",
                    target.display(),
                    delay
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                return Err(GhostError::backend(
                    "lock",
                    target.display().to_string(),
                    e,
                ));
            }
        }
    }

    warn!(
        "Giving up on lock for {} after {} attempts",
        target.display(),
        options.max_attempts
    );
    Err(GhostError::lock_timeout(
        target.display().to_string(),
        options.max_attempts,
    ))
}

fn try_acquire(lock_dir: &Path, lock_path: &Path, mode: LockMode) -> io::Result<File> {
    std::fs::create_dir_all(lock_dir)?;
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(lock_path)?;

    match mode {
        LockMode::Shared => FileExt::try_lock_shared(&file)?,
        LockMode::Exclusive => FileExt::try_lock_exclusive(&file)?,
    }
    Ok(file)
}

fn is_contended(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock
        || e.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn options(dir: &TempDir, attempts: u32) -> LockOptions {
        LockOptions {
            lock_dir: dir.path().join("locks"),
            max_attempts: attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
        }
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let opts = LockOptions::new("/tmp/x");
        assert_eq!(opts.backoff(0), Duration::from_millis(10));
        assert_eq!(opts.backoff(1), Duration::from_millis(20));
        assert_eq!(opts.backoff(3), Duration::from_millis(80));
        assert_eq!(opts.backoff(10), Duration::from_millis(500));
        assert_eq!(opts.backoff(40), Duration::from_millis(500));
    }

    #[test]
    fn test_lock_path_is_stable_per_target() {
        let dir = Path::new("/locks");
        let a = lock_path_for(dir, Path::new("/data/a.json"));
        let b = lock_path_for(dir, Path::new("/data/b.json"));
        assert_eq!(a, lock_path_for(dir, Path::new("/data/a.json")));
        assert_ne!(a, b);
        assert!(a.starts_with(dir));
    }

    #[test]
    fn test_lock_path_ignores_path_spelling() {
        let dir = Path::new("/locks");
        let cwd = std::env::current_dir().unwrap();
        let absolute = lock_path_for(dir, &cwd.join("data/global/a.json"));

        assert_eq!(lock_path_for(dir, Path::new("data/global/a.json")), absolute);
        assert_eq!(lock_path_for(dir, Path::new("./data/global/a.json")), absolute);
        assert_eq!(
            lock_path_for(dir, Path::new("./data/bots/../global/a.json")),
            absolute
        );
    }

    #[tokio::test]
    async fn test_exclusive_lock_times_out_while_held() {
        let dir = TempDir::new().unwrap();
        let opts = options(&dir, 3);
        let target = dir.path().join("a.txt");

        let guard = acquire(&opts, &target, LockMode::Exclusive).await.unwrap();
        let err = acquire(&opts, &target, LockMode::Exclusive)
            .await
            .unwrap_err();
        assert!(err.is_lock_timeout());

        drop(guard);
        assert!(acquire(&opts, &target, LockMode::Exclusive).await.is_ok());
    }

    #[tokio::test]
    async fn test_shared_locks_coexist() {
        let dir = TempDir::new().unwrap();
        let opts = options(&dir, 2);
        let target = dir.path().join("a.txt");

        let _r1 = acquire(&opts, &target, LockMode::Shared).await.unwrap();
        let _r2 = acquire(&opts, &target, LockMode::Shared).await.unwrap();
        assert!(
            acquire(&opts, &target, LockMode::Exclusive)
                .await
                .unwrap_err()
                .is_lock_timeout()
        );
    }
}

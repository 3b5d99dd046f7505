#![allow(dead_code)]

use ghost_core::GhostConfig;
use ghost_vfs::{DatabaseStorageDriver, GhostService, MemoryObjectCache};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

/// Lock files live outside every scratch data root so listings never see them.
pub fn test_lock_dir() -> PathBuf {
    std::env::temp_dir().join("ghost-vfs-test-locks")
}

pub fn test_config(root: &Path) -> GhostConfig {
    let mut config = GhostConfig::default();
    config.storage.data_root = root.to_path_buf();
    config.storage.use_db_driver = true;
    config.lock.lock_dir = test_lock_dir();
    config.watcher.disabled = true;
    config
}

/// A service over a scratch data root and a private in-memory database.
pub async fn test_service(temp: &TempDir) -> Arc<GhostService> {
    let config = test_config(temp.path());
    let db = DatabaseStorageDriver::connect_in_memory().await.unwrap();
    let cache = Arc::new(MemoryObjectCache::new(16 * 1024 * 1024));
    Arc::new(GhostService::new(config, Some(db), cache).unwrap())
}

pub fn write_file(root: &Path, relative: &str, content: &[u8]) {
    let path = root.join(relative);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, content).unwrap();
}

pub fn read_file(root: &Path, relative: &str) -> Vec<u8> {
    std::fs::read(root.join(relative)).unwrap()
}

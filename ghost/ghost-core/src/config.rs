//! Configuration for the Ghost storage layer.
//!
//! Configuration is read from a TOML file, then environment variable
//! overrides are applied, then the result is validated.
//!
//! ```toml
//! [storage]
//! data_root = "/srv/app"
//! database_url = "sqlite:///srv/app/ghost.db"
//! use_db_driver = true
//!
//! [limits]
//! max_file_size = "100mb"
//! upload_concurrency = 50
//!
//! [lock]
//! max_attempts = 10
//! ```
//!
//! # Environment Variables
//!
//! - `GHOST_DATA_ROOT` - directory containing `data/`
//! - `GHOST_DATABASE_URL` - SQLite connection URL
//! - `GHOST_USE_DB_DRIVER` - use the database as primary storage
//! - `GHOST_MAX_FILE_SIZE` - per-file ceiling, human size (e.g. `100mb`)
//! - `GHOST_UPLOAD_CONCURRENCY` - in-flight file operations for bulk work
//! - `GHOST_CACHE_SIZE` - object cache budget, human size
//! - `GHOST_DISABLE_WATCHER` - skip the file-change watcher
//! - `GHOST_LOG_LEVEL` - log level

use crate::error::{GhostError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

// ============================================================================
// Environment Variable Names
// ============================================================================

pub const ENV_DATA_ROOT: &str = "GHOST_DATA_ROOT";
pub const ENV_DATABASE_URL: &str = "GHOST_DATABASE_URL";
pub const ENV_USE_DB_DRIVER: &str = "GHOST_USE_DB_DRIVER";
pub const ENV_MAX_FILE_SIZE: &str = "GHOST_MAX_FILE_SIZE";
pub const ENV_UPLOAD_CONCURRENCY: &str = "GHOST_UPLOAD_CONCURRENCY";
pub const ENV_CACHE_SIZE: &str = "GHOST_CACHE_SIZE";
pub const ENV_DISABLE_WATCHER: &str = "GHOST_DISABLE_WATCHER";
pub const ENV_LOG_LEVEL: &str = "GHOST_LOG_LEVEL";

// ============================================================================
// Configuration Structures
// ============================================================================

/// Top-level Ghost configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GhostConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub lock: LockConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub watcher: WatcherConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Where files live
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory that contains the `data/` tree
    #[serde(default = "default_data_root")]
    pub data_root: PathBuf,
    #[serde(default = "default_database_url")]
    pub database_url: String,
    /// Use the database as the primary driver for the standard scopes
    #[serde(default)]
    pub use_db_driver: bool,
    /// Ignore file, relative to `data_root`
    #[serde(default = "default_ignore_file")]
    pub ignore_file: PathBuf,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

/// Per-file ceilings and bulk concurrency
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_max_file_size")]
    pub max_file_size: String,
    #[serde(default = "default_max_model_file_size")]
    pub max_model_file_size: String,
    #[serde(default = "default_model_extension")]
    pub model_extension: String,
    #[serde(default = "default_upload_concurrency")]
    pub upload_concurrency: usize,
}

/// Advisory lock retry policy for the disk driver
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    #[serde(default = "default_lock_dir")]
    pub lock_dir: PathBuf,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_size")]
    pub max_size: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatcherConfig {
    #[serde(default)]
    pub disabled: bool,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

// ============================================================================
// Defaults
// ============================================================================

fn default_log_level() -> String {
    "info".to_string()
}

fn default_data_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_database_url() -> String {
    "sqlite://ghost.db?mode=rwc".to_string()
}

fn default_ignore_file() -> PathBuf {
    PathBuf::from("data/.ghostignore")
}

fn default_max_connections() -> u32 {
    5
}

fn default_max_file_size() -> String {
    "100mb".to_string()
}

fn default_max_model_file_size() -> String {
    "500mb".to_string()
}

fn default_model_extension() -> String {
    ".model".to_string()
}

fn default_upload_concurrency() -> usize {
    50
}

fn default_lock_dir() -> PathBuf {
    std::env::temp_dir().join("ghost-locks")
}

fn default_max_attempts() -> u32 {
    10
}

fn default_base_delay_ms() -> u64 {
    10
}

fn default_max_delay_ms() -> u64 {
    500
}

fn default_cache_size() -> String {
    "64mb".to_string()
}

fn default_debounce_ms() -> u64 {
    100
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_root: default_data_root(),
            database_url: default_database_url(),
            use_db_driver: false,
            ignore_file: default_ignore_file(),
            max_connections: default_max_connections(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_file_size: default_max_file_size(),
            max_model_file_size: default_max_model_file_size(),
            model_extension: default_model_extension(),
            upload_concurrency: default_upload_concurrency(),
        }
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            lock_dir: default_lock_dir(),
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: default_cache_size(),
        }
    }
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            disabled: false,
            debounce_ms: default_debounce_ms(),
        }
    }
}

// ============================================================================
// Loading, Overrides and Validation
// ============================================================================

impl GhostConfig {
    /// Load configuration from a TOML file, apply environment overrides and validate.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if the
    /// resulting configuration is invalid
    pub async fn load_from_path(path: &Path) -> Result<Self> {
        debug!("Loading configuration from: {}", path.display());

        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| GhostError::config(format!("Failed to read config file: {}", e)))?;

        let mut config = Self::from_toml_str(&content)?;
        config.merge_env_vars()?;
        config.validate()?;

        info!("Configuration loaded successfully from {}", path.display());
        Ok(config)
    }

    /// Load from `path` when given, otherwise start from defaults.
    /// Environment overrides and validation apply in both cases.
    pub async fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load_from_path(path).await,
            None => {
                let mut config = Self::default();
                config.merge_env_vars()?;
                config.validate()?;
                Ok(config)
            }
        }
    }

    /// Parse configuration from TOML text without overrides or validation
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| GhostError::config(format!("Failed to parse config file: {}", e)))
    }

    /// Serialize configuration to TOML
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| GhostError::config(format!("Failed to serialize config: {}", e)))
    }

    /// Merge overrides from the process environment
    ///
    /// # Errors
    ///
    /// Returns an error if environment variables contain invalid values
    pub fn merge_env_vars(&mut self) -> Result<()> {
        self.merge_env_vars_from(|key| std::env::var(key).ok())
    }

    /// Merge overrides from an arbitrary variable source
    pub fn merge_env_vars_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        debug!("Merging environment variable overrides");

        if let Some(log_level) = lookup(ENV_LOG_LEVEL) {
            debug!("Overriding log_level from environment: {}", log_level);
            self.general.log_level = log_level;
        }

        if let Some(data_root) = lookup(ENV_DATA_ROOT) {
            debug!("Overriding data_root from environment: {}", data_root);
            self.storage.data_root = PathBuf::from(data_root);
        }

        if let Some(url) = lookup(ENV_DATABASE_URL) {
            debug!("Overriding database_url from environment");
            self.storage.database_url = url;
        }

        if let Some(flag) = lookup(ENV_USE_DB_DRIVER) {
            self.storage.use_db_driver = parse_bool(ENV_USE_DB_DRIVER, &flag)?;
        }

        if let Some(size) = lookup(ENV_MAX_FILE_SIZE) {
            parse_size(&size).map_err(|e| {
                GhostError::config(format!("Invalid {} in environment: {}", ENV_MAX_FILE_SIZE, e))
            })?;
            self.limits.max_file_size = size;
        }

        if let Some(concurrency) = lookup(ENV_UPLOAD_CONCURRENCY) {
            let value = concurrency.parse::<usize>().map_err(|e| {
                GhostError::config(format!(
                    "Invalid upload concurrency in environment: {}",
                    e
                ))
            })?;
            debug!("Overriding upload_concurrency from environment: {}", value);
            self.limits.upload_concurrency = value;
        }

        if let Some(size) = lookup(ENV_CACHE_SIZE) {
            parse_size(&size).map_err(|e| {
                GhostError::config(format!("Invalid cache size in environment: {}", e))
            })?;
            self.cache.max_size = size;
        }

        if let Some(flag) = lookup(ENV_DISABLE_WATCHER) {
            self.watcher.disabled = parse_bool(ENV_DISABLE_WATCHER, &flag)?;
        }

        Ok(())
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns an error if any configuration values are invalid
    pub fn validate(&self) -> Result<()> {
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.general.log_level.as_str()) {
            return Err(GhostError::config(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.general.log_level,
                valid_log_levels.join(", ")
            )));
        }

        if self.max_file_size_bytes()? == 0 {
            return Err(GhostError::config("max_file_size must be greater than 0"));
        }
        self.max_model_file_size_bytes()?;

        if self.limits.upload_concurrency == 0 {
            return Err(GhostError::config(
                "upload_concurrency must be greater than 0",
            ));
        }

        if self.lock.max_attempts == 0 {
            return Err(GhostError::config("lock max_attempts must be greater than 0"));
        }

        if self.lock.base_delay_ms > self.lock.max_delay_ms {
            return Err(GhostError::config(
                "lock base_delay_ms cannot be greater than max_delay_ms",
            ));
        }

        if self.storage.max_connections == 0 {
            return Err(GhostError::config("max_connections must be greater than 0"));
        }

        if self.cache_size_bytes()? == 0 {
            warn!("Cache size is 0, caching will be disabled");
        }

        debug!("Configuration validation passed");
        Ok(())
    }

    pub fn max_file_size_bytes(&self) -> Result<u64> {
        parse_size(&self.limits.max_file_size)
    }

    pub fn max_model_file_size_bytes(&self) -> Result<u64> {
        parse_size(&self.limits.max_model_file_size)
    }

    pub fn cache_size_bytes(&self) -> Result<u64> {
        parse_size(&self.cache.max_size)
    }

    /// Absolute location of the ignore file
    pub fn ignore_file_path(&self) -> PathBuf {
        self.storage.data_root.join(&self.storage.ignore_file)
    }
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => Err(GhostError::config(format!(
            "Invalid boolean for {}: '{}'",
            name, other
        ))),
    }
}

/// Parse a human readable size such as `500kb`, `100mb`, `1.5gb` or `1024`.
///
/// Units are binary (1kb = 1024 bytes) and case-insensitive.
pub fn parse_size(input: &str) -> Result<u64> {
    let trimmed = input.trim().to_ascii_lowercase();
    if trimmed.is_empty() {
        return Err(GhostError::config("Empty size"));
    }

    let split = trimmed
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(trimmed.len());
    let (number, unit) = trimmed.split_at(split);

    let multiplier: u64 = match unit.trim() {
        "" | "b" => 1,
        "kb" | "k" => 1 << 10,
        "mb" | "m" => 1 << 20,
        "gb" | "g" => 1 << 30,
        "tb" | "t" => 1 << 40,
        other => {
            return Err(GhostError::config(format!(
                "Unknown size unit '{}' in '{}'",
                other, input
            )));
        }
    };

    let value: f64 = number
        .parse()
        .map_err(|_| GhostError::config(format!("Invalid size '{}'", input)))?;

    Ok((value * multiplier as f64).floor() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = GhostConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_file_size_bytes().unwrap(), 100 * 1024 * 1024);
        assert_eq!(config.max_model_file_size_bytes().unwrap(), 500 * 1024 * 1024);
        assert_eq!(config.limits.upload_concurrency, 50);
        assert_eq!(config.limits.model_extension, ".model");
        assert!(!config.storage.use_db_driver);
    }

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("1024").unwrap(), 1024);
        assert_eq!(parse_size("24b").unwrap(), 24);
        assert_eq!(parse_size("500kb").unwrap(), 500 * 1024);
        assert_eq!(parse_size("100MB").unwrap(), 100 * 1024 * 1024);
        assert_eq!(parse_size("1gb").unwrap(), 1024 * 1024 * 1024);
        assert_eq!(parse_size("1.5kb").unwrap(), 1536);
        assert_eq!(parse_size(" 2 mb ").unwrap(), 2 * 1024 * 1024);
        assert!(parse_size("").is_err());
        assert!(parse_size("ten").is_err());
        assert!(parse_size("10 parsecs").is_err());
    }

    #[test]
    fn test_env_var_overrides() {
        let mut config = GhostConfig::default();
        config
            .merge_env_vars_from(env_of(&[
                (ENV_LOG_LEVEL, "debug"),
                (ENV_DATA_ROOT, "/srv/bot"),
                (ENV_USE_DB_DRIVER, "true"),
                (ENV_MAX_FILE_SIZE, "10mb"),
                (ENV_UPLOAD_CONCURRENCY, "8"),
                (ENV_DISABLE_WATCHER, "1"),
            ]))
            .unwrap();

        assert_eq!(config.general.log_level, "debug");
        assert_eq!(config.storage.data_root, PathBuf::from("/srv/bot"));
        assert!(config.storage.use_db_driver);
        assert_eq!(config.max_file_size_bytes().unwrap(), 10 * 1024 * 1024);
        assert_eq!(config.limits.upload_concurrency, 8);
        assert!(config.watcher.disabled);
    }

    #[test]
    fn test_invalid_env_var() {
        let mut config = GhostConfig::default();
        assert!(
            config
                .merge_env_vars_from(env_of(&[(ENV_UPLOAD_CONCURRENCY, "lots")]))
                .is_err()
        );
        assert!(
            config
                .merge_env_vars_from(env_of(&[(ENV_CACHE_SIZE, "big")]))
                .is_err()
        );
        assert!(
            config
                .merge_env_vars_from(env_of(&[(ENV_USE_DB_DRIVER, "maybe")]))
                .is_err()
        );
    }

    #[test]
    fn test_validation() {
        let mut config = GhostConfig::default();

        config.general.log_level = "loud".to_string();
        assert!(config.validate().is_err());
        config.general.log_level = "info".to_string();

        config.limits.upload_concurrency = 0;
        assert!(config.validate().is_err());
        config.limits.upload_concurrency = 50;

        config.lock.base_delay_ms = 1000;
        assert!(config.validate().is_err());
        config.lock.base_delay_ms = 10;

        config.limits.max_file_size = "huge".to_string();
        assert!(config.validate().is_err());
        config.limits.max_file_size = "100mb".to_string();

        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = GhostConfig::from_toml_str(
            r#"
            [storage]
            use_db_driver = true

            [limits]
            upload_concurrency = 4
            "#,
        )
        .unwrap();

        assert!(config.storage.use_db_driver);
        assert_eq!(config.limits.upload_concurrency, 4);
        assert_eq!(config.limits.max_file_size, "100mb");
        assert_eq!(config.lock.max_attempts, 10);
        assert_eq!(config.storage.ignore_file, PathBuf::from("data/.ghostignore"));
    }

    #[tokio::test]
    async fn test_load_from_path() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("ghost.toml");

        let mut config = GhostConfig::default();
        config.storage.data_root = temp_dir.path().to_path_buf();
        config.cache.max_size = "1mb".to_string();
        tokio::fs::write(&path, config.to_toml_string().unwrap())
            .await
            .unwrap();

        let loaded = GhostConfig::load_from_path(&path).await.unwrap();
        assert_eq!(loaded.storage.data_root, temp_dir.path());
        assert_eq!(loaded.cache_size_bytes().unwrap(), 1024 * 1024);
        assert_eq!(
            loaded.ignore_file_path(),
            temp_dir.path().join("data/.ghostignore")
        );
    }

    #[tokio::test]
    async fn test_load_missing_file_fails() {
        let temp_dir = TempDir::new().unwrap();
        let result = GhostConfig::load_from_path(&temp_dir.path().join("nope.toml")).await;
        assert!(matches!(result, Err(GhostError::Config(_))));
    }
}

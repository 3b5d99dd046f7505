//! Error types for the Ghost storage layer.

/// Result type alias for Ghost operations.
pub type Result<T> = std::result::Result<T, GhostError>;

/// Main error type for the Ghost storage layer.
#[derive(Debug, thiserror::Error)]
pub enum GhostError {
    /// Read or delete of a path that does not exist (or is soft-deleted)
    #[error("File not found: {path}")]
    NotFound { path: String },

    /// Advisory lock could not be acquired within the retry budget
    #[error("Could not acquire lock on {path} after {attempts} attempts")]
    LockTimeout { path: String, attempts: u32 },

    /// Write rejected by the per-file size ceiling
    #[error("The size of the file {path} ({size} bytes) is over the {limit} bytes limit")]
    SizeLimitExceeded { path: String, size: u64, limit: u64 },

    /// Write or delete rejected because the owning bot is locked
    #[error("Bot locked: {scope}")]
    ScopeLocked { scope: String },

    /// Operation not permitted under this scope
    #[error("Invalid scope: {0}")]
    InvalidScope(String),

    /// Wrapped driver-level failure
    #[error("Backend error during {operation} on {path}: {message}")]
    Backend {
        operation: String,
        path: String,
        message: String,
    },

    /// File content is not valid JSON
    #[error("SyntaxError in your JSON: {path}: {message}")]
    InvalidJson { path: String, message: String },

    /// Bot identifier rejected by validation
    #[error("Invalid botId \"{0}\"")]
    InvalidBotId(String),

    /// Malformed path
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Archive creation or extraction errors
    #[error("Archive error: {0}")]
    Archive(String),

    /// File watcher errors
    #[error("Watcher error: {0}")]
    Watcher(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl GhostError {
    /// Create a new not found error
    pub fn not_found(path: impl Into<String>) -> Self {
        Self::NotFound { path: path.into() }
    }

    /// Create a new lock timeout error
    pub fn lock_timeout(path: impl Into<String>, attempts: u32) -> Self {
        Self::LockTimeout {
            path: path.into(),
            attempts,
        }
    }

    /// Create a new size limit error
    pub fn size_limit(path: impl Into<String>, size: u64, limit: u64) -> Self {
        Self::SizeLimitExceeded {
            path: path.into(),
            size,
            limit,
        }
    }

    /// Create a new scope locked error
    pub fn scope_locked(scope: impl Into<String>) -> Self {
        Self::ScopeLocked {
            scope: scope.into(),
        }
    }

    /// Create a new invalid scope error
    pub fn invalid_scope(msg: impl Into<String>) -> Self {
        Self::InvalidScope(msg.into())
    }

    /// Wrap a driver failure with the operation and path it happened on
    pub fn backend(
        operation: impl Into<String>,
        path: impl Into<String>,
        message: impl std::fmt::Display,
    ) -> Self {
        Self::Backend {
            operation: operation.into(),
            path: path.into(),
            message: message.to_string(),
        }
    }

    /// Create a new invalid JSON error
    pub fn invalid_json(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidJson {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create a new invalid path error
    pub fn invalid_path(msg: impl Into<String>) -> Self {
        Self::InvalidPath(msg.into())
    }

    /// Create a new config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new archive error
    pub fn archive(msg: impl Into<String>) -> Self {
        Self::Archive(msg.into())
    }

    /// Create a new watcher error
    pub fn watcher(msg: impl Into<String>) -> Self {
        Self::Watcher(msg.into())
    }

    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Check if this is a not found error.
    ///
    /// Backend errors wrapping an OS "not found" are treated the same so that
    /// listing callers can tolerate missing directories.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound { .. } => true,
            Self::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }

    /// Check if this is a lock timeout
    pub fn is_lock_timeout(&self) -> bool {
        matches!(self, Self::LockTimeout { .. })
    }

    /// Check if this is a backend error
    pub fn is_backend(&self) -> bool {
        matches!(self, Self::Backend { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_error_carries_context() {
        let err = GhostError::backend("upsert", "data/global/a.json", "disk full");
        let msg = err.to_string();
        assert!(msg.contains("upsert"));
        assert!(msg.contains("data/global/a.json"));
        assert!(msg.contains("disk full"));
        assert!(err.is_backend());
    }

    #[test]
    fn test_is_not_found() {
        assert!(GhostError::not_found("a.txt").is_not_found());

        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert!(GhostError::from(io).is_not_found());

        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope");
        assert!(!GhostError::from(io).is_not_found());
        assert!(!GhostError::lock_timeout("a", 3).is_not_found());
    }

    #[test]
    fn test_size_limit_message() {
        let err = GhostError::size_limit("big.bin", 200, 100);
        assert_eq!(
            err.to_string(),
            "The size of the file big.bin (200 bytes) is over the 100 bytes limit"
        );
    }
}

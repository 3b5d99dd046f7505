//! Core types shared by the Ghost storage layer.
//!
//! This crate provides the error taxonomy, configuration loading and the
//! revision identifiers used by every Ghost component.

pub mod config;
pub mod error;
pub mod id;

pub use config::{GhostConfig, parse_size};
pub use error::{GhostError, Result};
pub use id::RevisionId;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::GhostConfig;
    pub use crate::error::{GhostError, Result};
    pub use crate::id::RevisionId;
}

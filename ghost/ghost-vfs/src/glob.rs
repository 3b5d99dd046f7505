//! Glob filtering for directory listings and revision sets.

use ghost_core::{GhostError, Result};
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};

/// Paths never carried over by bulk diffing and export.
pub const BULK_IGNORED_FILES: &[&str] = &[
    "models/**",
    "data/bots/*/models/**",
    "**/*.js.map",
    "data/bots/*/libraries/node_modules/**",
];

/// Extensions for which a line-level diff is computed.
pub const DIFFABLE_EXTENSIONS: &[&str] = &[".js", ".json", ".txt", ".csv", ".yaml"];

/// Default include pattern for scoped listings.
pub const DEFAULT_LISTING_PATTERN: &str = "*.*";

/// A compiled set of glob patterns.
///
/// Matching is case-insensitive and `*` never crosses a `/`. A pattern
/// without a `/` matches against the file name anywhere in the tree.
/// Unless `dot` is set, paths with a hidden segment only match patterns that
/// name that segment explicitly.
#[derive(Debug, Clone)]
pub struct GlobFilter {
    set: GlobSet,
    dot: bool,
    explicit_dot: bool,
    empty: bool,
}

impl GlobFilter {
    /// Compile `patterns`. `dot` controls whether hidden paths can match.
    pub fn new<S: AsRef<str>>(patterns: &[S], dot: bool) -> Result<Self> {
        let mut builder = GlobSetBuilder::new();
        let mut explicit_dot = false;

        for raw in patterns {
            let pattern = normalize_pattern(raw.as_ref());
            if pattern.is_empty() {
                continue;
            }
            explicit_dot |= pattern.starts_with('.') || pattern.contains("/.");

            let glob = GlobBuilder::new(&pattern)
                .case_insensitive(true)
                .literal_separator(true)
                .build()
                .map_err(|e| {
                    GhostError::invalid_path(format!("Invalid glob '{}': {}", raw.as_ref(), e))
                })?;
            builder.add(glob);
        }

        let set = builder
            .build()
            .map_err(|e| GhostError::invalid_path(format!("Invalid glob set: {}", e)))?;

        Ok(Self {
            empty: set.is_empty(),
            set,
            dot,
            explicit_dot,
        })
    }

    /// Filter used for exclusions: hidden files are matchable.
    pub fn excludes<S: AsRef<str>>(patterns: &[S]) -> Result<Self> {
        Self::new(patterns, true)
    }

    pub fn is_empty(&self) -> bool {
        self.empty
    }

    pub fn is_match(&self, path: &str) -> bool {
        if self.empty {
            return false;
        }

        let candidate = path.trim_start_matches("./").trim_start_matches('/');
        if !self.dot && !self.explicit_dot && has_hidden_segment(candidate) {
            return false;
        }

        self.set.is_match(candidate)
    }

    /// Keep the items whose key matches.
    pub fn retain<T, F>(&self, items: Vec<T>, key: F) -> Vec<T>
    where
        F: Fn(&T) -> &str,
    {
        items.into_iter().filter(|i| self.is_match(key(i))).collect()
    }

    /// Drop the items whose key matches.
    pub fn reject<T, F>(&self, items: Vec<T>, key: F) -> Vec<T>
    where
        F: Fn(&T) -> &str,
    {
        items.into_iter().filter(|i| !self.is_match(key(i))).collect()
    }
}

fn normalize_pattern(raw: &str) -> String {
    let pattern = raw
        .trim()
        .trim_start_matches("./")
        .trim_start_matches('/')
        .replace('\\', "/");

    if pattern.is_empty() || pattern.contains('/') {
        pattern
    } else {
        format!("**/{}", pattern)
    }
}

fn has_hidden_segment(path: &str) -> bool {
    path.split('/').any(|s| s.starts_with('.') && s != "." && s != "..")
}

/// Whether a file extension (with dot) gets a line-level diff.
pub fn is_diffable(extension: Option<&str>) -> bool {
    extension
        .map(|ext| DIFFABLE_EXTENSIONS.contains(&ext))
        .unwrap_or(false)
}

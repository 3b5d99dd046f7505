//! Forward-slash paths used to address Ghost files.
//!
//! A Ghost path is a list of segments plus an absolute flag. Scope paths such
//! as `data/bots/my-bot/flows/main.flow.json` are relative to the data root;
//! custom scopes (temporary trees, archive imports) may be absolute.
//! Backslashes are treated as separators and `.`/`..` are resolved eagerly,
//! so a relative path can never climb above its first segment.

use ghost_core::{GhostError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Characters removed from every segment by [`sanitize_segment`].
const ILLEGAL_CHARS: &[char] = &['/', '?', '<', '>', '\\', ':', '*', '|', '"'];

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GhostPath {
    segments: Vec<String>,
    is_absolute: bool,
}

impl GhostPath {
    /// Parse a path string.
    ///
    /// Separators are normalized to `/`; empty and `.` segments are dropped
    /// and `..` pops the previous segment.
    pub fn new(path: &str) -> Result<Self> {
        let normalized = path.trim().replace('\\', "/");
        let is_absolute = normalized.starts_with('/');
        let mut out = Self {
            segments: Vec::new(),
            is_absolute,
        };
        out.push_all(&normalized)?;
        Ok(out)
    }

    /// The empty relative path.
    pub fn root() -> Self {
        Self {
            segments: Vec::new(),
            is_absolute: false,
        }
    }

    /// Build a path from a physical location, relative to `base`.
    pub fn from_physical(physical: &Path, base: &Path) -> Result<Self> {
        let relative = physical.strip_prefix(base).map_err(|_| {
            GhostError::invalid_path(format!(
                "{} is not under {}",
                physical.display(),
                base.display()
            ))
        })?;

        let path_str = relative.to_str().ok_or_else(|| {
            GhostError::invalid_path(format!("{} is not valid UTF-8", relative.display()))
        })?;

        Self::new(path_str)
    }

    /// Join another path onto this one. A leading `/` on `other` is ignored.
    pub fn join(&self, other: &str) -> Result<Self> {
        let mut joined = self.clone();
        joined.push_all(&other.replace('\\', "/"))?;
        Ok(joined)
    }

    fn push_all(&mut self, path: &str) -> Result<()> {
        for segment in path.split('/') {
            match segment {
                "" | "." => continue,
                ".." => {
                    self.segments.pop();
                }
                s => {
                    if s.contains('\0') {
                        return Err(GhostError::invalid_path(format!(
                            "NUL byte in path segment {:?}",
                            s
                        )));
                    }
                    self.segments.push(s.to_string());
                }
            }
        }
        Ok(())
    }

    /// Strip unsafe characters from every segment, dropping segments left empty.
    pub fn sanitized(&self) -> Self {
        Self {
            segments: self
                .segments
                .iter()
                .map(|s| sanitize_segment(s))
                .filter(|s| !s.is_empty())
                .collect(),
            is_absolute: self.is_absolute,
        }
    }

    /// Sanitize only the final segment.
    pub fn with_sanitized_file_name(&self) -> Self {
        let mut out = self.clone();
        if let Some(last) = out.segments.pop() {
            let clean = sanitize_segment(&last);
            if !clean.is_empty() {
                out.segments.push(clean);
            }
        }
        out
    }

    pub fn parent(&self) -> Option<Self> {
        if self.segments.is_empty() {
            return None;
        }

        let mut segments = self.segments.clone();
        segments.pop();

        Some(Self {
            segments,
            is_absolute: self.is_absolute,
        })
    }

    pub fn file_name(&self) -> Option<&str> {
        self.segments.last().map(|s| s.as_str())
    }

    /// Extension including the leading dot, e.g. `.json`.
    ///
    /// Dotfiles such as `.ghostignore` have no extension.
    pub fn extension(&self) -> Option<&str> {
        let name = self.file_name()?;
        let idx = name.rfind('.')?;
        if idx == 0 { None } else { Some(&name[idx..]) }
    }

    /// Segment-wise prefix test.
    pub fn starts_with(&self, base: &GhostPath) -> bool {
        self.is_absolute == base.is_absolute
            && base.segments.len() <= self.segments.len()
            && self
                .segments
                .iter()
                .zip(base.segments.iter())
                .all(|(a, b)| a == b)
    }

    /// The remainder of this path below `base`, as a relative path.
    pub fn strip_prefix(&self, base: &GhostPath) -> Option<GhostPath> {
        if !self.starts_with(base) {
            return None;
        }
        Some(Self {
            segments: self.segments[base.segments.len()..].to_vec(),
            is_absolute: false,
        })
    }

    pub fn first_segment(&self) -> Option<&str> {
        self.segments.first().map(|s| s.as_str())
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn is_absolute(&self) -> bool {
        self.is_absolute
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// String form with a trailing slash, used for prefix matching on folders.
    pub fn as_dir_prefix(&self) -> String {
        let s = self.to_string();
        if s.is_empty() || s.ends_with('/') {
            s
        } else {
            format!("{}/", s)
        }
    }

    /// Resolve against a physical base. Absolute paths ignore the base.
    pub fn to_physical(&self, base: &Path) -> PathBuf {
        let mut physical = if self.is_absolute {
            PathBuf::from("/")
        } else {
            base.to_path_buf()
        };
        for segment in &self.segments {
            physical.push(segment);
        }
        physical
    }
}

impl fmt::Display for GhostPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_absolute {
            write!(f, "/{}", self.segments.join("/"))
        } else {
            write!(f, "{}", self.segments.join("/"))
        }
    }
}

/// Remove characters that are unsafe in file names on any platform.
pub fn sanitize_segment(segment: &str) -> String {
    segment
        .chars()
        .filter(|c| !ILLEGAL_CHARS.contains(c) && !c.is_control())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_path() {
        let path = GhostPath::new("data/global/config.json").unwrap();
        assert_eq!(path.segments(), &["data", "global", "config.json"]);
        assert_eq!(path.to_string(), "data/global/config.json");
        assert!(!path.is_absolute());
    }

    #[test]
    fn test_absolute_path_is_kept() {
        let path = GhostPath::new("/tmp/export/data/global").unwrap();
        assert!(path.is_absolute());
        assert_eq!(path.to_string(), "/tmp/export/data/global");
        assert_eq!(
            path.to_physical(Path::new("/srv")),
            PathBuf::from("/tmp/export/data/global")
        );
    }

    #[test]
    fn test_backslashes_and_dots() {
        let path = GhostPath::new(".\\data\\bots\\b1\\..\\b2\\.\\flows").unwrap();
        assert_eq!(path.to_string(), "data/bots/b2/flows");
    }

    #[test]
    fn test_dotdot_cannot_escape_relative_root() {
        let path = GhostPath::new("data").unwrap().join("../../etc/passwd").unwrap();
        assert_eq!(path.to_string(), "etc/passwd");
    }

    #[test]
    fn test_join_ignores_leading_slash() {
        let base = GhostPath::new("./data/global").unwrap();
        assert_eq!(base.join("/").unwrap().to_string(), "data/global");
        assert_eq!(
            base.join("/actions/hello.js").unwrap().to_string(),
            "data/global/actions/hello.js"
        );
    }

    #[test]
    fn test_sanitize() {
        assert_eq!(sanitize_segment("we?ird<na>me*.json"), "weirdname.json");
        assert_eq!(sanitize_segment("tab\there"), "tabhere");

        let path = GhostPath::new("data/gl|obal/\"x\"/a:b.txt").unwrap().sanitized();
        assert_eq!(path.to_string(), "data/global/x/ab.txt");

        let path = GhostPath::new("data/**/a.txt").unwrap().sanitized();
        assert_eq!(path.to_string(), "data/a.txt");
    }

    #[test]
    fn test_sanitize_file_name_only() {
        let path = GhostPath::new("/C:/in:put/fi:le.txt")
            .unwrap()
            .with_sanitized_file_name();
        assert_eq!(path.to_string(), "/C:/in:put/file.txt");
    }

    #[test]
    fn test_extension() {
        assert_eq!(
            GhostPath::new("a/b/flow.json").unwrap().extension(),
            Some(".json")
        );
        assert_eq!(
            GhostPath::new("a/b/archive.tar.gz").unwrap().extension(),
            Some(".gz")
        );
        assert_eq!(GhostPath::new("Makefile").unwrap().extension(), None);
        assert_eq!(GhostPath::new(".ghostignore").unwrap().extension(), None);
    }

    #[test]
    fn test_strip_prefix() {
        let base = GhostPath::new("data/global").unwrap();
        let file = GhostPath::new("data/global/a/1.txt").unwrap();
        assert_eq!(file.strip_prefix(&base).unwrap().to_string(), "a/1.txt");
        assert_eq!(
            file.strip_prefix(&base).unwrap().first_segment(),
            Some("a")
        );

        let other = GhostPath::new("data/globalx/a.txt").unwrap();
        assert!(other.strip_prefix(&base).is_none());
    }

    #[test]
    fn test_dir_prefix() {
        assert_eq!(
            GhostPath::new("data/global").unwrap().as_dir_prefix(),
            "data/global/"
        );
        assert_eq!(GhostPath::root().as_dir_prefix(), "");
    }

    #[test]
    fn test_from_physical() {
        let vpath =
            GhostPath::from_physical(Path::new("/srv/app/data/x.json"), Path::new("/srv/app"))
                .unwrap();
        assert_eq!(vpath.to_string(), "data/x.json");
        assert!(GhostPath::from_physical(Path::new("/other"), Path::new("/srv")).is_err());
    }

    #[test]
    fn test_nul_rejected() {
        assert!(GhostPath::new("a/b\0c").is_err());
    }
}

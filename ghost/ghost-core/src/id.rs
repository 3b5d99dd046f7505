//! Revision identifiers.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Length of a generated revision id.
pub const REVISION_ID_LEN: usize = 8;

/// A short opaque revision identifier.
///
/// Generated ids are 8 characters from the URL-safe base64 alphabet, drawn
/// from 48 random bits of a UUIDv4. Ids read back from storage are kept
/// verbatim whatever their shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RevisionId(String);

impl RevisionId {
    /// Generate a fresh random id
    pub fn new() -> Self {
        let uuid = Uuid::new_v4();
        // The first six bytes of a v4 uuid are fully random.
        let encoded = URL_SAFE_NO_PAD.encode(&uuid.as_bytes()[..6]);
        Self(encoded)
    }

    /// Wrap an existing id
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl Default for RevisionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RevisionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for RevisionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<RevisionId> for String {
    fn from(id: RevisionId) -> Self {
        id.0
    }
}

//! Hierarchical storage paths.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::FileError;

/// A slash-delimited absolute path of ASCII-identifier components, e.g.
/// `/revision/37/change`. Equivalent to a hierarchical key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StoragePath(String);

fn valid_component(c: &str) -> bool {
    !c.is_empty() && c.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_')
}

impl StoragePath {
    pub fn parse(s: &str) -> Result<Self, FileError> {
        let Some(rest) = s.strip_prefix('/') else {
            return Err(FileError::BadSpec(format!("relative storage path {s:?}")));
        };
        if rest.is_empty() || !rest.split('/').all(valid_component) {
            return Err(FileError::BadSpec(format!("malformed storage path {s:?}")));
        }
        Ok(Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn components(&self) -> impl Iterator<Item = &str> {
        self.0[1..].split('/')
    }

    /// Child path with one more component.
    pub fn join(&self, component: &str) -> Result<Self, FileError> {
        if !valid_component(component) {
            return Err(FileError::BadSpec(format!("bad path component {component:?}")));
        }
        Ok(Self(format!("{}/{component}", self.0)))
    }

    /// Child path with a numeric component; always valid.
    pub fn join_index(&self, n: u64) -> Self {
        Self(format!("{}/{n}", self.0))
    }

    pub fn last_component(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or("")
    }

    /// Final component parsed as a revision number, if it is one.
    pub fn index_suffix(&self) -> Option<u64> {
        self.last_component().parse().ok()
    }

    /// Component-wise prefix test; a path is not its own strict prefix.
    pub fn is_strict_prefix_of(&self, other: &StoragePath) -> bool {
        other.0.len() > self.0.len()
            && other.0.starts_with(&self.0)
            && other.0.as_bytes()[self.0.len()] == b'/'
    }

    /// Whether `other` is exactly one component below `self`.
    pub fn is_parent_of(&self, other: &StoragePath) -> bool {
        self.is_strict_prefix_of(other)
            && !other.0[self.0.len() + 1..].contains('/')
    }
}

impl fmt::Display for StoragePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for StoragePath {
    type Error = FileError;

    fn try_from(s: String) -> Result<Self, FileError> {
        Self::parse(&s)
    }
}

impl From<StoragePath> for String {
    fn from(p: StoragePath) -> String {
        p.0
    }
}

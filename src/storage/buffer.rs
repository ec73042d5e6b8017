//! Immutable, content-addressed byte buffers.

use std::fmt;
use std::sync::Arc;

use sha2::{Digest, Sha256};

use super::FileError;

/// SHA-256 content hash, lowercase hex.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BufferHash(String);

impl BufferHash {
    pub fn of(bytes: &[u8]) -> Self {
        Self(hex::encode(Sha256::digest(bytes)))
    }

    pub fn parse(s: &str) -> Result<Self, FileError> {
        let ok = s.len() == 64 && s.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase());
        if ok {
            Ok(Self(s.to_string()))
        } else {
            Err(FileError::BadSpec(format!("malformed buffer hash {s:?}")))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BufferHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Immutable byte buffer with an eagerly computed content hash. Storage
/// paths bind to buffers by value; blobs are addressed by hash.
#[derive(Clone)]
pub struct FrozenBuffer {
    bytes: Arc<[u8]>,
    hash: BufferHash,
}

impl FrozenBuffer {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        let bytes: Arc<[u8]> = bytes.into().into();
        let hash = BufferHash::of(&bytes);
        Self { bytes, hash }
    }

    pub fn from_utf8(s: &str) -> Self {
        Self::new(s.as_bytes().to_vec())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn hash(&self) -> &BufferHash {
        &self.hash
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn to_utf8(&self) -> Result<&str, FileError> {
        std::str::from_utf8(&self.bytes)
            .map_err(|_| FileError::BadData("buffer is not UTF-8".into()))
    }
}

impl PartialEq for FrozenBuffer {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl Eq for FrozenBuffer {}

impl fmt::Debug for FrozenBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FrozenBuffer({} bytes, {})", self.bytes.len(), &self.hash.as_str()[..12])
    }
}

//! Persistent key/value store with optimistic concurrency.
//!
//! Every stored value carries an [`ETag`]. Writes state what they expect the
//! current version to be; a write against a stale version fails with
//! [`Error::Conflict`](crate::error::Error::Conflict) naming the key and store.

pub mod codec;
pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub use codec::TypedDictionary;
pub use memory::InMemoryDictionary;

/// Version token of a stored value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ETag(pub i64);

impl std::fmt::Display for ETag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "\"{}\"", self.0)
    }
}

/// Precondition attached to a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expect {
    /// Unconditional.
    Any,
    /// The key must not exist yet.
    Absent,
    /// The key must exist at exactly this version.
    Match(ETag),
}

impl From<Option<ETag>> for Expect {
    fn from(etag: Option<ETag>) -> Self {
        etag.map_or(Expect::Absent, Expect::Match)
    }
}

/// Raw bytes plus their version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stored {
    pub value: Vec<u8>,
    pub etag: ETag,
}

/// Byte-level dictionary. Typed access goes through [`TypedDictionary`].
#[async_trait]
pub trait PersistentDictionary: Send + Sync {
    /// Store identity, reported in conflict errors.
    fn name(&self) -> &str;

    async fn get(&self, key: &str) -> Result<Option<Stored>>;

    /// Write `value` under `key` if `expect` holds. Returns the new version.
    async fn set(&self, key: &str, value: Vec<u8>, expect: Expect) -> Result<ETag>;

    /// Delete `key` if `expect` holds. Returns whether anything was removed.
    async fn remove(&self, key: &str, expect: Expect) -> Result<bool>;

    async fn contains_key(&self, key: &str) -> Result<bool> {
        Ok(self.get(key).await?.is_some())
    }

    /// All keys currently stored.
    async fn keys(&self) -> Result<Vec<String>>;
}

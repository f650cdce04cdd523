//! In-process dictionary for tests and local development.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{ETag, Expect, PersistentDictionary, Stored};
use crate::error::{Error, Result};

/// Versioned map with the same conflict rules as the Postgres store.
/// Clones share state.
#[derive(Debug, Clone)]
pub struct InMemoryDictionary {
    name: String,
    entries: Arc<Mutex<HashMap<String, Stored>>>,
    version: Arc<AtomicI64>,
}

impl InMemoryDictionary {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: Arc::new(Mutex::new(HashMap::new())),
            version: Arc::new(AtomicI64::new(0)),
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn conflict(&self, key: &str) -> Error {
        Error::Conflict {
            store: self.name.clone(),
            key: key.to_string(),
        }
    }
}

fn check(current: Option<&Stored>, expect: Expect) -> bool {
    match (expect, current) {
        (Expect::Any, _) => true,
        (Expect::Absent, None) => true,
        (Expect::Absent, Some(_)) => false,
        (Expect::Match(etag), Some(stored)) => stored.etag == etag,
        (Expect::Match(_), None) => false,
    }
}

#[async_trait]
impl PersistentDictionary for InMemoryDictionary {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, key: &str) -> Result<Option<Stored>> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Vec<u8>, expect: Expect) -> Result<ETag> {
        let mut entries = self.entries.lock().await;
        if !check(entries.get(key), expect) {
            return Err(self.conflict(key));
        }
        let etag = ETag(self.version.fetch_add(1, Ordering::SeqCst) + 1);
        entries.insert(key.to_string(), Stored { value, etag });
        Ok(etag)
    }

    async fn remove(&self, key: &str, expect: Expect) -> Result<bool> {
        let mut entries = self.entries.lock().await;
        let current = entries.get(key);
        if current.is_none() {
            return match expect {
                Expect::Match(_) => Err(self.conflict(key)),
                _ => Ok(false),
            };
        }
        // Absent makes no sense for a delete; only a version pin is checked.
        if matches!(expect, Expect::Match(_)) && !check(current, expect) {
            return Err(self.conflict(key));
        }
        Ok(entries.remove(key).is_some())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self.entries.lock().await.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stale_etag_conflicts() {
        let dict = InMemoryDictionary::new("items");
        let v1 = dict.set("k", b"a".to_vec(), Expect::Absent).await.unwrap();
        let v2 = dict.set("k", b"b".to_vec(), Expect::Match(v1)).await.unwrap();
        assert_ne!(v1, v2);

        let err = dict
            .set("k", b"c".to_vec(), Expect::Match(v1))
            .await
            .unwrap_err();
        match err {
            Error::Conflict { store, key } => {
                assert_eq!(store, "items");
                assert_eq!(key, "k");
            }
            other => panic!("expected conflict, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn absent_rejects_existing_key() {
        let dict = InMemoryDictionary::new("items");
        dict.set("k", vec![1], Expect::Absent).await.unwrap();
        assert!(
            dict.set("k", vec![2], Expect::Absent)
                .await
                .unwrap_err()
                .is_conflict()
        );
    }

    #[tokio::test]
    async fn remove_honours_version() {
        let dict = InMemoryDictionary::new("items");
        let v1 = dict.set("k", vec![1], Expect::Any).await.unwrap();
        dict.set("k", vec![2], Expect::Any).await.unwrap();

        assert!(dict.remove("k", Expect::Match(v1)).await.is_err());
        assert!(dict.remove("k", Expect::Any).await.unwrap());
        assert!(!dict.remove("k", Expect::Any).await.unwrap());
        assert!(!dict.contains_key("k").await.unwrap());
    }
}

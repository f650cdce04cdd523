//! ETag-versioned key/value store over the `kv_entries` table.
//!
//! Several logical stores share the table, keyed by `(store, key)`. Every
//! write draws a fresh etag from `kv_etag_seq`; conditional writes compare
//! it in the `WHERE` clause so a stale version updates zero rows.

use std::sync::Arc;

use async_trait::async_trait;

use super::Db;
use crate::error::{Error, Result};
use crate::store::{ETag, Expect, PersistentDictionary, Stored};

/// [`PersistentDictionary`] backed by Postgres.
pub struct PgDictionary {
    db: Arc<Db>,
    store: String,
}

impl PgDictionary {
    pub fn new(db: Arc<Db>, store: impl Into<String>) -> Self {
        Self {
            db,
            store: store.into(),
        }
    }

    fn conflict(&self, key: &str) -> Error {
        Error::Conflict {
            store: self.store.clone(),
            key: key.to_string(),
        }
    }
}

#[async_trait]
impl PersistentDictionary for PgDictionary {
    fn name(&self) -> &str {
        &self.store
    }

    async fn get(&self, key: &str) -> Result<Option<Stored>> {
        let row: Option<(Vec<u8>, i64)> =
            sqlx::query_as("SELECT value, etag FROM kv_entries WHERE store = $1 AND key = $2")
                .bind(&self.store)
                .bind(key)
                .fetch_optional(self.db.pool())
                .await?;
        Ok(row.map(|(value, etag)| Stored {
            value,
            etag: ETag(etag),
        }))
    }

    async fn set(&self, key: &str, value: Vec<u8>, expect: Expect) -> Result<ETag> {
        let row: Option<(i64,)> = match expect {
            Expect::Any => {
                sqlx::query_as(
                    "INSERT INTO kv_entries (store, key, value)
                     VALUES ($1, $2, $3)
                     ON CONFLICT (store, key) DO UPDATE
                     SET value = EXCLUDED.value, etag = nextval('kv_etag_seq'), updated_at = now()
                     RETURNING etag",
                )
                .bind(&self.store)
                .bind(key)
                .bind(&value)
                .fetch_optional(self.db.pool())
                .await?
            }
            Expect::Absent => {
                sqlx::query_as(
                    "INSERT INTO kv_entries (store, key, value)
                     VALUES ($1, $2, $3)
                     ON CONFLICT (store, key) DO NOTHING
                     RETURNING etag",
                )
                .bind(&self.store)
                .bind(key)
                .bind(&value)
                .fetch_optional(self.db.pool())
                .await?
            }
            Expect::Match(etag) => {
                sqlx::query_as(
                    "UPDATE kv_entries
                     SET value = $3, etag = nextval('kv_etag_seq'), updated_at = now()
                     WHERE store = $1 AND key = $2 AND etag = $4
                     RETURNING etag",
                )
                .bind(&self.store)
                .bind(key)
                .bind(&value)
                .bind(etag.0)
                .fetch_optional(self.db.pool())
                .await?
            }
        };
        row.map(|(etag,)| ETag(etag))
            .ok_or_else(|| self.conflict(key))
    }

    async fn remove(&self, key: &str, expect: Expect) -> Result<bool> {
        let result = match expect {
            Expect::Match(etag) => {
                sqlx::query("DELETE FROM kv_entries WHERE store = $1 AND key = $2 AND etag = $3")
                    .bind(&self.store)
                    .bind(key)
                    .bind(etag.0)
                    .execute(self.db.pool())
                    .await?
            }
            Expect::Any | Expect::Absent => {
                sqlx::query("DELETE FROM kv_entries WHERE store = $1 AND key = $2")
                    .bind(&self.store)
                    .bind(key)
                    .execute(self.db.pool())
                    .await?
            }
        };
        let removed = result.rows_affected() > 0;
        if !removed && matches!(expect, Expect::Match(_)) {
            return Err(self.conflict(key));
        }
        Ok(removed)
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT key FROM kv_entries WHERE store = $1 ORDER BY key")
                .bind(&self.store)
                .fetch_all(self.db.pool())
                .await?;
        Ok(rows.into_iter().map(|(key,)| key).collect())
    }
}

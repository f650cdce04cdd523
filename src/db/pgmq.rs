//! pgmq transport via direct SQLx.
//!
//! Calls pgmq's SQL functions: pgmq.create, pgmq.send, pgmq.read,
//! pgmq.delete. Each category maps to its own pgmq queue, created the first
//! time it is used.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use opentelemetry::KeyValue;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::warn;

use super::Db;
use crate::error::{Error, Result};
use crate::model::WorkItemQueueEntry;
use crate::telemetry::metrics;
use crate::transport::CategorizedQueue;

/// pgmq limits queue names to this length.
const MAX_QUEUE_NAME: usize = 47;

/// Hex digits of the category digest appended to every queue name.
const DIGEST_HEX: usize = 8;

/// [`CategorizedQueue`] backed by pgmq.
pub struct PgmqQueue {
    db: Arc<Db>,
    visibility_timeout: i32,
    created: Mutex<HashSet<String>>,
}

impl PgmqQueue {
    /// Read entries stay invisible for `visibility_timeout` (whole seconds,
    /// at least one) before pgmq redelivers them.
    pub fn new(db: Arc<Db>, visibility_timeout: Duration) -> Self {
        let secs = visibility_timeout.as_secs().clamp(1, i32::MAX as u64) as i32;
        Self {
            db,
            visibility_timeout: secs,
            created: Mutex::new(HashSet::new()),
        }
    }

    /// pgmq queue name for a category: `wd_`, the category lowercased with
    /// anything outside `[a-z0-9]` replaced by `_`, then `_` and a digest of
    /// the raw category. Categories that sanitize alike still get distinct
    /// queues.
    pub fn queue_name(category: &str) -> String {
        let digest = Sha256::digest(category.as_bytes());
        let suffix: String = digest
            .iter()
            .take(DIGEST_HEX / 2)
            .map(|b| format!("{b:02x}"))
            .collect();

        let readable = MAX_QUEUE_NAME - "wd_".len() - 1 - DIGEST_HEX;
        let stem: String = category
            .chars()
            .take(readable)
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_lowercase()
                } else {
                    '_'
                }
            })
            .collect();
        format!("wd_{stem}_{suffix}")
    }

    /// Create the pgmq queue once per process (pgmq.create is idempotent).
    async fn ensure_queue(&self, name: &str) -> Result<()> {
        let mut created = self.created.lock().await;
        if created.contains(name) {
            return Ok(());
        }
        sqlx::query("SELECT pgmq.create($1)")
            .bind(name)
            .execute(self.db.pool())
            .await?;
        record(name, "create");
        created.insert(name.to_string());
        Ok(())
    }

    async fn delete_message(&self, name: &str, msg_id: i64) -> Result<()> {
        sqlx::query("SELECT pgmq.delete($1::text, $2::bigint)")
            .bind(name)
            .bind(msg_id)
            .execute(self.db.pool())
            .await?;
        record(name, "delete");
        Ok(())
    }
}

#[async_trait]
impl CategorizedQueue for PgmqQueue {
    async fn enqueue(&self, entry: &WorkItemQueueEntry) -> Result<()> {
        let name = Self::queue_name(&entry.category);
        self.ensure_queue(&name).await?;

        let payload = serde_json::to_value(WorkItemQueueEntry {
            receipt: None,
            ..entry.clone()
        })?;
        sqlx::query("SELECT pgmq.send($1, $2, 0)")
            .bind(&name)
            .bind(&payload)
            .execute(self.db.pool())
            .await
            .map_err(|e| Error::Transport(format!("pgmq send to {name} failed: {e}")))?;
        record(&name, "send");
        Ok(())
    }

    async fn dequeue(
        &self,
        category: &str,
        max_entries: usize,
    ) -> Result<Vec<WorkItemQueueEntry>> {
        let name = Self::queue_name(category);
        self.ensure_queue(&name).await?;

        let qty = max_entries.clamp(1, i32::MAX as usize) as i32;
        let rows: Vec<(i64, serde_json::Value)> =
            sqlx::query_as("SELECT msg_id, message FROM pgmq.read($1, $2, $3)")
                .bind(&name)
                .bind(self.visibility_timeout)
                .bind(qty)
                .fetch_all(self.db.pool())
                .await?;
        record(&name, if rows.is_empty() { "read_empty" } else { "read" });

        let mut entries = Vec::with_capacity(rows.len());
        for (msg_id, message) in rows {
            match serde_json::from_value::<WorkItemQueueEntry>(message) {
                Ok(mut entry) => {
                    entry.receipt = Some(msg_id);
                    entries.push(entry);
                }
                Err(e) => {
                    warn!(queue = %name, msg_id, error = %e, "unreadable queue message; deleting");
                    self.delete_message(&name, msg_id).await?;
                }
            }
        }
        Ok(entries)
    }

    async fn delete(&self, entry: &WorkItemQueueEntry) -> Result<()> {
        let Some(msg_id) = entry.receipt else {
            return Err(Error::InvalidArgument(format!(
                "queue entry for {} was never delivered",
                entry.id
            )));
        };
        self.delete_message(&Self::queue_name(&entry.category), msg_id)
            .await
    }
}

fn record(queue: &str, operation: &'static str) {
    metrics::queue_operations().add(
        1,
        &[
            KeyValue::new("queue", queue.to_string()),
            KeyValue::new("operation", operation),
        ],
    );
}

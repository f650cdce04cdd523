//! In-process transport for tests and local development.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::CategorizedQueue;
use crate::error::{Error, Result};
use crate::model::WorkItemQueueEntry;

#[derive(Debug)]
struct Message {
    entry: WorkItemQueueEntry,
    receipt: i64,
    invisible_until: Option<Instant>,
}

#[derive(Debug, Default)]
struct Inner {
    categories: Mutex<HashMap<String, VecDeque<Message>>>,
    next_receipt: AtomicI64,
    failing_enqueues: AtomicUsize,
}

/// Visibility-timeout queue kept in memory. Clones share state.
#[derive(Debug, Clone)]
pub struct InMemoryQueue {
    inner: Arc<Inner>,
    visibility_timeout: Duration,
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

impl InMemoryQueue {
    /// Dequeued entries stay hidden for `visibility_timeout`, then are
    /// redelivered unless deleted.
    pub fn new(visibility_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner::default()),
            visibility_timeout,
        }
    }

    /// Make the next `n` enqueue calls fail with a transport error.
    pub fn fail_next_enqueues(&self, n: usize) {
        self.inner.failing_enqueues.store(n, Ordering::SeqCst);
    }

    /// Entries in `category`, visible or not.
    pub async fn len(&self, category: &str) -> usize {
        self.inner
            .categories
            .lock()
            .await
            .get(category)
            .map_or(0, VecDeque::len)
    }

    pub async fn is_empty(&self, category: &str) -> bool {
        self.len(category).await == 0
    }

    /// Ids currently held under `category`, head first.
    pub async fn ids(&self, category: &str) -> Vec<String> {
        self.inner
            .categories
            .lock()
            .await
            .get(category)
            .map(|q| q.iter().map(|m| m.entry.id.to_string()).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl CategorizedQueue for InMemoryQueue {
    async fn enqueue(&self, entry: &WorkItemQueueEntry) -> Result<()> {
        let failing = self.inner.failing_enqueues.load(Ordering::SeqCst);
        if failing > 0 {
            self.inner
                .failing_enqueues
                .store(failing - 1, Ordering::SeqCst);
            return Err(Error::Transport(format!(
                "injected enqueue failure for {}",
                entry.id
            )));
        }

        let receipt = self.inner.next_receipt.fetch_add(1, Ordering::SeqCst) + 1;
        let mut entry = entry.clone();
        entry.receipt = None;
        self.inner
            .categories
            .lock()
            .await
            .entry(entry.category.clone())
            .or_default()
            .push_back(Message {
                entry,
                receipt,
                invisible_until: None,
            });
        Ok(())
    }

    async fn dequeue(
        &self,
        category: &str,
        max_entries: usize,
    ) -> Result<Vec<WorkItemQueueEntry>> {
        let now = Instant::now();
        let mut map = self.inner.categories.lock().await;
        let Some(queue) = map.get_mut(category) else {
            return Ok(Vec::new());
        };

        let mut claimed = Vec::new();
        for msg in queue.iter_mut() {
            if claimed.len() >= max_entries {
                break;
            }
            if msg.invisible_until.is_some_and(|until| until > now) {
                continue;
            }
            // Every delivery gets a fresh receipt so a stale holder cannot
            // delete a redelivered message.
            msg.receipt = self.inner.next_receipt.fetch_add(1, Ordering::SeqCst) + 1;
            msg.invisible_until = Some(now + self.visibility_timeout);

            let mut entry = msg.entry.clone();
            entry.receipt = Some(msg.receipt);
            claimed.push(entry);
        }
        Ok(claimed)
    }

    async fn delete(&self, entry: &WorkItemQueueEntry) -> Result<()> {
        let mut map = self.inner.categories.lock().await;
        let Some(queue) = map.get_mut(&entry.category) else {
            return Ok(());
        };
        let pos = match entry.receipt {
            Some(receipt) => queue.iter().position(|m| m.receipt == receipt),
            None => queue.iter().position(|m| m.entry.id == entry.id),
        };
        if let Some(pos) = pos {
            queue.remove(pos);
        }
        Ok(())
    }
}

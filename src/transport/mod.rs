//! Categorized queue transport.
//!
//! The transport only carries [`WorkItemQueueEntry`] handles; full records
//! live in the store. Delivery is at-least-once: an entry that is dequeued
//! but never deleted comes back.

pub mod memory;

use async_trait::async_trait;

use crate::error::Result;
use crate::model::WorkItemQueueEntry;

pub use memory::InMemoryQueue;

/// FIFO-per-category queue of work item handles.
#[async_trait]
pub trait CategorizedQueue: Send + Sync {
    /// Append an entry to the tail of its category.
    async fn enqueue(&self, entry: &WorkItemQueueEntry) -> Result<()>;

    /// Claim up to `max_entries` entries from `category`. Returned entries
    /// carry a receipt identifying this delivery.
    async fn dequeue(&self, category: &str, max_entries: usize)
    -> Result<Vec<WorkItemQueueEntry>>;

    /// Permanently remove a delivered entry.
    async fn delete(&self, entry: &WorkItemQueueEntry) -> Result<()>;
}

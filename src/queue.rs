//! The queue: producer and consumer sides of work item dispatch.
//!
//! Full records live in the work item store; the transport only carries
//! [`WorkItemQueueEntry`] handles. Every enqueue writes the record first and
//! the entry second, and every dequeue checks the entry against the record
//! before handing it out.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use opentelemetry::KeyValue;
use serde::Deserialize;
use tracing::{debug, error, info, warn};

use crate::config::duration::millis;
use crate::error::{Error, Result};
use crate::model::work::validate_transition;
use crate::model::{Status, WorkId, WorkItem};
use crate::store::codec::DEFAULT_COMPRESS_THRESHOLD;
use crate::store::{Expect, PersistentDictionary, TypedDictionary};
use crate::telemetry::metrics;
use crate::transport::CategorizedQueue;

/// Producer/consumer tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QueueConfig {
    /// Transport retries after the first failed enqueue.
    pub enqueue_retry_count: u32,
    /// Fixed pause between enqueue attempts.
    #[serde(rename = "enqueue_retry_delay_ms", with = "millis")]
    pub enqueue_retry_delay: Duration,
    /// How long terminal records are kept after processing completes.
    #[serde(rename = "retention_period_ms", with = "millis")]
    pub retention_period: Duration,
    /// Stored values above this many bytes are compressed.
    pub compress_threshold: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            enqueue_retry_count: 3,
            enqueue_retry_delay: Duration::from_secs(1),
            retention_period: Duration::from_secs(7 * 24 * 3600),
            compress_threshold: DEFAULT_COMPRESS_THRESHOLD,
        }
    }
}

/// What a cleanup sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub scanned: usize,
    pub archived: usize,
    pub removed: usize,
    pub errors: usize,
}

/// What a reconcile sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// `Pending` records given a fresh transport entry.
    pub requeued: usize,
    /// `InProgress` records with no completion, marked `Failed`.
    pub abandoned: usize,
}

/// Producer (enqueue, result routing) and consumer (dequeue, update,
/// remove, cleanup) over a transport and a work item store.
#[derive(Clone)]
pub struct Queue {
    transport: Arc<dyn CategorizedQueue>,
    items: TypedDictionary<WorkItem>,
    failed_items: TypedDictionary<WorkItem>,
    config: QueueConfig,
}

impl Queue {
    pub fn new(
        transport: Arc<dyn CategorizedQueue>,
        items: Arc<dyn PersistentDictionary>,
        failed_items: Arc<dyn PersistentDictionary>,
        config: QueueConfig,
    ) -> Self {
        let threshold = config.compress_threshold;
        Self {
            transport,
            items: TypedDictionary::new(items, threshold),
            failed_items: TypedDictionary::new(failed_items, threshold),
            config,
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    // -----------------------------------------------------------------------
    // Producer
    // -----------------------------------------------------------------------

    /// Submit a new work item.
    ///
    /// Returns `Ok(false)` when the record was stored but the transport kept
    /// failing; the caller decides whether to report that upstream.
    ///
    /// # Errors
    /// `InvalidArgument` if id, content or category is blank; `Conflict` if a
    /// record with this id already exists and `item` was not read from it.
    pub async fn enqueue_work_item(&self, item: &mut WorkItem) -> Result<bool> {
        if item.id.is_blank() {
            return Err(Error::InvalidArgument("work item id is required".into()));
        }
        if item.content.trim().is_empty() {
            return Err(Error::InvalidArgument(format!(
                "work item {} has no content",
                item.id
            )));
        }
        if item.category.trim().is_empty() {
            return Err(Error::InvalidArgument(format!(
                "work item {} has no category",
                item.id
            )));
        }

        item.status = Status::Pending;
        item.queued_time = Some(Utc::now());
        let category = item.category.clone();
        self.add_work_item_to_queue(item, &category).await
    }

    /// Route a processed item to its result category: `R-{source}`, or the
    /// shared results category for `ResultType::Shared`.
    pub async fn enqueue_processed_work_item(&self, item: &mut WorkItem) -> Result<bool> {
        let category = item.result_category();
        info!(id = %item.id, source = %item.source, category = %category, "routing result");
        self.add_work_item_to_queue(item, &category).await
    }

    /// Store the record, then put its entry on the transport with bounded
    /// retries.
    async fn add_work_item_to_queue(&self, item: &mut WorkItem, category: &str) -> Result<bool> {
        let entry = item.entry_for(category);
        item.queue_entry = Some(entry.clone());
        let etag = self
            .items
            .set(item.id.as_str(), &*item, Expect::from(item.etag))
            .await?;
        item.etag = Some(etag);

        let attempts = self.config.enqueue_retry_count + 1;
        for attempt in 1..=attempts {
            match self.transport.enqueue(&entry).await {
                Ok(()) => {
                    debug!(id = %item.id, category, attempt, "work item enqueued");
                    metrics::work_enqueued().add(
                        1,
                        &[
                            KeyValue::new("category", category.to_string()),
                            KeyValue::new("result", "ok"),
                        ],
                    );
                    return Ok(true);
                }
                Err(e) => {
                    warn!(id = %item.id, category, attempt, attempts, error = %e, "enqueue failed");
                    if attempt < attempts {
                        tokio::time::sleep(self.config.enqueue_retry_delay).await;
                    }
                }
            }
        }

        error!(
            id = %item.id,
            category,
            attempts,
            "giving up on enqueue; record is stored without a queue entry"
        );
        metrics::work_enqueued().add(
            1,
            &[
                KeyValue::new("category", category.to_string()),
                KeyValue::new("result", "transport_failed"),
            ],
        );
        Ok(false)
    }

    // -----------------------------------------------------------------------
    // Consumer
    // -----------------------------------------------------------------------

    /// Look up a work item without touching the transport.
    pub async fn check_work_item(&self, id: &WorkId) -> Result<Option<WorkItem>> {
        let item = self.load(id).await?;
        if item.is_none() {
            warn!(id = %id, "work item not found");
        }
        Ok(item)
    }

    /// Claim up to `max` fresh (`Pending`) items from `category`. Returned
    /// items have `dequeue_time` stamped.
    pub async fn dequeue_work_items(&self, category: &str, max: usize) -> Result<Vec<WorkItem>> {
        self.dequeue(category, max, Status::Pending).await
    }

    /// Claim up to `max` routed results (`Processed`) from a result category.
    pub async fn dequeue_results(&self, category: &str, max: usize) -> Result<Vec<WorkItem>> {
        self.dequeue(category, max, Status::Processed).await
    }

    async fn dequeue(&self, category: &str, max: usize, expected: Status) -> Result<Vec<WorkItem>> {
        let entries = self.transport.dequeue(category, max).await?;
        let mut items = Vec::with_capacity(entries.len());

        for entry in entries {
            // Left for the visibility timeout; its own category's reader owns it.
            if entry.category != category {
                warn!(
                    id = %entry.id,
                    category,
                    entry_category = %entry.category,
                    "queue entry belongs to another category; skipping"
                );
                record_dequeue(category, "foreign_category");
                continue;
            }

            let Some(mut item) = self.load(&entry.id).await? else {
                warn!(id = %entry.id, category, "stale queue entry, no stored record; deleting");
                self.transport.delete(&entry).await?;
                record_dequeue(category, "stale");
                continue;
            };

            if item.status != expected {
                warn!(
                    id = %entry.id,
                    category,
                    status = %item.status,
                    expected = %expected,
                    "queue entry does not match record status; deleting"
                );
                self.transport.delete(&entry).await?;
                record_dequeue(category, "status_mismatch");
                continue;
            }

            if expected == Status::Pending {
                item.dequeue_time = Some(Utc::now());
            }
            item.queue_entry = Some(entry);
            record_dequeue(category, "returned");
            items.push(item);
        }

        Ok(items)
    }

    /// Write an existing item back under its version token.
    ///
    /// # Errors
    /// `NotFound` if no record exists for the id; `Conflict` if another
    /// writer got there first. Conflicts are not retried here.
    pub async fn update_work_item(&self, item: &mut WorkItem) -> Result<()> {
        let etag = match item.etag {
            Some(etag) => etag,
            None => match self.items.get(item.id.as_str()).await? {
                Some((_, etag)) => etag,
                None => return Err(Error::NotFound(item.id.to_string())),
            },
        };
        let etag = self
            .items
            .set(item.id.as_str(), &*item, Expect::Match(etag))
            .await?;
        item.etag = Some(etag);
        Ok(())
    }

    /// Delete the item's transport entry. The record stays for cleanup.
    pub async fn remove_from_queue(&self, item: &WorkItem) -> Result<()> {
        if !self.items.contains_key(item.id.as_str()).await? {
            return Err(Error::NotFound(item.id.to_string()));
        }
        let Some(ref entry) = item.queue_entry else {
            return Err(Error::InvalidArgument(format!(
                "work item {} has no queue entry",
                item.id
            )));
        };
        self.transport.delete(entry).await
    }

    /// Mark a retrieved result as consumed: `Processed -> Completed`, and its
    /// result entry is deleted.
    pub async fn acknowledge_result(&self, item: &mut WorkItem) -> Result<()> {
        validate_transition(item.status, Status::Completed)?;
        item.status = Status::Completed;
        self.update_work_item(item).await?;
        self.remove_from_queue(item).await
    }

    // -----------------------------------------------------------------------
    // Maintenance
    // -----------------------------------------------------------------------

    /// Drop terminal records whose processing finished more than the
    /// retention period ago. `Failed` records are copied to the failed-items
    /// store first. One bad record never aborts the sweep.
    pub async fn cleanup_work_items(&self) -> Result<CleanupReport> {
        let retention = chrono::Duration::from_std(self.config.retention_period)
            .map_err(|e| Error::Config(format!("retention period out of range: {e}")))?;
        let cutoff = Utc::now() - retention;

        let mut report = CleanupReport::default();
        for key in self.items.keys().await? {
            report.scanned += 1;
            match self.cleanup_one(&key, cutoff).await {
                Ok(Some(archived)) => {
                    report.removed += 1;
                    if archived {
                        report.archived += 1;
                        metrics::cleanup_items().add(1, &[KeyValue::new("action", "archived")]);
                    }
                    metrics::cleanup_items().add(1, &[KeyValue::new("action", "removed")]);
                }
                Ok(None) => {}
                Err(e) => {
                    report.errors += 1;
                    warn!(id = %key, error = %e, "cleanup failed for work item");
                    metrics::cleanup_items().add(1, &[KeyValue::new("action", "error")]);
                }
            }
        }

        info!(
            scanned = report.scanned,
            removed = report.removed,
            archived = report.archived,
            errors = report.errors,
            "work item cleanup finished"
        );
        Ok(report)
    }

    /// `Some(archived)` if the record was removed.
    async fn cleanup_one(&self, key: &str, cutoff: chrono::DateTime<Utc>) -> Result<Option<bool>> {
        let Some((item, etag)) = self.items.get(key).await? else {
            return Ok(None);
        };
        let expired = item
            .processing_complete_time
            .is_some_and(|done| done <= cutoff);
        if !item.status.is_terminal() || !expired {
            return Ok(None);
        }

        let archived = item.status == Status::Failed;
        if archived {
            self.failed_items.set(key, &item, Expect::Any).await?;
        }
        self.items.remove(key, Expect::Match(etag)).await?;
        debug!(id = %key, status = %item.status, archived, "work item cleaned up");
        Ok(Some(archived))
    }

    /// Repair records stranded by a crash or a lost write.
    ///
    /// `Pending` records queued before `older_than` get a fresh transport
    /// entry, covering a failure between the store write and the transport
    /// write. Duplicate entries are harmless: whichever is dequeued second
    /// fails the status check and is deleted.
    ///
    /// `InProgress` records whose processing started before `older_than` and
    /// never completed are marked `Failed`, so retention cleanup archives
    /// them. `older_than` must exceed the longest expected processing time.
    pub async fn reconcile_pending_work_items(
        &self,
        older_than: Duration,
    ) -> Result<ReconcileReport> {
        let age = chrono::Duration::from_std(older_than)
            .map_err(|e| Error::Config(format!("reconcile age out of range: {e}")))?;
        let cutoff = Utc::now() - age;

        let mut report = ReconcileReport::default();
        for key in self.items.keys().await? {
            let Some(mut item) = self.load(&WorkId::from(key.as_str())).await? else {
                continue;
            };
            match item.status {
                Status::Pending if item.queued_time.is_some_and(|queued| queued <= cutoff) => {
                    if self.requeue_pending(&mut item).await? {
                        report.requeued += 1;
                    }
                }
                Status::InProgress
                    if item
                        .processing_start_time
                        .is_some_and(|started| started <= cutoff) =>
                {
                    if self.abandon_in_progress(&mut item, older_than).await? {
                        report.abandoned += 1;
                    }
                }
                _ => {}
            }
        }
        Ok(report)
    }

    async fn requeue_pending(&self, item: &mut WorkItem) -> Result<bool> {
        // Restamp first so concurrent sweeps race on the etag, not the transport.
        item.queued_time = Some(Utc::now());
        match self.update_work_item(item).await {
            Ok(()) => {}
            Err(e) if e.is_conflict() => return Ok(false),
            Err(e) => return Err(e),
        }

        let entry = item.entry_for(&item.category);
        match self.transport.enqueue(&entry).await {
            Ok(()) => {
                info!(id = %item.id, category = %item.category, "requeued pending work item");
                Ok(true)
            }
            Err(e) => {
                warn!(id = %item.id, error = %e, "requeue of pending work item failed");
                Ok(false)
            }
        }
    }

    async fn abandon_in_progress(&self, item: &mut WorkItem, older_than: Duration) -> Result<bool> {
        item.status = Status::Failed;
        item.result = Some(format!(
            "processing abandoned: no completion recorded within {older_than:?}"
        ));
        item.processing_complete_time = Some(Utc::now());
        match self.update_work_item(item).await {
            Ok(()) => {
                warn!(id = %item.id, category = %item.category, "in-progress work item abandoned");
                Ok(true)
            }
            Err(e) if e.is_conflict() => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn load(&self, id: &WorkId) -> Result<Option<WorkItem>> {
        Ok(self.items.get(id.as_str()).await?.map(|(mut item, etag)| {
            item.etag = Some(etag);
            item
        }))
    }
}

fn record_dequeue(category: &str, outcome: &'static str) {
    metrics::work_dequeued().add(
        1,
        &[
            KeyValue::new("category", category.to_string()),
            KeyValue::new("outcome", outcome),
        ],
    );
}

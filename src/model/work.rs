//! Work items, their queue entries, and the status state machine.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Error;
use crate::store::ETag;

/// Category that shared results are routed to, whatever their source.
pub const SHARED_RESULTS_CATEGORY: &str = "R-shared";

/// Prefix of the per-source result categories.
pub const RESULT_CATEGORY_PREFIX: &str = "R-";

// ---------------------------------------------------------------------------
// Work Item
// ---------------------------------------------------------------------------

/// A unit of work tracked by the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    /// Stable unique key. Also the store key.
    pub id: WorkId,

    /// Serialized request (before processing) or result (after).
    /// Opaque to the queue.
    pub content: String,

    /// Routing key for dequeue.
    pub category: String,

    /// Name of the submitting component. Per-source results go to `R-{source}`.
    pub source: String,

    /// How the result is made available once processed.
    pub result_type: ResultType,

    pub status: Status,

    pub queued_time: Option<DateTime<Utc>>,
    pub dequeue_time: Option<DateTime<Utc>>,
    pub processing_start_time: Option<DateTime<Utc>>,
    pub processing_complete_time: Option<DateTime<Utc>>,

    /// Failure detail. Only set when `status == Failed`.
    pub result: Option<String>,

    /// This item's claim on the transport queue.
    pub queue_entry: Option<WorkItemQueueEntry>,

    /// Version token from the last store read or write.
    #[serde(skip)]
    pub etag: Option<ETag>,
}

impl WorkItem {
    /// A new pending work item with a generated id.
    pub fn new(category: impl Into<String>, content: impl Into<String>) -> Self {
        Self::with_id(WorkId::new(), category, content)
    }

    pub fn with_id(
        id: impl Into<WorkId>,
        category: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            content: content.into(),
            category: category.into(),
            source: String::new(),
            result_type: ResultType::Direct,
            status: Status::Pending,
            queued_time: None,
            dequeue_time: None,
            processing_start_time: None,
            processing_complete_time: None,
            result: None,
            queue_entry: None,
            etag: None,
        }
    }

    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn result_type(mut self, result_type: ResultType) -> Self {
        self.result_type = result_type;
        self
    }

    /// Time between enqueue and dequeue, once both are known.
    pub fn time_in_queue(&self) -> Option<Duration> {
        Some(self.dequeue_time? - self.queued_time?)
    }

    /// Time spent in the processor, once processing has finished.
    pub fn time_in_processing(&self) -> Option<Duration> {
        Some(self.processing_complete_time? - self.processing_start_time?)
    }

    /// The queue entry that represents this item under `category`.
    pub fn entry_for(&self, category: &str) -> WorkItemQueueEntry {
        WorkItemQueueEntry {
            id: self.id.clone(),
            category: category.to_string(),
            receipt: None,
        }
    }

    /// Category this item's result is routed to by
    /// [`Queue::enqueue_processed_work_item`](crate::queue::Queue::enqueue_processed_work_item).
    pub fn result_category(&self) -> String {
        match self.result_type {
            ResultType::Shared => SHARED_RESULTS_CATEGORY.to_string(),
            _ => format!("{RESULT_CATEGORY_PREFIX}{}", self.source),
        }
    }
}

/// Newtype for work item ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkId(String);

impl WorkId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl Default for WorkId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for WorkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for WorkId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for WorkId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// ---------------------------------------------------------------------------
// Queue Entry
// ---------------------------------------------------------------------------

/// Lightweight handle carried by the transport. Deleting it is the only way
/// to stop the item from being dequeued again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItemQueueEntry {
    pub id: WorkId,
    pub category: String,
    /// Transport-assigned handle for the delivered message. Set on dequeue.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receipt: Option<i64>,
}

// ---------------------------------------------------------------------------
// Result Type
// ---------------------------------------------------------------------------

/// How a processed item's result reaches its submitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ResultType {
    /// The submitter reads the stored record. Processing ends in `Completed`.
    #[default]
    Direct,
    /// The submitter polls the stored record and acknowledges it.
    Polled,
    /// Re-enqueued under the shared results category for a result poller.
    Shared,
}

impl ResultType {
    /// Status a successfully processed item settles in.
    pub fn success_status(self) -> Status {
        match self {
            ResultType::Direct => Status::Completed,
            ResultType::Polled | ResultType::Shared => Status::Processed,
        }
    }

    /// Whether dispatch re-enqueues the processed item.
    pub fn routes_result(self) -> bool {
        matches!(self, ResultType::Shared)
    }
}

impl std::fmt::Display for ResultType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ResultType::Direct => "direct",
            ResultType::Polled => "polled",
            ResultType::Shared => "shared",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for ResultType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "direct" => Ok(ResultType::Direct),
            "polled" => Ok(ResultType::Polled),
            "shared" => Ok(ResultType::Shared),
            other => Err(Error::InvalidArgument(format!("unknown result type: {other}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle status of a work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// Enqueued, waiting for a worker.
    Pending,
    /// A worker is running the processor.
    InProgress,
    /// Processed; result awaiting pickup by the submitter.
    Processed,
    /// Done. Nothing further to route.
    Completed,
    /// The processor failed. Terminal.
    Failed,
}

impl Status {
    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: Status) -> bool {
        use Status::*;
        matches!(
            (self, to),
            (Pending, InProgress)
                | (InProgress, Processed)
                | (InProgress, Completed)
                | (InProgress, Failed)
                | (Processed, Completed) // result acknowledged
        )
    }

    /// Terminal for queue-entry purposes; eligible for retention cleanup.
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Processed | Status::Completed | Status::Failed)
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Status::Pending => "pending",
            Status::InProgress => "in_progress",
            Status::Processed => "processed",
            Status::Completed => "completed",
            Status::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for Status {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Status::Pending),
            "in_progress" => Ok(Status::InProgress),
            "processed" => Ok(Status::Processed),
            "completed" => Ok(Status::Completed),
            "failed" => Ok(Status::Failed),
            other => Err(Error::InvalidArgument(format!("unknown status: {other}"))),
        }
    }
}

/// Validate a state transition, returning an error if disallowed.
pub fn validate_transition(from: Status, to: Status) -> crate::error::Result<()> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(Error::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_machine_allows_only_forward_moves() {
        assert!(Status::Pending.can_transition_to(Status::InProgress));
        assert!(Status::InProgress.can_transition_to(Status::Failed));
        assert!(Status::Processed.can_transition_to(Status::Completed));
        assert!(!Status::Pending.can_transition_to(Status::Completed));
        assert!(!Status::Failed.can_transition_to(Status::InProgress));
        assert!(!Status::Completed.can_transition_to(Status::Pending));
    }

    #[test]
    fn result_category_depends_on_result_type() {
        let item = WorkItem::new("cat-A", "<req/>").source("billing");
        assert_eq!(item.result_category(), "R-billing");

        let shared = item.result_type(ResultType::Shared);
        assert_eq!(shared.result_category(), SHARED_RESULTS_CATEGORY);
    }

    #[test]
    fn durations_need_both_timestamps() {
        let mut item = WorkItem::new("cat-A", "x");
        assert!(item.time_in_queue().is_none());

        let t0 = Utc::now();
        item.queued_time = Some(t0);
        item.dequeue_time = Some(t0 + Duration::seconds(3));
        assert_eq!(item.time_in_queue(), Some(Duration::seconds(3)));
        assert!(item.time_in_processing().is_none());
    }

    #[test]
    fn etag_is_not_part_of_the_record() {
        let mut item = WorkItem::with_id("w1", "cat-A", "x");
        item.etag = Some(ETag(7));
        let json = serde_json::to_string(&item).unwrap();
        let back: WorkItem = serde_json::from_str(&json).unwrap();
        assert_eq!(back.etag, None);
        assert_eq!(back.id.as_str(), "w1");
    }
}

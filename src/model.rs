//! Core data model.
//!
//! A work item is a persisted unit of queued work: identity, routing
//! (category + source + result type), lifecycle status, timestamps, and an
//! opaque payload. Activity requests and results are the envelope that
//! payload usually carries.

pub mod activity;
pub mod work;

pub use activity::{ActivityErrorDetail, ActivityErrorId, ActivityRequest, ActivityResult};
pub use work::{ResultType, Status, WorkId, WorkItem, WorkItemQueueEntry};

//! The worker loop: poll categories, dispatch to a processor, back off when
//! idle, clean up periodically and exit once a landing deployment drains.

use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use serde::Deserialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, warn};

use crate::config::duration::{millis, opt_millis};
use crate::error::{Error, Result};
use crate::model::work::validate_transition;
use crate::model::{ResultType, Status, WorkItem};
use crate::queue::Queue;
use crate::store::{Expect, PersistentDictionary, TypedDictionary};
use crate::telemetry::metrics;
use crate::telemetry::work::{record_state_transition, start_work_span};

use super::backoff::PollBackoff;
use super::stats::QueueProcessorStats;

/// Control-store key holding the time of the last cleanup sweep.
pub const LAST_CLEANUP_KEY: &str = "queue-processor/last-cleanup";

/// Worker loop tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProcessorConfig {
    /// Items claimed per dequeue.
    pub batch_size: usize,
    #[serde(rename = "min_poll_wait_ms", with = "millis")]
    pub min_poll_wait: Duration,
    #[serde(rename = "max_poll_wait_ms", with = "millis")]
    pub max_poll_wait: Duration,
    pub backoff_factor: f64,
    /// Idle time after which the wait snaps to `inactive_poll_wait`.
    #[serde(rename = "inactivity_threshold_ms", with = "millis")]
    pub inactivity_threshold: Duration,
    #[serde(rename = "inactive_poll_wait_ms", with = "millis")]
    pub inactive_poll_wait: Duration,
    #[serde(rename = "cleanup_interval_ms", with = "millis")]
    pub cleanup_interval: Duration,
    #[serde(rename = "stats_interval_ms", with = "millis")]
    pub stats_interval: Duration,
    /// Loop-level errors tolerated before the processor gives up.
    pub max_warnings: u32,
    #[serde(rename = "warning_pause_ms", with = "millis")]
    pub warning_pause: Duration,
    /// How long the queue must stay empty during landing before exit.
    #[serde(rename = "landing_stabilization_ms", with = "millis")]
    pub landing_stabilization: Duration,
    /// During cleanup, requeue `Pending` records and fail `InProgress` ones
    /// older than this. Off when unset.
    #[serde(rename = "pending_reconcile_age_ms", with = "opt_millis")]
    pub pending_reconcile_age: Option<Duration>,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            min_poll_wait: Duration::from_secs(1),
            max_poll_wait: Duration::from_secs(30),
            backoff_factor: 2.0,
            inactivity_threshold: Duration::from_secs(5 * 60),
            inactive_poll_wait: Duration::from_secs(60),
            cleanup_interval: Duration::from_secs(3600),
            stats_interval: Duration::from_secs(15 * 60),
            max_warnings: 10,
            warning_pause: Duration::from_secs(5),
            landing_stabilization: Duration::from_secs(30),
            pending_reconcile_age: None,
        }
    }
}

impl ProcessorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::Config("batch_size must be at least 1".into()));
        }
        if !(self.backoff_factor >= 1.0 && self.backoff_factor.is_finite()) {
            return Err(Error::Config(format!(
                "backoff_factor must be a finite number >= 1, got {}",
                self.backoff_factor
            )));
        }
        if self.min_poll_wait > self.max_poll_wait {
            return Err(Error::Config(format!(
                "min_poll_wait ({:?}) exceeds max_poll_wait ({:?})",
                self.min_poll_wait, self.max_poll_wait
            )));
        }
        Ok(())
    }
}

/// Whether the hosting deployment is shutting down.
pub trait DeploymentState: Send + Sync {
    fn is_landing(&self) -> bool;
}

/// Flag-backed [`DeploymentState`], flipped by a signal handler.
#[derive(Debug, Clone, Default)]
pub struct LandingSignal(Arc<AtomicBool>);

impl LandingSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn land(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

impl DeploymentState for LandingSignal {
    fn is_landing(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// The processor's decision for one item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub status: Status,
    /// Replacement content, typically the encoded result.
    pub content: Option<String>,
    /// Failure detail.
    pub result: Option<String>,
}

impl Transition {
    pub fn completed() -> Self {
        Self::to(Status::Completed)
    }

    pub fn processed() -> Self {
        Self::to(Status::Processed)
    }

    /// `Completed` for `Direct`, `Processed` otherwise.
    pub fn succeeded(result_type: ResultType) -> Self {
        Self::to(result_type.success_status())
    }

    pub fn failed(detail: impl Into<String>) -> Self {
        Self {
            status: Status::Failed,
            content: None,
            result: Some(detail.into()),
        }
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    fn to(status: Status) -> Self {
        Self {
            status,
            content: None,
            result: None,
        }
    }
}

/// Caller-supplied business logic. Receives an owned snapshot of the item
/// and returns the transition to apply. Expected business failures belong
/// in the returned transition; an `Err` or a panic marks the item `Failed`.
#[async_trait]
pub trait WorkItemProcessor: Send + Sync + 'static {
    async fn process(&self, item: WorkItem) -> anyhow::Result<Transition>;
}

/// Why [`QueueProcessor::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// The deployment is landing and the queue stayed empty long enough.
    Drained,
    /// The cancellation token fired.
    Cancelled,
}

pub struct QueueProcessor {
    queue: Queue,
    processor: Arc<dyn WorkItemProcessor>,
    categories: Vec<String>,
    config: ProcessorConfig,
    control: TypedDictionary<DateTime<Utc>>,
    deployment: Arc<dyn DeploymentState>,
    cancel: CancellationToken,
    stats: QueueProcessorStats,
    backoff: PollBackoff,
    warnings: u32,
    last_stats: Instant,
    last_cleanup_check: Option<Instant>,
}

impl QueueProcessor {
    /// `categories` are polled in the given order; the first with work wins
    /// the iteration. `control` holds the shared last-cleanup timestamp.
    pub fn new(
        queue: Queue,
        processor: Arc<dyn WorkItemProcessor>,
        categories: Vec<String>,
        config: ProcessorConfig,
        control: Arc<dyn PersistentDictionary>,
    ) -> Result<Self> {
        config.validate()?;
        if categories.is_empty() || categories.iter().any(|c| c.trim().is_empty()) {
            return Err(Error::InvalidArgument(
                "at least one non-blank category is required".into(),
            ));
        }
        let now = Instant::now();
        let threshold = queue.config().compress_threshold;
        Ok(Self {
            queue,
            processor,
            categories,
            backoff: PollBackoff::new(&config, now),
            config,
            control: TypedDictionary::new(control, threshold),
            deployment: Arc::new(LandingSignal::new()),
            cancel: CancellationToken::new(),
            stats: QueueProcessorStats::new(Utc::now()),
            warnings: 0,
            last_stats: now,
            last_cleanup_check: None,
        })
    }

    pub fn deployment(mut self, deployment: Arc<dyn DeploymentState>) -> Self {
        self.deployment = deployment;
        self
    }

    pub fn cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn stats(&self) -> &QueueProcessorStats {
        &self.stats
    }

    /// Loop-level errors absorbed so far.
    pub fn warnings(&self) -> u32 {
        self.warnings
    }

    /// Run until the deployment drains, the token is cancelled, or the
    /// warning budget is exhausted (returned as the last error).
    pub async fn run(&mut self) -> Result<ExitReason> {
        info!(categories = ?self.categories, "queue processor started");
        loop {
            if self.cancel.is_cancelled() {
                info!("queue processor cancelled");
                return Ok(ExitReason::Cancelled);
            }

            match self.iterate().await {
                Ok(Some(reason)) => {
                    info!(reason = ?reason, "queue processor stopped");
                    return Ok(reason);
                }
                Ok(None) => {}
                Err(Error::Cancelled) => {
                    info!("queue processor cancelled during dispatch");
                    return Ok(ExitReason::Cancelled);
                }
                Err(e) => {
                    self.warnings += 1;
                    metrics::processor_warnings().add(1, &[]);
                    if self.warnings > self.config.max_warnings {
                        error!(
                            warnings = self.warnings,
                            error = %e,
                            "warning budget exhausted; stopping queue processor"
                        );
                        return Err(e);
                    }
                    warn!(
                        warnings = self.warnings,
                        max = self.config.max_warnings,
                        error = %e,
                        "queue processor iteration failed"
                    );
                    if self.pause(self.config.warning_pause).await {
                        return Ok(ExitReason::Cancelled);
                    }
                }
            }
        }
    }

    /// One loop iteration. `Some` means stop.
    async fn iterate(&mut self) -> Result<Option<ExitReason>> {
        let now = Instant::now();
        if now.duration_since(self.last_stats) >= self.config.stats_interval {
            info!("{}", self.stats.summary(Utc::now()));
            self.last_stats = now;
        }

        if self.dispatch_batch().await? {
            self.backoff.on_work(Instant::now());
            return Ok(None);
        }

        let idle_at = Instant::now();
        let mut wait = self.backoff.on_idle(idle_at);

        self.maybe_cleanup().await?;

        if self.deployment.is_landing() {
            let idle = self.backoff.idle_for(idle_at);
            if idle > self.config.landing_stabilization {
                info!(idle_ms = idle.as_millis() as u64, "queue drained while landing");
                return Ok(Some(ExitReason::Drained));
            }
            self.backoff.reset_to_min();
            wait = self.backoff.current();
        }

        let remaining = wait.saturating_sub(idle_at.elapsed());
        debug!(wait_ms = remaining.as_millis() as u64, "no work found");
        if self.pause(remaining).await {
            return Ok(Some(ExitReason::Cancelled));
        }
        Ok(None)
    }

    /// Sleep unless cancelled first. Returns `true` on cancellation.
    async fn pause(&self, wait: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => true,
            _ = tokio::time::sleep(wait) => false,
        }
    }

    /// Dequeue from the first category that has work and process the batch.
    async fn dispatch_batch(&mut self) -> Result<bool> {
        for index in 0..self.categories.len() {
            let items = self
                .queue
                .dequeue_work_items(&self.categories[index], self.config.batch_size)
                .await?;
            if items.is_empty() {
                continue;
            }
            debug!(category = %self.categories[index], count = items.len(), "dispatching batch");
            for item in items {
                self.dispatch_one(item).await?;
            }
            return Ok(true);
        }
        Ok(false)
    }

    async fn dispatch_one(&mut self, mut item: WorkItem) -> Result<()> {
        let span = start_work_span(&item.category, &item.id);
        let now = Utc::now();

        validate_transition(item.status, Status::InProgress)?;
        item.status = Status::InProgress;
        item.processing_start_time = Some(now);
        match self.queue.update_work_item(&mut item).await {
            Ok(()) => {}
            Err(e) if e.is_conflict() => {
                info!(id = %item.id, "work item claimed elsewhere; skipping");
                return Ok(());
            }
            Err(e) => return Err(e),
        }
        self.stats.record_dequeued(&item, now);
        record_state_transition(&span, Status::Pending, Status::InProgress);

        let started = Instant::now();
        let processor = Arc::clone(&self.processor);
        let snapshot = item.clone();
        let outcome = tokio::spawn(
            async move { processor.process(snapshot).await }.instrument(span.clone()),
        )
        .await;

        let mut transition = match outcome {
            Ok(Ok(transition)) => transition,
            Ok(Err(e)) => {
                warn!(parent: &span, id = %item.id, error = %e, "processor failed");
                Transition::failed(format!("{e:#}"))
            }
            Err(join) if join.is_panic() => {
                let message = panic_message(join.into_panic());
                warn!(parent: &span, id = %item.id, panic = %message, "processor panicked");
                Transition::failed(format!("processor panicked: {message}"))
            }
            Err(_) => return Err(Error::Cancelled),
        };
        if let Err(e) = validate_transition(Status::InProgress, transition.status) {
            warn!(parent: &span, id = %item.id, error = %e, "processor returned an invalid status");
            transition = Transition::failed(e.to_string());
        }

        item.status = transition.status;
        if let Some(content) = transition.content {
            item.content = content;
        }
        if transition.result.is_some() {
            item.result = transition.result;
        }
        item.processing_complete_time = Some(Utc::now());
        self.queue.update_work_item(&mut item).await?;
        record_state_transition(&span, Status::InProgress, item.status);

        self.queue.remove_from_queue(&item).await?;
        self.stats.record_processed(&item, Utc::now());
        metrics::processing_duration_ms().record(
            started.elapsed().as_secs_f64() * 1000.0,
            &[
                KeyValue::new("category", item.category.clone()),
                KeyValue::new("status", item.status.to_string()),
            ],
        );

        if item.status == Status::Processed && item.result_type.routes_result() {
            let routed = self
                .queue
                .enqueue_processed_work_item(&mut item)
                .instrument(span.clone())
                .await?;
            if !routed {
                warn!(parent: &span, id = %item.id, "result stored but could not be queued");
            }
        }
        Ok(())
    }

    /// Run retention cleanup if the shared last-cleanup stamp is older than
    /// the cleanup interval. Losing the race to stamp it means another
    /// processor is already cleaning.
    async fn maybe_cleanup(&mut self) -> Result<()> {
        let now = Instant::now();
        if self
            .last_cleanup_check
            .is_some_and(|at| now.duration_since(at) < self.config.cleanup_interval)
        {
            return Ok(());
        }
        self.last_cleanup_check = Some(now);

        let interval = chrono::Duration::from_std(self.config.cleanup_interval)
            .map_err(|e| Error::Config(format!("cleanup interval out of range: {e}")))?;
        let current = self.control.get(LAST_CLEANUP_KEY).await?;
        let wall = Utc::now();
        if current.is_some_and(|(last, _)| wall - last < interval) {
            return Ok(());
        }

        let expect = Expect::from(current.map(|(_, etag)| etag));
        match self.control.set(LAST_CLEANUP_KEY, &wall, expect).await {
            Ok(_) => {}
            Err(e) if e.is_conflict() => {
                info!("another processor is already cleaning up");
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        self.queue.cleanup_work_items().await?;
        if let Some(age) = self.config.pending_reconcile_age {
            let report = self.queue.reconcile_pending_work_items(age).await?;
            if report.requeued > 0 || report.abandoned > 0 {
                info!(
                    requeued = report.requeued,
                    abandoned = report.abandoned,
                    "stranded work items reconciled"
                );
            }
        }
        Ok(())
    }
}

/// Text of a caught panic payload.
pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        ProcessorConfig::default().validate().unwrap();
    }

    #[test]
    fn rejects_shrinking_backoff() {
        let config = ProcessorConfig {
            backoff_factor: 0.5,
            ..ProcessorConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_inverted_poll_bounds() {
        let config = ProcessorConfig {
            min_poll_wait: Duration::from_secs(10),
            max_poll_wait: Duration::from_secs(1),
            ..ProcessorConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn succeeded_transition_follows_result_type() {
        assert_eq!(Transition::succeeded(ResultType::Direct).status, Status::Completed);
        assert_eq!(Transition::succeeded(ResultType::Polled).status, Status::Processed);
        assert_eq!(Transition::succeeded(ResultType::Shared).status, Status::Processed);
    }

    #[test]
    fn panic_payloads_are_readable() {
        assert_eq!(panic_message(Box::new("boom")), "boom");
        assert_eq!(panic_message(Box::new(String::from("bang"))), "bang");
        assert_eq!(panic_message(Box::new(7u8)), "unknown panic payload");
    }
}

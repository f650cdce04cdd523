//! Activities: named, validated units of business logic run from a work
//! item's content.
//!
//! Each activity declares the request values it requires and the result
//! values it may produce. [`run`] enforces both and turns every failure,
//! panics included, into a structured error result.

pub mod registry;

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::duration::millis;
use crate::engine::processor::panic_message;
use crate::error::Result;
use crate::model::activity::Values;
use crate::model::{ActivityErrorId, ActivityRequest, ActivityResult};

pub use registry::{ActivityProcessor, ActivityRegistry, EchoActivity, QueueSubmitter};

/// Follow-up request submission tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ActivityConfig {
    /// Extra attempts after a failed submission when retry is requested.
    pub submit_retry_count: u32,
    #[serde(rename = "submit_retry_delay_ms", with = "millis")]
    pub submit_retry_delay: Duration,
}

impl Default for ActivityConfig {
    fn default() -> Self {
        Self {
            submit_retry_count: 3,
            submit_retry_delay: Duration::from_secs(1),
        }
    }
}

/// Inputs and outputs an activity commits to.
#[derive(Debug, Clone, Copy, Default)]
pub struct ActivityDeclaration {
    pub required_values: &'static [&'static str],
    pub allowed_results: &'static [&'static str],
}

/// Failure returned by [`Activity::process`].
#[derive(Debug, thiserror::Error)]
pub enum ActivityError {
    /// An expected failure with a specific kind.
    #[error("{id}: {message}")]
    Failure {
        id: ActivityErrorId,
        message: String,
    },

    /// Anything unexpected; reported as `GenericError`.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ActivityError {
    pub fn new(id: ActivityErrorId, message: impl Into<String>) -> Self {
        Self::Failure {
            id,
            message: message.into(),
        }
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ActivityErrorId::InvalidInput, message)
    }
}

#[async_trait]
pub trait Activity: Send + Sync {
    /// Task name requests use to select this activity.
    fn name(&self) -> &'static str;

    fn declaration(&self) -> ActivityDeclaration;

    async fn process(
        &self,
        request: &ActivityRequest,
        ctx: &ActivityContext,
    ) -> std::result::Result<Values, ActivityError>;
}

/// Validate, process, validate again. The returned result always carries
/// the request's id and task.
pub async fn run(
    activity: &dyn Activity,
    request: &ActivityRequest,
    ctx: &ActivityContext,
) -> ActivityResult {
    let declaration = activity.declaration();

    let missing: Vec<&str> = declaration
        .required_values
        .iter()
        .copied()
        .filter(|key| !request.values.contains_key(*key))
        .collect();
    if !missing.is_empty() {
        return ActivityResult::error(
            ActivityErrorId::MissingRequiredInput,
            format!("missing required values: {}", missing.join(", ")),
        )
        .for_request(request);
    }

    let outcome = AssertUnwindSafe(activity.process(request, ctx))
        .catch_unwind()
        .await;
    let values = match outcome {
        Ok(Ok(values)) => values,
        Ok(Err(ActivityError::Failure { id, message })) => {
            debug!(task = %request.task, id = %request.id, error_id = %id, "activity failed");
            return ActivityResult::error(id, message).for_request(request);
        }
        Ok(Err(ActivityError::Other(e))) => {
            warn!(task = %request.task, id = %request.id, error = %e, "activity error");
            return ActivityResult::error(ActivityErrorId::GenericError, format!("{e:#}"))
                .with_stack_trace(format!("{e:?}"))
                .for_request(request);
        }
        Err(payload) => {
            let message = panic_message(payload);
            warn!(task = %request.task, id = %request.id, panic = %message, "activity panicked");
            return ActivityResult::error(
                ActivityErrorId::GenericError,
                format!("activity panicked: {message}"),
            )
            .for_request(request);
        }
    };

    let unknown: Vec<&str> = values
        .keys()
        .map(String::as_str)
        .filter(|key| !declaration.allowed_results.contains(key))
        .collect();
    if !unknown.is_empty() {
        return ActivityResult::error(
            ActivityErrorId::UnknownResultValue,
            format!("undeclared result values: {}", unknown.join(", ")),
        )
        .for_request(request);
    }

    ActivityResult::success(values).for_request(request)
}

/// Submits follow-up requests on an activity's behalf.
#[async_trait]
pub trait RequestSubmitter: Send + Sync {
    /// `Ok(false)` means the submission did not go through and may be retried.
    async fn submit(&self, request: &ActivityRequest) -> Result<bool>;
}

/// What an activity can reach while it runs.
#[derive(Clone)]
pub struct ActivityContext {
    submitter: Option<Arc<dyn RequestSubmitter>>,
    config: ActivityConfig,
}

impl ActivityContext {
    pub fn new(submitter: Arc<dyn RequestSubmitter>, config: ActivityConfig) -> Self {
        Self {
            submitter: Some(submitter),
            config,
        }
    }

    /// A context that cannot submit follow-up requests.
    pub fn detached(config: ActivityConfig) -> Self {
        Self {
            submitter: None,
            config,
        }
    }

    /// Submit a new request. With `retry`, failed attempts are repeated
    /// `submit_retry_count` more times, `submit_retry_delay` apart.
    pub async fn submit_request(&self, request: &ActivityRequest, retry: bool) -> bool {
        let Some(ref submitter) = self.submitter else {
            warn!(task = %request.task, "no submitter configured; request dropped");
            return false;
        };

        let attempts = if retry {
            self.config.submit_retry_count + 1
        } else {
            1
        };
        for attempt in 1..=attempts {
            match submitter.submit(request).await {
                Ok(true) => return true,
                Ok(false) => {
                    warn!(task = %request.task, id = %request.id, attempt, attempts, "request submission failed")
                }
                Err(e) => {
                    warn!(task = %request.task, id = %request.id, attempt, attempts, error = %e, "request submission failed")
                }
            }
            if attempt < attempts {
                tokio::time::sleep(self.config.submit_retry_delay).await;
            }
        }
        false
    }
}

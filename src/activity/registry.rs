//! Activity registry and the work item processor that runs activities.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context as _;
use async_trait::async_trait;
use tracing::{info, warn};

use super::{Activity, ActivityContext, ActivityDeclaration, ActivityError, RequestSubmitter, run};
use crate::engine::{Transition, WorkItemProcessor};
use crate::error::Result;
use crate::model::activity::Values;
use crate::model::{ActivityErrorId, ActivityRequest, ActivityResult, ResultType, WorkItem};
use crate::queue::Queue;

/// Activities indexed by task name.
#[derive(Default, Clone)]
pub struct ActivityRegistry {
    activities: HashMap<String, Arc<dyn Activity>>,
}

impl ActivityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the built-in activities.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(EchoActivity));
        registry
    }

    /// Add an activity. A later registration under the same name replaces
    /// the earlier one.
    pub fn register(&mut self, activity: Arc<dyn Activity>) -> &mut Self {
        if self
            .activities
            .insert(activity.name().to_string(), activity.clone())
            .is_some()
        {
            warn!(task = activity.name(), "activity registered twice; replacing");
        }
        self
    }

    pub fn get(&self, task: &str) -> Option<&Arc<dyn Activity>> {
        self.activities.get(task)
    }

    /// Registered task names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.activities.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// Runs the activity named by each work item's request and writes the
/// encoded result back into the item's content.
pub struct ActivityProcessor {
    registry: Arc<ActivityRegistry>,
    context: ActivityContext,
}

impl ActivityProcessor {
    pub fn new(registry: Arc<ActivityRegistry>, context: ActivityContext) -> Self {
        Self { registry, context }
    }
}

#[async_trait]
impl WorkItemProcessor for ActivityProcessor {
    async fn process(&self, item: WorkItem) -> anyhow::Result<Transition> {
        let request = ActivityRequest::decode(&item.content)
            .with_context(|| format!("work item {} does not hold an activity request", item.id))?;

        let result = match self.registry.get(&request.task) {
            Some(activity) => run(activity.as_ref(), &request, &self.context).await,
            None => ActivityResult::error(
                ActivityErrorId::UnknownActivity,
                format!("no activity named {:?}", request.task),
            )
            .for_request(&request),
        };
        info!(
            id = %item.id,
            task = %request.task,
            succeeded = result.succeeded,
            "activity finished"
        );

        Ok(Transition::succeeded(item.result_type).with_content(result.encode()?))
    }
}

/// [`RequestSubmitter`] that enqueues requests as new work items.
#[derive(Clone)]
pub struct QueueSubmitter {
    queue: Queue,
    category: String,
    source: String,
    result_type: ResultType,
}

impl QueueSubmitter {
    pub fn new(
        queue: Queue,
        category: impl Into<String>,
        source: impl Into<String>,
        result_type: ResultType,
    ) -> Self {
        Self {
            queue,
            category: category.into(),
            source: source.into(),
            result_type,
        }
    }
}

#[async_trait]
impl RequestSubmitter for QueueSubmitter {
    async fn submit(&self, request: &ActivityRequest) -> Result<bool> {
        let mut item = WorkItem::new(self.category.clone(), request.encode()?)
            .source(self.source.clone())
            .result_type(self.result_type);
        self.queue.enqueue_work_item(&mut item).await
    }
}

/// Returns its `message` input unchanged.
pub struct EchoActivity;

impl EchoActivity {
    pub const NAME: &'static str = "echo";
}

#[async_trait]
impl Activity for EchoActivity {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn declaration(&self) -> ActivityDeclaration {
        ActivityDeclaration {
            required_values: &["message"],
            allowed_results: &["message"],
        }
    }

    async fn process(
        &self,
        request: &ActivityRequest,
        _ctx: &ActivityContext,
    ) -> std::result::Result<Values, ActivityError> {
        let message = request.get("message").unwrap_or_default();
        if message.trim().is_empty() {
            return Err(ActivityError::invalid_input("message is blank"));
        }
        Ok(Values::from([("message".to_string(), message.to_string())]))
    }
}

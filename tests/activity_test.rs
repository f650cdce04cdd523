//! Integration tests for activities, the activity processor and follow-up
//! submission.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use workdispatch::activity::{
    self, Activity, ActivityConfig, ActivityContext, ActivityDeclaration, ActivityError,
    ActivityProcessor, ActivityRegistry, EchoActivity, QueueSubmitter,
};
use workdispatch::engine::{LandingSignal, ProcessorConfig, QueueProcessor, WorkItemProcessor};
use workdispatch::model::activity::Values;
use workdispatch::model::*;
use workdispatch::queue::{Queue, QueueConfig};
use workdispatch::store::InMemoryDictionary;
use workdispatch::transport::InMemoryQueue;

/// Adds two integers; declares `a` and `b` as required inputs.
struct Add;

#[async_trait]
impl Activity for Add {
    fn name(&self) -> &'static str {
        "add"
    }

    fn declaration(&self) -> ActivityDeclaration {
        ActivityDeclaration {
            required_values: &["a", "b"],
            allowed_results: &["sum"],
        }
    }

    async fn process(
        &self,
        request: &ActivityRequest,
        _ctx: &ActivityContext,
    ) -> Result<Values, ActivityError> {
        let parse = |key: &str| -> Result<i64, ActivityError> {
            request
                .get(key)
                .unwrap_or_default()
                .parse()
                .map_err(|_| ActivityError::invalid_input(format!("{key} is not an integer")))
        };
        let sum = parse("a")? + parse("b")?;
        Ok(Values::from([("sum".to_string(), sum.to_string())]))
    }
}

/// Reports a value it never declared.
struct Leaky;

#[async_trait]
impl Activity for Leaky {
    fn name(&self) -> &'static str {
        "leaky"
    }

    fn declaration(&self) -> ActivityDeclaration {
        ActivityDeclaration {
            required_values: &[],
            allowed_results: &["ok"],
        }
    }

    async fn process(
        &self,
        _request: &ActivityRequest,
        _ctx: &ActivityContext,
    ) -> Result<Values, ActivityError> {
        Ok(Values::from([
            ("ok".to_string(), "1".to_string()),
            ("secret".to_string(), "2".to_string()),
        ]))
    }
}

/// Fails with an unexpected error.
struct Faulty;

#[async_trait]
impl Activity for Faulty {
    fn name(&self) -> &'static str {
        "faulty"
    }

    fn declaration(&self) -> ActivityDeclaration {
        ActivityDeclaration::default()
    }

    async fn process(
        &self,
        _request: &ActivityRequest,
        _ctx: &ActivityContext,
    ) -> Result<Values, ActivityError> {
        let inner = anyhow::anyhow!("disk full");
        Err(inner.context("writing report").into())
    }
}

/// Indexes past the end of an empty list.
struct Panicky;

#[async_trait]
impl Activity for Panicky {
    fn name(&self) -> &'static str {
        "panicky"
    }

    fn declaration(&self) -> ActivityDeclaration {
        ActivityDeclaration::default()
    }

    async fn process(
        &self,
        _request: &ActivityRequest,
        _ctx: &ActivityContext,
    ) -> Result<Values, ActivityError> {
        let empty: Vec<String> = Vec::new();
        let index = empty.len() + 3;
        Ok(Values::from([("x".to_string(), empty[index].clone())]))
    }
}

/// Submits a follow-up echo request, then succeeds.
struct Chain;

#[async_trait]
impl Activity for Chain {
    fn name(&self) -> &'static str {
        "chain"
    }

    fn declaration(&self) -> ActivityDeclaration {
        ActivityDeclaration {
            required_values: &["next"],
            allowed_results: &[],
        }
    }

    async fn process(
        &self,
        request: &ActivityRequest,
        ctx: &ActivityContext,
    ) -> Result<Values, ActivityError> {
        let next = ActivityRequest::new(EchoActivity::NAME)
            .value("message", request.get("next").unwrap_or_default());
        if ctx.submit_request(&next, true).await {
            Ok(Values::new())
        } else {
            Err(ActivityError::new(
                ActivityErrorId::SubmitFailed,
                "follow-up was not queued",
            ))
        }
    }
}

fn detached() -> ActivityContext {
    ActivityContext::detached(ActivityConfig::default())
}

// ---------------------------------------------------------------------------
// run()
// ---------------------------------------------------------------------------

#[tokio::test]
async fn successful_run_stamps_request_identity() {
    let request = ActivityRequest::new("add").value("a", "2").value("b", "40");
    let result = activity::run(&Add, &request, &detached()).await;

    assert!(result.succeeded);
    assert_eq!(result.request_id, request.id);
    assert_eq!(result.task, "add");
    assert_eq!(result.values.get("sum").map(String::as_str), Some("42"));
    assert!(result.error.is_none());
}

#[tokio::test]
async fn missing_required_input_skips_processing() {
    let request = ActivityRequest::new("add").value("a", "2");
    let result = activity::run(&Add, &request, &detached()).await;

    assert!(!result.succeeded);
    assert_eq!(result.error_id(), Some(ActivityErrorId::MissingRequiredInput));
    assert!(result.error.unwrap().message.contains('b'));
    assert_eq!(result.request_id, request.id);
}

#[tokio::test]
async fn expected_failures_keep_their_kind() {
    let request = ActivityRequest::new("add").value("a", "two").value("b", "3");
    let result = activity::run(&Add, &request, &detached()).await;
    assert_eq!(result.error_id(), Some(ActivityErrorId::InvalidInput));
}

#[tokio::test]
async fn unexpected_errors_become_generic_errors() {
    let request = ActivityRequest::new("faulty");
    let result = activity::run(&Faulty, &request, &detached()).await;

    assert_eq!(result.error_id(), Some(ActivityErrorId::GenericError));
    let error = result.error.unwrap();
    assert!(error.message.contains("writing report"));
    assert!(error.message.contains("disk full"));
    assert!(error.stack_trace.is_some());
}

#[tokio::test]
async fn panicking_activity_becomes_generic_error() {
    let request = ActivityRequest::new("panicky");
    let result = tokio::spawn({
        let request = request.clone();
        async move { activity::run(&Panicky, &request, &detached()).await }
    })
    .await
    .expect("panic must not escape run");

    assert!(!result.succeeded);
    assert_eq!(result.error_id(), Some(ActivityErrorId::GenericError));
    assert_eq!(result.request_id, request.id);
    assert_eq!(result.task, "panicky");
    assert!(result.error.unwrap().message.contains("index out of bounds"));
}

#[tokio::test]
async fn panicking_activity_still_routes_a_result() {
    let mut registry = ActivityRegistry::new();
    registry.register(Arc::new(Panicky));
    let processor = ActivityProcessor::new(Arc::new(registry), detached());
    let item = WorkItem::new("work", ActivityRequest::new("panicky").encode().unwrap())
        .result_type(ResultType::Shared);

    let transition = processor.process(item).await.unwrap();
    assert_eq!(transition.status, Status::Processed);
    let result = ActivityResult::decode(&transition.content.unwrap()).unwrap();
    assert_eq!(result.error_id(), Some(ActivityErrorId::GenericError));
}

#[tokio::test]
async fn undeclared_result_values_are_rejected() {
    let request = ActivityRequest::new("leaky");
    let result = activity::run(&Leaky, &request, &detached()).await;

    assert_eq!(result.error_id(), Some(ActivityErrorId::UnknownResultValue));
    assert!(result.error.unwrap().message.contains("secret"));
    assert!(result.values.is_empty());
}

#[test]
fn results_survive_encoding() {
    let request = ActivityRequest::new("echo").value("message", "hi");
    let decoded = ActivityRequest::decode(&request.encode().unwrap()).unwrap();
    assert_eq!(decoded, request);

    let failed = ActivityResult::error(ActivityErrorId::SubmitFailed, "nope")
        .with_stack_trace("at chain")
        .for_request(&request);
    let decoded = ActivityResult::decode(&failed.encode().unwrap()).unwrap();
    assert_eq!(decoded, failed);
}

// ---------------------------------------------------------------------------
// ActivityProcessor
// ---------------------------------------------------------------------------

fn registry() -> Arc<ActivityRegistry> {
    let mut registry = ActivityRegistry::with_builtins();
    registry.register(Arc::new(Add)).register(Arc::new(Chain));
    Arc::new(registry)
}

#[test]
fn registry_lists_names_sorted() {
    assert_eq!(registry().names(), vec!["add", "chain", "echo"]);
    assert!(registry().get("missing").is_none());
}

#[tokio::test]
async fn processor_writes_encoded_result_into_content() {
    let processor = ActivityProcessor::new(registry(), detached());
    let request = ActivityRequest::new("add").value("a", "1").value("b", "1");
    let item = WorkItem::new("work", request.encode().unwrap()).result_type(ResultType::Polled);

    let transition = processor.process(item).await.unwrap();
    assert_eq!(transition.status, Status::Processed);

    let result = ActivityResult::decode(&transition.content.unwrap()).unwrap();
    assert!(result.succeeded);
    assert_eq!(result.values.get("sum").map(String::as_str), Some("2"));
}

#[tokio::test]
async fn unknown_task_is_reported_in_the_result() {
    let processor = ActivityProcessor::new(registry(), detached());
    let item = WorkItem::new("work", ActivityRequest::new("nope").encode().unwrap());

    let transition = processor.process(item).await.unwrap();
    assert_eq!(transition.status, Status::Completed);
    let result = ActivityResult::decode(&transition.content.unwrap()).unwrap();
    assert_eq!(result.error_id(), Some(ActivityErrorId::UnknownActivity));
}

#[tokio::test]
async fn undecodable_content_is_a_processor_error() {
    let processor = ActivityProcessor::new(registry(), detached());
    let item = WorkItem::new("work", "<req/>");
    assert!(processor.process(item).await.is_err());
}

// ---------------------------------------------------------------------------
// End to end through the queue
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn follow_up_requests_are_queued_and_processed() {
    let queue = Queue::new(
        Arc::new(InMemoryQueue::default()),
        Arc::new(InMemoryDictionary::new("work_items")),
        Arc::new(InMemoryDictionary::new("failed_work_items")),
        QueueConfig::default(),
    );
    let submitter = QueueSubmitter::new(queue.clone(), "work", "chain-test", ResultType::Shared);
    let context = ActivityContext::new(
        Arc::new(submitter),
        ActivityConfig {
            submit_retry_count: 1,
            submit_retry_delay: Duration::from_millis(10),
        },
    );

    let first = ActivityRequest::new("chain").value("next", "hello");
    let mut item = WorkItem::new("work", first.encode().unwrap());
    queue.enqueue_work_item(&mut item).await.unwrap();

    let landing = LandingSignal::new();
    landing.land();
    let mut worker = QueueProcessor::new(
        queue.clone(),
        Arc::new(ActivityProcessor::new(registry(), context)),
        vec!["work".to_string()],
        ProcessorConfig {
            min_poll_wait: Duration::from_millis(10),
            landing_stabilization: Duration::from_millis(50),
            ..ProcessorConfig::default()
        },
        Arc::new(InMemoryDictionary::new("processor_control")),
    )
    .unwrap()
    .deployment(Arc::new(landing));
    worker.run().await.unwrap();

    let chained = queue.check_work_item(&item.id).await.unwrap().unwrap();
    assert_eq!(chained.status, Status::Completed);
    assert!(ActivityResult::decode(&chained.content).unwrap().succeeded);

    // The echo follow-up ran too and its shared result is waiting.
    let results = queue
        .dequeue_results(work::SHARED_RESULTS_CATEGORY, 10)
        .await
        .unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].source, "chain-test");
    let echoed = ActivityResult::decode(&results[0].content).unwrap();
    assert_eq!(echoed.task, EchoActivity::NAME);
    assert_eq!(
        echoed.values.get("message").map(String::as_str),
        Some("hello")
    );
}

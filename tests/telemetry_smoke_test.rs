//! Smoke tests for the full observability stack.
//!
//! These tests require an OTLP collector on localhost:4317 feeding Tempo,
//! Prometheus and Loki on their default ports.
//!
//! Run with:
//! ```sh
//! cargo test --test telemetry_smoke_test -- --ignored --nocapture
//! ```

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use opentelemetry::KeyValue;
use workdispatch::activity::{ActivityConfig, ActivityContext, ActivityProcessor, ActivityRegistry};
use workdispatch::engine::{LandingSignal, ProcessorConfig, QueueProcessor};
use workdispatch::model::{ActivityRequest, Status, WorkId, WorkItem};
use workdispatch::queue::{Queue, QueueConfig};
use workdispatch::store::InMemoryDictionary;
use workdispatch::telemetry::{TelemetryConfig, TelemetryGuard, init_telemetry};
use workdispatch::transport::InMemoryQueue;

const SERVICE: &str = "workdispatch-smoke-test";

static TELEMETRY: OnceLock<TelemetryGuard> = OnceLock::new();

fn ensure_telemetry() -> &'static TelemetryGuard {
    TELEMETRY.get_or_init(|| {
        init_telemetry(TelemetryConfig {
            endpoint: Some("http://localhost:4317".to_string()),
            instance_id: Some("smoke-1".to_string()),
            categories: vec!["smoke".to_string()],
            ..TelemetryConfig::new(SERVICE)
        })
        .expect("failed to init telemetry")
    })
}

/// Force-flush all providers and give backends time to ingest.
async fn flush_and_wait(guard: &TelemetryGuard) {
    guard.force_flush();
    tokio::time::sleep(Duration::from_secs(8)).await;
}

async fn query(url: &str, params: &[(&str, &str)]) -> serde_json::Value {
    let resp = reqwest::Client::new()
        .get(url)
        .query(params)
        .send()
        .await
        .unwrap_or_else(|e| panic!("failed to query {url}: {e}"));
    assert!(
        resp.status().is_success(),
        "{url} query failed: {}",
        resp.status()
    );
    resp.json().await.expect("failed to parse response")
}

async fn tempo_traces() -> usize {
    let tags = format!("service.name={SERVICE}");
    let body = query(
        "http://localhost:3200/api/search",
        &[("tags", tags.as_str()), ("limit", "5")],
    )
    .await;
    body["traces"].as_array().map_or(0, Vec::len)
}

async fn prometheus_series(metric: &str) -> usize {
    let body = query("http://localhost:9090/api/v1/query", &[("query", metric)]).await;
    body["data"]["result"].as_array().map_or(0, Vec::len)
}

async fn loki_streams() -> usize {
    let selector = format!(r#"{{service_name="{SERVICE}"}}"#);
    let body = query(
        "http://localhost:3100/loki/api/v1/query_range",
        &[("query", selector.as_str()), ("limit", "10")],
    )
    .await;
    body["data"]["result"].as_array().map_or(0, Vec::len)
}

#[test]
#[ignore]
fn smoke_traces() {
    let rt = tokio::runtime::Runtime::new().unwrap();
    rt.block_on(async {
        let guard = ensure_telemetry();
        {
            let span = workdispatch::telemetry::work::start_work_span("smoke", &WorkId::new());
            let _enter = span.enter();
            workdispatch::telemetry::work::record_state_transition(
                &span,
                Status::Pending,
                Status::InProgress,
            );
        }
        flush_and_wait(guard).await;

        let traces = tempo_traces().await;
        println!("Tempo: found {traces} trace(s)");
        assert!(traces > 0, "expected traces in Tempo");
    });
}

#[test]
#[ignore]
fn smoke_metrics() {
    let rt = tokio::runtime::Runtime::new().unwrap();
    rt.block_on(async {
        let guard = ensure_telemetry();
        workdispatch::telemetry::metrics::work_enqueued().add(
            1,
            &[
                KeyValue::new("category", "smoke"),
                KeyValue::new("result", "ok"),
            ],
        );
        workdispatch::telemetry::metrics::processing_duration_ms()
            .record(42.5, &[KeyValue::new("category", "smoke")]);
        flush_and_wait(guard).await;

        let series = prometheus_series("workdispatch_work_enqueued_total").await;
        println!("Prometheus: found {series} series");
        assert!(series > 0, "expected metric results in Prometheus");
    });
}

#[test]
#[ignore]
fn smoke_logs() {
    let rt = tokio::runtime::Runtime::new().unwrap();
    rt.block_on(async {
        let guard = ensure_telemetry();
        tracing::info!(component = "smoke-test", "smoke test info log");
        tracing::warn!(component = "smoke-test", "smoke test warning log");
        flush_and_wait(guard).await;

        let streams = loki_streams().await;
        println!("Loki: found {streams} stream(s)");
        assert!(streams > 0, "expected log streams in Loki");
    });
}

/// Runs a real processor over in-memory adapters so every signal comes from
/// production code paths.
#[test]
#[ignore]
fn smoke_full_lifecycle() {
    let rt = tokio::runtime::Runtime::new().unwrap();
    rt.block_on(async {
        let guard = ensure_telemetry();

        let queue = Queue::new(
            Arc::new(InMemoryQueue::default()),
            Arc::new(InMemoryDictionary::new("work_items")),
            Arc::new(InMemoryDictionary::new("failed_work_items")),
            QueueConfig::default(),
        );
        for message in ["one", "two", ""] {
            let request = ActivityRequest::new("echo").value("message", message);
            let mut item = WorkItem::new("smoke", request.encode().unwrap());
            queue.enqueue_work_item(&mut item).await.unwrap();
        }

        let landing = LandingSignal::new();
        landing.land();
        let processor = ActivityProcessor::new(
            Arc::new(ActivityRegistry::with_builtins()),
            ActivityContext::detached(ActivityConfig::default()),
        );
        let mut worker = QueueProcessor::new(
            queue,
            Arc::new(processor),
            vec!["smoke".to_string()],
            ProcessorConfig {
                min_poll_wait: Duration::from_millis(50),
                landing_stabilization: Duration::from_millis(500),
                ..ProcessorConfig::default()
            },
            Arc::new(InMemoryDictionary::new("processor_control")),
        )
        .unwrap()
        .deployment(Arc::new(landing));
        worker.run().await.unwrap();

        flush_and_wait(guard).await;

        let traces = tempo_traces().await;
        let series = prometheus_series("workdispatch_work_state_transitions_total").await;
        let streams = loki_streams().await;
        println!("Full lifecycle: {traces} trace(s), {series} series, {streams} stream(s)");
        assert!(traces > 0, "expected traces in Tempo");
        assert!(series > 0, "expected metrics in Prometheus");
        assert!(streams > 0, "expected logs in Loki");
    });
}

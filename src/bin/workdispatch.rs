//! workdispatch CLI: run a worker, submit and inspect work items.

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use secrecy::ExposeSecret;
use tokio_util::sync::CancellationToken;
use tracing::info;
use workdispatch::activity::{
    ActivityContext, ActivityProcessor, ActivityRegistry, QueueSubmitter,
};
use workdispatch::config::{Config, Settings};
use workdispatch::db::{Db, PgDictionary, PgmqQueue};
use workdispatch::engine::{ExitReason, LandingSignal, QueueProcessor};
use workdispatch::model::activity::Values;
use workdispatch::model::work::{RESULT_CATEGORY_PREFIX, SHARED_RESULTS_CATEGORY};
use workdispatch::model::{ActivityRequest, ActivityResult, ResultType, WorkId, WorkItem};
use workdispatch::queue::Queue;
use workdispatch::telemetry::{TelemetryConfig, init_telemetry};

/// Store names inside `kv_entries`.
const ITEMS_STORE: &str = "work_items";
const FAILED_ITEMS_STORE: &str = "failed_work_items";
const CONTROL_STORE: &str = "processor_control";

#[derive(Parser)]
#[command(name = "workdispatch", about = "Durable work item dispatch")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a queue processor until drained or interrupted
    Serve {
        /// Categories to poll, highest priority first
        #[arg(long = "category", required = true)]
        categories: Vec<String>,
        /// Seconds a claimed entry stays hidden before redelivery
        #[arg(long, default_value_t = 60)]
        visibility_timeout: u64,
        /// Source name stamped on follow-up requests
        #[arg(long, default_value = "workdispatch")]
        source: String,
    },
    /// Work item operations
    Work {
        #[command(subcommand)]
        action: WorkAction,
    },
    /// Run one retention cleanup sweep
    Cleanup,
}

#[derive(Subcommand)]
enum WorkAction {
    /// Submit an activity request as a new work item
    Submit {
        /// Category to enqueue under
        category: String,
        /// Activity task name
        task: String,
        /// Request value as KEY=VALUE (repeatable)
        #[arg(long = "value", value_parser = parse_key_val)]
        values: Vec<(String, String)>,
        /// Submitting component
        #[arg(long, default_value = "cli")]
        source: String,
        /// How the result is returned
        #[arg(long, value_enum, default_value_t = ResultTypeArg::Direct)]
        result_type: ResultTypeArg,
    },
    /// Show a work item
    Show {
        /// Work item ID
        id: String,
    },
    /// Retrieve and acknowledge routed results
    Results {
        /// Read `R-{source}`. The processor only routes `shared` results;
        /// per-source categories are filled by callers that route results
        /// themselves with `Queue::enqueue_processed_work_item`.
        #[arg(long, conflicts_with = "shared")]
        source: Option<String>,
        /// Read the shared results category
        #[arg(long)]
        shared: bool,
        /// Maximum results to retrieve
        #[arg(long, default_value_t = 10)]
        max: usize,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ResultTypeArg {
    Direct,
    Polled,
    Shared,
}

impl From<ResultTypeArg> for ResultType {
    fn from(arg: ResultTypeArg) -> Self {
        match arg {
            ResultTypeArg::Direct => ResultType::Direct,
            ResultTypeArg::Polled => ResultType::Polled,
            ResultTypeArg::Shared => ResultType::Shared,
        }
    }
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, got {s:?}"))
}

struct Backend {
    db: Arc<Db>,
    settings: Settings,
}

impl Backend {
    async fn connect(config: &Config) -> anyhow::Result<Self> {
        let settings = config.settings()?;
        let db = Db::connect(config.database_url.expose_secret()).await?;
        db.migrate().await?;
        Ok(Self {
            db: Arc::new(db),
            settings,
        })
    }

    fn queue(&self, visibility_timeout: Duration) -> Queue {
        Queue::new(
            Arc::new(PgmqQueue::new(self.db.clone(), visibility_timeout)),
            Arc::new(PgDictionary::new(self.db.clone(), ITEMS_STORE)),
            Arc::new(PgDictionary::new(self.db.clone(), FAILED_ITEMS_STORE)),
            self.settings.queue.clone(),
        )
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    match cli.command {
        Command::Serve {
            categories,
            visibility_timeout,
            source,
        } => cmd_serve(&config, categories, visibility_timeout, source).await,
        Command::Work { action } => {
            let backend = Backend::connect(&config).await?;
            let queue = backend.queue(Duration::from_secs(60));
            match action {
                WorkAction::Submit {
                    category,
                    task,
                    values,
                    source,
                    result_type,
                } => cmd_work_submit(&queue, category, task, values, source, result_type.into()).await,
                WorkAction::Show { id } => cmd_work_show(&queue, id).await,
                WorkAction::Results {
                    source,
                    shared,
                    max,
                } => cmd_work_results(&queue, source, shared, max).await,
            }
        }
        Command::Cleanup => {
            let backend = Backend::connect(&config).await?;
            let report = backend
                .queue(Duration::from_secs(60))
                .cleanup_work_items()
                .await?;
            println!(
                "scanned {}, removed {} ({} archived), {} error(s)",
                report.scanned, report.removed, report.archived, report.errors
            );
            Ok(())
        }
    }
}

async fn cmd_serve(
    config: &Config,
    categories: Vec<String>,
    visibility_timeout: u64,
    source: String,
) -> anyhow::Result<()> {
    let guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        default_level: config.log_level.clone(),
        instance_id: Some(format!("{source}-{}", std::process::id())),
        categories: categories.clone(),
        ..TelemetryConfig::new("workdispatch")
    })?;

    let backend = Backend::connect(config).await?;
    let queue = backend.queue(Duration::from_secs(visibility_timeout));

    let submitter = QueueSubmitter::new(
        queue.clone(),
        categories.first().cloned().unwrap_or_default(),
        source,
        ResultType::Direct,
    );
    let context = ActivityContext::new(Arc::new(submitter), backend.settings.activity.clone());
    let registry = Arc::new(ActivityRegistry::with_builtins());
    info!(activities = ?registry.names(), "activities registered");
    let processor = Arc::new(ActivityProcessor::new(registry, context));

    let landing = LandingSignal::new();
    let cancel = CancellationToken::new();
    let mut worker = QueueProcessor::new(
        queue,
        processor,
        categories,
        backend.settings.processor.clone(),
        Arc::new(PgDictionary::new(backend.db.clone(), CONTROL_STORE)),
    )?
    .deployment(Arc::new(landing.clone()))
    .cancellation_token(cancel.clone());

    // First Ctrl-C drains, the second stops immediately.
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("landing: draining queue before exit");
            landing.land();
        }
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("second interrupt: stopping now");
            cancel.cancel();
        }
    });

    let reason = worker.run().await?;
    match reason {
        ExitReason::Drained => info!("queue drained, exiting"),
        ExitReason::Cancelled => info!("processor cancelled, exiting"),
    }
    guard.force_flush();
    Ok(())
}

async fn cmd_work_submit(
    queue: &Queue,
    category: String,
    task: String,
    values: Vec<(String, String)>,
    source: String,
    result_type: ResultType,
) -> anyhow::Result<()> {
    let mut request = ActivityRequest::new(task);
    request.values = values.into_iter().collect::<Values>();

    let mut item = WorkItem::new(category, request.encode()?)
        .source(source)
        .result_type(result_type);
    let queued = queue.enqueue_work_item(&mut item).await?;

    if queued {
        println!("Queued: {} (request {})", item.id, request.id);
    } else {
        anyhow::bail!("work item {} was stored but could not be queued", item.id);
    }
    Ok(())
}

async fn cmd_work_show(queue: &Queue, id: String) -> anyhow::Result<()> {
    let Some(item) = queue.check_work_item(&WorkId::from(id.as_str())).await? else {
        anyhow::bail!("no work item {id}");
    };

    println!("ID:          {}", item.id);
    println!("Category:    {}", item.category);
    println!("Source:      {}", item.source);
    println!("Result Type: {}", item.result_type);
    println!("Status:      {}", item.status);
    let stamp = |t: Option<chrono::DateTime<chrono::Utc>>| {
        t.map(|t| t.to_rfc3339()).unwrap_or_else(|| "-".to_string())
    };
    println!("Queued:      {}", stamp(item.queued_time));
    println!("Dequeued:    {}", stamp(item.dequeue_time));
    println!("Started:     {}", stamp(item.processing_start_time));
    println!("Completed:   {}", stamp(item.processing_complete_time));
    if let Some(ref result) = item.result {
        println!("Failure:     {result}");
    }
    println!("---");
    match ActivityResult::decode(&item.content) {
        Ok(result) => println!("{}", serde_json::to_string_pretty(&result)?),
        Err(_) => println!("{}", item.content),
    }
    Ok(())
}

async fn cmd_work_results(
    queue: &Queue,
    source: Option<String>,
    shared: bool,
    max: usize,
) -> anyhow::Result<()> {
    let category = results_category(source, shared)?;
    let results = queue.dequeue_results(&category, max).await?;
    if results.is_empty() {
        println!("No results in {category}.");
        return Ok(());
    }
    for mut item in results {
        let summary = match ActivityResult::decode(&item.content) {
            Ok(result) if result.succeeded => format!("ok {:?}", result.values),
            Ok(result) => format!(
                "error {}",
                result
                    .error
                    .map(|e| format!("{}: {}", e.id, e.message))
                    .unwrap_or_default()
            ),
            Err(_) => item.content.clone(),
        };
        queue.acknowledge_result(&mut item).await?;
        println!("{}  {summary}", item.id);
    }
    Ok(())
}

fn results_category(source: Option<String>, shared: bool) -> anyhow::Result<String> {
    match (source, shared) {
        (_, true) => Ok(SHARED_RESULTS_CATEGORY.to_string()),
        (Some(source), false) => Ok(format!("{RESULT_CATEGORY_PREFIX}{source}")),
        (None, false) => anyhow::bail!("pass --source or --shared"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn results_read_the_routed_categories() {
        assert_eq!(results_category(None, true).unwrap(), SHARED_RESULTS_CATEGORY);
        assert_eq!(
            results_category(Some("billing".into()), false).unwrap(),
            "R-billing"
        );
        assert!(results_category(None, false).is_err());
    }

    #[test]
    fn source_and_shared_are_exclusive() {
        let parsed = Cli::try_parse_from([
            "workdispatch",
            "work",
            "results",
            "--source",
            "billing",
            "--shared",
        ]);
        assert!(parsed.is_err());
    }
}

//! Wires a queue with handlers for the four job types and runs it until
//! Ctrl+C. No HTTP server, no adapters — a thin binary that exists to show
//! the pieces fit together, the way the teacher's own example binaries do.

use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use jobqueue_core::{
    CancelSignal, Job, JobHandler, JobOptions, JobQueue, JobType, ProgressReporter, QueueConfig,
};
use jobqueue_retry::{ClassifiableError, RetryOptions};
use serde_json::{json, Value};
use tracing::info;

struct ReqwestError(reqwest::Error);

impl ClassifiableError for ReqwestError {
    fn status(&self) -> Option<u16> {
        self.0.status().map(|s| s.as_u16())
    }

    fn message(&self) -> Cow<'_, str> {
        Cow::Owned(self.0.to_string())
    }
}

/// Fetches a URL from `payload.url`, retrying transient failures with
/// backoff via `jobqueue-retry` before giving up.
struct FetchHandler {
    client: reqwest::Client,
}

#[async_trait]
impl JobHandler for FetchHandler {
    async fn handle(
        &self,
        job: Job,
        progress: ProgressReporter,
        cancel: CancelSignal,
    ) -> anyhow::Result<Value> {
        let url = job
            .payload
            .get("url")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow::anyhow!("payload.url is required"))?
            .to_string();

        progress.report(10, Some("starting fetch".to_string())).await;

        let client = self.client.clone();
        let opts = RetryOptions::<ReqwestError>::with_default_classifier().max_retries(2);
        let body = jobqueue_retry::retry(&opts, || {
            let client = client.clone();
            let url = url.clone();
            async move {
                client
                    .get(&url)
                    .send()
                    .await
                    .and_then(|r| r.error_for_status())
                    .map_err(ReqwestError)?
                    .text()
                    .await
                    .map_err(ReqwestError)
            }
        })
        .await
        .map_err(|e| anyhow::anyhow!(e.0))?;

        if cancel.is_cancelled() {
            anyhow::bail!("cancelled before completion");
        }
        progress.report(100, Some("fetch complete".to_string())).await;
        Ok(json!({ "url": url, "bytes": body.len() }))
    }
}

/// Demo-only: records that a crawl "happened" without doing real network
/// traversal, since the crawler itself is out of scope for this core.
struct CrawlHandler;

#[async_trait]
impl JobHandler for CrawlHandler {
    async fn handle(
        &self,
        job: Job,
        progress: ProgressReporter,
        _cancel: CancelSignal,
    ) -> anyhow::Result<Value> {
        let depth = job.payload.get("depth").and_then(Value::as_u64).unwrap_or(1);
        for step in 1..=depth {
            progress
                .report(
                    ((step as f64 / depth as f64) * 100.0) as i64,
                    Some(format!("crawled depth {step}/{depth}")),
                )
                .await;
        }
        Ok(json!({ "pages_visited": depth }))
    }
}

/// Demo-only: pretends to extract structured content from `payload.html`.
struct ExtractHandler;

#[async_trait]
impl JobHandler for ExtractHandler {
    async fn handle(
        &self,
        job: Job,
        progress: ProgressReporter,
        _cancel: CancelSignal,
    ) -> anyhow::Result<Value> {
        progress.report(50, Some("extracting".to_string())).await;
        let html = job.payload.get("html").and_then(Value::as_str).unwrap_or("");
        Ok(json!({ "title": html.lines().next().unwrap_or("") }))
    }
}

/// Demo-only: a trivial multi-step workflow handler.
struct WorkflowHandler;

#[async_trait]
impl JobHandler for WorkflowHandler {
    async fn handle(
        &self,
        _job: Job,
        progress: ProgressReporter,
        cancel: CancelSignal,
    ) -> anyhow::Result<Value> {
        for step in ["fetch", "crawl", "extract"] {
            if cancel.is_cancelled() {
                anyhow::bail!("workflow cancelled at step {step}");
            }
            progress.report(0, Some(format!("running step: {step}"))).await;
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        progress.report(100, Some("workflow complete".to_string())).await;
        Ok(json!({ "steps": ["fetch", "crawl", "extract"] }))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let config = QueueConfig {
        concurrency: 4,
        ..QueueConfig::default()
    };
    let store = jobqueue_redis::create_job_store(&config).await;
    let queue = JobQueue::new(config, store);

    queue.register_handler(
        JobType::Fetch,
        Arc::new(FetchHandler { client: reqwest::Client::new() }),
    );
    queue.register_handler(JobType::Crawl, Arc::new(CrawlHandler));
    queue.register_handler(JobType::Extract, Arc::new(ExtractHandler));
    queue.register_handler(JobType::Workflow, Arc::new(WorkflowHandler));

    queue.start();
    info!(handlers = ?queue.stats().handlers, "extraction worker running");

    let id = queue.enqueue(
        JobType::Workflow,
        json!({}),
        JobOptions { priority: 8, ..Default::default() },
    )?;
    info!(job_id = %id, "enqueued demo workflow job");

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    queue.stop_and_wait(Duration::from_secs(5)).await;
    Ok(())
}

//! Test harness for `jobqueue-core`: recording and scriptable handlers plus
//! polling helpers, in the shape of the teacher's dedicated `seesaw-testing`
//! crate.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use jobqueue_core::{CancelSignal, Job, JobHandler, JobQueue, ProgressReporter};
use serde_json::Value;
use uuid::Uuid;

/// Captures every invocation it receives, in order, and replies with a
/// fixed or computed response.
pub struct RecordingHandler {
    invocations: Mutex<Vec<Job>>,
    response: Box<dyn Fn(&Job) -> anyhow::Result<Value> + Send + Sync>,
}

impl RecordingHandler {
    /// Always succeeds with `result`.
    pub fn succeeding_with(result: Value) -> Self {
        Self {
            invocations: Mutex::new(Vec::new()),
            response: Box::new(move |_| Ok(result.clone())),
        }
    }

    /// Calls `response` for every invocation, recording the job first.
    pub fn with_response(
        response: impl Fn(&Job) -> anyhow::Result<Value> + Send + Sync + 'static,
    ) -> Self {
        Self {
            invocations: Mutex::new(Vec::new()),
            response: Box::new(response),
        }
    }

    pub fn invocations(&self) -> Vec<Job> {
        self.invocations.lock().unwrap().clone()
    }

    pub fn invocation_count(&self) -> usize {
        self.invocations.lock().unwrap().len()
    }
}

#[async_trait]
impl JobHandler for RecordingHandler {
    async fn handle(
        &self,
        job: Job,
        _progress: ProgressReporter,
        _cancel: CancelSignal,
    ) -> anyhow::Result<Value> {
        self.invocations.lock().unwrap().push(job.clone());
        (self.response)(&job)
    }
}

/// Fails its first `fail_times` invocations with `error_message`, then
/// succeeds with `serde_json::json!({"succeeded_after": n})`.
pub struct FlakyHandler {
    fail_times: u32,
    error_message: String,
    calls: AtomicU32,
}

impl FlakyHandler {
    pub fn new(fail_times: u32, error_message: impl Into<String>) -> Self {
        Self {
            fail_times,
            error_message: error_message.into(),
            calls: AtomicU32::new(0),
        }
    }

    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobHandler for FlakyHandler {
    async fn handle(
        &self,
        _job: Job,
        _progress: ProgressReporter,
        _cancel: CancelSignal,
    ) -> anyhow::Result<Value> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if n <= self.fail_times {
            anyhow::bail!(self.error_message.clone());
        }
        Ok(serde_json::json!({ "succeeded_after": n }))
    }
}

/// Polls `queue.get_job(id)` until `pred` holds or `timeout` elapses.
/// Returns `None` on timeout rather than panicking, so callers can choose
/// how to report a stuck test.
pub async fn wait_until(
    queue: &JobQueue,
    id: Uuid,
    pred: impl Fn(&Job) -> bool,
    timeout: Duration,
) -> Option<Job> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(job) = queue.get_job(id).await {
            if pred(&job) {
                return Some(job);
            }
        }
        if tokio::time::Instant::now() >= deadline {
            return None;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobqueue_core::{JobOptions, JobStatus, JobType, QueueConfig, VolatileStore};

    #[tokio::test]
    async fn flaky_handler_fails_then_succeeds() {
        let queue = JobQueue::new(
            QueueConfig { tick_interval_ms: 5, ..QueueConfig::default() },
            Arc::new(VolatileStore::new()),
        );
        queue.register_handler(JobType::Fetch, Arc::new(FlakyHandler::new(2, "flaky")));
        let id = queue
            .enqueue(
                JobType::Fetch,
                serde_json::json!({}),
                JobOptions { retries: 2, ..Default::default() },
            )
            .unwrap();
        queue.start();

        let job = wait_until(&queue, id, |j| j.status.is_terminal(), Duration::from_secs(5))
            .await
            .expect("job did not terminate in time");
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.attempts, 3);
        queue.stop();
    }

    #[tokio::test]
    async fn recording_handler_captures_invocations() {
        let handler = Arc::new(RecordingHandler::succeeding_with(serde_json::json!({"ok": true})));
        let queue = JobQueue::new(
            QueueConfig { tick_interval_ms: 5, ..QueueConfig::default() },
            Arc::new(VolatileStore::new()),
        );
        queue.register_handler(JobType::Extract, handler.clone());
        let id = queue
            .enqueue(JobType::Extract, serde_json::json!({"url": "x"}), JobOptions::default())
            .unwrap();
        queue.start();

        wait_until(&queue, id, |j| j.status.is_terminal(), Duration::from_secs(5))
            .await
            .expect("job did not terminate in time");

        assert_eq!(handler.invocation_count(), 1);
        assert_eq!(handler.invocations()[0].id, id);
        queue.stop();
    }
}

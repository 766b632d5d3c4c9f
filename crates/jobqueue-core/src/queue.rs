//! The scheduler: priority queue, worker pool, lifecycle state machine,
//! progress fan-out, webhook delivery, eviction, and the queue/store
//! boundary (hydration + fire-and-forget persistence).

use std::borrow::Cow;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use jobqueue_retry::ClassifiableError;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::error::QueueError;
use crate::model::{Job, JobOptions, JobStatus, JobType, ListFilter};
use crate::progress::{ProgressEvent, ProgressStream};
use crate::store::JobStore;
use crate::webhook::{deliver_webhook, AllowAllValidator, WebhookPayload, WebhookUrlValidator};

/// A job-type handler. Receives an owned snapshot of the job record, a
/// [`ProgressReporter`] for live updates, and a [`CancelSignal`] it should
/// observe at I/O boundaries. Handlers that ignore the signal are still
/// bounded by the job's timeout.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(
        &self,
        job: Job,
        progress: ProgressReporter,
        cancel: CancelSignal,
    ) -> anyhow::Result<Value>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CancelState {
    Running,
    Cancelled,
    TimedOut,
}

/// Handed to a running handler so it can check for, or wait on, cancellation.
#[derive(Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<CancelState>,
}

impl CancelSignal {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow() != CancelState::Running
    }

    /// Resolves once the job is cancelled or its timeout fires. Never
    /// resolves otherwise.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow() != CancelState::Running {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

async fn wait_for_signal(rx: &mut watch::Receiver<CancelState>) {
    loop {
        if *rx.borrow() != CancelState::Running {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// Lets a handler push progress percentage and an optional status message.
/// Progress is fanned out to live subscribers; it is not persisted to the
/// store (in-flight progress does not survive a restart).
pub struct ProgressReporter {
    inner: Arc<Inner>,
    job_id: Uuid,
}

impl ProgressReporter {
    pub async fn report(&self, percent: i64, message: Option<String>) {
        self.inner.report_progress(self.job_id, percent, message);
    }
}

/// Wraps a handler's `anyhow::Error` so the retry classifier can judge it by
/// message alone — handlers report generic errors, not structured codes.
struct HandlerError(String);

impl ClassifiableError for HandlerError {
    fn message(&self) -> Cow<'_, str> {
        Cow::Borrowed(&self.0)
    }
}

#[derive(Debug, Clone)]
pub struct Stats {
    pub queued: usize,
    pub running: usize,
    pub total: usize,
    pub handlers: Vec<&'static str>,
}

#[derive(Debug, Clone, Copy)]
struct PendingEntry {
    job_id: Uuid,
    priority: u8,
    seq: u64,
}

fn dispatch_key(entry: &PendingEntry) -> (i16, u64) {
    (-(entry.priority as i16), entry.seq)
}

fn insert_pending(pending: &mut Vec<PendingEntry>, entry: PendingEntry) {
    let key = dispatch_key(&entry);
    let pos = pending.partition_point(|e| dispatch_key(e) <= key);
    pending.insert(pos, entry);
}

struct RunningHandle {
    cancel_tx: watch::Sender<CancelState>,
    timeout_task: JoinHandle<()>,
}

struct Inner {
    config: QueueConfig,
    store: Arc<dyn JobStore>,
    handlers: DashMap<JobType, Arc<dyn JobHandler>>,
    jobs: DashMap<Uuid, Job>,
    pending: StdMutex<Vec<PendingEntry>>,
    running: DashMap<Uuid, RunningHandle>,
    subscribers: DashMap<Uuid, Vec<mpsc::UnboundedSender<ProgressEvent>>>,
    seq: AtomicU64,
    started: std::sync::atomic::AtomicBool,
    tick_task: StdMutex<Option<JoinHandle<()>>>,
    in_flight: AtomicUsize,
    webhook_client: reqwest::Client,
    url_validator: Arc<dyn WebhookUrlValidator>,
}

impl Inner {
    async fn run_tick_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(Duration::from_millis(self.config.tick_interval_ms));
        loop {
            interval.tick().await;
            self.tick();
        }
    }

    fn tick(self: &Arc<Self>) {
        let capacity = self.config.concurrency.saturating_sub(self.running.len());
        if capacity == 0 {
            return;
        }
        let mut dispatched = 0;
        loop {
            if dispatched >= capacity {
                break;
            }
            let next = {
                let mut pending = self.pending.lock().unwrap();
                if pending.is_empty() {
                    None
                } else {
                    Some(pending.remove(0))
                }
            };
            let Some(entry) = next else { break };
            let still_queued = self
                .jobs
                .get(&entry.job_id)
                .map(|j| j.status == JobStatus::Queued)
                .unwrap_or(false);
            if !still_queued {
                // Stale entry: the job was cancelled, or otherwise left
                // `queued` state, between being enqueued and being popped.
                continue;
            }
            self.dispatch(entry.job_id);
            dispatched += 1;
        }
    }

    fn dispatch(self: &Arc<Self>, job_id: Uuid) {
        let job_type = {
            let mut job = match self.jobs.get_mut(&job_id) {
                Some(j) => j,
                None => return,
            };
            if job.status != JobStatus::Queued {
                return;
            }
            job.status = JobStatus::Running;
            job.started_at = Some(Utc::now());
            job.attempts += 1;
            job.job_type
        };
        debug!(job_id = %job_id, %job_type, "dispatching job");
        self.spawn_persist(job_id);

        let handler = self.handlers.get(&job_type).map(|h| h.clone());
        let Some(handler) = handler else {
            self.finalize_failure(
                job_id,
                format!("No handler registered for job type '{job_type}'"),
            );
            return;
        };

        let timeout_ms = self
            .jobs
            .get(&job_id)
            .map(|j| j.options.timeout_ms)
            .unwrap_or(300_000);
        let (cancel_tx, cancel_rx) = watch::channel(CancelState::Running);

        let timeout_sender = cancel_tx.clone();
        let timeout_inner = self.clone();
        let timeout_task = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(timeout_ms)).await;
            if timeout_sender.send(CancelState::TimedOut).is_ok() {
                timeout_inner.timeout_job(job_id);
            }
        });

        self.running.insert(
            job_id,
            RunningHandle {
                cancel_tx,
                timeout_task,
            },
        );

        let Some(job_snapshot) = self.jobs.get(&job_id).map(|j| j.clone()) else {
            return;
        };
        let reporter = ProgressReporter {
            inner: self.clone(),
            job_id,
        };
        let signal = CancelSignal {
            rx: cancel_rx.clone(),
        };

        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let exec_inner = self.clone();
        tokio::spawn(async move {
            exec_inner
                .run_handler(job_id, handler, job_snapshot, reporter, signal, cancel_rx)
                .await;
        });
    }

    async fn run_handler(
        self: Arc<Self>,
        job_id: Uuid,
        handler: Arc<dyn JobHandler>,
        job_snapshot: Job,
        reporter: ProgressReporter,
        signal: CancelSignal,
        mut watch_rx: watch::Receiver<CancelState>,
    ) {
        let mut handler_task =
            tokio::spawn(async move { handler.handle(job_snapshot, reporter, signal).await });

        tokio::select! {
            res = &mut handler_task => {
                self.apply_outcome(job_id, res);
            }
            _ = wait_for_signal(&mut watch_rx) => {
                // Don't block the execution slot on a handler that ignores
                // its signal: reap it in the background and discard its
                // eventual outcome, since the job is already terminal.
                let inner = self.clone();
                tokio::spawn(async move {
                    let res = handler_task.await;
                    inner.apply_outcome(job_id, res);
                });
            }
        }
    }

    fn apply_outcome(
        &self,
        job_id: Uuid,
        res: Result<anyhow::Result<Value>, tokio::task::JoinError>,
    ) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        let Some((_, handle)) = self.running.remove(&job_id) else {
            // Already reaped via cancel() or the timeout path.
            return;
        };
        handle.timeout_task.abort();

        let still_running = self
            .jobs
            .get(&job_id)
            .map(|j| j.status == JobStatus::Running)
            .unwrap_or(false);
        if !still_running {
            return;
        }

        match res {
            Err(join_err) => {
                let message = if join_err.is_panic() {
                    "handler panicked".to_string()
                } else {
                    join_err.to_string()
                };
                self.finalize_failure(job_id, message);
            }
            Ok(Err(err)) => self.handle_handler_error(job_id, err),
            Ok(Ok(value)) => self.finalize_success(job_id, value),
        }
    }

    fn finalize_success(&self, job_id: Uuid, value: Value) {
        let mut job = match self.jobs.get_mut(&job_id) {
            Some(j) => j,
            None => return,
        };
        job.status = JobStatus::Completed;
        job.result = Some(value.clone());
        job.progress = 100;
        job.completed_at = Some(Utc::now());
        let snapshot = job.clone();
        drop(job);
        self.finish_terminal(snapshot, ProgressEvent::Complete { result: Some(value) });
    }

    fn handle_handler_error(&self, job_id: Uuid, err: anyhow::Error) {
        let classifiable = HandlerError(err.to_string());
        let retryable = jobqueue_retry::default_is_retryable(&classifiable);

        let mut job = match self.jobs.get_mut(&job_id) {
            Some(j) => j,
            None => return,
        };

        if job.attempts <= job.options.retries && retryable {
            job.status = JobStatus::Queued;
            job.started_at = None;
            let priority = job.options.priority;
            let snapshot = job.clone();
            drop(job);
            debug!(job_id = %job_id, attempts = snapshot.attempts, "re-queueing after retryable failure");
            self.spawn_persist_job(snapshot);
            self.enqueue_pending(job_id, priority);
        } else {
            job.status = JobStatus::Failed;
            job.error = Some(classifiable.0.clone());
            job.completed_at = Some(Utc::now());
            let snapshot = job.clone();
            drop(job);
            self.finish_terminal(snapshot, ProgressEvent::Error { error: classifiable.0 });
        }
    }

    fn finalize_failure(&self, job_id: Uuid, message: String) {
        let mut job = match self.jobs.get_mut(&job_id) {
            Some(j) => j,
            None => return,
        };
        if job.status.is_terminal() {
            return;
        }
        job.status = JobStatus::Failed;
        job.error = Some(message.clone());
        job.completed_at = Some(Utc::now());
        let snapshot = job.clone();
        drop(job);
        self.finish_terminal(snapshot, ProgressEvent::Error { error: message });
    }

    fn timeout_job(&self, job_id: Uuid) {
        if self.running.remove(&job_id).is_none() {
            return; // Already completed or explicitly cancelled.
        }
        // `in_flight` is decremented only in `apply_outcome`, once the
        // reaper it triggers observes the handler's real completion.
        self.finalize_failure(job_id, "job timed out or was aborted".to_string());
    }

    fn cancel_job(&self, id: Uuid) -> bool {
        if let Some(mut job) = self.jobs.get_mut(&id) {
            if job.status == JobStatus::Queued {
                let mut pending = self.pending.lock().unwrap();
                if let Some(pos) = pending.iter().position(|e| e.job_id == id) {
                    pending.remove(pos);
                }
                drop(pending);
                job.status = JobStatus::Cancelled;
                job.completed_at = Some(Utc::now());
                let snapshot = job.clone();
                drop(job);
                self.finish_terminal(snapshot.clone(), ProgressEvent::Status(snapshot));
                return true;
            }
        } else {
            return false;
        }
        self.transition_running_to_cancelled(id)
    }

    fn transition_running_to_cancelled(&self, id: Uuid) -> bool {
        let Some((_, handle)) = self.running.remove(&id) else {
            return false;
        };
        // `in_flight` is decremented only in `apply_outcome`, once the
        // reaper it triggers observes the handler's real completion.
        handle.timeout_task.abort();
        let _ = handle.cancel_tx.send(CancelState::Cancelled);

        let mut job = match self.jobs.get_mut(&id) {
            Some(j) => j,
            None => return false,
        };
        if job.status.is_terminal() {
            return false;
        }
        job.status = JobStatus::Cancelled;
        job.completed_at = Some(Utc::now());
        let snapshot = job.clone();
        drop(job);
        self.finish_terminal(snapshot.clone(), ProgressEvent::Status(snapshot));
        true
    }

    fn finish_terminal(&self, job: Job, event: ProgressEvent) {
        self.spawn_persist_job(job.clone());
        self.emit_and_maybe_close(job.id, event);
        self.schedule_webhook(&job);
        self.evict_if_needed();
    }

    fn report_progress(&self, job_id: Uuid, percent: i64, message: Option<String>) {
        let clamped = percent.clamp(0, 100) as u8;
        let mut job = match self.jobs.get_mut(&job_id) {
            Some(j) => j,
            None => return,
        };
        if job.status != JobStatus::Running {
            return;
        }
        job.progress = clamped;
        if message.is_some() {
            job.status_message = message.clone();
        }
        drop(job);
        self.spawn_persist(job_id);
        self.emit_and_maybe_close(
            job_id,
            ProgressEvent::Progress {
                percent: clamped,
                message,
            },
        );
    }

    fn emit_and_maybe_close(&self, job_id: Uuid, event: ProgressEvent) {
        if let Some(mut subs) = self.subscribers.get_mut(&job_id) {
            subs.retain(|tx| tx.send(event.clone()).is_ok());
        }
        if event.is_terminal() {
            self.subscribers.remove(&job_id);
        }
    }

    fn schedule_webhook(&self, job: &Job) {
        let Some(url) = job.options.webhook_url.clone() else {
            return;
        };
        let client = self.webhook_client.clone();
        let validator = self.url_validator.clone();
        let payload = WebhookPayload::from_job(job);
        let timeout_ms = self.config.webhook_timeout_ms;
        tokio::spawn(async move {
            deliver_webhook(client, validator.as_ref(), &url, &payload, timeout_ms).await;
        });
    }

    fn evict_if_needed(&self) {
        let max = self.config.max_completed_jobs;
        let mut terminal: Vec<(Uuid, chrono::DateTime<Utc>)> = self
            .jobs
            .iter()
            .filter(|e| e.value().status.is_terminal())
            .map(|e| {
                let j = e.value();
                (j.id, j.completed_at.unwrap_or(j.created_at))
            })
            .collect();
        if terminal.len() <= max {
            return;
        }
        terminal.sort_by_key(|(_, ts)| *ts);
        let excess = terminal.len() - max;
        for (id, _) in terminal.into_iter().take(excess) {
            self.jobs.remove(&id);
        }
    }

    fn spawn_persist(&self, job_id: Uuid) {
        if let Some(job) = self.jobs.get(&job_id) {
            self.spawn_persist_job(job.clone());
        }
    }

    fn spawn_persist_job(&self, job: Job) {
        let store = self.store.clone();
        let job_id = job.id;
        tokio::spawn(async move {
            if let Err(err) = store.set(&job).await {
                warn!(job_id = %job_id, error = %err, "failed to persist job");
            }
        });
    }

    fn enqueue_pending(&self, job_id: Uuid, priority: u8) {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        let mut pending = self.pending.lock().unwrap();
        insert_pending(&mut pending, PendingEntry { job_id, priority, seq });
    }
}

/// A job queue: typed intake over a bounded worker pool, backed by a
/// pluggable [`JobStore`].
#[derive(Clone)]
pub struct JobQueue(Arc<Inner>);

impl JobQueue {
    pub fn new(config: QueueConfig, store: Arc<dyn JobStore>) -> Self {
        Self::with_validator(config, store, Arc::new(AllowAllValidator))
    }

    pub fn with_validator(
        config: QueueConfig,
        store: Arc<dyn JobStore>,
        url_validator: Arc<dyn WebhookUrlValidator>,
    ) -> Self {
        Self(Arc::new(Inner {
            config,
            store,
            handlers: DashMap::new(),
            jobs: DashMap::new(),
            pending: StdMutex::new(Vec::new()),
            running: DashMap::new(),
            subscribers: DashMap::new(),
            seq: AtomicU64::new(0),
            started: std::sync::atomic::AtomicBool::new(false),
            tick_task: StdMutex::new(None),
            in_flight: AtomicUsize::new(0),
            webhook_client: reqwest::Client::builder()
                .user_agent(concat!("jobqueue-core/", env!("CARGO_PKG_VERSION")))
                .build()
                .expect("default reqwest client configuration is always valid"),
            url_validator,
        }))
    }

    pub fn register_handler(&self, job_type: JobType, handler: Arc<dyn JobHandler>) {
        self.0.handlers.insert(job_type, handler);
    }

    pub fn enqueue(
        &self,
        job_type: JobType,
        payload: Value,
        options: JobOptions,
    ) -> Result<Uuid, QueueError> {
        options.validate()?;
        let job = Job::new(job_type, payload, options.clone());
        let id = job.id;
        self.0.jobs.insert(id, job.clone());
        self.0.enqueue_pending(id, options.priority);
        self.0.spawn_persist_job(job);
        Ok(id)
    }

    /// Idempotent: a second call while already started is a no-op.
    pub fn start(&self) {
        if self.0.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let inner = self.0.clone();
        let handle = tokio::spawn(async move { inner.run_tick_loop().await });
        *self.0.tick_task.lock().unwrap() = Some(handle);
    }

    /// Halts tick cadence and cancels every in-flight execution. Safe to
    /// call before `start`, or more than once.
    pub fn stop(&self) {
        if let Some(handle) = self.0.tick_task.lock().unwrap().take() {
            handle.abort();
        }
        self.0.started.store(false, Ordering::SeqCst);
        let running_ids: Vec<Uuid> = self.0.running.iter().map(|e| *e.key()).collect();
        for id in running_ids {
            self.0.transition_running_to_cancelled(id);
        }
    }

    /// Like `stop`, but waits (bounded by `grace`) for handlers that are
    /// already running to actually return, rather than abandoning them
    /// immediately.
    pub async fn stop_and_wait(&self, grace: Duration) {
        self.stop();
        let deadline = tokio::time::Instant::now() + grace;
        while self.0.in_flight.load(Ordering::SeqCst) > 0 && tokio::time::Instant::now() < deadline
        {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    pub fn cancel(&self, id: Uuid) -> bool {
        self.0.cancel_job(id)
    }

    pub async fn get_job(&self, id: Uuid) -> Option<Job> {
        if let Some(job) = self.0.jobs.get(&id) {
            return Some(job.clone());
        }
        match self.0.store.get(id).await {
            Ok(found) => found,
            Err(err) => {
                warn!(job_id = %id, error = %err, "store lookup failed");
                None
            }
        }
    }

    pub async fn list_jobs(&self, filter: ListFilter) -> Vec<Job> {
        let mut merged: std::collections::HashMap<Uuid, Job> = std::collections::HashMap::new();
        match self.0.store.list(&filter).await {
            Ok(stored) => {
                for job in stored {
                    merged.insert(job.id, job);
                }
            }
            Err(err) => warn!(error = %err, "store list failed"),
        }
        for entry in self.0.jobs.iter() {
            if filter.matches(entry.value()) {
                merged.insert(*entry.key(), entry.value().clone());
            }
        }
        let mut all: Vec<Job> = merged.into_values().collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let offset = filter.offset.unwrap_or(0);
        let iter = all.into_iter().skip(offset);
        match filter.limit {
            Some(limit) => iter.take(limit).collect(),
            None => iter.collect(),
        }
    }

    pub fn stream_progress(&self, id: Uuid) -> ProgressStream {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(job) = self.0.jobs.get(&id) {
            let snapshot = job.clone();
            drop(job);
            let terminal = snapshot.status.is_terminal();
            let _ = tx.send(ProgressEvent::Status(snapshot));
            if !terminal {
                self.0.subscribers.entry(id).or_default().push(tx);
            }
        }
        ProgressStream::new(rx)
    }

    pub fn stats(&self) -> Stats {
        let queued = self
            .0
            .jobs
            .iter()
            .filter(|e| e.value().status == JobStatus::Queued)
            .count();
        Stats {
            queued,
            running: self.0.running.len(),
            total: self.0.jobs.len(),
            handlers: self.0.handlers.iter().map(|e| e.key().as_str()).collect(),
        }
    }

    /// Maintenance hook an embedder can run on a schedule; passes through to
    /// the store's own `cleanup`.
    pub async fn cleanup(&self, max_age_ms: i64) -> Result<usize, QueueError> {
        self.0.store.cleanup(max_age_ms).await.map_err(QueueError::Store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::VolatileStore;
    use crate::webhook::SsrfBlocked;
    use serde_json::json;
    use std::sync::atomic::AtomicU32;
    use std::sync::Mutex as StdMutex2;

    fn test_config() -> QueueConfig {
        QueueConfig {
            tick_interval_ms: 5,
            ..QueueConfig::default()
        }
    }

    struct OrderRecorder {
        order: Arc<StdMutex2<Vec<Uuid>>>,
    }

    #[async_trait]
    impl JobHandler for OrderRecorder {
        async fn handle(
            &self,
            job: Job,
            _progress: ProgressReporter,
            _cancel: CancelSignal,
        ) -> anyhow::Result<Value> {
            self.order.lock().unwrap().push(job.id);
            Ok(json!(null))
        }
    }

    #[tokio::test]
    async fn priority_order_dispatches_highest_first() {
        let mut config = test_config();
        config.concurrency = 1;
        let queue = JobQueue::new(config, Arc::new(VolatileStore::new()));
        let order = Arc::new(StdMutex2::new(Vec::new()));
        queue.register_handler(
            JobType::Fetch,
            Arc::new(OrderRecorder { order: order.clone() }),
        );

        let low = queue
            .enqueue(JobType::Fetch, json!({}), JobOptions { priority: 1, ..Default::default() })
            .unwrap();
        let high = queue
            .enqueue(JobType::Fetch, json!({}), JobOptions { priority: 9, ..Default::default() })
            .unwrap();
        let mid = queue
            .enqueue(JobType::Fetch, json!({}), JobOptions { priority: 5, ..Default::default() })
            .unwrap();

        for _ in 0..3 {
            queue.0.tick();
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        assert_eq!(*order.lock().unwrap(), vec![high, mid, low]);
    }

    struct FlakyOnceHandler {
        calls: Arc<AtomicU32>,
    }

    #[async_trait]
    impl JobHandler for FlakyOnceHandler {
        async fn handle(
            &self,
            _job: Job,
            _progress: ProgressReporter,
            _cancel: CancelSignal,
        ) -> anyhow::Result<Value> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                anyhow::bail!("ECONNRESET while fetching");
            }
            Ok(json!({ "ok": true }))
        }
    }

    #[tokio::test]
    async fn retry_then_succeed() {
        let queue = JobQueue::new(test_config(), Arc::new(VolatileStore::new()));
        let calls = Arc::new(AtomicU32::new(0));
        queue.register_handler(JobType::Fetch, Arc::new(FlakyOnceHandler { calls }));

        let id = queue
            .enqueue(
                JobType::Fetch,
                json!({}),
                JobOptions { retries: 1, ..Default::default() },
            )
            .unwrap();
        queue.start();

        let job = poll_until_terminal(&queue, id).await;
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.attempts, 2);
        queue.stop();
    }

    struct CancellableHandler;

    #[async_trait]
    impl JobHandler for CancellableHandler {
        async fn handle(
            &self,
            _job: Job,
            _progress: ProgressReporter,
            cancel: CancelSignal,
        ) -> anyhow::Result<Value> {
            cancel.cancelled().await;
            anyhow::bail!("observed cancellation");
        }
    }

    #[tokio::test]
    async fn cancel_running_job() {
        let queue = JobQueue::new(test_config(), Arc::new(VolatileStore::new()));
        queue.register_handler(JobType::Fetch, Arc::new(CancellableHandler));

        let id = queue
            .enqueue(JobType::Fetch, json!({}), JobOptions::default())
            .unwrap();
        queue.start();

        poll_until(&queue, id, |job| job.status == JobStatus::Running).await;
        assert!(queue.cancel(id));

        let job = poll_until_terminal(&queue, id).await;
        assert_eq!(job.status, JobStatus::Cancelled);
        queue.stop();
    }

    struct ImmediateSuccessHandler;

    #[async_trait]
    impl JobHandler for ImmediateSuccessHandler {
        async fn handle(
            &self,
            _job: Job,
            _progress: ProgressReporter,
            _cancel: CancelSignal,
        ) -> anyhow::Result<Value> {
            Ok(json!({ "done": true }))
        }
    }

    #[tokio::test]
    async fn eviction_bounds_completed_jobs() {
        let mut config = test_config();
        config.concurrency = 10;
        config.max_completed_jobs = 100;
        let queue = JobQueue::new(config, Arc::new(VolatileStore::new()));
        queue.register_handler(JobType::Fetch, Arc::new(ImmediateSuccessHandler));
        queue.start();

        for _ in 0..105 {
            queue
                .enqueue(JobType::Fetch, json!({}), JobOptions::default())
                .unwrap();
        }

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while queue.stats().total > 100 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        // Also wait for the queue to drain so the count below is stable.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while queue.stats().queued > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        assert!(queue.stats().total <= 100, "total = {}", queue.stats().total);
        queue.stop();
    }

    struct BlockingValidator {
        blocked: Arc<StdMutex2<Vec<String>>>,
    }

    impl WebhookUrlValidator for BlockingValidator {
        fn validate(&self, url: &str) -> Result<(), SsrfBlocked> {
            self.blocked.lock().unwrap().push(url.to_string());
            Err(SsrfBlocked(url.to_string()))
        }
    }

    #[tokio::test]
    async fn webhook_delivery_is_blocked_by_validator() {
        let blocked = Arc::new(StdMutex2::new(Vec::new()));
        let queue = JobQueue::with_validator(
            test_config(),
            Arc::new(VolatileStore::new()),
            Arc::new(BlockingValidator { blocked: blocked.clone() }),
        );
        queue.register_handler(JobType::Fetch, Arc::new(ImmediateSuccessHandler));
        queue.start();

        queue
            .enqueue(
                JobType::Fetch,
                json!({}),
                JobOptions {
                    webhook_url: Some("http://169.254.169.254/".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while blocked.lock().unwrap().is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(blocked.lock().unwrap().as_slice(), ["http://169.254.169.254/"]);
        queue.stop();
    }

    #[tokio::test]
    async fn enqueue_rejects_out_of_range_priority() {
        let queue = JobQueue::new(test_config(), Arc::new(VolatileStore::new()));
        let result = queue.enqueue(
            JobType::Fetch,
            json!({}),
            JobOptions { priority: 11, ..Default::default() },
        );
        assert!(matches!(result, Err(QueueError::InvalidPriority(11))));
    }

    async fn poll_until_terminal(queue: &JobQueue, id: Uuid) -> Job {
        poll_until(queue, id, |job| job.status.is_terminal()).await
    }

    async fn poll_until(queue: &JobQueue, id: Uuid, pred: impl Fn(&Job) -> bool) -> Job {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(job) = queue.get_job(id).await {
                if pred(&job) {
                    return job;
                }
            }
            if tokio::time::Instant::now() >= deadline {
                panic!("timed out waiting for job {id} to satisfy predicate");
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

//! The job record and the types that describe it.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::QueueError;

/// The closed set of job types this queue dispatches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobType {
    Fetch,
    Crawl,
    Extract,
    Workflow,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Fetch => "fetch",
            JobType::Crawl => "crawl",
            JobType::Extract => "extract",
            JobType::Workflow => "workflow",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a job. See the state machine in the queue module for
/// the legal transitions between these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Terminal statuses never transition further.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

fn default_priority() -> u8 {
    5
}

fn default_timeout_ms() -> u64 {
    300_000
}

/// Per-job submission options. All fields optional at the call site; these
/// defaults match the base contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobOptions {
    /// 1 (lowest) through 10 (highest). Default 5.
    #[serde(default = "default_priority")]
    pub priority: u8,
    /// Additional attempts allowed after the first, on a retryable failure.
    #[serde(default)]
    pub retries: u32,
    /// Wall-clock bound on a single execution attempt.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Delivered once the job reaches a terminal state, if set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
    /// Opaque, caller-defined. Echoed back in the job record and webhook body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Map<String, serde_json::Value>>,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            priority: default_priority(),
            retries: 0,
            timeout_ms: default_timeout_ms(),
            webhook_url: None,
            metadata: None,
        }
    }
}

impl JobOptions {
    pub(crate) fn validate(&self) -> Result<(), QueueError> {
        if !(1..=10).contains(&self.priority) {
            return Err(QueueError::InvalidPriority(self.priority));
        }
        Ok(())
    }
}

/// A job's full durable state. This is the unit persisted to the store and
/// handed to subscribers. Field names follow the camelCase wire format the
/// Durable backend's JSON payload is documented against.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub status: JobStatus,
    pub payload: serde_json::Value,
    pub options: JobOptions,
    /// 0..=100, monotonically non-decreasing while running.
    pub progress: u8,
    pub status_message: Option<String>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Number of execution attempts made so far, including the current one.
    pub attempts: u32,
}

impl Job {
    pub(crate) fn new(job_type: JobType, payload: serde_json::Value, options: JobOptions) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_type,
            status: JobStatus::Queued,
            payload,
            options,
            progress: 0,
            status_message: None,
            result: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            attempts: 0,
        }
    }
}

/// Filter applied by `list_jobs` and by a store's own `list`/`count`.
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub status: Option<JobStatus>,
    pub job_type: Option<JobType>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl ListFilter {
    pub fn matches(&self, job: &Job) -> bool {
        if let Some(status) = self.status {
            if job.status != status {
                return false;
            }
        }
        if let Some(job_type) = self.job_type {
            if job.job_type != job_type {
                return false;
            }
        }
        true
    }
}

//! Webhook delivery: SSRF validation at the boundary, at-most-twice POST.

use std::time::Duration;

use serde::Serialize;
use tracing::warn;
use uuid::Uuid;

use crate::model::{Job, JobStatus};

/// Raised by a [`WebhookUrlValidator`] when a URL must not be dialed.
#[derive(Debug, Clone)]
pub struct SsrfBlocked(pub String);

impl std::fmt::Display for SsrfBlocked {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "webhook url blocked: {}", self.0)
    }
}

impl std::error::Error for SsrfBlocked {}

/// Narrow boundary to the actual SSRF/URL-safety logic, which lives outside
/// this crate. The default `AllowAllValidator` performs no validation at
/// all, matching the stance that real deployments must supply their own.
pub trait WebhookUrlValidator: Send + Sync {
    fn validate(&self, url: &str) -> Result<(), SsrfBlocked>;
}

/// Permits every URL. Only appropriate for tests and demos that don't go
/// near an untrusted network.
pub struct AllowAllValidator;

impl WebhookUrlValidator for AllowAllValidator {
    fn validate(&self, _url: &str) -> Result<(), SsrfBlocked> {
        Ok(())
    }
}

#[derive(Debug, Serialize)]
pub struct WebhookPayload {
    #[serde(rename = "jobId")]
    pub job_id: Uuid,
    #[serde(rename = "type")]
    pub job_type: String,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Map<String, serde_json::Value>>,
}

impl WebhookPayload {
    pub fn from_job(job: &Job) -> Self {
        let duration = match (job.started_at, job.completed_at) {
            (Some(started), Some(completed)) => {
                (completed - started).num_milliseconds().max(0)
            }
            _ => 0,
        };
        Self {
            job_id: job.id,
            job_type: job.job_type.as_str().to_string(),
            status: job.status,
            result: job.result.clone(),
            error: job.error.clone(),
            duration,
            metadata: job.options.metadata.clone(),
        }
    }
}

const RETRY_DELAY: Duration = Duration::from_secs(1);

/// Deliver one terminal-job webhook. At most two POST attempts, with a fixed
/// 1 second delay between them; failures past that are logged and abandoned,
/// never surfaced to the caller.
pub async fn deliver_webhook(
    client: reqwest::Client,
    validator: &dyn WebhookUrlValidator,
    url: &str,
    payload: &WebhookPayload,
    timeout_ms: u64,
) {
    if let Err(blocked) = validator.validate(url) {
        warn!(url, job_id = %payload.job_id, %blocked, "webhook delivery abandoned: url blocked");
        return;
    }

    let timeout = Duration::from_millis(timeout_ms);
    if try_deliver(&client, url, payload, timeout).await {
        return;
    }

    tokio::time::sleep(RETRY_DELAY).await;
    if !try_deliver(&client, url, payload, timeout).await {
        warn!(url, job_id = %payload.job_id, "webhook delivery abandoned after retry");
    }
}

async fn try_deliver(
    client: &reqwest::Client,
    url: &str,
    payload: &WebhookPayload,
    timeout: Duration,
) -> bool {
    match client.post(url).timeout(timeout).json(payload).send().await {
        Ok(resp) if resp.status().is_success() => true,
        Ok(resp) => {
            warn!(url, status = %resp.status(), "webhook endpoint returned non-success status");
            false
        }
        Err(err) => {
            warn!(url, error = %err, "webhook delivery attempt failed");
            false
        }
    }
}

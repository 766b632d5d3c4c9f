//! Configuration carried into a queue at construction time.
//!
//! This is a plain data carrier, not a loader: the embedding application is
//! responsible for populating it from env, file, or flags and handing it to
//! [`crate::queue::JobQueue::new`] (or to `jobqueue_redis::create_job_store`
//! for the store half). No `Figment`/`config`-crate style layered loading
//! lives in this crate.

use serde::{Deserialize, Serialize};

fn default_concurrency() -> usize {
    4
}

fn default_completed_ttl_seconds() -> i64 {
    86_400
}

fn default_max_completed_jobs() -> usize {
    100
}

fn default_tick_interval_ms() -> u64 {
    100
}

fn default_webhook_timeout_ms() -> u64 {
    10_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default)]
    pub redis_enabled: bool,
    #[serde(default)]
    pub redis_url: String,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_completed_ttl_seconds")]
    pub completed_ttl_seconds: i64,
    #[serde(default = "default_max_completed_jobs")]
    pub max_completed_jobs: usize,
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    #[serde(default = "default_webhook_timeout_ms")]
    pub webhook_timeout_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            redis_enabled: false,
            redis_url: String::new(),
            concurrency: default_concurrency(),
            completed_ttl_seconds: default_completed_ttl_seconds(),
            max_completed_jobs: default_max_completed_jobs(),
            tick_interval_ms: default_tick_interval_ms(),
            webhook_timeout_ms: default_webhook_timeout_ms(),
        }
    }
}

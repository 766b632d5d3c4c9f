//! Durable (Redis-backed) `JobStore`, and the store factory.
//!
//! Grounded on the claim/mark/cleanup shape of `PgJobStore` in
//! `seesaw-job-postgres`, rendered against Redis instead of Postgres because
//! the base contract specifies a Redis key layout directly. The pool +
//! command style (`deadpool_redis::Pool` + `redis::AsyncCommands`) follows
//! the job-queue reference in the wider retrieval pack rather than the
//! teacher, which has no Redis dependency of its own.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobqueue_core::{Job, JobStatus, JobStore, ListFilter, QueueConfig, VolatileStore};
use redis::AsyncCommands;
use tracing::warn;
use uuid::Uuid;

const BY_CREATED_KEY: &str = "anno:jobs:by_created";

fn job_key(id: Uuid) -> String {
    format!("anno:job:{id}")
}

fn status_key(status: JobStatus) -> String {
    format!("anno:jobs:status:{status}")
}

/// Redis-backed `JobStore`. Key layout is fixed by the base contract:
///
/// - `anno:job:{id}` — the JSON-serialized record, TTL'd.
/// - `anno:jobs:by_created` — sorted set, score = `created_at` epoch millis.
/// - `anno:jobs:status:{status}` — set of ids currently in that status.
pub struct RedisStore {
    pool: deadpool_redis::Pool,
    default_ttl_seconds: i64,
}

impl RedisStore {
    pub fn new(pool: deadpool_redis::Pool, default_ttl_seconds: i64) -> Self {
        Self {
            pool,
            default_ttl_seconds,
        }
    }

    async fn fetch(&self, conn: &mut deadpool_redis::Connection, id: Uuid) -> anyhow::Result<Option<Job>> {
        let raw: Option<String> = conn.get(job_key(id)).await?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl JobStore for RedisStore {
    async fn get(&self, id: Uuid) -> anyhow::Result<Option<Job>> {
        let mut conn = self.pool.get().await?;
        self.fetch(&mut conn, id).await
    }

    async fn set(&self, job: &Job) -> anyhow::Result<()> {
        let mut conn = self.pool.get().await?;
        let key = job_key(job.id);

        // Keep the status index consistent: if a prior record exists under
        // a different status, drop it from that status's set first.
        if let Some(previous) = self.fetch(&mut conn, job.id).await? {
            if previous.status != job.status {
                let _: i64 = conn.srem(status_key(previous.status), job.id.to_string()).await?;
            }
        }

        let payload = serde_json::to_string(job)?;
        if job.status.is_terminal() {
            let ttl = self.default_ttl_seconds.max(1) as u64;
            let _: () = conn.set_ex(&key, payload, ttl).await?;
        } else {
            // Non-terminal records carry no TTL; a plain `SET` also clears
            // any expiry left over from a prior write to this key.
            let _: () = conn.set(&key, payload).await?;
        }
        let _: i64 = conn
            .zadd(BY_CREATED_KEY, job.id.to_string(), job.created_at.timestamp_millis())
            .await?;
        let _: i64 = conn.sadd(status_key(job.status), job.id.to_string()).await?;
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> anyhow::Result<bool> {
        let mut conn = self.pool.get().await?;
        let existing = self.fetch(&mut conn, id).await?;
        let Some(existing) = existing else {
            return Ok(false);
        };
        let _: i64 = conn.del(job_key(id)).await?;
        let _: i64 = conn.zrem(BY_CREATED_KEY, id.to_string()).await?;
        let _: i64 = conn.srem(status_key(existing.status), id.to_string()).await?;
        Ok(true)
    }

    async fn list(&self, filter: &ListFilter) -> anyhow::Result<Vec<Job>> {
        let mut conn = self.pool.get().await?;

        let ids: Vec<String> = if let Some(status) = filter.status {
            conn.smembers(status_key(status)).await?
        } else {
            conn.zrevrange(BY_CREATED_KEY, 0, -1).await?
        };

        let mut jobs = Vec::with_capacity(ids.len());
        for raw_id in ids {
            let Ok(id) = raw_id.parse::<Uuid>() else {
                continue;
            };
            if let Some(job) = self.fetch(&mut conn, id).await? {
                if filter.matches(&job) {
                    jobs.push(job);
                }
            }
        }

        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let offset = filter.offset.unwrap_or(0);
        let iter = jobs.into_iter().skip(offset);
        Ok(match filter.limit {
            Some(limit) => iter.take(limit).collect(),
            None => iter.collect(),
        })
    }

    async fn count(&self, filter: &ListFilter) -> anyhow::Result<usize> {
        // Fast path: a pure status filter can be answered with SCARD alone.
        if filter.job_type.is_none() {
            if let Some(status) = filter.status {
                let mut conn = self.pool.get().await?;
                let count: i64 = conn.scard(status_key(status)).await?;
                return Ok(count.max(0) as usize);
            }
        }
        Ok(self.list(filter).await?.len())
    }

    async fn cleanup(&self, max_age_ms: i64) -> anyhow::Result<usize> {
        let mut conn = self.pool.get().await?;
        let cutoff: DateTime<Utc> = Utc::now() - chrono::Duration::milliseconds(max_age_ms);
        // `by_created` is the only durable time index the key layout
        // defines, so cleanup windows on creation time, not completion time.
        let stale_ids: Vec<String> = conn
            .zrangebyscore(BY_CREATED_KEY, "-inf", cutoff.timestamp_millis())
            .await?;

        let mut removed = 0usize;
        for raw_id in stale_ids {
            let Ok(id) = raw_id.parse::<Uuid>() else {
                continue;
            };
            let Some(job) = self.fetch(&mut conn, id).await? else {
                continue;
            };
            if !job.status.is_terminal() {
                continue;
            }
            let _: i64 = conn.del(job_key(id)).await?;
            let _: i64 = conn.zrem(BY_CREATED_KEY, id.to_string()).await?;
            let _: i64 = conn.srem(status_key(job.status), id.to_string()).await?;
            removed += 1;
        }
        Ok(removed)
    }
}

/// Build the configured store. When `redis_enabled` is set, probes
/// liveness with a `PING`; any failure to connect is logged and the
/// in-memory store is used instead. This never fails outright — a
/// misconfigured or unreachable Redis must not prevent the queue from
/// starting.
pub async fn create_job_store(config: &QueueConfig) -> std::sync::Arc<dyn JobStore> {
    if !config.redis_enabled {
        return std::sync::Arc::new(VolatileStore::new());
    }
    match build_redis_store(config).await {
        Ok(store) => std::sync::Arc::new(store),
        Err(err) => {
            warn!(error = %err, "redis unavailable at startup, falling back to in-memory store");
            std::sync::Arc::new(VolatileStore::new())
        }
    }
}

async fn build_redis_store(config: &QueueConfig) -> anyhow::Result<RedisStore> {
    let pool_config = deadpool_redis::Config::from_url(config.redis_url.clone());
    let pool = pool_config.create_pool(Some(deadpool_redis::Runtime::Tokio1))?;
    let mut conn = pool.get().await?;
    let _: String = redis::cmd("PING").query_async(&mut conn).await?;
    Ok(RedisStore::new(pool, config.completed_ttl_seconds))
}

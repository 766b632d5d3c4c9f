//! The `JobStore` trait and the in-memory (Volatile) backend.
//!
//! The Durable backend (Redis-backed) lives in `jobqueue-redis`, which
//! depends on this crate for the trait. Keeping the trait here and the
//! concrete Redis implementation in a leaf crate mirrors
//! `seesaw-job-postgres` depending on `seesaw` for `JobStore`, rather than
//! the other way round.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use uuid::Uuid;

use crate::model::{Job, ListFilter};

/// Durable or volatile record storage. Implementations must not panic;
/// transient failures are reported as `Err` and treated as non-fatal by
/// every caller in this crate.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn get(&self, id: Uuid) -> anyhow::Result<Option<Job>>;
    async fn set(&self, job: &Job) -> anyhow::Result<()>;
    async fn delete(&self, id: Uuid) -> anyhow::Result<bool>;
    async fn list(&self, filter: &ListFilter) -> anyhow::Result<Vec<Job>>;
    async fn count(&self, filter: &ListFilter) -> anyhow::Result<usize>;
    /// Remove terminal records whose completion predates `max_age_ms`.
    /// Returns the number of records removed.
    async fn cleanup(&self, max_age_ms: i64) -> anyhow::Result<usize>;
}

/// In-memory `JobStore`. The default backend, and the fallback target when
/// the Durable backend is unreachable at startup.
#[derive(Default)]
pub struct VolatileStore {
    jobs: DashMap<Uuid, Job>,
}

impl VolatileStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for VolatileStore {
    async fn get(&self, id: Uuid) -> anyhow::Result<Option<Job>> {
        Ok(self.jobs.get(&id).map(|entry| entry.clone()))
    }

    async fn set(&self, job: &Job) -> anyhow::Result<()> {
        self.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> anyhow::Result<bool> {
        Ok(self.jobs.remove(&id).is_some())
    }

    async fn list(&self, filter: &ListFilter) -> anyhow::Result<Vec<Job>> {
        let mut matching: Vec<Job> = self
            .jobs
            .iter()
            .filter(|entry| filter.matches(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let offset = filter.offset.unwrap_or(0);
        let matching = matching.into_iter().skip(offset);
        Ok(match filter.limit {
            Some(limit) => matching.take(limit).collect(),
            None => matching.collect(),
        })
    }

    async fn count(&self, filter: &ListFilter) -> anyhow::Result<usize> {
        Ok(self
            .jobs
            .iter()
            .filter(|entry| filter.matches(entry.value()))
            .count())
    }

    async fn cleanup(&self, max_age_ms: i64) -> anyhow::Result<usize> {
        let cutoff = Utc::now() - chrono::Duration::milliseconds(max_age_ms);
        let stale: Vec<Uuid> = self
            .jobs
            .iter()
            .filter(|entry| {
                let job = entry.value();
                job.status.is_terminal()
                    && job.completed_at.unwrap_or(job.created_at) < cutoff
            })
            .map(|entry| *entry.key())
            .collect();
        for id in &stale {
            self.jobs.remove(id);
        }
        Ok(stale.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{JobOptions, JobStatus, JobType};

    fn sample(status: JobStatus) -> Job {
        let mut job = Job::new(JobType::Fetch, serde_json::json!({}), JobOptions::default());
        job.status = status;
        if status.is_terminal() {
            job.completed_at = Some(Utc::now());
        }
        job
    }

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let store = VolatileStore::new();
        let job = sample(JobStatus::Queued);
        store.set(&job).await.unwrap();
        let fetched = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(fetched.id, job.id);
    }

    #[tokio::test]
    async fn list_filters_by_status_and_sorts_newest_first() {
        let store = VolatileStore::new();
        let older = sample(JobStatus::Queued);
        store.set(&older).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        let newer = sample(JobStatus::Queued);
        store.set(&newer).await.unwrap();
        let done = sample(JobStatus::Completed);
        store.set(&done).await.unwrap();

        let filter = ListFilter {
            status: Some(JobStatus::Queued),
            ..Default::default()
        };
        let listed = store.list(&filter).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, newer.id);
        assert_eq!(listed[1].id, older.id);
    }

    #[tokio::test]
    async fn cleanup_removes_only_old_terminal_records() {
        let store = VolatileStore::new();
        let mut old_done = sample(JobStatus::Completed);
        old_done.completed_at = Some(Utc::now() - chrono::Duration::days(2));
        store.set(&old_done).await.unwrap();
        let fresh_done = sample(JobStatus::Completed);
        store.set(&fresh_done).await.unwrap();
        let running = sample(JobStatus::Running);
        store.set(&running).await.unwrap();

        let removed = store
            .cleanup(chrono::Duration::days(1).num_milliseconds())
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(store.get(old_done.id).await.unwrap().is_none());
        assert!(store.get(fresh_done.id).await.unwrap().is_some());
        assert!(store.get(running.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn delete_reports_whether_a_record_existed() {
        let store = VolatileStore::new();
        let job = sample(JobStatus::Queued);
        assert!(!store.delete(job.id).await.unwrap());
        store.set(&job).await.unwrap();
        assert!(store.delete(job.id).await.unwrap());
    }
}

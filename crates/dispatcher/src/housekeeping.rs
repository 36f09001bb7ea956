//! Periodic re-scan, retention purge and the submission hook.

use std::sync::Arc;

use chrono::{Duration, Utc};
use uuid::Uuid;

use relay_common::error::AppError;

use crate::queue::TaskQueue;
use crate::store::JobStore;

pub struct Housekeeper {
    jobs: Arc<dyn JobStore>,
    queue: Arc<dyn TaskQueue>,
    sweep_window: Duration,
    retention: Duration,
}

impl Housekeeper {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        queue: Arc<dyn TaskQueue>,
        sweep_window_hours: i64,
        retention_days: i64,
    ) -> Self {
        Self {
            jobs,
            queue,
            sweep_window: Duration::hours(sweep_window_hours),
            retention: Duration::days(retention_days),
        }
    }

    /// Called by the host once the submission of `job_id` has committed.
    pub async fn on_submitted(&self, job_id: Uuid) -> Result<(), AppError> {
        self.queue.enqueue(job_id).await
    }

    /// Enqueue a dispatch for every submitted `New` job inside the sweep window.
    ///
    /// `Partial` jobs are not picked up again. Returns the number of tasks enqueued.
    pub async fn sweep(&self) -> Result<usize, AppError> {
        let since = Utc::now() - self.sweep_window;
        let ids = self.jobs.list_dispatchable(since).await?;

        for id in &ids {
            self.queue.enqueue(*id).await?;
        }

        tracing::info!(enqueued = ids.len(), since = %since, "Sweep enqueued pending jobs");
        Ok(ids.len())
    }

    /// Delete jobs older than the retention window. Returns the number of jobs deleted.
    pub async fn purge(&self) -> Result<u64, AppError> {
        let cutoff = Utc::now() - self.retention;
        self.jobs.purge_created_before(cutoff).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_common::types::{DocStatus, DocumentType, JobStatus, NotificationJob};

    use crate::mock::{MockJobStore, MockTaskQueue};

    fn job(status: JobStatus, doc_status: DocStatus, age: Duration) -> NotificationJob {
        let mut job = NotificationJob::new(
            "demo",
            DocumentType::TicketsTicket,
            "TCK-1",
            vec!["alice".to_string()],
        );
        job.status = status;
        job.doc_status = doc_status;
        job.created_at = Utc::now() - age;
        job
    }

    fn housekeeper(jobs: &MockJobStore, queue: &MockTaskQueue) -> Housekeeper {
        Housekeeper::new(Arc::new(jobs.clone()), Arc::new(queue.clone()), 24, 100)
    }

    #[tokio::test]
    async fn test_sweep_enqueues_only_recent_submitted_new_jobs() {
        let jobs = MockJobStore::new();
        let queue = MockTaskQueue::new();

        let eligible = job(JobStatus::New, DocStatus::Submitted, Duration::hours(2));
        jobs.insert(eligible.clone());
        jobs.insert(job(JobStatus::Partial, DocStatus::Submitted, Duration::hours(2)));
        jobs.insert(job(JobStatus::New, DocStatus::Draft, Duration::hours(2)));
        jobs.insert(job(JobStatus::New, DocStatus::Submitted, Duration::hours(30)));

        let enqueued = housekeeper(&jobs, &queue).sweep().await.unwrap();

        assert_eq!(enqueued, 1);
        assert_eq!(queue.tasks(), vec![eligible.id]);
    }

    #[tokio::test]
    async fn test_purge_deletes_jobs_past_retention() {
        let jobs = MockJobStore::new();
        let queue = MockTaskQueue::new();

        let kept = job(JobStatus::Finished, DocStatus::Submitted, Duration::days(99));
        let aged = job(JobStatus::Finished, DocStatus::Submitted, Duration::days(101));
        jobs.insert(kept.clone());
        jobs.insert(aged.clone());

        let deleted = housekeeper(&jobs, &queue).purge().await.unwrap();

        assert_eq!(deleted, 1);
        assert!(jobs.get(kept.id).is_some());
        assert!(jobs.get(aged.id).is_none());
    }

    #[tokio::test]
    async fn test_on_submitted_enqueues_dispatch() {
        let jobs = MockJobStore::new();
        let queue = MockTaskQueue::new();
        let id = Uuid::new_v4();

        housekeeper(&jobs, &queue).on_submitted(id).await.unwrap();

        assert_eq!(queue.tasks(), vec![id]);
    }
}

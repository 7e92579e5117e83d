//! `JobStore` — persistence seam for [`Job`](super::job::Job) rows.
//!
//! Distinct from the Queue Facade (§4.8): the store owns the row itself
//! (reads, the atomic pending -> running transition, settlement writes);
//! the queue owns the three message channels (incoming / delayed-retry /
//! dead-letter) that tell a dispatcher *when* to look at a row. Grounded
//! on the teacher's `PostgresJobStore`, narrowed to this spec's richer
//! `Job` (usage, cost, transcript) instead of the teacher's generic
//! command payload, and without the `CommandRegistry`/`AnyCommand`
//! machinery — every job here runs through the same Agent Loop, so there
//! is no per-job-type deserialization step to register.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::job::{Job, JobStatus};

#[derive(Debug, thiserror::Error)]
pub enum JobStoreError {
    #[error("job {0} not found")]
    NotFound(Uuid),
    #[error("job {0} was not in the expected status for this transition")]
    StatusConflict(Uuid),
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

/// Persistence seam for job rows. A concrete implementation (e.g.
/// `sqlx`-backed, grounded on the teacher's raw-SQL `claim_jobs`) must
/// make `reserve` atomic: only one caller may move a given job out of
/// `Pending` into `Running` (§4.7 step 1, `SELECT ... FOR UPDATE SKIP
/// LOCKED` or equivalent).
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn find(&self, job_id: Uuid) -> Result<Job, JobStoreError>;

    /// Atomically claims `job_id` and transitions it to `Running`,
    /// returning `None` if that row is not `Pending` and due — this is
    /// the duplicate-delivery guard from §4.7 step 2 ("read the job row;
    /// if status is not `pending`, ack and continue"), so it must read
    /// exactly the row named by `job_id`, never substitute another one.
    async fn reserve(&self, job_id: Uuid, now: DateTime<Utc>) -> Result<Option<Job>, JobStoreError>;

    /// Persists the full row after a settle step — used for both
    /// `Completed` writes and the incremental usage/cost/log updates
    /// made while the job is still running.
    async fn save(&self, job: &Job) -> Result<(), JobStoreError>;

    /// Extends a running job's visibility lease (§5 heartbeat).
    async fn heartbeat(&self, job_id: Uuid, now: DateTime<Utc>) -> Result<(), JobStoreError>;

    /// Sets the cancellation sentinel; the Dispatcher observes it on the
    /// next heartbeat and cooperatively stops the Agent Loop (§5).
    async fn request_cancellation(&self, job_id: Uuid) -> Result<(), JobStoreError>;
}

/// In-process reference implementation for tests and the reference
/// binary — no collaborator database required.
pub struct InMemoryJobStore {
    jobs: tokio::sync::Mutex<std::collections::HashMap<Uuid, Job>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self { jobs: tokio::sync::Mutex::new(std::collections::HashMap::new()) }
    }

    pub async fn insert(&self, job: Job) {
        self.jobs.lock().await.insert(job.id, job);
    }
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn find(&self, job_id: Uuid) -> Result<Job, JobStoreError> {
        self.jobs.lock().await.get(&job_id).cloned().ok_or(JobStoreError::NotFound(job_id))
    }

    async fn reserve(&self, job_id: Uuid, now: DateTime<Utc>) -> Result<Option<Job>, JobStoreError> {
        let mut jobs = self.jobs.lock().await;
        let Some(job) = jobs.get_mut(&job_id) else {
            return Ok(None);
        };
        if !job.is_ready(now) {
            return Ok(None);
        }
        job.status = JobStatus::Running;
        job.started_at.get_or_insert(now);
        Ok(Some(job.clone()))
    }

    async fn save(&self, job: &Job) -> Result<(), JobStoreError> {
        let mut jobs = self.jobs.lock().await;
        if !jobs.contains_key(&job.id) {
            return Err(JobStoreError::NotFound(job.id));
        }
        jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn heartbeat(&self, job_id: Uuid, _now: DateTime<Utc>) -> Result<(), JobStoreError> {
        let jobs = self.jobs.lock().await;
        if jobs.contains_key(&job_id) { Ok(()) } else { Err(JobStoreError::NotFound(job_id)) }
    }

    async fn request_cancellation(&self, job_id: Uuid) -> Result<(), JobStoreError> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs.get_mut(&job_id).ok_or(JobStoreError::NotFound(job_id))?;
        job.status = JobStatus::CancelledRequested;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::jobs::job::{JobSubmission, JobType};

    fn submission() -> JobSubmission {
        JobSubmission {
            project_id: Uuid::new_v4(),
            job_type: JobType::Implement,
            payload: serde_json::json!({}),
            assigned_agent_id: None,
            max_retries: None,
        }
    }

    #[tokio::test]
    async fn reserve_claims_exactly_one_ready_job() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let job = Job::from_submission(submission(), now);
        let job_id = job.id;
        store.insert(job).await;

        let claimed = store.reserve(job_id, now).await.unwrap().unwrap();
        assert_eq!(claimed.id, job_id);
        assert_eq!(claimed.status, JobStatus::Running);

        // Already running, not pending: not claimed again.
        assert!(store.reserve(job_id, now).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reserve_skips_jobs_not_yet_due() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let mut job = Job::from_submission(submission(), now);
        job.next_retry_at = Some(now + chrono::Duration::seconds(60));
        let job_id = job.id;
        store.insert(job).await;

        assert!(store.reserve(job_id, now).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reserve_never_substitutes_an_unrelated_pending_job() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let other_ready_job = Job::from_submission(submission(), now);
        store.insert(other_ready_job).await;

        // A job id that was never inserted (e.g. a duplicate delivery for
        // a row that has since moved on) must never be satisfied by some
        // other ready job happening to be sitting in the store.
        let unrelated_job_id = Uuid::new_v4();
        assert!(store.reserve(unrelated_job_id, now).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn cancellation_sets_sentinel() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let job = Job::from_submission(submission(), now);
        let job_id = job.id;
        store.insert(job).await;

        store.request_cancellation(job_id).await.unwrap();
        let job = store.find(job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::CancelledRequested);
    }

    #[tokio::test]
    async fn save_of_unknown_job_errors() {
        let store = InMemoryJobStore::new();
        let job = Job::from_submission(submission(), Utc::now());
        assert!(matches!(store.save(&job).await, Err(JobStoreError::NotFound(_))));
    }
}

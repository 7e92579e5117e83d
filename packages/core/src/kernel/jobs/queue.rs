//! Queue Facade (§4.8) — the three message channels a dispatcher polls:
//! `incoming` (freshly submitted jobs), `delayed-retry` (jobs waiting out
//! a backoff), and `dead-letter` (terminal failures kept for inspection).
//!
//! Grounded on the teacher's `PostgresJobQueue`/`JobQueue` trait, stripped
//! of the `CommandMeta`/idempotency-key/recurring-schedule machinery that
//! belonged to the teacher's generic background-job domain — this
//! spec's jobs are always one-shot work items identified by
//! [`Job`](super::job::Job)'s own id, not a deduplicated command.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

/// Publish/consume surface over the three queues named in §4.8.
#[async_trait]
pub trait QueueFacade: Send + Sync {
    /// Publishes a job id to `incoming`, to be picked up by the next
    /// dispatcher poll.
    async fn publish(&self, job_id: Uuid) -> Result<(), QueueError>;

    /// Schedules a job id onto `delayed-retry`, due at `due_at`.
    async fn schedule(&self, job_id: Uuid, due_at: DateTime<Utc>) -> Result<(), QueueError>;

    /// Moves a job id onto `dead-letter` for inspection; terminal, no
    /// `due_at` since dead-lettered jobs are never auto-replayed (§4.3).
    async fn dead_letter(&self, job_id: Uuid) -> Result<(), QueueError>;

    /// Pops the next due item across `incoming` and `delayed-retry`
    /// (delayed items become eligible once their `due_at` has elapsed),
    /// or `None` if nothing is ready yet.
    async fn next_due(&self, now: DateTime<Utc>) -> Result<Option<Uuid>, QueueError>;
}

struct DelayedEntry {
    job_id: Uuid,
    due_at: DateTime<Utc>,
}

/// In-process reference implementation backing tests and the reference
/// binary. `incoming` is FIFO; `delayed-retry` is scanned for the
/// earliest due entry on every `next_due` call, favoring simplicity over
/// the heap a high-throughput implementation would use.
#[derive(Default)]
pub struct InMemoryQueueFacade {
    state: tokio::sync::Mutex<State>,
}

#[derive(Default)]
struct State {
    incoming: std::collections::VecDeque<Uuid>,
    delayed: Vec<DelayedEntry>,
    dead_letter: Vec<Uuid>,
}

impl InMemoryQueueFacade {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn dead_letter_ids(&self) -> Vec<Uuid> {
        self.state.lock().await.dead_letter.clone()
    }
}

#[async_trait]
impl QueueFacade for InMemoryQueueFacade {
    async fn publish(&self, job_id: Uuid) -> Result<(), QueueError> {
        self.state.lock().await.incoming.push_back(job_id);
        Ok(())
    }

    async fn schedule(&self, job_id: Uuid, due_at: DateTime<Utc>) -> Result<(), QueueError> {
        self.state.lock().await.delayed.push(DelayedEntry { job_id, due_at });
        Ok(())
    }

    async fn dead_letter(&self, job_id: Uuid) -> Result<(), QueueError> {
        self.state.lock().await.dead_letter.push(job_id);
        Ok(())
    }

    async fn next_due(&self, now: DateTime<Utc>) -> Result<Option<Uuid>, QueueError> {
        let mut state = self.state.lock().await;

        if let Some(job_id) = state.incoming.pop_front() {
            return Ok(Some(job_id));
        }

        let earliest = state
            .delayed
            .iter()
            .enumerate()
            .filter(|(_, e)| e.due_at <= now)
            .min_by_key(|(_, e)| e.due_at)
            .map(|(idx, _)| idx);

        Ok(earliest.map(|idx| state.delayed.remove(idx).job_id))
    }
}

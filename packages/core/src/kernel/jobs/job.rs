//! The `Job` data model — the unit of work the Dispatcher reserves, runs,
//! and settles.
//!
//! Lifecycle: created by the HTTP layer (out of scope here) with
//! `status = pending`; mutated only by the Dispatcher from then on.
//! Terminal states are `Completed`, `Blocked`, and `DeadLetter`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Tag drawn from the fixed set of software-engineering task kinds a job
/// can represent. `Other` keeps the set extensible without a migration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    Design,
    Implement,
    Review,
    Test,
    Deploy,
    Monitor,
    Other(String),
}

impl JobType {
    pub fn as_str(&self) -> &str {
        match self {
            JobType::Design => "design",
            JobType::Implement => "implement",
            JobType::Review => "review",
            JobType::Test => "test",
            JobType::Deploy => "deploy",
            JobType::Monitor => "monitor",
            JobType::Other(s) => s.as_str(),
        }
    }
}

/// The exact status set named in the spec, plus the cancellation sentinel
/// described in the concurrency model (§5): an admin cancellation sets
/// this sentinel rather than mutating `status` through the normal
/// pending/running machinery, so it is modeled as its own terminal state
/// rather than a boolean flag a worker could race against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Blocked,
    DeadLetter,
    CancelledRequested,
}

impl JobStatus {
    /// Terminal states never transition except via explicit admin re-drive.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Blocked | JobStatus::DeadLetter
        )
    }
}

/// Error taxonomy from §7, carried as a tagged value rather than by
/// unwinding across the provider-call boundary.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobError {
    #[error("validation error: {0}")]
    ValidationError(String),
    #[error("project budget exceeded")]
    BudgetExceeded,
    #[error("provider unavailable: {0}")]
    ProviderUnavailable(String),
    #[error("provider rejected request: {0}")]
    ProviderRejected(String),
    #[error("sandbox failed to start: {0}")]
    SandboxStartFailed(String),
    #[error("sandbox timed out")]
    SandboxTimeout,
    #[error("tool {tool} failed: {detail}")]
    ToolExecutionFailed { tool: String, detail: String },
    #[error("max iterations reached")]
    MaxIterationsReached,
    #[error("cancelled by user")]
    UserCancelled,
    #[error("unknown error: {0}")]
    Unknown(String),
}

/// Whether the Retry Policy should ever consider retrying an error, or
/// treat it as immediately terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Retryable,
    NonRetryable,
}

impl JobError {
    pub fn error_kind(&self) -> ErrorKind {
        match self {
            JobError::ValidationError(_)
            | JobError::BudgetExceeded
            | JobError::ProviderRejected(_)
            | JobError::MaxIterationsReached
            | JobError::UserCancelled => ErrorKind::NonRetryable,
            JobError::ProviderUnavailable(_)
            | JobError::SandboxStartFailed(_)
            | JobError::SandboxTimeout => ErrorKind::Retryable,
            // Tool failures are surfaced to the agent as a tool result, not
            // a job failure (§7); if one ever reaches the Dispatcher it is
            // treated conservatively as retryable, matching `Unknown`.
            JobError::ToolExecutionFailed { .. } | JobError::Unknown(_) => ErrorKind::Retryable,
        }
    }

    /// Short tag stored as the job's `failure_reason`.
    pub fn failure_reason(&self) -> &'static str {
        match self {
            JobError::ValidationError(_) => "validation error",
            JobError::BudgetExceeded => "project budget exceeded",
            JobError::ProviderUnavailable(_) => "provider unavailable",
            JobError::ProviderRejected(_) => "provider rejected request",
            JobError::SandboxStartFailed(_) => "sandbox start failed",
            JobError::SandboxTimeout => "sandbox timeout",
            JobError::ToolExecutionFailed { .. } => "tool execution failed",
            JobError::MaxIterationsReached => "max iterations reached",
            JobError::UserCancelled => "cancelled by user",
            JobError::Unknown(_) => "unknown error",
        }
    }
}

/// Token usage accumulated from one or more provider calls.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    pub tokens_in: i64,
    pub tokens_out: i64,
}

impl Usage {
    pub fn total(&self) -> i64 {
        self.tokens_in + self.tokens_out
    }

    pub fn accumulate(&mut self, other: Usage) {
        self.tokens_in += other.tokens_in;
        self.tokens_out += other.tokens_out;
    }
}

/// A single unit of work dispatched to one agent.
///
/// Invariants (§3, enforced by the Dispatcher, never by callers mutating
/// fields directly): `retry_count <= max_retries`; `tokens_used_total =
/// tokens_in + tokens_out`; `actual_cost` is monotonically non-decreasing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub project_id: Uuid,
    /// Advisory pre-assignment; the Dispatcher may pick a different agent
    /// of the same type if this one is unavailable (§9 open question).
    pub assigned_agent_id: Option<Uuid>,
    pub job_type: JobType,
    pub payload: serde_json::Value,
    pub status: JobStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub failure_reason: Option<String>,
    pub last_error: Option<String>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub usage: Usage,
    pub actual_cost: f64,
    pub estimated_cost: Option<f64>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub actual_duration_ms: Option<i64>,
    pub result: Option<serde_json::Value>,
    /// Truncated transcript; intermediate per-call usage must remain
    /// recoverable here even though only the running total is written to
    /// `usage` (§4.6).
    pub logs: String,
    pub created_at: DateTime<Utc>,
}

/// Inbound submission shape from the HTTP layer (§6).
pub struct JobSubmission {
    pub project_id: Uuid,
    pub job_type: JobType,
    pub payload: serde_json::Value,
    pub assigned_agent_id: Option<Uuid>,
    pub max_retries: Option<u32>,
}

impl Job {
    const DEFAULT_MAX_RETRIES: u32 = 3;

    /// Construct a fresh job in `Pending` status. This is what `enqueue`
    /// (§6) persists before publishing the id to the incoming queue.
    pub fn from_submission(submission: JobSubmission, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            project_id: submission.project_id,
            assigned_agent_id: submission.assigned_agent_id,
            job_type: submission.job_type,
            payload: submission.payload,
            status: JobStatus::Pending,
            retry_count: 0,
            max_retries: submission.max_retries.unwrap_or(Self::DEFAULT_MAX_RETRIES),
            failure_reason: None,
            last_error: None,
            next_retry_at: None,
            usage: Usage::default(),
            actual_cost: 0.0,
            estimated_cost: None,
            started_at: None,
            completed_at: None,
            actual_duration_ms: None,
            result: None,
            logs: String::new(),
            created_at: now,
        }
    }

    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            JobStatus::Pending => self.next_retry_at.map(|t| t <= now).unwrap_or(true),
            _ => false,
        }
    }

    /// Appends a line to the truncated transcript. Intentionally
    /// unbounded here; transcript truncation for storage happens at the
    /// persistence boundary (a collaborator), not in this in-memory model.
    pub fn append_log(&mut self, line: impl AsRef<str>) {
        if !self.logs.is_empty() {
            self.logs.push('\n');
        }
        self.logs.push_str(line.as_ref());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn submission() -> JobSubmission {
        JobSubmission {
            project_id: Uuid::new_v4(),
            job_type: JobType::Implement,
            payload: serde_json::json!({"task": "add a button"}),
            assigned_agent_id: None,
            max_retries: None,
        }
    }

    #[test]
    fn new_job_defaults() {
        let job = Job::from_submission(submission(), Utc::now());
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.retry_count, 0);
        assert_eq!(job.max_retries, 3);
        assert_eq!(job.usage.total(), 0);
        assert_eq!(job.actual_cost, 0.0);
    }

    #[test]
    fn is_ready_respects_next_retry_at() {
        let now = Utc::now();
        let mut job = Job::from_submission(submission(), now);
        assert!(job.is_ready(now));

        job.next_retry_at = Some(now + chrono::Duration::seconds(60));
        assert!(!job.is_ready(now));
        assert!(job.is_ready(now + chrono::Duration::seconds(61)));
    }

    #[test]
    fn terminal_states() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Blocked.is_terminal());
        assert!(JobStatus::DeadLetter.is_terminal());
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(!JobStatus::Failed.is_terminal());
    }

    #[test]
    fn error_kind_classification() {
        assert_eq!(JobError::BudgetExceeded.error_kind(), ErrorKind::NonRetryable);
        assert_eq!(JobError::UserCancelled.error_kind(), ErrorKind::NonRetryable);
        assert_eq!(
            JobError::ProviderUnavailable("503".into()).error_kind(),
            ErrorKind::Retryable
        );
        assert_eq!(JobError::SandboxTimeout.error_kind(), ErrorKind::Retryable);
    }

    #[test]
    fn usage_accumulates() {
        let mut usage = Usage::default();
        usage.accumulate(Usage { tokens_in: 100, tokens_out: 50 });
        usage.accumulate(Usage { tokens_in: 10, tokens_out: 5 });
        assert_eq!(usage.tokens_in, 110);
        assert_eq!(usage.tokens_out, 55);
        assert_eq!(usage.total(), 165);
    }
}

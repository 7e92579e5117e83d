//! Job lifecycle events — facts about what happened to a job, emitted by
//! the Dispatcher at each step of §4.7's per-tick algorithm. Kept as
//! plain facts (no IO) in the teacher's seesaw-events idiom, even though
//! this crate no longer routes them through a seesaw `EventBus` (there is
//! no second subscriber for them yet — the Dispatcher logs the same
//! transitions directly via `tracing`). The type stays so a future
//! subscriber (audit log, websocket push) has something to consume.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::job::{ErrorKind, JobType};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum JobEvent {
    /// A job became due and was published to `incoming` or `delayed-retry`.
    Scheduled { job_id: Uuid, project_id: Uuid },

    /// The Dispatcher reserved the job and moved it to `Running` (§4.7 step 1).
    Reserved { job_id: Uuid, job_type: JobType },

    /// The Agent Loop produced a tool call; usage/cost were applied (§4.6).
    ToolCallCompleted { job_id: Uuid, tool: String, incremental_cost: f64 },

    /// The job reached a terminal `Completed` state (§4.7 step 5).
    Succeeded { job_id: Uuid, project_id: Uuid, duration_ms: i64, total_cost: f64 },

    /// The job failed this attempt; `will_retry` reflects the Retry
    /// Policy's decision (§4.7 step 6).
    Failed {
        job_id: Uuid,
        project_id: Uuid,
        reason: String,
        error_kind: ErrorKind,
        retry_count: u32,
        will_retry: bool,
    },

    /// The job exhausted retries or hit a non-retryable error and was
    /// moved to `dead-letter` (§4.3).
    DeadLettered { job_id: Uuid, project_id: Uuid, reason: String, total_attempts: u32 },

    /// An admin cancellation request was observed and the Agent Loop was
    /// stopped cooperatively (§5).
    Cancelled { job_id: Uuid },

    /// Admission was denied because the project's budget was exceeded
    /// (§4.1/§4.7 step 2 "Load & guard").
    BudgetBlocked { job_id: Uuid, project_id: Uuid },

    /// Admission was denied because the provider's circuit breaker is
    /// open (§4.2/§4.7 step 3 "Admit").
    CircuitOpenBlocked { job_id: Uuid, provider: String },
}

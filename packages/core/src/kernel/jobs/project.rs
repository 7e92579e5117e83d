//! `Project` and `Agent` — the two entities the job lifecycle reads but
//! does not own (§3: "Owned by the HTTP layer; Dispatcher only reads").

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A project ties jobs to an optional spending cap. Cost totals are
/// derived from jobs at query time; never stored on the project itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: Uuid,
    pub budget_allocated: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Idle,
    Busy,
    Offline,
}

/// A pool member capable of running the Agent Loop for a given job type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: Uuid,
    pub agent_type: String,
    pub provider_id: String,
    pub model_id: String,
    pub status: AgentStatus,
    pub current_job_id: Option<Uuid>,
    pub last_heartbeat: DateTime<Utc>,
}

impl Agent {
    pub fn is_available(&self) -> bool {
        self.status == AgentStatus::Idle
    }
}

/// Read-only view over the agent pool. The Dispatcher never writes through
/// this trait; it is implemented by whatever the HTTP layer's store is.
#[async_trait::async_trait]
pub trait AgentDirectory: Send + Sync {
    async fn find(&self, agent_id: Uuid) -> anyhow::Result<Option<Agent>>;

    /// Picks a compatible agent for `job_type`, preferring `hint` if it is
    /// available, falling back to any idle agent of the same type
    /// otherwise — assignment at enqueue time is advisory, never a hard
    /// constraint (§9).
    async fn pick(&self, job_type: &str, hint: Option<Uuid>) -> anyhow::Result<Option<Agent>>;
}

/// Read-only view over projects and their period spend, used by the
/// Dispatcher's "Load & guard" step (§4.7) to compute [`BudgetStatus`].
///
/// [`BudgetStatus`]: super::cost_ledger::BudgetStatus
#[async_trait::async_trait]
pub trait ProjectDirectory: Send + Sync {
    async fn find(&self, project_id: Uuid) -> anyhow::Result<Option<Project>>;

    /// Sum of `actual_cost` across all of the project's jobs to date.
    /// Kept as its own call (rather than folded into `find`) so a
    /// collaborator store can answer it with one aggregate query instead
    /// of loading every job row.
    async fn period_spend(&self, project_id: Uuid) -> anyhow::Result<f64>;
}

//! The Dispatcher (§4.7) — the Reserve / Load & guard / Admit / Run /
//! Settle / On-failure loop that drives every job to a terminal state.
//!
//! Structured as a long-running service in the teacher's `JobWorker`
//! idiom (`run(self, shutdown: CancellationToken)`, a bounded poll
//! interval when idle, cooperative shutdown that waits for in-flight
//! jobs), but the per-tick body is entirely new: it is this spec's own
//! six-step algorithm rather than the teacher's
//! claim-deserialize-dispatch-via-seesaw flow. The Dispatcher never
//! depends on `agent-runtime`; it calls the job's assigned agent through
//! the narrow [`AgentRunner`] seam, implemented there.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::circuit_breaker::{Admission, CircuitBreakerRegistry, Outcome};
use super::cost_ledger::{BudgetStatusKind, CostLedger};
use super::events::JobEvent;
use super::job::{ErrorKind, Job, JobError, JobStatus, Usage};
use super::job_store::JobStore;
use super::project::{AgentDirectory, ProjectDirectory};
use super::queue::QueueFacade;
use super::retry_policy::{self, RetryDecision};
use super::sandbox::SandboxExecutor;

/// What running a job through the Agent Loop produced, reported back to
/// the Dispatcher for settlement (§4.6 / §4.7 step 4 "Run").
pub struct AgentRunOutcome {
    pub result: serde_json::Value,
    pub usage: Usage,
    pub provider: String,
    pub model: String,
    pub transcript: String,
}

/// The seam `agent-runtime`'s Agent Loop implements. Mirrors the
/// teacher's `SeesawCommandHandler` trait in shape: one method, a
/// type-erased execution boundary, owned by the caller rather than the
/// implementor.
///
/// `job_store` is handed through (rather than re-reading only at the
/// start) so the Agent Loop can poll for the `CancelledRequested`
/// sentinel between iterations and at every tool-result return, per the
/// cancellation model in §5.
#[async_trait]
pub trait AgentRunner: Send + Sync {
    async fn run(
        &self,
        job: &Job,
        agent: &super::project::Agent,
        sandbox: Arc<dyn SandboxExecutor>,
        circuit_breaker: Arc<CircuitBreakerRegistry>,
        job_store: Arc<dyn JobStore>,
    ) -> Result<AgentRunOutcome, JobError>;
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub worker_id: String,
    pub max_poll_interval: Duration,
    pub heartbeat_interval: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("dispatcher-{}", Uuid::new_v4()),
            max_poll_interval: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(30),
        }
    }
}

pub struct Dispatcher {
    job_store: Arc<dyn JobStore>,
    queue: Arc<dyn QueueFacade>,
    projects: Arc<dyn ProjectDirectory>,
    agents: Arc<dyn AgentDirectory>,
    sandbox: Arc<dyn SandboxExecutor>,
    circuit_breaker: Arc<CircuitBreakerRegistry>,
    cost_ledger: Arc<CostLedger>,
    runner: Arc<dyn AgentRunner>,
    config: DispatcherConfig,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        job_store: Arc<dyn JobStore>,
        queue: Arc<dyn QueueFacade>,
        projects: Arc<dyn ProjectDirectory>,
        agents: Arc<dyn AgentDirectory>,
        sandbox: Arc<dyn SandboxExecutor>,
        circuit_breaker: Arc<CircuitBreakerRegistry>,
        cost_ledger: Arc<CostLedger>,
        runner: Arc<dyn AgentRunner>,
        config: DispatcherConfig,
    ) -> Self {
        Self { job_store, queue, projects, agents, sandbox, circuit_breaker, cost_ledger, runner, config }
    }

    /// Runs the dispatch loop until `shutdown` fires. Matches the
    /// teacher's `JobWorker::run` shape: poll, sleep if idle, exit when
    /// cancelled.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> anyhow::Result<()> {
        info!(worker_id = %self.config.worker_id, "dispatcher starting");

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let now = Utc::now();
            let due = match self.queue.next_due(now).await {
                Ok(due) => due,
                Err(e) => {
                    error!(error = %e, "failed to poll queue");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };

            let Some(job_id) = due else {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.config.max_poll_interval) => {}
                }
                continue;
            };

            if let Err(e) = self.clone().dispatch_one(job_id, &shutdown).await {
                error!(job_id = %job_id, error = %e, "error processing job");
            }
        }

        info!(worker_id = %self.config.worker_id, "dispatcher stopped");
        Ok(())
    }

    /// The per-tick algorithm from §4.7: Reserve -> Load & guard -> Admit
    /// -> Run -> Settle -> On failure.
    async fn dispatch_one(self: Arc<Self>, job_id: Uuid, shutdown: &CancellationToken) -> anyhow::Result<()> {
        // Step 1: Reserve. `next_due` already popped the queue entry;
        // `reserve` makes the pending -> running transition atomic against
        // any other dispatcher instance racing the same row, and reads
        // exactly `job_id` — a duplicate delivery for a row that's no
        // longer `Pending` is acked and skipped, never substituted with
        // some other ready job (§4.7 step 2).
        let now = Utc::now();
        let Some(mut job) = self.job_store.reserve(job_id, now).await? else {
            return Ok(());
        };
        info!(job_id = %job.id, job_type = job.job_type.as_str(), "job reserved");

        // Step 2: Load & guard (project + budget).
        let Some(project) = self.projects.find(job.project_id).await? else {
            return self.dead_letter(job, "project not found".into()).await;
        };
        let spend = self.projects.period_spend(job.project_id).await?;
        let budget = self.cost_ledger.budget_status(&project, spend);
        if budget.status == BudgetStatusKind::Exceeded {
            warn!(job_id = %job.id, project_id = %job.project_id, "budget exceeded, blocking job");
            return self.block_on_budget(job).await;
        }

        // Load & guard (agent).
        let Some(agent) = self.agents.pick(job.job_type.as_str(), job.assigned_agent_id).await? else {
            return self.fail_and_decide(job, JobError::ValidationError("no compatible agent available".into())).await;
        };

        // Step 3: Admit (circuit breaker).
        if self.circuit_breaker.admit(&agent.provider_id) == Admission::Denied {
            debug!(job_id = %job.id, provider = %agent.provider_id, "circuit open, deferring job");
            job.status = JobStatus::Pending;
            self.job_store.save(&job).await?;
            self.queue.schedule(job.id, now + chrono::Duration::seconds(5)).await?;
            return Ok(());
        }

        // Step 4: Run, with a heartbeat ticking alongside.
        let heartbeat_store = self.job_store.clone();
        let heartbeat_job_id = job.id;
        let heartbeat_interval = self.config.heartbeat_interval;
        let heartbeat_shutdown = shutdown.child_token();
        let heartbeat_handle = tokio::spawn({
            let shutdown = heartbeat_shutdown.clone();
            async move {
                let mut interval = tokio::time::interval(heartbeat_interval);
                interval.tick().await;
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = interval.tick() => {
                            if let Err(e) = heartbeat_store.heartbeat(heartbeat_job_id, Utc::now()).await {
                                warn!(job_id = %heartbeat_job_id, error = %e, "heartbeat failed");
                            }
                        }
                    }
                }
            }
        });

        let run_result = self
            .runner
            .run(&job, &agent, self.sandbox.clone(), self.circuit_breaker.clone(), self.job_store.clone())
            .await;

        heartbeat_shutdown.cancel();
        let _ = heartbeat_handle.await;

        match run_result {
            Ok(outcome) => {
                self.circuit_breaker.record(&agent.provider_id, Outcome::Success);
                self.settle_success(job, outcome).await
            }
            Err(err) => {
                self.circuit_breaker.record(&agent.provider_id, Outcome::Failure);
                self.fail_and_decide(job, err).await
            }
        }
    }

    /// Step 5: Settle on success.
    async fn settle_success(&self, mut job: Job, outcome: AgentRunOutcome) -> anyhow::Result<()> {
        let now = Utc::now();
        self.cost_ledger.apply(&mut job, &outcome.provider, &outcome.model, outcome.usage).ok();
        job.append_log(outcome.transcript);
        job.result = Some(outcome.result);
        job.status = JobStatus::Completed;
        job.completed_at = Some(now);
        job.actual_duration_ms =
            job.started_at.map(|started| (now - started).num_milliseconds()).or(Some(0));
        self.job_store.save(&job).await?;

        info!(job_id = %job.id, cost = job.actual_cost, "job completed");
        self.emit(JobEvent::Succeeded {
            job_id: job.id,
            project_id: job.project_id,
            duration_ms: job.actual_duration_ms.unwrap_or(0),
            total_cost: job.actual_cost,
        });
        Ok(())
    }

    /// Step 6: On failure — classify, consult the Retry Policy, and
    /// either reschedule onto `delayed-retry` or dead-letter.
    async fn fail_and_decide(&self, mut job: Job, err: JobError) -> anyhow::Result<()> {
        let kind = err.error_kind();
        let reason = err.failure_reason().to_string();
        job.last_error = Some(err.to_string());

        let decision = retry_policy::decide(job.retry_count, job.max_retries, kind, Utc::now(), reason.clone());

        match decision {
            RetryDecision::Retry { next_retry_at, .. } => {
                job.retry_count += 1;
                job.status = JobStatus::Pending;
                job.next_retry_at = Some(next_retry_at);
                job.failure_reason = Some(reason.clone());
                self.job_store.save(&job).await?;
                self.queue.schedule(job.id, next_retry_at).await?;

                warn!(job_id = %job.id, retry_count = job.retry_count, reason = %reason, "job failed, will retry");
                self.emit(JobEvent::Failed {
                    job_id: job.id,
                    project_id: job.project_id,
                    reason,
                    error_kind: kind,
                    retry_count: job.retry_count,
                    will_retry: true,
                });
                Ok(())
            }
            RetryDecision::DeadLetter { reason } => self.dead_letter(job, reason).await,
        }
    }

    /// Admission denial on an exceeded project budget (§4.7 step 2): the
    /// job is `Blocked`, not dead-lettered — it is waiting on a human to
    /// raise the project's budget or cancel it, not permanently failed.
    /// `next_due` already removed it from the queue, so acking here is
    /// simply not rescheduling it onto `delayed-retry` or `dead-letter`.
    async fn block_on_budget(&self, mut job: Job) -> anyhow::Result<()> {
        job.status = JobStatus::Blocked;
        job.failure_reason = Some("project budget exceeded".into());
        self.job_store.save(&job).await?;

        self.emit(JobEvent::BudgetBlocked { job_id: job.id, project_id: job.project_id });
        Ok(())
    }

    async fn dead_letter(&self, mut job: Job, reason: String) -> anyhow::Result<()> {
        job.status = JobStatus::DeadLetter;
        job.failure_reason = Some(reason.clone());
        job.completed_at = Some(Utc::now());
        self.job_store.save(&job).await?;
        self.queue.dead_letter(job.id).await?;

        warn!(job_id = %job.id, reason = %reason, "job dead-lettered");
        self.emit(JobEvent::DeadLettered {
            job_id: job.id,
            project_id: job.project_id,
            reason,
            total_attempts: job.retry_count + 1,
        });
        Ok(())
    }

    /// Structured-logging stand-in for a real event bus subscriber; see
    /// [`JobEvent`]'s doc comment.
    fn emit(&self, event: JobEvent) {
        debug!(?event, "job event");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::jobs::circuit_breaker::CircuitBreakerConfig;
    use crate::kernel::jobs::cost_ledger::{Price, PricingTable};
    use crate::kernel::jobs::job::{JobSubmission, JobType};
    use crate::kernel::jobs::job_store::InMemoryJobStore;
    use crate::kernel::jobs::project::{Agent, AgentStatus, Project};
    use crate::kernel::jobs::queue::InMemoryQueueFacade;
    use crate::kernel::jobs::sandbox::{SandboxError, SandboxHandle};
    use std::sync::Mutex as StdMutex;

    struct FixedProjectDirectory {
        project: Project,
        spend: StdMutex<f64>,
    }

    #[async_trait]
    impl ProjectDirectory for FixedProjectDirectory {
        async fn find(&self, _project_id: Uuid) -> anyhow::Result<Option<Project>> {
            Ok(Some(self.project.clone()))
        }
        async fn period_spend(&self, _project_id: Uuid) -> anyhow::Result<f64> {
            Ok(*self.spend.lock().unwrap())
        }
    }

    struct FixedAgentDirectory {
        agent: Agent,
    }

    #[async_trait]
    impl AgentDirectory for FixedAgentDirectory {
        async fn find(&self, _agent_id: Uuid) -> anyhow::Result<Option<Agent>> {
            Ok(Some(self.agent.clone()))
        }
        async fn pick(&self, _job_type: &str, _hint: Option<Uuid>) -> anyhow::Result<Option<Agent>> {
            Ok(Some(self.agent.clone()))
        }
    }

    struct NoopSandbox;

    #[async_trait]
    impl SandboxExecutor for NoopSandbox {
        async fn launch(
            &self,
            _job_id: Uuid,
            _limits: super::super::sandbox::ResourceLimits,
        ) -> Result<Box<dyn SandboxHandle>, SandboxError> {
            unimplemented!("dispatcher tests never launch a real sandbox")
        }
        async fn reap_orphans(&self) -> Result<Vec<String>, SandboxError> {
            Ok(vec![])
        }
    }

    struct ScriptedRunner {
        outcome: StdMutex<Option<Result<AgentRunOutcome, JobError>>>,
    }

    #[async_trait]
    impl AgentRunner for ScriptedRunner {
        async fn run(
            &self,
            _job: &Job,
            _agent: &Agent,
            _sandbox: Arc<dyn SandboxExecutor>,
            _circuit_breaker: Arc<CircuitBreakerRegistry>,
            _job_store: Arc<dyn JobStore>,
        ) -> Result<AgentRunOutcome, JobError> {
            self.outcome.lock().unwrap().take().expect("runner called more than once in this test")
        }
    }

    fn agent() -> Agent {
        Agent {
            id: Uuid::new_v4(),
            agent_type: "implement".into(),
            provider_id: "anthropic".into(),
            model_id: "claude-sonnet".into(),
            status: AgentStatus::Idle,
            current_job_id: None,
            last_heartbeat: Utc::now(),
        }
    }

    fn cost_ledger() -> Arc<CostLedger> {
        Arc::new(CostLedger::new(PricingTable::new().with_price(
            "anthropic",
            "claude-sonnet",
            Price { in_per_million_usd: 3.0, out_per_million_usd: 15.0 },
        )))
    }

    async fn dispatcher_with(
        project: Project,
        runner_outcome: Result<AgentRunOutcome, JobError>,
    ) -> (Arc<Dispatcher>, Arc<InMemoryJobStore>, Uuid) {
        let job_store = Arc::new(InMemoryJobStore::new());
        let queue = Arc::new(InMemoryQueueFacade::new());
        let project_id = project.id;
        let job = Job::from_submission(
            JobSubmission {
                project_id,
                job_type: JobType::Implement,
                payload: serde_json::json!({}),
                assigned_agent_id: None,
                max_retries: None,
            },
            Utc::now(),
        );
        let job_id = job.id;
        job_store.insert(job).await;
        queue.publish(job_id).await.unwrap();

        let dispatcher = Arc::new(Dispatcher::new(
            job_store.clone(),
            queue,
            Arc::new(FixedProjectDirectory { project, spend: StdMutex::new(0.0) }),
            Arc::new(FixedAgentDirectory { agent: agent() }),
            Arc::new(NoopSandbox),
            Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig::default())),
            cost_ledger(),
            Arc::new(ScriptedRunner { outcome: StdMutex::new(Some(runner_outcome)) }),
            DispatcherConfig { heartbeat_interval: Duration::from_secs(3600), ..Default::default() },
        ));

        (dispatcher, job_store, job_id)
    }

    #[tokio::test]
    async fn successful_run_completes_the_job_and_applies_cost() {
        let project = Project { id: Uuid::new_v4(), budget_allocated: Some(100.0) };
        let outcome = Ok(AgentRunOutcome {
            result: serde_json::json!({"ok": true}),
            usage: Usage { tokens_in: 1000, tokens_out: 500 },
            provider: "anthropic".into(),
            model: "claude-sonnet".into(),
            transcript: "did the thing".into(),
        });
        let (dispatcher, job_store, job_id) = dispatcher_with(project, outcome).await;

        let shutdown = CancellationToken::new();
        dispatcher.dispatch_one(job_id, &shutdown).await.unwrap();

        let job = job_store.find(job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!((job.actual_cost - 0.0105).abs() < 1e-9);
    }

    #[tokio::test]
    async fn retryable_failure_reschedules_onto_delayed_queue() {
        let project = Project { id: Uuid::new_v4(), budget_allocated: None };
        let outcome = Err(JobError::ProviderUnavailable("503".into()));
        let (dispatcher, job_store, job_id) = dispatcher_with(project, outcome).await;

        let shutdown = CancellationToken::new();
        dispatcher.dispatch_one(job_id, &shutdown).await.unwrap();

        let job = job_store.find(job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.retry_count, 1);
        assert!(job.next_retry_at.is_some());
    }

    #[tokio::test]
    async fn non_retryable_failure_dead_letters_immediately() {
        let project = Project { id: Uuid::new_v4(), budget_allocated: None };
        let outcome = Err(JobError::UserCancelled);
        let (dispatcher, job_store, job_id) = dispatcher_with(project, outcome).await;

        let shutdown = CancellationToken::new();
        dispatcher.dispatch_one(job_id, &shutdown).await.unwrap();

        let job = job_store.find(job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::DeadLetter);
    }

    #[tokio::test]
    async fn exceeded_budget_blocks_before_running_the_agent() {
        let project = Project { id: Uuid::new_v4(), budget_allocated: Some(10.0) };
        let job_store = Arc::new(InMemoryJobStore::new());
        let queue = Arc::new(InMemoryQueueFacade::new());
        let job = Job::from_submission(
            JobSubmission {
                project_id: project.id,
                job_type: JobType::Implement,
                payload: serde_json::json!({}),
                assigned_agent_id: None,
                max_retries: None,
            },
            Utc::now(),
        );
        let job_id = job.id;
        job_store.insert(job).await;
        queue.publish(job_id).await.unwrap();

        let dispatcher = Arc::new(Dispatcher::new(
            job_store.clone(),
            queue,
            Arc::new(FixedProjectDirectory { project, spend: StdMutex::new(10.0) }),
            Arc::new(FixedAgentDirectory { agent: agent() }),
            Arc::new(NoopSandbox),
            Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig::default())),
            cost_ledger(),
            Arc::new(ScriptedRunner { outcome: StdMutex::new(None) }),
            DispatcherConfig::default(),
        ));

        let shutdown = CancellationToken::new();
        dispatcher.dispatch_one(job_id, &shutdown).await.unwrap();

        let job = job_store.find(job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Blocked);
        assert_eq!(job.failure_reason.as_deref(), Some("project budget exceeded"));
    }
}

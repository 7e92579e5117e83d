//! The Agent Loop (§4.6) — the per-job reasoning cycle: build a provider
//! request, invoke the model through the Circuit Breaker, execute any
//! requested tool calls in the job's sandbox, and repeat until the model
//! signals it is done, the sandbox signals a fatal tool error, or the
//! iteration cap is hit.
//!
//! Grounded on the teacher's `Agent::run_tool_loop` (the
//! request/execute-tools/append-results/repeat shape), generalized from
//! one OpenAI-specific client to any registered [`ProviderAdapter`] and
//! from in-process tool execution to the Sandbox Executor.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};
use uuid::Uuid;

use orchestrator_core::kernel::jobs::circuit_breaker::{Admission, CircuitBreakerRegistry, Outcome};
use orchestrator_core::kernel::jobs::dispatcher::{AgentRunOutcome, AgentRunner};
use orchestrator_core::kernel::jobs::job::{Job, JobError, JobStatus, JobType, Usage};
use orchestrator_core::kernel::jobs::job_store::JobStore;
use orchestrator_core::kernel::jobs::project::Agent as AgentRecord;
use orchestrator_core::kernel::jobs::sandbox::{SandboxError, SandboxExecutor, SandboxHandle, ToolRequest};

use crate::gateway::{ContentBlock, FinishReason, ProviderAdapter, ProviderMessage, ProviderRegistry, ProviderRequest, Role};
use crate::tool::{self, ErasedToolSpec, ToolCall, ToolDefinition, builtin_tool_definitions};

/// §9 design note: "represent an agent as a value `{type, system_prompt_fn,
/// extra_tools[]}`" rather than a subclass hierarchy per job type.
#[derive(Clone)]
pub struct AgentProfile {
    pub system_prompt: String,
    pub extra_tools: Vec<Arc<dyn ErasedToolSpec>>,
}

impl AgentProfile {
    pub fn tool_definitions(&self) -> Vec<ToolDefinition> {
        let mut defs = builtin_tool_definitions();
        defs.extend(self.extra_tools.iter().map(|t| t.definition()));
        defs
    }

    /// Looks up an extra tool by name to route a tool call through its
    /// [`ErasedToolSpec::build_request`]; builtins never reach this path,
    /// see [`tool::to_sandbox_request`].
    fn find_extra(&self, name: &str) -> Option<&Arc<dyn ErasedToolSpec>> {
        self.extra_tools.iter().find(|t| t.name() == name)
    }
}

/// Maps a job type to the profile the Agent Loop should run it with.
pub trait AgentProfileProvider: Send + Sync {
    fn profile_for(&self, job_type: &JobType) -> AgentProfile;
}

/// Reference provider with one system prompt per named job type (§4.6).
/// A deployment wanting per-project prompt overrides supplies its own
/// `AgentProfileProvider`; this one is the sane default.
pub struct DefaultAgentProfiles {
    prompts: HashMap<&'static str, &'static str>,
}

impl DefaultAgentProfiles {
    pub fn new() -> Self {
        let mut prompts = HashMap::new();
        prompts.insert("design", "You are a software design agent. Produce a clear technical design for the given task, calling out tradeoffs and open questions.");
        prompts.insert("implement", "You are a software implementation agent. Write the code needed to complete the given task, using the available tools to read and modify files.");
        prompts.insert("review", "You are a code review agent. Read the relevant files and report defects, risks, and suggested changes; do not make edits unless asked.");
        prompts.insert("test", "You are a test-authoring agent. Write and run tests that cover the given task's behavior.");
        prompts.insert("deploy", "You are a deployment agent. Carry out the requested deployment steps carefully, verifying each stage before proceeding.");
        prompts.insert("monitor", "You are a monitoring agent. Inspect the given system state and report anomalies or confirm health.");
        Self { prompts }
    }
}

impl Default for DefaultAgentProfiles {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentProfileProvider for DefaultAgentProfiles {
    fn profile_for(&self, job_type: &JobType) -> AgentProfile {
        let system_prompt = self
            .prompts
            .get(job_type.as_str())
            .copied()
            .unwrap_or("You are a general-purpose software engineering agent. Complete the given task using the available tools.")
            .to_string();
        AgentProfile { system_prompt, extra_tools: Vec::new() }
    }
}

/// The Agent Loop itself: implements [`AgentRunner`] so the Dispatcher can
/// drive it without depending on this crate's internals.
pub struct AgentLoop {
    providers: ProviderRegistry,
    profiles: Arc<dyn AgentProfileProvider>,
    max_iterations: u32,
}

impl AgentLoop {
    pub fn new(providers: ProviderRegistry, profiles: Arc<dyn AgentProfileProvider>) -> Self {
        Self { providers, profiles, max_iterations: 25 }
    }

    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = max_iterations;
        self
    }
}

#[async_trait]
impl AgentRunner for AgentLoop {
    async fn run(
        &self,
        job: &Job,
        agent: &AgentRecord,
        sandbox: Arc<dyn SandboxExecutor>,
        circuit_breaker: Arc<CircuitBreakerRegistry>,
        job_store: Arc<dyn JobStore>,
    ) -> Result<AgentRunOutcome, JobError> {
        let adapter = self
            .providers
            .get(&agent.provider_id)
            .ok_or_else(|| JobError::ProviderRejected(format!("no adapter registered for '{}'", agent.provider_id)))?;

        let profile = self.profiles.profile_for(&job.job_type);
        let tools = profile.tool_definitions();

        let sandbox_handle = sandbox
            .launch(job.id, orchestrator_core::kernel::jobs::sandbox::ResourceLimits::default_caps())
            .await
            .map_err(sandbox_err_to_job_err)?;

        let mut messages = vec![ProviderMessage::user(describe_task(job))];
        let mut usage = Usage::default();
        let mut transcript = String::new();
        let mut produced_artifact = false;

        let outcome = loop_body(
            job,
            adapter.as_ref(),
            &agent.model_id,
            &profile,
            &tools,
            sandbox_handle.as_ref(),
            &circuit_breaker,
            &agent.provider_id,
            &job_store,
            self.max_iterations,
            &mut messages,
            &mut usage,
            &mut transcript,
            &mut produced_artifact,
        )
        .await;

        if let Err(e) = sandbox_handle.teardown().await {
            warn!(job_id = %job.id, error = %e, "sandbox teardown failed");
        }

        outcome.map(|result| AgentRunOutcome {
            result,
            usage,
            provider: agent.provider_id.clone(),
            model: agent.model_id.clone(),
            transcript,
        })
    }
}

/// One job's full iteration cycle. A free function rather than a method so
/// the borrow checker doesn't have to reconcile `&self` with the several
/// `&mut` accumulators the caller threads through; `AgentLoop::run` is the
/// only caller.
#[allow(clippy::too_many_arguments)]
async fn loop_body(
    job: &Job,
    adapter: &dyn ProviderAdapter,
    model: &str,
    profile: &AgentProfile,
    tools: &[ToolDefinition],
    sandbox_handle: &dyn SandboxHandle,
    circuit_breaker: &CircuitBreakerRegistry,
    provider_id: &str,
    job_store: &Arc<dyn JobStore>,
    max_iterations: u32,
    messages: &mut Vec<ProviderMessage>,
    usage: &mut Usage,
    transcript: &mut String,
    produced_artifact: &mut bool,
) -> Result<serde_json::Value, JobError> {
    for iteration in 1..=max_iterations {
        if is_cancelled(job_store, job.id).await {
            info!(job_id = %job.id, iteration, "cancellation observed before provider call, aborting");
            return Err(JobError::UserCancelled);
        }

        if circuit_breaker.admit(provider_id) == Admission::Denied {
            return Err(JobError::ProviderUnavailable(format!("circuit open for provider '{provider_id}'")));
        }

        let request = ProviderRequest {
            system: Some(profile.system_prompt.clone()),
            messages: messages.clone(),
            tools: tools.to_vec(),
            max_iterations: Some(max_iterations),
        };

        let response = match adapter.invoke(model, &request).await {
            Ok(response) => {
                circuit_breaker.record(provider_id, Outcome::Success);
                response
            }
            Err(e) => {
                circuit_breaker.record(provider_id, Outcome::Failure);
                return Err(if e.is_retryable() {
                    JobError::ProviderUnavailable(e.to_string())
                } else {
                    JobError::ProviderRejected(e.to_string())
                });
            }
        };

        usage.accumulate(Usage { tokens_in: response.usage.in_tokens, tokens_out: response.usage.out_tokens });
        transcript.push_str(&format!("--- iteration {iteration} ---\n"));
        if !response.text().is_empty() {
            transcript.push_str(&response.text());
            transcript.push('\n');
        }

        messages.push(ProviderMessage { role: Role::Assistant, content: response.blocks.clone() });

        match response.finish_reason {
            FinishReason::EndOfTurn => {
                debug!(job_id = %job.id, iteration, "agent loop finished with end_of_turn");
                return Ok(serde_json::json!({"text": response.text()}));
            }
            FinishReason::Length => {
                if response.text().is_empty() && response.tool_uses().is_empty() {
                    return Err(JobError::MaxIterationsReached);
                }
                return Ok(serde_json::json!({"text": response.text(), "truncated": true}));
            }
            FinishReason::Error => {
                return Err(JobError::Unknown("provider reported an error finish reason".to_string()));
            }
            FinishReason::ToolUse => {
                let tool_calls: Vec<ToolCall> = response
                    .tool_uses()
                    .into_iter()
                    .map(|(id, name, input)| ToolCall { id: id.to_string(), name: name.to_string(), input: input.clone() })
                    .collect();

                let mut result_blocks = Vec::with_capacity(tool_calls.len());
                for call in &tool_calls {
                    if is_cancelled(job_store, job.id).await {
                        info!(job_id = %job.id, iteration, "cancellation observed after a tool result, aborting");
                        return Err(JobError::UserCancelled);
                    }

                    let request = if let Some(extra) = profile.find_extra(&call.name) {
                        extra.build_request(&call.input.to_string())
                    } else {
                        tool::to_sandbox_request(call)
                    };

                    let request = match request {
                        Ok(request) => request,
                        Err(e) => {
                            result_blocks.push(tool_result_message(&call.id, &e.to_string(), true));
                            continue;
                        }
                    };

                    let writes_or_runs = matches!(request, ToolRequest::WriteFile { .. } | ToolRequest::RunCommand { .. });

                    match sandbox_handle
                        .execute_tool(request, orchestrator_core::kernel::jobs::sandbox::DEFAULT_TRUNCATION_CEILING_BYTES)
                        .await
                    {
                        Ok(output) => {
                            if output.error.is_none() && writes_or_runs {
                                *produced_artifact = true;
                            }
                            let is_error = output.error.is_some();
                            let content = output.error.unwrap_or(output.content);
                            result_blocks.push(tool_result_message(&call.id, &content, is_error));
                        }
                        Err(SandboxError::Timeout) => return Err(JobError::SandboxTimeout),
                        Err(e) => {
                            result_blocks.push(tool_result_message(&call.id, &e.to_string(), true));
                        }
                    }
                }

                messages.push(ProviderMessage { role: Role::Tool, content: result_blocks });

                if iteration == max_iterations {
                    if *produced_artifact {
                        return Ok(serde_json::json!({"text": response.text(), "truncated": true}));
                    }
                    return Err(JobError::MaxIterationsReached);
                }
            }
        }
    }

    Err(JobError::MaxIterationsReached)
}

async fn is_cancelled(job_store: &Arc<dyn JobStore>, job_id: Uuid) -> bool {
    match job_store.find(job_id).await {
        Ok(job) => job.status == JobStatus::CancelledRequested,
        Err(e) => {
            warn!(job_id = %job_id, error = %e, "failed to poll job store for cancellation; continuing");
            false
        }
    }
}

fn tool_result_message(tool_use_id: &str, content: &str, is_error: bool) -> ContentBlock {
    ContentBlock::ToolResult { tool_use_id: tool_use_id.to_string(), content: content.to_string(), is_error }
}

fn describe_task(job: &Job) -> String {
    format!(
        "Job type: {}\nPayload:\n{}",
        job.job_type.as_str(),
        serde_json::to_string_pretty(&job.payload).unwrap_or_else(|_| job.payload.to_string())
    )
}

fn sandbox_err_to_job_err(e: SandboxError) -> JobError {
    match e {
        SandboxError::StartFailed(detail) => JobError::SandboxStartFailed(detail),
        SandboxError::Timeout => JobError::SandboxTimeout,
        SandboxError::ToolExecutionFailed { tool, detail } => JobError::ToolExecutionFailed { tool, detail },
        SandboxError::UnknownTool(name) => JobError::ToolExecutionFailed { tool: name, detail: "unknown tool".to_string() },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use orchestrator_core::kernel::jobs::job::JobSubmission;
    use orchestrator_core::kernel::jobs::job_store::InMemoryJobStore;
    use orchestrator_core::kernel::jobs::project::AgentStatus;
    use orchestrator_core::kernel::jobs::sandbox::{ResourceLimits, ToolOutput};
    use std::sync::Mutex as StdMutex;

    use crate::error::ProviderError;
    use crate::gateway::{ProviderResponse, ProviderUsage};

    struct ScriptedAdapter {
        responses: StdMutex<Vec<Result<ProviderResponse, ProviderError>>>,
    }

    #[async_trait]
    impl ProviderAdapter for ScriptedAdapter {
        fn provider_id(&self) -> &str {
            "scripted"
        }
        async fn invoke(&self, _model: &str, _request: &ProviderRequest) -> Result<ProviderResponse, ProviderError> {
            self.responses.lock().unwrap().remove(0)
        }
    }

    struct NoopSandboxExecutor;

    #[async_trait]
    impl SandboxExecutor for NoopSandboxExecutor {
        async fn launch(&self, _job_id: Uuid, _limits: ResourceLimits) -> Result<Box<dyn SandboxHandle>, SandboxError> {
            Ok(Box::new(ScriptedSandboxHandle))
        }
        async fn reap_orphans(&self) -> Result<Vec<String>, SandboxError> {
            Ok(vec![])
        }
    }

    struct ScriptedSandboxHandle;

    #[async_trait]
    impl SandboxHandle for ScriptedSandboxHandle {
        async fn execute_tool(&self, request: ToolRequest, _ceiling_bytes: usize) -> Result<ToolOutput, SandboxError> {
            match request {
                ToolRequest::WriteFile { .. } => Ok(ToolOutput::ok("wrote file")),
                _ => Ok(ToolOutput::ok("ok")),
            }
        }
        async fn teardown(&self) -> Result<(), SandboxError> {
            Ok(())
        }
    }

    fn job() -> Job {
        Job::from_submission(
            JobSubmission {
                project_id: Uuid::new_v4(),
                job_type: JobType::Implement,
                payload: serde_json::json!({"task": "add a button"}),
                assigned_agent_id: None,
                max_retries: None,
            },
            Utc::now(),
        )
    }

    fn agent_record() -> AgentRecord {
        AgentRecord {
            id: Uuid::new_v4(),
            agent_type: "implement".into(),
            provider_id: "scripted".into(),
            model_id: "model-1".into(),
            status: AgentStatus::Idle,
            current_job_id: None,
            last_heartbeat: Utc::now(),
        }
    }

    #[tokio::test]
    async fn end_of_turn_finishes_successfully() {
        let adapter: Arc<dyn ProviderAdapter> = Arc::new(ScriptedAdapter {
            responses: StdMutex::new(vec![Ok(ProviderResponse {
                blocks: vec![ContentBlock::Text { text: "done".to_string() }],
                finish_reason: FinishReason::EndOfTurn,
                usage: ProviderUsage { in_tokens: 10, out_tokens: 5 },
            })]),
        });
        let providers = ProviderRegistry::new().register(adapter);
        let agent_loop = AgentLoop::new(providers, Arc::new(DefaultAgentProfiles::new()));

        let job_store = Arc::new(InMemoryJobStore::new());
        let the_job = job();
        job_store.insert(the_job.clone()).await;
        let job_store: Arc<dyn JobStore> = job_store;

        let outcome = agent_loop
            .run(&the_job, &agent_record(), Arc::new(NoopSandboxExecutor), Arc::new(CircuitBreakerRegistry::default()), job_store)
            .await
            .unwrap();

        assert_eq!(outcome.usage.tokens_in, 10);
        assert_eq!(outcome.result["text"], "done");
    }

    #[tokio::test]
    async fn tool_use_then_end_of_turn_executes_the_tool_and_finishes() {
        let adapter: Arc<dyn ProviderAdapter> = Arc::new(ScriptedAdapter {
            responses: StdMutex::new(vec![
                Ok(ProviderResponse {
                    blocks: vec![ContentBlock::ToolUse {
                        id: "call_1".to_string(),
                        name: "write_file".to_string(),
                        input: serde_json::json!({"path": "a.txt", "content": "hi"}),
                    }],
                    finish_reason: FinishReason::ToolUse,
                    usage: ProviderUsage { in_tokens: 5, out_tokens: 5 },
                }),
                Ok(ProviderResponse {
                    blocks: vec![ContentBlock::Text { text: "wrote the file".to_string() }],
                    finish_reason: FinishReason::EndOfTurn,
                    usage: ProviderUsage { in_tokens: 5, out_tokens: 5 },
                }),
            ]),
        });
        let providers = ProviderRegistry::new().register(adapter);
        let agent_loop = AgentLoop::new(providers, Arc::new(DefaultAgentProfiles::new()));

        let job_store = Arc::new(InMemoryJobStore::new());
        let the_job = job();
        job_store.insert(the_job.clone()).await;
        let job_store: Arc<dyn JobStore> = job_store;

        let outcome = agent_loop
            .run(&the_job, &agent_record(), Arc::new(NoopSandboxExecutor), Arc::new(CircuitBreakerRegistry::default()), job_store)
            .await
            .unwrap();

        assert_eq!(outcome.usage.tokens_in, 10);
        assert_eq!(outcome.result["text"], "wrote the file");
    }

    #[tokio::test]
    async fn cancellation_sentinel_aborts_before_next_provider_call() {
        let adapter: Arc<dyn ProviderAdapter> = Arc::new(ScriptedAdapter { responses: StdMutex::new(vec![]) });
        let providers = ProviderRegistry::new().register(adapter);
        let agent_loop = AgentLoop::new(providers, Arc::new(DefaultAgentProfiles::new()));

        let job_store = Arc::new(InMemoryJobStore::new());
        let mut the_job = job();
        the_job.status = JobStatus::CancelledRequested;
        job_store.insert(the_job.clone()).await;
        let job_store: Arc<dyn JobStore> = job_store;

        let result = agent_loop
            .run(&the_job, &agent_record(), Arc::new(NoopSandboxExecutor), Arc::new(CircuitBreakerRegistry::default()), job_store)
            .await;

        assert!(matches!(result, Err(JobError::UserCancelled)));
    }
}

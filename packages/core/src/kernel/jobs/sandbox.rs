//! Sandbox Executor (§4.4) — one disposable container per job, a fixed
//! set of tool primitives, resource caps, and guaranteed teardown.
//!
//! The container engine itself (image launch, command execution, file
//! I/O, teardown) is an out-of-scope collaborator (§1: "Sandbox runtime").
//! This module owns the part that *is* in scope: the resource-limit
//! presets, the tool-primitive contract and its truncation behavior, the
//! deterministic naming scheme a reaper can scan for, and the
//! `SandboxExecutor` seam the Agent Loop calls through.
//!
//! `ResourceLimits`'s preset constructors are grounded in the
//! `other_examples` container-types module's `basic()`/`for_build()`
//! pattern, narrowed to the one preset the spec names.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// §9 open question resolved: truncate by bytes, not chars — the source
/// used both interchangeably in documentation; bytes is the safer choice
/// since it can't panic on a multi-byte boundary if applied carelessly
/// (this module always cuts at a char boundary regardless, see
/// [`truncate_bytes`]).
pub const DEFAULT_TRUNCATION_CEILING_BYTES: usize = 5_000;

#[derive(Debug, Clone, Copy)]
pub struct ResourceLimits {
    pub max_memory_mb: u32,
    pub max_cpu_cores: f32,
    pub wall_clock_timeout_secs: u32,
    pub allow_network: bool,
}

impl ResourceLimits {
    /// The spec's defaults (§4.4): memory <= 2 GiB, CPU <= one
    /// core-equivalent, 30 minute wall-clock timeout, no network.
    pub fn default_caps() -> Self {
        Self {
            max_memory_mb: 2048,
            max_cpu_cores: 1.0,
            wall_clock_timeout_secs: 30 * 60,
            allow_network: false,
        }
    }

    pub fn with_timeout_secs(mut self, secs: u32) -> Self {
        self.wall_clock_timeout_secs = secs;
        self
    }
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self::default_caps()
    }
}

/// Deterministic per-job container name a reaper can pattern-match at
/// process start to find orphans left by a crash (§4.4).
pub fn container_name(job_id: Uuid) -> String {
    format!("agent-sandbox-{job_id}")
}

pub const CONTAINER_NAME_PREFIX: &str = "agent-sandbox-";

#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("sandbox failed to start: {0}")]
    StartFailed(String),
    #[error("sandbox timed out")]
    Timeout,
    #[error("tool '{tool}' failed: {detail}")]
    ToolExecutionFailed { tool: String, detail: String },
    #[error("unknown tool '{0}'")]
    UnknownTool(String),
}

/// The four named tool primitives from §6, plus any typed helper the
/// agent registers (`take_screenshot`, `run_tests`, ...) represented
/// generically as `Custom`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "snake_case")]
pub enum ToolRequest {
    ReadFile { path: String },
    WriteFile { path: String, content: String },
    ListDirectory { path: String },
    RunCommand { cmd: String, timeout_s: Option<u64> },
    Custom { name: String, input: serde_json::Value },
}

impl ToolRequest {
    pub fn name(&self) -> &str {
        match self {
            ToolRequest::ReadFile { .. } => "read_file",
            ToolRequest::WriteFile { .. } => "write_file",
            ToolRequest::ListDirectory { .. } => "list_directory",
            ToolRequest::RunCommand { .. } => "run_command",
            ToolRequest::Custom { name, .. } => name,
        }
    }
}

/// Output shape shared by every primitive: `{stdout|content, stderr|error,
/// exit_status}`, collapsed into one struct since every tool's success
/// path is "some text plus an optional exit code" (§6).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ToolOutput {
    pub content: String,
    pub error: Option<String>,
    pub exit_status: Option<i32>,
    pub truncated: bool,
}

impl ToolOutput {
    pub fn ok(content: impl Into<String>) -> Self {
        Self { content: content.into(), ..Default::default() }
    }
}

/// Truncates `s` to at most `ceiling` bytes, always at a char boundary.
/// Output at exactly the ceiling is not marked truncated; ceiling + 1
/// byte is (§8 boundary behavior).
pub fn truncate_bytes(s: &str, ceiling: usize) -> (String, bool) {
    if s.len() <= ceiling {
        return (s.to_string(), false);
    }
    let mut end = ceiling;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    (s[..end].to_string(), true)
}

/// A launched, per-job sandbox. Dropping a handle without calling
/// [`teardown`](SandboxHandle::teardown) must still not leak the
/// container; concrete implementations are expected to teardown in their
/// `Drop` impl as a last-resort safety net in addition to the explicit
/// call on every normal, timeout, and cancellation exit path.
#[async_trait]
pub trait SandboxHandle: Send + Sync {
    async fn execute_tool(&self, request: ToolRequest, ceiling_bytes: usize) -> Result<ToolOutput, SandboxError>;
    async fn teardown(&self) -> Result<(), SandboxError>;
}

/// Launches and tears down per-job containers. Concrete implementations
/// talk to the out-of-scope container engine; this crate only defines
/// the seam and a couple of reference implementations for testing.
#[async_trait]
pub trait SandboxExecutor: Send + Sync {
    async fn launch(&self, job_id: Uuid, limits: ResourceLimits) -> Result<Box<dyn SandboxHandle>, SandboxError>;

    /// Scans for orphan containers matching [`CONTAINER_NAME_PREFIX`] at
    /// process start and tears them down (§4.4 reaper).
    async fn reap_orphans(&self) -> Result<Vec<String>, SandboxError>;
}

//! Canonical tool schema (§4.5, §6) — the fixed sandbox primitives plus
//! any typed helper an agent profile registers, all described the same
//! way so a Provider adapter can translate one schema list into its own
//! wire format.

use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use orchestrator_core::kernel::jobs::sandbox::ToolRequest;

use crate::schema::ToolSchema;

/// `{name, description, input_schema}` — the canonical tool shape from §6.
#[derive(Debug, Clone, Serialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ReadFileArgs {
    pub path: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct WriteFileArgs {
    pub path: String,
    pub content: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ListDirectoryArgs {
    pub path: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct RunCommandArgs {
    pub cmd: String,
    pub timeout_s: Option<u64>,
}

/// The four fixed primitives every sandbox exposes (§4.4, §6). Always
/// present in a job's tool list regardless of agent type.
pub fn builtin_tool_definitions() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition {
            name: "read_file".to_string(),
            description: "Read a file from the job's workspace.".to_string(),
            input_schema: ReadFileArgs::tool_schema(),
        },
        ToolDefinition {
            name: "write_file".to_string(),
            description: "Write a file in the job's workspace, creating or overwriting it.".to_string(),
            input_schema: WriteFileArgs::tool_schema(),
        },
        ToolDefinition {
            name: "list_directory".to_string(),
            description: "List the entries of a directory in the job's workspace.".to_string(),
            input_schema: ListDirectoryArgs::tool_schema(),
        },
        ToolDefinition {
            name: "run_command".to_string(),
            description: "Run a shell command inside the job's sandbox.".to_string(),
            input_schema: RunCommandArgs::tool_schema(),
        },
    ]
}

/// A typed helper tool an agent profile can register beyond the four
/// builtins (§4.4: `take_screenshot`, `run_tests`, `build_docker_image`).
/// Unlike the teacher's `Tool`, there is no in-process `call`: every
/// invocation is translated into a [`ToolRequest::Custom`] and executed by
/// the Sandbox Executor, since a tool's side effects always happen inside
/// the job's container, never on the dispatcher host.
pub trait ToolSpec: Send + Sync {
    const NAME: &'static str;
    type Args: DeserializeOwned + JsonSchema + Send;

    fn description(&self) -> &str;

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: Self::NAME.to_string(),
            description: self.description().to_string(),
            input_schema: Self::Args::tool_schema(),
        }
    }
}

/// Type-erased [`ToolSpec`] for storing heterogeneous extra tools in one
/// `Vec<Arc<dyn ErasedToolSpec>>` on an agent profile.
pub trait ErasedToolSpec: Send + Sync {
    fn name(&self) -> &str;
    fn definition(&self) -> ToolDefinition;

    /// Parse a model-supplied JSON argument string into the `Custom` tool
    /// request the Sandbox Executor understands.
    fn build_request(&self, arguments_json: &str) -> Result<ToolRequest, ToolError> {
        let input: serde_json::Value =
            serde_json::from_str(arguments_json).map_err(|e| ToolError::ArgumentParse(e.to_string()))?;
        Ok(ToolRequest::Custom { name: self.name().to_string(), input })
    }
}

impl<T: ToolSpec> ErasedToolSpec for T {
    fn name(&self) -> &str {
        T::NAME
    }

    fn definition(&self) -> ToolDefinition {
        ToolSpec::definition(self)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("failed to parse arguments: {0}")]
    ArgumentParse(String),
}

/// A tool call extracted from a provider response's `tool_use` block.
#[derive(Debug, Clone)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub input: serde_json::Value,
}

impl ToolCall {
    pub fn parse_args<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.input.clone())
    }
}

/// Translate a builtin tool call into the request shape the Sandbox
/// Executor understands. Extra/custom tools go through
/// [`ErasedToolSpec::build_request`] instead.
pub fn to_sandbox_request(call: &ToolCall) -> Result<ToolRequest, ToolError> {
    let parse_err = |e: serde_json::Error| ToolError::ArgumentParse(e.to_string());
    match call.name.as_str() {
        "read_file" => {
            let args: ReadFileArgs = call.parse_args().map_err(parse_err)?;
            Ok(ToolRequest::ReadFile { path: args.path })
        }
        "write_file" => {
            let args: WriteFileArgs = call.parse_args().map_err(parse_err)?;
            Ok(ToolRequest::WriteFile { path: args.path, content: args.content })
        }
        "list_directory" => {
            let args: ListDirectoryArgs = call.parse_args().map_err(parse_err)?;
            Ok(ToolRequest::ListDirectory { path: args.path })
        }
        "run_command" => {
            let args: RunCommandArgs = call.parse_args().map_err(parse_err)?;
            Ok(ToolRequest::RunCommand { cmd: args.cmd, timeout_s: args.timeout_s })
        }
        other => Ok(ToolRequest::Custom { name: other.to_string(), input: call.input.clone() }),
    }
}

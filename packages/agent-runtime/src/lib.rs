//! Provider Gateway, tool schema, and the Agent Loop (§4.5, §4.6).
//!
//! Depends on `orchestrator-core` for the job/sandbox/circuit-breaker
//! types it plugs into via [`orchestrator_core::kernel::jobs::dispatcher::AgentRunner`];
//! `orchestrator-core` never depends back on this crate.

pub mod agent;
pub mod error;
pub mod gateway;
pub mod schema;
pub mod tool;

pub use agent::{AgentLoop, AgentProfile, AgentProfileProvider, DefaultAgentProfiles};
pub use error::{ProviderError, Result};
pub use gateway::{AnthropicAdapter, OpenAiAdapter, ProviderAdapter, ProviderRegistry};
pub use tool::{ErasedToolSpec, ToolSpec};

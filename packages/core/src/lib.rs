// Job lifecycle subsystem for an agent orchestration platform.
//
// This crate owns the queue, dispatcher, reliability layer
// (retry/dead-letter/circuit-breaker), and cost-tracking/budget
// enforcement for jobs run by agents. Provider-specific request/response
// shapes and the Agent Loop itself live in the `agent-runtime` crate,
// which depends on this one through the `kernel::jobs::dispatcher::AgentRunner`
// seam.

pub mod config;
pub mod kernel;

pub use config::Config;

// Kernel - core infrastructure for the job lifecycle subsystem.
//
// IMPORTANT: Kernel is for INFRASTRUCTURE only, not provider- or
// agent-specific business logic. That lives in `agent-runtime`, which
// depends on this crate rather than the other way around (see
// `jobs::dispatcher::AgentRunner`).

pub mod jobs;

pub use jobs::*;

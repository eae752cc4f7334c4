//! Retry policy for Transient errors (§4.7): exponential backoff with
//! optional jitter, applied uniformly regardless of which component raised
//! the error (cache timeout and IO lock contention share one policy table,
//! per the resolved open question in the design notes).

use std::time::Duration;

use rand::Rng;

use crate::config::RetryConfig;
use crate::error::BuildError;

/// What the scheduler should do with a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-enqueue the node (back to Ready) after sleeping `backoff`.
    Retry { backoff_ms: u64 },
    /// Exhausted retries or the error isn't retryable: fail the node.
    GiveUp,
}

/// Decides whether `attempt_number` (1-based, the attempt that just failed)
/// should be retried for `error`, and if so, how long to wait first.
pub fn decide(policy: &RetryConfig, error: &BuildError, attempt_number: u32) -> RetryDecision {
    if !policy.enabled || !error.is_transient() || attempt_number >= policy.max_attempts {
        return RetryDecision::GiveUp;
    }
    RetryDecision::Retry {
        backoff_ms: backoff_for(policy, attempt_number),
    }
}

fn backoff_for(policy: &RetryConfig, attempt_number: u32) -> u64 {
    let base = policy.initial_backoff.as_millis() as u64;
    let scaled = if policy.exponential {
        base.saturating_mul(1u64 << attempt_number.saturating_sub(1).min(20))
    } else {
        base
    };
    if policy.jitter {
        let mut rng = rand::thread_rng();
        let jitter_fraction: f64 = rng.gen_range(0.5..1.5);
        ((scaled as f64) * jitter_fraction) as u64
    } else {
        scaled
    }
}

pub fn backoff_duration(policy: &RetryConfig, attempt_number: u32) -> Duration {
    Duration::from_millis(backoff_for(policy, attempt_number))
}

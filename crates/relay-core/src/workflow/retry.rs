//! Bounded retry with exponential backoff.
//!
//! A step with a [`RetryPolicy`] gets `max_retries + 1` total attempts. The
//! delay before retry `n` (0-based over failed attempts) is
//! `min(base_delay_ms * 2^n, max_delay_ms)` when exponential, else a flat
//! `base_delay_ms`. An optional allow-list restricts which errors are worth
//! retrying at all.

use std::future::Future;
use std::time::Duration;

use relay_types::workflow::RetryPolicy;

use super::dispatch::ActionResult;

/// Backoff delay before the retry following failed attempt `attempt`
/// (0-based).
pub fn backoff_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let millis = if policy.exponential {
        // Saturate the shift so huge attempt counts cap at max_delay_ms
        // instead of overflowing.
        let factor = 1u64.checked_shl(attempt.min(63)).unwrap_or(u64::MAX);
        policy
            .base_delay_ms
            .saturating_mul(factor)
            .min(policy.max_delay_ms)
    } else {
        policy.base_delay_ms
    };
    Duration::from_millis(millis)
}

/// Whether `error` is worth retrying under `policy`.
///
/// No allow-list means everything retries; otherwise the error must contain
/// one of the listed substrings.
fn is_retryable(policy: &RetryPolicy, error: &str) -> bool {
    match &policy.retryable_errors {
        None => true,
        Some(patterns) => patterns.iter().any(|p| error.contains(p)),
    }
}

/// Run `action` under `policy`, sleeping between failed attempts.
///
/// `None` policy means a single attempt. On exhaustion the returned failure
/// reports the total attempt count and the last error.
pub async fn execute_with_retry<F, Fut>(policy: Option<&RetryPolicy>, mut action: F) -> ActionResult
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ActionResult>,
{
    let Some(policy) = policy else {
        return action().await;
    };

    let total_attempts = policy.max_retries.saturating_add(1);
    let mut last_error = String::new();

    for attempt in 0..total_attempts {
        let result = action().await;
        if result.success {
            return result;
        }

        last_error = result
            .error
            .unwrap_or_else(|| "action failed without error detail".to_string());

        if !is_retryable(policy, &last_error) {
            tracing::debug!(attempt, error = %last_error, "error not retryable, giving up");
            return ActionResult::failed(last_error);
        }

        // No sleep after the final attempt.
        if attempt + 1 < total_attempts {
            let delay = backoff_delay(policy, attempt);
            tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, "retrying after backoff");
            tokio::time::sleep(delay).await;
        }
    }

    ActionResult::failed(format!(
        "action failed after {total_attempts} attempts: {last_error}"
    ))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

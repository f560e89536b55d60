//! Retry backoff computation.
//!
//! Pure function, no I/O: given the attempt number that just failed and a
//! policy, returns the delay in milliseconds before the task becomes
//! eligible again. Kept free of the engine's state machine so it can be
//! unit tested in isolation.

use task_engine_db::models::BackoffPolicy;

/// Compute the backoff delay in milliseconds for the given 1-based attempt
/// number under `policy`.
///
/// `Fixed` always returns `base_ms`. `Exponential` returns
/// `min(cap_ms, base_ms * factor^(attempt - 1))`, optionally perturbed by
/// full jitter in `[0, delay]` when `jitter` is set. The result is always
/// clamped to `[0, cap_ms]` (or `[0, base_ms]` for `Fixed`, where there is
/// no cap to clamp against).
pub fn compute_backoff(attempt: u32, policy: &BackoffPolicy) -> i64 {
    match policy {
        BackoffPolicy::Fixed { base_ms } => (*base_ms).max(0),
        BackoffPolicy::Exponential {
            base_ms,
            factor,
            cap_ms,
            jitter,
        } => {
            let base_ms = (*base_ms).max(0) as f64;
            let cap_ms = (*cap_ms).max(0) as f64;
            let exponent = attempt.saturating_sub(1) as i32;
            let raw = base_ms * factor.max(0.0).powi(exponent);
            let delay = raw.min(cap_ms).max(0.0);

            let delay = if *jitter {
                rand::random::<f64>() * delay
            } else {
                delay
            };

            delay.min(cap_ms).max(0.0).round() as i64
        }
    }
}

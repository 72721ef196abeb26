//! C7 (retry half) — exponential backoff with jitter around sink batch
//! writes, and the Transient-to-Terminal escalation policy (§4.7, §7, §9).

use std::time::Duration;

use rand::Rng;
use tokio::sync::watch;

use crate::config::RetryConfig;
use crate::error::{CdcError, ErrorClass};

/// Computes the backoff delay for attempt `n` (1-based), per §4.7:
/// `delay = min(maxDelay, baseDelay * multiplier^(n-1)) * (1 + U[0, jitterFrac])`.
pub fn backoff_delay(cfg: &RetryConfig, attempt: u32) -> Duration {
    let exp = cfg.multiplier.powi((attempt.saturating_sub(1)) as i32);
    let raw = cfg.base_delay.as_secs_f64() * exp;
    let capped = raw.min(cfg.max_delay.as_secs_f64());
    let jitter = rand::rng().random_range(0.0..=cfg.jitter_frac);
    Duration::from_secs_f64(capped * (1.0 + jitter))
}

/// Outcome of running a fallible batch write through the retry loop.
pub enum RetryOutcome<T> {
    Committed(T),
    /// Exhausted retries, or the error was already `Terminal`. The caller
    /// must route the batch to the DLQ (§4.7). Carries the number of
    /// attempts actually made, for the DLQ record's `retryCount`.
    GiveUp(CdcError, u32),
}

/// Classifies an error for retry purposes. Unknown/transient errors retry
/// up to `maxAttempts`, then convert to `Terminal` (§7, §9): "default
/// conservatively... never silently dropped."
fn should_retry(err: &CdcError, attempt: u32, cfg: &RetryConfig) -> bool {
    matches!(err.class(), ErrorClass::Transient) && attempt < cfg.max_attempts
}

/// Runs `op` (one full batch write, including the idempotent upsert --
/// retries re-execute the entire protocol, never a partial replay) with
/// backoff between attempts, honoring cancellation before each attempt and
/// during each backoff sleep (spec.md:167): `cancel` is raced against the
/// sleep itself rather than polled only at its edges, so a shutdown signal
/// cuts a long backoff short instead of waiting it out.
pub async fn run_with_retry<F, Fut, T>(cfg: &RetryConfig, cancel: &mut watch::Receiver<bool>, mut op: F) -> RetryOutcome<T>
where
    F: FnMut(u32) -> Fut,
    Fut: std::future::Future<Output = Result<T, CdcError>>,
{
    let mut attempt = 1;
    loop {
        if *cancel.borrow() {
            return RetryOutcome::GiveUp(CdcError::Terminal("cancelled before attempt".to_string()), attempt);
        }
        match op(attempt).await {
            Ok(v) => return RetryOutcome::Committed(v),
            Err(e) => {
                if should_retry(&e, attempt, cfg) {
                    let delay = backoff_delay(cfg, attempt);
                    let cancelled = tokio::select! {
                        _ = tokio::time::sleep(delay) => false,
                        _ = cancel.changed() => *cancel.borrow(),
                    };
                    if cancelled {
                        return RetryOutcome::GiveUp(CdcError::Terminal("cancelled during backoff".to_string()), attempt);
                    }
                    attempt += 1;
                    continue;
                }
                // Either already Terminal, or Transient that exhausted the
                // cap -- escalate to Terminal either way (§7).
                let escalated = match e.class() {
                    ErrorClass::Transient => CdcError::Terminal(format!("retries exhausted after {attempt} attempts: {e}")),
                    ErrorClass::Terminal => e,
                };
                return RetryOutcome::GiveUp(escalated, attempt);
            }
        }
    }
}

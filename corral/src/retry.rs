//! Bounded retry with exponential backoff for transient errors.
//!
//! The core never retries internally; this thin wrapper is for callers (the
//! CLI, adapters) that want resilience against lock contention. Only errors
//! classified retryable by
//! [`CoordError::is_retryable`](crate::error::CoordError::is_retryable) are
//! retried; guard failures and other logic errors surface immediately.

use std::time::Duration;

use rand::Rng;
use tracing::debug;

use crate::error::CoordResult;
use crate::io::config::RetryConfig;

/// Run `op` up to `cfg.max_attempts` times, sleeping with jittered
/// exponential backoff between attempts.
pub fn with_backoff<T>(
    cfg: &RetryConfig,
    mut op: impl FnMut() -> CoordResult<T>,
) -> CoordResult<T> {
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match op() {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < cfg.max_attempts => {
                let delay = backoff_delay(cfg, attempt);
                debug!(attempt, delay_ms = delay.as_millis() as u64, %err, "retrying after transient error");
                std::thread::sleep(delay);
            }
            Err(err) => return Err(err),
        }
    }
}

/// Exponential delay for the given attempt with up to +50% jitter, capped at
/// `max_delay_ms`. Jitter keeps competing processes from synchronizing their
/// retry cadence.
fn backoff_delay(cfg: &RetryConfig, attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    let base = cfg
        .base_delay_ms
        .saturating_mul(1u64 << exp)
        .min(cfg.max_delay_ms);
    let jitter = rand::thread_rng().gen_range(0..=base / 2 + 1);
    Duration::from_millis(base.saturating_add(jitter).min(cfg.max_delay_ms))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    use crate::error::CoordError;

    fn fast_cfg(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            base_delay_ms: 1,
            max_delay_ms: 4,
        }
    }

    fn lock_timeout() -> CoordError {
        CoordError::LockTimeout {
            path: PathBuf::from("x.lock"),
            waited_ms: 1,
        }
    }

    #[test]
    fn retries_transient_errors_until_success() {
        let mut calls = 0;
        let result = with_backoff(&fast_cfg(5), || {
            calls += 1;
            if calls < 3 {
                Err(lock_timeout())
            } else {
                Ok(calls)
            }
        })
        .expect("eventual success");
        assert_eq!(result, 3);
    }

    #[test]
    fn gives_up_after_bounded_attempts() {
        let mut calls = 0;
        let err = with_backoff(&fast_cfg(3), || -> CoordResult<()> {
            calls += 1;
            Err(lock_timeout())
        })
        .expect_err("exhausted");
        assert_eq!(calls, 3);
        assert!(matches!(err, CoordError::LockTimeout { .. }));
    }

    #[test]
    fn non_retryable_errors_surface_immediately() {
        let mut calls = 0;
        let err = with_backoff(&fast_cfg(5), || -> CoordResult<()> {
            calls += 1;
            Err(CoordError::ClaimConflict {
                task: "t1".to_string(),
                owner: "s1".to_string(),
            })
        })
        .expect_err("logic error");
        assert_eq!(calls, 1);
        assert!(matches!(err, CoordError::ClaimConflict { .. }));
    }
}
